//! The Gameboy joypad is a pretty simple affair. It has 8 buttons. The interesting thing to note is how the key state
//! is accessed. You would think, given that there's 8 buttons and 8 bits in a byte, that the up/down state of each
//! button would simply be a bit in a register. You would be wrong. The buttons are divided into two groups of 4, and
//! the upper bits of P1 select which group shows up in the lower nibble.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Default, Deserialize, Serialize)]
pub struct Joypad {
    select_btn: bool, // P1 bit 5 (active low)
    select_dir: bool, // P1 bit 4 (active low)

    pub state: JoypadState,
}

/// There's only 8 buttons on the joypad, so we can encode the state of all of them in a single u8.
/// The Gameboy treats a set bit as unpressed, and a cleared bit as pressed, so we store it like that too.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct JoypadState(u8);

#[derive(Clone, Copy, Debug, PartialEq)]
#[rustfmt::skip]
pub enum Button {
    A       = 0b0000_0001,
    B       = 0b0000_0010,
    Select  = 0b0000_0100,
    Start   = 0b0000_1000,
    Right   = 0b0001_0000,
    Left    = 0b0010_0000,
    Up      = 0b0100_0000,
    Down    = 0b1000_0000,
}

impl Button {
    /// All buttons, in key-input bit order.
    pub const ALL: [Button; 8] = [
        Button::A,
        Button::B,
        Button::Select,
        Button::Start,
        Button::Right,
        Button::Left,
        Button::Up,
        Button::Down,
    ];

    fn is_direction(self) -> bool {
        (self as u8) >= Button::Right as u8
    }
}

impl Joypad {
    /// Read from the 0xFF00 P1 register. If both groups are selected, their lines are ANDed together.
    pub fn reg_p1_read(&self) -> u8 {
        let mut lines = 0x0F;
        if self.select_btn {
            lines &= self.state.btn();
        }
        if self.select_dir {
            lines &= self.state.dir();
        }

        0xC0 | (if self.select_btn { 0 } else { 0x20 }) | (if self.select_dir { 0 } else { 0x10 }) | lines
    }

    /// Write to the 0xFF00 P1 register
    pub fn reg_p1_write(&mut self, v: u8) {
        self.select_btn = v & 0x20 == 0;
        self.select_dir = v & 0x10 == 0;
    }

    /// Updates a button's state. Returns true if this is a new press on a currently selected group, which is when the
    /// joypad interrupt fires.
    pub fn set_button(&mut self, button: Button, pressed: bool) -> bool {
        let was_pressed = self.state.is_pressed(button);
        self.state.set_button(button, pressed);

        let selected = if button.is_direction() {
            self.select_dir
        } else {
            self.select_btn
        };
        pressed && !was_pressed && selected
    }
}

impl Default for JoypadState {
    fn default() -> JoypadState {
        // By default all buttons are unpressed, which means all bits are set.
        JoypadState(0xFF)
    }
}

impl JoypadState {
    pub fn set_button(&mut self, key: Button, pressed: bool) {
        if pressed {
            self.0 &= !(key as u8);
        } else {
            self.0 |= key as u8;
        }
    }

    pub fn is_pressed(self, key: Button) -> bool {
        self.0 & key as u8 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0xFF;
    }

    fn dir(self) -> u8 {
        self.0 >> 4
    }

    fn btn(self) -> u8 {
        self.0 & 0b1111
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test that the selected group shows up in P1, active low.
    #[test]
    fn test_group_select() {
        let mut joypad = Joypad::default();
        joypad.set_button(Button::Start, true);
        joypad.set_button(Button::Left, true);

        joypad.reg_p1_write(0x30);
        assert_eq!(joypad.reg_p1_read(), 0xFF);

        joypad.reg_p1_write(0x10);
        assert_eq!(joypad.reg_p1_read(), 0xD7);

        joypad.reg_p1_write(0x20);
        assert_eq!(joypad.reg_p1_read(), 0xED);

        joypad.reg_p1_write(0x00);
        assert_eq!(joypad.reg_p1_read(), 0xC5);
    }

    // Test that only a fresh press on a selected group asks for an interrupt.
    #[test]
    fn test_press_interrupt() {
        let mut joypad = Joypad::default();
        joypad.reg_p1_write(0x10); // Buttons selected.
        assert!(!joypad.set_button(Button::Up, true));
        assert!(joypad.set_button(Button::A, true));
        assert!(!joypad.set_button(Button::A, true));
        assert!(!joypad.set_button(Button::A, false));

        // Pressing twice in a row (e.g the same key bound twice) doesn't toggle it back off.
        joypad.set_button(Button::B, true);
        joypad.set_button(Button::B, true);
        assert!(joypad.state.is_pressed(Button::B));
    }
}
