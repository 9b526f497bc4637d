//! Implements the serial (link cable) port. There's never anything on the other end of the cable, so an internally
//! clocked transfer shifts out SB and shifts in 0xFF. The bytes that were sent are kept so a frontend (or test) can
//! watch what the game is printing.
//! http://gbdev.gg8.se/wiki/articles/Serial_Data_Transfer_(Link_Cable)

use crate::interrupt::{Interrupt, InterruptController};
use crate::scheduler::{EventKind, Scheduler};
use serde::{Deserialize, Serialize};

#[derive(Clone, Default, Deserialize, Serialize)]
pub struct Serial {
    sb: u8,               // 0xFF01 SB register
    internal_clock: bool, // SC bit 0
    transfer_fast: bool,  // SC bit 1 (CGB only)
    transfer_start: bool, // SC bit 7

    #[serde(skip)]
    pub output: Vec<u8>, // Bytes shifted out, waiting to be collected.
}

impl Serial {
    pub fn new() -> Serial {
        Default::default()
    }

    pub fn reg_sb_read(&self) -> u8 {
        self.sb
    }

    pub fn reg_sb_write(&mut self, v: u8) {
        self.sb = v;
    }

    pub fn reg_sc_read(&self, cgb: bool) -> u8 {
        0b0111_1100 // Unused bits are set to 1
            | (if self.transfer_start { 0b1000_0000 } else { 0 })
            | (if self.transfer_fast || !cgb { 0b0000_0010 } else { 0 })
            | (if self.internal_clock { 0b0000_0001 } else { 0 })
    }

    /// Write to the 0xFF02 SC register. Starting a transfer on the internal clock books its completion: 8 bits at
    /// 8192Hz (or 262144Hz in CGB fast mode).
    pub fn reg_sc_write(&mut self, sched: &mut Scheduler, v: u8, cgb: bool, double_speed: bool) {
        self.transfer_start = v & 0b1000_0000 != 0;
        self.transfer_fast = cgb && v & 0b0000_0010 != 0;
        self.internal_clock = v & 0b0000_0001 != 0;

        sched.cancel(EventKind::SerialTransfer);
        if self.transfer_start && self.internal_clock {
            let mut dots = if self.transfer_fast { 128 } else { 4096 };
            if double_speed {
                dots /= 2;
            }
            sched.schedule(EventKind::SerialTransfer, dots);
        }
    }

    /// SerialTransfer handler.
    pub fn on_transfer_complete(&mut self, interrupts: &mut InterruptController) {
        log::trace!("serial out: {:02x}", self.sb);
        self.output.push(self.sb);
        self.sb = 0xFF;
        self.transfer_start = false;
        interrupts.request(Interrupt::Serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test a full internally clocked transfer: timing, SB/SC afterwards, interrupt, and captured output.
    #[test]
    fn test_internal_transfer() {
        let mut serial = Serial::new();
        let mut sched = Scheduler::new();
        let mut interrupts = InterruptController::new();

        serial.reg_sb_write(b'A');
        serial.reg_sc_write(&mut sched, 0x81, false, false);
        assert_eq!(serial.reg_sc_read(false), 0xFF);
        assert_eq!(sched.due_in(EventKind::SerialTransfer), Some(4096));

        sched.advance(4096);
        sched.commit();
        assert_eq!(sched.pop_due(), Some((EventKind::SerialTransfer, 0)));
        serial.on_transfer_complete(&mut interrupts);

        assert_eq!(serial.reg_sb_read(), 0xFF);
        assert_eq!(serial.reg_sc_read(false), 0x7F);
        assert_eq!(interrupts.request, Interrupt::Serial as u8);
        assert_eq!(serial.output, b"A");
    }

    // Test that an externally clocked transfer just sits there waiting.
    #[test]
    fn test_external_clock_never_completes() {
        let mut serial = Serial::new();
        let mut sched = Scheduler::new();
        serial.reg_sc_write(&mut sched, 0x80, false, false);
        assert!(!sched.is_pending(EventKind::SerialTransfer));
    }

    #[test]
    fn test_fast_mode() {
        let mut serial = Serial::new();
        let mut sched = Scheduler::new();
        serial.reg_sc_write(&mut sched, 0x83, true, true);
        assert_eq!(sched.due_in(EventKind::SerialTransfer), Some(64));
        assert_eq!(serial.reg_sc_read(true), 0xFF);
    }
}
