//! Implementation of the timer unit.
//!
//! Internally there's a 16-bit counter that runs at the CPU clock (so it speeds up with the CGB double speed mode).
//! DIV is the top 8 bits of it. TIMA increments on the falling edge of one of its bits, which bit depends on the TAC
//! frequency select. We don't tick the counter each cycle, it's derived from the master clock whenever someone looks
//! at it, and the next TIMA increment is booked with the scheduler.

use crate::interrupt::{Interrupt, InterruptController};
use crate::scheduler::{EventKind, Scheduler};
use serde::{Deserialize, Serialize};

#[derive(Clone, Deserialize, Serialize)]
pub struct Timer {
    enabled: bool,     // 0xFF07 TAC bit 2
    period: u64,       // TIMA period in CPU clocks, selected by TAC bits 0-1.
    pub tima: u8,      // 0xFF05 TIMA register
    pub tma: u8,       // 0xFF06 TMA register
    counter: u16,      // Internal divider. DIV (0xFF04) is the upper 8 bits.
    last_sync: u64,    // Master clock time `counter` was last brought up to date.
    double_speed: bool,
}

impl Default for Timer {
    fn default() -> Timer {
        Timer {
            enabled: false,
            period: 1024,
            tima: 0,
            tma: 0,
            counter: 0,
            last_sync: 0,
            double_speed: false,
        }
    }
}

fn tac_period(v: u8) -> u64 {
    match v & 0b11 {
        0b00 => 1024,
        0b01 => 16,
        0b10 => 64,
        _ => 256,
    }
}

impl Timer {
    pub fn new() -> Timer {
        Default::default()
    }

    /// Brings the internal counter up to the given master clock time.
    fn sync(&mut self, now: u64) {
        if now <= self.last_sync {
            return;
        }
        let elapsed = now - self.last_sync;
        let clocks = if self.double_speed { elapsed * 2 } else { elapsed };
        self.counter = self.counter.wrapping_add(clocks as u16);
        self.last_sync = now;
    }

    /// The internal counter as of the given master clock time.
    pub fn counter(&mut self, now: u64) -> u16 {
        self.sync(now);
        self.counter
    }

    /// Sets the internal counter, for the boot ROM hand-off.
    pub fn set_counter(&mut self, sched: &mut Scheduler, v: u16) {
        self.sync(sched.cycle());
        self.counter = v;
        self.reschedule(sched, 0);
    }

    /// The bit TIMA watches for a falling edge.
    fn signal(&self) -> bool {
        self.enabled && u64::from(self.counter) & (self.period / 2) != 0
    }

    /// Books the next TIMA increment with the scheduler, or cancels it if the timer is stopped. `late` is how far
    /// behind the master clock the counter was synced.
    fn reschedule(&mut self, sched: &mut Scheduler, late: u64) {
        sched.cancel(EventKind::TimerTick);
        if !self.enabled {
            return;
        }

        let clocks = self.period - (u64::from(self.counter) % self.period);
        let dots = if self.double_speed { (clocks + 1) / 2 } else { clocks };
        sched.schedule_late(EventKind::TimerTick, dots, late);
    }

    /// Increments TIMA. On overflow TIMA reads as 0 for one machine cycle before TMA gets loaded into it.
    fn increment(&mut self, sched: &mut Scheduler, late: u64) {
        self.tima = self.tima.wrapping_add(1);
        if self.tima == 0 {
            sched.cancel(EventKind::TimerReload);
            sched.schedule_late(EventKind::TimerReload, self.mcycle(), late);
        }
    }

    fn mcycle(&self) -> u64 {
        if self.double_speed {
            2
        } else {
            4
        }
    }

    /// TimerTick handler.
    pub fn on_tick(&mut self, sched: &mut Scheduler, late: u64) {
        self.sync(sched.now() - late);
        self.increment(sched, late);
        self.reschedule(sched, late);
    }

    /// TimerReload handler. This is where the interrupt actually gets requested.
    pub fn on_reload(&mut self, interrupts: &mut InterruptController) {
        self.tima = self.tma;
        interrupts.request(Interrupt::Timer);
    }

    /// Switches between normal and double speed. DIV is reset as part of the switch.
    pub fn set_double_speed(&mut self, sched: &mut Scheduler, on: bool) {
        self.sync(sched.cycle());
        self.double_speed = on;
        self.counter = 0;
        self.reschedule(sched, 0);
    }

    /// Read from the 0xFF04 DIV register.
    pub fn reg_div_read(&mut self, now: u64) -> u8 {
        (self.counter(now) >> 8) as u8
    }

    /// Write to the 0xFF04 DIV register. Any write resets the whole internal counter. If the bit TIMA was watching
    /// was high, that's a falling edge and TIMA increments.
    pub fn reg_div_write(&mut self, sched: &mut Scheduler) {
        self.sync(sched.cycle());
        let was_high = self.signal();
        self.counter = 0;
        if was_high {
            self.increment(sched, 0);
        }
        self.reschedule(sched, 0);
    }

    /// Write to the 0xFF05 TIMA register. Writing during the cycle between overflow and reload cancels the reload
    /// (and its interrupt).
    pub fn reg_tima_write(&mut self, sched: &mut Scheduler, v: u8) {
        sched.cancel(EventKind::TimerReload);
        self.tima = v;
    }

    /// Write to the 0xFF06 TMA register.
    pub fn reg_tma_write(&mut self, v: u8) {
        self.tma = v;
    }

    /// Read from the 0xFF07 TAC register.
    pub fn reg_tac_read(&self) -> u8 {
        0b1111_1000 // Unused bits.
            | (if self.enabled { 0b100 } else { 0 })
            | match self.period {
                16 => 1,
                64 => 2,
                256 => 3,
                _ => 0,
            }
    }

    /// Write to the 0xFF07 TAC register. Disabling the timer or changing the frequency can produce a falling edge on
    /// the watched signal, which glitches TIMA forward by one.
    pub fn reg_tac_write(&mut self, sched: &mut Scheduler, v: u8) {
        self.sync(sched.cycle());
        let was_high = self.signal();

        self.enabled = v & 0b100 != 0;
        self.period = tac_period(v);

        if was_high && !self.signal() {
            self.increment(sched, 0);
        }
        self.reschedule(sched, 0);
    }
}
