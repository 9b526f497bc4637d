//! Audio Processing Unit.
//!
//! Four channels: two square waves (the first with a frequency sweep), a programmable wave channel and a noise
//! channel. A frame sequencer running at 512Hz clocks the length counters, the sweep unit and the volume envelopes.
//!
//! The channels aren't ticked every dot. The APU remembers the last master clock time it was brought up to date, and
//! catches up in one go whenever something observes it: a register access, a frame sequencer step, or a sample being
//! mixed. Channel timers are plain countdowns, so catching up is mostly arithmetic.

use crate::scheduler::{EventKind, Scheduler};
use serde::{Deserialize, Serialize};

/// The frame sequencer steps at 512Hz.
const FRAME_SEQUENCER_DOTS: u64 = 8192;

/// One stereo sample is mixed every 128 dots, which works out to 32768Hz.
pub const SAMPLE_DOTS: u64 = 128;
pub const SAMPLE_RATE: u32 = 32768;

/// Upper bound on buffered sample values (interleaved L/R) if the host never drains them.
const MAX_BUFFERED_SAMPLES: usize = 1 << 16;

/// The wave channel starts playing slightly after it's triggered.
const WAVE_TRIGGER_DELAY: u32 = 6;

#[rustfmt::skip]
const DUTY_TABLE: [[bool; 8]; 4] = [
    [false, false, false, false, false, false, false, true ], // 12.5%
    [true,  false, false, false, false, false, false, true ], // 25%
    [true,  false, false, false, false, true,  true,  true ], // 50%
    [false, true,  true,  true,  true,  true,  true,  false], // 75%
];

/// Noise channel timer periods in dots, indexed by NR43 bits 0-2. Shifted left by the NR43 clock shift.
const NOISE_DIVISORS: [u32; 8] = [8, 16, 32, 48, 64, 80, 96, 112];

/// Counts `timer` down by `dots`, reloading it from `period` each time it expires. Returns the number of expiries.
fn countdown(timer: &mut u32, period: u32, dots: u64) -> u64 {
    let timer_dots = u64::from(*timer);
    if dots < timer_dots {
        *timer -= dots as u32;
        return 0;
    }
    let period = u64::from(period.max(1));
    let over = dots - timer_dots;
    *timer = (period - over % period) as u32;
    1 + over / period
}

#[derive(Clone, Copy, Default, Deserialize, Serialize)]
struct Envelope {
    initial: u8, // NRx2 bits 4-7
    inc: bool,   // NRx2 bit 3
    period: u8,  // NRx2 bits 0-2
    volume: u8,
    timer: u8,
}

impl Envelope {
    fn unpack(&mut self, v: u8) {
        self.initial = v >> 4;
        self.inc = v & 0b1000 != 0;
        self.period = v & 0b111;
    }

    fn pack(&self) -> u8 {
        (self.initial << 4) | (u8::from(self.inc) << 3) | self.period
    }

    /// The channel DAC is powered whenever the envelope isn't configured for silence.
    fn dac_enabled(&self) -> bool {
        self.initial != 0 || self.inc
    }

    fn trigger(&mut self) {
        self.volume = self.initial;
        self.timer = if self.period == 0 { 8 } else { self.period };
    }

    fn clock(&mut self) {
        if self.period == 0 {
            return;
        }
        self.timer = self.timer.saturating_sub(1);
        if self.timer == 0 {
            self.timer = self.period;
            if self.inc && self.volume < 15 {
                self.volume += 1;
            } else if !self.inc && self.volume > 0 {
                self.volume -= 1;
            }
        }
    }
}

#[derive(Clone, Default, Deserialize, Serialize)]
struct Square {
    enabled: bool,
    length: u16,
    length_enabled: bool,
    duty: u8,
    duty_pos: u8,
    period: u16, // 11-bit frequency register, NRx3 + NRx4 bits 0-2.
    timer: u32,
    envelope: Envelope,
}

impl Square {
    fn step_dots(&self) -> u32 {
        4 * (2048 - u32::from(self.period))
    }

    fn advance(&mut self, dots: u64) {
        let period = self.step_dots();
        let steps = countdown(&mut self.timer, period, dots);
        self.duty_pos = ((u64::from(self.duty_pos) + steps) & 7) as u8;
    }

    fn output(&self) -> u8 {
        if self.enabled && DUTY_TABLE[self.duty as usize][self.duty_pos as usize] {
            self.envelope.volume
        } else {
            0
        }
    }

    fn write_length(&mut self, v: u8) {
        self.length = 64 - u16::from(v & 0x3F);
    }

    fn write_envelope(&mut self, v: u8) {
        self.envelope.unpack(v);
        if !self.envelope.dac_enabled() {
            self.enabled = false;
        }
    }

    fn trigger(&mut self) {
        self.enabled = self.envelope.dac_enabled();
        self.timer = self.step_dots();
        self.envelope.trigger();
        if self.length == 0 {
            self.length = 64;
        }
    }

    fn clock_length(&mut self) {
        if self.length_enabled && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }
}

/// Channel 1's frequency sweep. It works on a shadow copy of the channel frequency, and is handed the channel it
/// drives whenever it needs to touch it.
#[derive(Clone, Default, Deserialize, Serialize)]
struct Sweep {
    period: u8, // NR10 bits 4-6
    negate: bool,
    shift: u8,
    enabled: bool,
    shadow: u16,
    timer: u8,
    negate_used: bool, // A calculation in negate mode happened since the last trigger.
}

impl Sweep {
    fn unpack(&mut self, v: u8) {
        self.period = (v >> 4) & 0b111;
        self.negate = v & 0b1000 != 0;
        self.shift = v & 0b111;
    }

    fn pack(&self) -> u8 {
        0x80 | (self.period << 4) | (u8::from(self.negate) << 3) | self.shift
    }

    fn reload_timer(&mut self) {
        self.timer = if self.period == 0 { 8 } else { self.period };
    }

    /// Computes the next frequency, disabling the channel if it overflows 11 bits.
    fn calculate(&mut self, ch: &mut Square) -> u16 {
        let delta = self.shadow >> self.shift;
        let freq = if self.negate {
            self.negate_used = true;
            self.shadow.wrapping_sub(delta)
        } else {
            self.shadow + delta
        };
        if freq > 2047 {
            ch.enabled = false;
        }
        freq
    }

    fn trigger(&mut self, ch: &mut Square) {
        self.shadow = ch.period;
        self.reload_timer();
        self.enabled = self.period != 0 || self.shift != 0;
        self.negate_used = false;
        if self.shift != 0 {
            self.calculate(ch);
        }
    }

    fn clock(&mut self, ch: &mut Square) {
        self.timer = self.timer.saturating_sub(1);
        if self.timer > 0 {
            return;
        }
        self.reload_timer();
        if !self.enabled || self.period == 0 {
            return;
        }

        let freq = self.calculate(ch);
        if freq <= 2047 && self.shift != 0 {
            self.shadow = freq;
            ch.period = freq;
            // The new frequency is immediately checked again.
            self.calculate(ch);
        }
    }
}

#[derive(Clone, Default, Deserialize, Serialize)]
struct Wave {
    enabled: bool,
    dac: bool, // NR30 bit 7
    length: u16,
    length_enabled: bool,
    volume: u8, // NR32 bits 5-6
    period: u16,
    timer: u32,
    position: u8, // 0-31, index of the nibble being played.
    sample: u8,
    ram: [u8; 16],
}

impl Wave {
    fn step_dots(&self) -> u32 {
        2 * (2048 - u32::from(self.period))
    }

    fn advance(&mut self, dots: u64) {
        let period = self.step_dots();
        let steps = countdown(&mut self.timer, period, dots);
        if steps == 0 {
            return;
        }
        self.position = ((u64::from(self.position) + steps) & 31) as u8;
        let byte = self.ram[usize::from(self.position / 2)];
        self.sample = if self.position & 1 == 0 { byte >> 4 } else { byte & 0xF };
    }

    fn output(&self) -> u8 {
        if !self.enabled {
            return 0;
        }
        match self.volume {
            0 => 0,
            code => self.sample >> (code - 1),
        }
    }

    fn trigger(&mut self) {
        self.enabled = self.dac;
        self.timer = self.step_dots() + WAVE_TRIGGER_DELAY;
        self.position = 0;
        if self.length == 0 {
            self.length = 256;
        }
    }

    fn clock_length(&mut self) {
        if self.length_enabled && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }

    /// While the channel plays, wave RAM accesses land on whichever byte it's currently reading.
    fn ram_index(&self, addr: u16) -> usize {
        if self.enabled {
            usize::from(self.position / 2)
        } else {
            usize::from(addr & 0xF)
        }
    }
}

#[derive(Clone, Default, Deserialize, Serialize)]
struct Noise {
    enabled: bool,
    length: u16,
    length_enabled: bool,
    envelope: Envelope,
    shift: u8,    // NR43 bits 4-7
    width7: bool, // NR43 bit 3
    divisor: u8,  // NR43 bits 0-2
    lfsr: u16,
    timer: u32,
}

impl Noise {
    fn step_dots(&self) -> u32 {
        NOISE_DIVISORS[self.divisor as usize] << self.shift
    }

    fn advance(&mut self, dots: u64) {
        let period = self.step_dots();
        let steps = countdown(&mut self.timer, period, dots);
        // Clock shifts of 14 and 15 stop the LFSR.
        if self.shift >= 14 {
            return;
        }
        for _ in 0..steps {
            let bit = (self.lfsr ^ (self.lfsr >> 1)) & 1;
            self.lfsr = (self.lfsr >> 1) | (bit << 14);
            if self.width7 {
                self.lfsr = (self.lfsr & !0x40) | (bit << 6);
            }
        }
    }

    fn output(&self) -> u8 {
        if self.enabled && self.lfsr & 1 == 0 {
            self.envelope.volume
        } else {
            0
        }
    }

    fn trigger(&mut self) {
        self.enabled = self.envelope.dac_enabled();
        self.envelope.trigger();
        self.lfsr = 0x7FFF;
        self.timer = self.step_dots();
        if self.length == 0 {
            self.length = 64;
        }
    }

    fn clock_length(&mut self) {
        if self.length_enabled && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }
}

#[derive(Clone, Default, Deserialize, Serialize)]
pub struct Apu {
    enabled: bool, // NR52 bit 7
    ch1: Square,
    sweep: Sweep,
    ch2: Square,
    ch3: Wave,
    ch4: Noise,
    nr50: u8,
    nr51: u8,
    sequencer_step: u8,
    last_cycle: u64, // Master clock time the channels were last caught up to.

    #[serde(skip)]
    pub samples: Vec<i16>, // Interleaved L/R samples mixed since the host last drained them.
}

impl Apu {
    pub fn new() -> Apu {
        Default::default()
    }

    /// Books the frame sequencer and sample events. Called once after the scheduler is reset.
    pub fn start(&mut self, sched: &mut Scheduler) {
        self.last_cycle = sched.cycle();
        sched.schedule(EventKind::ApuFrameSequencer, FRAME_SEQUENCER_DOTS);
        sched.schedule(EventKind::ApuSample, SAMPLE_DOTS);
    }

    /// Runs the channels up to the given master clock time.
    pub fn catch_up(&mut self, now: u64) {
        if now <= self.last_cycle {
            return;
        }
        let dots = now - self.last_cycle;
        self.last_cycle = now;
        if !self.enabled {
            return;
        }

        if self.ch1.enabled {
            self.ch1.advance(dots);
        }
        if self.ch2.enabled {
            self.ch2.advance(dots);
        }
        if self.ch3.enabled {
            self.ch3.advance(dots);
        }
        if self.ch4.enabled {
            self.ch4.advance(dots);
        }
    }

    /// ApuFrameSequencer handler.
    pub fn on_frame_sequencer(&mut self, sched: &mut Scheduler, late: u64) {
        self.catch_up(sched.cycle().saturating_sub(late));
        sched.schedule_late(EventKind::ApuFrameSequencer, FRAME_SEQUENCER_DOTS, late);
        if !self.enabled {
            return;
        }

        let step = self.sequencer_step;
        if step % 2 == 0 {
            self.ch1.clock_length();
            self.ch2.clock_length();
            self.ch3.clock_length();
            self.ch4.clock_length();
        }
        if step == 2 || step == 6 {
            self.sweep.clock(&mut self.ch1);
        }
        if step == 7 {
            if self.ch1.enabled {
                self.ch1.envelope.clock();
            }
            if self.ch2.enabled {
                self.ch2.envelope.clock();
            }
            if self.ch4.enabled {
                self.ch4.envelope.clock();
            }
        }
        self.sequencer_step = (step + 1) & 7;
    }

    /// ApuSample handler. Mixes one stereo sample into the buffer.
    pub fn on_sample(&mut self, sched: &mut Scheduler, late: u64) {
        self.catch_up(sched.cycle().saturating_sub(late));
        sched.schedule_late(EventKind::ApuSample, SAMPLE_DOTS, late);

        let (left, right) = self.mix();
        if self.samples.len() < MAX_BUFFERED_SAMPLES {
            self.samples.push(left);
            self.samples.push(right);
        }
    }

    fn mix(&self) -> (i16, i16) {
        let mut left = 0;
        let mut right = 0;
        if self.enabled {
            let outputs = [
                self.ch1.output(),
                self.ch2.output(),
                self.ch3.output(),
                self.ch4.output(),
            ];
            for (i, out) in outputs.iter().enumerate() {
                if self.nr51 & (0x10 << i) != 0 {
                    left += i32::from(*out);
                }
                if self.nr51 & (0x01 << i) != 0 {
                    right += i32::from(*out);
                }
            }
        }

        let scale = |mix: i32, vol: u8| ((mix * 512 - 16384) * (i32::from(vol) + 1) / 8 / 2) as i16;
        (scale(left, (self.nr50 >> 4) & 0b111), scale(right, self.nr50 & 0b111))
    }

    /// Powers the APU up with the register state the boot ROM leaves behind.
    pub fn skip_bootrom(&mut self) {
        self.reg_nr52_write(0x80);
        self.reg_nr10_write(0x80);
        self.reg_nr11_write(0xBF);
        self.reg_nr12_write(0xF3);
        self.reg_nr13_write(0xFF);
        self.reg_nr14_write(0xBF);
        self.reg_nr21_write(0x3F);
        self.reg_nr22_write(0x00);
        self.reg_nr23_write(0xFF);
        self.reg_nr24_write(0xBF);
        self.reg_nr30_write(0x7F);
        self.reg_nr31_write(0xFF);
        self.reg_nr32_write(0x9F);
        self.reg_nr33_write(0xFF);
        self.reg_nr34_write(0xBF);
        self.reg_nr41_write(0xFF);
        self.reg_nr42_write(0x00);
        self.reg_nr43_write(0x00);
        self.reg_nr44_write(0xBF);
        self.reg_nr50_write(0x77);
        self.reg_nr51_write(0xF3);
        self.reg_nr52_write(0xF1);
    }

    pub fn reg_nr10_read(&self) -> u8 {
        self.sweep.pack()
    }

    pub fn reg_nr10_write(&mut self, v: u8) {
        if !self.enabled {
            return;
        }
        let was_negate = self.sweep.negate;
        self.sweep.unpack(v);
        // Leaving negate mode after a negated calculation silences the channel.
        if was_negate && !self.sweep.negate && self.sweep.negate_used {
            self.ch1.enabled = false;
        }
    }

    pub fn reg_nr11_read(&self) -> u8 {
        (self.ch1.duty << 6) | 0x3F
    }

    pub fn reg_nr11_write(&mut self, v: u8) {
        if self.enabled {
            self.ch1.duty = v >> 6;
        }
        self.ch1.write_length(v);
    }

    pub fn reg_nr12_read(&self) -> u8 {
        self.ch1.envelope.pack()
    }

    pub fn reg_nr12_write(&mut self, v: u8) {
        if self.enabled {
            self.ch1.write_envelope(v);
        }
    }

    pub fn reg_nr13_read(&self) -> u8 {
        0xFF
    }

    pub fn reg_nr13_write(&mut self, v: u8) {
        if self.enabled {
            self.ch1.period = (self.ch1.period & 0x700) | u16::from(v);
        }
    }

    pub fn reg_nr14_read(&self) -> u8 {
        0xBF | (u8::from(self.ch1.length_enabled) << 6)
    }

    pub fn reg_nr14_write(&mut self, v: u8) {
        if !self.enabled {
            return;
        }
        self.ch1.period = (self.ch1.period & 0xFF) | (u16::from(v & 0b111) << 8);
        self.ch1.length_enabled = v & 0x40 != 0;
        if v & 0x80 != 0 {
            self.ch1.trigger();
            self.sweep.trigger(&mut self.ch1);
        }
    }

    pub fn reg_nr21_read(&self) -> u8 {
        (self.ch2.duty << 6) | 0x3F
    }

    pub fn reg_nr21_write(&mut self, v: u8) {
        if self.enabled {
            self.ch2.duty = v >> 6;
        }
        self.ch2.write_length(v);
    }

    pub fn reg_nr22_read(&self) -> u8 {
        self.ch2.envelope.pack()
    }

    pub fn reg_nr22_write(&mut self, v: u8) {
        if self.enabled {
            self.ch2.write_envelope(v);
        }
    }

    pub fn reg_nr23_read(&self) -> u8 {
        0xFF
    }

    pub fn reg_nr23_write(&mut self, v: u8) {
        if self.enabled {
            self.ch2.period = (self.ch2.period & 0x700) | u16::from(v);
        }
    }

    pub fn reg_nr24_read(&self) -> u8 {
        0xBF | (u8::from(self.ch2.length_enabled) << 6)
    }

    pub fn reg_nr24_write(&mut self, v: u8) {
        if !self.enabled {
            return;
        }
        self.ch2.period = (self.ch2.period & 0xFF) | (u16::from(v & 0b111) << 8);
        self.ch2.length_enabled = v & 0x40 != 0;
        if v & 0x80 != 0 {
            self.ch2.trigger();
        }
    }

    pub fn reg_nr30_read(&self) -> u8 {
        0x7F | (u8::from(self.ch3.dac) << 7)
    }

    pub fn reg_nr30_write(&mut self, v: u8) {
        if !self.enabled {
            return;
        }
        self.ch3.dac = v & 0x80 != 0;
        if !self.ch3.dac {
            self.ch3.enabled = false;
        }
    }

    pub fn reg_nr31_read(&self) -> u8 {
        0xFF
    }

    pub fn reg_nr31_write(&mut self, v: u8) {
        self.ch3.length = 256 - u16::from(v);
    }

    pub fn reg_nr32_read(&self) -> u8 {
        0x9F | (self.ch3.volume << 5)
    }

    pub fn reg_nr32_write(&mut self, v: u8) {
        if self.enabled {
            self.ch3.volume = (v >> 5) & 0b11;
        }
    }

    pub fn reg_nr33_read(&self) -> u8 {
        0xFF
    }

    pub fn reg_nr33_write(&mut self, v: u8) {
        if self.enabled {
            self.ch3.period = (self.ch3.period & 0x700) | u16::from(v);
        }
    }

    pub fn reg_nr34_read(&self) -> u8 {
        0xBF | (u8::from(self.ch3.length_enabled) << 6)
    }

    pub fn reg_nr34_write(&mut self, v: u8) {
        if !self.enabled {
            return;
        }
        self.ch3.period = (self.ch3.period & 0xFF) | (u16::from(v & 0b111) << 8);
        self.ch3.length_enabled = v & 0x40 != 0;
        if v & 0x80 != 0 {
            self.ch3.trigger();
        }
    }

    pub fn reg_nr41_read(&self) -> u8 {
        0xFF
    }

    pub fn reg_nr41_write(&mut self, v: u8) {
        self.ch4.length = 64 - u16::from(v & 0x3F);
    }

    pub fn reg_nr42_read(&self) -> u8 {
        self.ch4.envelope.pack()
    }

    pub fn reg_nr42_write(&mut self, v: u8) {
        if !self.enabled {
            return;
        }
        self.ch4.envelope.unpack(v);
        if !self.ch4.envelope.dac_enabled() {
            self.ch4.enabled = false;
        }
    }

    pub fn reg_nr43_read(&self) -> u8 {
        (self.ch4.shift << 4) | (u8::from(self.ch4.width7) << 3) | self.ch4.divisor
    }

    pub fn reg_nr43_write(&mut self, v: u8) {
        if !self.enabled {
            return;
        }
        self.ch4.shift = v >> 4;
        self.ch4.width7 = v & 0b1000 != 0;
        self.ch4.divisor = v & 0b111;
    }

    pub fn reg_nr44_read(&self) -> u8 {
        0xBF | (u8::from(self.ch4.length_enabled) << 6)
    }

    pub fn reg_nr44_write(&mut self, v: u8) {
        if !self.enabled {
            return;
        }
        self.ch4.length_enabled = v & 0x40 != 0;
        if v & 0x80 != 0 {
            self.ch4.trigger();
        }
    }

    pub fn reg_nr50_read(&self) -> u8 {
        self.nr50
    }

    pub fn reg_nr50_write(&mut self, v: u8) {
        if self.enabled {
            self.nr50 = v;
        }
    }

    pub fn reg_nr51_read(&self) -> u8 {
        self.nr51
    }

    pub fn reg_nr51_write(&mut self, v: u8) {
        if self.enabled {
            self.nr51 = v;
        }
    }

    pub fn reg_nr52_read(&self) -> u8 {
        let mut v = 0x70;
        if self.enabled {
            v |= 0x80;
        }
        if self.ch1.enabled {
            v |= 0b0001;
        }
        if self.ch2.enabled {
            v |= 0b0010;
        }
        if self.ch3.enabled {
            v |= 0b0100;
        }
        if self.ch4.enabled {
            v |= 0b1000;
        }
        v
    }

    pub fn reg_nr52_write(&mut self, v: u8) {
        let enabled = v & 0x80 != 0;
        if self.enabled && !enabled {
            self.power_off();
        } else if !self.enabled && enabled {
            self.sequencer_step = 0;
            self.ch1.duty_pos = 0;
            self.ch2.duty_pos = 0;
            self.ch3.sample = 0;
            log::debug!("APU powered on");
        }
        self.enabled = enabled;
    }

    /// Powering off clears every register. Length counters and wave RAM survive.
    fn power_off(&mut self) {
        log::debug!("APU powered off");
        let lengths = (self.ch1.length, self.ch2.length, self.ch3.length, self.ch4.length);
        let ram = self.ch3.ram;

        self.ch1 = Default::default();
        self.ch2 = Default::default();
        self.ch3 = Default::default();
        self.ch4 = Default::default();
        self.sweep = Default::default();
        self.nr50 = 0;
        self.nr51 = 0;

        self.ch1.length = lengths.0;
        self.ch2.length = lengths.1;
        self.ch3.length = lengths.2;
        self.ch4.length = lengths.3;
        self.ch3.ram = ram;
    }

    pub fn wave_read(&self, addr: u16) -> u8 {
        self.ch3.ram[self.ch3.ram_index(addr)]
    }

    pub fn wave_write(&mut self, addr: u16, v: u8) {
        let idx = self.ch3.ram_index(addr);
        self.ch3.ram[idx] = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn powered() -> (Apu, Scheduler) {
        let mut apu = Apu::new();
        let mut sched = Scheduler::new();
        apu.start(&mut sched);
        apu.reg_nr52_write(0x80);
        (apu, sched)
    }

    fn run(apu: &mut Apu, sched: &mut Scheduler, dots: u64) {
        let end = sched.now() + dots;
        while sched.now() < end {
            let step = sched.until_next_event().max(1).min(end - sched.now());
            sched.advance(step);
            sched.commit();
            while let Some((kind, late)) = sched.pop_due() {
                match kind {
                    EventKind::ApuFrameSequencer => apu.on_frame_sequencer(sched, late),
                    EventKind::ApuSample => apu.on_sample(sched, late),
                    _ => unreachable!(),
                }
            }
        }
        apu.catch_up(sched.now());
    }

    // Test a 50% duty square at period 1024 plays the documented waveform, then goes quiet after 10 length clocks.
    #[test]
    fn test_square_duty_and_length() {
        let (mut apu, mut sched) = powered();
        apu.reg_nr21_write(0x80 | (64 - 10));
        apu.reg_nr22_write(0xF0);
        apu.reg_nr23_write(0x00);
        apu.reg_nr24_write(0xC4);
        assert_eq!(apu.ch2.step_dots(), 4096);

        let mut wave = vec![];
        for k in 0..8 {
            apu.catch_up(k * 4096 + 1);
            wave.push(apu.ch2.output());
        }
        assert_eq!(wave, vec![15, 0, 0, 0, 0, 15, 15, 15]);

        // The 10th length clock lands on the 19th frame sequencer step.
        run(&mut apu, &mut sched, FRAME_SEQUENCER_DOTS * 19 - 1);
        assert_eq!(apu.reg_nr52_read() & 0b10, 0b10);
        run(&mut apu, &mut sched, 1);
        assert_eq!(apu.reg_nr52_read() & 0b10, 0);
    }

    // Test that a sweep result which only overflows after the first sweep step disables channel 1 on that tick.
    #[test]
    fn test_sweep_overflow_on_tick() {
        let (mut apu, mut sched) = powered();
        apu.reg_nr10_write(0x11); // Period 1, shift 1, add.
        apu.reg_nr12_write(0xF0);
        apu.reg_nr13_write(0x00);
        apu.reg_nr14_write(0x85); // Frequency 0x500.
        assert!(apu.ch1.enabled, "0x500 + 0x280 fits, trigger check passes");

        // Sweep ticks on step 2, the third frame sequencer event.
        run(&mut apu, &mut sched, FRAME_SEQUENCER_DOTS * 3 - 1);
        assert!(apu.ch1.enabled);
        run(&mut apu, &mut sched, 1);
        assert_eq!(apu.ch1.period, 0x780);
        assert!(!apu.ch1.enabled);
    }

    #[test]
    fn test_sweep_overflow_on_trigger() {
        let (mut apu, _) = powered();
        apu.reg_nr10_write(0x11);
        apu.reg_nr12_write(0xF0);
        apu.reg_nr13_write(0x00);
        apu.reg_nr14_write(0x87);
        assert!(!apu.ch1.enabled);
    }

    #[test]
    fn test_sweep_negate_quirk() {
        let (mut apu, _) = powered();
        apu.reg_nr10_write(0x19); // Negate.
        apu.reg_nr12_write(0xF0);
        apu.reg_nr14_write(0x84);
        assert!(apu.ch1.enabled);
        apu.reg_nr10_write(0x11);
        assert!(!apu.ch1.enabled);
    }

    #[test]
    fn test_envelope() {
        let (mut apu, mut sched) = powered();
        apu.reg_nr42_write(0x21); // Volume 2, decreasing, period 1.
        apu.reg_nr44_write(0x80);
        assert_eq!(apu.ch4.envelope.volume, 2);
        run(&mut apu, &mut sched, FRAME_SEQUENCER_DOTS * 8);
        assert_eq!(apu.ch4.envelope.volume, 1);
        run(&mut apu, &mut sched, FRAME_SEQUENCER_DOTS * 16);
        assert_eq!(apu.ch4.envelope.volume, 0);
        // Still enabled, a silent envelope doesn't switch the channel off.
        assert!(apu.ch4.enabled);
    }

    #[test]
    fn test_noise_lfsr() {
        let (mut apu, _) = powered();
        apu.reg_nr42_write(0xF0);
        apu.reg_nr43_write(0x00);
        apu.reg_nr44_write(0x80);
        assert_eq!(apu.ch4.lfsr, 0x7FFF);
        apu.catch_up(8);
        assert_eq!(apu.ch4.lfsr, 0x3FFF);

        apu.reg_nr43_write(0x08);
        apu.catch_up(16);
        assert_eq!(apu.ch4.lfsr, 0x1FBF);
        apu.ch4.lfsr = 0x0001;
        apu.catch_up(24);
        assert_eq!(apu.ch4.lfsr, 0x4040);
    }

    // Test the wave channel reads nibbles high first, starting with the second sample after a trigger.
    #[test]
    fn test_wave_playback() {
        let (mut apu, _) = powered();
        for i in 0..16 {
            apu.wave_write(i, (i as u8) << 4 | 0x0F);
        }
        apu.reg_nr30_write(0x80);
        apu.reg_nr32_write(0x20); // 100%
        apu.reg_nr33_write(0x00);
        apu.reg_nr34_write(0x87); // Period 0x700, 512 dots per sample.
        assert_eq!(apu.ch3.step_dots(), 512);

        apu.catch_up(512 + WAVE_TRIGGER_DELAY as u64);
        assert_eq!(apu.ch3.output(), 0x0F);
        apu.catch_up(1024 + WAVE_TRIGGER_DELAY as u64);
        assert_eq!(apu.ch3.output(), 0x01);

        // While playing, wave RAM accesses hit the byte being played.
        assert_eq!(apu.wave_read(0x0A), 0x1F);
        apu.reg_nr32_write(0x60); // 25%
        assert_eq!(apu.ch3.output(), 0x00);
    }

    #[test]
    fn test_power_off() {
        let (mut apu, _) = powered();
        apu.reg_nr11_write(0xC0 | 20);
        apu.reg_nr50_write(0x77);
        apu.wave_write(3, 0xAB);
        apu.reg_nr52_write(0x00);

        assert_eq!(apu.reg_nr52_read(), 0x70);
        assert_eq!(apu.reg_nr50_read(), 0x00);
        assert_eq!(apu.reg_nr11_read(), 0x3F);
        assert_eq!(apu.ch1.length, 44);
        assert_eq!(apu.wave_read(3), 0xAB);

        // Only length writes get through while powered off.
        apu.reg_nr50_write(0x77);
        apu.reg_nr41_write(0x3F);
        assert_eq!(apu.reg_nr50_read(), 0x00);
        assert_eq!(apu.ch4.length, 1);
    }

    #[test]
    fn test_register_readback() {
        let (mut apu, _) = powered();
        apu.skip_bootrom();
        assert_eq!(apu.reg_nr10_read(), 0x80);
        assert_eq!(apu.reg_nr11_read(), 0xBF);
        assert_eq!(apu.reg_nr12_read(), 0xF3);
        assert_eq!(apu.reg_nr30_read(), 0x7F);
        assert_eq!(apu.reg_nr32_read(), 0x9F);
        assert_eq!(apu.reg_nr50_read(), 0x77);
        assert_eq!(apu.reg_nr51_read(), 0xF3);
        assert_eq!(apu.reg_nr52_read(), 0xF1);
    }

    #[test]
    fn test_sample_mix() {
        let (mut apu, mut sched) = powered();
        run(&mut apu, &mut sched, SAMPLE_DOTS * 4);
        assert_eq!(apu.samples.len(), 8);
        // Silence at volume 0 still sits at the DAC's negative rail.
        assert_eq!(apu.samples[0], -16384 / 8 / 2);

        apu.samples.clear();
        apu.reg_nr50_write(0x70);
        apu.reg_nr51_write(0x20);
        apu.reg_nr21_write(0x80);
        apu.reg_nr22_write(0xF0);
        apu.reg_nr24_write(0x80);
        run(&mut apu, &mut sched, SAMPLE_DOTS);
        // Channel 2 is at duty position 0 of the 50% wave: high, routed left only.
        assert_eq!(apu.samples, vec![((15 * 512 - 16384) * 8 / 8 / 2) as i16, -16384 / 8 / 2]);
    }
}
