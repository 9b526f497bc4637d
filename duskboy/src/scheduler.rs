//! Everything in the Gameboy hangs off a single 4.194304Mhz master clock. Rather than pumping that clock through every
//! component one dot at a time, components tell the scheduler *when* they next need attention, and the console only
//! wakes them up at those points. In between, time advances in big jumps (one CPU instruction, a HALT, a DMA stall).
//!
//! There's a fixed set of event kinds, and each kind can only be pending once. That means the scheduler can keep one
//! due-time slot per kind, plus a small queue ordered by due time. Events that fall due on the same cycle fire in the
//! order they were scheduled.

use serde::{Deserialize, Serialize};

/// The things that can be scheduled to happen at a future cycle.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[rustfmt::skip]
pub enum EventKind {
    PpuMode,            // PPU mode boundary (OAM scan, pixel transfer, HBlank, end of line).
    TimerTick,          // TIMA increment.
    TimerReload,        // Delayed TMA -> TIMA reload after an overflow.
    ApuFrameSequencer,  // 512Hz length/sweep/envelope clock.
    ApuSample,          // Mix and emit one stereo sample.
    OamDma,             // OAM DMA transfer completes.
    SerialTransfer,     // Internally clocked serial transfer completes.
}

const EVENT_KINDS: usize = 7;

impl EventKind {
    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Default, Deserialize, Serialize)]
pub struct Scheduler {
    cycles: u64,                       // Committed master clock.
    staging: u64,                      // Cycles advanced but not yet committed.
    due: [Option<u64>; EVENT_KINDS],   // Absolute due time for each pending event kind.
    queue: Vec<EventKind>,             // Pending kinds, ordered by due time (FIFO among equals).
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Default::default()
    }

    /// Drops every pending event and rewinds the clock to zero.
    pub fn reset(&mut self) {
        *self = Default::default();
    }

    /// The committed master clock.
    pub fn now(&self) -> u64 {
        self.cycles
    }

    /// The master clock including any staged cycles that haven't been committed yet.
    pub fn cycle(&self) -> u64 {
        self.cycles + self.staging
    }

    pub fn is_pending(&self, kind: EventKind) -> bool {
        self.due[kind.slot()].is_some()
    }

    /// How many cycles until the given event fires, if it's pending.
    pub fn due_in(&self, kind: EventKind) -> Option<u64> {
        self.due[kind.slot()].map(|when| when.saturating_sub(self.cycle()))
    }

    /// Schedules an event to fire `after` cycles from now. An event kind can only be pending once, so callers must
    /// cancel an outstanding event before scheduling it again.
    pub fn schedule(&mut self, kind: EventKind, after: u64) {
        let when = self.cycle() + after;
        self.insert(kind, when);
    }

    /// Reschedules a periodic event from inside its own handler. `late` is how far past its due time the event was
    /// dispatched, so the next occurrence lands exactly `period` cycles after the previous due time and phase never
    /// drifts. If the handler was late by more than a whole period, the event is immediately due again.
    pub fn schedule_late(&mut self, kind: EventKind, period: u64, late: u64) {
        let when = (self.cycle() + period).saturating_sub(late);
        self.insert(kind, when);
    }

    fn insert(&mut self, kind: EventKind, when: u64) {
        debug_assert!(!self.is_pending(kind), "{:?} scheduled while already pending", kind);
        if self.is_pending(kind) {
            log::warn!("{:?} scheduled while already pending, replacing", kind);
            self.cancel(kind);
        }

        self.due[kind.slot()] = Some(when);

        // Walk from the back so equal due times keep scheduling order.
        let mut idx = self.queue.len();
        while idx > 0 && self.when(self.queue[idx - 1]) > when {
            idx -= 1;
        }
        self.queue.insert(idx, kind);
    }

    /// Removes a pending event. Cancelling something that isn't pending is a no-op.
    pub fn cancel(&mut self, kind: EventKind) {
        if self.due[kind.slot()].take().is_some() {
            self.queue.retain(|k| *k != kind);
        }
    }

    /// Stages `n` cycles. Staged cycles count towards `cycle()` but don't make any events due until `commit`.
    pub fn advance(&mut self, n: u64) {
        self.staging += n;
    }

    /// Folds staged cycles into the committed clock.
    pub fn commit(&mut self) {
        self.cycles += self.staging;
        self.staging = 0;
    }

    /// Pops the earliest event that is due at the committed clock, along with how many cycles late it is.
    /// The caller dispatches it and keeps popping until this returns None.
    pub fn pop_due(&mut self) -> Option<(EventKind, u64)> {
        let kind = *self.queue.first()?;
        let when = self.when(kind);
        if when > self.cycles {
            return None;
        }

        self.queue.remove(0);
        self.due[kind.slot()] = None;
        Some((kind, self.cycles - when))
    }

    /// Cycles until the earliest pending event, or 0 if nothing is pending.
    pub fn until_next_event(&self) -> u64 {
        self.queue
            .first()
            .map(|kind| self.when(*kind).saturating_sub(self.cycle()))
            .unwrap_or(0)
    }

    fn when(&self, kind: EventKind) -> u64 {
        self.due[kind.slot()].unwrap_or(u64::max_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(sched: &mut Scheduler) -> Vec<(EventKind, u64)> {
        let mut fired = Vec::new();
        while let Some(ev) = sched.pop_due() {
            fired.push(ev);
        }
        fired
    }

    // Test that events fire in due-time order, regardless of scheduling order.
    #[test]
    fn test_due_order() {
        let mut sched = Scheduler::new();
        sched.schedule(EventKind::TimerTick, 30);
        sched.schedule(EventKind::PpuMode, 10);
        sched.schedule(EventKind::ApuSample, 20);

        sched.advance(100);
        sched.commit();
        let fired: Vec<EventKind> = drain(&mut sched).into_iter().map(|(k, _)| k).collect();
        assert_eq!(fired, vec![EventKind::PpuMode, EventKind::ApuSample, EventKind::TimerTick]);
    }

    // Test that events due on the same cycle fire in the order they were scheduled.
    #[test]
    fn test_same_cycle_fifo() {
        let mut sched = Scheduler::new();
        sched.schedule(EventKind::SerialTransfer, 8);
        sched.schedule(EventKind::OamDma, 8);
        sched.schedule(EventKind::TimerReload, 8);

        sched.advance(8);
        sched.commit();
        let fired: Vec<EventKind> = drain(&mut sched).into_iter().map(|(k, _)| k).collect();
        assert_eq!(fired, vec![EventKind::SerialTransfer, EventKind::OamDma, EventKind::TimerReload]);
    }

    // Test that staged cycles don't make anything due until they're committed.
    #[test]
    fn test_staging() {
        let mut sched = Scheduler::new();
        sched.schedule(EventKind::PpuMode, 4);
        sched.advance(4);
        assert_eq!(sched.cycle(), 4);
        assert_eq!(sched.now(), 0);
        assert!(sched.pop_due().is_none());

        sched.commit();
        assert_eq!(sched.pop_due(), Some((EventKind::PpuMode, 0)));
    }

    // Test that a cancelled event never fires and can be scheduled again.
    #[test]
    fn test_cancel() {
        let mut sched = Scheduler::new();
        sched.schedule(EventKind::TimerTick, 5);
        sched.schedule(EventKind::ApuSample, 6);
        sched.cancel(EventKind::TimerTick);
        sched.cancel(EventKind::TimerTick);
        assert!(!sched.is_pending(EventKind::TimerTick));

        sched.schedule(EventKind::TimerTick, 10);
        sched.advance(7);
        sched.commit();
        assert_eq!(drain(&mut sched), vec![(EventKind::ApuSample, 1)]);
        assert_eq!(sched.until_next_event(), 3);
    }

    // Test that lateness is reported and an empty queue reports zero cycles to the next event.
    #[test]
    fn test_late_and_empty() {
        let mut sched = Scheduler::new();
        assert_eq!(sched.until_next_event(), 0);

        sched.schedule(EventKind::OamDma, 3);
        sched.advance(24);
        sched.commit();
        assert_eq!(sched.pop_due(), Some((EventKind::OamDma, 21)));
        assert_eq!(sched.until_next_event(), 0);
    }

    // Test that a periodic event rescheduled with its lateness keeps exact phase, no matter how coarsely time moves.
    #[test]
    fn test_periodic_phase() {
        let mut sched = Scheduler::new();
        let period = 456;
        sched.schedule(EventKind::PpuMode, period);

        let mut fire_times = Vec::new();
        let steps = [4u64, 8, 12, 24, 20, 16, 4000, 4, 8];
        let mut i = 0;
        while fire_times.len() < 40 {
            sched.advance(steps[i % steps.len()]);
            sched.commit();
            i += 1;
            while let Some((kind, late)) = sched.pop_due() {
                assert_eq!(kind, EventKind::PpuMode);
                fire_times.push(sched.now() - late);
                sched.schedule_late(EventKind::PpuMode, period, late);
            }
        }

        for (n, t) in fire_times.iter().enumerate() {
            assert_eq!(*t, (n as u64 + 1) * period);
        }
    }

    // Test that the whole queue survives a save/restore.
    #[test]
    fn test_serde() {
        let mut sched = Scheduler::new();
        sched.schedule(EventKind::ApuFrameSequencer, 8192);
        sched.schedule(EventKind::PpuMode, 80);
        sched.advance(40);
        sched.commit();

        let bytes = bincode::serialize(&sched).unwrap();
        let mut restored: Scheduler = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.now(), 40);
        assert_eq!(restored.until_next_event(), 40);
        assert_eq!(restored.due_in(EventKind::ApuFrameSequencer), Some(8152));
        restored.advance(8152);
        restored.commit();
        assert_eq!(drain(&mut restored).len(), 2);
    }
}
