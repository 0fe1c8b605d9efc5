use crate::error::SchedulerError;
use core::cmp::Ordering;
use core::fmt;
use heapless::binary_heap::{BinaryHeap, Min};
use serde::{Deserialize, Serialize};
use std::any::Any;
use tracing::warn;

pub const MAX_SCHEDULED_COMMANDS: usize = 256;

/// Handle naming one component: the scheduler target and the capability
/// owner are the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentId(pub usize);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque extra data a command may carry.
pub type Payload = Box<dyn Any>;

/// A unit of work for one target. Immutable once queued.
pub struct Command<K> {
    pub target: ComponentId,
    pub kind: K,
    pub payload: Option<Payload>,
}

impl<K> Command<K> {
    pub fn new(target: ComponentId, kind: K) -> Self {
        Self {
            target,
            kind,
            payload: None,
        }
    }

    pub fn with_payload(target: ComponentId, kind: K, payload: Payload) -> Self {
        Self {
            target,
            kind,
            payload: Some(payload),
        }
    }

    pub fn map_kind<J>(self, f: impl FnOnce(K) -> J) -> Command<J> {
        Command {
            target: self.target,
            kind: f(self.kind),
            payload: self.payload,
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for Command<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

pub struct ScheduledEntry<K> {
    pub command: Command<K>,
    pub due_ms: u64,
    seq: u64,
}

impl<K> ScheduledEntry<K> {
    fn key(&self) -> (u64, u64) {
        (self.due_ms, self.seq)
    }
}

impl<K> PartialEq for ScheduledEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<K> Eq for ScheduledEntry<K> {}

impl<K> PartialOrd for ScheduledEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Sequence numbers are unique, so the order is total and ties on due time
// fall back to insertion order.
impl<K> Ord for ScheduledEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_scheduled: u64,
    pub total_dispatched: u64,
    pub contract_violations: u32,
    pub currently_scheduled: u16,
}

/// Time-ordered command queue. Pure data structure: it never reads a clock,
/// callers pass the current time in.
pub struct Scheduler<K> {
    queue: BinaryHeap<ScheduledEntry<K>, Min, MAX_SCHEDULED_COMMANDS>,
    next_seq: u64,
    stats: SchedulerStats,
}

impl<K> Scheduler<K> {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            next_seq: 0,
            stats: SchedulerStats::default(),
        }
    }

    /// Enqueue with due time = `now_ms`.
    pub fn schedule_now(&mut self, now_ms: u64, command: Command<K>) -> Result<(), SchedulerError> {
        self.push(now_ms, command)
    }

    /// Enqueue with due time = `now_ms + delay_ms`. A negative delay is a
    /// caller bug; it is reported and treated as zero.
    pub fn schedule_at(
        &mut self,
        now_ms: u64,
        command: Command<K>,
        delay_ms: i64,
    ) -> Result<(), SchedulerError> {
        let delay = match u64::try_from(delay_ms) {
            Ok(delay) => delay,
            Err(_) => {
                self.stats.contract_violations += 1;
                warn!(
                    target_id = %command.target,
                    delay_ms,
                    "negative schedule delay, dispatching immediately"
                );
                0
            }
        };
        self.push(now_ms.saturating_add(delay), command)
    }

    fn push(&mut self, due_ms: u64, command: Command<K>) -> Result<(), SchedulerError> {
        let entry = ScheduledEntry {
            command,
            due_ms,
            seq: self.next_seq,
        };
        if self.queue.push(entry).is_err() {
            warn!(capacity = MAX_SCHEDULED_COMMANDS, "scheduler queue full");
            return Err(SchedulerError::QueueFull);
        }

        self.next_seq += 1;
        self.stats.total_scheduled += 1;
        self.update_count();

        debug_assert!(
            self.queue.len() <= MAX_SCHEDULED_COMMANDS,
            "Scheduler queue length {} exceeds capacity {}",
            self.queue.len(),
            MAX_SCHEDULED_COMMANDS
        );
        Ok(())
    }

    /// Due time of the earliest pending entry.
    pub fn next_due(&self) -> Option<u64> {
        self.queue.peek().map(|entry| entry.due_ms)
    }

    /// Remove the earliest entry if it is due at `now_ms`.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<ScheduledEntry<K>> {
        if self.next_due()? > now_ms {
            return None;
        }
        let entry = self.queue.pop()?;
        self.stats.total_dispatched += 1;
        self.update_count();
        Some(entry)
    }

    /// Sequence number the next entry will get. Entries queued before this
    /// call all carry a lower one.
    pub fn sequence_mark(&self) -> u64 {
        self.next_seq
    }

    /// Like [`pop_due`](Self::pop_due), restricted to entries queued before
    /// `mark`.
    pub fn pop_due_before(&mut self, now_ms: u64, mark: u64) -> Option<ScheduledEntry<K>> {
        if self.queue.peek()?.seq >= mark {
            return None;
        }
        self.pop_due(now_ms)
    }

    /// Drop every pending entry addressed to `target`. Returns how many were
    /// removed.
    pub fn purge_target(&mut self, target: ComponentId) -> usize {
        let before = self.queue.len();
        let mut kept: BinaryHeap<ScheduledEntry<K>, Min, MAX_SCHEDULED_COMMANDS> = BinaryHeap::new();
        while let Some(entry) = self.queue.pop() {
            if entry.command.target != target {
                // Capacity is identical, so the push cannot fail.
                let _ = kept.push(entry);
            }
        }
        self.queue = kept;
        self.update_count();
        before - self.queue.len()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    fn update_count(&mut self) {
        self.stats.currently_scheduled = u16::try_from(self.queue.len()).unwrap_or(u16::MAX);
    }
}

impl<K> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(target: usize, tag: u32) -> Command<u32> {
        Command::new(ComponentId(target), tag)
    }

    fn drain(scheduler: &mut Scheduler<u32>, now: u64) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(entry) = scheduler.pop_due(now) {
            out.push(entry.command.kind);
        }
        out
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler: Scheduler<u32> = Scheduler::new();
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.next_due(), None);
        assert_eq!(scheduler.stats().total_scheduled, 0);
    }

    #[test]
    fn test_immediate_command_scheduling() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_now(1000, cmd(0, 1)).unwrap();

        let entry = scheduler.pop_due(1000).unwrap();
        assert_eq!(entry.command.kind, 1);
        assert_eq!(entry.due_ms, 1000);
        assert!(scheduler.pop_due(1000).is_none());
    }

    #[test]
    fn test_future_command_not_ready_early() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_at(1000, cmd(0, 1), 5000).unwrap();

        assert!(scheduler.pop_due(5999).is_none());
        assert_eq!(scheduler.next_due(), Some(6000));
        assert_eq!(drain(&mut scheduler, 6000), vec![1]);
    }

    #[test]
    fn test_command_ordering() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_at(0, cmd(0, 3), 3000).unwrap();
        scheduler.schedule_at(0, cmd(1, 1), 1000).unwrap();
        scheduler.schedule_at(0, cmd(2, 2), 2000).unwrap();

        assert_eq!(drain(&mut scheduler, 1000), vec![1]);
        assert_eq!(drain(&mut scheduler, 10_000), vec![2, 3]);
    }

    #[test]
    fn test_equal_due_times_dispatch_fifo() {
        let mut scheduler = Scheduler::new();
        for tag in 0..20 {
            scheduler.schedule_at(0, cmd(0, tag), 500).unwrap();
        }
        scheduler.schedule_now(0, cmd(0, 99)).unwrap();

        let order = drain(&mut scheduler, 500);
        assert_eq!(order[0], 99);
        assert_eq!(&order[1..], (0..20).collect::<Vec<_>>().as_slice());
    }

    #[test]
    fn test_negative_delay_is_reported_and_clamped() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_at(700, cmd(0, 1), -250).unwrap();

        assert_eq!(scheduler.next_due(), Some(700));
        assert_eq!(scheduler.stats().contract_violations, 1);
    }

    #[test]
    fn test_queue_full() {
        let mut scheduler = Scheduler::new();
        for tag in 0..MAX_SCHEDULED_COMMANDS {
            scheduler.schedule_now(0, cmd(0, tag as u32)).unwrap();
        }
        assert_eq!(
            scheduler.schedule_now(0, cmd(0, 0)),
            Err(SchedulerError::QueueFull)
        );
        assert_eq!(
            usize::from(scheduler.stats().currently_scheduled),
            MAX_SCHEDULED_COMMANDS
        );
    }

    #[test]
    fn test_purge_target_keeps_others_in_order() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_at(0, cmd(1, 10), 10).unwrap();
        scheduler.schedule_at(0, cmd(2, 20), 5).unwrap();
        scheduler.schedule_at(0, cmd(1, 11), 1).unwrap();
        scheduler.schedule_at(0, cmd(2, 21), 5).unwrap();

        assert_eq!(scheduler.purge_target(ComponentId(1)), 2);
        assert_eq!(drain(&mut scheduler, 100), vec![20, 21]);
    }

    #[test]
    fn test_stats_track_dispatch() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_now(0, cmd(0, 1)).unwrap();
        scheduler.schedule_at(0, cmd(0, 2), 100).unwrap();
        drain(&mut scheduler, 0);

        let stats = scheduler.stats();
        assert_eq!(stats.total_scheduled, 2);
        assert_eq!(stats.total_dispatched, 1);
        assert_eq!(stats.currently_scheduled, 1);
    }

    fn next_random(state: &mut u64) -> u64 {
        *state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223) & 0xFFFF_FFFF;
        *state >> 8
    }

    #[test]
    fn test_generated_sequences_dispatch_by_due_time_then_fifo() {
        let mut state = 0x5EED_u64;

        for round in 0..64 {
            let mut scheduler = Scheduler::new();
            let mut now = 0u64;
            let mut next_tag = 0u32;
            let mut last: Option<(u64, u32)> = None;
            let mut check = |due_ms: u64, tag: u32| {
                if let Some((last_due, last_tag)) = last {
                    assert!(due_ms >= last_due, "round {round}: due {due_ms} after {last_due}");
                    if due_ms == last_due {
                        assert!(tag > last_tag, "round {round}: tag {tag} after {last_tag} at {due_ms}");
                    }
                }
                last = Some((due_ms, tag));
            };

            for _ in 0..400 {
                if next_random(&mut state) % 4 == 0 {
                    now += next_random(&mut state) % 600;
                    while let Some(entry) = scheduler.pop_due(now) {
                        assert!(entry.due_ms <= now);
                        check(entry.due_ms, entry.command.kind);
                    }
                } else if scheduler.len() < MAX_SCHEDULED_COMMANDS {
                    // Coarse steps force plenty of ties; -250 exercises the clamp.
                    let delay = (next_random(&mut state) % 8) as i64 * 250 - 250;
                    scheduler.schedule_at(now, cmd(0, next_tag), delay).unwrap();
                    next_tag += 1;
                }
            }
            while let Some(entry) = scheduler.pop_due(u64::MAX) {
                check(entry.due_ms, entry.command.kind);
            }

            assert!(scheduler.is_empty());
            assert_eq!(scheduler.stats().total_dispatched, u64::from(next_tag));
        }
    }
}
