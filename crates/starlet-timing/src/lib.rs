//! Deterministic virtual-time event scheduler.
//!
//! # Design
//!
//! The scheduler uses **event delivery** rather than storing callbacks. This
//! keeps the timer queue fully serializable for save/restore; callers keep
//! their own `EventId -> handler` mapping and re-establish it after restore by
//! registering event kinds in the same order at power-on.
//!
//! Two scheduling paths exist:
//! - [`Scheduler::schedule`], emulation-thread only, arbitrary tick delay;
//! - [`RemoteScheduler::schedule_immediate`], callable from any thread. Remote
//!   events are queued behind a lock and folded into the timer heap as
//!   zero-delay events the next time the emulation thread advances, so every
//!   handler still runs on the emulation thread.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use starlet_io_snapshot::{
    Decoder, Encoder, IoSnapshot, SnapshotError, SnapshotResult, SnapshotVersion, SnapshotWriter,
};

/// Registered event kind. Ids are dense indices in registration order; a
/// restored snapshot is only meaningful if power-on registered the same kinds
/// in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u32);

impl EventId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A fired event, delivered from [`Scheduler::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredEvent {
    pub id: EventId,
    pub userdata: u64,
    pub ticks_late: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEvent {
    due: u64,
    // Tie-breaker so same-tick events fire in schedule order.
    seq: u64,
    id: EventId,
    userdata: u64,
}

impl Ord for PendingEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

impl PartialOrd for PendingEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct RemoteQueue {
    events: Mutex<Vec<(EventId, u64)>>,
}

/// Cloneable cross-thread handle. Background hardware threads use this to
/// request a zero-delay event on the emulation thread.
#[derive(Debug, Clone)]
pub struct RemoteScheduler {
    queue: Arc<RemoteQueue>,
}

impl RemoteScheduler {
    pub fn schedule_immediate(&self, id: EventId, userdata: u64) {
        self.queue
            .events
            .lock()
            .expect("remote event queue poisoned")
            .push((id, userdata));
    }
}

pub struct Scheduler {
    now: u64,
    seq: u64,
    kinds: Vec<&'static str>,
    heap: BinaryHeap<Reverse<PendingEvent>>,
    remote: Arc<RemoteQueue>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            now: 0,
            seq: 0,
            kinds: Vec::new(),
            heap: BinaryHeap::new(),
            remote: Arc::new(RemoteQueue::default()),
        }
    }

    /// Registers an event kind. Must happen at power-on, before any snapshot
    /// load, in a fixed order.
    pub fn register_event(&mut self, name: &'static str) -> EventId {
        let id = EventId(self.kinds.len() as u32);
        self.kinds.push(name);
        id
    }

    pub fn event_name(&self, id: EventId) -> &'static str {
        self.kinds[id.0 as usize]
    }

    pub fn remote(&self) -> RemoteScheduler {
        RemoteScheduler {
            queue: Arc::clone(&self.remote),
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn schedule(&mut self, delay_ticks: u64, id: EventId, userdata: u64) {
        debug_assert!((id.0 as usize) < self.kinds.len(), "unregistered event id");
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(PendingEvent {
            due: self.now + delay_ticks,
            seq,
            id,
            userdata,
        }));
    }

    /// Drops every scheduled event of the given kind. Remote events already
    /// queued are folded in first so they cannot resurrect a removed kind.
    pub fn remove_all(&mut self, id: EventId) {
        self.fold_remote();
        let retained: Vec<_> = self
            .heap
            .drain()
            .filter(|Reverse(ev)| ev.id != id)
            .collect();
        self.heap.extend(retained);
    }

    fn fold_remote(&mut self) {
        let drained: Vec<_> = {
            let mut events = self
                .remote
                .events
                .lock()
                .expect("remote event queue poisoned");
            events.drain(..).collect()
        };
        for (id, userdata) in drained {
            self.schedule(0, id, userdata);
        }
    }

    /// Advances virtual time by `ticks` and delivers every event that came
    /// due, in (due, schedule-order) order. `advance(0)` delivers remote and
    /// zero-delay events without moving time.
    pub fn advance(&mut self, ticks: u64) -> Vec<FiredEvent> {
        self.fold_remote();
        self.now += ticks;

        let mut fired = Vec::new();
        while let Some(Reverse(head)) = self.heap.peek().copied() {
            if head.due > self.now {
                break;
            }
            self.heap.pop();
            fired.push(FiredEvent {
                id: head.id,
                userdata: head.userdata,
                ticks_late: self.now - head.due,
            });
        }
        fired
    }

    /// Number of scheduled (not yet fired) events, remote queue included.
    pub fn pending_len(&self) -> usize {
        let remote = self
            .remote
            .events
            .lock()
            .expect("remote event queue poisoned")
            .len();
        self.heap.len() + remote
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl IoSnapshot for Scheduler {
    const DEVICE_ID: [u8; 4] = *b"TIMQ";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_NOW: u16 = 1;
        const TAG_EVENTS: u16 = 2;

        // Cross-thread events are folded in by the machine before it saves;
        // anything still in the remote queue at this point belongs to the next
        // run of the restored machine, not to the snapshot.
        let mut events: Vec<_> = self.heap.iter().map(|Reverse(ev)| *ev).collect();
        events.sort();

        let mut enc = Encoder::new().u32(events.len() as u32);
        for ev in &events {
            enc = enc.u64(ev.due).u32(ev.id.0).u64(ev.userdata);
        }

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u64(TAG_NOW, self.now);
        w.field_bytes(TAG_EVENTS, enc.finish());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_NOW: u16 = 1;
        const TAG_EVENTS: u16 = 2;

        let r = starlet_io_snapshot::SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        let now = r.u64(TAG_NOW)?.unwrap_or(0);
        let mut heap = BinaryHeap::new();
        let mut max_seq = 0u64;
        if let Some(buf) = r.bytes(TAG_EVENTS) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            for seq in 0..count {
                let due = d.u64()?;
                let id = d.u32()?;
                let userdata = d.u64()?;
                if (id as usize) >= self.kinds.len() {
                    return Err(SnapshotError::InvalidFieldEncoding("timer event id"));
                }
                heap.push(Reverse(PendingEvent {
                    due,
                    seq: seq as u64,
                    id: EventId(id),
                    userdata,
                }));
                max_seq = seq as u64 + 1;
            }
            d.finish()?;
        }

        self.now = now;
        self.seq = max_seq;
        self.heap = heap;
        self.remote
            .events
            .lock()
            .expect("remote event queue poisoned")
            .clear();
        Ok(())
    }
}
