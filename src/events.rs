//! Structured locker events with peek/commit delivery.
//!
//! Every significant action lands here and is uploaded by the sync task.
//! Events are only removed after the dispatcher acknowledges receipt, so a
//! failed sync retries them. Emission is best-effort: a full ring drops the
//! oldest event and never gates a state transition.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use heapless::String;

pub const MAX_EVENTS: usize = 32;

pub type ActorTag = String<16>;
pub type Detail = String<24>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    OpenAttempt,
    OpenSuccess,
    OpenFailed,
    Reserve,
    Assign,
    Release,
    Block,
    Unblock,
    Expired,
    BurstRequired,
    HealthDegraded,
    Reconnected,
    ReconnectionFailed,
    HardwareUnavailable,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OpenAttempt => "open_attempt",
            EventKind::OpenSuccess => "open_success",
            EventKind::OpenFailed => "open_failed",
            EventKind::Reserve => "reserve",
            EventKind::Assign => "assign",
            EventKind::Release => "release",
            EventKind::Block => "block",
            EventKind::Unblock => "unblock",
            EventKind::Expired => "expired",
            EventKind::BurstRequired => "burst_required",
            EventKind::HealthDegraded => "health_degraded",
            EventKind::Reconnected => "reconnected",
            EventKind::ReconnectionFailed => "reconnection_failed",
            EventKind::HardwareUnavailable => "hardware_unavailable",
        }
    }
}

/// One event row. `locker` is 0 for bus-level events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockerEvent {
    pub at_ms: u64,
    pub kind: EventKind,
    pub locker: u16,
    pub actor: ActorTag,
    pub detail: Detail,
}

impl LockerEvent {
    pub const EMPTY: LockerEvent = LockerEvent {
        at_ms: 0,
        kind: EventKind::OpenAttempt,
        locker: 0,
        actor: String::new(),
        detail: String::new(),
    };

    pub fn new(at_ms: u64, kind: EventKind, locker: u16, actor: &str, detail: &str) -> Self {
        let mut event =
            LockerEvent { at_ms, kind, locker, actor: String::new(), detail: String::new() };
        let _ = event.actor.push_str(actor);
        let _ = event.detail.push_str(detail);
        event
    }
}

/// Circular buffer state. Kept separate from the mutex wrapper so the
/// peek/commit arithmetic is testable on the host.
pub struct EventRing {
    events: [LockerEvent; MAX_EVENTS],
    head: usize, // next write position
    tail: usize, // next read position
}

impl EventRing {
    pub const fn new() -> Self {
        Self {
            events: [LockerEvent::EMPTY; MAX_EVENTS],
            head: 0,
            tail: 0,
        }
    }

    pub fn len(&self) -> usize {
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            MAX_EVENTS - self.tail + self.head
        }
    }

    pub fn is_full(&self) -> bool {
        (self.head + 1) % MAX_EVENTS == self.tail
    }

    /// Append, discarding the oldest event when full.
    pub fn push(&mut self, event: LockerEvent) {
        if self.is_full() {
            self.tail = (self.tail + 1) % MAX_EVENTS;
        }
        self.events[self.head] = event;
        self.head = (self.head + 1) % MAX_EVENTS;
    }

    /// Copy pending events into `out` without removing them. Returns
    /// `(count, tail_snapshot)`; the snapshot goes back into
    /// [`Self::commit`] once the upload is acknowledged.
    pub fn peek(&self, out: &mut [LockerEvent]) -> (usize, usize) {
        let tail = self.tail;
        let mut count = 0;
        let mut idx = tail;
        while idx != self.head && count < out.len() {
            out[count] = self.events[idx].clone();
            count += 1;
            idx = (idx + 1) % MAX_EVENTS;
        }
        (count, tail)
    }

    /// Remove `count` events peeked at `expected_tail`. A tail moved by
    /// overflow since the peek means those events are already gone; only
    /// advance if the commit point is still ahead of the current tail.
    pub fn commit(&mut self, count: usize, expected_tail: usize) {
        let new_tail = (expected_tail + count) % MAX_EVENTS;
        if self.tail == expected_tail {
            self.tail = new_tail;
            return;
        }
        let distance_forward = if new_tail >= self.tail {
            new_tail - self.tail
        } else {
            MAX_EVENTS - self.tail + new_tail
        };
        if distance_forward < MAX_EVENTS / 2 {
            self.tail = new_tail;
        }
    }
}

/// Shared event buffer for the transition paths and the sync task.
pub struct EventBuffer {
    inner: Mutex<CriticalSectionRawMutex, EventRing>,
}

impl EventBuffer {
    pub const fn new() -> Self {
        Self { inner: Mutex::new(EventRing::new()) }
    }

    pub async fn push(&self, event: LockerEvent) {
        let mut guard = self.inner.lock().await;
        if guard.is_full() {
            log::warn!("events: buffer full, dropping oldest event");
        }
        guard.push(event);
    }

    pub async fn peek(&self, out: &mut [LockerEvent]) -> (usize, usize) {
        self.inner.lock().await.peek(out)
    }

    pub async fn commit(&self, count: usize, expected_tail: usize) {
        self.inner.lock().await.commit(count, expected_tail);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
