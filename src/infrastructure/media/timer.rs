//! Cancelable timers for session handlers
//!
//! Sessions never sleep. They ask a [`TimerService`] for a callback at an
//! absolute deadline and get back a handle they can cancel. [`TimerQueue`] is
//! the in-process implementation the endpoint drains from its event loop.

use crate::infrastructure::media::rtp::SessionKey;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;

/// Which session handler a timer drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// RTCP transmission check and housekeeping
    RtcpCheck,
    /// Jitter buffer playout tick
    JitterNominal,
    /// Jitter buffer max delay recomputation
    JitterTalkspurt,
}

/// Opaque handle returned by [`TimerService::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A timer that reached its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTimer {
    pub handle: TimerHandle,
    pub key: SessionKey,
    pub kind: TimerKind,
    pub deadline: Duration,
}

/// Timer collaborator injected into each session
#[cfg_attr(test, mockall::automock)]
pub trait TimerService {
    /// Fire `kind` for session `key` at `deadline` (time since the Unix epoch)
    fn schedule(&mut self, key: SessionKey, kind: TimerKind, deadline: Duration) -> TimerHandle;

    /// Cancel a pending timer. Canceling a fired or unknown timer is a no-op.
    fn cancel(&mut self, handle: TimerHandle);
}

/// Deadline-ordered timer queue with lazy cancellation
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Duration, u64)>>,
    pending: HashMap<u64, (SessionKey, TimerKind)>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<Duration> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.pending.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every timer due at `now`, earliest first
    pub fn pop_due(&mut self, now: Duration) -> Vec<FiredTimer> {
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some((key, kind)) = self.pending.remove(&id) {
                fired.push(FiredTimer {
                    handle: TimerHandle(id),
                    key,
                    kind,
                    deadline,
                });
            }
        }
        fired
    }

    /// Drop every pending timer of one session
    pub fn cancel_session(&mut self, key: SessionKey) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, (k, _)| *k != key);
        before - self.pending.len()
    }
}

impl TimerService for TimerQueue {
    fn schedule(&mut self, key: SessionKey, kind: TimerKind, deadline: Duration) -> TimerHandle {
        self.next_id += 1;
        let id = self.next_id;
        self.heap.push(Reverse((deadline, id)));
        self.pending.insert(id, (key, kind));
        trace!("Scheduled {:?} for {} at {:?}", kind, key, deadline);
        TimerHandle(id)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if self.pending.remove(&handle.0).is_some() {
            trace!("Canceled timer {}", handle.0);
        }
    }
}

/// Timer queue shared between the endpoint loop and its sessions
#[derive(Debug, Clone, Default)]
pub struct SharedTimerQueue {
    inner: Arc<Mutex<TimerQueue>>,
}

impl SharedTimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut TimerQueue) -> T) -> T {
        // A poisoned lock still holds a consistent queue
        let mut queue = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut queue)
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.with(|q| q.next_deadline())
    }

    pub fn pop_due(&self, now: Duration) -> Vec<FiredTimer> {
        self.with(|q| q.pop_due(now))
    }

    pub fn cancel_session(&self, key: SessionKey) -> usize {
        self.with(|q| q.cancel_session(key))
    }

    pub fn len(&self) -> usize {
        self.with(|q| q.len())
    }

    pub fn is_empty(&self) -> bool {
        self.with(|q| q.is_empty())
    }
}

impl TimerService for SharedTimerQueue {
    fn schedule(&mut self, key: SessionKey, kind: TimerKind, deadline: Duration) -> TimerHandle {
        self.with(|q| q.schedule(key, kind, deadline))
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.with(|q| q.cancel(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(port: u16) -> SessionKey {
        SessionKey::new("10.0.0.2".parse().unwrap(), port)
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        queue.schedule(key(5000), TimerKind::RtcpCheck, ms(30));
        queue.schedule(key(5000), TimerKind::JitterNominal, ms(10));
        queue.schedule(key(5002), TimerKind::JitterTalkspurt, ms(20));

        assert_eq!(queue.next_deadline(), Some(ms(10)));
        let fired = queue.pop_due(ms(25));
        let kinds: Vec<_> = fired.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TimerKind::JitterNominal, TimerKind::JitterTalkspurt]);
        assert_eq!(fired[1].key, key(5002));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_canceled_timer_never_fires() {
        let mut queue = TimerQueue::new();
        let handle = queue.schedule(key(5000), TimerKind::RtcpCheck, ms(10));
        queue.cancel(handle);

        assert!(queue.pop_due(ms(100)).is_empty());
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let mut queue = TimerQueue::new();
        let handle = queue.schedule(key(5000), TimerKind::RtcpCheck, ms(10));
        let other = queue.schedule(key(5000), TimerKind::RtcpCheck, ms(50));

        assert_eq!(queue.pop_due(ms(10)).len(), 1);
        queue.cancel(handle);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_due(ms(50))[0].handle, other);
    }

    #[test]
    fn test_cancel_session() {
        let mut queue = TimerQueue::new();
        queue.schedule(key(5000), TimerKind::RtcpCheck, ms(10));
        queue.schedule(key(5000), TimerKind::JitterNominal, ms(10));
        queue.schedule(key(6000), TimerKind::RtcpCheck, ms(10));

        assert_eq!(queue.cancel_session(key(5000)), 2);
        let fired = queue.pop_due(ms(10));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].key, key(6000));
    }

    #[test]
    fn test_shared_queue_clones_share_state() {
        let shared = SharedTimerQueue::new();
        let mut handle_side = shared.clone();
        handle_side.schedule(key(5000), TimerKind::RtcpCheck, ms(5));

        assert_eq!(shared.next_deadline(), Some(ms(5)));
        assert_eq!(shared.pop_due(ms(5)).len(), 1);
        assert!(handle_side.is_empty());
    }
}
