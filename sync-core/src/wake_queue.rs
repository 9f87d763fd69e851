//! Wake queue for the document pool.
//!
//! This module provides a priority queue of wake requests with:
//! - Priority ordering, then arrival order among equal priorities
//! - In-place priority upgrades (a guid is never queued twice)
//! - Waking tracking (requests dequeued but not yet warm)
//! - A bound on warm documents (`max_concurrent_warm`)
//!
//! Requests flow through the queue in this order:
//! 1. `enqueue()` - add to the queue, or upgrade an existing request
//! 2. `dequeue()` - take the best request once a warm slot is free
//! 3. `complete()` - the wake finished, the document now holds a slot
//! 4. `release()` - the document hibernated, its slot is free again
//!
//! If a wake fails, `fail()` puts the request back ahead of later arrivals
//! of the same priority.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sync_types::Guid;
use thiserror::Error;

/// Error type for wake queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WakeQueueError {
    /// Too many requests are waiting.
    #[error("wake queue full (capacity: {capacity})")]
    Full {
        /// Maximum number of queued requests.
        capacity: usize,
    },
}

/// Urgency of a wake request.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum WakePriority {
    /// Background work (prefetch, catch-up).
    Low,
    /// Remote activity on the document.
    #[default]
    Normal,
    /// The user is about to open the document.
    High,
}

/// A request waiting for a warm slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeRequest {
    /// Document to wake.
    pub guid: Guid,
    /// Current priority (only ever raised).
    pub priority: WakePriority,
    /// Arrival order.
    pub seq: u64,
}

/// What `enqueue` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new request was queued.
    Queued,
    /// An existing request's priority was raised.
    Upgraded,
    /// An existing request already had this priority or higher.
    Unchanged,
    /// The document is already warm or waking.
    AlreadyWarm,
}

type Key = (Reverse<WakePriority>, u64);

/// Priority wake queue bounded by a warm-slot count.
#[derive(Debug)]
pub struct WakeQueue {
    /// Maximum number of warm documents (waking included).
    max_concurrent_warm: usize,
    /// Maximum number of queued requests.
    max_queued: usize,
    /// Queued requests, best first.
    queue: BTreeMap<Key, Guid>,
    /// Guid to its queue key.
    index: HashMap<Guid, Key>,
    /// Requests dequeued but not yet warm.
    waking: HashMap<Guid, WakeRequest>,
    /// Documents holding a warm slot.
    warm: HashSet<Guid>,
    next_seq: u64,
}

impl WakeQueue {
    /// Create a queue allowing `max_concurrent_warm` warm documents and at
    /// most `max_queued` waiting requests.
    pub fn new(max_concurrent_warm: usize, max_queued: usize) -> Self {
        Self {
            max_concurrent_warm,
            max_queued,
            queue: BTreeMap::new(),
            index: HashMap::new(),
            waking: HashMap::new(),
            warm: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Add a request, or raise the priority of a queued one.
    ///
    /// Priorities only increase. An upgraded request keeps its arrival
    /// order. Requests for warm or waking documents are no-ops.
    pub fn enqueue(
        &mut self,
        guid: Guid,
        priority: WakePriority,
    ) -> Result<Enqueued, WakeQueueError> {
        if self.warm.contains(&guid) || self.waking.contains_key(&guid) {
            return Ok(Enqueued::AlreadyWarm);
        }
        if let Some(&(Reverse(current), seq)) = self.index.get(&guid) {
            if priority <= current {
                return Ok(Enqueued::Unchanged);
            }
            self.queue.remove(&(Reverse(current), seq));
            self.insert(guid, priority, seq);
            return Ok(Enqueued::Upgraded);
        }
        if self.queue.len() >= self.max_queued {
            return Err(WakeQueueError::Full {
                capacity: self.max_queued,
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert(guid, priority, seq);
        Ok(Enqueued::Queued)
    }

    fn insert(&mut self, guid: Guid, priority: WakePriority, seq: u64) {
        let key = (Reverse(priority), seq);
        self.queue.insert(key, guid.clone());
        self.index.insert(guid, key);
    }

    /// Take the best request if a warm slot is free.
    ///
    /// The request is tracked as waking until `complete` or `fail`.
    pub fn dequeue(&mut self) -> Option<WakeRequest> {
        if self.occupied() >= self.max_concurrent_warm {
            return None;
        }
        let ((Reverse(priority), seq), guid) = self.queue.pop_first()?;
        self.index.remove(&guid);
        let request = WakeRequest {
            guid: guid.clone(),
            priority,
            seq,
        };
        self.waking.insert(guid, request.clone());
        Some(request)
    }

    /// A waking document finished waking and now holds a slot.
    pub fn complete(&mut self, guid: &Guid) -> bool {
        if self.waking.remove(guid).is_some() {
            self.warm.insert(guid.clone());
            true
        } else {
            false
        }
    }

    /// A wake failed: requeue the request with its original order.
    pub fn fail(&mut self, guid: &Guid) {
        if let Some(request) = self.waking.remove(guid) {
            self.insert(request.guid, request.priority, request.seq);
        }
    }

    /// Count a document as warm without queueing (direct wakes).
    ///
    /// Any queued request for it is dropped. Direct wakes may exceed the
    /// slot bound; queued wakes then wait until enough slots free up.
    pub fn admit(&mut self, guid: &Guid) {
        self.drop_queued(guid);
        self.waking.remove(guid);
        self.warm.insert(guid.clone());
    }

    /// A document hibernated: free its slot.
    pub fn release(&mut self, guid: &Guid) -> bool {
        self.warm.remove(guid) || self.waking.remove(guid).is_some()
    }

    /// Forget a document everywhere.
    pub fn remove(&mut self, guid: &Guid) {
        self.drop_queued(guid);
        self.waking.remove(guid);
        self.warm.remove(guid);
    }

    fn drop_queued(&mut self, guid: &Guid) {
        if let Some(key) = self.index.remove(guid) {
            self.queue.remove(&key);
        }
    }

    /// Check if a request for `guid` is waiting.
    pub fn is_queued(&self, guid: &Guid) -> bool {
        self.index.contains_key(guid)
    }

    /// Check if `guid` is waking.
    pub fn is_waking(&self, guid: &Guid) -> bool {
        self.waking.contains_key(guid)
    }

    /// Check if `guid` holds a warm slot.
    pub fn is_warm(&self, guid: &Guid) -> bool {
        self.warm.contains(guid)
    }

    /// Priority of the queued request for `guid`.
    pub fn priority_of(&self, guid: &Guid) -> Option<WakePriority> {
        self.index.get(guid).map(|(Reverse(priority), _)| *priority)
    }

    /// Number of waiting requests.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if no request is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Slots held by warm and waking documents.
    pub fn occupied(&self) -> usize {
        self.warm.len() + self.waking.len()
    }

    /// Slots still free.
    pub fn available(&self) -> usize {
        self.max_concurrent_warm.saturating_sub(self.occupied())
    }

    /// Configured warm-slot bound.
    pub fn max_concurrent_warm(&self) -> usize {
        self.max_concurrent_warm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(name: &str) -> Guid {
        Guid::new(name)
    }

    fn drain(queue: &mut WakeQueue) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(request) = queue.dequeue() {
            out.push(request.guid.to_string());
        }
        out
    }

    #[test]
    fn dequeues_by_priority_then_arrival() {
        let mut queue = WakeQueue::new(10, 100);
        queue.enqueue(guid("a"), WakePriority::Low).unwrap();
        queue.enqueue(guid("b"), WakePriority::High).unwrap();
        queue.enqueue(guid("c"), WakePriority::Normal).unwrap();
        queue.enqueue(guid("d"), WakePriority::High).unwrap();

        assert_eq!(drain(&mut queue), vec!["b", "d", "c", "a"]);
    }

    #[test]
    fn second_enqueue_upgrades_in_place() {
        let mut queue = WakeQueue::new(10, 100);
        queue.enqueue(guid("x"), WakePriority::Low).unwrap();
        queue.enqueue(guid("y"), WakePriority::High).unwrap();

        let outcome = queue.enqueue(guid("x"), WakePriority::High).unwrap();
        assert_eq!(outcome, Enqueued::Upgraded);
        assert_eq!(queue.len(), 2);

        // x arrived first, so it wins the tie
        assert_eq!(drain(&mut queue), vec!["x", "y"]);
    }

    #[test]
    fn priority_never_decreases() {
        let mut queue = WakeQueue::new(10, 100);
        queue.enqueue(guid("x"), WakePriority::High).unwrap();
        let outcome = queue.enqueue(guid("x"), WakePriority::Low).unwrap();

        assert_eq!(outcome, Enqueued::Unchanged);
        assert_eq!(queue.priority_of(&guid("x")), Some(WakePriority::High));
    }

    #[test]
    fn warm_documents_are_not_requeued() {
        let mut queue = WakeQueue::new(10, 100);
        queue.enqueue(guid("x"), WakePriority::Low).unwrap();
        queue.dequeue().unwrap();

        // Waking
        assert_eq!(
            queue.enqueue(guid("x"), WakePriority::High).unwrap(),
            Enqueued::AlreadyWarm
        );

        queue.complete(&guid("x"));
        assert_eq!(
            queue.enqueue(guid("x"), WakePriority::High).unwrap(),
            Enqueued::AlreadyWarm
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn releasing_a_warm_slot_lets_the_next_request_wake() {
        let mut queue = WakeQueue::new(1, 100);
        queue.enqueue(guid("a"), WakePriority::Low).unwrap();
        let a = queue.dequeue().unwrap();
        queue.complete(&a.guid);

        queue.enqueue(guid("b"), WakePriority::High).unwrap();
        assert!(queue.dequeue().is_none());

        assert!(queue.release(&guid("a")));
        let b = queue.dequeue().unwrap();
        assert_eq!(b.guid, guid("b"));
    }

    #[test]
    fn waking_counts_toward_capacity() {
        let mut queue = WakeQueue::new(1, 100);
        queue.enqueue(guid("a"), WakePriority::Normal).unwrap();
        queue.enqueue(guid("b"), WakePriority::Normal).unwrap();

        let _ = queue.dequeue().unwrap();
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.available(), 0);
    }

    #[test]
    fn failed_wake_is_retried_first() {
        let mut queue = WakeQueue::new(1, 100);
        queue.enqueue(guid("a"), WakePriority::Normal).unwrap();
        queue.enqueue(guid("b"), WakePriority::Normal).unwrap();

        let a = queue.dequeue().unwrap();
        queue.fail(&a.guid);

        assert!(queue.is_queued(&guid("a")));
        assert_eq!(queue.dequeue().unwrap().guid, guid("a"));
    }

    #[test]
    fn queue_respects_max_queued() {
        let mut queue = WakeQueue::new(1, 2);
        queue.enqueue(guid("a"), WakePriority::Low).unwrap();
        queue.enqueue(guid("b"), WakePriority::Low).unwrap();

        let overflow = queue.enqueue(guid("c"), WakePriority::High);
        assert_eq!(overflow, Err(WakeQueueError::Full { capacity: 2 }));

        // Upgrades still work when full
        assert_eq!(
            queue.enqueue(guid("a"), WakePriority::High).unwrap(),
            Enqueued::Upgraded
        );
    }

    #[test]
    fn admit_drops_queued_request() {
        let mut queue = WakeQueue::new(2, 100);
        queue.enqueue(guid("a"), WakePriority::Low).unwrap();
        queue.admit(&guid("a"));

        assert!(!queue.is_queued(&guid("a")));
        assert!(queue.is_warm(&guid("a")));
        assert_eq!(queue.occupied(), 1);
    }

    #[test]
    fn remove_forgets_everything() {
        let mut queue = WakeQueue::new(2, 100);
        queue.enqueue(guid("a"), WakePriority::Low).unwrap();
        queue.admit(&guid("b"));
        queue.remove(&guid("a"));
        queue.remove(&guid("b"));

        assert!(queue.is_empty());
        assert_eq!(queue.occupied(), 0);
    }
}
