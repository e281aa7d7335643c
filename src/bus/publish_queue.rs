//! Backlog of publish requests waiting for a publishing channel

use crate::error::BusResult;
use crate::transport::PublishOptions;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Completion callback for one raised event, invoked exactly once
pub type AfterRaised = Box<dyn FnOnce(BusResult<()>) + Send + 'static>;

/// Which end of the backlog the drain loop takes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainOrder {
    /// Most recently enqueued first
    #[default]
    Lifo,
    /// Submission order
    Fifo,
}

/// One event waiting to be published
pub struct PublishRequest {
    pub exchange: String,
    /// The caller-supplied event identifier
    pub routing_key: String,
    pub payload: Bytes,
    pub options: Option<PublishOptions>,
    after_raised: AfterRaised,
}

impl PublishRequest {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Bytes,
        options: Option<PublishOptions>,
        after_raised: AfterRaised,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            options,
            after_raised,
        }
    }

    /// Consume the request and report its outcome to the caller
    pub fn complete(self, result: BusResult<()>) {
        (self.after_raised)(result)
    }
}

impl fmt::Debug for PublishRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishRequest")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Result of a successful enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub depth: usize,
    /// True only for the enqueue that took the depth to or past the threshold
    pub crossed_threshold: bool,
}

#[derive(Default)]
struct Backlog {
    items: VecDeque<PublishRequest>,
    closed: bool,
    over_threshold: bool,
}

/// Shared backlog; appended from callers, drained by the orchestrator
pub struct PublishQueue {
    max_depth: usize,
    inner: Mutex<Backlog>,
}

impl PublishQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            inner: Mutex::new(Backlog::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Backlog> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Append to the tail. Hands the request back if the queue has been closed.
    pub fn enqueue(&self, request: PublishRequest) -> Result<EnqueueOutcome, PublishRequest> {
        let mut backlog = self.lock();
        if backlog.closed {
            return Err(request);
        }

        backlog.items.push_back(request);
        let depth = backlog.items.len();
        let at_or_over = depth >= self.max_depth;
        let crossed_threshold = at_or_over && !backlog.over_threshold;
        backlog.over_threshold = at_or_over;

        Ok(EnqueueOutcome {
            depth,
            crossed_threshold,
        })
    }

    pub fn pop(&self, order: DrainOrder) -> Option<PublishRequest> {
        let mut backlog = self.lock();
        let request = match order {
            DrainOrder::Lifo => backlog.items.pop_back(),
            DrainOrder::Fifo => backlog.items.pop_front(),
        };
        if backlog.items.len() < self.max_depth {
            backlog.over_threshold = false;
        }
        request
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further requests and hand back everything still queued
    pub fn close(&self) -> Vec<PublishRequest> {
        let mut backlog = self.lock();
        backlog.closed = true;
        backlog.over_threshold = false;
        backlog.items.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Warning text for a backlog at or above its maximum depth
pub fn backlog_warning(depth: usize, max: usize) -> String {
    format!("{depth} events queued is greater than or equal to max of {max}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;
    use std::sync::Arc;

    fn request(id: &str) -> PublishRequest {
        PublishRequest::new("events", id, Bytes::from_static(b"{}"), None, Box::new(|_| {}))
    }

    fn drain_ids(queue: &PublishQueue, order: DrainOrder) -> Vec<String> {
        std::iter::from_fn(|| queue.pop(order))
            .map(|r| r.routing_key)
            .collect()
    }

    #[test]
    fn test_lifo_drains_tail_first() {
        let queue = PublishQueue::new(100);
        for id in ["a", "b", "c"] {
            queue.enqueue(request(id)).unwrap();
        }
        assert_eq!(drain_ids(&queue, DrainOrder::Lifo), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_fifo_drains_in_submission_order() {
        let queue = PublishQueue::new(100);
        for id in ["a", "b", "c"] {
            queue.enqueue(request(id)).unwrap();
        }
        assert_eq!(drain_ids(&queue, DrainOrder::Fifo), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_threshold_crossing_reported_once() {
        let queue = PublishQueue::new(2);

        let first = queue.enqueue(request("a")).unwrap();
        let second = queue.enqueue(request("b")).unwrap();
        let third = queue.enqueue(request("c")).unwrap();

        assert!(!first.crossed_threshold);
        assert_eq!(
            second,
            EnqueueOutcome {
                depth: 2,
                crossed_threshold: true
            }
        );
        assert!(!third.crossed_threshold);
    }

    #[test]
    fn test_threshold_rearms_after_draining_below_max() {
        let queue = PublishQueue::new(2);
        queue.enqueue(request("a")).unwrap();
        assert!(queue.enqueue(request("b")).unwrap().crossed_threshold);

        queue.pop(DrainOrder::Lifo);
        assert!(queue.enqueue(request("c")).unwrap().crossed_threshold);
    }

    #[test]
    fn test_closed_queue_refuses_and_returns_pending() {
        let queue = PublishQueue::new(10);
        queue.enqueue(request("a")).unwrap();
        queue.enqueue(request("b")).unwrap();

        let pending = queue.close();
        assert_eq!(pending.len(), 2);
        assert!(queue.is_closed());
        assert!(queue.is_empty());

        let refused = queue.enqueue(request("c")).unwrap_err();
        assert_eq!(refused.routing_key, "c");
    }

    #[test]
    fn test_complete_invokes_callback_once() {
        let results = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = results.clone();
        let request = PublishRequest::new(
            "events",
            "id",
            Bytes::new(),
            None,
            Box::new(move |result| sink.lock().unwrap().push(result.is_ok())),
        );

        request.complete(Err(BusError::Closed));
        assert_eq!(*results.lock().unwrap(), vec![false]);
    }

    #[test]
    fn test_backlog_warning_text() {
        assert_eq!(
            backlog_warning(2, 2),
            "2 events queued is greater than or equal to max of 2"
        );
    }
}
