//! Thread-safe request intake between the transport reader thread and the
//! engine driver.
//!
//! The map owns a request exclusively from intake to pop; the in-flight
//! counter stays up until the terminal response for that request is emitted
//! (see [`IntakeQueue::mark_complete`]), so at quiescence the counter equals
//! the map size (both zero) and in between it may exceed it by the number of
//! requests currently being processed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use llamadds::ChatCompletionRequest;
use tracing::{debug, warn};

#[derive(Default)]
pub struct IntakeQueue {
    pending: Mutex<HashMap<String, ChatCompletionRequest>>,
    cv: Condvar,
    in_flight: AtomicI64,
    running: AtomicBool,
}

impl IntakeQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
            in_flight: AtomicI64::new(0),
            running: AtomicBool::new(true),
        }
    }

    /// Stage a request for the engine driver and wake it.
    ///
    /// Called from the transport reader thread. Requests without a
    /// correlation id are dropped (there would be no way to respond).
    /// A duplicate id that is still pending replaces the staged request
    /// without a second counter increment: one entry, one terminal response,
    /// one decrement.
    ///
    /// Late samples during shutdown are still accepted; the driver drains
    /// them with terminal error responses on its way out.
    pub fn handle_request(&self, req: ChatCompletionRequest) {
        if req.request_id.is_empty() {
            warn!("dropping request with empty request_id");
            return;
        }
        let request_id = req.request_id.clone();
        let replaced = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(request_id.clone(), req).is_some()
        };
        if !replaced {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        debug!(request_id = %request_id, replaced, "request queued");
        self.cv.notify_one();
    }

    /// Move an arbitrary pending request out of the map.
    ///
    /// Selection is deliberately unordered; fairness comes from the engine's
    /// own scheduler, and strict FIFO here would head-of-line block when the
    /// engine has multiple slots.
    pub fn pop_pending_request(&self) -> Option<ChatCompletionRequest> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let key = pending.keys().next().cloned()?;
        pending.remove(&key)
    }

    /// Block until a request is staged, the queue shuts down, or the timeout
    /// elapses. Returns whether requests are pending; spurious wakeups are
    /// possible and callers re-check by popping.
    pub fn wait_for_request(&self, timeout: Duration) -> bool {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let (pending, _) = self
            .cv
            .wait_timeout_while(pending, timeout, |map| {
                map.is_empty() && self.running.load(Ordering::Acquire)
            })
            .unwrap_or_else(|e| e.into_inner());
        !pending.is_empty()
    }

    pub fn has_pending_requests(&self) -> bool {
        !self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Number of requests accepted but not yet terminally answered.
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Record the terminal response for one request.
    ///
    /// Exactly one call per accepted request; clamped at zero so a stray
    /// extra terminal (durable replay) cannot drive the gauge negative.
    pub fn mark_complete(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v > 0).then(|| v - 1)
            });
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clear the running flag and wake every waiter.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llamadds::{ChatMessage, Role};
    use std::sync::Arc;
    use std::time::Instant;

    fn request(id: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            request_id: id.into(),
            messages: vec![ChatMessage::new(Role::User, "hi")],
            ..Default::default()
        }
    }

    #[test]
    fn push_pop_tracks_in_flight() {
        let q = IntakeQueue::new();
        q.handle_request(request("a"));
        q.handle_request(request("b"));
        assert_eq!(q.in_flight(), 2);
        assert!(q.has_pending_requests());

        let first = q.pop_pending_request().unwrap();
        let second = q.pop_pending_request().unwrap();
        assert!(q.pop_pending_request().is_none());
        let mut ids = [first.request_id, second.request_id];
        ids.sort();
        assert_eq!(ids, ["a".to_string(), "b".to_string()]);

        // Counter stays up until the terminal responses are recorded.
        assert_eq!(q.in_flight(), 2);
        q.mark_complete();
        q.mark_complete();
        assert_eq!(q.in_flight(), 0);
    }

    #[test]
    fn empty_request_id_is_dropped() {
        let q = IntakeQueue::new();
        q.handle_request(request(""));
        assert!(!q.has_pending_requests());
        assert_eq!(q.in_flight(), 0);
    }

    #[test]
    fn duplicate_pending_id_replaces_without_double_count() {
        let q = IntakeQueue::new();
        q.handle_request(request("dup"));
        let mut updated = request("dup");
        updated.max_tokens = 99;
        q.handle_request(updated);
        assert_eq!(q.in_flight(), 1);
        assert_eq!(q.pop_pending_request().unwrap().max_tokens, 99);
        assert!(q.pop_pending_request().is_none());
    }

    #[test]
    fn mark_complete_clamps_at_zero() {
        let q = IntakeQueue::new();
        q.mark_complete();
        assert_eq!(q.in_flight(), 0);
    }

    #[test]
    fn wait_returns_on_timeout() {
        let q = IntakeQueue::new();
        let start = Instant::now();
        assert!(!q.wait_for_request(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wait_wakes_on_request() {
        let q = Arc::new(IntakeQueue::new());
        let pusher = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                q.handle_request(request("wake"));
            })
        };
        assert!(q.wait_for_request(Duration::from_secs(5)));
        pusher.join().unwrap();
    }

    #[test]
    fn wait_wakes_on_shutdown() {
        let q = Arc::new(IntakeQueue::new());
        let stopper = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                q.shutdown();
            })
        };
        let start = Instant::now();
        assert!(!q.wait_for_request(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(4));
        stopper.join().unwrap();
    }
}
