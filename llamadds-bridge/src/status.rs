//! Periodic server-health heartbeat.
//!
//! Deliberately its own thread: folding status into the reader or driver
//! loops would couple heartbeat jitter to request load. The topic is
//! best-effort, so a missed or lost tick costs nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use crate::bridge::{Bridge, StatusSink};
use crate::BridgeError;

/// Sleep slice between stop-flag checks while waiting out the period.
const TICK: Duration = Duration::from_millis(100);

pub struct StatusPublisher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StatusPublisher {
    pub fn spawn(
        bridge: Arc<Bridge>,
        sink: Arc<dyn StatusSink>,
        period: Duration,
    ) -> Result<Self, BridgeError> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("status-publisher".into())
                .spawn(move || run(bridge, sink, period, stop))
                .map_err(|source| BridgeError::SpawnThread {
                    name: "status-publisher",
                    source,
                })?
        };
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop and join the publisher thread. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StatusPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(bridge: Arc<Bridge>, sink: Arc<dyn StatusSink>, period: Duration, stop: Arc<AtomicBool>) {
    info!(period_secs = period.as_secs_f32(), "status publisher started");
    'outer: loop {
        // Sleep the period in short slices so shutdown never waits out a
        // full heartbeat interval.
        let mut slept = Duration::ZERO;
        while slept < period {
            if stop.load(Ordering::Acquire) {
                break 'outer;
            }
            let slice = TICK.min(period - slept);
            std::thread::sleep(slice);
            slept += slice;
        }
        if stop.load(Ordering::Acquire) {
            break;
        }
        let status = bridge.status_snapshot();
        debug!(
            slots_idle = status.slots_idle,
            slots_processing = status.slots_processing,
            ready = status.ready,
            "publishing status"
        );
        sink.publish_status(&status);
    }
    info!("status publisher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ResponseSink;
    use crate::intake::IntakeQueue;
    use llamadds::{ChatCompletionResponse, ServerStatus};
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct StatusCollector {
        statuses: Mutex<Vec<ServerStatus>>,
    }

    impl StatusSink for StatusCollector {
        fn publish_status(&self, status: &ServerStatus) {
            self.statuses
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(status.clone());
        }
    }

    struct NullSink;

    impl ResponseSink for NullSink {
        fn send_response(&self, _resp: &ChatCompletionResponse) {}
    }

    #[test]
    fn publishes_snapshots_and_stops_promptly() {
        let bridge = Arc::new(Bridge::new(
            "status-test",
            Arc::new(IntakeQueue::new()),
            Arc::new(NullSink),
        ));
        bridge.set_model_info("loopback", true, 4);

        let collector = Arc::new(StatusCollector::default());
        let mut publisher = StatusPublisher::spawn(
            Arc::clone(&bridge),
            Arc::clone(&collector) as Arc<dyn StatusSink>,
            Duration::from_millis(50),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        let stop_started = Instant::now();
        publisher.stop();
        assert!(stop_started.elapsed() < Duration::from_secs(1));

        let statuses = collector.statuses.lock().unwrap();
        assert!(!statuses.is_empty(), "expected at least one heartbeat");
        for status in statuses.iter() {
            assert_eq!(status.server_id, "status-test");
            assert_eq!(status.slots_idle + status.slots_processing, 4);
            assert!(status.ready);
        }
    }
}
