//! Correlation and bookkeeping between intake and the outbound topics.
//!
//! [`Bridge`] joins the pieces the other components need to share: the
//! intake queue, the model-state snapshot used by the status publisher, and
//! the response sink. Terminal responses pass through [`Bridge::send_response`]
//! so the in-flight decrement happens exactly once per request, on every
//! exit path the adapter has.

use std::sync::{Arc, Mutex};

use llamadds::{ChatCompletionRequest, ChatCompletionResponse, DdsServer, ServerStatus};
use tracing::debug;

use crate::intake::IntakeQueue;

/// Outbound response channel; implemented by the DDS transport and by test
/// collectors.
pub trait ResponseSink: Send + Sync {
    fn send_response(&self, resp: &ChatCompletionResponse);
}

/// Outbound status channel, same seam as [`ResponseSink`].
pub trait StatusSink: Send + Sync {
    fn publish_status(&self, status: &ServerStatus);
}

impl ResponseSink for DdsServer {
    fn send_response(&self, resp: &ChatCompletionResponse) {
        DdsServer::send_response(self, resp);
    }
}

impl StatusSink for DdsServer {
    fn publish_status(&self, status: &ServerStatus) {
        DdsServer::publish_status(self, status);
    }
}

/// Model-state snapshot for status publishing; guarded by its own mutex so
/// status ticks never contend with the hot intake path.
struct ModelState {
    model_loaded: String,
    ready: bool,
    total_slots: i32,
}

pub struct Bridge {
    server_id: String,
    intake: Arc<IntakeQueue>,
    model: Mutex<ModelState>,
    responses: Arc<dyn ResponseSink>,
}

impl Bridge {
    pub fn new(
        server_id: impl Into<String>,
        intake: Arc<IntakeQueue>,
        responses: Arc<dyn ResponseSink>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            intake,
            model: Mutex::new(ModelState {
                model_loaded: String::new(),
                ready: false,
                total_slots: 1,
            }),
            responses,
        }
    }

    pub fn intake(&self) -> &IntakeQueue {
        &self.intake
    }

    /// Transport-facing request entry point.
    pub fn handle_request(&self, req: ChatCompletionRequest) {
        self.intake.handle_request(req);
    }

    /// Publish one response sample; a terminal sample also retires the
    /// request from the in-flight gauge.
    pub fn send_response(&self, resp: &ChatCompletionResponse) {
        if resp.is_final {
            self.intake.mark_complete();
            debug!(
                request_id = %resp.request_id,
                finish_reason = resp.finish_reason.as_deref().unwrap_or(""),
                "terminal response"
            );
        }
        self.responses.send_response(resp);
    }

    /// Update the model name, readiness and parallel-slot capacity reported
    /// on the status topic.
    pub fn set_model_info(&self, model_name: impl Into<String>, ready: bool, n_parallel: i32) {
        let mut model = self.model.lock().unwrap_or_else(|e| e.into_inner());
        model.model_loaded = model_name.into();
        model.ready = ready;
        model.total_slots = n_parallel.max(1);
    }

    /// Snapshot for one status tick: `slots_processing` is the in-flight
    /// count, `slots_idle` whatever capacity remains.
    pub fn status_snapshot(&self) -> ServerStatus {
        let in_flight = i32::try_from(self.intake.in_flight()).unwrap_or(i32::MAX);
        let model = self.model.lock().unwrap_or_else(|e| e.into_inner());
        ServerStatus {
            server_id: self.server_id.clone(),
            slots_idle: (model.total_slots - in_flight).max(0),
            slots_processing: in_flight,
            model_loaded: model.model_loaded.clone(),
            ready: model.ready,
        }
    }
}
