//! The engine adapter: drives staged requests through the engine and emits
//! responses.
//!
//! One polling thread waits on the intake queue with a short bound, pops
//! every staged request and runs it through the five-phase protocol:
//! template application, tokenization, task construction (register before
//! submit), result consumption against a per-request deadline, teardown.
//! Every accepted request produces exactly one terminal response; partial
//! write failures never abort a request, and on shutdown the remaining queue
//! is drained with terminal errors so no client is left waiting by the
//! bridge itself.

use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use llamadds::{ChatCompletionRequest, ChatCompletionResponse, FinishReason, Role};
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::engine::{
    fallback_prompt, CompletionEngine, CompletionTask, SamplingParams, StopKind, TaskResult,
};
use crate::BridgeError;

/// How long staged requests may wait before the driver re-checks shutdown.
const INTAKE_WAIT: Duration = Duration::from_millis(100);
/// Per-call bound on the engine receive; the request deadline spans calls.
const RESULT_POLL: Duration = Duration::from_secs(5);

pub struct EngineAdapter {
    thread: Option<JoinHandle<()>>,
}

impl EngineAdapter {
    /// Spawn the driver thread. It exits after `bridge.intake().shutdown()`.
    pub fn spawn(
        bridge: Arc<Bridge>,
        engine: Arc<dyn CompletionEngine>,
        request_timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let thread = std::thread::Builder::new()
            .name("engine-adapter".into())
            .spawn(move || drive(bridge, engine, request_timeout))
            .map_err(|source| BridgeError::SpawnThread {
                name: "engine-adapter",
                source,
            })?;
        Ok(Self {
            thread: Some(thread),
        })
    }

    /// Wait for the driver thread to finish; call after shutting down the
    /// intake queue.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EngineAdapter {
    fn drop(&mut self) {
        self.join();
    }
}

fn drive(bridge: Arc<Bridge>, engine: Arc<dyn CompletionEngine>, request_timeout: Duration) {
    info!("engine adapter started");
    while bridge.intake().is_running() {
        bridge.intake().wait_for_request(INTAKE_WAIT);
        // Re-check the running flag between requests so a shutdown hands the
        // rest of the queue to the error drain below instead of serving it.
        while bridge.intake().is_running() {
            let Some(req) = bridge.intake().pop_pending_request() else {
                break;
            };
            process_request(&bridge, engine.as_ref(), req, request_timeout);
        }
    }
    // Shutdown drain: everything still staged gets a terminal error so the
    // in-flight gauge returns to zero before the thread exits.
    while let Some(req) = bridge.intake().pop_pending_request() {
        let model = served_model(&req, engine.as_ref());
        send_error(&bridge, &req, model, "[shutdown] server is stopping".into());
    }
    info!("engine adapter stopped");
}

fn served_model(req: &ChatCompletionRequest, engine: &dyn CompletionEngine) -> String {
    if req.model.is_empty() {
        engine.model_name()
    } else {
        req.model.clone()
    }
}

fn send_error(bridge: &Bridge, req: &ChatCompletionRequest, model: String, content: String) {
    bridge.send_response(&ChatCompletionResponse {
        request_id: req.request_id.clone(),
        model,
        content,
        finish_reason: Some(FinishReason::Error.to_string()),
        is_final: true,
        prompt_tokens: 0,
        completion_tokens: 0,
    });
}

fn process_request(
    bridge: &Bridge,
    engine: &dyn CompletionEngine,
    req: ChatCompletionRequest,
    request_timeout: Duration,
) {
    debug!(request_id = %req.request_id, stream = req.stream, "processing request");
    let model = served_model(&req, engine);

    // Phase 1: validation and template application.
    if req.messages.is_empty() {
        send_error(bridge, &req, model, "request has no messages".into());
        return;
    }
    if let Some(msg) = req
        .messages
        .iter()
        .find(|m| Role::from_str(&m.role).is_err())
    {
        send_error(bridge, &req, model, format!("unknown role '{}'", msg.role));
        return;
    }
    let prompt = match engine.chat_template() {
        Some(template) => match template.apply(&req.messages, true) {
            Ok(prompt) => prompt,
            Err(e) => {
                send_error(bridge, &req, model, e.to_string());
                return;
            }
        },
        None => fallback_prompt(&req.messages),
    };

    // Phase 2: tokenization. An empty token vector cannot be scheduled.
    let tokens = match engine.tokenize(&prompt) {
        Ok(tokens) if !tokens.is_empty() => tokens,
        Ok(_) => {
            send_error(bridge, &req, model, "prompt tokenized to nothing".into());
            return;
        }
        Err(e) => {
            send_error(bridge, &req, model, e.to_string());
            return;
        }
    };

    // Phase 3: task construction, with request fields overriding engine
    // defaults only when the request actually set them.
    let defaults = engine.defaults();
    let task_id = engine.next_task_id();
    let task = CompletionTask {
        id: task_id,
        tokens,
        n_predict: if req.max_tokens > 0 {
            req.max_tokens
        } else {
            defaults.n_predict
        },
        sampling: SamplingParams {
            temperature: if req.temperature > 0.0 {
                req.temperature
            } else {
                defaults.temperature
            },
            top_p: req.top_p.filter(|v| *v > 0.0 && *v < 1.0),
            n_choices: req.n.unwrap_or(1).max(1),
            stop: req.stop.clone().unwrap_or_default(),
        },
    };
    // Registered before submission so a result produced before the first
    // receive is retained.
    engine.register(task_id);
    if let Err(e) = engine.submit(task) {
        engine.unregister(task_id);
        send_error(bridge, &req, model, e.to_string());
        return;
    }

    // Phase 4: consume the result stream until final, error, or deadline.
    let deadline = Instant::now() + request_timeout;
    let mut accumulated = String::new();
    let mut prompt_tokens = 0;
    let mut completion_tokens = 0;
    let outcome = loop {
        if Instant::now() >= deadline {
            warn!(
                request_id = %req.request_id,
                timeout_secs = request_timeout.as_secs(),
                "deadline expired before a final result"
            );
            break Outcome::Timeout;
        }
        let Some(result) = engine.recv_timeout(task_id, RESULT_POLL) else {
            continue;
        };
        match result {
            TaskResult::Partial {
                content,
                prompt_tokens: p,
                completion_tokens: c,
            } => {
                prompt_tokens = p;
                completion_tokens = c;
                if req.stream {
                    // Streamed deltas go out immediately; an empty delta
                    // carries no information and is skipped.
                    if !content.is_empty() {
                        bridge.send_response(&ChatCompletionResponse {
                            request_id: req.request_id.clone(),
                            model: model.clone(),
                            content,
                            finish_reason: None,
                            is_final: false,
                            prompt_tokens,
                            completion_tokens,
                        });
                    }
                } else {
                    accumulated.push_str(&content);
                }
            }
            TaskResult::Final {
                content,
                prompt_tokens: p,
                completion_tokens: c,
                stop,
            } => {
                prompt_tokens = p;
                completion_tokens = c;
                break Outcome::Finished {
                    last_delta: content,
                    stop,
                };
            }
            TaskResult::Error { message } => break Outcome::Failed(message),
        }
    };

    // Phase 5: terminal emission and teardown. The in-flight decrement rides
    // the terminal send inside the bridge.
    let terminal = match outcome {
        Outcome::Finished { last_delta, stop } => {
            let finish_reason = match stop {
                StopKind::Eos => FinishReason::Stop,
                StopKind::Limit => FinishReason::Length,
                // Richer stop kinds collapse into "stop" for now.
                StopKind::Word => FinishReason::Stop,
            };
            let content = if req.stream {
                last_delta
            } else {
                accumulated.push_str(&last_delta);
                accumulated
            };
            ChatCompletionResponse {
                request_id: req.request_id.clone(),
                model,
                content,
                finish_reason: Some(finish_reason.to_string()),
                is_final: true,
                prompt_tokens,
                completion_tokens,
            }
        }
        Outcome::Failed(message) => ChatCompletionResponse {
            request_id: req.request_id.clone(),
            model,
            content: format!("[error] {message}"),
            finish_reason: Some(FinishReason::Error.to_string()),
            is_final: true,
            prompt_tokens,
            completion_tokens,
        },
        Outcome::Timeout => ChatCompletionResponse {
            request_id: req.request_id.clone(),
            model,
            content: format!(
                "[timeout] no final result within {}s",
                request_timeout.as_secs()
            ),
            finish_reason: Some(FinishReason::Error.to_string()),
            is_final: true,
            prompt_tokens,
            completion_tokens,
        },
    };
    bridge.send_response(&terminal);
    engine.unregister(task_id);
}

enum Outcome {
    Finished { last_delta: String, stop: StopKind },
    Failed(String),
    Timeout,
}
