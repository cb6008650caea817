//! The narrow contract the bridge drives the inference engine through.
//!
//! The engine is an external collaborator; the bridge only needs a task-id
//! source, a waiting-set with register/unregister, submit, and a timed
//! receive yielding a stream of partial results terminated by exactly one
//! final or error result. Anything that satisfies [`CompletionEngine`] can
//! sit behind the bridge.

mod loopback;
mod template;

use std::time::Duration;

use thiserror::Error;

pub use loopback::{LoopbackEngine, LoopbackEngineBuilder};
pub use template::{fallback_prompt, ChatTemplate};

/// Token id in the engine's vocabulary.
pub type Token = i32;

/// Identifier of a submitted completion task.
pub type TaskId = i64;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to render chat template: {reason}")]
    Template { reason: String },

    #[error("failed to tokenize prompt: {reason}")]
    Tokenize { reason: String },

    #[error("engine is shutting down")]
    Shutdown,

    #[error("failed to spawn scheduler thread")]
    SpawnScheduler {
        #[source]
        source: std::io::Error,
    },
}

/// Sampling parameters forwarded from the request, with engine defaults
/// already merged in.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: Option<f32>,
    /// Number of choices; engines without multi-choice support serve one.
    pub n_choices: i32,
    pub stop: Vec<String>,
}

/// One unit of work for the engine scheduler.
#[derive(Debug, Clone)]
pub struct CompletionTask {
    pub id: TaskId,
    pub tokens: Vec<Token>,
    pub n_predict: i32,
    pub sampling: SamplingParams,
}

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// End-of-sequence token.
    Eos,
    /// Token budget exhausted.
    Limit,
    /// A stop sequence matched.
    Word,
}

/// One element of a task's result stream.
///
/// A well-behaved engine produces zero or more `Partial`s followed by
/// exactly one `Final` or one `Error`. Token counters are monotonically
/// non-decreasing along the stream.
#[derive(Debug, Clone)]
pub enum TaskResult {
    Partial {
        /// Newly generated text since the previous result.
        content: String,
        prompt_tokens: i32,
        completion_tokens: i32,
    },
    Final {
        /// Remaining delta not yet carried by a partial; may be empty.
        content: String,
        prompt_tokens: i32,
        completion_tokens: i32,
        stop: StopKind,
    },
    Error { message: String },
}

/// Defaults applied when a request leaves a sampling field unset.
#[derive(Debug, Clone, Copy)]
pub struct EngineDefaults {
    pub n_predict: i32,
    pub temperature: f32,
}

/// The submit-and-stream surface of the engine scheduler.
///
/// The waiting-set discipline matters: a task id must be registered
/// **before** the task is submitted so a result produced between submission
/// and the first receive is retained rather than discarded, and unregistered
/// when the bridge stops consuming so late results are dropped.
pub trait CompletionEngine: Send + Sync {
    fn model_name(&self) -> String;

    /// Template registered for the loaded model, if any; the bridge falls
    /// back to a generic role-tagged wrapper otherwise.
    fn chat_template(&self) -> Option<&ChatTemplate>;

    fn tokenize(&self, prompt: &str) -> Result<Vec<Token>, EngineError>;

    fn defaults(&self) -> EngineDefaults;

    /// Mint a fresh task id.
    fn next_task_id(&self) -> TaskId;

    /// Add a task id to the waiting-results set.
    fn register(&self, task_id: TaskId);

    /// Remove a task id from the waiting-results set, discarding any
    /// undelivered results.
    fn unregister(&self, task_id: TaskId);

    /// Hand a task to the scheduler.
    fn submit(&self, task: CompletionTask) -> Result<(), EngineError>;

    /// Receive the next result for a registered task, waiting at most
    /// `timeout`. `None` means no result arrived in time.
    fn recv_timeout(&self, task_id: TaskId, timeout: Duration) -> Option<TaskResult>;
}
