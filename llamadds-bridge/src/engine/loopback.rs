//! Deterministic in-process engine for exercising the messaging plane.
//!
//! Generation "parrots" the prompt: every whitespace word becomes one
//! generated piece, up to the token budget. That makes the output a pure
//! function of the input, which is what the transport smoke tests and the
//! streaming-concatenation property need. The scheduler runs on one worker
//! thread consuming a task queue, and results flow through a waiting-set hub
//! with the same register-before-submit discipline a real engine queue has.
//!
//! Builder knobs pace or break generation on purpose: `token_delay` makes
//! deadline handling observable, `error_after` injects a mid-stream engine
//! failure.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{
    ChatTemplate, CompletionEngine, CompletionTask, EngineDefaults, EngineError, StopKind, TaskId,
    TaskResult, Token,
};

// ── Waiting-set result hub ────────────────────────────────────────────────────

/// Per-task result queues keyed by registered task id.
///
/// Results for ids that were never registered, or were unregistered while
/// generation was still running, are dropped on push. That is the point of
/// the waiting set: registering before submission guarantees nothing
/// produced between submit and the first receive is lost, and unregistering
/// stops delivery without stopping the scheduler.
#[derive(Default)]
struct ResultHub {
    state: Mutex<HashMap<TaskId, VecDeque<TaskResult>>>,
    cv: Condvar,
}

impl ResultHub {
    fn register(&self, task_id: TaskId) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(task_id)
            .or_default();
    }

    fn unregister(&self, task_id: TaskId) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
        self.cv.notify_all();
    }

    fn push(&self, task_id: TaskId, result: TaskResult) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.get_mut(&task_id) {
            Some(queue) => {
                queue.push_back(result);
                self.cv.notify_all();
            }
            None => debug!(task_id, "result for unregistered task dropped"),
        }
    }

    fn recv_timeout(&self, task_id: TaskId, timeout: Duration) -> Option<TaskResult> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match state.get_mut(&task_id) {
                None => return None,
                Some(queue) => {
                    if let Some(result) = queue.pop_front() {
                        return Some(result);
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }
}

// ── Vocabulary ────────────────────────────────────────────────────────────────

/// Interning table; token ids are indices into `words`.
#[derive(Default)]
struct Vocab {
    ids: HashMap<String, Token>,
    words: Vec<String>,
}

impl Vocab {
    fn intern(&mut self, word: &str) -> Token {
        if let Some(&id) = self.ids.get(word) {
            return id;
        }
        let id = self.words.len() as Token;
        self.ids.insert(word.to_owned(), id);
        self.words.push(word.to_owned());
        id
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

struct QueueState {
    tasks: VecDeque<CompletionTask>,
    running: bool,
}

struct Inner {
    model_name: String,
    defaults: EngineDefaults,
    chat_template: Option<ChatTemplate>,
    token_delay: Duration,
    error_after: Option<usize>,
    vocab: Mutex<Vocab>,
    next_task_id: AtomicI64,
    queue: Mutex<QueueState>,
    queue_cv: Condvar,
    results: ResultHub,
}

impl Inner {
    fn queue_running(&self) -> bool {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).running
    }

    fn run_task(&self, task: CompletionTask) {
        let words: Vec<String> = {
            let vocab = self.vocab.lock().unwrap_or_else(|e| e.into_inner());
            task.tokens
                .iter()
                .filter_map(|&t| vocab.words.get(t as usize).cloned())
                .collect()
        };
        let prompt_tokens = task.tokens.len() as i32;
        let budget = task.n_predict.max(1) as usize;

        let mut pieces: Vec<String> = words
            .iter()
            .enumerate()
            .map(|(i, w)| if i == 0 { w.clone() } else { format!(" {w}") })
            .collect();
        let mut stop = if pieces.len() > budget {
            StopKind::Limit
        } else {
            StopKind::Eos
        };
        pieces.truncate(budget);
        if let Some(idx) = words
            .iter()
            .take(pieces.len())
            .position(|w| task.sampling.stop.iter().any(|s| s == w))
        {
            pieces.truncate(idx);
            stop = StopKind::Word;
        }

        if pieces.is_empty() {
            self.results.push(
                task.id,
                TaskResult::Final {
                    content: String::new(),
                    prompt_tokens,
                    completion_tokens: 0,
                    stop,
                },
            );
            return;
        }

        let last = pieces.len() - 1;
        let mut completion_tokens = 0;
        for (i, piece) in pieces.into_iter().enumerate() {
            // Abandon generation promptly when the engine shuts down.
            if !self.queue_running() {
                return;
            }
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            if let Some(after) = self.error_after {
                if i >= after {
                    self.results.push(
                        task.id,
                        TaskResult::Error {
                            message: format!("synthetic failure after {i} tokens"),
                        },
                    );
                    return;
                }
            }
            completion_tokens += 1;
            let result = if i == last {
                TaskResult::Final {
                    content: piece,
                    prompt_tokens,
                    completion_tokens,
                    stop,
                }
            } else {
                TaskResult::Partial {
                    content: piece,
                    prompt_tokens,
                    completion_tokens,
                }
            };
            self.results.push(task.id, result);
        }
    }
}

fn scheduler_loop(inner: Arc<Inner>) {
    loop {
        let task = {
            let mut queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                if !queue.running {
                    return;
                }
                queue = inner
                    .queue_cv
                    .wait(queue)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };
        debug!(task_id = task.id, tokens = task.tokens.len(), "running task");
        inner.run_task(task);
    }
}

pub struct LoopbackEngineBuilder {
    model_name: String,
    defaults: EngineDefaults,
    chat_template: Option<ChatTemplate>,
    token_delay: Duration,
    error_after: Option<usize>,
}

impl LoopbackEngineBuilder {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            defaults: EngineDefaults {
                n_predict: 128,
                temperature: 0.8,
            },
            chat_template: None,
            token_delay: Duration::ZERO,
            error_after: None,
        }
    }

    pub fn defaults(mut self, defaults: EngineDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn chat_template(mut self, template: ChatTemplate) -> Self {
        self.chat_template = Some(template);
        self
    }

    /// Sleep this long before emitting each piece.
    pub fn token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Emit an engine error after `n` pieces instead of completing.
    pub fn error_after(mut self, n: usize) -> Self {
        self.error_after = Some(n);
        self
    }

    pub fn build(self) -> Result<LoopbackEngine, EngineError> {
        let inner = Arc::new(Inner {
            model_name: self.model_name,
            defaults: self.defaults,
            chat_template: self.chat_template,
            token_delay: self.token_delay,
            error_after: self.error_after,
            vocab: Mutex::new(Vocab::default()),
            next_task_id: AtomicI64::new(1),
            queue: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                running: true,
            }),
            queue_cv: Condvar::new(),
            results: ResultHub::default(),
        });
        let scheduler = std::thread::Builder::new()
            .name("loopback-scheduler".into())
            .spawn({
                let inner = Arc::clone(&inner);
                move || scheduler_loop(inner)
            })
            .map_err(|source| EngineError::SpawnScheduler { source })?;
        Ok(LoopbackEngine {
            inner,
            scheduler: Mutex::new(Some(scheduler)),
        })
    }
}

/// See the module docs; built via [`LoopbackEngine::builder`].
pub struct LoopbackEngine {
    inner: Arc<Inner>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackEngine {
    pub fn new(model_name: impl Into<String>) -> Result<Self, EngineError> {
        Self::builder(model_name).build()
    }

    pub fn builder(model_name: impl Into<String>) -> LoopbackEngineBuilder {
        LoopbackEngineBuilder::new(model_name)
    }
}

impl CompletionEngine for LoopbackEngine {
    fn model_name(&self) -> String {
        self.inner.model_name.clone()
    }

    fn chat_template(&self) -> Option<&ChatTemplate> {
        self.inner.chat_template.as_ref()
    }

    fn tokenize(&self, prompt: &str) -> Result<Vec<Token>, EngineError> {
        let mut vocab = self.inner.vocab.lock().unwrap_or_else(|e| e.into_inner());
        Ok(prompt
            .split_whitespace()
            .map(|w| vocab.intern(w))
            .collect())
    }

    fn defaults(&self) -> EngineDefaults {
        self.inner.defaults
    }

    fn next_task_id(&self) -> TaskId {
        self.inner.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, task_id: TaskId) {
        self.inner.results.register(task_id);
    }

    fn unregister(&self, task_id: TaskId) {
        self.inner.results.unregister(task_id);
    }

    fn submit(&self, task: CompletionTask) -> Result<(), EngineError> {
        let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
        if !queue.running {
            return Err(EngineError::Shutdown);
        }
        queue.tasks.push_back(task);
        self.inner.queue_cv.notify_one();
        Ok(())
    }

    fn recv_timeout(&self, task_id: TaskId, timeout: Duration) -> Option<TaskResult> {
        self.inner.results.recv_timeout(task_id, timeout)
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        {
            let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.running = false;
        }
        self.inner.queue_cv.notify_all();
        let handle = self
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}
