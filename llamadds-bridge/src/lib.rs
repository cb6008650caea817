//! Pub/sub request-response bridge between the llama DDS topics and an
//! in-process completion engine.
//!
//! Data flow: the transport reader thread stages requests in the
//! [`IntakeQueue`]; the [`EngineAdapter`] driver thread pops them, runs each
//! through the engine's submit-and-stream contract and emits responses
//! (streamed deltas or one accumulated message) through the [`Bridge`];
//! the [`StatusPublisher`] heartbeats server health on the side.
//!
//! The transport seam is the pair of sink traits in [`bridge`], implemented
//! by the DDS server role and by in-memory collectors in tests.

mod adapter;
mod bridge;
mod config;
mod intake;
mod server;
mod status;

pub mod engine;

use thiserror::Error;

pub use adapter::EngineAdapter;
pub use bridge::{Bridge, ResponseSink, StatusSink};
pub use config::BridgeConfig;
pub use engine::{ChatTemplate, CompletionEngine, LoopbackEngine};
pub use intake::IntakeQueue;
pub use server::BridgeServer;
pub use status::StatusPublisher;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transport error")]
    Transport(#[from] llamadds::DdsError),

    #[error("engine error")]
    Engine(#[from] engine::EngineError),

    #[error("failed to spawn {name} thread")]
    SpawnThread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}
