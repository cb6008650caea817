//! Safe layer over the CycloneDDS C API for the llama bridge topics.
//!
//! Three concerns live here:
//!
//! - **Record types** ([`types`]): the string-owning forms of the messages
//!   carried on the three well-known topics.
//! - **Codec** ([`codec`]): conversions between the record types and the
//!   `idlc`-generated C structures, with every send-side allocation tied to a
//!   scope guard so release is unconditional.
//! - **Transport** ([`transport`]): the server and client roles — entity
//!   lifecycles, QoS profiles, reader threads, callbacks and loan handling.
//!
//! The substrate is loaded at runtime ([`DdsContext::load`]); nothing links
//! against CycloneDDS at build time.

mod entity;
mod error;
mod qos;

pub mod codec;
pub mod transport;
pub mod types;

pub use error::DdsError;
pub use qos::{Durability, QosProfile, Reliability};
pub use transport::{
    DdsClient, DdsContext, DdsServer, TOPIC_REQUEST, TOPIC_RESPONSE, TOPIC_STATUS,
};
pub use types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, FinishReason, Role, ServerStatus,
};
