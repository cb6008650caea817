use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DdsError {
    #[error("failed to load DDS core library: {path}")]
    LoadLibrary {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("failed to load IDL types library: {path}")]
    LoadTypes {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("failed to create {entity} (code {code})")]
    CreateEntity { entity: &'static str, code: i32 },

    #[error("field '{field}' contains an interior NUL byte")]
    InteriorNul { field: &'static str },

    #[error("failed to spawn {name} thread")]
    SpawnThread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}
