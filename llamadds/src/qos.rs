//! QoS profiles for the three bridge topics.
//!
//! The same profiles are applied on the server and client so subscriptions
//! match: requests and responses are reliable and transient-local (a
//! late-joining reader still observes the last few samples, which matters
//! because clients and server start in arbitrary order); the heartbeat is
//! monitoring-grade and must not accumulate stale history.

use std::sync::Arc;
use std::time::Duration;

use llamadds_sys as sys;

use crate::error::DdsError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reliability {
    BestEffort,
    Reliable { max_blocking: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Volatile,
    TransientLocal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QosProfile {
    pub reliability: Reliability,
    pub durability: Durability,
    /// Keep-last history depth.
    pub history_depth: i32,
}

impl QosProfile {
    /// Request topic: reliable, transient-local, keep-last 8.
    pub fn request() -> Self {
        Self {
            reliability: Reliability::Reliable {
                max_blocking: Duration::from_secs(10),
            },
            durability: Durability::TransientLocal,
            history_depth: 8,
        }
    }

    /// Response topic: reliable, transient-local, keep-last 32.
    ///
    /// Depth 32 rather than 8 so a streaming burst survives at a late-joining
    /// reader; history is not a request/offer policy, so the value does not
    /// affect matching.
    pub fn response() -> Self {
        Self {
            history_depth: 32,
            ..Self::request()
        }
    }

    /// Status topic: best-effort, volatile, keep-last 1.
    pub fn status() -> Self {
        Self {
            reliability: Reliability::BestEffort,
            durability: Durability::Volatile,
            history_depth: 1,
        }
    }
}

/// Owned `dds_qos_t`, deleted on drop. Entities copy the policies at
/// creation, so the lifetime only needs to span the `dds_create_*` call.
pub(crate) struct Qos {
    api: Arc<sys::DdsApi>,
    ptr: *mut sys::dds_qos_t,
}

impl Qos {
    pub(crate) fn new(api: Arc<sys::DdsApi>, profile: &QosProfile) -> Result<Self, DdsError> {
        // SAFETY: plain constructor call; null is checked below.
        let ptr = unsafe { api.dds_create_qos() };
        if ptr.is_null() {
            return Err(DdsError::CreateEntity {
                entity: "qos",
                code: 0,
            });
        }
        unsafe {
            match profile.reliability {
                Reliability::BestEffort => {
                    api.dds_qset_reliability(ptr, sys::DDS_RELIABILITY_BEST_EFFORT, 0);
                }
                Reliability::Reliable { max_blocking } => {
                    api.dds_qset_reliability(
                        ptr,
                        sys::DDS_RELIABILITY_RELIABLE,
                        max_blocking.as_nanos() as sys::dds_duration_t,
                    );
                }
            }
            let durability = match profile.durability {
                Durability::Volatile => sys::DDS_DURABILITY_VOLATILE,
                Durability::TransientLocal => sys::DDS_DURABILITY_TRANSIENT_LOCAL,
            };
            api.dds_qset_durability(ptr, durability);
            api.dds_qset_history(ptr, sys::DDS_HISTORY_KEEP_LAST, profile.history_depth);
        }
        Ok(Self { api, ptr })
    }

    pub(crate) fn as_ptr(&self) -> *const sys::dds_qos_t {
        self.ptr
    }
}

impl Drop for Qos {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `dds_create_qos` and is deleted exactly once.
        unsafe { self.api.dds_delete_qos(self.ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_profiles_match_the_policy_table() {
        let request = QosProfile::request();
        assert_eq!(
            request.reliability,
            Reliability::Reliable {
                max_blocking: Duration::from_secs(10)
            }
        );
        assert_eq!(request.durability, Durability::TransientLocal);
        assert_eq!(request.history_depth, 8);

        let response = QosProfile::response();
        assert_eq!(response.reliability, request.reliability);
        assert_eq!(response.durability, Durability::TransientLocal);
        assert_eq!(response.history_depth, 32);

        let status = QosProfile::status();
        assert_eq!(status.reliability, Reliability::BestEffort);
        assert_eq!(status.durability, Durability::Volatile);
        assert_eq!(status.history_depth, 1);
    }
}
