//! RAII wrappers for DDS entities.
//!
//! Every entity handle is deleted exactly once on drop; owning structs order
//! their fields so that drops run in reverse creation order (writers and
//! readers before topics before the participant).

use std::ffi::CString;
use std::sync::Arc;

use llamadds_sys as sys;
use tracing::debug;

use crate::error::DdsError;
use crate::qos::Qos;

pub(crate) struct Entity {
    api: Arc<sys::DdsApi>,
    handle: sys::dds_entity_t,
    kind: &'static str,
}

impl Entity {
    fn check(
        api: Arc<sys::DdsApi>,
        handle: sys::dds_entity_t,
        kind: &'static str,
    ) -> Result<Self, DdsError> {
        if handle < 0 {
            return Err(DdsError::CreateEntity {
                entity: kind,
                code: handle,
            });
        }
        Ok(Self { api, handle, kind })
    }

    pub(crate) fn participant(
        api: Arc<sys::DdsApi>,
        domain: sys::dds_domainid_t,
    ) -> Result<Self, DdsError> {
        // SAFETY: null qos/listener select the defaults.
        let handle =
            unsafe { api.dds_create_participant(domain, std::ptr::null(), std::ptr::null()) };
        Self::check(api, handle, "participant")
    }

    pub(crate) fn topic(
        api: Arc<sys::DdsApi>,
        participant: &Entity,
        descriptor: *const sys::dds_topic_descriptor_t,
        name: &str,
        kind: &'static str,
    ) -> Result<Self, DdsError> {
        let c_name = CString::new(name).map_err(|_| DdsError::InteriorNul { field: "topic" })?;
        // SAFETY: descriptor points at an idlc-generated static kept alive by
        // the loaded types library; the name is NUL-terminated.
        let handle = unsafe {
            api.dds_create_topic(
                participant.handle,
                descriptor,
                c_name.as_ptr(),
                std::ptr::null(),
                std::ptr::null(),
            )
        };
        Self::check(api, handle, kind)
    }

    pub(crate) fn reader(
        api: Arc<sys::DdsApi>,
        participant: &Entity,
        topic: &Entity,
        qos: &Qos,
        kind: &'static str,
    ) -> Result<Self, DdsError> {
        // SAFETY: both handles are live entities owned by the caller.
        let handle = unsafe {
            api.dds_create_reader(
                participant.handle,
                topic.handle,
                qos.as_ptr(),
                std::ptr::null(),
            )
        };
        Self::check(api, handle, kind)
    }

    pub(crate) fn writer(
        api: Arc<sys::DdsApi>,
        participant: &Entity,
        topic: &Entity,
        qos: &Qos,
        kind: &'static str,
    ) -> Result<Self, DdsError> {
        // SAFETY: both handles are live entities owned by the caller.
        let handle = unsafe {
            api.dds_create_writer(
                participant.handle,
                topic.handle,
                qos.as_ptr(),
                std::ptr::null(),
            )
        };
        Self::check(api, handle, kind)
    }

    pub(crate) fn handle(&self) -> sys::dds_entity_t {
        self.handle
    }
}

impl Drop for Entity {
    fn drop(&mut self) {
        // SAFETY: the handle was returned by a successful dds_create_* call
        // and is deleted exactly once. Deleting a participant also deletes
        // its children, so a child delete after that reports an error code we
        // only log; field ordering in the owning structs avoids that case.
        let rc = unsafe { self.api.dds_delete(self.handle) };
        if rc < 0 {
            debug!(kind = self.kind, code = rc, "dds_delete reported an error");
        }
    }
}
