//! Low-level bindings for the CycloneDDS C API via dynamic library loading.
//!
//! Nothing links at build time: [`DdsApi::new`] opens `libddsc` with
//! `libloading` and resolves every required symbol eagerly, the same way the
//! llama bindings load `libllama`. [`TypesApi::new`] opens the shared library
//! built from the `idlc` output of `idl/LlamaDDS.idl` and resolves the
//! generated topic descriptors.
//!
//! The bindings were originally produced with bindgen's
//! `dynamic_library_name` mode and are maintained by hand; they cover the
//! subset of `dds/dds.h` the transport needs (entity creation/deletion,
//! write, take/loan return, QoS setters, waitsets, matched-status getters).

#![allow(non_camel_case_types)]

use std::ffi::OsStr;

use libloading::Library;

pub mod idl;

pub use idl::*;

// ── Scalar types ──────────────────────────────────────────────────────────────

/// Entity handle; negative values are error codes.
pub type dds_entity_t = i32;
/// Return code; negative values are `-DDS_RETCODE_*`.
pub type dds_return_t = i32;
pub type dds_domainid_t = u32;
/// Duration in nanoseconds.
pub type dds_duration_t = i64;
/// Timestamp in nanoseconds since the epoch.
pub type dds_time_t = i64;
pub type dds_attach_t = isize;
pub type dds_instance_handle_t = u64;

// ── Constants ─────────────────────────────────────────────────────────────────

pub const DDS_RETCODE_OK: dds_return_t = 0;
pub const DDS_RETCODE_ERROR: dds_return_t = 1;
pub const DDS_RETCODE_TIMEOUT: dds_return_t = 10;

pub const DDS_DOMAIN_DEFAULT: dds_domainid_t = 0xFFFF_FFFF;

/// `DDS_INFINITY`: never time out.
pub const DDS_INFINITY: dds_duration_t = i64::MAX;

pub const fn dds_secs(n: i64) -> dds_duration_t {
    n * 1_000_000_000
}

pub const fn dds_msecs(n: i64) -> dds_duration_t {
    n * 1_000_000
}

// Status masks, `1 << dds_status_id`.
pub const DDS_DATA_AVAILABLE_STATUS: u32 = 1 << 8;
pub const DDS_PUBLICATION_MATCHED_STATUS: u32 = 1 << 11;
pub const DDS_SUBSCRIPTION_MATCHED_STATUS: u32 = 1 << 12;

// QoS policy kinds (numeric values from dds/ddsc/dds_public_qos.h).
pub const DDS_RELIABILITY_BEST_EFFORT: i32 = 0;
pub const DDS_RELIABILITY_RELIABLE: i32 = 1;

pub const DDS_DURABILITY_VOLATILE: i32 = 0;
pub const DDS_DURABILITY_TRANSIENT_LOCAL: i32 = 1;

pub const DDS_HISTORY_KEEP_LAST: i32 = 0;
pub const DDS_HISTORY_KEEP_ALL: i32 = 1;

// ── Opaque types ──────────────────────────────────────────────────────────────

#[repr(C)]
pub struct dds_qos_t {
    _unused: [u8; 0],
}

#[repr(C)]
pub struct dds_listener_t {
    _unused: [u8; 0],
}

/// Serialization descriptor generated by `idlc`; opaque to the bindings, the
/// address of the generated static is passed straight to `dds_create_topic`.
#[repr(C)]
pub struct dds_topic_descriptor_t {
    _unused: [u8; 0],
}

// ── Info / status structs ─────────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct dds_sample_info_t {
    pub sample_state: u32,
    pub view_state: u32,
    pub instance_state: u32,
    pub valid_data: bool,
    pub source_timestamp: dds_time_t,
    pub instance_handle: dds_instance_handle_t,
    pub publication_handle: dds_instance_handle_t,
    pub disposed_generation_count: u32,
    pub no_writers_generation_count: u32,
    pub sample_rank: u32,
    pub generation_rank: u32,
    pub absolute_generation_rank: u32,
}

impl Default for dds_sample_info_t {
    fn default() -> Self {
        // SAFETY: all-zero is a valid bit pattern for every field.
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct dds_publication_matched_status_t {
    pub total_count: u32,
    pub total_count_change: i32,
    pub current_count: u32,
    pub current_count_change: i32,
    pub last_subscription_handle: dds_instance_handle_t,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct dds_subscription_matched_status_t {
    pub total_count: u32,
    pub total_count_change: i32,
    pub current_count: u32,
    pub current_count_change: i32,
    pub last_publication_handle: dds_instance_handle_t,
}

// ── Core API ──────────────────────────────────────────────────────────────────

macro_rules! dds_api {
    ($(fn $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty;)*) => {
        /// Entry points of `libddsc`, resolved once at load time.
        pub struct DdsApi {
            _lib: Library,
            $($name: unsafe extern "C" fn($($ty),*) -> $ret,)*
        }

        impl DdsApi {
            /// Open the CycloneDDS shared library and resolve every symbol.
            ///
            /// # Errors
            /// Returns the `libloading` error if the library cannot be opened
            /// or any required symbol is missing.
            ///
            /// # Safety
            /// Loading a shared library runs its initializers; the caller must
            /// ensure `path` refers to a genuine CycloneDDS build.
            pub unsafe fn new<P: AsRef<OsStr>>(path: P) -> Result<Self, libloading::Error> {
                let lib = Library::new(path.as_ref())?;
                $(
                    let $name = *lib.get::<unsafe extern "C" fn($($ty),*) -> $ret>(
                        concat!(stringify!($name), "\0").as_bytes(),
                    )?;
                )*
                Ok(Self { _lib: lib, $($name,)* })
            }

            $(
                /// # Safety
                /// Direct FFI call; arguments must satisfy the CycloneDDS
                /// contract for this entry point.
                pub unsafe fn $name(&self, $($arg: $ty),*) -> $ret {
                    (self.$name)($($arg),*)
                }
            )*
        }
    };
}

dds_api! {
    fn dds_create_participant(
        domain: dds_domainid_t,
        qos: *const dds_qos_t,
        listener: *const dds_listener_t
    ) -> dds_entity_t;
    fn dds_create_topic(
        participant: dds_entity_t,
        descriptor: *const dds_topic_descriptor_t,
        name: *const std::os::raw::c_char,
        qos: *const dds_qos_t,
        listener: *const dds_listener_t
    ) -> dds_entity_t;
    fn dds_create_reader(
        participant_or_subscriber: dds_entity_t,
        topic: dds_entity_t,
        qos: *const dds_qos_t,
        listener: *const dds_listener_t
    ) -> dds_entity_t;
    fn dds_create_writer(
        participant_or_publisher: dds_entity_t,
        topic: dds_entity_t,
        qos: *const dds_qos_t,
        listener: *const dds_listener_t
    ) -> dds_entity_t;
    fn dds_delete(entity: dds_entity_t) -> dds_return_t;
    fn dds_write(writer: dds_entity_t, data: *const std::os::raw::c_void) -> dds_return_t;
    fn dds_take(
        reader: dds_entity_t,
        buf: *mut *mut std::os::raw::c_void,
        si: *mut dds_sample_info_t,
        bufsz: usize,
        maxs: u32
    ) -> dds_return_t;
    fn dds_return_loan(
        entity: dds_entity_t,
        buf: *mut *mut std::os::raw::c_void,
        bufsz: i32
    ) -> dds_return_t;
    fn dds_create_qos() -> *mut dds_qos_t;
    fn dds_delete_qos(qos: *mut dds_qos_t) -> ();
    fn dds_qset_reliability(
        qos: *mut dds_qos_t,
        kind: i32,
        max_blocking_time: dds_duration_t
    ) -> ();
    fn dds_qset_durability(qos: *mut dds_qos_t, kind: i32) -> ();
    fn dds_qset_history(qos: *mut dds_qos_t, kind: i32, depth: i32) -> ();
    fn dds_create_waitset(participant: dds_entity_t) -> dds_entity_t;
    fn dds_waitset_attach(
        waitset: dds_entity_t,
        entity: dds_entity_t,
        x: dds_attach_t
    ) -> dds_return_t;
    fn dds_waitset_detach(waitset: dds_entity_t, entity: dds_entity_t) -> dds_return_t;
    fn dds_waitset_wait(
        waitset: dds_entity_t,
        xs: *mut dds_attach_t,
        nxs: usize,
        reltimeout: dds_duration_t
    ) -> dds_return_t;
    fn dds_set_status_mask(entity: dds_entity_t, mask: u32) -> dds_return_t;
    fn dds_get_publication_matched_status(
        writer: dds_entity_t,
        status: *mut dds_publication_matched_status_t
    ) -> dds_return_t;
    fn dds_get_subscription_matched_status(
        reader: dds_entity_t,
        status: *mut dds_subscription_matched_status_t
    ) -> dds_return_t;
}

// ── IDL type descriptors ──────────────────────────────────────────────────────

/// Topic descriptors resolved from the shared library built out of the
/// `idlc`-generated `LlamaDDS.c`.
pub struct TypesApi {
    _lib: Library,
    request_desc: *const dds_topic_descriptor_t,
    response_desc: *const dds_topic_descriptor_t,
    status_desc: *const dds_topic_descriptor_t,
}

// SAFETY: the descriptor pointers refer to immutable statics inside the loaded
// library, which stays mapped for as long as `_lib` is alive; CycloneDDS only
// reads them.
unsafe impl Send for TypesApi {}
unsafe impl Sync for TypesApi {}

impl TypesApi {
    /// Open the IDL types library and resolve the three topic descriptors.
    ///
    /// # Safety
    /// Same contract as [`DdsApi::new`]; the library must be the compiled
    /// output of `idl/LlamaDDS.idl` (or a layout-compatible successor).
    pub unsafe fn new<P: AsRef<OsStr>>(path: P) -> Result<Self, libloading::Error> {
        let lib = Library::new(path.as_ref())?;
        let request_desc = *lib
            .get::<*const dds_topic_descriptor_t>(b"llama_ChatCompletionRequest_desc\0")?;
        let response_desc = *lib
            .get::<*const dds_topic_descriptor_t>(b"llama_ChatCompletionResponse_desc\0")?;
        let status_desc = *lib.get::<*const dds_topic_descriptor_t>(b"llama_ServerStatus_desc\0")?;
        Ok(Self {
            _lib: lib,
            request_desc,
            response_desc,
            status_desc,
        })
    }

    pub fn request_desc(&self) -> *const dds_topic_descriptor_t {
        self.request_desc
    }

    pub fn response_desc(&self) -> *const dds_topic_descriptor_t {
        self.response_desc
    }

    pub fn status_desc(&self) -> *const dds_topic_descriptor_t {
        self.status_desc
    }
}
