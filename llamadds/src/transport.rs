//! Server and client transport roles over the three bridge topics.
//!
//! Each role owns its DDS entities plus one reader thread running the
//! waitset loop: wait with a 500 ms bound so shutdown stays responsive, one
//! `take` per attached reader per wakeup round, loan returned as soon as the
//! codec has copied the sample out, user callback invoked at most once per
//! valid sample. Entity-creation failure is fatal to `start`; everything
//! already created is released (in reverse creation order) before the error
//! is returned. Write failures are logged and discarded: the protocol is
//! at-least-once and the client resends on its own timeout.

use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use llamadds_sys as sys;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec;
use crate::entity::Entity;
use crate::error::DdsError;
use crate::qos::{Qos, QosProfile};
use crate::types::{ChatCompletionRequest, ChatCompletionResponse, ServerStatus};

pub const TOPIC_REQUEST: &str = "llama_chat_completion_request";
pub const TOPIC_RESPONSE: &str = "llama_chat_completion_response";
pub const TOPIC_STATUS: &str = "llama_server_status";

/// Loaded DDS substrate: the core library plus the compiled IDL types.
///
/// Cheap to clone; both roles borrow it at start.
#[derive(Clone)]
pub struct DdsContext {
    api: Arc<sys::DdsApi>,
    types: Arc<sys::TypesApi>,
    domain: sys::dds_domainid_t,
}

impl DdsContext {
    /// Open `libddsc` and the IDL types library and bind them to a domain.
    pub fn load(
        lib_path: impl AsRef<Path>,
        types_lib_path: impl AsRef<Path>,
        domain: u32,
    ) -> Result<Self, DdsError> {
        let lib_path = lib_path.as_ref();
        let types_lib_path = types_lib_path.as_ref();
        // SAFETY: loading runs library initializers; the paths are
        // operator-supplied configuration naming a CycloneDDS build and the
        // idlc output, per the deployment contract.
        let api = unsafe { sys::DdsApi::new(lib_path) }.map_err(|source| DdsError::LoadLibrary {
            path: lib_path.to_path_buf(),
            source,
        })?;
        let types =
            unsafe { sys::TypesApi::new(types_lib_path) }.map_err(|source| DdsError::LoadTypes {
                path: types_lib_path.to_path_buf(),
                source,
            })?;
        info!(domain, lib = %lib_path.display(), "DDS substrate loaded");
        Ok(Self {
            api: Arc::new(api),
            types: Arc::new(types),
            domain,
        })
    }

    pub fn domain(&self) -> u32 {
        self.domain
    }
}

// ── Shared plumbing ───────────────────────────────────────────────────────────

/// Readers attached to the role's waitset, with their decode-and-dispatch
/// thunk. The attach token is the reader handle itself.
struct AttachedReader {
    handle: sys::dds_entity_t,
    dispatch: Box<dyn Fn(&sys::DdsApi, *const c_void) + Send>,
}

/// Waitset loop shared by both roles.
fn reader_loop(
    api: Arc<sys::DdsApi>,
    running: Arc<AtomicBool>,
    participant: sys::dds_entity_t,
    readers: Vec<AttachedReader>,
    role: &'static str,
) {
    // SAFETY: the owning role joins this thread before deleting its
    // entities, so every handle used here outlives the loop.
    let ws = unsafe { api.dds_create_waitset(participant) };
    if ws < 0 {
        error!(role, code = ws, "failed to create waitset");
        return;
    }
    for r in &readers {
        unsafe {
            let rc = api.dds_set_status_mask(r.handle, sys::DDS_DATA_AVAILABLE_STATUS);
            if rc < 0 {
                error!(role, code = rc, "failed to set reader status mask");
            }
            let rc = api.dds_waitset_attach(ws, r.handle, r.handle as sys::dds_attach_t);
            if rc < 0 {
                error!(role, code = rc, "failed to attach reader to waitset");
                api.dds_delete(ws);
                return;
            }
        }
    }

    debug!(role, "reader loop started");
    let mut xs = vec![0 as sys::dds_attach_t; readers.len()];
    while running.load(Ordering::Acquire) {
        let rc = unsafe {
            api.dds_waitset_wait(ws, xs.as_mut_ptr(), xs.len(), sys::dds_msecs(500))
        };
        if rc < 0 {
            error!(role, code = rc, "waitset wait failed, reader loop exiting");
            break;
        }
        if rc == 0 {
            continue;
        }
        for r in &readers {
            take_one(&api, r);
        }
    }
    unsafe { api.dds_delete(ws) };
    debug!(role, "reader loop ended");
}

/// Attempt one `take`; return the loan before dispatching the copy.
fn take_one(api: &sys::DdsApi, reader: &AttachedReader) {
    let mut samples: [*mut c_void; 1] = [ptr::null_mut()];
    let mut infos = [sys::dds_sample_info_t::default()];
    // SAFETY: the buffers live across the call; passing a null sample
    // pointer asks the reader for a loan.
    let n = unsafe {
        api.dds_take(
            reader.handle,
            samples.as_mut_ptr(),
            infos.as_mut_ptr(),
            1,
            1,
        )
    };
    if n < 0 {
        error!(code = n, "dds_take failed");
        return;
    }
    if n == 0 {
        return;
    }
    if infos[0].valid_data {
        // The dispatch thunk copies everything out of the sample (the codec
        // owns no loan memory), so returning the loan right after is safe.
        (reader.dispatch)(api, samples[0] as *const c_void);
    }
    // SAFETY: returns exactly the loan taken above.
    let rc = unsafe { api.dds_return_loan(reader.handle, samples.as_mut_ptr(), n) };
    if rc < 0 {
        error!(code = rc, "dds_return_loan failed");
    }
}

fn guarded<T: 'static>(cb: Arc<dyn Fn(T) + Send + Sync>, what: &'static str) -> impl Fn(T) {
    move |value| {
        // Callback panics must not unwind into the transport substrate.
        if catch_unwind(AssertUnwindSafe(|| cb(value))).is_err() {
            error!("{what} callback panicked");
        }
    }
}

fn poll_until(deadline: Instant, mut matched: impl FnMut() -> bool) -> bool {
    loop {
        if matched() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

// ── Server role ───────────────────────────────────────────────────────────────

/// Entities in reverse creation order so drop releases endpoints before
/// topics before the participant.
struct ServerEntities {
    status_writer: Entity,
    response_writer: Entity,
    _request_reader: Entity,
    _request_topic: Entity,
    _response_topic: Entity,
    _status_topic: Entity,
    _participant: Entity,
}

struct ServerShared {
    api: Arc<sys::DdsApi>,
    running: Arc<AtomicBool>,
    /// `None` after `stop`; sends become no-ops.
    entities: Mutex<Option<ServerEntities>>,
}

/// Server endpoint: one request reader feeding the `on_request` callback,
/// writers for responses and status.
pub struct DdsServer {
    shared: Arc<ServerShared>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DdsServer {
    /// Create every server entity, apply the topic QoS profiles and spawn the
    /// reader thread.
    ///
    /// On failure nothing keeps running: entities created before the failing
    /// one are released before the error is returned.
    pub fn start(
        ctx: &DdsContext,
        on_request: impl Fn(ChatCompletionRequest) + Send + Sync + 'static,
    ) -> Result<Self, DdsError> {
        let api = Arc::clone(&ctx.api);

        let participant = Entity::participant(Arc::clone(&api), ctx.domain)?;
        let request_topic = Entity::topic(
            Arc::clone(&api),
            &participant,
            ctx.types.request_desc(),
            TOPIC_REQUEST,
            "request topic",
        )?;
        let response_topic = Entity::topic(
            Arc::clone(&api),
            &participant,
            ctx.types.response_desc(),
            TOPIC_RESPONSE,
            "response topic",
        )?;
        let status_topic = Entity::topic(
            Arc::clone(&api),
            &participant,
            ctx.types.status_desc(),
            TOPIC_STATUS,
            "status topic",
        )?;

        let request_qos = Qos::new(Arc::clone(&api), &QosProfile::request())?;
        let request_reader = Entity::reader(
            Arc::clone(&api),
            &participant,
            &request_topic,
            &request_qos,
            "request reader",
        )?;
        let response_qos = Qos::new(Arc::clone(&api), &QosProfile::response())?;
        let response_writer = Entity::writer(
            Arc::clone(&api),
            &participant,
            &response_topic,
            &response_qos,
            "response writer",
        )?;
        let status_qos = Qos::new(Arc::clone(&api), &QosProfile::status())?;
        let status_writer = Entity::writer(
            Arc::clone(&api),
            &participant,
            &status_topic,
            &status_qos,
            "status writer",
        )?;

        let participant_handle = participant.handle();
        let reader_handle = request_reader.handle();

        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(ServerShared {
            api: Arc::clone(&api),
            running: Arc::clone(&running),
            entities: Mutex::new(Some(ServerEntities {
                status_writer,
                response_writer,
                _request_reader: request_reader,
                _request_topic: request_topic,
                _response_topic: response_topic,
                _status_topic: status_topic,
                _participant: participant,
            })),
        });

        let on_request = guarded(
            Arc::new(on_request) as Arc<dyn Fn(ChatCompletionRequest) + Send + Sync>,
            "request",
        );
        let dispatch: Box<dyn Fn(&sys::DdsApi, *const c_void) + Send> =
            Box::new(move |_api, sample| {
                // SAFETY: the reader loop only dispatches valid samples of the
                // topic's registered type.
                let raw = unsafe { &*(sample as *const sys::llama_ChatCompletionRequest) };
                let req = codec::decode_request(raw);
                debug!(request_id = %req.request_id, model = %req.model, "received request");
                on_request(req);
            });

        let thread_api = Arc::clone(&api);
        let reader_thread = std::thread::Builder::new()
            .name("dds-server-reader".into())
            .spawn(move || {
                reader_loop(
                    thread_api,
                    running,
                    participant_handle,
                    vec![AttachedReader {
                        handle: reader_handle,
                        dispatch,
                    }],
                    "server",
                )
            })
            .map_err(|source| DdsError::SpawnThread {
                name: "dds-server-reader",
                source,
            })?;

        info!(
            request = TOPIC_REQUEST,
            response = TOPIC_RESPONSE,
            status = TOPIC_STATUS,
            "DDS server started"
        );
        Ok(Self {
            shared,
            reader_thread: Mutex::new(Some(reader_thread)),
        })
    }

    /// Publish one response sample. Thread-safe; errors are logged and the
    /// sample is discarded (at-least-once semantics, the client retries).
    /// No-op after `stop`.
    pub fn send_response(&self, resp: &ChatCompletionResponse) {
        let guard = self.shared.entities.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entities) = guard.as_ref() else {
            debug!("send_response after stop, dropping sample");
            return;
        };
        match codec::encode_response(resp) {
            Ok(raw) => {
                // SAFETY: `raw` stays alive (and owned by the guard) across
                // the write; dds_write serializes before returning.
                let rc = unsafe {
                    self.shared
                        .api
                        .dds_write(entities.response_writer.handle(), raw.as_ptr())
                };
                if rc != sys::DDS_RETCODE_OK {
                    warn!(request_id = %resp.request_id, code = rc, "response write failed");
                } else {
                    debug!(
                        request_id = %resp.request_id,
                        is_final = resp.is_final,
                        "response sent"
                    );
                }
            }
            Err(e) => warn!(request_id = %resp.request_id, error = %e, "response encode failed"),
        }
    }

    /// Publish one status sample (best-effort topic; losses are fine).
    pub fn publish_status(&self, status: &ServerStatus) {
        let guard = self.shared.entities.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entities) = guard.as_ref() else {
            return;
        };
        match codec::encode_status(status) {
            Ok(raw) => {
                // SAFETY: as in `send_response`.
                let rc = unsafe {
                    self.shared
                        .api
                        .dds_write(entities.status_writer.handle(), raw.as_ptr())
                };
                if rc != sys::DDS_RETCODE_OK {
                    debug!(code = rc, "status write failed");
                }
            }
            Err(e) => debug!(error = %e, "status encode failed"),
        }
    }

    /// True while the reader thread should keep running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stop the reader thread and release every entity in reverse creation
    /// order. Idempotent. Must not be called from within a callback (the
    /// join would deadlock).
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let handle = self
            .reader_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let entities = self
            .shared
            .entities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(entities);
        info!("DDS server stopped");
    }
}

impl Drop for DdsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Client role ───────────────────────────────────────────────────────────────

struct ClientEntities {
    request_writer: Entity,
    response_reader: Entity,
    _status_reader: Entity,
    _request_topic: Entity,
    _response_topic: Entity,
    _status_topic: Entity,
    _participant: Entity,
}

struct ClientShared {
    api: Arc<sys::DdsApi>,
    running: Arc<AtomicBool>,
    entities: Mutex<Option<ClientEntities>>,
}

/// Client endpoint: readers for responses and status feeding the callbacks,
/// one writer for requests.
pub struct DdsClient {
    shared: Arc<ClientShared>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DdsClient {
    pub fn start(
        ctx: &DdsContext,
        on_response: impl Fn(ChatCompletionResponse) + Send + Sync + 'static,
        on_status: impl Fn(ServerStatus) + Send + Sync + 'static,
    ) -> Result<Self, DdsError> {
        let api = Arc::clone(&ctx.api);

        let participant = Entity::participant(Arc::clone(&api), ctx.domain)?;
        let request_topic = Entity::topic(
            Arc::clone(&api),
            &participant,
            ctx.types.request_desc(),
            TOPIC_REQUEST,
            "request topic",
        )?;
        let response_topic = Entity::topic(
            Arc::clone(&api),
            &participant,
            ctx.types.response_desc(),
            TOPIC_RESPONSE,
            "response topic",
        )?;
        let status_topic = Entity::topic(
            Arc::clone(&api),
            &participant,
            ctx.types.status_desc(),
            TOPIC_STATUS,
            "status topic",
        )?;

        let request_qos = Qos::new(Arc::clone(&api), &QosProfile::request())?;
        let request_writer = Entity::writer(
            Arc::clone(&api),
            &participant,
            &request_topic,
            &request_qos,
            "request writer",
        )?;
        let response_qos = Qos::new(Arc::clone(&api), &QosProfile::response())?;
        let response_reader = Entity::reader(
            Arc::clone(&api),
            &participant,
            &response_topic,
            &response_qos,
            "response reader",
        )?;
        let status_qos = Qos::new(Arc::clone(&api), &QosProfile::status())?;
        let status_reader = Entity::reader(
            Arc::clone(&api),
            &participant,
            &status_topic,
            &status_qos,
            "status reader",
        )?;

        let participant_handle = participant.handle();
        let response_handle = response_reader.handle();
        let status_handle = status_reader.handle();

        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(ClientShared {
            api: Arc::clone(&api),
            running: Arc::clone(&running),
            entities: Mutex::new(Some(ClientEntities {
                request_writer,
                response_reader,
                _status_reader: status_reader,
                _request_topic: request_topic,
                _response_topic: response_topic,
                _status_topic: status_topic,
                _participant: participant,
            })),
        });

        let on_response = guarded(
            Arc::new(on_response) as Arc<dyn Fn(ChatCompletionResponse) + Send + Sync>,
            "response",
        );
        let on_status = guarded(
            Arc::new(on_status) as Arc<dyn Fn(ServerStatus) + Send + Sync>,
            "status",
        );

        let response_dispatch: Box<dyn Fn(&sys::DdsApi, *const c_void) + Send> =
            Box::new(move |_api, sample| {
                // SAFETY: valid sample of the response topic's type.
                let raw = unsafe { &*(sample as *const sys::llama_ChatCompletionResponse) };
                on_response(codec::decode_response(raw));
            });
        let status_dispatch: Box<dyn Fn(&sys::DdsApi, *const c_void) + Send> =
            Box::new(move |_api, sample| {
                // SAFETY: valid sample of the status topic's type.
                let raw = unsafe { &*(sample as *const sys::llama_ServerStatus) };
                on_status(codec::decode_status(raw));
            });

        let thread_api = Arc::clone(&api);
        let reader_thread = std::thread::Builder::new()
            .name("dds-client-reader".into())
            .spawn(move || {
                reader_loop(
                    thread_api,
                    running,
                    participant_handle,
                    vec![
                        AttachedReader {
                            handle: response_handle,
                            dispatch: response_dispatch,
                        },
                        AttachedReader {
                            handle: status_handle,
                            dispatch: status_dispatch,
                        },
                    ],
                    "client",
                )
            })
            .map_err(|source| DdsError::SpawnThread {
                name: "dds-client-reader",
                source,
            })?;

        info!("DDS client started");
        Ok(Self {
            shared,
            reader_thread: Mutex::new(Some(reader_thread)),
        })
    }

    /// Publish one request sample and return the correlation id used.
    ///
    /// An empty `request_id` is replaced with a fresh v4 UUID. Write failures
    /// are logged and discarded, like every send on the bridge; the caller
    /// retries on its own timeout.
    pub fn send_request(&self, req: &ChatCompletionRequest) -> String {
        let mut req = req.clone();
        if req.request_id.is_empty() {
            req.request_id = Uuid::new_v4().to_string();
        }
        let request_id = req.request_id.clone();

        let guard = self.shared.entities.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entities) = guard.as_ref() else {
            debug!("send_request after stop, dropping sample");
            return request_id;
        };
        match codec::encode_request(&req) {
            Ok(raw) => {
                // SAFETY: as in `DdsServer::send_response`.
                let rc = unsafe {
                    self.shared
                        .api
                        .dds_write(entities.request_writer.handle(), raw.as_ptr())
                };
                if rc != sys::DDS_RETCODE_OK {
                    warn!(request_id = %request_id, code = rc, "request write failed");
                }
            }
            Err(e) => warn!(request_id = %request_id, error = %e, "request encode failed"),
        }
        request_id
    }

    /// Bounded active-discovery poll: wait until the request writer and the
    /// response reader have both matched a remote endpoint.
    ///
    /// Returns `false` when the deadline passes unmatched. Callers issuing
    /// measurements should wait for this before the first request.
    pub fn wait_for_server(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        poll_until(deadline, || {
            let guard = self.shared.entities.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entities) = guard.as_ref() else {
                return false;
            };
            let mut publication = sys::dds_publication_matched_status_t::default();
            let mut subscription = sys::dds_subscription_matched_status_t::default();
            // SAFETY: out-pointers to stack structs of the documented layout.
            unsafe {
                self.shared.api.dds_get_publication_matched_status(
                    entities.request_writer.handle(),
                    &mut publication,
                );
                self.shared.api.dds_get_subscription_matched_status(
                    entities.response_reader.handle(),
                    &mut subscription,
                );
            }
            publication.current_count > 0 && subscription.current_count > 0
        })
    }

    /// Stop the reader thread and release every entity. Idempotent.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let handle = self
            .reader_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let entities = self
            .shared
            .entities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(entities);
        info!("DDS client stopped");
    }
}

impl Drop for DdsClient {
    fn drop(&mut self) {
        self.stop();
    }
}
