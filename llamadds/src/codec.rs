//! Conversions between the record types and the `idlc`-generated C
//! structures.
//!
//! Ownership is strictly one-way at the boundary:
//!
//! - **Receive**: samples are loaned by the reader and owned by CycloneDDS.
//!   `decode_*` copies every string and sequence into owning Rust types and
//!   never frees anything; the caller returns the loan immediately after.
//! - **Send**: `encode_*` freshly allocates every string and buffer and
//!   returns the structure inside an [`OwnedRaw`] guard whose `Drop` calls
//!   the matching `free_raw_*` function, so the allocations are released on
//!   every exit path, write failures included.
//!
//! Allocation and release are symmetric Rust-side operations
//! (`CString::into_raw`/`from_raw`, boxed slices): CycloneDDS serializes the
//! sample during `dds_write` and keeps no reference to the caller's buffers
//! afterwards.
//!
//! Absent optional fields encode as zero-length sequences with a null
//! buffer; absent `finish_reason` encodes as an empty string (a null string
//! is not a valid CDR value).

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use llamadds_sys as sys;

use crate::error::DdsError;
use crate::types::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ServerStatus};

// ── Scope guard ───────────────────────────────────────────────────────────────

/// Owns a C structure whose string/buffer fields were allocated by an
/// `encode_*` call and releases them unconditionally on drop.
#[derive(Debug)]
pub struct OwnedRaw<T> {
    raw: T,
    free: fn(&mut T),
}

impl<T> OwnedRaw<T> {
    fn new(raw: T, free: fn(&mut T)) -> Self {
        Self { raw, free }
    }

    /// Pointer suitable for `dds_write`.
    ///
    /// The pointee stays valid until the guard is dropped.
    pub fn as_ptr(&self) -> *const c_void {
        &self.raw as *const T as *const c_void
    }

    pub fn raw(&self) -> &T {
        &self.raw
    }
}

impl<T> Drop for OwnedRaw<T> {
    fn drop(&mut self) {
        (self.free)(&mut self.raw);
    }
}

// ── Allocation helpers ────────────────────────────────────────────────────────

fn alloc_string(s: &str, field: &'static str) -> Result<*mut c_char, DdsError> {
    CString::new(s)
        .map(CString::into_raw)
        .map_err(|_| DdsError::InteriorNul { field })
}

/// Release a string allocated by [`alloc_string`]; tolerates null.
///
/// # Safety
/// `p` must be null or a pointer obtained from `CString::into_raw` that has
/// not been freed yet.
unsafe fn free_string(p: *mut c_char) {
    if !p.is_null() {
        drop(CString::from_raw(p));
    }
}

/// Copy a possibly-null C string out of a loaned sample.
fn copy_string(p: *const c_char) -> String {
    if p.is_null() {
        return String::new();
    }
    // SAFETY: non-null strings in a valid sample are NUL-terminated; the loan
    // is held by the caller for the duration of this call.
    unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
}

/// Move a vector into a `_buffer/_length` pair. Empty vectors produce a null
/// buffer so absence and emptiness encode identically.
fn alloc_buffer<T>(items: Vec<T>) -> (*mut T, u32) {
    if items.is_empty() {
        return (ptr::null_mut(), 0);
    }
    let len = items.len() as u32;
    let boxed: Box<[T]> = items.into_boxed_slice();
    (Box::into_raw(boxed) as *mut T, len)
}

/// Reclaim a buffer produced by [`alloc_buffer`].
///
/// # Safety
/// `(p, len)` must come from a single [`alloc_buffer`] call and not have been
/// freed yet.
unsafe fn free_buffer<T>(p: *mut T, len: u32) {
    if p.is_null() {
        return;
    }
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(p, len as usize)));
}

/// Encode a message list into a sequence, freeing everything already
/// allocated if a later element fails.
fn alloc_message_seq(
    msgs: &[ChatMessage],
) -> Result<sys::dds_sequence_llama_ChatMessage, DdsError> {
    let mut raw_msgs: Vec<sys::llama_ChatMessage> = Vec::with_capacity(msgs.len());
    let cleanup = |raw_msgs: &mut Vec<sys::llama_ChatMessage>| {
        for m in raw_msgs.drain(..) {
            unsafe {
                free_string(m.role);
                free_string(m.content);
            }
        }
    };
    for m in msgs {
        let role = match alloc_string(&m.role, "messages.role") {
            Ok(p) => p,
            Err(e) => {
                cleanup(&mut raw_msgs);
                return Err(e);
            }
        };
        let content = match alloc_string(&m.content, "messages.content") {
            Ok(p) => p,
            Err(e) => {
                unsafe { free_string(role) };
                cleanup(&mut raw_msgs);
                return Err(e);
            }
        };
        raw_msgs.push(sys::llama_ChatMessage { role, content });
    }
    let (buf, len) = alloc_buffer(raw_msgs);
    Ok(sys::dds_sequence_llama_ChatMessage {
        _maximum: len,
        _length: len,
        _buffer: buf,
        _release: len > 0,
    })
}

/// Encode a string list into a sequence, freeing everything already
/// allocated if a later element fails.
fn alloc_string_seq(
    items: &[String],
    field: &'static str,
) -> Result<sys::dds_sequence_string, DdsError> {
    let mut strings: Vec<*mut c_char> = Vec::with_capacity(items.len());
    for s in items {
        match alloc_string(s, field) {
            Ok(p) => strings.push(p),
            Err(e) => {
                for p in strings {
                    unsafe { free_string(p) };
                }
                return Err(e);
            }
        }
    }
    let (buf, len) = alloc_buffer(strings);
    Ok(sys::dds_sequence_string {
        _maximum: len,
        _length: len,
        _buffer: buf,
        _release: len > 0,
    })
}

// ── ChatCompletionRequest ─────────────────────────────────────────────────────

pub fn decode_request(raw: &sys::llama_ChatCompletionRequest) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(raw.messages._length as usize);
    for i in 0..raw.messages._length as usize {
        // SAFETY: `_buffer` holds `_length` valid elements for the lifetime
        // of the loan.
        let msg = unsafe { &*raw.messages._buffer.add(i) };
        messages.push(ChatMessage {
            role: copy_string(msg.role),
            content: copy_string(msg.content),
        });
    }

    let top_p = (raw.top_p._length > 0).then(|| unsafe { *raw.top_p._buffer });
    let n = (raw.n._length > 0).then(|| unsafe { *raw.n._buffer });
    let stop = (raw.stop._length > 0).then(|| {
        (0..raw.stop._length as usize)
            .map(|i| copy_string(unsafe { *raw.stop._buffer.add(i) }))
            .collect()
    });

    ChatCompletionRequest {
        request_id: copy_string(raw.request_id),
        model: copy_string(raw.model),
        messages,
        temperature: raw.temperature,
        max_tokens: raw.max_tokens,
        stream: raw.stream,
        top_p,
        n,
        stop,
    }
}

pub fn encode_request(
    req: &ChatCompletionRequest,
) -> Result<OwnedRaw<sys::llama_ChatCompletionRequest>, DdsError> {
    // Build inside the guard from the start so a mid-encode error still
    // releases everything allocated so far.
    let mut out = OwnedRaw::new(sys::llama_ChatCompletionRequest::default(), free_raw_request);

    out.raw.request_id = alloc_string(&req.request_id, "request_id")?;
    out.raw.model = alloc_string(&req.model, "model")?;
    out.raw.messages = alloc_message_seq(&req.messages)?;

    out.raw.temperature = req.temperature;
    out.raw.max_tokens = req.max_tokens;
    out.raw.stream = req.stream;

    if let Some(top_p) = req.top_p {
        let (buf, len) = alloc_buffer(vec![top_p]);
        out.raw.top_p = sys::dds_sequence_float {
            _maximum: len,
            _length: len,
            _buffer: buf,
            _release: true,
        };
    }
    if let Some(n) = req.n {
        let (buf, len) = alloc_buffer(vec![n]);
        out.raw.n = sys::dds_sequence_int32 {
            _maximum: len,
            _length: len,
            _buffer: buf,
            _release: true,
        };
    }
    if let Some(stop) = &req.stop {
        out.raw.stop = alloc_string_seq(stop, "stop")?;
    }

    Ok(out)
}

/// Release every allocation made by [`encode_request`]. Fields are nulled so
/// a second call is a no-op.
pub fn free_raw_request(raw: &mut sys::llama_ChatCompletionRequest) {
    unsafe {
        free_string(raw.request_id);
        raw.request_id = ptr::null_mut();
        free_string(raw.model);
        raw.model = ptr::null_mut();

        for i in 0..raw.messages._length as usize {
            let msg = &mut *raw.messages._buffer.add(i);
            free_string(msg.role);
            free_string(msg.content);
        }
        free_buffer(raw.messages._buffer, raw.messages._length);
        raw.messages = Default::default();

        free_buffer(raw.top_p._buffer, raw.top_p._length);
        raw.top_p = Default::default();
        free_buffer(raw.n._buffer, raw.n._length);
        raw.n = Default::default();

        for i in 0..raw.stop._length as usize {
            free_string(*raw.stop._buffer.add(i));
        }
        free_buffer(raw.stop._buffer, raw.stop._length);
        raw.stop = Default::default();
    }
}

// ── ChatCompletionResponse ────────────────────────────────────────────────────

pub fn decode_response(raw: &sys::llama_ChatCompletionResponse) -> ChatCompletionResponse {
    let finish_reason = {
        let s = copy_string(raw.finish_reason);
        (!s.is_empty()).then_some(s)
    };
    ChatCompletionResponse {
        request_id: copy_string(raw.request_id),
        model: copy_string(raw.model),
        content: copy_string(raw.content),
        finish_reason,
        is_final: raw.is_final,
        prompt_tokens: raw.prompt_tokens,
        completion_tokens: raw.completion_tokens,
    }
}

pub fn encode_response(
    resp: &ChatCompletionResponse,
) -> Result<OwnedRaw<sys::llama_ChatCompletionResponse>, DdsError> {
    let mut out = OwnedRaw::new(
        sys::llama_ChatCompletionResponse::default(),
        free_raw_response,
    );
    out.raw.request_id = alloc_string(&resp.request_id, "request_id")?;
    out.raw.model = alloc_string(&resp.model, "model")?;
    out.raw.content = alloc_string(&resp.content, "content")?;
    out.raw.finish_reason =
        alloc_string(resp.finish_reason.as_deref().unwrap_or(""), "finish_reason")?;
    out.raw.is_final = resp.is_final;
    out.raw.prompt_tokens = resp.prompt_tokens;
    out.raw.completion_tokens = resp.completion_tokens;
    Ok(out)
}

pub fn free_raw_response(raw: &mut sys::llama_ChatCompletionResponse) {
    unsafe {
        free_string(raw.request_id);
        raw.request_id = ptr::null_mut();
        free_string(raw.model);
        raw.model = ptr::null_mut();
        free_string(raw.content);
        raw.content = ptr::null_mut();
        free_string(raw.finish_reason);
        raw.finish_reason = ptr::null_mut();
    }
}

// ── ServerStatus ──────────────────────────────────────────────────────────────

pub fn decode_status(raw: &sys::llama_ServerStatus) -> ServerStatus {
    ServerStatus {
        server_id: copy_string(raw.server_id),
        slots_idle: raw.slots_idle,
        slots_processing: raw.slots_processing,
        model_loaded: copy_string(raw.model_loaded),
        ready: raw.ready,
    }
}

pub fn encode_status(st: &ServerStatus) -> Result<OwnedRaw<sys::llama_ServerStatus>, DdsError> {
    let mut out = OwnedRaw::new(sys::llama_ServerStatus::default(), free_raw_status);
    out.raw.server_id = alloc_string(&st.server_id, "server_id")?;
    out.raw.slots_idle = st.slots_idle;
    out.raw.slots_processing = st.slots_processing;
    out.raw.model_loaded = alloc_string(&st.model_loaded, "model_loaded")?;
    out.raw.ready = st.ready;
    Ok(out)
}

pub fn free_raw_status(raw: &mut sys::llama_ServerStatus) {
    unsafe {
        free_string(raw.server_id);
        raw.server_id = ptr::null_mut();
        free_string(raw.model_loaded);
        raw.model_loaded = ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            request_id: "9f1c2d3e-0000-4000-8000-000000000001".into(),
            model: "qwen2.5-0.5b".into(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: "You are terse.".into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: "What is 2+2?".into(),
                },
            ],
            temperature: 0.7,
            max_tokens: 30,
            stream: true,
            top_p: Some(0.9),
            n: Some(1),
            stop: Some(vec!["</s>".into(), "<|end|>".into()]),
        }
    }

    #[test]
    fn request_round_trips_through_raw_form() {
        let req = sample_request();
        let raw = encode_request(&req).unwrap();
        let back = decode_request(raw.raw());
        assert_eq!(back, req);
    }

    #[test]
    fn absent_optionals_encode_as_empty_sequences() {
        let req = ChatCompletionRequest {
            request_id: "r1".into(),
            messages: vec![ChatMessage::new(crate::types::Role::User, "hi")],
            ..Default::default()
        };
        let raw = encode_request(&req).unwrap();
        assert_eq!(raw.raw().top_p._length, 0);
        assert!(raw.raw().top_p._buffer.is_null());
        assert_eq!(raw.raw().n._length, 0);
        assert_eq!(raw.raw().stop._length, 0);

        let back = decode_request(raw.raw());
        assert_eq!(back.top_p, None);
        assert_eq!(back.n, None);
        assert_eq!(back.stop, None);
    }

    #[test]
    fn response_round_trip_and_empty_finish_reason() {
        let resp = ChatCompletionResponse {
            request_id: "r2".into(),
            model: "loopback".into(),
            content: "four".into(),
            finish_reason: Some("stop".into()),
            is_final: true,
            prompt_tokens: 12,
            completion_tokens: 1,
        };
        let raw = encode_response(&resp).unwrap();
        assert_eq!(decode_response(raw.raw()), resp);

        let partial = ChatCompletionResponse {
            finish_reason: None,
            is_final: false,
            ..resp
        };
        let raw = encode_response(&partial).unwrap();
        let back = decode_response(raw.raw());
        assert_eq!(back.finish_reason, None);
    }

    #[test]
    fn status_round_trip() {
        let st = ServerStatus {
            server_id: "llama-dds-server".into(),
            slots_idle: 3,
            slots_processing: 1,
            model_loaded: "qwen2.5-0.5b".into(),
            ready: true,
        };
        let raw = encode_status(&st).unwrap();
        assert_eq!(decode_status(raw.raw()), st);
    }

    #[test]
    fn interior_nul_is_a_codec_error() {
        let mut req = sample_request();
        req.model = "bad\0model".into();
        match encode_request(&req) {
            Err(DdsError::InteriorNul { field }) => assert_eq!(field, "model"),
            other => panic!("expected InteriorNul, got {other:?}"),
        }
    }

    #[test]
    fn free_is_idempotent() {
        let req = sample_request();
        let mut raw = encode_request(&req).unwrap();
        free_raw_request(&mut raw.raw);
        // Guard drop frees again; nulled fields make it a no-op.
    }
}
