//! C layouts of the `idlc`-generated message types from `idl/LlamaDDS.idl`.
//!
//! Sequence carriers use the standard `_maximum/_length/_buffer/_release`
//! layout. `_release` records whether `_buffer` is owned by the structure;
//! for samples loaned by the reader it is managed by CycloneDDS, for samples
//! built by the codec it marks allocations the matching `free_raw_*`
//! function must release.
//!
//! Optional fields (`top_p`, `n`, `stop`) are sequences of length 0 or 1.

use std::os::raw::c_char;
use std::ptr;

#[repr(C)]
#[derive(Debug)]
pub struct llama_ChatMessage {
    pub role: *mut c_char,
    pub content: *mut c_char,
}

#[repr(C)]
#[derive(Debug)]
pub struct dds_sequence_llama_ChatMessage {
    pub _maximum: u32,
    pub _length: u32,
    pub _buffer: *mut llama_ChatMessage,
    pub _release: bool,
}

#[repr(C)]
#[derive(Debug)]
pub struct dds_sequence_float {
    pub _maximum: u32,
    pub _length: u32,
    pub _buffer: *mut f32,
    pub _release: bool,
}

#[repr(C)]
#[derive(Debug)]
pub struct dds_sequence_int32 {
    pub _maximum: u32,
    pub _length: u32,
    pub _buffer: *mut i32,
    pub _release: bool,
}

#[repr(C)]
#[derive(Debug)]
pub struct dds_sequence_string {
    pub _maximum: u32,
    pub _length: u32,
    pub _buffer: *mut *mut c_char,
    pub _release: bool,
}

#[repr(C)]
#[derive(Debug)]
pub struct llama_ChatCompletionRequest {
    pub request_id: *mut c_char,
    pub model: *mut c_char,
    pub messages: dds_sequence_llama_ChatMessage,
    pub temperature: f32,
    pub max_tokens: i32,
    pub stream: bool,
    pub top_p: dds_sequence_float,
    pub n: dds_sequence_int32,
    pub stop: dds_sequence_string,
}

#[repr(C)]
#[derive(Debug)]
pub struct llama_ChatCompletionResponse {
    pub request_id: *mut c_char,
    pub model: *mut c_char,
    pub content: *mut c_char,
    pub finish_reason: *mut c_char,
    pub is_final: bool,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
}

#[repr(C)]
#[derive(Debug)]
pub struct llama_ServerStatus {
    pub server_id: *mut c_char,
    pub slots_idle: i32,
    pub slots_processing: i32,
    pub model_loaded: *mut c_char,
    pub ready: bool,
}

macro_rules! null_seq {
    ($t:ty) => {
        impl Default for $t {
            fn default() -> Self {
                Self {
                    _maximum: 0,
                    _length: 0,
                    _buffer: ptr::null_mut(),
                    _release: false,
                }
            }
        }
    };
}

null_seq!(dds_sequence_llama_ChatMessage);
null_seq!(dds_sequence_float);
null_seq!(dds_sequence_int32);
null_seq!(dds_sequence_string);

impl Default for llama_ChatMessage {
    fn default() -> Self {
        Self {
            role: ptr::null_mut(),
            content: ptr::null_mut(),
        }
    }
}

impl Default for llama_ChatCompletionRequest {
    fn default() -> Self {
        Self {
            request_id: ptr::null_mut(),
            model: ptr::null_mut(),
            messages: Default::default(),
            temperature: 0.0,
            max_tokens: 0,
            stream: false,
            top_p: Default::default(),
            n: Default::default(),
            stop: Default::default(),
        }
    }
}

impl Default for llama_ChatCompletionResponse {
    fn default() -> Self {
        Self {
            request_id: ptr::null_mut(),
            model: ptr::null_mut(),
            content: ptr::null_mut(),
            finish_reason: ptr::null_mut(),
            is_final: false,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

impl Default for llama_ServerStatus {
    fn default() -> Self {
        Self {
            server_id: ptr::null_mut(),
            slots_idle: 0,
            slots_processing: 0,
            model_loaded: ptr::null_mut(),
            ready: false,
        }
    }
}
