//! C ABI
//!
//! Every entry point returns null (or nothing) on failure and stores the message
//! in a per-thread slot read back with [`mtmd_session_last_error`].
//! Returned text stays valid until the next call on the same handle.
//!
//! See `include/mtmd_session.h`.

use std::{
    any::Any,
    cell::RefCell,
    ffi::{c_char, c_int, c_void, CStr, CString},
    panic::{catch_unwind, AssertUnwindSafe},
    ptr,
};

use log::error;

use crate::{
    decoder::{Generation, StreamControl},
    error::Error,
    llama::{self, LlamaSession},
    options::SessionOptions,
    utils::log::init_logger_from_env,
};

/// Token callback: 0 continues, non-zero stops the generation.
pub type StreamCallback = Option<unsafe extern "C" fn(token: *const c_char, user_data: *mut c_void) -> c_int>;

/// Opaque session handle handed to C callers.
pub struct SessionHandle {
    session: LlamaSession,
    /// 最近一次推理结果, 返回给调用方的指针指向这里
    output: CString,
}

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

fn set_last_error(err: &Error) {
    error!("{}: {}", err.kind(), err);
    let message = to_c_string(&format!("{}: {}", err.kind(), err));
    LAST_ERROR.with(|slot| *slot.borrow_mut() = message);
}

fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = CString::default());
}

/// Interior NUL bytes are dropped, C strings cannot carry them.
fn to_c_string(text: &str) -> CString {
    let bytes: Vec<u8> = text.bytes().filter(|b| *b != 0).collect();
    CString::new(bytes).unwrap_or_default()
}

unsafe fn c_str<'a>(value: *const c_char, field: &str) -> Result<&'a str, Error> {
    if value.is_null() {
        return Err(Error::InvalidInput {
            field: field.to_string(),
            message: "null pointer".to_string(),
        });
    }
    CStr::from_ptr(value).to_str().map_err(|e| Error::InvalidInput {
        field: field.to_string(),
        message: e.to_string(),
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}

/// Runs `f`, turning errors and panics into the last error slot.
///
/// `on_panic` classifies a caught panic: `Error::Backend` while loading,
/// `Error::InferencePanic` during a request.
fn guard<T>(on_panic: fn(String) -> Error, f: impl FnOnce() -> Result<T, Error>) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => {
            clear_last_error();
            Some(value)
        }
        Ok(Err(e)) => {
            set_last_error(&e);
            None
        }
        Err(payload) => {
            set_last_error(&on_panic(panic_message(payload)));
            None
        }
    }
}

fn init_handle(options: SessionOptions) -> *mut SessionHandle {
    init_logger_from_env();

    guard(Error::Backend, || {
        let session = llama::init(&options)?;
        Ok(Box::into_raw(Box::new(SessionHandle {
            session,
            output: CString::default(),
        })))
    })
    .unwrap_or(ptr::null_mut())
}

/// Stores the result text in the handle and returns a pointer to it.
fn publish(handle: &mut SessionHandle, generation: Generation) -> *const c_char {
    handle.output = to_c_string(&generation.text);
    handle.output.as_ptr()
}

fn stream_control(callback: StreamCallback, piece: &str) -> StreamControl {
    let Some(callback) = callback else {
        return StreamControl::Continue;
    };
    let piece = to_c_string(piece);
    // user_data 固定为 null
    if unsafe { callback(piece.as_ptr(), ptr::null_mut()) } != 0 {
        StreamControl::Stop
    } else {
        StreamControl::Continue
    }
}

unsafe fn handle_mut<'a>(handle: *mut SessionHandle) -> Result<&'a mut SessionHandle, Error> {
    handle.as_mut().ok_or_else(|| Error::InvalidInput {
        field: "handle".to_string(),
        message: "null pointer".to_string(),
    })
}

unsafe fn buffer<'a>(data: *const u8, len: usize) -> Result<&'a [u8], Error> {
    if data.is_null() {
        if len == 0 {
            return Ok(&[]);
        }
        return Err(Error::InvalidInput {
            field: "data".to_string(),
            message: "null pointer".to_string(),
        });
    }
    Ok(std::slice::from_raw_parts(data, len))
}

/// GPU defaults: n_ctx 4096, n_predict 512, greedy sampling.
///
/// # Safety
/// `model_path` and `mmproj_path` must be valid NUL terminated strings.
#[no_mangle]
pub unsafe extern "C" fn mtmd_session_init_default(
    model_path: *const c_char,
    mmproj_path: *const c_char,
) -> *mut SessionHandle {
    let paths = guard(Error::Backend, || Ok((c_str(model_path, "model_path")?, c_str(mmproj_path, "mmproj_path")?)));
    match paths {
        Some((model, mmproj)) => init_handle(SessionOptions::gpu_default(model, mmproj)),
        None => ptr::null_mut(),
    }
}

/// CPU only defaults.
///
/// # Safety
/// `model_path` and `mmproj_path` must be valid NUL terminated strings.
#[no_mangle]
pub unsafe extern "C" fn mtmd_session_init_default_cpu(
    model_path: *const c_char,
    mmproj_path: *const c_char,
) -> *mut SessionHandle {
    let paths = guard(Error::Backend, || Ok((c_str(model_path, "model_path")?, c_str(mmproj_path, "mmproj_path")?)));
    match paths {
        Some((model, mmproj)) => init_handle(SessionOptions::cpu_default(model, mmproj)),
        None => ptr::null_mut(),
    }
}

/// `n_ctx` is the generation budget, the context gets 256 extra positions.
///
/// # Safety
/// `model_path` and `mmproj_path` must be valid NUL terminated strings.
#[no_mangle]
pub unsafe extern "C" fn mtmd_session_init_with_params(
    model_path: *const c_char,
    mmproj_path: *const c_char,
    n_ctx: c_int,
    use_gpu: bool,
    n_threads: c_int,
) -> *mut SessionHandle {
    let options = guard(Error::Backend, || {
        let n_ctx = u32::try_from(n_ctx)
            .map_err(|e| Error::InvalidParameter(format!("n_ctx {n_ctx}: {e}")))?;
        Ok(SessionOptions::with_params(
            c_str(model_path, "model_path")?,
            c_str(mmproj_path, "mmproj_path")?,
            n_ctx,
            use_gpu,
            n_threads,
        ))
    });
    match options {
        Some(options) => init_handle(options),
        None => ptr::null_mut(),
    }
}

/// Releases the session, null is ignored.
///
/// # Safety
/// `handle` must come from one of the init functions and be freed only once.
#[no_mangle]
pub unsafe extern "C" fn mtmd_session_free(handle: *mut SessionHandle) {
    if handle.is_null() {
        return;
    }
    drop(Box::from_raw(handle));
}

/// # Safety
/// `handle` must be live, `image_path` a valid NUL terminated string.
#[no_mangle]
pub unsafe extern "C" fn mtmd_session_infer_path(
    handle: *mut SessionHandle,
    image_path: *const c_char,
) -> *const c_char {
    guard(Error::InferencePanic, || {
        let handle = handle_mut(handle)?;
        let generation = handle.session.infer_path(c_str(image_path, "image_path")?)?;
        Ok(publish(handle, generation))
    })
    .unwrap_or(ptr::null())
}

/// # Safety
/// `handle` must be live, `image_path` a valid NUL terminated string.
#[no_mangle]
pub unsafe extern "C" fn mtmd_session_infer_path_stream(
    handle: *mut SessionHandle,
    image_path: *const c_char,
    callback: StreamCallback,
) -> *const c_char {
    guard(Error::InferencePanic, || {
        let handle = handle_mut(handle)?;
        let path = c_str(image_path, "image_path")?;
        let generation = handle
            .session
            .infer_path_stream(path, |piece| stream_control(callback, piece))?;
        Ok(publish(handle, generation))
    })
    .unwrap_or(ptr::null())
}

/// # Safety
/// `handle` must be live, `data` must point at `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn mtmd_session_infer_mem(
    handle: *mut SessionHandle,
    data: *const u8,
    len: usize,
) -> *const c_char {
    guard(Error::InferencePanic, || {
        let handle = handle_mut(handle)?;
        let generation = handle.session.infer_buffer(buffer(data, len)?)?;
        Ok(publish(handle, generation))
    })
    .unwrap_or(ptr::null())
}

/// # Safety
/// `handle` must be live, `data` must point at `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn mtmd_session_infer_mem_stream(
    handle: *mut SessionHandle,
    data: *const u8,
    len: usize,
    callback: StreamCallback,
) -> *const c_char {
    guard(Error::InferencePanic, || {
        let handle = handle_mut(handle)?;
        let data = buffer(data, len)?;
        let generation = handle
            .session
            .infer_buffer_stream(data, |piece| stream_control(callback, piece))?;
        Ok(publish(handle, generation))
    })
    .unwrap_or(ptr::null())
}

/// Message of the last failure on the calling thread, empty when the last call succeeded.
#[no_mangle]
pub extern "C" fn mtmd_session_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ptr())
}
