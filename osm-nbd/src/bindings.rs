//! Pre-generated raw bindings to the subset of `libnbd.h` this crate uses.
//!
//! Regenerate with `cargo build -p osm-nbd --features regenerate` (requires
//! libclang and a system libnbd-dev install); the output replaces this file.

#![allow(non_camel_case_types, dead_code)]

use libc::{c_char, c_int, c_void, size_t};

/// Opaque libnbd connection handle (`struct nbd_handle`).
#[repr(C)]
pub struct nbd_handle {
    _private: [u8; 0],
}

unsafe extern "C" {
    pub fn nbd_create() -> *mut nbd_handle;
    pub fn nbd_close(h: *mut nbd_handle);

    pub fn nbd_connect_uri(h: *mut nbd_handle, uri: *const c_char) -> c_int;
    pub fn nbd_shutdown(h: *mut nbd_handle, flags: u32) -> c_int;

    pub fn nbd_get_size(h: *mut nbd_handle) -> i64;

    pub fn nbd_pread(
        h: *mut nbd_handle,
        buf: *mut c_void,
        count: size_t,
        offset: u64,
        flags: u32,
    ) -> c_int;

    /// Returns a pointer to a thread-local error string; valid until the
    /// next libnbd call on this thread. Never free it.
    pub fn nbd_get_error() -> *const c_char;
}
