//! Narrow, safe wrapper around `libnbd`, scoped to the CBT delta-sync read
//! path of the osm migration engine: connect to an nbdkit export by URI,
//! read one changed extent at a time, and report the export's size.
//!
//! All `unsafe` code is confined to this module; everything built on top
//! uses [`Handle`].

#![allow(unsafe_code)]

mod bindings;

use std::ffi::CString;
use std::os::raw::c_void;

/// Alias for `Result<T, osm_nbd::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by libnbd operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// libnbd returned a non-zero status; `message` is `nbd_get_error()`'s
    /// value captured at the point of failure.
    #[error("{op}: {message}")]
    Nbd {
        /// The FFI operation that failed.
        op: &'static str,
        /// The error string libnbd reported.
        message: String,
    },

    /// A string argument (typically the connection URI) contained an
    /// interior NUL byte.
    #[error("interior NUL byte in libnbd argument")]
    Nul(#[from] std::ffi::NulError),

    /// `nbd_create` returned a null handle.
    #[error("nbd_create returned a null handle")]
    CreateFailed,
}

/// Reads the current thread-local libnbd error string.
fn last_error() -> String {
    unsafe {
        let p = bindings::nbd_get_error();
        if p.is_null() {
            "unknown libnbd error".to_owned()
        } else {
            std::ffi::CStr::from_ptr(p).to_string_lossy().into_owned()
        }
    }
}

/// Converts a libnbd return code (`< 0` on failure) into a [`Result`].
fn check(op: &'static str, ret: i32) -> Result<()> {
    if ret < 0 {
        Err(Error::Nbd {
            op,
            message: last_error(),
        })
    } else {
        Ok(())
    }
}

/// A connected libnbd handle exporting a single disk.
///
/// Dropping the handle shuts down the connection and frees libnbd's
/// resources; this always happens, even on an error path, because the
/// handle is only ever owned by this type.
#[derive(Debug)]
pub struct Handle {
    raw: *mut bindings::nbd_handle,
}

// SAFETY: libnbd serializes all access to a given handle internally and
// documents that a handle may be used from any single thread at a time;
// we never share a `Handle` across threads concurrently (the CBT delta
// sync loop owns it exclusively), so `Send` is sound.
unsafe impl Send for Handle {}

impl Handle {
    /// Creates a new libnbd handle and connects it to `uri`
    /// (`nbd+unix:///?socket=<path>` or `nbd://localhost`).
    pub fn connect_uri(uri: &str) -> Result<Self> {
        let raw = unsafe { bindings::nbd_create() };
        if raw.is_null() {
            return Err(Error::CreateFailed);
        }
        let handle = Self { raw };

        let c_uri = CString::new(uri)?;
        check("connect_uri", unsafe {
            bindings::nbd_connect_uri(handle.raw, c_uri.as_ptr())
        })?;
        Ok(handle)
    }

    /// Returns the size in bytes of the connected export.
    pub fn size(&self) -> Result<u64> {
        let size = unsafe { bindings::nbd_get_size(self.raw) };
        if size < 0 {
            Err(Error::Nbd {
                op: "get_size",
                message: last_error(),
            })
        } else {
            #[allow(clippy::cast_sign_loss)]
            Ok(size as u64)
        }
    }

    /// Reads exactly `buf.len()` bytes starting at `offset` from the
    /// export into `buf`.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        check("pread", unsafe {
            bindings::nbd_pread(
                self.raw,
                buf.as_mut_ptr().cast::<c_void>(),
                buf.len(),
                offset,
                0,
            )
        })
    }

    /// Performs an orderly NBD shutdown of the connection. Called
    /// automatically on drop if not called explicitly; errors here are
    /// non-fatal (the socket will close regardless) and only logged by
    /// the caller if they choose to call this directly.
    pub fn shutdown(&self) -> Result<()> {
        check("shutdown", unsafe { bindings::nbd_shutdown(self.raw, 0) })
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let _ = self.shutdown();
        unsafe { bindings::nbd_close(self.raw) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_uri_rejects_interior_nul() {
        let err = Handle::connect_uri("nbd+unix:///?socket=/tmp/a\0b");
        assert!(matches!(err, Err(Error::Nul(_))));
    }
}
