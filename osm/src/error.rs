//! Error taxonomy for the migration engine (spec.md §7).

/// Alias for `Result<T, osm::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by VMware session, OpenStack session, process
/// supervisor, data mover, guest converter, or orchestrator operations.
///
/// Each variant corresponds to one row of the abstract error taxonomy in
/// spec.md §7. Contextual fields (VM name, disk key) are attached at the
/// point an error becomes fatal to a disk or VM, not by re-wrapping.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// vCenter or OpenStack login was rejected.
    #[error("authentication failed against {target}: {message}")]
    Auth {
        /// `"vcenter"` or `"openstack"`.
        target: &'static str,
        /// Server-reported or transport-level detail.
        message: String,
    },

    /// A VM, volume, or other named resource could not be located.
    #[error("{what} not found: {name}")]
    NotFound {
        /// What kind of thing was searched for (`"VM"`, `"volume"`, ...).
        what: &'static str,
        /// The name or path that was searched for.
        name: String,
    },

    /// More than one resource matched a lookup that must be unique.
    #[error("ambiguous {what}: {detail}")]
    Ambiguous {
        /// What kind of thing was ambiguous.
        what: &'static str,
        /// Human-readable detail (e.g. the matching ids).
        detail: String,
    },

    /// An operation's precondition failed in a way that is fatal to the
    /// current disk but carries useful state for the caller (e.g. "volume
    /// already exists").
    #[error("{message}")]
    Precondition {
        /// Message surfaced verbatim in the module JSON response.
        message: String,
        /// The existing volume id, when the precondition concerns one.
        existing_volume_id: Option<String>,
    },

    /// A recoverable failure: the caller should re-authenticate and retry
    /// once before escalating.
    #[error("transient failure: {message}")]
    Transient {
        /// Detail of the transient condition.
        message: String,
    },

    /// A supervised subprocess (nbdkit, nbdcopy) failed to start, become
    /// ready, or exited non-zero.
    #[error("subprocess {program} failed: {detail}")]
    Subprocess {
        /// The program name (`"nbdkit"`, `"nbdcopy"`).
        program: &'static str,
        /// Failure detail (spawn error, readiness timeout, or exit status).
        detail: String,
    },

    /// `virt-v2v-in-place` exited non-zero. The disk's data copy already
    /// succeeded; only the guest conversion failed.
    #[error("virt-v2v-in-place failed: {stderr_tail}")]
    Conversion {
        /// The last lines of virt-v2v's stderr, for diagnosis.
        stderr_tail: String,
    },

    /// The per-invocation context was cancelled while a blocking call was
    /// in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// A libnbd-level failure during CBT delta sync.
    #[error(transparent)]
    Nbd(#[from] osm_nbd::Error),

    /// An I/O error from local filesystem or subprocess plumbing.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An HTTP transport error talking to vCenter or OpenStack.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// A SOAP fault or malformed response from vCenter.
    #[error(transparent)]
    Soap(#[from] crate::vmware::soap::SoapError),

    /// A malformed JSON response, or malformed durable volume metadata
    /// (spec.md §4.3 `IsConverted`: "parse error is fatal").
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for the `NotFound` variant.
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }

    /// Shorthand for the `Ambiguous` variant.
    pub fn ambiguous(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Ambiguous {
            what,
            detail: detail.into(),
        }
    }

    /// Shorthand for the `Transient` variant.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }
}
