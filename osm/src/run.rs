//! Per-invocation run context: run-id generation, log file naming, and
//! VM-name sanitization (spec.md Glossary: "safe name", "run id").

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Generates an 8-hex-digit run id.
///
/// Grounded on the teacher's `gen_id()` (`bux/src/state.rs`): a
/// `RandomState` hasher seeded with the process id and current time,
/// rather than pulling in a `rand`/`uuid` dependency for an identifier
/// that only needs to be unlikely to collide within one conversion
/// host's lifetime, not cryptographically random.
#[must_use]
pub fn gen_run_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut h = RandomState::new().build_hasher();
    h.write_u64(u64::from(std::process::id()));
    h.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    format!("{:08x}", h.finish() as u32)
}

/// Transliterates and sanitizes a VM name into the `[A-Za-z0-9_]`
/// alphabet used in log file names and nbdkit socket paths.
///
/// Rules (spec.md Glossary "safe name"):
/// - Common Latin-1 accented letters fold to their unaccented ASCII
///   equivalent; typographic punctuation (smart quotes, en/em dash)
///   folds to `_`.
/// - Any other non-`[A-Za-z0-9_]` byte becomes `_`.
/// - Consecutive `_` collapse to one.
/// - The result is truncated to 64 bytes and has trailing `_` trimmed.
/// - An empty result becomes `"vm"`.
#[must_use]
pub fn safe_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_underscore = false;

    for ch in name.chars() {
        let folded = fold_char(ch);
        match folded {
            Some(c) => {
                out.push(c);
                last_was_underscore = false;
            }
            None => {
                if !last_was_underscore {
                    out.push('_');
                    last_was_underscore = true;
                }
            }
        }
    }

    let truncated: String = out.chars().take(64).collect();
    let trimmed = truncated.trim_end_matches('_');

    if trimmed.is_empty() {
        "vm".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Folds one character to its `[A-Za-z0-9_]` equivalent, or `None` if it
/// should become a separator.
fn fold_char(ch: char) -> Option<char> {
    if ch.is_ascii_alphanumeric() || ch == '_' {
        return Some(ch);
    }
    let folded = match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => Some('a'),
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => Some('e'),
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => Some('i'),
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => Some('o'),
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => Some('u'),
        'ñ' | 'Ñ' => Some('n'),
        'ç' | 'Ç' => Some('c'),
        'ý' | 'ÿ' | 'Ý' => Some('y'),
        _ => None,
    };
    if let Some(c) = folded {
        return Some(c);
    }
    // Typographic punctuation and everything else not already handled
    // falls through to the underscore-separator path.
    None
}

/// Cooperative cancellation flag shared between the orchestrator and the
/// subprocess/network calls it drives. Checked at I/O boundaries, never
/// polled in a tight loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token that is not yet cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token cancelled. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns whether the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns `Err(Error::Cancelled)` if the token has been cancelled.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Per-invocation context: the run id, sanitized VM name, and resolved
/// log file path, plus the cancellation token threaded through the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// 8-hex-digit id unique to this invocation.
    pub run_id: String,
    /// Sanitized VM name, used in file and socket names.
    pub safe_name: String,
    /// Resolved path to this invocation's log file.
    pub log_file: PathBuf,
    /// Cancellation flag threaded through supervised operations.
    pub cancel: CancelToken,
}

impl RunContext {
    /// Builds a new run context for `vmname`, rooting the log file under
    /// `data_dir` (default `/tmp` when `None`, per spec.md Glossary).
    #[must_use]
    pub fn new(vmname: &str, data_dir: Option<&str>) -> Self {
        let run_id = gen_run_id();
        let safe = safe_name(vmname);
        let dir = data_dir.unwrap_or("/tmp");
        let log_file = PathBuf::from(dir).join(format!("osm-nbdkit-{safe}-{run_id}.log"));
        Self {
            run_id,
            safe_name: safe,
            log_file,
            cancel: CancelToken::new(),
        }
    }

    /// Path for the nbdkit Unix domain socket used by this run, when
    /// `use_socks` is set (spec.md §4.1). Named `nbdkit-<safe-vm>-<run-id>.sock`
    /// (no `osm-` prefix, unlike the log file) so it matches the §8
    /// cleanup glob `/tmp/nbdkit-<safe-vm>-*.sock`.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("nbdkit-{}-{}.sock", self.safe_name, self.run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_name_keeps_plain_ascii() {
        assert_eq!(safe_name("web-server-01"), "web-server-01".replace('-', "_"));
    }

    #[test]
    fn safe_name_folds_accents() {
        assert_eq!(safe_name("café"), "cafe");
    }

    #[test]
    fn safe_name_collapses_consecutive_separators() {
        assert_eq!(safe_name("a   b"), "a_b");
    }

    #[test]
    fn safe_name_trims_trailing_underscore() {
        assert_eq!(safe_name("trailing!!!"), "trailing");
    }

    #[test]
    fn safe_name_truncates_to_64() {
        let long = "a".repeat(100);
        assert_eq!(safe_name(&long).len(), 64);
    }

    #[test]
    fn safe_name_empty_becomes_vm() {
        assert_eq!(safe_name("!!!"), "vm");
    }

    #[test]
    fn run_ids_are_eight_hex_digits() {
        let id = gen_run_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cancel_token_round_trips() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.check().is_err());
    }

    #[test]
    fn run_context_roots_log_file_under_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = RunContext::new("rhel-9.4-1", Some(dir.path().to_str().unwrap()));
        assert_eq!(ctx.log_file.parent(), Some(dir.path()));
        assert!(ctx
            .log_file
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("osm-nbdkit-rhel_9_4_1-"));
    }
}
