//! Guest converter (C5, spec.md §4.5): invokes `virt-v2v-in-place` on
//! the attached block device.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::GuestFamily;

/// How many trailing stderr lines to surface in a `Conversion` error
/// (spec.md §4.5 "V2VFailure(stderr-tail)").
const STDERR_TAIL_LINES: usize = 20;

/// Parameters controlling one `virt-v2v-in-place` invocation.
pub struct ConvertRequest<'a> {
    pub device: &'a Path,
    pub guest_family: GuestFamily,
    /// Present only when the guest is Linux and the caller supplied one
    /// (spec.md §4.5: regenerates udev persistent-net rules).
    pub run_script: Option<&'a Path>,
    pub boot_script: Option<&'a Path>,
    pub extra_opts: Option<&'a str>,
    pub debug: bool,
}

/// Runs `virt-v2v-in-place` per the rules in spec.md §4.5. Exit is
/// binary: success, or `Error::Conversion` with the stderr tail.
pub async fn run(request: &ConvertRequest<'_>) -> Result<()> {
    let mut cmd = Command::new("virt-v2v-in-place");
    cmd.env("LIBGUESTFS_BACKEND", "direct");
    if request.debug {
        cmd.env("LIBGUESTFS_DEBUG", "1").env("LIBGUESTFS_TRACE", "1");
    }

    // The run script regenerates udev net rules from the guest's MACs;
    // only meaningful (and only passed) for Linux guests.
    if request.guest_family != GuestFamily::Windows {
        if let Some(rs) = request.run_script {
            cmd.arg("--run").arg(rs);
        }
    }
    if let Some(bs) = request.boot_script {
        cmd.arg("--firstboot").arg(bs);
    }
    if let Some(opts) = request.extra_opts {
        for opt in opts.split_whitespace() {
            cmd.arg(opt);
        }
    }
    cmd.arg("-i").arg("disk").arg(request.device);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    info!(device = %request.device.display(), "running virt-v2v-in-place");

    let output = cmd.output().await.map_err(|e| Error::Subprocess {
        program: "virt-v2v-in-place",
        detail: format!("spawn failed: {e}"),
    })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: String = stderr
        .lines()
        .rev()
        .take(STDERR_TAIL_LINES)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n");

    Err(Error::Conversion { stderr_tail: tail })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tail_of(stderr: &str) -> String {
        stderr
            .lines()
            .rev()
            .take(STDERR_TAIL_LINES)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn tail_keeps_last_n_lines() {
        let stderr = (1..=30).map(|n| format!("line {n}")).collect::<Vec<_>>().join("\n");
        let tail = tail_of(&stderr);
        assert_eq!(tail.lines().count(), STDERR_TAIL_LINES);
        assert!(tail.starts_with("line 11"));
        assert!(tail.ends_with("line 30"));
    }
}
