//! Process supervisor (C1, spec.md §4.1): launches nbdkit, nbdcopy and
//! virt-v2v-in-place as the leader of a new process group, waits for
//! readiness, and guarantees teardown on every exit path.
//!
//! Grounded on the teacher's process-lifecycle idiom (`bux/src/runtime.rs`'s
//! `is_pid_alive`/graceful-then-forceful `stop`) adapted to subprocesses
//! this engine itself spawns rather than a long-lived VM runtime.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::run::CancelToken;

/// How long the supervisor waits for nbdkit to become ready
/// (spec.md §4.1, §5 "Hard timeouts").
const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll period while waiting for readiness.
const READY_POLL: Duration = Duration::from_secs(2);

/// Where nbdkit listens: a Unix socket (required for concurrent
/// migrations on one host) or the default TCP port.
#[derive(Debug, Clone)]
pub enum Endpoint {
    UnixSocket(PathBuf),
    Tcp { port: u16 },
}

impl Endpoint {
    /// The `nbd+unix:///?socket=<path>` or `nbd://localhost` URI used by
    /// `nbdcopy`/libnbd to address this endpoint (spec.md §4.4).
    #[must_use]
    pub fn nbd_uri(&self) -> String {
        match self {
            Self::UnixSocket(path) => format!("nbd+unix:///?socket={}", path.display()),
            Self::Tcp { .. } => "nbd://localhost".to_owned(),
        }
    }
}

/// A supervised child process: owns its Unix process group and,
/// optionally, a socket file to unlink on teardown.
///
/// Dropping a `Supervised` without calling [`Supervised::stop`] first
/// leaks the child; callers must treat this as a scoped resource and
/// call `stop` on every exit path (spec.md §4.1, §9 "Subprocess
/// lifecycle"). `stop` itself is idempotent and safe to call more than
/// once or after the child has already exited.
pub struct Supervised {
    program: &'static str,
    child: Option<Child>,
    pgid: i32,
    socket_to_unlink: Option<PathBuf>,
}

impl Supervised {
    /// Spawns `program` as the leader of a new process group, piping
    /// stdout/stderr for line-prefixed log forwarding.
    fn spawn(program: &'static str, mut command: Command) -> Result<Self> {
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command.spawn().map_err(|e| Error::Subprocess {
            program,
            detail: format!("spawn failed: {e}"),
        })?;

        let pgid = child.id().ok_or_else(|| Error::Subprocess {
            program,
            detail: "child exited immediately after spawn".to_owned(),
        })? as i32;

        pump_stream(program, "stdout", child.stdout.take());
        pump_stream(program, "stderr", child.stderr.take());

        Ok(Self {
            program,
            child: Some(child),
            pgid,
            socket_to_unlink: None,
        })
    }

    /// Spawns nbdkit exporting `backing_path` over VDDK (or the plain
    /// `file` plugin, for the local-NFS-path mode), listening on
    /// `endpoint`, and waits for readiness.
    pub async fn start_nbdkit(
        endpoint: Endpoint,
        nbdkit_args: &[String],
    ) -> Result<Self> {
        let mut cmd = Command::new("nbdkit");
        cmd.args(nbdkit_args);
        let mut supervised = Self::spawn("nbdkit", cmd)?;
        if let Endpoint::UnixSocket(path) = &endpoint {
            supervised.socket_to_unlink = Some(path.clone());
        }
        supervised.wait_ready(&endpoint).await?;
        Ok(supervised)
    }

    /// Spawns `nbdcopy <source> <device> [--destination-is-zero] --progress`
    /// and waits for it to exit (spec.md §4.4 full copy).
    pub async fn run_nbdcopy(
        source_uri: &str,
        device: &Path,
        destination_is_zero: bool,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut cmd = Command::new("nbdcopy");
        cmd.arg(source_uri).arg(device).arg("--progress");
        if destination_is_zero {
            cmd.arg("--destination-is-zero");
        }
        let mut supervised = Self::spawn("nbdcopy", cmd)?;
        let status = supervised.wait_with_cancel(cancel).await?;
        supervised.stop();
        if status.success() {
            Ok(())
        } else {
            Err(Error::Subprocess {
                program: "nbdcopy",
                detail: format!("exited with {status}"),
            })
        }
    }

    /// Polls for readiness: the socket file existing, or a successful TCP
    /// dial to `localhost:10809`, up to [`READY_TIMEOUT`].
    async fn wait_ready(&self, endpoint: &Endpoint) -> Result<()> {
        let check = async {
            loop {
                let ready = match endpoint {
                    Endpoint::UnixSocket(path) => path.exists(),
                    Endpoint::Tcp { port } => {
                        tokio::net::TcpStream::connect(("127.0.0.1", *port))
                            .await
                            .is_ok()
                    }
                };
                if ready {
                    return;
                }
                sleep(READY_POLL).await;
            }
        };

        if timeout(READY_TIMEOUT, check).await.is_err() {
            return Err(Error::Subprocess {
                program: self.program,
                detail: "not ready within 30s".to_owned(),
            });
        }
        info!(program = self.program, "subprocess ready");
        Ok(())
    }

    /// Waits for the child to exit, checking `cancel` between polls so a
    /// cancelled migration doesn't block on a hung subprocess forever.
    async fn wait_with_cancel(&mut self, cancel: &CancelToken) -> Result<std::process::ExitStatus> {
        let child = self
            .child
            .as_mut()
            .expect("wait called on a process already stopped");
        loop {
            cancel.check()?;
            match timeout(Duration::from_millis(500), child.wait()).await {
                Ok(Ok(status)) => return Ok(status),
                Ok(Err(e)) => {
                    return Err(Error::Subprocess {
                        program: self.program,
                        detail: format!("wait failed: {e}"),
                    })
                }
                Err(_elapsed) => continue,
            }
        }
    }

    /// `SIGKILL`s the whole process group, then best-effort unlinks the
    /// socket file. Idempotent; safe to call multiple times and on every
    /// exit path (spec.md §4.1).
    pub fn stop(&mut self) {
        if self.child.is_some() {
            // Negated pid targets the whole process group (spec.md §4.1).
            if let Err(e) = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(-self.pgid),
                nix::sys::signal::Signal::SIGKILL,
            ) {
                warn!(program = self.program, error = %e, "failed to signal process group");
            }
            self.child = None;
        }
        if let Some(path) = self.socket_to_unlink.take() {
            match std::fs::remove_file(&path) {
                Ok(()) | Err(_) => {}
            }
        }
    }
}

impl Drop for Supervised {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns a task that line-buffers `stream` and forwards each line to the
/// structured log, prefixed with `program`/`label`. EOF is not an error
/// (spec.md §4.1).
fn pump_stream<R>(program: &'static str, label: &'static str, stream: Option<R>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(stream) = stream else { return };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(program, stream = label, "{line}"),
                Ok(None) => break,
                Err(e) => {
                    warn!(program, stream = label, error = %e, "log pump read error");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_socket_uri_shape() {
        let ep = Endpoint::UnixSocket(PathBuf::from("/tmp/osm-nbdkit-vm-abcd1234.sock"));
        assert_eq!(ep.nbd_uri(), "nbd+unix:///?socket=/tmp/osm-nbdkit-vm-abcd1234.sock");
    }

    #[test]
    fn tcp_uri_is_localhost() {
        let ep = Endpoint::Tcp { port: 10809 };
        assert_eq!(ep.nbd_uri(), "nbd://localhost");
    }
}
