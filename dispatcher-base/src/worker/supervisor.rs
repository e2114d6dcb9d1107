//! Launches and supervises a Worker child process: passes it the socket
//! path it must bind, waits for a one-shot readiness signal delivered over
//! an inherited pipe descriptor, monitors liveness, and terminates it
//! (gracefully, then forcefully) on shutdown.
//!
//! The readiness handshake avoids a thundering herd of connection attempts
//! against a Worker's socket while it is still warming up: the supervisor
//! waits on a pipe read rather than polling `connect()`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Environment variable naming the Unix socket path the Worker must create.
pub const ENV_SOCKET_PATH: &str = "DISPATCHER_WORKER_SOCKET_PATH";
/// Environment variable naming the file descriptor number the Worker must
/// write a single byte to, then close, once it is ready to accept
/// connections on its socket.
pub const ENV_READINESS_FD: &str = "DISPATCHER_WORKER_READINESS_FD";

/// The fixed fd number the readiness pipe's write end is duplicated to
/// inside the child before `exec`, so the Worker doesn't need to parse an
/// arbitrary number out of its own open-fd table — it is always this one.
const READINESS_FD_IN_CHILD: RawFd = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Ready,
    Dead,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to create the readiness pipe: {0}")]
    PipeCreation(#[source] io::Error),
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] io::Error),
    #[error("worker did not signal readiness within {0:?}")]
    ReadinessTimeout(Duration),
    #[error("readiness pipe closed before a readiness byte was received")]
    ReadinessPipeClosed,
    #[error("I/O error waiting for worker readiness: {0}")]
    ReadinessIo(#[source] io::Error),
}

/// Creates an anonymous pipe and prepares its write end to be inherited by
/// exactly one child process at a fixed fd number. Returns the read end
/// (kept by the supervisor, non-inheritable) and the raw write fd (still
/// open in this process until [`close_parent_write_end`] is called after
/// spawn, matching the "parent closes its copies of the child-only ends
/// immediately after spawn" contract).
fn create_readiness_pipe() -> Result<(OwnedFd, RawFd), io::Error> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` is a valid pointer to two `RawFd` slots, as required by
    // `pipe(2)`.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    // The read end is ours alone; never let it leak across an exec.
    // SAFETY: `read_fd` was just created by `pipe(2)` above and is valid.
    let rc = unsafe { libc::fcntl(read_fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        // SAFETY: both fds are valid and owned by us at this point.
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        return Err(err);
    }

    // SAFETY: `read_fd` is a valid, newly created, owned file descriptor.
    let read_fd = unsafe { OwnedFd::from_raw_fd(read_fd) };
    Ok((read_fd, write_fd))
}

fn close_fd(fd: RawFd) {
    // SAFETY: caller guarantees `fd` is a valid, owned descriptor not used
    // again afterwards.
    unsafe {
        libc::close(fd);
    }
}

/// Owns a spawned Worker process and its lifecycle state.
pub struct Supervisor {
    child: Child,
    worker_id: String,
    socket_path: PathBuf,
    state: Arc<Mutex<WorkerState>>,
    /// The readiness pipe's read end, consumed exactly once by
    /// [`Supervisor::wait_for_ready`].
    readiness_read: Option<OwnedFd>,
}

impl Supervisor {
    /// Spawns `program` with `args`, passing it `socket_path` and a
    /// readiness fd via environment, plus any `extra_env`. Does not wait
    /// for readiness; call [`Supervisor::wait_for_ready`] for that.
    pub fn spawn(
        program: impl AsRef<OsStr>,
        args: impl IntoIterator<Item = impl AsRef<OsStr>>,
        worker_id: impl Into<String>,
        socket_path: impl Into<PathBuf>,
        extra_env: HashMap<String, String>,
    ) -> Result<Self, SupervisorError> {
        let worker_id = worker_id.into();
        let socket_path = socket_path.into();

        let (readiness_read, readiness_write) =
            create_readiness_pipe().map_err(SupervisorError::PipeCreation)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(extra_env)
            .env(ENV_SOCKET_PATH, &socket_path)
            .env(ENV_READINESS_FD, READINESS_FD_IN_CHILD.to_string())
            .stdin(Stdio::null());

        // SAFETY: `pre_exec` runs after `fork` and before `exec` in the
        // child; at that point the child's fd table is a copy of the
        // parent's, so `readiness_write` still refers to our pipe. We dup2
        // it onto the fixed fd the Worker contract promises, then close the
        // original copy so the child ends up with exactly one descriptor
        // for the write end. This closure must only call async-signal-safe
        // functions, which `dup2`/`close` are.
        unsafe {
            command.pre_exec(move || {
                if libc::dup2(readiness_write, READINESS_FD_IN_CHILD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                if readiness_write != READINESS_FD_IN_CHILD {
                    libc::close(readiness_write);
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(SupervisorError::Spawn)?;

        // Parent closes its copy of the child-only write end immediately.
        close_fd(readiness_write);

        let state = Arc::new(Mutex::new(WorkerState::Spawning));
        Ok(Self {
            child,
            worker_id,
            socket_path,
            state,
            readiness_read: Some(readiness_read),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    /// Blocks (asynchronously) until the Worker writes its readiness byte,
    /// or `timeout` elapses, whichever comes first.
    pub async fn wait_for_ready(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        let read_fd = self
            .readiness_read
            .take()
            .expect("wait_for_ready called more than once");

        // SAFETY: set non-blocking so AsyncFd can drive it via the reactor.
        unsafe {
            let flags = libc::fcntl(read_fd.as_raw_fd(), libc::F_GETFL);
            libc::fcntl(read_fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let async_fd = AsyncFd::new(read_fd).map_err(SupervisorError::ReadinessIo)?;

        let result = tokio::time::timeout(timeout, async move {
            loop {
                let mut guard = async_fd.readable().await.map_err(SupervisorError::ReadinessIo)?;
                let mut byte = [0u8; 1];
                match guard.try_io(|inner| {
                    // SAFETY: `inner.get_ref()` is the owned, non-blocking
                    // read fd; reading one byte into a stack buffer is safe.
                    let rc = unsafe {
                        libc::read(
                            inner.get_ref().as_raw_fd(),
                            byte.as_mut_ptr() as *mut libc::c_void,
                            1,
                        )
                    };
                    if rc < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(rc)
                    }
                }) {
                    Ok(Ok(0)) => return Err(SupervisorError::ReadinessPipeClosed),
                    Ok(Ok(_)) => return Ok(()),
                    Ok(Err(err)) => return Err(SupervisorError::ReadinessIo(err)),
                    Err(_would_block) => continue,
                }
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {
                *self.state.lock().unwrap() = WorkerState::Ready;
                info!(worker_id = %self.worker_id, "worker signalled readiness");
                Ok(())
            }
            Ok(Err(err)) => {
                *self.state.lock().unwrap() = WorkerState::Dead;
                Err(err)
            }
            Err(_elapsed) => {
                *self.state.lock().unwrap() = WorkerState::Dead;
                Err(SupervisorError::ReadinessTimeout(timeout))
            }
        }
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_status)) => {
                *self.state.lock().unwrap() = WorkerState::Dead;
                false
            }
            Err(_) => false,
        }
    }

    /// Sends a graceful termination signal, polls for exit for up to
    /// `graceful_timeout`, and falls back to a forceful kill if the Worker
    /// hasn't exited by then.
    pub async fn stop(&mut self, graceful_timeout: Duration) {
        if let Some(pid) = self.child.id() {
            // SAFETY: `pid` is the child's own pid as reported by the OS;
            // sending SIGTERM to it is always valid.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        let graceful = tokio::time::timeout(graceful_timeout, self.child.wait()).await;
        if graceful.is_err() {
            warn!(worker_id = %self.worker_id, "worker did not exit gracefully, killing");
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }

        *self.state.lock().unwrap() = WorkerState::Dead;
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if *self.state.lock().unwrap() != WorkerState::Dead {
            if let Some(pid) = self.child.id() {
                // Best-effort: `stop()` is the graceful path; a Supervisor
                // dropped without an explicit `stop()` call only gets the
                // forceful signal, since Drop cannot await.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readiness_timeout_marks_the_worker_dead() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("w.sock");

        // `sleep` never writes to the readiness fd, so this must time out.
        let mut supervisor = Supervisor::spawn(
            "sleep",
            ["5"],
            "worker-1",
            &socket_path,
            HashMap::new(),
        )
        .unwrap();

        let err = supervisor
            .wait_for_ready(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ReadinessTimeout(_)));
        assert_eq!(supervisor.state(), WorkerState::Dead);
        supervisor.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn worker_writing_its_readiness_byte_transitions_to_ready() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("w.sock");

        // A tiny shell script that reads the fd number from the
        // environment and writes one byte to it before sleeping, standing
        // in for a real model-serving Worker in this test.
        let script = format!(
            "fd=${ENV_READINESS_FD}; printf '\\1' >&$fd; exec {fd_close}; sleep 5",
            fd_close = "$fd>&-"
        );

        let mut supervisor = Supervisor::spawn(
            "/bin/sh",
            ["-c", &script],
            "worker-1",
            &socket_path,
            HashMap::new(),
        )
        .unwrap();

        supervisor
            .wait_for_ready(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(supervisor.state(), WorkerState::Ready);
        supervisor.stop(Duration::from_secs(1)).await;
    }
}
