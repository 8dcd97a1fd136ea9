//! Subprocess and pipe plumbing for external transcoders
//!
//! Core logic never touches `tokio::process` directly; it goes through the
//! narrow [`ProcessLauncher`]/[`ProcessHandle`] seam so tests can inject an
//! in-memory fake. The real launcher wires ffmpeg the way the capture and
//! sink contracts expect: stdin as `pipe:0` when requested, extra pipes as
//! child fds 3, 4, ... (`pipe:3`, `pipe:4`), stderr forwarded line-by-line
//! into tracing.

use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StreamError;

pub type PipeReader = Box<dyn AsyncRead + Send + Unpin>;
pub type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Direction of an extra pipe, relative to the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    /// We write, the child reads.
    Input,
    /// The child writes, we read.
    Output,
}

/// Everything needed to launch one external transcoding process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Short name used in logs ("capture", "rtmp", "hls", "vp8", "opus")
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    /// Open a pipe on the child's stdin (`pipe:0`)
    pub stdin: bool,
    /// Extra pipes mapped to child fds 3, 4, ... in declared order
    pub pipes: Vec<PipeDirection>,
}

impl SpawnSpec {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            stdin: false,
            pipes: Vec::new(),
        }
    }
}

/// Handle to a spawned process.
///
/// Pipe endpoints are taken once by the owning pipeline. Exit is observed
/// by awaiting the watch channel from [`ProcessHandle::exit_watch`], which
/// holds `None` until the process exits and `Some(code)` after.
pub trait ProcessHandle: Send {
    /// Take the stdin writer (present when the spec asked for stdin).
    fn take_stdin(&mut self) -> Option<PipeWriter>;
    /// Take the writer for extra pipe `pipe` (must be an `Input` pipe).
    fn take_writer(&mut self, pipe: usize) -> Option<PipeWriter>;
    /// Take the reader for extra pipe `pipe` (must be an `Output` pipe).
    fn take_reader(&mut self, pipe: usize) -> Option<PipeReader>;
    /// OS process id, when still known.
    fn id(&self) -> Option<u32>;
    /// Watch channel resolving to the exit code.
    fn exit_watch(&self) -> watch::Receiver<Option<i32>>;
    /// Request graceful shutdown (SIGTERM). The process may ignore it.
    fn terminate(&self);
    /// Force-kill the process.
    fn kill(&self);
}

/// Spawns external transcoding processes.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &SpawnSpec) -> Result<Box<dyn ProcessHandle>, StreamError>;
}

/// Real launcher for ffmpeg (or any other program named in the spec).
#[derive(Debug, Default)]
pub struct FfmpegLauncher;

impl ProcessLauncher for FfmpegLauncher {
    fn launch(&self, spec: &SpawnSpec) -> Result<Box<dyn ProcessHandle>, StreamError> {
        spawn_process(spec)
            .map_err(|e| StreamError::SpawnFailed(format!("{}: {:#}", spec.label, e)))
    }
}

struct SpawnedProcess {
    pid: Option<u32>,
    stdin: Option<PipeWriter>,
    writers: Vec<Option<PipeWriter>>,
    readers: Vec<Option<PipeReader>>,
    exit: watch::Receiver<Option<i32>>,
    kill: CancellationToken,
}

impl ProcessHandle for SpawnedProcess {
    fn take_stdin(&mut self) -> Option<PipeWriter> {
        self.stdin.take()
    }

    fn take_writer(&mut self, pipe: usize) -> Option<PipeWriter> {
        self.writers.get_mut(pipe).and_then(Option::take)
    }

    fn take_reader(&mut self, pipe: usize) -> Option<PipeReader> {
        self.readers.get_mut(pipe).and_then(Option::take)
    }

    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit.clone()
    }

    fn terminate(&self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                // SAFETY: pid names a child we spawned; SIGTERM asks it to
                // shut down and is handled (or ignored) by the child.
                unsafe { libc::kill(pid as libc::c_int, libc::SIGTERM) };
                return;
            }
        }
        self.kill();
    }

    fn kill(&self) {
        self.kill.cancel();
    }
}

fn spawn_process(spec: &SpawnSpec) -> Result<Box<dyn ProcessHandle>> {
    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(if spec.stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut extra = ExtraPipes::create(&spec.pipes)?;
    extra.wire(&mut cmd);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", spec.program))?;

    // The child now holds its pipe ends; release our copies so EOF
    // propagates when either side closes.
    extra.release_child_ends();

    let pid = child.id();
    let stdin = child
        .stdin
        .take()
        .map(|stdin| Box::new(stdin) as PipeWriter);

    if let Some(stderr) = child.stderr.take() {
        let label = spec.label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(process = %label, "{}", line);
            }
        });
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let kill = CancellationToken::new();
    let reaper_kill = kill.clone();
    let label = spec.label.clone();
    tokio::spawn(async move {
        let code = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            },
            _ = reaper_kill.cancelled() => {
                let _ = child.start_kill();
                match child.wait().await {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(_) => -1,
                }
            }
        };
        debug!(process = %label, code, "process exited");
        let _ = exit_tx.send(Some(code));
    });

    Ok(Box::new(SpawnedProcess {
        pid,
        stdin,
        writers: extra.writers,
        readers: extra.readers,
        exit: exit_rx,
        kill,
    }))
}

// ========== Extra fd plumbing (unix) ==========

#[cfg(unix)]
mod fds {
    use super::{PipeDirection, PipeReader, PipeWriter};
    use anyhow::{Context, Result};
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    /// Parent-side endpoints plus the fd mapping applied in the child
    /// between fork and exec.
    pub(super) struct ExtraPipes {
        pub(super) writers: Vec<Option<PipeWriter>>,
        pub(super) readers: Vec<Option<PipeReader>>,
        child_ends: Vec<OwnedFd>,
        mappings: Vec<(RawFd, RawFd)>,
    }

    impl ExtraPipes {
        pub(super) fn create(pipes: &[PipeDirection]) -> Result<Self> {
            let mut writers = Vec::with_capacity(pipes.len());
            let mut readers = Vec::with_capacity(pipes.len());
            let mut child_ends = Vec::with_capacity(pipes.len());
            let mut mappings = Vec::with_capacity(pipes.len());

            for (i, dir) in pipes.iter().enumerate() {
                let (read_end, write_end) = anon_pipe().context("pipe creation failed")?;
                let target: RawFd = 3 + i as RawFd;
                match dir {
                    PipeDirection::Input => {
                        let child = raise_fd(read_end)?;
                        mappings.push((child.as_raw_fd(), target));
                        child_ends.push(child);
                        writers.push(Some(async_writer(write_end)));
                        readers.push(None);
                    }
                    PipeDirection::Output => {
                        let child = raise_fd(write_end)?;
                        mappings.push((child.as_raw_fd(), target));
                        child_ends.push(child);
                        readers.push(Some(async_reader(read_end)));
                        writers.push(None);
                    }
                }
            }

            Ok(Self {
                writers,
                readers,
                child_ends,
                mappings,
            })
        }

        pub(super) fn wire(&self, cmd: &mut tokio::process::Command) {
            if self.mappings.is_empty() {
                return;
            }
            let mappings = self.mappings.clone();
            // SAFETY: the closure runs in the forked child before exec and
            // only calls the async-signal-safe dup2. Source fds stay open
            // in the parent (child_ends) until after spawn returns.
            unsafe {
                cmd.pre_exec(move || {
                    for &(src, target) in &mappings {
                        if libc::dup2(src, target) < 0 {
                            return Err(io::Error::last_os_error());
                        }
                    }
                    Ok(())
                });
            }
        }

        pub(super) fn release_child_ends(&mut self) {
            self.child_ends.clear();
        }
    }

    fn async_writer(fd: OwnedFd) -> PipeWriter {
        Box::new(tokio::fs::File::from_std(std::fs::File::from(fd)))
    }

    fn async_reader(fd: OwnedFd) -> PipeReader {
        Box::new(tokio::fs::File::from_std(std::fs::File::from(fd)))
    }

    fn anon_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds points at two writable c_ints.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: on success both descriptors are open and unowned.
        let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_cloexec(&read)?;
        set_cloexec(&write)?;
        Ok((read, write))
    }

    fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
        // SAFETY: fd is owned and open.
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above.
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Duplicate above the dup2 target range so mapping fd N onto 3+i can
    /// never clobber another pending source fd.
    fn raise_fd(fd: OwnedFd) -> Result<OwnedFd> {
        // SAFETY: fd is owned and open; F_DUPFD_CLOEXEC allocates a fresh
        // descriptor at or above 64.
        let raised = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 64) };
        if raised < 0 {
            return Err(std::io::Error::last_os_error()).context("fd duplication failed");
        }
        // SAFETY: raised is a fresh open descriptor we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(raised) })
    }
}

#[cfg(unix)]
use fds::ExtraPipes;

#[cfg(not(unix))]
mod fds {
    use super::{PipeDirection, PipeReader, PipeWriter};
    use anyhow::{bail, Result};

    pub(super) struct ExtraPipes {
        pub(super) writers: Vec<Option<PipeWriter>>,
        pub(super) readers: Vec<Option<PipeReader>>,
    }

    impl ExtraPipes {
        pub(super) fn create(pipes: &[PipeDirection]) -> Result<Self> {
            if !pipes.is_empty() {
                bail!("extra pipe fds are only supported on unix");
            }
            Ok(Self {
                writers: Vec::new(),
                readers: Vec::new(),
            })
        }

        pub(super) fn wire(&self, _cmd: &mut tokio::process::Command) {}

        pub(super) fn release_child_ends(&mut self) {}
    }
}

#[cfg(not(unix))]
use fds::ExtraPipes;
