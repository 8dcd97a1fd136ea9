//! In-memory fake process launcher shared by the integration tests
//!
//! Each fake "process" is a bundle of duplex pipes: the pipeline side gets
//! the usual boxed readers/writers, the test side keeps the peer ends to
//! inject capture bytes and observe transcoder input. Exit is a watch
//! channel the test (or kill/terminate) resolves.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::DuplexStream;
use tokio::sync::watch;

use yagura::process::{
    PipeDirection, PipeReader, PipeWriter, ProcessHandle, ProcessLauncher, SpawnSpec,
};
use yagura::StreamError;

const PIPE_CAPACITY: usize = 256 * 1024;

/// Route engine logs through the test harness; `RUST_LOG=debug` to see
/// them on failures.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test-side view of one spawned fake process.
pub struct FakeProcessCtl {
    pub spec: SpawnSpec,
    /// Peer of the process stdin: read here what the pipeline fed
    pub stdin_peer: Option<DuplexStream>,
    /// Peer per extra pipe: write here to emit process output, read here
    /// to observe process input
    pub pipe_peers: Vec<Option<DuplexStream>>,
    pub exit: Arc<watch::Sender<Option<i32>>>,
    pub terminated: Arc<AtomicBool>,
    pub killed: Arc<AtomicBool>,
}

impl FakeProcessCtl {
    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn take_stdin_peer(&mut self) -> DuplexStream {
        self.stdin_peer.take().expect("stdin peer already taken")
    }

    pub fn take_pipe_peer(&mut self, idx: usize) -> DuplexStream {
        self.pipe_peers[idx].take().expect("pipe peer already taken")
    }
}

#[derive(Default)]
struct LauncherState {
    controls: VecDeque<FakeProcessCtl>,
    alive: Vec<Arc<watch::Sender<Option<i32>>>>,
    spawned: usize,
}

/// Fake [`ProcessLauncher`] recording every spawn.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
    fail_spawn: Arc<AtomicBool>,
    ignore_terminate: Arc<AtomicBool>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent launches fail with SpawnFailed.
    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Make subsequently spawned processes ignore terminate requests, so
    /// only a force-kill resolves their exit.
    pub fn ignore_terminate(&self, ignore: bool) {
        self.ignore_terminate.store(ignore, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().unwrap().spawned
    }

    /// Processes spawned and not yet exited.
    pub fn alive_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .alive
            .iter()
            .filter(|tx| tx.borrow().is_none())
            .count()
    }

    /// Pop the next spawned process's control, in spawn order.
    pub fn pop(&self) -> FakeProcessCtl {
        self.state
            .lock()
            .unwrap()
            .controls
            .pop_front()
            .expect("no spawned process left")
    }
}

struct FakeHandle {
    stdin: Option<PipeWriter>,
    writers: Vec<Option<PipeWriter>>,
    readers: Vec<Option<PipeReader>>,
    exit_rx: watch::Receiver<Option<i32>>,
    exit_tx: Arc<watch::Sender<Option<i32>>>,
    ignore_terminate: bool,
    terminated: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
}

impl ProcessHandle for FakeHandle {
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
        Some(4242)
    }

    fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        if !self.ignore_terminate {
            let _ = self.exit_tx.send(Some(0));
        }
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        let _ = self.exit_tx.send(Some(9));
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &SpawnSpec) -> Result<Box<dyn ProcessHandle>, StreamError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(StreamError::SpawnFailed(format!(
                "{}: injected spawn failure",
                spec.label
            )));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);
        let terminated = Arc::new(AtomicBool::new(false));
        let killed = Arc::new(AtomicBool::new(false));

        let (stdin, stdin_peer) = if spec.stdin {
            let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
            (Some(Box::new(ours) as PipeWriter), Some(theirs))
        } else {
            (None, None)
        };

        let mut writers = Vec::new();
        let mut readers = Vec::new();
        let mut pipe_peers = Vec::new();
        for dir in &spec.pipes {
            let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
            match dir {
                PipeDirection::Input => {
                    writers.push(Some(Box::new(ours) as PipeWriter));
                    readers.push(None);
                }
                PipeDirection::Output => {
                    readers.push(Some(Box::new(ours) as PipeReader));
                    writers.push(None);
                }
            }
            pipe_peers.push(Some(theirs));
        }

        let ctl = FakeProcessCtl {
            spec: spec.clone(),
            stdin_peer,
            pipe_peers,
            exit: Arc::clone(&exit_tx),
            terminated: Arc::clone(&terminated),
            killed: Arc::clone(&killed),
        };

        let mut state = self.state.lock().unwrap();
        state.spawned += 1;
        state.alive.push(Arc::clone(&exit_tx));
        state.controls.push_back(ctl);

        Ok(Box::new(FakeHandle {
            stdin,
            writers,
            readers,
            exit_rx,
            exit_tx,
            ignore_terminate: self.ignore_terminate.load(Ordering::SeqCst),
            terminated,
            killed,
        }))
    }
}
