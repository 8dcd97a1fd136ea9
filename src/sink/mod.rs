//! Sink pipelines: protocol-specific consumers of a capturer's broadcast
//!
//! Every sink variant shares the same shape: subscribe to a capturer's
//! hubs, feed the buffers into an external transcoding process, watch the
//! process for exit, and tear everything down on stop. The shared pieces
//! live here; the variants ([`rtmp`], [`hls`], and the WebRTC bridge in
//! [`crate::webrtc`]) compose them with their own spawn contracts.

pub mod hls;
pub mod rtmp;

pub use hls::{HlsOutput, HlsOutputManager};
pub use rtmp::{RtmpManager, RtmpStreamer};

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::capture::demux::{FRAME_END, FRAME_START};
use crate::capture::Capturer;
use crate::hub::Subscription;
use crate::process::{PipeWriter, ProcessHandle};

/// Grace for feeder tasks to wind down after cancellation
const SINK_STOP_GRACE: Duration = Duration::from_secs(5);

/// Reported state of a sink pipeline
#[derive(Debug, Clone)]
pub struct SinkStatus {
    pub running: bool,
    /// Externally reachable locator (push URL, playlist path) when running
    pub endpoint: Option<String>,
}

impl SinkStatus {
    pub fn stopped() -> Self {
        Self {
            running: false,
            endpoint: None,
        }
    }
}

/// Subscription undo entry, applied on stop.
pub(crate) enum Feed {
    Frames(String),
    Audio(String),
}

pub(crate) struct SinkLifecycle {
    pub cancel: CancellationToken,
    pub tasks: TaskTracker,
    pub feeds: Vec<Feed>,
    pub capturer: Capturer,
}

/// Running-state, process handle, and task lifetimes shared by all sink
/// variants. The process handle lives behind its own lock so a slow kill
/// never blocks status queries.
pub(crate) struct SinkRuntime {
    camera_id: String,
    kind: &'static str,
    running: RwLock<bool>,
    process: Mutex<Option<Box<dyn ProcessHandle>>>,
    lifecycle: Mutex<Option<SinkLifecycle>>,
}

impl SinkRuntime {
    pub fn new(camera_id: String, kind: &'static str) -> Self {
        Self {
            camera_id,
            kind,
            running: RwLock::new(false),
            process: Mutex::new(None),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Store the spawned process and lifecycle, then mark running.
    pub async fn activate(&self, handle: Box<dyn ProcessHandle>, lifecycle: SinkLifecycle) {
        *self.process.lock().await = Some(handle);
        *self.lifecycle.lock().await = Some(lifecycle);
        *self.running.write().await = true;
    }

    /// Idempotent teardown: cancel tasks, unsubscribe feeds, force-kill
    /// the process, and wait a bounded period for tasks to finish.
    pub async fn shutdown(&self) {
        let was_running = {
            let mut running = self.running.write().await;
            std::mem::replace(&mut *running, false)
        };
        let lifecycle = self.lifecycle.lock().await.take();
        let handle = self.process.lock().await.take();

        if !was_running && lifecycle.is_none() && handle.is_none() {
            return;
        }

        if let Some(lifecycle) = &lifecycle {
            lifecycle.cancel.cancel();
            for feed in &lifecycle.feeds {
                match feed {
                    Feed::Frames(id) => lifecycle.capturer.unsubscribe_frames(id).await,
                    Feed::Audio(id) => lifecycle.capturer.unsubscribe_audio(id).await,
                }
            }
        }

        if let Some(handle) = &handle {
            handle.kill();
        }

        if let Some(lifecycle) = lifecycle {
            lifecycle.tasks.close();
            if timeout(SINK_STOP_GRACE, lifecycle.tasks.wait()).await.is_err() {
                warn!(
                    camera = %self.camera_id,
                    sink = self.kind,
                    "feeder tasks still blocked after grace period"
                );
            }
        }

        info!(camera = %self.camera_id, sink = self.kind, "sink stopped");
    }
}

/// Watch the sink process and mark the sink stopped when it exits on its
/// own (e.g. an unreachable push target).
pub(crate) fn spawn_exit_watcher(
    runtime: &Arc<SinkRuntime>,
    tasks: &TaskTracker,
    mut exit: watch::Receiver<Option<i32>>,
    cancel: CancellationToken,
) {
    let runtime = Arc::clone(runtime);
    tasks.spawn(async move {
        let code = tokio::select! {
            _ = cancel.cancelled() => return,
            res = exit.wait_for(|code| code.is_some()) => {
                res.ok().and_then(|guard| *guard).unwrap_or(-1)
            }
        };
        let was_running = {
            let mut running = runtime.running.write().await;
            std::mem::replace(&mut *running, false)
        };
        if was_running {
            warn!(
                camera = %runtime.camera_id,
                sink = runtime.kind,
                code,
                "sink process exited unexpectedly"
            );
        }
    });
}

/// Drive one subscription into one transcoder input.
///
/// Write failures are logged a few times then suppressed; the loop keeps
/// draining (and thereby dropping) buffers until cancellation or the
/// subscription closes, so a dead encoder never backs up the hub.
pub(crate) fn spawn_feeder(
    tasks: &TaskTracker,
    cancel: CancellationToken,
    camera: String,
    stream: &'static str,
    mut sub: Subscription,
    mut writer: PipeWriter,
    validate_jpeg: bool,
) {
    tasks.spawn(async move {
        let mut sent: u64 = 0;
        let mut write_errors: u32 = 0;
        let mut rejected: u64 = 0;

        loop {
            let buf = tokio::select! {
                _ = cancel.cancelled() => break,
                buf = sub.recv() => match buf {
                    Some(buf) => buf,
                    None => {
                        debug!(camera = %camera, stream, "subscription closed, feeder exiting");
                        break;
                    }
                },
            };
            if buf.is_empty() {
                continue;
            }

            if validate_jpeg {
                if buf.len() < 2 || buf[..2] != FRAME_START {
                    rejected += 1;
                    if rejected <= 3 {
                        warn!(camera = %camera, stream, len = buf.len(), "rejecting non-JPEG frame");
                    }
                    continue;
                }
                if buf[buf.len() - 2..] != FRAME_END {
                    // Feed it anyway; the encoder may still accept it
                    debug!(camera = %camera, stream, "frame missing end marker");
                }
            }

            let write = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            };
            if let Err(e) = write.await {
                write_errors += 1;
                if write_errors <= 3 {
                    warn!(camera = %camera, stream, error = %e, "write to transcoder failed");
                }
                if write_errors == 3 {
                    warn!(camera = %camera, stream, "suppressing further transcoder write errors");
                }
                continue;
            }

            write_errors = 0;
            sent += 1;
            if sent == 1 || sent % 300 == 0 {
                debug!(camera = %camera, stream, sent, "fed buffers to transcoder");
            }
        }

        let _ = writer.shutdown().await;
    });
}
