//! Live microphone streaming
//!
//! Web clients share a single capture process. The first client to join
//! acquires the microphone lease and starts the capture; the last one to
//! leave stops it. PCM chunks fan out on a broadcast channel owned by the
//! capture's reader thread, so clients see the channel close whenever the
//! capture ends, including when a recording preempts the microphone.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;
use std::process::ChildStdout;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::backend::AudioBackend;
use super::lease::{AudioDevice, ConflictPolicy, Purpose, StreamLease};
use super::multiplexer::StreamMultiplexer;
use crate::config::AudioConfig;
use crate::utils::error::{AppError, AppResult};
use crate::utils::worker::{CancelToken, Worker};

const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// One listener of the live microphone stream
pub struct LiveAudioClient {
    pub id: Uuid,
    /// Raw mono s16le chunks
    pub chunks: broadcast::Receiver<Arc<Vec<u8>>>,
}

/// Live stream state for status displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveAudioStatus {
    pub running: bool,
    pub clients: usize,
    pub device: Option<String>,
    pub sample_rate: u32,
}

struct Capture {
    lease: StreamLease,
    worker: Worker,
    /// Template receiver; the reader holds the only sender
    feed: broadcast::Receiver<Arc<Vec<u8>>>,
}

impl Capture {
    fn is_stale(&self) -> bool {
        self.worker.is_finished() || self.lease.is_revoked()
    }
}

struct LiveState {
    clients: HashSet<Uuid>,
    capture: Option<Capture>,
}

pub struct LiveAudio {
    config: AudioConfig,
    mux: Arc<StreamMultiplexer>,
    backend: Arc<dyn AudioBackend>,
    microphone: RwLock<Option<String>>,
    state: Mutex<LiveState>,
}

fn read_loop(
    mut stdout: ChildStdout,
    lease: StreamLease,
    mux: Arc<StreamMultiplexer>,
    chunks: broadcast::Sender<Arc<Vec<u8>>>,
    chunk_size: usize,
    max_empty_reads: u32,
    token: CancelToken,
) {
    let mut buf = vec![0u8; chunk_size];
    let mut empty_reads = 0;
    let mut total: u64 = 0;

    while !token.is_cancelled() && !lease.is_revoked() {
        match stdout.read(&mut buf) {
            Ok(0) => {
                empty_reads += 1;
                if empty_reads > max_empty_reads {
                    tracing::warn!("Audio capture produced no data, stopping");
                    break;
                }
                if token.sleep(Duration::from_millis(10)) {
                    break;
                }
            }
            Ok(n) => {
                empty_reads = 0;
                total += n as u64;
                // No receivers is fine; chunks are simply dropped
                let _ = chunks.send(Arc::new(buf[..n].to_vec()));
            }
            Err(e) => {
                tracing::warn!("Audio capture read failed: {}", e);
                break;
            }
        }
    }

    if lease.is_revoked() {
        tracing::info!("Live audio preempted after {} bytes", total);
    } else {
        tracing::info!("Live audio reader stopped after {} bytes", total);
    }
    mux.release(&lease);
}

impl LiveAudio {
    pub fn new(
        config: AudioConfig,
        mux: Arc<StreamMultiplexer>,
        backend: Arc<dyn AudioBackend>,
        microphone: Option<String>,
    ) -> Self {
        Self {
            config,
            mux,
            backend,
            microphone: RwLock::new(microphone),
            state: Mutex::new(LiveState {
                clients: HashSet::new(),
                capture: None,
            }),
        }
    }

    pub fn set_microphone(&self, device: Option<String>) {
        *self.microphone.write() = device;
    }

    /// Join the stream, starting the capture if this is the first client
    pub fn join(&self) -> AppResult<LiveAudioClient> {
        let mut state = self.state.lock();

        self.prune_stale(&mut state);
        let capture = match state.capture.take() {
            Some(capture) => capture,
            None => self.start_capture()?,
        };
        let chunks = capture.feed.resubscribe();
        state.capture = Some(capture);

        let id = Uuid::new_v4();
        state.clients.insert(id);
        tracing::info!("Live audio client {} joined ({} total)", id, state.clients.len());
        Ok(LiveAudioClient { id, chunks })
    }

    /// Forget a capture whose reader exited or whose lease was revoked.
    ///
    /// Its clients have already seen their channel close.
    fn prune_stale(&self, state: &mut LiveState) {
        if !state.capture.as_ref().map_or(false, Capture::is_stale) {
            return;
        }
        if let Some(mut capture) = state.capture.take() {
            self.mux.release(&capture.lease);
            capture.worker.shutdown(READER_JOIN_TIMEOUT);
        }
        if !state.clients.is_empty() {
            tracing::info!("Dropping {} clients of the stopped live capture", state.clients.len());
            state.clients.clear();
        }
    }

    fn start_capture(&self) -> AppResult<Capture> {
        let device = self
            .microphone
            .read()
            .clone()
            .ok_or_else(|| AppError::DeviceNotFound("no microphone selected".into()))?;

        let lease = self
            .mux
            .acquire(AudioDevice::Microphone, Purpose::LiveStream, ConflictPolicy::Reject)?;

        let mut child = match self.backend.spawn_capture(&device, self.config.sample_rate) {
            Ok(child) => child,
            Err(e) => {
                self.mux.report_failure(&lease, &e.to_string());
                return Err(e);
            }
        };
        let Some(stdout) = child.stdout.take() else {
            self.mux.release(&lease);
            return Err(AppError::Transport("capture process has no stdout".into()));
        };
        self.mux.attach_process(&lease, child)?;

        let (chunks, feed) = broadcast::channel(CHUNK_CHANNEL_CAPACITY);
        let reader_lease = lease.clone();
        let mux = self.mux.clone();
        let chunk_size = self.config.chunk_size;
        let max_empty_reads = self.config.max_empty_reads;
        let worker = Worker::spawn("live-audio", move |token| {
            read_loop(stdout, reader_lease, mux, chunks, chunk_size, max_empty_reads, token)
        });
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                self.mux.release(&lease);
                return Err(e);
            }
        };

        tracing::info!("Live audio capture started on {}", device);
        Ok(Capture {
            lease,
            worker,
            feed,
        })
    }

    /// Leave the stream. The capture stops when the last client leaves.
    pub fn leave(&self, client: Uuid) {
        let mut state = self.state.lock();
        if !state.clients.remove(&client) {
            return;
        }
        tracing::info!("Live audio client {} left ({} remaining)", client, state.clients.len());
        if state.clients.is_empty() {
            if let Some(capture) = state.capture.take() {
                Self::stop_capture(&self.mux, capture);
            }
        }
    }

    /// Stop the capture and drop every client
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.clients.clear();
        if let Some(capture) = state.capture.take() {
            Self::stop_capture(&self.mux, capture);
        }
    }

    fn stop_capture(mux: &StreamMultiplexer, mut capture: Capture) {
        // Killing the process unblocks the reader
        mux.release(&capture.lease);
        capture.worker.shutdown(READER_JOIN_TIMEOUT);
        tracing::info!("Live audio capture stopped");
    }

    pub fn status(&self) -> LiveAudioStatus {
        let mut state = self.state.lock();
        self.prune_stale(&mut state);
        LiveAudioStatus {
            running: state.capture.is_some(),
            clients: state.clients.len(),
            device: self.microphone.read().clone(),
            sample_rate: self.config.sample_rate,
        }
    }
}
