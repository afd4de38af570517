//! Stream receiver: one background ingestion thread per connection
//!
//! The ingestion thread owns the transport, drives every status transition
//! except the final `Disconnected` of an explicit `disconnect()`, publishes
//! frames into the `FrameBuffer` and invokes the listener. `disconnect()` closes
//! the session gate before anything else, so no callback fires after it returns
//! even if the worker has to be detached.

pub mod listener;
pub mod status;

use std::io::{ErrorKind, Read};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::capture::decoder::decode_jpeg;
use crate::capture::scanner::MarkerScanner;
use crate::capture::transport::classify_read_error;
use crate::capture::{CaptureBackend, Frame, HttpTransport, MjpegCaptureBackend, Transport};
use crate::error::StreamError;
use crate::pipeline::{FrameBuffer, Shutdown, StreamStats, Worker};
use crate::StreamConfig;

pub use listener::{ChannelListener, NoopListener, ReceiverEvents, ReceiverListener};
pub use status::{ConnectionStatus, InvalidTransition, StatusChange};

/// How the ingestion thread turns the stream into frames
#[derive(Clone)]
pub enum Ingest {
    /// Read raw bytes and cut frames at SOI/EOI markers
    Raw(Arc<dyn Transport>),
    /// Let a capture backend hand out whole frames
    Capture(Arc<dyn CaptureBackend>),
}

struct Shared {
    status: Mutex<ConnectionStatus>,
    buffer: FrameBuffer,
    listener: Arc<dyn ReceiverListener>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, ConnectionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Closed once by `disconnect()`; a closed session emits nothing.
#[derive(Default)]
struct Gate {
    closed: Mutex<bool>,
}

impl Gate {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        *self.lock() = true;
    }
}

struct Session {
    worker: Worker,
    gate: Arc<Gate>,
}

pub struct StreamReceiver {
    ingest: Ingest,
    config: StreamConfig,
    shared: Arc<Shared>,
    session: Option<Session>,
    url: Option<String>,
}

impl StreamReceiver {
    pub fn new(ingest: Ingest, config: StreamConfig, listener: Arc<dyn ReceiverListener>) -> Self {
        let buffer = FrameBuffer::new(config.fps_window);
        Self {
            ingest,
            config,
            shared: Arc::new(Shared {
                status: Mutex::new(ConnectionStatus::Disconnected),
                buffer,
                listener,
            }),
            session: None,
            url: None,
        }
    }

    /// Raw marker-scanning receiver over HTTP
    pub fn http(config: StreamConfig, listener: Arc<dyn ReceiverListener>) -> Self {
        let transport = Arc::new(HttpTransport::new(&config));
        Self::new(Ingest::Raw(transport), config, listener)
    }

    /// Capture-delegate receiver using the built-in MJPEG capture over HTTP
    pub fn capture(config: StreamConfig, listener: Arc<dyn ReceiverListener>) -> Self {
        let transport = Arc::new(HttpTransport::new(&config));
        let backend = MjpegCaptureBackend::new(transport, config.chunk_size, config.read_timeout());
        Self::new(Ingest::Capture(Arc::new(backend)), config, listener)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.buffer.stats()
    }

    /// URL of the current or most recent session
    pub fn stream_url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Latest decoded frame; never waits on the ingestion thread.
    pub fn get_frame(&self) -> Option<Arc<Frame>> {
        self.shared.buffer.latest()
    }

    /// Start a new session against `host:port`. Returns immediately; progress
    /// is reported through the listener.
    #[instrument(skip(self))]
    pub fn connect(&mut self, host: &str, port: u16) {
        if self.session.is_some() || self.status() != ConnectionStatus::Disconnected {
            self.disconnect();
        }

        let url = self.config.stream_url(host, port);
        info!(%url, "Connecting stream receiver");
        self.url = Some(url.clone());

        let gate = Arc::new(Gate::default());
        let ctx = SessionCtx {
            shared: self.shared.clone(),
            gate: gate.clone(),
            config: self.config.clone(),
            url,
            sequence: 0,
        };
        let ingest = self.ingest.clone();
        let spawned = Worker::spawn("phonecam-ingest", move |shutdown| match ingest {
            Ingest::Raw(transport) => ctx.run_raw(transport.as_ref(), &shutdown),
            Ingest::Capture(backend) => ctx.run_capture(backend.as_ref(), &shutdown),
        });

        match spawned {
            Ok(worker) => self.session = Some(Session { worker, gate }),
            Err(e) => {
                warn!("failed to spawn ingestion thread: {}", e);
                self.emit(ConnectionStatus::Connecting, None);
                self.emit(
                    ConnectionStatus::Error,
                    Some(format!("failed to start receiver: {}", e)),
                );
            }
        }
    }

    /// Stop the session, wait (bounded) for the worker, reset frame and stats.
    /// Idempotent: a second call is a no-op.
    #[instrument(skip(self))]
    pub fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.gate.close();
            if !session.worker.stop(self.config.join_timeout()) {
                warn!("ingestion thread still blocked in the transport, detached");
            }
        }

        self.shared.buffer.reset();

        if self.status() != ConnectionStatus::Disconnected {
            info!("Stream receiver disconnected");
            self.emit(ConnectionStatus::Disconnected, None);
        }
    }

    fn emit(&self, next: ConnectionStatus, message: Option<String>) {
        {
            let mut status = self.shared.status();
            if next == ConnectionStatus::Disconnected {
                *status = next;
            } else if let Err(e) = status.transition(next) {
                warn!("{}", e);
                return;
            }
        }
        self.shared
            .listener
            .on_status(&StatusChange { status: next, message });
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Everything the ingestion thread needs for one session
struct SessionCtx {
    shared: Arc<Shared>,
    gate: Arc<Gate>,
    config: StreamConfig,
    url: String,
    sequence: u64,
}

impl SessionCtx {
    /// Apply a transition and notify. Returns `false` once the session is closed.
    fn set_status(&self, next: ConnectionStatus, message: Option<String>) -> bool {
        let closed = self.gate.lock();
        if *closed {
            return false;
        }
        {
            let mut status = self.shared.status();
            if let Err(e) = status.transition(next) {
                warn!("{}", e);
                return true;
            }
        }
        debug!(status = %next, ?message, "status changed");
        self.shared
            .listener
            .on_status(&StatusChange { status: next, message });
        true
    }

    fn fail(&self, err: StreamError) {
        warn!(url = %self.url, "stream failed: {}", err);
        self.set_status(ConnectionStatus::Error, Some(error_message(&err)));
    }

    fn add_bytes(&self, n: usize) {
        let closed = self.gate.lock();
        if !*closed {
            self.shared.buffer.add_bytes(n);
            metrics::counter!("phonecam_bytes_received").increment(n as u64);
        }
    }

    /// Store the frame and hand it to the listener. Returns `false` once closed.
    fn publish(&mut self, frame: Frame, arrived: Instant) -> bool {
        let closed = self.gate.lock();
        if *closed {
            return false;
        }
        self.sequence += 1;
        let encoded_len = frame.meta.encoded_len;
        let frame = Arc::new(frame.with_sequence(self.sequence, encoded_len));
        self.shared.buffer.publish(frame.clone(), arrived.elapsed());
        metrics::counter!("phonecam_frames_decoded").increment(1);
        self.shared.listener.on_frame(&frame);
        true
    }

    fn run_raw(mut self, transport: &dyn Transport, shutdown: &Shutdown) {
        if !self.set_status(
            ConnectionStatus::Connecting,
            Some(format!("Connecting to {}...", self.url)),
        ) {
            return;
        }

        let mut stream = match transport.open(&self.url) {
            Ok(stream) => stream,
            Err(e) => {
                if !shutdown.is_requested() {
                    self.fail(e);
                }
                return;
            }
        };

        if shutdown.is_requested()
            || !self.set_status(ConnectionStatus::Connected, Some("Stream connected".into()))
        {
            return;
        }
        info!(url = %self.url, "Stream connected");

        let mut scanner = MarkerScanner::new(self.config.max_frame_bytes);
        let mut chunk = vec![0u8; self.config.chunk_size.max(1)];

        while !shutdown.is_requested() {
            let n = match stream.read(&mut chunk) {
                Ok(0) => {
                    info!(url = %self.url, "stream ended");
                    self.set_status(ConnectionStatus::Disconnected, Some("stream ended".into()));
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !shutdown.is_requested() {
                        self.fail(classify_read_error(e, self.config.read_timeout()));
                    }
                    return;
                }
            };

            self.add_bytes(n);
            scanner.push(&chunk[..n]);

            while let Some(encoded) = scanner.next_frame() {
                let arrived = Instant::now();
                match decode_jpeg(&encoded) {
                    Ok(frame) => {
                        if !self.publish(frame, arrived) {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(len = encoded.len(), "dropping undecodable frame: {}", e);
                        metrics::counter!("phonecam_decode_failures").increment(1);
                    }
                }
            }
        }
    }

    fn run_capture(mut self, backend: &dyn CaptureBackend, shutdown: &Shutdown) {
        if !self.set_status(
            ConnectionStatus::Connecting,
            Some(format!("Connecting to {}...", self.url)),
        ) {
            return;
        }

        let mut capture = match backend.open(&self.url) {
            Ok(capture) => capture,
            Err(e) => {
                if !shutdown.is_requested() {
                    self.fail(e);
                }
                return;
            }
        };

        if !shutdown.is_requested()
            && self.set_status(ConnectionStatus::Connected, Some("Stream connected".into()))
        {
            info!(url = %self.url, "Capture connected");
            while !shutdown.is_requested() {
                let started = Instant::now();
                match capture.read_frame() {
                    Ok(Some(frame)) => {
                        self.add_bytes(frame.meta.encoded_len);
                        if !self.publish(frame, started) {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if !shutdown.is_requested() {
                            self.fail(e);
                        }
                        break;
                    }
                }
            }
        }

        capture.release();
    }
}

fn error_message(err: &StreamError) -> String {
    match err {
        StreamError::Connect(reason) => format!("Connection failed: {}", reason),
        StreamError::Timeout(_) => "Connection timed out".to_string(),
        _ => format!("Error: {}", err),
    }
}
