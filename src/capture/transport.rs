//! Byte transports feeding the raw marker scanner

use std::io::{self, Read};
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::error::StreamError;
use crate::StreamConfig;

/// Blocking byte stream opened against a stream URL
pub type ByteStream = Box<dyn Read + Send>;

/// Opens a continuous byte stream. Implementations must bound every blocking
/// read with a timeout so cancellation is observed promptly.
pub trait Transport: Send + Sync {
    fn open(&self, url: &str) -> Result<ByteStream, StreamError>;
}

/// HTTP GET transport for `http://<host>:<port>/video` style endpoints
pub struct HttpTransport {
    agent: ureq::Agent,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &StreamConfig) -> Self {
        let connect_timeout = config.connect_timeout();
        let read_timeout = config.read_timeout();
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .build();
        Self {
            agent,
            connect_timeout,
            read_timeout,
        }
    }
}

impl Transport for HttpTransport {
    #[instrument(skip(self))]
    fn open(&self, url: &str) -> Result<ByteStream, StreamError> {
        info!("Opening HTTP stream");
        match self.agent.get(url).call() {
            Ok(response) => {
                debug!(
                    content_type = response.content_type(),
                    status = response.status(),
                    "stream response"
                );
                Ok(Box::new(TimedReader {
                    inner: response.into_reader(),
                    read_timeout: self.read_timeout,
                }))
            }
            Err(ureq::Error::Status(code, _)) => Err(StreamError::Status(code)),
            Err(ureq::Error::Transport(t)) => {
                if is_timeout(&t.to_string()) {
                    Err(StreamError::Timeout(self.connect_timeout))
                } else {
                    Err(StreamError::Connect(t.to_string()))
                }
            }
        }
    }
}

/// Keeps the configured read timeout around so a timed-out read can be
/// reported as `StreamError::Timeout` rather than a bare I/O error.
struct TimedReader<R> {
    inner: R,
    read_timeout: Duration,
}

impl<R: Read> Read for TimedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no data for {:?}", self.read_timeout),
            ),
            _ => e,
        })
    }
}

fn is_timeout(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("timed out") || message.contains("timeout")
}

/// Map an I/O error from a stream read onto the receiver's error taxonomy
pub(crate) fn classify_read_error(err: io::Error, read_timeout: Duration) -> StreamError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => StreamError::Timeout(read_timeout),
        _ => StreamError::Io(err),
    }
}
