//! Byte relay from a process output channel into the caller's sink.
//!
//! A relay reads fixed-size chunks from its source and writes each non-empty
//! chunk into a shared sink until the source reports end-of-input. Faults on
//! either side end only that relay and are handed back to the task that owns
//! it.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Default chunk size for relays.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// A sink shared by every relay of one execution.
pub type SharedSink<W> = Arc<Mutex<W>>;

/// Wraps a caller-supplied writer so several relays can feed it.
pub fn shared_sink<W>(sink: W) -> SharedSink<W> {
    Arc::new(Mutex::new(sink))
}

/// Why a relay stopped before end-of-input.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Reading from the source failed.
    #[error("failed reading {channel}: {source}")]
    Read {
        channel: &'static str,
        #[source]
        source: io::Error,
    },

    /// Writing into the sink failed.
    #[error("failed writing {channel} to sink: {source}")]
    Write {
        channel: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Copies one source into a sink in fixed-size chunks.
pub struct StreamRelay<R> {
    channel: &'static str,
    source: R,
    buffer_size: usize,
}

impl<R> StreamRelay<R>
where
    R: AsyncRead + Unpin,
{
    /// Creates a relay labelled `channel` (used in logs and errors).
    pub fn new(channel: &'static str, source: R) -> Self {
        Self {
            channel,
            source,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Overrides the chunk size; zero falls back to the default.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        self
    }

    pub fn channel(&self) -> &'static str {
        self.channel
    }

    /// Runs the relay to completion.
    ///
    /// Returns the number of bytes delivered once the source reaches
    /// end-of-input.
    pub async fn run<W>(mut self, sink: &Mutex<W>) -> Result<u64, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0u64;

        loop {
            let n = match self.source.read(&mut buf).await {
                Ok(0) => return Ok(total),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(RelayError::Read {
                        channel: self.channel,
                        source,
                    })
                }
            };

            let mut guard = sink.lock().await;
            let written = match guard.write_all(&buf[..n]).await {
                Ok(()) => guard.flush().await,
                Err(e) => Err(e),
            };
            drop(guard);
            if let Err(source) = written {
                return Err(RelayError::Write {
                    channel: self.channel,
                    source,
                });
            }
            total += n as u64;
        }
    }
}

impl<R> StreamRelay<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Runs the relay on its own task.
    ///
    /// The task logs how the relay ended; a fault ends this relay only. The
    /// sink reference is dropped as soon as the relay finishes.
    pub fn spawn<W>(
        self,
        sink: SharedSink<W>,
        pid: Option<u32>,
    ) -> JoinHandle<Result<u64, RelayError>>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let channel = self.channel;
        tokio::spawn(async move {
            let result = self.run(&sink).await;
            drop(sink);
            log_outcome(channel, pid, &result);
            result
        })
    }
}

/// Logs how a relay ended.
pub(crate) fn log_outcome(
    channel: &'static str,
    pid: Option<u32>,
    result: &Result<u64, RelayError>,
) {
    match result {
        Ok(bytes) => tracing::debug!(channel, pid = ?pid, bytes, "relay reached end of input"),
        Err(e) => tracing::warn!(channel, pid = ?pid, error = %e, "relay stopped"),
    }
}
