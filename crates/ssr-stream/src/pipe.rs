//! Streaming response core: encoder stage (§4.7).
//!
//! Pipes a source byte stream through a content-coding and out to a sink,
//! governed by three independent timers. All three are normalized into the
//! benign-timeout alphabet ([`ssr_core::lifecycle::is_benign_timeout`]) so
//! request logging can tell "client went away" from "we broke."

use std::time::Duration;

use async_compression::tokio::bufread::{BrotliEncoder, DeflateEncoder, GzipEncoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Content codings the pipe can apply between source and sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

/// The three timers from §4.7's table.
#[derive(Debug, Clone, Copy)]
pub struct PipeTimeouts {
    /// Reset on each socket write flush.
    pub write: Duration,
    /// Reset on each request-body byte read.
    pub read: Duration,
    /// Reset on each source chunk yielded; longer and caller-configurable
    /// since it bounds total response generation time, not a single I/O op.
    pub content: Duration,
}

impl Default for PipeTimeouts {
    fn default() -> Self {
        Self {
            write: Duration::from_secs(5),
            read: Duration::from_secs(5),
            content: Duration::from_secs(30),
        }
    }
}

/// An error from the pipe, already classified into the benign-timeout
/// alphabet where applicable.
#[derive(Debug)]
pub enum PipeError {
    Cancelled,
    BenignTimeout(&'static str),
    Io(String),
}

impl std::fmt::Display for PipeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipeError::Cancelled => write!(f, "pipe cancelled"),
            PipeError::BenignTimeout(stage) => write!(f, "{stage}"),
            PipeError::Io(msg) => write!(f, "pipe io error: {msg}"),
        }
    }
}

impl std::error::Error for PipeError {}

impl From<PipeError> for ssr_core::error::AppError {
    fn from(err: PipeError) -> Self {
        match err {
            PipeError::Cancelled => ssr_core::error::AppError::Cancelled,
            PipeError::BenignTimeout(stage) => ssr_core::error::AppError::PipeTimeout { stage },
            PipeError::Io(msg) => ssr_core::error::AppError::Unhandled(msg),
        }
    }
}

const CHUNK_SIZE: usize = 64 * 1024;

/// Pipe `source` through `encoding` and out to `sink`, applying the three
/// timers each iteration. Returns once `source` is exhausted and `sink` has
/// been flushed, or the first timeout/cancellation/IO error.
pub async fn pipe<R, W>(
    source: R,
    encoding: Encoding,
    mut sink: W,
    timeouts: PipeTimeouts,
    cancel: CancellationToken,
) -> Result<(), PipeError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let buffered = BufReader::new(source);
    let mut encoded: std::pin::Pin<Box<dyn AsyncRead + Send>> = match encoding {
        Encoding::Identity => Box::pin(buffered),
        Encoding::Gzip => Box::pin(GzipEncoder::new(buffered)),
        Encoding::Deflate => Box::pin(DeflateEncoder::new(buffered)),
        Encoding::Brotli => Box::pin(BrotliEncoder::new(buffered)),
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipeError::Cancelled),
            _ = tokio::time::sleep(timeouts.content) => return Err(PipeError::BenignTimeout("content timeout")),
            read_result = tokio::time::timeout(timeouts.read, encoded.read(&mut buf)) => {
                let n = match read_result {
                    Err(_) => return Err(PipeError::BenignTimeout("read timeout")),
                    Ok(Err(e)) => return Err(PipeError::Io(e.to_string())),
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => n,
                };
                match tokio::time::timeout(timeouts.write, sink.write_all(&buf[..n])).await {
                    Err(_) => return Err(PipeError::BenignTimeout("write timeout")),
                    Ok(Err(e)) => return Err(PipeError::Io(e.to_string())),
                    Ok(Ok(())) => {}
                }
            }
        }
    }

    sink.flush().await.map_err(|e| PipeError::Io(e.to_string()))
}
