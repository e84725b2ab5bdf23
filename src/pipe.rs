//! Unidirectional byte relay, §4.3.
//!
//! A direct port of `original_source/proxy/async_proxy.py::Proxy.pipe`'s
//! read/write/drain loop. `tokio::io::copy_bidirectional` (used by the
//! teacher's `proxy.rs`) isn't a fit here: the session handler needs to
//! cancel each direction independently the moment the other completes,
//! which a combined bidirectional copy doesn't expose.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::classify_io_error;

/// Read buffer size per direction (§5: "fixed small (4 KiB)").
const PIPE_BUFFER_SIZE: usize = 4096;

/// How a `pipe` call ended.
#[derive(Debug)]
pub enum PipeOutcome {
    /// Clean EOF from `src`; `dst` was half-closed and flushed.
    Closed,
    /// A read or write error classified as an expected mid-stream
    /// termination (reset, broken pipe, incomplete read, timeout).
    PeerClosed,
    /// An I/O error that didn't match any expected-termination pattern.
    /// Carried up so the caller can log it per §7's `Unexpected` tier;
    /// `pipe` itself never panics or propagates the error as a `Result`.
    Unexpected(std::io::Error),
}

/// Relay bytes from `src` to `dst` until EOF, a classified error, or
/// cancellation (the caller drives cancellation by dropping/aborting the
/// task this runs in; `pipe` itself never closes either endpoint).
pub async fn pipe<R, W>(mut src: R, mut dst: W) -> PipeOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::zeroed(PIPE_BUFFER_SIZE);

    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => {
                let _ = dst.shutdown().await;
                return PipeOutcome::Closed;
            }
            Ok(n) => n,
            Err(e) => {
                return match classify_io_error(&e) {
                    crate::error::ErrorTriage::Unexpected => PipeOutcome::Unexpected(e),
                    _ => PipeOutcome::PeerClosed,
                };
            }
        };

        if let Err(e) = dst.write_all(&buf[..n]).await {
            return match classify_io_error(&e) {
                crate::error::ErrorTriage::Unexpected => PipeOutcome::Unexpected(e),
                _ => PipeOutcome::PeerClosed,
            };
        }
        if let Err(e) = dst.flush().await {
            return match classify_io_error(&e) {
                crate::error::ErrorTriage::Unexpected => PipeOutcome::Unexpected(e),
                _ => PipeOutcome::PeerClosed,
            };
        }
    }
}
