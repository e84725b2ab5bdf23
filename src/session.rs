//! Per-connection state machine, §4.4.
//!
//! One call to [`serve`] handles exactly one accepted client connection:
//! read a single head, apply the ban/auth gates, then dispatch once to a
//! CONNECT tunnel or an HTTP forward. `original_source/proxy/async_proxy.py`
//! never re-parses a second head on the same socket either — "keep-alive"
//! means falling through to bidirectional piping after the first response,
//! not looping back to read another head (see DESIGN.md's Open Question
//! decisions). `tokio::select!` over two `pipe()` calls gives first-completes
//! cancellation for free: the losing branch's future, and the socket half it
//! owns, is simply dropped.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::error::{classify_io_error, Error, ErrorTriage, Result};
use crate::pipe::{pipe, PipeOutcome};
use crate::policy::{authorize, AuthOutcome, Policy};
use crate::request::{read_head_lines, RequestHead};

/// §5's recommended bound on how long the head read may take.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// §5's recommended dial timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle one accepted client connection end to end. Errors are classified
/// and logged by the caller (`server`); this function's only externally
/// visible effects are the bytes it writes to `stream` and eventually
/// closing it.
///
/// `shutdown` is raced against every blocking step (head read, both pipe
/// directions) so a server-wide shutdown signal cancels the session
/// promptly instead of waiting for the client or origin to go quiet.
pub async fn serve(
    stream: &mut TcpStream,
    peer: SocketAddr,
    policy: &Policy,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, write_half) = stream.split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    let lines = tokio::select! {
        result = tokio::time::timeout(HEAD_READ_TIMEOUT, read_head_lines(&mut reader)) => {
            match result {
                Ok(Ok(Some(lines))) => lines,
                Ok(Ok(None)) => return Ok(()), // empty request: no bytes written, per §4.4
                Ok(Err(err)) => return Err(err),
                Err(_elapsed) => {
                    tracing::debug!(%peer, "head read timed out");
                    return Ok(());
                }
            }
        }
        _ = shutdown.changed() => {
            tracing::debug!(%peer, "shutdown during head read");
            return Ok(());
        }
    };

    // Fewer than two lines (request-line with no headers at all): abandon
    // silently, matching the source's `len(request_lines) < 2` check.
    if lines.len() < 2 {
        return Ok(());
    }

    let head = RequestHead::from_lines(lines)?;

    if policy.is_banned(&head.remote_host) {
        tracing::info!(%peer, host = %head.remote_host, "banned host");
        writer.write_all(b"BAN").await?;
        return Ok(());
    }

    if authorize(&head, policy) == AuthOutcome::Unauthorized {
        tracing::info!(%peer, method = %head.method, host = %head.remote_host, "unauthorized");
        let response = format!("{} 401 HTTP/1.1\r\n\r\n", head.method);
        writer.write_all(response.as_bytes()).await?;
        return Ok(());
    }

    if head.method == "CONNECT" {
        handle_connect(&head, peer, &mut reader, &mut writer, &mut shutdown).await
    } else {
        handle_forward(&head, peer, &mut reader, &mut writer, &mut shutdown).await
    }
}

/// Dial the origin with §5's recommended timeout. Returns `None` on any
/// failure (DNS, connect refused, timeout) — the caller treats that as
/// "return silently", per §4.4.
async fn dial(peer: SocketAddr, host: &str, port: u16) -> Option<TcpStream> {
    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(err)) => {
            tracing::debug!(%peer, host, port, error = %err, "origin dial failed");
            None
        }
        Err(_elapsed) => {
            tracing::debug!(%peer, host, port, "origin dial timed out");
            None
        }
    }
}

/// TUNNELING: §4.4's CONNECT path.
async fn handle_connect(
    head: &RequestHead,
    peer: SocketAddr,
    reader: &mut BufReader<ReadHalf<'_>>,
    writer: &mut WriteHalf<'_>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let Some(mut origin) = dial(peer, &head.remote_host, head.remote_port).await else {
        return Ok(());
    };

    writer
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    writer.flush().await?;

    let (mut origin_read, mut origin_write) = origin.split();

    tokio::select! {
        outcome = pipe(&mut *reader, &mut origin_write) => {
            log_pipe_outcome(peer, "client->origin", outcome);
        }
        outcome = pipe(&mut origin_read, &mut *writer) => {
            log_pipe_outcome(peer, "origin->client", outcome);
        }
        _ = shutdown.changed() => {
            tracing::debug!(%peer, "shutdown cancelled tunnel");
        }
    }

    Ok(())
}

/// FORWARDING: §4.4's plain-HTTP path.
async fn handle_forward(
    head: &RequestHead,
    peer: SocketAddr,
    reader: &mut BufReader<ReadHalf<'_>>,
    writer: &mut WriteHalf<'_>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let Some(mut origin) = dial(peer, &head.remote_host, head.remote_port).await else {
        return Ok(());
    };

    let (mut origin_read, mut origin_write) = origin.split();

    origin_write.write_all(&head.encoded_lines()).await?;
    origin_write.flush().await?;

    tokio::select! {
        outcome = pipe(&mut origin_read, &mut *writer) => {
            log_pipe_outcome(peer, "origin->client (response)", outcome);
        }
        _ = shutdown.changed() => {
            tracing::debug!(%peer, "shutdown cancelled response relay");
            return Ok(());
        }
    }

    if head.keep_alive {
        tokio::select! {
            outcome = pipe(&mut *reader, &mut origin_write) => {
                log_pipe_outcome(peer, "client->origin (keep-alive)", outcome);
            }
            outcome = pipe(&mut origin_read, &mut *writer) => {
                log_pipe_outcome(peer, "origin->client (keep-alive)", outcome);
            }
            _ = shutdown.changed() => {
                tracing::debug!(%peer, "shutdown cancelled keep-alive relay");
            }
        }
    }

    Ok(())
}

fn log_pipe_outcome(peer: SocketAddr, direction: &str, outcome: PipeOutcome) {
    match outcome {
        PipeOutcome::Closed | PipeOutcome::PeerClosed => {}
        PipeOutcome::Unexpected(err) => {
            tracing::warn!(%peer, direction, error = %err, "unexpected pipe error");
        }
    }
}

/// Reduce a session-level [`Error`] to the action §7 assigns it. Returns
/// `true` if the error was expected noise (nothing to log).
pub fn is_expected_session_error(err: &Error) -> bool {
    match err {
        Error::Io(io_err) => !matches!(classify_io_error(io_err), ErrorTriage::Unexpected),
        Error::ClientMalformed(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use std::collections::HashSet;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, accepted) = tokio::join!(connect, accept);
        let (server, _) = accepted.unwrap();
        (client.unwrap(), server)
    }

    /// A receiver that never fires, for tests that don't exercise shutdown.
    fn no_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn banned_host_gets_only_ban_bytes() {
        let (mut client, mut server) = loopback_pair().await;
        let mut banned = HashSet::new();
        banned.insert("anytask.org".to_string());
        let policy = Policy::new(false, HashSet::new(), banned);

        let request = b"CONNECT anytask.org:443 HTTP/1.1\r\nHost: anytask.org:443\r\n\r\n";
        client.write_all(request).await.unwrap();

        serve(&mut server, "127.0.0.1:1".parse().unwrap(), &policy, no_shutdown())
            .await
            .unwrap();
        server.shutdown().await.ok();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"BAN");
    }

    #[tokio::test]
    async fn unauthorized_gets_401_status_line() {
        let (mut client, mut server) = loopback_pair().await;
        let mut tokens = HashSet::new();
        tokens.insert("123".to_string());
        let policy = Policy::new(true, tokens, HashSet::new());

        let request =
            b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\nProxy-Authorization: bad-key\r\n\r\n";
        client.write_all(request).await.unwrap();

        serve(&mut server, "127.0.0.1:1".parse().unwrap(), &policy, no_shutdown())
            .await
            .unwrap();
        server.shutdown().await.ok();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"GET 401 HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn empty_request_gets_no_response() {
        let (mut client, mut server) = loopback_pair().await;
        let policy = Policy::new(false, HashSet::new(), HashSet::new());

        client.write_all(b"\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        serve(&mut server, "127.0.0.1:1".parse().unwrap(), &policy, no_shutdown())
            .await
            .unwrap();
        server.shutdown().await.ok();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn connect_to_unreachable_port_writes_nothing() {
        let (mut client, mut server) = loopback_pair().await;
        let policy = Policy::new(false, HashSet::new(), HashSet::new());

        // Port 0 never accepts connections; dial fails immediately.
        let request = b"CONNECT 127.0.0.1:0 HTTP/1.1\r\nHost: 127.0.0.1:0\r\n\r\n";
        client.write_all(request).await.unwrap();

        serve(&mut server, "127.0.0.1:1".parse().unwrap(), &policy, no_shutdown())
            .await
            .unwrap();
        server.shutdown().await.ok();

        client.shutdown().await.ok();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn shutdown_signal_cancels_an_open_tunnel() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = origin_listener.accept().await;
            // Accept and then go quiet forever: only a shutdown signal
            // (not EOF, not an error) should end the session below.
            std::future::pending::<()>().await;
        });

        let (client, mut server) = loopback_pair().await;
        let policy = Policy::new(false, HashSet::new(), HashSet::new());

        let request = format!(
            "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
            origin_addr.port(),
            origin_addr.port()
        );
        let mut client = client;
        client.write_all(request.as_bytes()).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = tokio::spawn(async move {
            serve(&mut server, "127.0.0.1:1".parse().unwrap(), &policy, shutdown_rx).await
        });

        // Give the session time to reach the tunnel's pipe select before
        // signalling shutdown.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), session)
            .await
            .expect("shutdown must cancel the tunnel promptly")
            .unwrap();
        assert!(result.is_ok());
    }
}
