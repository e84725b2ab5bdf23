//! The accept loop, §4.5.
//!
//! Mirrors the teacher's separation of "bind and accept" from "do work per
//! connection": the loop itself never awaits a session, it only spawns one.
//! Shutdown is broadcast with `tokio::sync::watch`, the same idiom the
//! teacher's `lib.rs` reached for with `ctrl_c()`; draining in-flight
//! sessions uses the "drop a cloned `mpsc::Sender`, await the receiver
//! going empty" idiom from tokio's own graceful-shutdown guidance, not a
//! polling loop and not the `Semaphore`/`mea::Condvar` combination the
//! httproxy example uses (see DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::error::{classify_io_error, ErrorTriage, Result};
use crate::policy::Policy;
use crate::session;

/// Bound on how long a session's final socket shutdown may take before it's
/// abandoned (§4.4 CLOSING: "await flush of any pending writes with a
/// bounded timeout").
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind `(host, port)` and accept connections until `shutdown_rx` fires.
/// Every accepted connection becomes an independent task that also holds a
/// clone of `shutdown_rx`, so a shutdown signal cancels in-flight sessions
/// (not just the accept loop). On shutdown, waits for every spawned session
/// to finish before returning.
pub async fn run(host: &str, port: u16, policy: Policy, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    tracing::info!("Serving on {host}:{port}");

    let policy = Arc::new(policy);
    let (inflight_tx, mut inflight_rx) = mpsc::channel::<()>(1);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        log_accept_error(&err);
                        continue;
                    }
                };

                let policy = Arc::clone(&policy);
                let session_shutdown = shutdown_rx.clone();
                let inflight_tx = inflight_tx.clone();

                tokio::spawn(async move {
                    if let Err(err) = session::serve(&mut stream, peer, &policy, session_shutdown).await {
                        if !session::is_expected_session_error(&err) {
                            tracing::warn!(%peer, error = %err, "session ended with an unexpected error");
                        }
                    }
                    if tokio::time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await.is_err() {
                        tracing::debug!(%peer, "client socket shutdown did not complete within the bound");
                    }
                    drop(inflight_tx);
                });
            }
            _ = shutdown_rx.changed() => {
                tracing::info!("shutdown signal received, draining in-flight sessions");
                break;
            }
        }
    }

    // Every in-flight session holds a clone of `inflight_tx`; once this, the
    // last clone held by `run` itself, is dropped, `recv` resolves as soon
    // as the final session's clone is dropped too. No polling.
    drop(inflight_tx);
    let _ = inflight_rx.recv().await;

    Ok(())
}

/// Accept-loop errors never stop the loop (§4.5: "MUST NOT block on any
/// session" implies the loop also must not die on a single bad accept); the
/// same OS-errno triage used for session I/O decides how loud to be.
fn log_accept_error(err: &std::io::Error) {
    match classify_io_error(err) {
        ErrorTriage::Ignore => {}
        ErrorTriage::PeerClosed | ErrorTriage::ForceClose => {
            tracing::debug!(error = %err, "accept() failed");
        }
        ErrorTriage::Unexpected => {
            tracing::warn!(error = %err, "accept() failed unexpectedly");
        }
    }
}

/// Build the `(sender, receiver)` pair used to signal shutdown to [`run`],
/// wired to `Ctrl+C` by the caller.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}
