/*!
 * # Metaproxy
 *
 * A forwarding HTTP/HTTPS proxy: CONNECT tunneling, plain HTTP forwarding,
 * host-ban and token-based authorization, all driven by one request-head
 * parser and one bidirectional byte splicer.
 *
 * ## Modules
 *
 * - `config`: command line argument parsing and policy file loading
 * - `error`: crate-wide error type and OS-errno triage
 * - `policy`: the immutable ban/auth snapshot and the authorization check
 * - `request`: request head framing and structural parsing
 * - `pipe`: the unidirectional byte relay used by both tunnel and forward modes
 * - `session`: the per-connection state machine
 * - `server`: the accept loop and graceful shutdown
 */

/// Configuration module for handling command line arguments and policy files
pub mod config;
/// Error handling module with the crate-wide error type
pub mod error;
/// Unidirectional byte relay used by both CONNECT tunnels and keep-alive forwarding
pub mod pipe;
/// Host-ban and token-authorization policy
pub mod policy;
/// Request head framing and parsing
pub mod request;
/// The accept loop and graceful shutdown
pub mod server;
/// The per-connection state machine
pub mod session;

use tracing::info;

use crate::config::{load_policy_files, Cli};
use crate::error::{Error, Result};

/// Run the proxy with the given CLI configuration until shutdown.
///
/// Loads the policy files, binds the listener, and runs the accept loop in
/// a background task. When `Ctrl+C` arrives, signals shutdown and waits for
/// the accept loop to finish draining in-flight sessions before returning.
pub async fn run(cli: Cli) -> Result<()> {
    let policy = load_policy_files(&cli)?;
    info!(
        auth = policy.auth_enabled,
        banned_hosts = policy.banned_hosts.len(),
        tokens = policy.tokens.len(),
        "Loaded policy"
    );

    let (shutdown_tx, shutdown_rx) = server::shutdown_channel();
    let host = cli.host.clone();
    let port = cli.port;

    let server_task = tokio::spawn(async move { server::run(&host, port, policy, shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Unexpected(e.to_string()))?;
    info!("Ctrl+C received, shutting down");
    let _ = shutdown_tx.send(true);

    server_task
        .await
        .map_err(|e| Error::Unexpected(e.to_string()))?
}
