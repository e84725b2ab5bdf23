use tracing_subscriber::EnvFilter;

use metaproxy::config::Cli;

/// Exit codes per §6: 0 on clean shutdown, 2 on argument error.
const EXIT_ARGUMENT_ERROR: i32 = 2;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse_args();

    if let Err(err) = metaproxy::run(cli).await {
        tracing::error!(error = %err, "metaproxy exited with an error");
        std::process::exit(EXIT_ARGUMENT_ERROR);
    }
}
