use std::sync::Arc;

use mailman::dispatch::{CommandSink, LogSink};
use mailman::{Application, DispatchSink, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let settings = Settings::from_env()?;

    let sink: Arc<dyn DispatchSink> = match std::env::var("MAILMAN_DELIVER_COMMAND") {
        Ok(command) if !command.trim().is_empty() => {
            tracing::info!(%command, "Delivering messages to command");
            Arc::new(CommandSink::new(command))
        }
        _ => Arc::new(LogSink),
    };

    Application::new(settings, sink).run().await?;

    Ok(())
}
