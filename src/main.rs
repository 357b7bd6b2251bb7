use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use mailmirror::config::Config;
use mailmirror::forwarder::{Forwarder, Shutdown, spawn_forwarder};
use mailmirror::logging;
use mailmirror::relay::{Relay, SmtpRelay};

#[tokio::main]
async fn main() -> ExitCode {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("Warning: rustls crypto provider already installed");
    }

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MAILMIRROR_CONFIG").ok())
        .unwrap_or_else(|| "config.yaml".to_string());
    let data_dir = PathBuf::from(
        std::env::var("MAILMIRROR_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
    );

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.log_level);
    info!(
        accounts = config.accounts.len(),
        config = %config_path,
        data_dir = %data_dir.display(),
        "mailmirror starting"
    );

    let relay: Arc<dyn Relay> = Arc::new(SmtpRelay::new(config.sender));
    let shutdown = Shutdown::new();

    let mut workers = Vec::new();
    for account in config.accounts {
        let account = Arc::new(account);
        let built = Forwarder::build(Arc::clone(&account), &data_dir, Arc::clone(&relay))
            .context("account setup failed");
        match built {
            Ok(forwarder) => {
                info!(
                    account = %account.name,
                    seen_count = forwarder.ledger().count(),
                    "Loaded dedup state"
                );
                workers.push(spawn_forwarder(forwarder, shutdown.clone()));
            }
            Err(e) => {
                error!(account = %account.name, error = format!("{e:#}"), "Skipping account");
            }
        }
    }

    wait_for_signal().await;
    info!("Shutting down, waiting for forwarders to finish...");
    shutdown.trigger();

    // A second signal skips the graceful wait.
    tokio::spawn(async {
        wait_for_signal().await;
        warn!("Forced shutdown");
        std::process::exit(1);
    });

    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Forwarder task failed");
        }
    }

    info!("mailmirror stopped");
    ExitCode::SUCCESS
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
