//! Per-account forwarder: poll, relay, then record.
//!
//! Each account gets one worker task. A poll takes a ledger snapshot, asks
//! the mail source for new messages, and for each one relays it and only
//! then commits its identifier. Relay or commit failures skip that message;
//! it stays eligible and is retried on the next tick.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::{self, AccountConfig};
use crate::error::Result;
use crate::ledger::Ledger;
use crate::relay::Relay;
use crate::sources::{self, MailSource};

/// Process-wide shutdown signal, cloned into every worker.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signal every holder. Later calls are no-ops.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so `wait_for` cannot see it dropped.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one poll, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Messages returned by the source.
    pub fetched: usize,
    /// Relayed and recorded.
    pub forwarded: usize,
    /// Relay failed; not recorded.
    pub relay_failed: usize,
    /// Relayed but the ledger append failed; will be sent again.
    pub commit_failed: usize,
    /// The source itself failed.
    pub fetch_failed: bool,
}

/// Worker for one account.
pub struct Forwarder {
    account: Arc<AccountConfig>,
    source: Arc<dyn MailSource>,
    relay: Arc<dyn Relay>,
    ledger: Ledger,
}

impl Forwarder {
    pub fn new(
        account: Arc<AccountConfig>,
        source: Arc<dyn MailSource>,
        relay: Arc<dyn Relay>,
        ledger: Ledger,
    ) -> Self {
        Self {
            account,
            source,
            relay,
            ledger,
        }
    }

    /// Wire an account to its protocol source and its ledger under
    /// `data_dir`. Fails on an unsupported protocol or an unreadable ledger.
    pub fn build(
        account: Arc<AccountConfig>,
        data_dir: &Path,
        relay: Arc<dyn Relay>,
    ) -> Result<Self> {
        let source = sources::create_source(&account)?;
        let ledger = Ledger::load(config::ledger_path(data_dir, &account.name))?;
        Ok(Self::new(account, source, relay, ledger))
    }

    pub fn account(&self) -> &AccountConfig {
        &self.account
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Poll immediately, then every `check_interval`, until shutdown.
    ///
    /// Shutdown is only observed between polls; a poll in progress runs to
    /// completion first.
    pub async fn run(self, shutdown: Shutdown) {
        let interval = self.account.check_interval();
        info!(
            account = %self.account.name,
            protocol = %self.account.protocol,
            host = %self.account.host,
            interval_secs = interval.as_secs(),
            "Starting forwarder"
        );

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            // The first tick fires immediately.
            self.poll_once().await;
        }

        if let Err(e) = self.source.close().await {
            debug!(account = %self.account.name, error = %e, "Closing mail source failed");
        }
        info!(account = %self.account.name, "Forwarder stopped");
    }

    /// Run a single poll cycle: snapshot, fetch, relay, commit.
    pub async fn poll_once(&self) -> PollSummary {
        let name = &self.account.name;
        debug!(account = %name, "Polling");

        let mut summary = PollSummary::default();
        let seen = Arc::new(self.ledger.snapshot());
        let emails = match self.source.fetch(seen, self.account.lookback_days()).await {
            Ok(emails) => emails,
            Err(e) => {
                error!(account = %name, error = %e, "Fetch failed");
                summary.fetch_failed = true;
                return summary;
            }
        };

        summary.fetched = emails.len();
        if emails.is_empty() {
            debug!(account = %name, "No new emails");
            return summary;
        }
        info!(account = %name, count = emails.len(), "Found new email(s)");

        for email in emails {
            if let Err(e) = self
                .relay
                .forward(&email.content, &self.account.forward_to, &email.id)
                .await
            {
                error!(account = %name, msg_id = %email.id, error = %e, "Forward failed");
                summary.relay_failed += 1;
                continue;
            }

            if let Err(e) = self.ledger.mark_seen(&email.id) {
                error!(account = %name, msg_id = %email.id, error = %e, "Mark seen failed");
                summary.commit_failed += 1;
                continue;
            }

            info!(
                account = %name,
                msg_id = %email.id,
                to = %self.account.forward_to,
                "Forwarded"
            );
            summary.forwarded += 1;
        }

        summary
    }
}

/// Spawn a forwarder as a background task.
pub fn spawn_forwarder(forwarder: Forwarder, shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(forwarder.run(shutdown))
}
