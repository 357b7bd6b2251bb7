//! Mail sources: protocol adapters that feed the forwarding pipeline.
//!
//! Each adapter connects fresh on every `fetch`, returns only messages
//! inside the lookback window whose identifier is not in the supplied
//! seen-set, and closes the connection before returning.

pub mod imap;
pub mod pop3;
pub mod transport;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;

use crate::config::{AccountConfig, Protocol};
use crate::error::{ConfigError, SourceError};
use crate::ledger::SeenSet;

pub use imap::ImapSource;
pub use pop3::Pop3Source;

/// A fetched message, ready to be relayed as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    /// Message-ID header, or a synthesized per-account fallback.
    pub id: String,
    /// Best-effort message date.
    pub date: Option<DateTime<Utc>>,
    /// Raw RFC 5322 bytes.
    pub content: Vec<u8>,
}

/// Capability to retrieve not-yet-forwarded messages from a mailbox.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Protocol name, for logging.
    fn protocol(&self) -> &'static str;

    /// Fetch messages from the last `lookback_days` days whose identifiers
    /// are not in `seen`. Order is unspecified.
    async fn fetch(
        &self,
        seen: Arc<SeenSet>,
        lookback_days: u32,
    ) -> Result<Vec<Email>, SourceError>;

    /// Release anything held between fetches. Adapters reconnect per call,
    /// so the default has nothing to do.
    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Build the source for an account.
pub fn create_source(account: &Arc<AccountConfig>) -> Result<Arc<dyn MailSource>, ConfigError> {
    match &account.protocol {
        Protocol::Pop3 => Ok(Arc::new(Pop3Source::new(Arc::clone(account)))),
        Protocol::Imap => Ok(Arc::new(ImapSource::new(Arc::clone(account)))),
        Protocol::Other(p) => Err(ConfigError::UnsupportedProtocol(p.clone())),
    }
}

/// Message-ID of a raw message, without angle brackets.
pub fn extract_message_id(raw: &[u8]) -> Option<String> {
    let parsed = MessageParser::default().parse_headers(raw)?;
    parsed
        .message_id()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Date header of a raw message, if present and parseable.
pub fn extract_date(raw: &[u8]) -> Option<DateTime<Utc>> {
    let parsed = MessageParser::default().parse_headers(raw)?;
    let date = parsed.date()?;
    DateTime::from_timestamp(date.to_timestamp(), 0)
}

/// Start of the lookback window relative to `now`, never earlier than the
/// Unix epoch.
pub fn lookback_cutoff(now: DateTime<Utc>, lookback_days: u32) -> DateTime<Utc> {
    chrono::TimeDelta::try_days(i64::from(lookback_days))
        .and_then(|window| now.checked_sub_signed(window))
        .map_or(DateTime::UNIX_EPOCH, |cutoff| cutoff.max(DateTime::UNIX_EPOCH))
}
