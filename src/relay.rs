//! Outbound relay: sends one raw message to one address over SMTP.
//!
//! The message goes out byte-for-byte as fetched, with three provenance
//! header lines prepended. The relay holds no per-message state and is
//! shared by every account worker; each call opens its own connection.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{SmtpTransport, Transport};
use mail_parser::MessageParser;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;

/// Value of the `X-Forwarded-By` header.
pub const FORWARDED_BY: &str = "mailmirror";

/// Capability to deliver one raw message.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Deliver `raw` to `to`, tagging it with `original_id`. All-or-nothing:
    /// an error means the message must be treated as not sent.
    async fn forward(&self, raw: &[u8], to: &str, original_id: &str) -> Result<(), RelayError>;
}

/// SMTP relay built on lettre.
pub struct SmtpRelay {
    config: Arc<RelayConfig>,
}

impl SmtpRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Relay for SmtpRelay {
    async fn forward(&self, raw: &[u8], to: &str, original_id: &str) -> Result<(), RelayError> {
        let envelope = build_envelope(raw, &self.config.username, to)?;
        let message = with_provenance(raw, original_id, Utc::now());

        let config = Arc::clone(&self.config);
        let to = to.to_string();
        tokio::task::spawn_blocking(move || send_blocking(&config, &envelope, &message, &to))
            .await
            .map_err(|e| RelayError::Task(e.to_string()))?
    }
}

/// Provenance header lines, CRLF terminated.
pub fn provenance_headers(original_id: &str, now: DateTime<Utc>) -> String {
    format!(
        "X-Forwarded-By: {FORWARDED_BY}\r\nX-Original-Message-ID: {original_id}\r\nX-Forwarded-Time: {}\r\n",
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// The outgoing bytes: provenance headers followed by the untouched original.
pub fn with_provenance(raw: &[u8], original_id: &str, now: DateTime<Utc>) -> Vec<u8> {
    let headers = provenance_headers(original_id, now);
    let mut message = Vec::with_capacity(headers.len() + raw.len());
    message.extend_from_slice(headers.as_bytes());
    message.extend_from_slice(raw);
    message
}

/// Address in the message's `From` header, if any.
pub fn envelope_sender(raw: &[u8]) -> Option<String> {
    let parsed = MessageParser::default().parse_headers(raw)?;
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
}

/// SMTP envelope: the original author when parseable, else the relay
/// username, else a null reverse-path.
fn build_envelope(raw: &[u8], fallback: &str, to: &str) -> Result<Envelope, RelayError> {
    let from = envelope_sender(raw)
        .and_then(|s| s.parse::<Address>().ok())
        .or_else(|| fallback.parse::<Address>().ok());

    let to: Address = to.parse().map_err(|e: lettre::address::AddressError| {
        RelayError::InvalidAddress {
            address: to.to_string(),
            reason: e.to_string(),
        }
    })?;

    Envelope::new(from, vec![to]).map_err(|e| RelayError::Envelope(e.to_string()))
}

fn send_blocking(
    config: &RelayConfig,
    envelope: &Envelope,
    message: &[u8],
    to: &str,
) -> Result<(), RelayError> {
    let params = TlsParameters::new(config.host.clone()).map_err(|e| RelayError::Tls(e.to_string()))?;

    let result = if config.use_tls {
        send_on(&transport(config, Tls::Wrapper(params)), envelope, message)
    } else {
        // A failed rustls upgrade only surfaces on the first read after
        // STARTTLS, as a network error.
        let opportunistic = transport(config, Tls::Opportunistic(params));
        match opportunistic.test_connection() {
            Ok(true) => send_on(&opportunistic, envelope, message),
            Ok(false) => {
                warn!(host = %config.host, "SMTP session check failed, continuing without TLS");
                send_on(&transport(config, Tls::None), envelope, message)
            }
            // A reply from the server is not a TLS problem; resending in
            // plain text would only repeat it.
            Err(e) if e.is_permanent() || e.is_transient() => Err(e),
            Err(e) => {
                warn!(host = %config.host, error = %e, "STARTTLS failed, continuing without TLS");
                send_on(&transport(config, Tls::None), envelope, message)
            }
        }
    };

    result.map_err(|e| RelayError::Smtp {
        host: config.host.clone(),
        to: to.to_string(),
        reason: e.to_string(),
    })
}

/// Transport for one send; credentials only when both parts are set.
fn transport(config: &RelayConfig, tls: Tls) -> SmtpTransport {
    let mut builder = SmtpTransport::builder_dangerous(config.host.as_str())
        .port(config.port)
        .tls(tls);

    let password = config.password.expose_secret();
    if !config.username.is_empty() && !password.is_empty() {
        builder = builder.credentials(Credentials::new(
            config.username.clone(),
            password.to_string(),
        ));
    }
    builder.build()
}

fn send_on(
    transport: &SmtpTransport,
    envelope: &Envelope,
    message: &[u8],
) -> Result<(), lettre::transport::smtp::Error> {
    let response = transport.send_raw(envelope, message)?;
    debug!(code = %response.code(), "SMTP accepted message");
    Ok(())
}
