//! POP3 adapter.
//!
//! POP3 has no server-side date search, so every listed message is
//! retrieved and filtered client-side by its Date header. Messages without
//! a parseable date are kept.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use super::transport::Connection;
use super::{Email, MailSource, extract_date, extract_message_id, lookback_cutoff};
use crate::config::AccountConfig;
use crate::error::SourceError;
use crate::ledger::SeenSet;

const PROTOCOL: &str = "pop3";

/// Fetches messages over POP3 or POP3S.
pub struct Pop3Source {
    account: Arc<AccountConfig>,
}

impl Pop3Source {
    pub fn new(account: Arc<AccountConfig>) -> Self {
        Self { account }
    }
}

#[async_trait]
impl MailSource for Pop3Source {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    async fn fetch(
        &self,
        seen: Arc<SeenSet>,
        lookback_days: u32,
    ) -> Result<Vec<Email>, SourceError> {
        let account = Arc::clone(&self.account);
        tokio::task::spawn_blocking(move || {
            fetch_blocking(&account, &seen, lookback_days, Utc::now())
        })
        .await
        .map_err(|e| SourceError::Task(e.to_string()))?
    }
}

/// One full POP3 session: connect, authenticate, list, retrieve, quit.
pub(crate) fn fetch_blocking(
    account: &AccountConfig,
    seen: &SeenSet,
    lookback_days: u32,
    now: DateTime<Utc>,
) -> Result<Vec<Email>, SourceError> {
    let mut conn = Connection::connect(PROTOCOL, &account.host, account.port, account.use_tls)?;

    let result = run_session(&mut conn, account, seen, lookback_days, now);

    // QUIT on every path once connected; a failure here changes nothing.
    if let Err(e) = command(&mut conn, "QUIT") {
        debug!(account = %account.name, error = %e, "POP3 QUIT failed");
    }
    result
}

fn run_session(
    conn: &mut Connection,
    account: &AccountConfig,
    seen: &SeenSet,
    lookback_days: u32,
    now: DateTime<Utc>,
) -> Result<Vec<Email>, SourceError> {
    let greeting = conn.read_line()?;
    check_ok("greeting", &greeting)?;

    authenticate(conn, account)?;

    let uids = list_uids(conn)?;
    let listing = multiline(conn, "LIST")?;
    let ids: Vec<u32> = listing
        .iter()
        .filter_map(|line| line.split_whitespace().next()?.parse().ok())
        .collect();

    info!(account = %account.name, count = ids.len(), "Fetched POP3 message list");

    let cutoff = lookback_cutoff(now, lookback_days);
    let mut emails = Vec::new();

    for seq in ids {
        let raw = match retrieve(conn, seq) {
            Ok(raw) => raw,
            Err(e @ SourceError::Protocol { .. }) => {
                warn!(account = %account.name, seq, error = %e, "POP3 retrieve failed");
                continue;
            }
            Err(e) => return Err(e),
        };

        let id = extract_message_id(&raw)
            .unwrap_or_else(|| fallback_id(seq, uids.get(&seq).map(String::as_str), &account.username));

        if seen.contains(&id) {
            continue;
        }

        let date = extract_date(&raw);
        if date.is_some_and(|d| d < cutoff) {
            continue;
        }

        emails.push(Email {
            id,
            date,
            content: raw,
        });
    }

    info!(account = %account.name, new = emails.len(), "Filtered POP3 messages");
    Ok(emails)
}

/// Identifier for a message without a Message-ID header.
pub fn fallback_id(seq: u32, uid: Option<&str>, username: &str) -> String {
    match uid {
        Some(uid) => format!("pop3-uid-{uid}-{username}"),
        None => format!("pop3-{seq}-{username}"),
    }
}

fn authenticate(conn: &mut Connection, account: &AccountConfig) -> Result<(), SourceError> {
    let auth_err = |line: String| SourceError::Auth {
        protocol: PROTOCOL,
        username: account.username.clone(),
        reason: line,
    };

    let reply = command(conn, &format!("USER {}", account.username))?;
    if !reply.starts_with("+OK") {
        return Err(auth_err(reply));
    }
    let reply = command(
        conn,
        &format!("PASS {}", account.password.expose_secret()),
    )?;
    if !reply.starts_with("+OK") {
        return Err(auth_err(reply));
    }
    Ok(())
}

/// UIDL map from sequence number to unique ID. Servers without UIDL yield
/// an empty map.
fn list_uids(conn: &mut Connection) -> Result<HashMap<u32, String>, SourceError> {
    let lines = match multiline(conn, "UIDL") {
        Ok(lines) => lines,
        Err(SourceError::Protocol { reason, .. }) => {
            debug!(reason = %reason, "POP3 server has no UIDL");
            return Ok(HashMap::new());
        }
        Err(e) => return Err(e),
    };

    Ok(lines
        .iter()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let seq = parts.next()?.parse().ok()?;
            let uid = parts.next()?.to_string();
            Some((seq, uid))
        })
        .collect())
}

/// RETR one message, returning its raw bytes with dot-stuffing removed.
fn retrieve(conn: &mut Connection, seq: u32) -> Result<Vec<u8>, SourceError> {
    let cmd = format!("RETR {seq}");
    let status = command(conn, &cmd)?;
    check_ok(&cmd, &status)?;

    let mut raw = Vec::new();
    loop {
        let line = conn.read_raw_line()?;
        if line == b".\r\n" || line == b".\n" {
            break;
        }
        let unstuffed = if line.starts_with(b"..") { &line[1..] } else { &line[..] };
        raw.extend_from_slice(unstuffed);
    }
    Ok(raw)
}

/// Send a multi-line command and collect its body lines.
fn multiline(conn: &mut Connection, cmd: &str) -> Result<Vec<String>, SourceError> {
    let status = command(conn, cmd)?;
    check_ok(cmd, &status)?;

    let mut lines = Vec::new();
    loop {
        let line = conn.read_line()?;
        if line == "." {
            return Ok(lines);
        }
        lines.push(line);
    }
}

fn command(conn: &mut Connection, cmd: &str) -> Result<String, SourceError> {
    conn.write_line(cmd)?;
    conn.read_line()
}

fn check_ok(command: &str, line: &str) -> Result<(), SourceError> {
    if line.starts_with("+OK") {
        return Ok(());
    }
    // Never echo credentials back into an error.
    let command = command.split_whitespace().next().unwrap_or(command);
    Err(SourceError::Protocol {
        protocol: PROTOCOL,
        command: command.to_string(),
        reason: line.to_string(),
    })
}
