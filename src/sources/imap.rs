//! IMAP adapter.
//!
//! Candidates come from a server-side `UID SEARCH SINCE`. Message-ID
//! headers are fetched first for the whole candidate set so already
//! forwarded mail never has its body downloaded again. All fetches use
//! `BODY.PEEK` and leave `\Seen` flags untouched.

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

const PROTOCOL: &str = "imap";

/// Fetches messages over IMAP or IMAPS from one folder.
pub struct ImapSource {
    account: Arc<AccountConfig>,
}

impl ImapSource {
    pub fn new(account: Arc<AccountConfig>) -> Self {
        Self { account }
    }
}

#[async_trait]
impl MailSource for ImapSource {
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

/// One untagged server response, with any literals it carried.
#[derive(Debug, Default)]
struct Untagged {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// A tagged command/response session over one connection.
struct Session {
    conn: Connection,
    next_tag: u32,
}

impl Session {
    /// Run one command and return its untagged responses, failing unless
    /// the tagged completion is `OK`.
    fn execute(&mut self, cmd: &str) -> Result<Vec<Untagged>, SourceError> {
        self.next_tag += 1;
        let tag = format!("A{}", self.next_tag);
        self.conn.write_line(&format!("{tag} {cmd}"))?;

        let prefix = format!("{tag} ");
        let mut responses = Vec::new();
        loop {
            let response = self.read_response()?;
            if let Some(status) = response.text.strip_prefix(&prefix) {
                if status.starts_with("OK") {
                    return Ok(responses);
                }
                return Err(SourceError::Protocol {
                    protocol: PROTOCOL,
                    command: command_name(cmd),
                    reason: status.to_string(),
                });
            }
            responses.push(response);
        }
    }

    /// Read one logical response line, pulling in `{n}` literals.
    fn read_response(&mut self) -> Result<Untagged, SourceError> {
        let mut response = Untagged::default();
        loop {
            let line = self.conn.read_line()?;
            let literal = literal_len(&line);
            response.text.push_str(&line);
            match literal {
                Some(len) => response.literals.push(self.conn.read_exact(len)?),
                None => return Ok(response),
            }
        }
    }
}

/// One full IMAP session: login, select, search, fetch, logout.
pub(crate) fn fetch_blocking(
    account: &AccountConfig,
    seen: &SeenSet,
    lookback_days: u32,
    now: DateTime<Utc>,
) -> Result<Vec<Email>, SourceError> {
    let conn = Connection::connect(PROTOCOL, &account.host, account.port, account.use_tls)?;
    let mut session = Session { conn, next_tag: 0 };

    let result = run_session(&mut session, account, seen, lookback_days, now);

    if let Err(e) = session.execute("LOGOUT") {
        debug!(account = %account.name, error = %e, "IMAP LOGOUT failed");
    }
    result
}

fn run_session(
    session: &mut Session,
    account: &AccountConfig,
    seen: &SeenSet,
    lookback_days: u32,
    now: DateTime<Utc>,
) -> Result<Vec<Email>, SourceError> {
    let greeting = session.read_response()?;
    if !greeting.text.starts_with("* OK") && !greeting.text.starts_with("* PREAUTH") {
        return Err(SourceError::Protocol {
            protocol: PROTOCOL,
            command: "greeting".into(),
            reason: greeting.text,
        });
    }

    let login = format!(
        "LOGIN {} {}",
        quote(&account.username),
        quote(account.password.expose_secret())
    );
    session.execute(&login).map_err(|e| match e {
        SourceError::Protocol { reason, .. } => SourceError::Auth {
            protocol: PROTOCOL,
            username: account.username.clone(),
            reason,
        },
        other => other,
    })?;

    session.execute(&format!("SELECT {}", quote(&mailbox_name(account.imap_folder()))))?;

    let since = lookback_cutoff(now, lookback_days).format("%d-%b-%Y");
    let uids = parse_search(&session.execute(&format!("UID SEARCH SINCE {since}"))?);
    if uids.is_empty() {
        info!(account = %account.name, "No IMAP messages in date range");
        return Ok(Vec::new());
    }
    info!(account = %account.name, count = uids.len(), "Found IMAP messages in date range");

    let set = uid_set(&uids);
    let headers = session.execute(&format!(
        "UID FETCH {set} (UID BODY.PEEK[HEADER.FIELDS (MESSAGE-ID)])"
    ))?;
    let message_ids: HashMap<u32, String> = headers
        .iter()
        .filter_map(|r| {
            let uid = fetch_uid(&r.text)?;
            let id = extract_message_id(r.literals.first()?)?;
            Some((uid, id))
        })
        .collect();

    let mut emails = Vec::new();
    for uid in uids {
        let id = message_ids
            .get(&uid)
            .cloned()
            .unwrap_or_else(|| fallback_id(uid, &account.username));
        if seen.contains(&id) {
            continue;
        }

        let responses = session.execute(&format!("UID FETCH {uid} (UID BODY.PEEK[])"))?;
        let content = responses
            .into_iter()
            .filter(|r| r.text.contains(" FETCH "))
            .find_map(|r| r.literals.into_iter().next())
            .unwrap_or_default();
        if content.is_empty() {
            warn!(account = %account.name, msg_id = %id, "Empty IMAP body, skipping");
            continue;
        }

        emails.push(Email {
            id,
            date: extract_date(&content),
            content,
        });
    }

    info!(account = %account.name, new = emails.len(), "Filtered IMAP messages");
    Ok(emails)
}

/// Identifier for a message without a Message-ID header.
pub fn fallback_id(uid: u32, username: &str) -> String {
    format!("imap-{uid}-{username}")
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Command verb for error messages; arguments may carry credentials.
fn command_name(cmd: &str) -> String {
    let mut words = cmd.split_whitespace();
    match (words.next(), words.next()) {
        (Some("UID"), Some(sub)) => format!("UID {sub}"),
        (Some(verb), _) => verb.to_string(),
        _ => String::new(),
    }
}

/// Length of a literal announced at the end of a line, e.g. `{123}`.
fn literal_len(line: &str) -> Option<usize> {
    let rest = line.strip_suffix('}')?;
    let open = rest.rfind('{')?;
    rest[open + 1..].trim_end_matches('+').parse().ok()
}

/// UIDs from `* SEARCH` responses.
fn parse_search(responses: &[Untagged]) -> Vec<u32> {
    responses
        .iter()
        .filter_map(|r| r.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// `UID n` item of a FETCH response, wherever it appears.
fn fetch_uid(text: &str) -> Option<u32> {
    let mut words = text
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .filter(|w| !w.is_empty());
    while let Some(word) = words.next() {
        if word.eq_ignore_ascii_case("UID") {
            return words.next()?.parse().ok();
        }
    }
    None
}

/// Compact UID set: consecutive runs become `start:end`.
fn uid_set(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<(u32, u32)> = Vec::new();
    for uid in sorted {
        match runs.last_mut() {
            Some((_, end)) if end.checked_add(1) == Some(uid) => *end = uid,
            _ => runs.push((uid, uid)),
        }
    }

    runs.iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}:{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Mailbox name as sent on the wire (RFC 3501 modified UTF-7).
fn mailbox_name(folder: &str) -> String {
    utf7_imap::encode_utf7_imap(folder.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;
    use std::thread::{self, JoinHandle};

    use chrono::TimeZone;

    use super::*;

    struct FakeServer {
        port: u16,
        commands: Arc<Mutex<Vec<String>>>,
        handle: JoinHandle<()>,
    }

    /// A scripted IMAP server. `messages` are (uid, raw) pairs; every one of
    /// them matches the date search.
    fn serve(messages: Vec<(u32, &'static str)>, password: &'static str) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&commands);

        let handle = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut out = sock.try_clone().unwrap();
            let mut reader = BufReader::new(sock);
            out.write_all(b"* OK IMAP4rev1 ready\r\n").unwrap();

            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).unwrap() == 0 {
                    return;
                }
                let (tag, cmd) = line.trim_end().split_once(' ').unwrap();
                log.lock().unwrap().push(cmd.to_string());
                let reply = respond(tag, cmd, &messages, password);
                out.write_all(&reply).unwrap();
                if cmd == "LOGOUT" {
                    return;
                }
            }
        });

        FakeServer {
            port,
            commands,
            handle,
        }
    }

    fn respond(tag: &str, cmd: &str, messages: &[(u32, &str)], password: &str) -> Vec<u8> {
        let ok = format!("{tag} OK done\r\n");
        let mut out = Vec::new();
        if cmd.starts_with("LOGIN") {
            if cmd.ends_with(&format!("\"{password}\"")) {
                return ok.into_bytes();
            }
            return format!("{tag} NO [AUTHENTICATIONFAILED] bad credentials\r\n").into_bytes();
        }
        if cmd.starts_with("SELECT") {
            out.extend_from_slice(b"* 3 EXISTS\r\n");
        } else if cmd.starts_with("UID SEARCH") {
            let uids: Vec<String> = messages.iter().map(|(u, _)| u.to_string()).collect();
            out.extend_from_slice(format!("* SEARCH {}\r\n", uids.join(" ")).as_bytes());
        } else if cmd.contains("HEADER.FIELDS") {
            for (seq, (uid, raw)) in messages.iter().enumerate() {
                let header: String = raw
                    .split_inclusive("\r\n")
                    .filter(|l| l.to_ascii_lowercase().starts_with("message-id:"))
                    .chain(std::iter::once("\r\n"))
                    .collect();
                // Alternate UID placement to cover both orders.
                if seq % 2 == 0 {
                    out.extend_from_slice(
                        format!("* {} FETCH (UID {uid} BODY[HEADER.FIELDS (MESSAGE-ID)] {{{}}}\r\n{header})\r\n", seq + 1, header.len()).as_bytes(),
                    );
                } else {
                    out.extend_from_slice(
                        format!("* {} FETCH (BODY[HEADER.FIELDS (MESSAGE-ID)] {{{}}}\r\n{header} UID {uid})\r\n", seq + 1, header.len()).as_bytes(),
                    );
                }
            }
        } else if let Some(rest) = cmd.strip_prefix("UID FETCH ") {
            let uid: u32 = rest.split_whitespace().next().unwrap().parse().unwrap();
            if let Some((seq, (_, raw))) = messages.iter().enumerate().find(|(_, (u, _))| *u == uid) {
                out.extend_from_slice(
                    format!("* {} FETCH (UID {uid} BODY[] {{{}}}\r\n", seq + 1, raw.len()).as_bytes(),
                );
                out.extend_from_slice(raw.as_bytes());
                out.extend_from_slice(b")\r\n");
            }
        } else if cmd == "LOGOUT" {
            out.extend_from_slice(b"* BYE logging out\r\n");
        }
        out.extend_from_slice(ok.as_bytes());
        out
    }

    fn account(port: u16) -> AccountConfig {
        account_with_folder(port, "Lists")
    }

    fn account_with_folder(port: u16, folder: &str) -> AccountConfig {
        let yaml = format!(
            "name: work\nprotocol: imap\nhost: 127.0.0.1\nport: {port}\nusername: me\npassword: secret\nforward_to: x@y\nimap_folder: {folder}\n"
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    const WITH_ID: &str = "Message-ID: <one@x>\r\nSubject: a\r\n\r\nfirst\r\n";
    const WITHOUT_ID: &str = "Subject: b\r\n\r\nsecond\r\n";
    const EMPTY: &str = "";

    #[test]
    fn fetches_new_messages_with_ids_and_fallbacks() {
        let server = serve(vec![(10, WITH_ID), (11, WITHOUT_ID)], "secret");
        let emails = fetch_blocking(&account(server.port), &SeenSet::new(), 7, now()).unwrap();
        server.handle.join().unwrap();

        assert_eq!(emails.len(), 2);
        assert_eq!(emails[0].id, "one@x");
        assert_eq!(emails[0].content, WITH_ID.as_bytes());
        assert_eq!(emails[1].id, "imap-11-me");
        assert_eq!(emails[1].content, WITHOUT_ID.as_bytes());
    }

    #[test]
    fn seen_messages_are_not_downloaded() {
        let server = serve(vec![(10, WITH_ID), (11, WITHOUT_ID)], "secret");
        let seen: SeenSet = ["one@x".to_string()].into_iter().collect();
        let emails = fetch_blocking(&account(server.port), &seen, 7, now()).unwrap();
        server.handle.join().unwrap();

        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].id, "imap-11-me");
        let commands = server.commands.lock().unwrap();
        assert!(!commands.iter().any(|c| c == "UID FETCH 10 (UID BODY.PEEK[])"));
        assert!(commands.iter().any(|c| c == "UID FETCH 11 (UID BODY.PEEK[])"));
    }

    #[test]
    fn empty_body_is_skipped() {
        let server = serve(vec![(10, EMPTY), (11, WITH_ID)], "secret");
        let emails = fetch_blocking(&account(server.port), &SeenSet::new(), 7, now()).unwrap();
        server.handle.join().unwrap();

        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].id, "one@x");
    }

    #[test]
    fn session_selects_folder_searches_since_and_logs_out() {
        let server = serve(vec![], "secret");
        let emails = fetch_blocking(&account(server.port), &SeenSet::new(), 7, now()).unwrap();
        server.handle.join().unwrap();

        assert!(emails.is_empty());
        let commands = server.commands.lock().unwrap();
        assert_eq!(
            commands.as_slice(),
            &[
                "LOGIN \"me\" \"secret\"".to_string(),
                "SELECT \"Lists\"".to_string(),
                "UID SEARCH SINCE 12-Oct-2026".to_string(),
                "LOGOUT".to_string(),
            ]
        );
    }

    #[test]
    fn non_ascii_folder_is_selected_in_modified_utf7() {
        let server = serve(vec![], "secret");
        fetch_blocking(
            &account_with_folder(server.port, "Входящие"),
            &SeenSet::new(),
            7,
            now(),
        )
        .unwrap();
        server.handle.join().unwrap();

        let commands = server.commands.lock().unwrap();
        assert!(commands.iter().any(|c| c == "SELECT \"&BBIERQQ+BDQETwRJBDgENQ-\""));
    }

    #[test]
    fn header_fetch_uses_compact_uid_ranges() {
        let messages = vec![(1, WITH_ID), (2, WITHOUT_ID), (3, WITHOUT_ID), (7, WITHOUT_ID)];
        let server = serve(messages, "secret");
        fetch_blocking(&account(server.port), &SeenSet::new(), 7, now()).unwrap();
        server.handle.join().unwrap();

        let commands = server.commands.lock().unwrap();
        assert!(
            commands
                .iter()
                .any(|c| c.starts_with("UID FETCH 1:3,7 (UID BODY.PEEK[HEADER.FIELDS"))
        );
    }

    #[test]
    fn uid_sets_collapse_consecutive_runs() {
        assert_eq!(uid_set(&[1, 2, 3, 7, 9, 10]), "1:3,7,9:10");
        assert_eq!(uid_set(&[10, 9, 3, 1, 2, 7, 3]), "1:3,7,9:10");
        assert_eq!(uid_set(&[42]), "42");
        assert_eq!(uid_set(&[u32::MAX - 1, u32::MAX]), format!("{}:{}", u32::MAX - 1, u32::MAX));
    }

    #[test]
    fn mailbox_names_are_modified_utf7() {
        assert_eq!(mailbox_name("INBOX"), "INBOX");
        assert_eq!(mailbox_name("Lists"), "Lists");
        assert_eq!(mailbox_name("Входящие"), "&BBIERQQ+BDQETwRJBDgENQ-");
    }

    #[test]
    fn rejected_login_is_auth_error_and_still_logs_out() {
        let server = serve(vec![(10, WITH_ID)], "other");
        let err = fetch_blocking(&account(server.port), &SeenSet::new(), 7, now()).unwrap_err();
        server.handle.join().unwrap();

        assert!(matches!(err, SourceError::Auth { .. }), "{err}");
        assert!(!err.to_string().contains("secret"));
        assert_eq!(
            server.commands.lock().unwrap().last().map(String::as_str),
            Some("LOGOUT")
        );
    }

    #[test]
    fn literal_lengths() {
        assert_eq!(literal_len("* 1 FETCH (BODY[] {42}"), Some(42));
        assert_eq!(literal_len("* 1 FETCH (BODY[] {42+}"), Some(42));
        assert_eq!(literal_len("* 1 FETCH (FLAGS (\\Seen))"), None);
        assert_eq!(literal_len("A1 OK {not a literal}"), None);
    }

    #[test]
    fn uid_is_found_before_or_after_body() {
        assert_eq!(fetch_uid("* 1 FETCH (UID 42 BODY[] {3}"), Some(42));
        assert_eq!(fetch_uid("* 1 FETCH (BODY[] {3}abc UID 7)"), Some(7));
        assert_eq!(fetch_uid("* 1 FETCH (FLAGS ())"), None);
    }

    #[test]
    fn search_results_are_collected() {
        let responses = vec![
            Untagged {
                text: "* SEARCH 3 5 8".into(),
                literals: vec![],
            },
            Untagged {
                text: "* 9 EXISTS".into(),
                literals: vec![],
            },
        ];
        assert_eq!(parse_search(&responses), vec![3, 5, 8]);
    }

    #[test]
    fn quoting_escapes_specials() {
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[test]
    fn command_names_hide_arguments() {
        assert_eq!(command_name("LOGIN \"me\" \"secret\""), "LOGIN");
        assert_eq!(command_name("UID FETCH 1 (BODY.PEEK[])"), "UID FETCH");
    }
}
