//! mailmirror: poll POP3/IMAP mailboxes and relay new mail over SMTP.

pub mod config;
pub mod error;
pub mod forwarder;
pub mod ledger;
pub mod logging;
pub mod relay;
pub mod sources;
