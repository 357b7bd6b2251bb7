//! Configuration types.
//!
//! The configuration document is YAML: one outgoing relay (`sender`) and a
//! list of monitored `accounts`. Loading validates everything up front so a
//! bad file aborts the process before any worker starts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Poll interval used when an account does not set one.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Lookback window used when an account does not set one.
pub const DEFAULT_PROCESS_DAYS: u32 = 7;

/// IMAP folder used when an account does not set one.
pub const DEFAULT_IMAP_FOLDER: &str = "INBOX";

/// Extension of per-account ledger files.
pub const LEDGER_EXTENSION: &str = "seen";

/// Top-level application configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub sender: RelayConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Outgoing SMTP relay configuration.
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default = "empty_secret", deserialize_with = "secret")]
    pub password: SecretString,
    #[serde(default)]
    pub use_tls: bool,
}

/// Retrieval protocol of a monitored account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Protocol {
    Pop3,
    Imap,
    /// Anything else; rejected by validation and by the source factory.
    Other(String),
}

impl From<String> for Protocol {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pop3" => Self::Pop3,
            "imap" => Self::Imap,
            _ => Self::Other(s),
        }
    }
}

impl Protocol {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pop3 => "pop3",
            Self::Imap => "imap",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One monitored email account.
#[derive(Debug, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub name: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default = "empty_secret", deserialize_with = "secret")]
    pub password: SecretString,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub forward_to: String,
    #[serde(default)]
    pub check_interval_seconds: i64,
    #[serde(default)]
    pub process_days: i64,
    #[serde(default)]
    pub imap_folder: String,
}

impl AccountConfig {
    /// Poll interval; non-positive values fall back to 60 seconds.
    pub fn check_interval(&self) -> Duration {
        if self.check_interval_seconds <= 0 {
            return DEFAULT_CHECK_INTERVAL;
        }
        Duration::from_secs(self.check_interval_seconds as u64)
    }

    /// Lookback window in days; non-positive values fall back to 7.
    pub fn lookback_days(&self) -> u32 {
        if self.process_days <= 0 {
            return DEFAULT_PROCESS_DAYS;
        }
        u32::try_from(self.process_days).unwrap_or(u32::MAX)
    }

    /// IMAP folder, `INBOX` when unset.
    pub fn imap_folder(&self) -> &str {
        if self.imap_folder.is_empty() {
            DEFAULT_IMAP_FOLDER
        } else {
            &self.imap_folder
        }
    }

    /// Name used in validation messages: the account name or `#index`.
    fn label(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("#{index}")
        } else {
            self.name.clone()
        }
    }
}

impl Config {
    /// Read, parse and validate a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&data)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every worker relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sender.host.is_empty() {
            return Err(missing("sender.host"));
        }
        if self.sender.port == 0 {
            return Err(missing("sender.port"));
        }
        if self.accounts.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "accounts".into(),
                message: "at least one account is required".into(),
            });
        }

        for (i, account) in self.accounts.iter().enumerate() {
            let label = account.label(i);
            if let Protocol::Other(p) = &account.protocol {
                return Err(ConfigError::InvalidValue {
                    key: format!("account {label}: protocol"),
                    message: format!("must be pop3 or imap, got {p:?}"),
                });
            }
            if account.host.is_empty() {
                return Err(missing(&format!("account {label}: host")));
            }
            if account.port == 0 {
                return Err(missing(&format!("account {label}: port")));
            }
            if account.forward_to.is_empty() {
                return Err(missing(&format!("account {label}: forward_to")));
            }
        }
        Ok(())
    }
}

/// Path of the dedup ledger for an account under `data_dir`.
pub fn ledger_path(data_dir: &Path, account_name: &str) -> PathBuf {
    data_dir.join(format!("{}.{LEDGER_EXTENSION}", sanitize_name(account_name)))
}

/// Make an account name safe for use as a file stem.
///
/// ASCII alphanumerics, `-` and `_` are kept; every other byte becomes `_`.
/// An empty name maps to `default`.
pub fn sanitize_name(name: &str) -> String {
    if name.is_empty() {
        return "default".to_string();
    }
    name.bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
                b as char
            } else {
                '_'
            }
        })
        .collect()
}

fn missing(key: &str) -> ConfigError {
    ConfigError::MissingRequired { key: key.into() }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

fn secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    const MINIMAL: &str = r#"
sender:
  host: smtp.example.org
  port: 587
accounts:
  - name: work
    protocol: imap
    host: imap.example.org
    port: 993
    username: me@example.org
    password: hunter2
    use_tls: true
    forward_to: me@example.net
"#;

    #[test]
    fn parses_minimal_document_with_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.sender.host, "smtp.example.org");
        assert!(config.sender.password.expose_secret().is_empty());

        let account = &config.accounts[0];
        assert_eq!(account.protocol, Protocol::Imap);
        assert_eq!(account.password.expose_secret(), "hunter2");
        assert_eq!(account.check_interval(), Duration::from_secs(60));
        assert_eq!(account.lookback_days(), 7);
        assert_eq!(account.imap_folder(), "INBOX");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let doc = MINIMAL.replace(
            "forward_to: me@example.net",
            "forward_to: me@example.net\n    check_interval_seconds: 300\n    process_days: 2\n    imap_folder: Archive",
        );
        let config = Config::from_yaml(&doc).unwrap();
        let account = &config.accounts[0];
        assert_eq!(account.check_interval(), Duration::from_secs(300));
        assert_eq!(account.lookback_days(), 2);
        assert_eq!(account.imap_folder(), "Archive");
    }

    #[test]
    fn non_positive_interval_and_lookback_fall_back() {
        let doc = MINIMAL.replace(
            "forward_to: me@example.net",
            "forward_to: me@example.net\n    check_interval_seconds: -5\n    process_days: 0",
        );
        let config = Config::from_yaml(&doc).unwrap();
        assert_eq!(config.accounts[0].check_interval(), DEFAULT_CHECK_INTERVAL);
        assert_eq!(config.accounts[0].lookback_days(), DEFAULT_PROCESS_DAYS);
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        let debug = format!("{:?}", config.accounts[0]);
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn rejects_missing_sender_host() {
        let doc = MINIMAL.replace("host: smtp.example.org", "host: \"\"");
        let err = Config::from_yaml(&doc).unwrap_err();
        assert!(err.to_string().contains("sender.host"));
    }

    #[test]
    fn rejects_missing_sender_port() {
        let doc = MINIMAL.replace("port: 587", "port: 0");
        let err = Config::from_yaml(&doc).unwrap_err();
        assert!(err.to_string().contains("sender.port"));
    }

    #[test]
    fn rejects_empty_account_list() {
        let doc = "sender:\n  host: smtp.example.org\n  port: 25\naccounts: []\n";
        let err = Config::from_yaml(doc).unwrap_err();
        assert!(err.to_string().contains("at least one account"));
    }

    #[test]
    fn rejects_unknown_protocol_naming_the_account() {
        let doc = MINIMAL.replace("protocol: imap", "protocol: jmap");
        let err = Config::from_yaml(&doc).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("work"), "{msg}");
        assert!(msg.contains("pop3 or imap"), "{msg}");
    }

    #[test]
    fn unnamed_account_is_labelled_by_index() {
        let doc = MINIMAL
            .replace("  - name: work\n    protocol", "  - protocol")
            .replace("forward_to: me@example.net", "forward_to: \"\"");
        let err = Config::from_yaml(&doc).unwrap_err();
        assert!(err.to_string().contains("account #0: forward_to"));
    }

    #[test]
    fn rejects_missing_account_port() {
        let doc = MINIMAL.replace("port: 993", "port: 0");
        let err = Config::from_yaml(&doc).unwrap_err();
        assert!(err.to_string().contains("account work: port"));
    }

    #[test]
    fn protocol_parsing_is_exact() {
        assert_eq!(Protocol::from("pop3".to_string()), Protocol::Pop3);
        assert_eq!(Protocol::from("imap".to_string()), Protocol::Imap);
        assert_eq!(
            Protocol::from("IMAP".to_string()),
            Protocol::Other("IMAP".into())
        );
    }

    #[test]
    fn sanitize_replaces_unsafe_bytes() {
        assert_eq!(sanitize_name("work mail/inbox"), "work_mail_inbox");
        assert_eq!(sanitize_name("a-b_C9"), "a-b_C9");
        assert_eq!(sanitize_name(""), "default");
        // Multi-byte characters become one underscore per byte.
        assert_eq!(sanitize_name("é"), "__");
    }

    #[test]
    fn ledger_path_uses_sanitized_name() {
        let path = ledger_path(Path::new("/var/lib/mm"), "me@example.org");
        assert_eq!(path, PathBuf::from("/var/lib/mm/me_example_org.seen"));
    }
}
