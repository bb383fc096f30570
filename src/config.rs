//! Configuration for mail accounts and pipeline behavior
//!
//! All configuration is loaded from environment variables following the pattern
//! `MAIL_DISPATCH_<SEGMENT>_<KEY>`. Account segments are discovered by scanning
//! for `MAIL_DISPATCH_*_EMAIL` variables. A `.env` file is honored by the
//! entry point before loading.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};
use crate::providers::{self, ImapEndpoint, SmtpSecurity, SmtpSettings};

const PREFIX: &str = "MAIL_DISPATCH_";

/// Mail account configuration
///
/// Holds identity, credentials and resolved endpoints for a single account.
/// Passwords are stored using `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Account identifier (lowercase segment name)
    pub account_id: String,
    /// Primary address; always used for SMTP and IMAP authentication
    pub email: String,
    /// Password stored in a type that prevents accidental logging
    pub pass: SecretString,
    /// Visible From override (alias), if configured
    pub from_email: Option<String>,
    /// Display name for the visible From header
    pub from_name: Option<String>,
    /// Signature appended to outgoing bodies
    pub signature: Option<String>,
    /// Image embedded into templated HTML via `{{PROFILE_IMAGE}}`
    pub profile_image: Option<PathBuf>,
    pub smtp: SmtpSettings,
    pub imap: ImapEndpoint,
}

impl AccountConfig {
    /// Address shown in the From header and used as envelope sender
    pub fn visible_from(&self) -> &str {
        self.from_email
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(&self.email)
    }

    /// Whether the visible From differs from the authenticated account
    pub fn uses_alias(&self) -> bool {
        !self.visible_from().eq_ignore_ascii_case(&self.email)
    }
}

/// Application-wide configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// All configured accounts, keyed by `account_id`
    pub accounts: BTreeMap<String, AccountConfig>,
    /// Root of the local file tree (`sent/`, `drafts/`)
    pub storage_dir: PathBuf,
    /// HTML template with `{{BODY}}` and `{{PROFILE_IMAGE}}` placeholders
    pub template_path: Option<PathBuf>,
    /// Whether to append the "Sent with" footer
    pub attribution: bool,
    /// Whether to run Sent confirmation and bounce checks after delivery
    pub verify_delivery: bool,
    /// Delay before searching the Sent folder
    pub sent_settle_ms: u64,
    /// Delay before scanning the inbox for bounces
    pub bounce_settle_ms: u64,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// IMAP greeting/TLS handshake timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Socket I/O timeout in milliseconds
    pub socket_timeout_ms: u64,
}

impl AppConfig {
    /// Load all configuration from the process environment
    ///
    /// # Errors
    ///
    /// Returns `Config` if no account is defined, an account names an unknown
    /// provider, or a value is malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_DISPATCH_PERSONAL_EMAIL=me@fastmail.com
    /// MAIL_DISPATCH_PERSONAL_PASS=app-password
    /// MAIL_DISPATCH_PERSONAL_PROVIDER=fastmail
    /// MAIL_DISPATCH_PERSONAL_FROM_EMAIL=hello@example.com
    /// MAIL_DISPATCH_WORK_EMAIL=me@company.com
    /// MAIL_DISPATCH_WORK_PASS=work-pass
    /// MAIL_DISPATCH_WORK_PROVIDER=outlook
    /// MAIL_DISPATCH_VERIFY=false
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let vars: BTreeMap<String, String> = env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self::load_from_vars(&vars)
    }

    /// Load configuration from an explicit variable map
    ///
    /// # Errors
    ///
    /// Same as [`AppConfig::load_from_env`].
    pub fn load_from_vars(vars: &BTreeMap<String, String>) -> AppResult<Self> {
        let account_pattern = Regex::new(r"^MAIL_DISPATCH_([A-Z0-9_]+)_EMAIL$")
            .map_err(|e| AppError::Internal(format!("invalid account regex: {e}")))?;

        let mut account_segments: Vec<String> = vars
            .keys()
            .filter_map(|k| {
                account_pattern
                    .captures(k)
                    .and_then(|c| c.get(1).map(|m| m.as_str().to_owned()))
            })
            // `<SEG>_FROM_EMAIL` is an alias, not an account
            .filter(|seg| seg != "FROM" && !seg.ends_with("_FROM"))
            .collect();

        if account_segments.is_empty() {
            return Err(AppError::config(
                "no accounts configured; set MAIL_DISPATCH_<NAME>_EMAIL, _PASS and _PROVIDER",
            ));
        }

        account_segments.sort();
        account_segments.dedup();

        let mut accounts = BTreeMap::new();
        for seg in account_segments {
            let account = load_account(vars, &seg)?;
            accounts.insert(account.account_id.clone(), account);
        }

        let storage_dir = match optional_var(vars, &format!("{PREFIX}STORAGE_DIR")) {
            Some(dir) => PathBuf::from(dir),
            None => default_storage_dir(),
        };

        Ok(Self {
            accounts,
            storage_dir,
            template_path: optional_var(vars, &format!("{PREFIX}TEMPLATE")).map(PathBuf::from),
            attribution: parse_bool_var(vars, &format!("{PREFIX}ATTRIBUTION"), true)?,
            verify_delivery: parse_bool_var(vars, &format!("{PREFIX}VERIFY"), true)?,
            sent_settle_ms: parse_u64_var(vars, &format!("{PREFIX}SENT_SETTLE_MS"), 2_000)?,
            bounce_settle_ms: parse_u64_var(vars, &format!("{PREFIX}BOUNCE_SETTLE_MS"), 3_000)?,
            connect_timeout_ms: parse_u64_var(vars, &format!("{PREFIX}CONNECT_TIMEOUT_MS"), 30_000)?,
            greeting_timeout_ms: parse_u64_var(
                vars,
                &format!("{PREFIX}GREETING_TIMEOUT_MS"),
                15_000,
            )?,
            socket_timeout_ms: parse_u64_var(vars, &format!("{PREFIX}SOCKET_TIMEOUT_MS"), 300_000)?,
        })
    }

    /// Get account configuration by ID, or the sole/`default` account
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account ID is not configured, or `Config` if
    /// several accounts exist and none was chosen.
    pub fn get_account(&self, account_id: Option<&str>) -> AppResult<&AccountConfig> {
        match account_id {
            Some(id) => {
                let id = id.to_ascii_lowercase();
                self.accounts
                    .get(&id)
                    .ok_or_else(|| AppError::NotFound(format!("account '{id}' is not configured")))
            }
            None => {
                if let Some(account) = self.accounts.get("default") {
                    return Ok(account);
                }
                let mut iter = self.accounts.values();
                match (iter.next(), iter.next()) {
                    (Some(only), None) => Ok(only),
                    _ => Err(AppError::config(format!(
                        "several accounts configured ({}); pick one with --account",
                        self.accounts.keys().cloned().collect::<Vec<_>>().join(", ")
                    ))),
                }
            }
        }
    }

    pub fn sent_settle(&self) -> Duration {
        Duration::from_millis(self.sent_settle_ms)
    }

    pub fn bounce_settle(&self) -> Duration {
        Duration::from_millis(self.bounce_settle_ms)
    }
}

/// Load a single account configuration
///
/// Reads `_EMAIL`, `_PASS` and `_PROVIDER`, then applies endpoint overrides.
/// An account with both `_SMTP_HOST` and `_IMAP_HOST` may omit the provider.
fn load_account(vars: &BTreeMap<String, String>, segment: &str) -> AppResult<AccountConfig> {
    let prefix = format!("{PREFIX}{}_", sanitize_segment(segment));
    let email = required_var(vars, &format!("{prefix}EMAIL"))?;
    let pass = required_var(vars, &format!("{prefix}PASS"))?;

    let smtp_host = optional_var(vars, &format!("{prefix}SMTP_HOST"));
    let imap_host = optional_var(vars, &format!("{prefix}IMAP_HOST"));
    let provider = match optional_var(vars, &format!("{prefix}PROVIDER")) {
        Some(name) => Some(providers::lookup(&name)?),
        None if smtp_host.is_some() && imap_host.is_some() => None,
        None => {
            return Err(AppError::config(format!(
                "missing {prefix}PROVIDER (or both {prefix}SMTP_HOST and {prefix}IMAP_HOST)"
            )));
        }
    };

    let security = match optional_var(vars, &format!("{prefix}SMTP_SECURITY")) {
        Some(v) => v.parse::<SmtpSecurity>()?,
        None => {
            let starttls = optional_var(vars, &format!("{prefix}SMTP_STARTTLS"));
            let implicit = optional_var(vars, &format!("{prefix}SMTP_TLS"));
            if starttls.is_some() || implicit.is_some() {
                SmtpSecurity::from_flags(
                    parse_bool_var(vars, &format!("{prefix}SMTP_STARTTLS"), false)?,
                    parse_bool_var(vars, &format!("{prefix}SMTP_TLS"), false)?,
                )
            } else {
                provider.map_or(SmtpSecurity::StartTls, |p| p.smtp_security)
            }
        }
    };
    let default_smtp_port = provider.map_or(
        match security {
            SmtpSecurity::Tls => 465,
            SmtpSecurity::StartTls => 587,
            SmtpSecurity::Plain => 25,
        },
        |p| p.smtp_port,
    );

    let smtp = SmtpSettings {
        host: smtp_host
            .or_else(|| provider.map(|p| p.smtp_host.to_owned()))
            .unwrap_or_default(),
        port: parse_u16_var(vars, &format!("{prefix}SMTP_PORT"), default_smtp_port)?,
        security,
    };
    let imap = ImapEndpoint {
        host: imap_host
            .or_else(|| provider.map(|p| p.imap_host.to_owned()))
            .unwrap_or_default(),
        port: parse_u16_var(
            vars,
            &format!("{prefix}IMAP_PORT"),
            provider.map_or(993, |p| p.imap_port),
        )?,
    };

    Ok(AccountConfig {
        account_id: segment.to_ascii_lowercase(),
        email,
        pass: SecretString::new(pass.into()),
        from_email: optional_var(vars, &format!("{prefix}FROM_EMAIL")),
        from_name: optional_var(vars, &format!("{prefix}FROM_NAME")),
        signature: optional_var(vars, &format!("{prefix}SIGNATURE")),
        profile_image: optional_var(vars, &format!("{prefix}PROFILE_IMAGE")).map(PathBuf::from),
        smtp,
        imap,
    })
}

/// `.email` in the working directory when present, otherwise `~/.email`
fn default_storage_dir() -> PathBuf {
    let local = Path::new(".email");
    if local.is_dir() {
        return local.to_path_buf();
    }
    dirs::home_dir()
        .map(|home| home.join(".email"))
        .unwrap_or_else(|| local.to_path_buf())
}

/// Read a required variable, returning error if missing or empty
fn required_var(vars: &BTreeMap<String, String>, key: &str) -> AppResult<String> {
    optional_var(vars, key)
        .ok_or_else(|| AppError::config(format!("missing required environment variable {key}")))
}

fn optional_var(vars: &BTreeMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Sanitize an account segment to uppercase alphanumeric/underscore
///
/// Non-alphanumeric characters are replaced with underscores, and leading/
/// trailing underscores are trimmed.
fn sanitize_segment(seg: &str) -> String {
    let mut out = String::with_capacity(seg.len());
    for ch in seg.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push('_');
        }
    }
    out.trim_matches('_').to_owned()
}

/// Parse a boolean variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
///
/// # Errors
///
/// Returns `Config` if the variable is set to an unrecognized value.
fn parse_bool_var(vars: &BTreeMap<String, String>, key: &str, default: bool) -> AppResult<bool> {
    match vars.get(key) {
        Some(v) => parse_bool_value(v).ok_or_else(|| {
            AppError::config(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

pub(crate) fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u16_var(vars: &BTreeMap<String, String>, key: &str, default: u16) -> AppResult<u16> {
    match vars.get(key) {
        Some(v) => v.trim().parse::<u16>().map_err(|_| {
            AppError::config(format!("invalid u16 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_u64_var(vars: &BTreeMap<String, String>, key: &str, default: u64) -> AppResult<u64> {
    match vars.get(key) {
        Some(v) => v.trim().parse::<u64>().map_err(|_| {
            AppError::config(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{AppConfig, parse_bool_value};
    use crate::providers::SmtpSecurity;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }

        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn provider_supplies_endpoints_and_alias_is_visible_from() {
        let cfg = AppConfig::load_from_vars(&vars(&[
            ("MAIL_DISPATCH_PERSONAL_EMAIL", "me@fastmail.com"),
            ("MAIL_DISPATCH_PERSONAL_PASS", "secret"),
            ("MAIL_DISPATCH_PERSONAL_PROVIDER", "fastmail"),
            ("MAIL_DISPATCH_PERSONAL_FROM_EMAIL", "hi@example.com"),
            ("MAIL_DISPATCH_STORAGE_DIR", "/tmp/mail"),
        ]))
        .expect("config");

        let account = cfg.get_account(None).expect("single account");
        assert_eq!(account.account_id, "personal");
        assert_eq!(account.smtp.host, "smtp.fastmail.com");
        assert_eq!(account.smtp.security, SmtpSecurity::Tls);
        assert_eq!(account.imap.port, 993);
        assert_eq!(account.visible_from(), "hi@example.com");
        assert!(account.uses_alias());
        assert!(cfg.verify_delivery);
        assert_eq!(cfg.sent_settle_ms, 2_000);
        assert_eq!(cfg.storage_dir.to_str(), Some("/tmp/mail"));
    }

    #[test]
    fn overrides_beat_provider_defaults() {
        let cfg = AppConfig::load_from_vars(&vars(&[
            ("MAIL_DISPATCH_WORK_EMAIL", "me@corp.test"),
            ("MAIL_DISPATCH_WORK_PASS", "secret"),
            ("MAIL_DISPATCH_WORK_SMTP_HOST", "mail.corp.test"),
            ("MAIL_DISPATCH_WORK_SMTP_SECURITY", "plain"),
            ("MAIL_DISPATCH_WORK_IMAP_HOST", "imap.corp.test"),
            ("MAIL_DISPATCH_VERIFY", "off"),
        ]))
        .expect("config");

        let account = cfg.get_account(Some("WORK")).expect("account");
        assert_eq!(account.smtp.port, 25);
        assert_eq!(account.smtp.security, SmtpSecurity::Plain);
        assert!(!account.uses_alias());
        assert!(!cfg.verify_delivery);
    }

    #[test]
    fn legacy_tls_flags_select_the_mode() {
        let cfg = AppConfig::load_from_vars(&vars(&[
            ("MAIL_DISPATCH_OLD_EMAIL", "me@corp.test"),
            ("MAIL_DISPATCH_OLD_PASS", "secret"),
            ("MAIL_DISPATCH_OLD_SMTP_HOST", "mail.corp.test"),
            ("MAIL_DISPATCH_OLD_IMAP_HOST", "imap.corp.test"),
            ("MAIL_DISPATCH_OLD_SMTP_STARTTLS", "false"),
            ("MAIL_DISPATCH_OLD_SMTP_TLS", "true"),
        ]))
        .expect("config");

        let account = cfg.get_account(None).expect("account");
        assert_eq!(account.smtp.security, SmtpSecurity::Tls);
        assert_eq!(account.smtp.port, 465);
    }

    #[test]
    fn unknown_provider_fails_before_any_connection() {
        let err = AppConfig::load_from_vars(&vars(&[
            ("MAIL_DISPATCH_A_EMAIL", "a@x.com"),
            ("MAIL_DISPATCH_A_PASS", "p"),
            ("MAIL_DISPATCH_A_PROVIDER", "mystery"),
        ]))
        .expect_err("must fail");
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn ambiguous_account_choice_is_rejected() {
        let cfg = AppConfig::load_from_vars(&vars(&[
            ("MAIL_DISPATCH_A_EMAIL", "a@x.com"),
            ("MAIL_DISPATCH_A_PASS", "p"),
            ("MAIL_DISPATCH_A_PROVIDER", "gmail"),
            ("MAIL_DISPATCH_B_EMAIL", "b@x.com"),
            ("MAIL_DISPATCH_B_PASS", "p"),
            ("MAIL_DISPATCH_B_PROVIDER", "yahoo"),
        ]))
        .expect("config");
        assert!(cfg.get_account(None).is_err());
        assert_eq!(cfg.get_account(Some("b")).expect("b").email, "b@x.com");
    }
}
