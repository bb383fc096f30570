//! Known mail providers and their server endpoints
//!
//! Accounts name a provider; the provider supplies SMTP and IMAP endpoints.
//! Per-account overrides in the configuration take precedence.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::errors::{AppError, AppResult};

/// SMTP session security mode
///
/// The configured mode is authoritative. A session never falls back from one
/// mode to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Plaintext connect, mandatory STARTTLS upgrade before AUTH
    StartTls,
    /// TLS from the first byte (SMTPS)
    Tls,
    /// No TLS at all
    Plain,
}

impl SmtpSecurity {
    /// Resolve the mode from the two legacy flags
    ///
    /// STARTTLS wins when both are set; plaintext only when neither is.
    pub fn from_flags(starttls: bool, implicit_tls: bool) -> Self {
        if starttls {
            Self::StartTls
        } else if implicit_tls {
            Self::Tls
        } else {
            Self::Plain
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartTls => "starttls",
            Self::Tls => "tls",
            Self::Plain => "plain",
        }
    }
}

impl fmt::Display for SmtpSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SmtpSecurity {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "starttls" => Ok(Self::StartTls),
            "tls" | "ssl" | "smtps" => Ok(Self::Tls),
            "plain" | "none" => Ok(Self::Plain),
            other => Err(AppError::config(format!(
                "unknown SMTP security mode '{other}' (expected starttls, tls or plain)"
            ))),
        }
    }
}

/// Resolved SMTP endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
}

/// Resolved IMAP endpoint (always TLS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImapEndpoint {
    pub host: String,
    pub port: u16,
}

/// Built-in provider entry
#[derive(Debug, Clone, Copy)]
pub struct Provider {
    pub name: &'static str,
    pub smtp_host: &'static str,
    pub smtp_port: u16,
    pub smtp_security: SmtpSecurity,
    pub imap_host: &'static str,
    pub imap_port: u16,
}

impl Provider {
    pub fn smtp(&self) -> SmtpSettings {
        SmtpSettings {
            host: self.smtp_host.to_owned(),
            port: self.smtp_port,
            security: self.smtp_security,
        }
    }

    pub fn imap(&self) -> ImapEndpoint {
        ImapEndpoint {
            host: self.imap_host.to_owned(),
            port: self.imap_port,
        }
    }
}

const PROVIDERS: &[Provider] = &[
    Provider {
        name: "gmail",
        smtp_host: "smtp.gmail.com",
        smtp_port: 587,
        smtp_security: SmtpSecurity::StartTls,
        imap_host: "imap.gmail.com",
        imap_port: 993,
    },
    Provider {
        name: "fastmail",
        smtp_host: "smtp.fastmail.com",
        smtp_port: 465,
        smtp_security: SmtpSecurity::Tls,
        imap_host: "imap.fastmail.com",
        imap_port: 993,
    },
    Provider {
        name: "zoho",
        smtp_host: "smtp.zoho.com",
        smtp_port: 465,
        smtp_security: SmtpSecurity::Tls,
        imap_host: "imap.zoho.com",
        imap_port: 993,
    },
    Provider {
        name: "outlook",
        smtp_host: "smtp-mail.outlook.com",
        smtp_port: 587,
        smtp_security: SmtpSecurity::StartTls,
        imap_host: "outlook.office365.com",
        imap_port: 993,
    },
    Provider {
        name: "yahoo",
        smtp_host: "smtp.mail.yahoo.com",
        smtp_port: 587,
        smtp_security: SmtpSecurity::StartTls,
        imap_host: "imap.mail.yahoo.com",
        imap_port: 993,
    },
];

/// Look up a provider by name (case-insensitive)
///
/// # Errors
///
/// Returns `Config` for names not in the built-in table.
pub fn lookup(name: &str) -> AppResult<&'static Provider> {
    let wanted = name.trim().to_ascii_lowercase();
    PROVIDERS
        .iter()
        .find(|p| p.name == wanted)
        .ok_or_else(|| {
            let known: Vec<&str> = PROVIDERS.iter().map(|p| p.name).collect();
            AppError::config(format!(
                "unknown provider '{name}' (supported: {})",
                known.join(", ")
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::{SmtpSecurity, lookup};

    #[test]
    fn fastmail_uses_implicit_tls() {
        let p = lookup("FastMail").expect("provider");
        assert_eq!(p.smtp().port, 465);
        assert_eq!(p.smtp().security, SmtpSecurity::Tls);
        assert_eq!(p.imap().host, "imap.fastmail.com");
    }

    #[test]
    fn unknown_provider_is_a_config_error() {
        let err = lookup("aol").expect_err("must fail");
        assert_eq!(err.code(), "config");
        assert!(err.to_string().contains("gmail"));
    }

    #[test]
    fn starttls_flag_wins_over_implicit_tls() {
        assert_eq!(SmtpSecurity::from_flags(true, true), SmtpSecurity::StartTls);
        assert_eq!(SmtpSecurity::from_flags(false, true), SmtpSecurity::Tls);
        assert_eq!(SmtpSecurity::from_flags(false, false), SmtpSecurity::Plain);
    }

    #[test]
    fn security_mode_parses_aliases() {
        assert_eq!("SSL".parse::<SmtpSecurity>().unwrap(), SmtpSecurity::Tls);
        assert_eq!("starttls".parse::<SmtpSecurity>().unwrap(), SmtpSecurity::StartTls);
        assert!("maybe".parse::<SmtpSecurity>().is_err());
    }
}
