//! SMTP delivery
//!
//! One session per transmission: connect in the configured security mode,
//! authenticate with the account's primary credentials, then MAIL FROM, one
//! RCPT TO per envelope recipient and DATA. The configured mode is the only
//! mode tried. Nothing is retried or deduplicated; calling
//! [`MailTransport::transmit`] twice delivers twice.

use std::future::Future;
use std::time::Duration;

use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::response::Response;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::builder::BuiltMessage;
use crate::config::AccountConfig;
use crate::errors::{AppError, AppResult};
use crate::models::TransportResult;
use crate::providers::{SmtpSecurity, SmtpSettings};

/// Hands a built message to a mail server
pub trait MailTransport {
    /// Transmit once; failures are returned as a value, never retried
    fn transmit(&self, message: &BuiltMessage) -> impl Future<Output = TransportResult> + Send;
}

/// `lettre`-backed SMTP transport
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    settings: SmtpSettings,
    username: String,
    password: SecretString,
    /// Visible From, used only to explain alias rejections
    visible_from: String,
    timeout: Option<Duration>,
}

impl SmtpTransport {
    pub fn new(
        settings: SmtpSettings,
        username: impl Into<String>,
        password: SecretString,
        visible_from: impl Into<String>,
    ) -> Self {
        Self {
            settings,
            username: username.into(),
            password,
            visible_from: visible_from.into(),
            timeout: None,
        }
    }

    /// Transport for an account; authentication always uses the primary email
    pub fn for_account(account: &AccountConfig) -> Self {
        Self::new(
            account.smtp.clone(),
            account.email.clone(),
            account.pass.clone(),
            account.visible_from(),
        )
    }

    /// Override the library's default command timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn mailer(&self) -> AppResult<AsyncSmtpTransport<Tokio1Executor>> {
        let host = self.settings.host.as_str();
        if host.is_empty() {
            return Err(AppError::config("SMTP host is not configured"));
        }
        let tls = match self.settings.security {
            SmtpSecurity::StartTls => Tls::Required(tls_parameters(host)?),
            SmtpSecurity::Tls => Tls::Wrapper(tls_parameters(host)?),
            SmtpSecurity::Plain => Tls::None,
        };
        let credentials = Credentials::new(
            self.username.clone(),
            self.password.expose_secret().to_owned(),
        );
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(self.settings.port)
            .tls(tls)
            .credentials(credentials)
            .authentication(vec![Mechanism::Plain, Mechanism::Login]);
        if self.timeout.is_some() {
            builder = builder.timeout(self.timeout);
        }
        Ok(builder.build())
    }

    fn failed(&self, detail: String) -> TransportResult {
        let diagnostic = diagnose_send_error(&detail, &self.visible_from, &self.username);
        TransportResult::Failed {
            strategy: self.settings.security,
            detail,
            diagnostic,
        }
    }
}

impl MailTransport for SmtpTransport {
    async fn transmit(&self, message: &BuiltMessage) -> TransportResult {
        let strategy = self.settings.security;
        let envelope = match envelope_for(message) {
            Ok(envelope) => envelope,
            Err(e) => return self.failed(e.to_string()),
        };
        let mailer = match self.mailer() {
            Ok(mailer) => mailer,
            Err(e) => return self.failed(e.to_string()),
        };

        debug!(
            host = %self.settings.host,
            port = self.settings.port,
            security = %strategy,
            recipients = message.recipients.len(),
            "smtp session start"
        );
        match mailer.send_raw(&envelope, &message.bytes).await {
            Ok(response) => {
                let response = describe_response(&response);
                info!(message_id = %message.message_id, %response, "smtp accepted message");
                TransportResult::Delivered { strategy, response }
            }
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "smtp delivery failed");
                self.failed(e.to_string())
            }
        }
    }
}

fn tls_parameters(host: &str) -> AppResult<TlsParameters> {
    TlsParameters::new(host.to_owned())
        .map_err(|e| AppError::Transport(format!("TLS setup failed for {host}: {e}")))
}

fn envelope_for(message: &BuiltMessage) -> AppResult<Envelope> {
    let from = message
        .envelope_from
        .parse::<Address>()
        .map_err(|e| AppError::invalid(format!("invalid sender '{}': {e}", message.envelope_from)))?;
    let to = message
        .recipients
        .iter()
        .map(|r| {
            r.parse::<Address>()
                .map_err(|e| AppError::invalid(format!("invalid recipient '{r}': {e}")))
        })
        .collect::<AppResult<Vec<_>>>()?;
    Envelope::new(Some(from), to).map_err(|e| AppError::invalid(format!("invalid envelope: {e}")))
}

fn describe_response(response: &Response) -> String {
    let text = response.message().collect::<Vec<_>>().join(" ");
    format!("{} {}", response.code(), text).trim().to_owned()
}

/// Explain alias-related rejections
///
/// Authentication failures while sending as an address other than the
/// authenticated account, and explicit sender refusals, get a diagnostic that
/// names the visible From address. The raw error text is kept separately by
/// the caller.
pub fn diagnose_send_error(detail: &str, visible_from: &str, account_email: &str) -> Option<String> {
    let auth = Regex::new(r"(?i)authentication failed|invalid credentials|\b535\b").ok()?;
    let sender = Regex::new(r"(?i)from address|sender|not allowed").ok()?;
    let alias = !visible_from.eq_ignore_ascii_case(account_email);

    if alias && auth.is_match(detail) {
        return Some(format!(
            "authentication failed while sending as {visible_from}; the server may not allow \
             {account_email} to send from this alias. Check that {visible_from} is a verified \
             alias of the account, or remove the From override"
        ));
    }
    if sender.is_match(detail) {
        return Some(format!(
            "the server refused {visible_from} as sender; it must be an address that \
             {account_email} is authorized to send from"
        ));
    }
    None
}

impl TransportResult {
    /// Convert a failure into an error carrying the diagnostic
    ///
    /// # Errors
    ///
    /// `AuthFailed` when a diagnostic was produced, `Transport` otherwise.
    pub fn into_result(self) -> AppResult<String> {
        match self {
            Self::Delivered { response, .. } => Ok(response),
            Self::Failed {
                strategy,
                detail,
                diagnostic: Some(diagnostic),
            } => Err(AppError::AuthFailed(format!(
                "{diagnostic} (smtp {strategy}: {detail})"
            ))),
            Self::Failed {
                strategy,
                detail,
                diagnostic: None,
            } => Err(AppError::Transport(format!("smtp {strategy}: {detail}"))),
        }
    }
}
