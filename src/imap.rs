//! IMAP transport and session operations
//!
//! Provides timeout-bounded wrappers around `async-imap` operations. All network
//! calls are enforced to use TLS, and timeouts are derived from configuration.
//! The [`MailStore`] trait is the seam the verifier and draft manager work
//! against; [`ImapStore`] is the network implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use chrono::NaiveDate;
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{AccountConfig, AppConfig};
use crate::errors::{AppError, AppResult};

/// Type alias for authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// State reported by SELECT
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub exists: u32,
}

/// A fetched message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub raw: Vec<u8>,
}

/// Structured UID SEARCH criteria, combined with AND
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    pub subject: Option<String>,
    /// Matches any of these senders
    pub from_any: Vec<String>,
    /// Exact `Message-ID` header match
    pub message_id: Option<String>,
    pub since: Option<NaiveDate>,
    /// Only messages flagged `\Draft`
    pub draft_only: bool,
}

/// Non-synchronizing literal support advertised by the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LiteralSupport {
    #[default]
    None,
    /// `LITERAL-`: non-synchronizing literals up to 4096 octets
    Minus,
    /// `LITERAL+`: non-synchronizing literals of any size
    Plus,
}

impl LiteralSupport {
    fn allows(self, len: usize) -> bool {
        match self {
            Self::None => false,
            Self::Minus => len <= 4096,
            Self::Plus => true,
        }
    }
}

impl SearchCriteria {
    /// Render as an IMAP search program
    ///
    /// Non-ASCII values go out as `{n+}` literals under `CHARSET UTF-8`.
    /// When the server cannot take a literal inline, that key is left out and
    /// the search is broader than asked; callers re-check what they match.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a value contains control characters.
    pub fn to_imap_query(&self, literals: LiteralSupport) -> AppResult<String> {
        let mut parts = Vec::new();
        let mut needs_utf8 = false;
        let mut string = |value: &str| -> AppResult<Option<String>> {
            let rendered = search_string(value, literals)?;
            needs_utf8 |= rendered.is_some() && !value.is_ascii();
            Ok(rendered)
        };

        if let Some(subject) = &self.subject {
            match string(subject)? {
                Some(value) => parts.push(format!("SUBJECT {value}")),
                None => debug!("non-ASCII subject left out of SEARCH"),
            }
        }
        if let Some(id) = &self.message_id {
            if let Some(value) = string(id)? {
                parts.push(format!("HEADER Message-ID {value}"));
            }
        }
        if let Some(since) = self.since {
            parts.push(format!("SINCE {}", imap_date(since)));
        }
        if self.draft_only {
            parts.push("DRAFT".to_owned());
        }
        if !self.from_any.is_empty() {
            let mut senders = Vec::with_capacity(self.from_any.len());
            for sender in &self.from_any {
                if let Some(value) = string(sender)? {
                    senders.push(format!("FROM {value}"));
                }
            }
            // a dropped alternative would narrow the OR chain
            if senders.len() == self.from_any.len() {
                parts.push(or_chain(&senders));
            } else {
                debug!("non-ASCII sender left out of SEARCH");
            }
        }

        let program = if parts.is_empty() {
            "ALL".to_owned()
        } else {
            parts.join(" ")
        };
        Ok(if needs_utf8 {
            format!("CHARSET UTF-8 {program}")
        } else {
            program
        })
    }
}

/// Quoted string for ASCII, literal for anything else, `None` when neither fits
fn search_string(value: &str, literals: LiteralSupport) -> AppResult<Option<String>> {
    let escaped = escape_imap_quoted(value)?;
    if value.is_ascii() {
        return Ok(Some(format!("\"{escaped}\"")));
    }
    if literals.allows(value.len()) {
        return Ok(Some(format!("{{{}+}}\r\n{value}", value.len())));
    }
    Ok(None)
}

/// `OR a OR b c` for any number of keys
fn or_chain(keys: &[String]) -> String {
    match keys {
        [] => String::new(),
        [only] => only.clone(),
        [first, rest @ ..] => format!("OR {first} {}", or_chain(rest)),
    }
}

/// Session-level operations on a remote mailbox store
///
/// Folder names are passed and returned in decoded (UTF-8) form.
pub trait MailStore: Send {
    fn list_folders(&mut self) -> impl Future<Output = AppResult<Vec<String>>> + Send;

    fn select(&mut self, folder: &str) -> impl Future<Output = AppResult<MailboxStatus>> + Send;

    fn create(&mut self, folder: &str) -> impl Future<Output = AppResult<()>> + Send;

    /// APPEND with a parenthesized flag list such as `(\Seen)`
    fn append(
        &mut self,
        folder: &str,
        flags: &str,
        content: &[u8],
    ) -> impl Future<Output = AppResult<()>> + Send;

    /// UID SEARCH in the selected folder, newest first
    fn search(
        &mut self,
        criteria: &SearchCriteria,
    ) -> impl Future<Output = AppResult<Vec<u32>>> + Send;

    /// UID FETCH of full messages without setting `\Seen`
    fn fetch(&mut self, uids: &[u32]) -> impl Future<Output = AppResult<Vec<FetchedMessage>>> + Send;

    fn mark_deleted(&mut self, uid: u32) -> impl Future<Output = AppResult<()>> + Send;

    fn expunge(&mut self) -> impl Future<Output = AppResult<()>> + Send;

    fn logout(self) -> impl Future<Output = AppResult<()>> + Send
    where
        Self: Sized;
}

/// Opens authenticated sessions
///
/// Each call yields an independent session; nothing is pooled.
pub trait StoreConnector: Send + Sync {
    type Store: MailStore;

    fn connect(&self) -> impl Future<Output = AppResult<Self::Store>> + Send;
}

/// Connection parameters for one account
#[derive(Debug, Clone)]
pub struct ImapConnector {
    host: String,
    port: u16,
    user: String,
    pass: SecretString,
    connect_timeout: Duration,
    greeting_timeout: Duration,
    socket_timeout: Duration,
}

impl ImapConnector {
    pub fn new(config: &AppConfig, account: &AccountConfig) -> Self {
        Self {
            host: account.imap.host.clone(),
            port: account.imap.port,
            user: account.email.clone(),
            pass: account.pass.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            greeting_timeout: Duration::from_millis(config.greeting_timeout_ms),
            socket_timeout: Duration::from_millis(config.socket_timeout_ms),
        }
    }
}

impl StoreConnector for ImapConnector {
    type Store = ImapStore;

    async fn connect(&self) -> AppResult<ImapStore> {
        let mut session = connect_authenticated(self).await?;
        let literals = literal_support(&mut session, self.socket_timeout).await;
        Ok(ImapStore {
            session,
            socket_timeout: self.socket_timeout,
            literals,
        })
    }
}

/// Authenticated IMAP session
pub struct ImapStore {
    session: ImapSession,
    socket_timeout: Duration,
    literals: LiteralSupport,
}

/// Ask for CAPABILITY; a failure only costs non-ASCII search keys
async fn literal_support(session: &mut ImapSession, socket_timeout: Duration) -> LiteralSupport {
    match timeout(socket_timeout, session.capabilities()).await {
        Ok(Ok(caps)) if caps.has_str("LITERAL+") => LiteralSupport::Plus,
        Ok(Ok(caps)) if caps.has_str("LITERAL-") => LiteralSupport::Minus,
        Ok(Ok(_)) => LiteralSupport::None,
        Ok(Err(e)) => {
            debug!(error = %e, "CAPABILITY failed");
            LiteralSupport::None
        }
        Err(_) => {
            debug!("CAPABILITY timed out");
            LiteralSupport::None
        }
    }
}

/// Connect to IMAP server and authenticate
///
/// Performs full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake with bundled root certificates
/// 3. Read IMAP greeting
/// 4. LOGIN authentication
///
/// # Errors
///
/// - `InvalidInput` if hostname is invalid for TLS SNI
/// - `Timeout` if any connection phase times out
/// - `AuthFailed` if authentication fails
/// - `Internal` for TCP, TLS, or greeting failures
async fn connect_authenticated(conn: &ImapConnector) -> AppResult<ImapSession> {
    if conn.host.is_empty() {
        return Err(AppError::config("IMAP host is not configured"));
    }

    let tcp = timeout(
        conn.connect_timeout,
        TcpStream::connect((conn.host.as_str(), conn.port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Internal(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(conn.host.clone())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(conn.greeting_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(conn.greeting_timeout, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Internal(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let pass = conn.pass.expose_secret();
    let session = timeout(conn.greeting_timeout, client.login(conn.user.as_str(), pass))
        .await
        .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| {
                let msg = e.to_string();
                if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                    AppError::AuthFailed(msg)
                } else {
                    AppError::Internal(msg)
                }
            })
        })?;

    debug!(host = %conn.host, user = %conn.user, "imap session authenticated");
    Ok(session)
}

impl MailStore for ImapStore {
    async fn list_folders(&mut self) -> AppResult<Vec<String>> {
        let stream = timeout(self.socket_timeout, self.session.list(None, Some("*")))
            .await
            .map_err(|_| AppError::Timeout("LIST timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("LIST failed: {e}"))))?;

        let names: Vec<async_imap::types::Name> =
            timeout(self.socket_timeout, stream.try_collect())
                .await
                .map_err(|_| AppError::Timeout("LIST stream timed out".to_owned()))
                .and_then(|r| {
                    r.map_err(|e| AppError::Internal(format!("LIST stream failed: {e}")))
                })?;
        Ok(names
            .iter()
            .map(|n| decode_folder(n.name()))
            .collect())
    }

    async fn select(&mut self, folder: &str) -> AppResult<MailboxStatus> {
        validate_folder(folder)?;
        let selected = timeout(self.socket_timeout, self.session.select(encode_folder(folder)))
            .await
            .map_err(|_| AppError::Timeout(format!("SELECT timed out for folder '{folder}'")))
            .and_then(|r| {
                r.map_err(|e| AppError::NotFound(format!("cannot select folder '{folder}': {e}")))
            })?;
        Ok(MailboxStatus {
            exists: selected.exists,
        })
    }

    async fn create(&mut self, folder: &str) -> AppResult<()> {
        validate_folder(folder)?;
        timeout(self.socket_timeout, self.session.create(encode_folder(folder)))
            .await
            .map_err(|_| AppError::Timeout("CREATE timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::Internal(format!("CREATE '{folder}' failed: {e}")))
            })
    }

    async fn append(&mut self, folder: &str, flags: &str, content: &[u8]) -> AppResult<()> {
        validate_folder(folder)?;
        timeout(
            self.socket_timeout,
            self.session
                .append(encode_folder(folder), Some(flags), None, content),
        )
        .await
        .map_err(|_| AppError::Timeout("APPEND timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("APPEND to '{folder}' failed: {e}"))))
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> AppResult<Vec<u32>> {
        let query = criteria.to_imap_query(self.literals)?;
        let set = timeout(self.socket_timeout, self.session.uid_search(&query))
            .await
            .map_err(|_| AppError::Timeout("UID SEARCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("uid search failed: {e}"))))?;
        let mut uids: Vec<u32> = set.into_iter().collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(uids)
    }

    async fn fetch(&mut self, uids: &[u32]) -> AppResult<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let stream = timeout(
            self.socket_timeout,
            self.session.uid_fetch(set, "(UID FLAGS BODY.PEEK[])"),
        )
        .await
        .map_err(|_| AppError::Timeout("UID FETCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("uid fetch failed: {e}"))))?;
        let fetches: Vec<Fetch> = timeout(self.socket_timeout, stream.try_collect())
            .await
            .map_err(|_| AppError::Timeout("UID FETCH stream timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::Internal(format!("uid fetch stream failed: {e}")))
            })?;

        Ok(fetches
            .iter()
            .filter_map(|fetch| {
                Some(FetchedMessage {
                    uid: fetch.uid?,
                    flags: flags_to_strings(fetch),
                    raw: fetch.body()?.to_vec(),
                })
            })
            .collect())
    }

    async fn mark_deleted(&mut self, uid: u32) -> AppResult<()> {
        let stream = timeout(
            self.socket_timeout,
            self.session
                .uid_store(uid.to_string(), "+FLAGS.SILENT (\\Deleted)"),
        )
        .await
        .map_err(|_| AppError::Timeout("UID STORE timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("uid store failed: {e}"))))?;
        let _: Vec<Fetch> = timeout(self.socket_timeout, stream.try_collect())
            .await
            .map_err(|_| AppError::Timeout("UID STORE stream timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::Internal(format!("uid store stream failed: {e}")))
            })?;
        Ok(())
    }

    async fn expunge(&mut self) -> AppResult<()> {
        let stream = timeout(self.socket_timeout, self.session.expunge())
            .await
            .map_err(|_| AppError::Timeout("EXPUNGE timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("EXPUNGE failed: {e}"))))?;
        let _: Vec<u32> = timeout(self.socket_timeout, stream.try_collect())
            .await
            .map_err(|_| AppError::Timeout("EXPUNGE stream timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::Internal(format!("EXPUNGE stream failed: {e}")))
            })?;
        Ok(())
    }

    async fn logout(mut self) -> AppResult<()> {
        timeout(self.socket_timeout, self.session.logout())
            .await
            .map_err(|_| AppError::Timeout("LOGOUT timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("LOGOUT failed: {e}"))))
    }
}

/// Render IMAP flags in their protocol form (`\Seen`, `\Draft`, keywords)
pub fn flags_to_strings(fetch: &Fetch) -> Vec<String> {
    fetch
        .flags()
        .map(|flag| match flag {
            Flag::Seen => "\\Seen".to_owned(),
            Flag::Answered => "\\Answered".to_owned(),
            Flag::Flagged => "\\Flagged".to_owned(),
            Flag::Deleted => "\\Deleted".to_owned(),
            Flag::Draft => "\\Draft".to_owned(),
            Flag::Recent => "\\Recent".to_owned(),
            Flag::Custom(keyword) => keyword.to_string(),
            other => format!("{other:?}"),
        })
        .collect()
}

/// Modified UTF-7 folder name to UTF-8
pub fn decode_folder(raw: &str) -> String {
    utf7_imap::decode_utf7_imap(raw.to_owned())
}

/// UTF-8 folder name to modified UTF-7
pub fn encode_folder(name: &str) -> String {
    utf7_imap::encode_utf7_imap(name.to_owned())
}

/// Reject empty, oversized, or control-character folder names
pub fn validate_folder(folder: &str) -> AppResult<()> {
    if folder.is_empty() || folder.len() > 256 {
        return Err(AppError::InvalidInput(
            "folder must be 1..256 characters".to_owned(),
        ));
    }
    if folder.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::InvalidInput(
            "folder must not contain control characters".to_owned(),
        ));
    }
    Ok(())
}

/// Escape a value for an IMAP quoted string
fn escape_imap_quoted(input: &str) -> AppResult<String> {
    if input.chars().any(|ch| ch.is_control()) {
        return Err(AppError::InvalidInput(
            "search text must not contain control characters".to_owned(),
        ));
    }
    Ok(input.replace('\\', "\\\\").replace('"', "\\\""))
}

/// IMAP date format, e.g. `1-Jan-2025`
fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{LiteralSupport, SearchCriteria, decode_folder, encode_folder, validate_folder};

    #[test]
    fn empty_criteria_search_everything() {
        assert_eq!(
            SearchCriteria::default().to_imap_query(LiteralSupport::None).unwrap(),
            "ALL"
        );
    }

    #[test]
    fn criteria_combine_subject_date_and_sender_alternatives() {
        let criteria = SearchCriteria {
            subject: Some("Re: \"plan\"".into()),
            from_any: vec!["mailer-daemon".into(), "postmaster".into(), "Mail Delivery System".into()],
            since: NaiveDate::from_ymd_opt(2025, 1, 5),
            ..SearchCriteria::default()
        };
        assert_eq!(
            criteria.to_imap_query(LiteralSupport::None).unwrap(),
            "SUBJECT \"Re: \\\"plan\\\"\" SINCE 5-Jan-2025 \
             OR FROM \"mailer-daemon\" OR FROM \"postmaster\" FROM \"Mail Delivery System\""
        );
    }

    #[test]
    fn utf8_subjects_are_sent_as_literals() {
        let criteria = SearchCriteria {
            subject: Some("Grüße".into()),
            message_id: Some("<a@b>".into()),
            ..SearchCriteria::default()
        };
        assert_eq!(
            criteria.to_imap_query(LiteralSupport::Plus).unwrap(),
            "CHARSET UTF-8 SUBJECT {7+}\r\nGrüße HEADER Message-ID \"<a@b>\""
        );
        assert_eq!(
            criteria.to_imap_query(LiteralSupport::Minus).unwrap(),
            "CHARSET UTF-8 SUBJECT {7+}\r\nGrüße HEADER Message-ID \"<a@b>\""
        );
    }

    #[test]
    fn utf8_keys_are_dropped_without_literal_support() {
        let criteria = SearchCriteria {
            subject: Some("Grüße".into()),
            from_any: vec!["mailer-daemon".into(), "Zoë".into()],
            draft_only: true,
            ..SearchCriteria::default()
        };
        assert_eq!(criteria.to_imap_query(LiteralSupport::None).unwrap(), "DRAFT");
    }

    #[test]
    fn control_characters_are_rejected() {
        let criteria = SearchCriteria {
            subject: Some("a\r\nb".into()),
            ..SearchCriteria::default()
        };
        assert!(criteria.to_imap_query(LiteralSupport::Plus).is_err());
        assert!(validate_folder("Drafts\n").is_err());
        assert!(validate_folder("").is_err());
    }

    #[test]
    fn folder_names_round_trip_through_modified_utf7() {
        assert_eq!(encode_folder("Entwürfe"), "Entw&APw-rfe");
        assert_eq!(decode_folder("Entw&APw-rfe"), "Entwürfe");
        assert_eq!(encode_folder("[Gmail]/Drafts"), "[Gmail]/Drafts");
    }
}
