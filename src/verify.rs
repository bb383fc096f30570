//! Post-send persistence and verification
//!
//! After a successful transmission the message is archived locally, mirrored
//! into the remote Sent folder, then (optionally) looked up again and checked
//! against recent bounces. Every step is best effort: failures land in the
//! [`DeliveryReport`] and the log, never in the command's error path.

use std::time::Duration;

use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::address;
use crate::builder::{BuiltMessage, ensure_crlf};
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::folders::{self, Discovery, FolderRole};
use crate::imap::{FetchedMessage, MailStore, SearchCriteria, StoreConnector};
use crate::local_store::LocalStore;
use crate::mime::{self, ParsedMessage};
use crate::models::{DeliveryReport, RemoteSentOutcome, TransportResult, Verification};

/// How far back a Sent copy may be dated and still count as this send
const SENT_WINDOW_SECS: i64 = 5 * 60;
const BOUNCE_WINDOW_SECS: i64 = 10 * 60;
/// Newest matching Sent messages inspected
const SENT_CANDIDATES: usize = 5;

const BOUNCE_SENDERS: &[&str] = &[
    "mailer-daemon",
    "postmaster",
    "Mail Delivery System",
    "Mail Delivery Subsystem",
];

const BOUNCE_SUBJECTS: &[&str] = &[
    "undelivered mail returned to sender",
    "delivery status notification",
    "mail delivery failed",
    "returned mail",
    "message not delivered",
    "delivery failure",
    "undeliverable:",
    "failed:",
];

/// Decides whether an inbox message is a bounce for a given send
pub trait BounceDetector: Send + Sync {
    /// `Some(failed_recipients)` when `candidate` bounces `sent`; the list may
    /// be empty when the bounce does not name anyone
    fn detect(&self, candidate: &ParsedMessage, sent: &BuiltMessage) -> Option<Vec<String>>;
}

/// Sender, subject and body keyword matching
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicBounceDetector;

impl BounceDetector for HeuristicBounceDetector {
    fn detect(&self, candidate: &ParsedMessage, sent: &BuiltMessage) -> Option<Vec<String>> {
        let from = candidate.from.as_deref()?.to_lowercase();
        if !BOUNCE_SENDERS.iter().any(|s| from.contains(&s.to_lowercase())) {
            return None;
        }
        let subject = candidate.subject.as_deref()?.to_lowercase();
        if !BOUNCE_SUBJECTS.iter().any(|s| subject.contains(s)) {
            return None;
        }

        let text = bounce_text(candidate).to_lowercase();
        let failed: Vec<String> = sent
            .recipients
            .iter()
            .filter(|r| text.contains(&r.to_lowercase()))
            .cloned()
            .collect();
        let mentions_subject = !sent.subject.trim().is_empty()
            && text.contains(&sent.subject.trim().to_lowercase());
        if failed.is_empty() && !mentions_subject {
            return None;
        }
        Some(failed)
    }
}

/// Body plus any textual or embedded-message parts
fn bounce_text(message: &ParsedMessage) -> String {
    let mut text = message.display_body().unwrap_or_default();
    for part in &message.attachments {
        let ct = part.content_type.to_ascii_lowercase();
        if ct.starts_with("text/") || ct.starts_with("message/") {
            text.push('\n');
            text.push_str(&String::from_utf8_lossy(&part.data));
        }
    }
    text
}

/// Verification switches and settle delays
#[derive(Debug, Clone, Copy)]
pub struct VerifierSettings {
    pub enabled: bool,
    /// Wait before searching the Sent folder
    pub sent_settle: Duration,
    /// Wait before scanning the inbox for bounces
    pub bounce_settle: Duration,
}

impl VerifierSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            enabled: config.verify_delivery,
            sent_settle: config.sent_settle(),
            bounce_settle: config.bounce_settle(),
        }
    }
}

pub struct DeliveryVerifier<C, D = HeuristicBounceDetector> {
    connector: C,
    local: LocalStore,
    detector: D,
    settings: VerifierSettings,
}

impl<C: StoreConnector> DeliveryVerifier<C> {
    pub fn new(connector: C, local: LocalStore, settings: VerifierSettings) -> Self {
        Self {
            connector,
            local,
            detector: HeuristicBounceDetector,
            settings,
        }
    }
}

impl<C: StoreConnector, D: BounceDetector> DeliveryVerifier<C, D> {
    /// Replace the bounce predicate
    pub fn with_detector<D2: BounceDetector>(self, detector: D2) -> DeliveryVerifier<C, D2> {
        DeliveryVerifier {
            connector: self.connector,
            local: self.local,
            detector,
            settings: self.settings,
        }
    }

    /// Persist and verify a delivered message
    ///
    /// Each step runs regardless of whether the previous one succeeded.
    pub async fn record(&self, message: &BuiltMessage, transport: TransportResult) -> DeliveryReport {
        let local_archive = self.local.archive_sent(message).map_err(|e| {
            warn!(error = %e, "local Sent archive failed");
            e.to_string()
        });

        let remote_sent = match self.append_sent(message).await {
            Ok(Some(folder)) => {
                info!(folder = %folder, message_id = %message.message_id, "copied to remote Sent");
                RemoteSentOutcome::Appended { folder }
            }
            Ok(None) => {
                warn!("no remote Sent folder found");
                RemoteSentOutcome::NoFolder
            }
            Err(e) => {
                warn!(error = %e, "remote Sent copy failed");
                RemoteSentOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        let verification = if !self.settings.enabled {
            Verification::Skipped {
                reason: "verification disabled".to_owned(),
            }
        } else if !transport.is_delivered() {
            Verification::Skipped {
                reason: "message was not delivered".to_owned(),
            }
        } else {
            let known = match &remote_sent {
                RemoteSentOutcome::Appended { folder } => Some(folder.as_str()),
                _ => None,
            };
            self.verify(message, known).await.unwrap_or_else(|e| {
                warn!(error = %e, "delivery verification failed");
                Verification::Skipped {
                    reason: format!("verification failed: {e}"),
                }
            })
        };

        DeliveryReport {
            message_id: message.message_id.clone(),
            transport,
            local_archive,
            remote_sent,
            verification,
        }
    }

    async fn append_sent(&self, message: &BuiltMessage) -> AppResult<Option<String>> {
        let mut store = self.connector.connect().await?;
        let folder = folders::resolve(&mut store, FolderRole::Sent, Discovery::Existing).await?;
        let appended = match &folder {
            Some(name) => store.append(name, "(\\Seen)", &ensure_crlf(&message.bytes)).await,
            None => Ok(()),
        };
        if let Err(e) = store.logout().await {
            debug!(error = %e, "logout after Sent append failed");
        }
        appended.map(|()| folder)
    }

    async fn verify(&self, message: &BuiltMessage, known: Option<&str>) -> AppResult<Verification> {
        settle(self.settings.sent_settle).await;

        let mut store = self.connector.connect().await?;
        let outcome = self.verify_in_session(&mut store, message, known).await;
        if let Err(e) = store.logout().await {
            debug!(error = %e, "logout after verification failed");
        }
        outcome
    }

    async fn verify_in_session(
        &self,
        store: &mut C::Store,
        message: &BuiltMessage,
        known: Option<&str>,
    ) -> AppResult<Verification> {
        let folder = match known {
            Some(folder) => folder.to_owned(),
            None => match folders::resolve(store, FolderRole::Sent, Discovery::Existing).await? {
                Some(folder) => folder,
                None => {
                    return Ok(Verification::Skipped {
                        reason: "no Sent folder to search".to_owned(),
                    });
                }
            },
        };

        store.select(&folder).await?;
        let criteria = SearchCriteria {
            subject: Some(message.subject.clone()),
            since: Some(search_since(Local::now())),
            ..SearchCriteria::default()
        };
        let candidates = newest(store, &criteria, SENT_CANDIDATES).await?;
        let found = candidates.iter().any(|fetched| {
            mime::parse_message(&fetched.raw)
                .is_ok_and(|parsed| is_sent_copy(&parsed, message, Utc::now().timestamp()))
        });
        if !found {
            debug!(folder = %folder, "sent copy not found");
            return Ok(Verification::NotFound);
        }
        debug!(folder = %folder, "sent copy found");

        settle(self.settings.bounce_settle).await;
        match self.find_bounce(store, message).await {
            Ok(Some(bounced)) => Ok(bounced),
            Ok(None) => Ok(Verification::Confirmed { folder }),
            Err(e) => {
                warn!(error = %e, "bounce check failed");
                Ok(Verification::Confirmed { folder })
            }
        }
    }

    async fn find_bounce(
        &self,
        store: &mut C::Store,
        message: &BuiltMessage,
    ) -> AppResult<Option<Verification>> {
        store.select("INBOX").await?;
        let since = Local::now() - chrono::Duration::seconds(BOUNCE_WINDOW_SECS);
        let criteria = SearchCriteria {
            from_any: BOUNCE_SENDERS.iter().map(|s| (*s).to_owned()).collect(),
            since: Some(search_since(since)),
            ..SearchCriteria::default()
        };
        let now = Utc::now().timestamp();
        for fetched in newest(store, &criteria, usize::MAX).await? {
            let Ok(parsed) = mime::parse_message(&fetched.raw) else {
                continue;
            };
            if !within(parsed.date.as_deref(), now, BOUNCE_WINDOW_SECS) {
                continue;
            }
            if let Some(failed_recipients) = self.detector.detect(&parsed, message) {
                warn!(uid = fetched.uid, recipients = ?failed_recipients, "bounce detected");
                return Ok(Some(Verification::Bounced {
                    subject: parsed.subject.unwrap_or_default(),
                    failed_recipients,
                }));
            }
        }
        Ok(None)
    }
}

/// `SINCE` date for a window starting at `start`
///
/// SINCE compares against the server's internal date in the server's own
/// timezone, so one extra day covers any offset; the message date check
/// narrows the result afterwards.
fn search_since(start: DateTime<Local>) -> NaiveDate {
    let day = start.date_naive();
    day.checked_sub_days(Days::new(1)).unwrap_or(day)
}

async fn settle(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Search, then fetch the `limit` highest UIDs
async fn newest<S: MailStore>(
    store: &mut S,
    criteria: &SearchCriteria,
    limit: usize,
) -> AppResult<Vec<FetchedMessage>> {
    let mut uids = store.search(criteria).await?;
    if uids.is_empty() {
        return Ok(Vec::new());
    }
    uids.sort_unstable_by(|a, b| b.cmp(a));
    uids.truncate(limit);
    let mut fetched = store.fetch(&uids).await?;
    fetched.sort_unstable_by(|a, b| b.uid.cmp(&a.uid));
    Ok(fetched)
}

/// Same subject, recent, and addressed to at least one of our recipients
fn is_sent_copy(parsed: &ParsedMessage, message: &BuiltMessage, now: i64) -> bool {
    let same_subject = parsed
        .subject
        .as_deref()
        .is_some_and(|s| s.trim().eq_ignore_ascii_case(message.subject.trim()));
    if !same_subject || !within(parsed.date.as_deref(), now, SENT_WINDOW_SECS) {
        return false;
    }
    let addressed: Vec<String> = parsed
        .to_list
        .iter()
        .chain(&parsed.cc_list)
        .map(|a| address::bare_address(a).to_lowercase())
        .collect();
    message
        .recipients
        .iter()
        .any(|r| addressed.contains(&r.to_lowercase()))
}

/// Missing or unparseable dates are given the benefit of the doubt
fn within(date: Option<&str>, now: i64, window_secs: i64) -> bool {
    match date.map(mailparse::dateparse) {
        Some(Ok(ts)) => now - ts <= window_secs,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{Days, Local, TimeZone};

    use super::{
        BounceDetector, DeliveryVerifier, HeuristicBounceDetector, VerifierSettings, search_since,
        within,
    };
    use crate::builder::{self, BuildMode, BuiltMessage, Decorations, Sender};
    use crate::local_store::LocalStore;
    use crate::mime;
    use crate::models::{MessageIntent, RemoteSentOutcome, TransportResult, Verification, Warnings};
    use crate::providers::SmtpSecurity;
    use crate::test_support::FakeServer;

    fn settings(enabled: bool) -> VerifierSettings {
        VerifierSettings {
            enabled,
            sent_settle: Duration::ZERO,
            bounce_settle: Duration::ZERO,
        }
    }

    fn sent_message() -> BuiltMessage {
        let intent = MessageIntent {
            to: vec!["a@x.com".into()],
            subject: "Quarterly plan".into(),
            plain_body: "See attached.".into(),
            ..MessageIntent::default()
        };
        let sender = Sender {
            address: "me@example.com".into(),
            ..Sender::default()
        };
        builder::build(&intent, &sender, &Decorations::default(), BuildMode::Send)
            .expect("build")
    }

    fn delivered() -> TransportResult {
        TransportResult::Delivered {
            strategy: SmtpSecurity::StartTls,
            response: "250 OK".into(),
        }
    }

    fn bounce_for(recipient: &str, subject: &str) -> Vec<u8> {
        format!(
            "From: Mail Delivery System <MAILER-DAEMON@mx.example.com>\r\n\
             To: me@example.com\r\n\
             Subject: Undelivered Mail Returned to Sender\r\n\
             Date: {}\r\n\
             \r\n\
             Delivery to {recipient} failed.\r\n\
             Original subject: {subject}\r\n",
            Local::now().to_rfc2822()
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn delivered_message_is_archived_appended_and_confirmed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = FakeServer::with_folders(&["INBOX", "Sent Items"]);
        let verifier =
            DeliveryVerifier::new(server.clone(), LocalStore::new(dir.path()), settings(true));
        let message = sent_message();

        let report = verifier.record(&message, delivered()).await;

        let archived = report.local_archive.as_ref().expect("archived");
        assert_eq!(std::fs::read(archived).expect("read"), message.bytes);
        assert_eq!(
            report.remote_sent,
            RemoteSentOutcome::Appended {
                folder: "Sent Items".into()
            }
        );
        let stored = server.messages("Sent Items");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].flags, vec!["\\Seen"]);
        assert_eq!(
            report.verification,
            Verification::Confirmed {
                folder: "Sent Items".into()
            }
        );
        assert!(report.warnings().is_empty());
    }

    #[tokio::test]
    async fn sent_copy_dated_yesterday_by_the_server_is_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = FakeServer::with_folders(&["INBOX", "Sent"]);
        let yesterday = Local::now()
            .date_naive()
            .checked_sub_days(Days::new(1))
            .expect("date");
        server.state().append_date = Some(yesterday);
        let verifier =
            DeliveryVerifier::new(server.clone(), LocalStore::new(dir.path()), settings(true));

        let report = verifier.record(&sent_message(), delivered()).await;

        assert_eq!(
            report.verification,
            Verification::Confirmed {
                folder: "Sent".into()
            }
        );
    }

    #[test]
    fn search_window_starts_a_day_early() {
        let just_after_midnight = Local
            .with_ymd_and_hms(2025, 3, 10, 0, 5, 0)
            .earliest()
            .expect("local time");
        assert_eq!(
            search_since(just_after_midnight),
            chrono::NaiveDate::from_ymd_opt(2025, 3, 9).expect("date")
        );
    }

    #[tokio::test]
    async fn bounce_in_inbox_is_reported_with_failed_recipient() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = FakeServer::with_folders(&["INBOX", "Sent"]);
        server.seed("INBOX", 40, &[], &bounce_for("a@x.com", "Quarterly plan"));
        let verifier =
            DeliveryVerifier::new(server.clone(), LocalStore::new(dir.path()), settings(true));

        let report = verifier.record(&sent_message(), delivered()).await;

        match &report.verification {
            Verification::Bounced {
                failed_recipients, ..
            } => assert_eq!(failed_recipients, &vec!["a@x.com".to_owned()]),
            other => panic!("expected bounce, got {other:?}"),
        }
        assert_eq!(report.warnings(), vec!["bounce detected for a@x.com"]);
    }

    #[tokio::test]
    async fn persistence_failures_are_reported_not_raised() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = FakeServer::with_folders(&["INBOX", "Sent"]);
        server.state().fail_append = true;
        let verifier =
            DeliveryVerifier::new(server.clone(), LocalStore::new(dir.path()), settings(false));

        let report = verifier.record(&sent_message(), delivered()).await;

        assert!(report.local_archive.is_ok());
        assert!(matches!(report.remote_sent, RemoteSentOutcome::Failed { .. }));
        assert!(matches!(report.verification, Verification::Skipped { .. }));
        assert_eq!(report.warnings().len(), 1);
    }

    #[tokio::test]
    async fn missing_sent_folder_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = FakeServer::with_folders(&["INBOX"]);
        let verifier =
            DeliveryVerifier::new(server.clone(), LocalStore::new(dir.path()), settings(true));

        let report = verifier.record(&sent_message(), delivered()).await;

        assert_eq!(report.remote_sent, RemoteSentOutcome::NoFolder);
        assert!(matches!(report.verification, Verification::Skipped { .. }));
        assert_eq!(server.state().folders.len(), 1);
    }

    struct NeverBounces;

    impl BounceDetector for NeverBounces {
        fn detect(&self, _: &mime::ParsedMessage, _: &BuiltMessage) -> Option<Vec<String>> {
            None
        }
    }

    #[tokio::test]
    async fn bounce_predicate_is_replaceable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = FakeServer::with_folders(&["INBOX", "Sent"]);
        server.seed("INBOX", 40, &[], &bounce_for("a@x.com", "Quarterly plan"));
        let verifier = DeliveryVerifier::new(server, LocalStore::new(dir.path()), settings(true))
            .with_detector(NeverBounces);

        let report = verifier.record(&sent_message(), delivered()).await;

        assert_eq!(
            report.verification,
            Verification::Confirmed {
                folder: "Sent".into()
            }
        );
    }

    #[test]
    fn detector_requires_bounce_sender_subject_and_reference() {
        let sent = sent_message();
        let detector = HeuristicBounceDetector;

        let bounce = mime::parse_message(&bounce_for("a@x.com", "Other")).expect("parse");
        assert_eq!(detector.detect(&bounce, &sent), Some(vec!["a@x.com".to_owned()]));

        let by_subject =
            mime::parse_message(&bounce_for("someone@else.com", "Quarterly plan")).expect("parse");
        assert_eq!(detector.detect(&by_subject, &sent), Some(Vec::new()));

        let unrelated =
            mime::parse_message(&bounce_for("someone@else.com", "Other")).expect("parse");
        assert_eq!(detector.detect(&unrelated, &sent), None);

        let newsletter = mime::parse_message(
            b"From: news@shop.com\r\nSubject: Delivery failure sale\r\n\r\nQuarterly plan a@x.com\r\n",
        )
        .expect("parse");
        assert_eq!(detector.detect(&newsletter, &sent), None);
    }

    #[test]
    fn date_window() {
        let now = 1_700_000_000;
        assert!(within(None, now, 300));
        assert!(!within(Some("Mon, 1 Jan 2001 00:00:00 +0000"), now, 300));
    }
}
