//! Command handlers
//!
//! Each public method runs one CLI command for a single account and returns
//! a [`CommandReport`] envelope. Business logic lives in the `*_impl`
//! methods; the public wrappers only time the call and attach warnings.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::address;
use crate::builder::{self, BuildMode, BuiltMessage, Decorations, Sender};
use crate::config::{AccountConfig, AppConfig};
use crate::drafts::{self, DraftChanges, DraftManager};
use crate::errors::{AppError, AppResult};
use crate::imap::{ImapConnector, MailStore, SearchCriteria, StoreConnector};
use crate::local_store::{self, LocalStore};
use crate::message_id;
use crate::mime::{self, ParsedMessage};
use crate::models::{
    Attachment, CommandReport, DeletedMessage, DeliveryReport, Draft, DraftEditOutcome,
    DraftOutcome, LocalDraftEntry, MessageIntent, MessageSummary, Meta, Priority, Warnings,
};
use crate::template::{self, Template};
use crate::transport::{MailTransport, SmtpTransport};
use crate::verify::{DeliveryVerifier, VerifierSettings};

/// Commands bound to one account
pub struct Dispatcher<C, T> {
    connector: C,
    transport: T,
    local: LocalStore,
    sender: Sender,
    /// Lowercased addresses that identify the account owner
    own_addresses: Vec<String>,
    decorations: Decorations,
    verifier: VerifierSettings,
}

impl Dispatcher<ImapConnector, SmtpTransport> {
    pub fn for_account(config: &AppConfig, account: &AccountConfig) -> Self {
        let mut own_addresses = vec![account.email.to_lowercase()];
        if account.uses_alias() {
            own_addresses.push(account.visible_from().to_lowercase());
        }
        Self {
            connector: ImapConnector::new(config, account),
            transport: SmtpTransport::for_account(account)
                .with_timeout(Duration::from_millis(config.socket_timeout_ms)),
            local: LocalStore::new(config.storage_dir.clone()),
            sender: Sender::from_account(account),
            own_addresses,
            decorations: Decorations {
                attribution: config.attribution,
                template: config.template_path.as_deref().and_then(Template::load),
                profile_image_tag: template::profile_image_tag(account.profile_image.as_deref()),
            },
            verifier: VerifierSettings::from_config(config),
        }
    }
}

/// How a command names an existing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageRef {
    Uid(u32),
    /// `Message-ID` header value, with or without angle brackets
    MessageId(String),
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uid(uid) => write!(f, "UID {uid}"),
            Self::MessageId(id) => write!(f, "Message-ID {id}"),
        }
    }
}

/// Reply parameters
#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub folder: String,
    pub target: MessageRef,
    /// `None` quotes the parent below an empty first paragraph
    pub body: Option<String>,
    /// Also address the parent's other To recipients
    pub all: bool,
    /// Replace the derived recipients when non-empty
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// Replace the `Re:` subject
    pub subject: Option<String>,
    pub attachments: Vec<PathBuf>,
    pub include_signature: bool,
    pub use_template: bool,
    pub priority: Priority,
    /// Save as a draft instead of sending
    pub as_draft: bool,
}

/// Forward parameters
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub folder: String,
    pub target: MessageRef,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// Replace the `Fwd:` subject
    pub subject: Option<String>,
    /// Note placed above the forwarded block
    pub body: Option<String>,
    /// Added after the parent's own attachments
    pub attachments: Vec<PathBuf>,
    pub include_signature: bool,
    pub use_template: bool,
    pub priority: Priority,
    pub as_draft: bool,
}

/// Values used where a Markdown file's frontmatter leaves a field empty
#[derive(Debug, Clone, Default)]
pub struct SendFileRequest {
    pub path: PathBuf,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: Option<String>,
    pub attachments: Vec<PathBuf>,
    pub include_signature: bool,
    pub use_template: bool,
}

/// Result of a reply or forward
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ComposeOutcome {
    Sent { report: DeliveryReport },
    Drafted { outcome: DraftOutcome },
}

impl Warnings for ComposeOutcome {
    fn warnings(&self) -> Vec<String> {
        match self {
            Self::Sent { report } => report.warnings(),
            Self::Drafted { outcome } => outcome.warnings(),
        }
    }
}

/// Selects which local drafts `send-drafts` considers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftFilter {
    Priority(Priority),
    /// Substring of any To address, case-insensitive
    To(String),
    /// Substring of the subject, case-insensitive
    Subject(String),
}

impl DraftFilter {
    pub fn matches(&self, draft: &Draft) -> bool {
        match self {
            Self::Priority(p) => draft.priority == *p,
            Self::To(needle) => {
                let needle = needle.to_lowercase();
                draft.to.iter().any(|t| t.to_lowercase().contains(&needle))
            }
            Self::Subject(needle) => draft.subject.to_lowercase().contains(&needle.to_lowercase()),
        }
    }
}

impl FromStr for DraftFilter {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        let (key, value) = s
            .split_once(':')
            .ok_or_else(|| AppError::invalid(format!("filter '{s}' must look like key:value")))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(AppError::invalid(format!("filter '{s}' has no value")));
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "priority" => Ok(Self::Priority(value.parse()?)),
            "to" => Ok(Self::To(value.to_owned())),
            "subject" => Ok(Self::Subject(value.to_owned())),
            other => Err(AppError::invalid(format!(
                "unknown filter key '{other}' (expected priority, to or subject)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendDraftsRequest {
    pub filter: Option<DraftFilter>,
    pub dry_run: bool,
    /// Delete sent draft files instead of moving them to `drafts/sent/`
    pub delete_sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Sent,
    WouldSend,
    Scheduled,
    /// Not sendable as written; left in place
    Rejected,
    Failed,
}

/// What happened to one local draft
#[derive(Debug, Clone, Serialize)]
pub struct DraftDispatch {
    pub path: PathBuf,
    pub subject: String,
    pub status: DispatchStatus,
    pub detail: Option<String>,
    /// Where the file went afterwards, if it moved
    pub moved_to: Option<PathBuf>,
    pub report: Option<DeliveryReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DraftBatch {
    pub drafts: Vec<DraftDispatch>,
}

impl DraftBatch {
    fn count(&self, status: DispatchStatus) -> usize {
        self.drafts.iter().filter(|d| d.status == status).count()
    }
}

impl Warnings for DraftBatch {
    fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        for draft in &self.drafts {
            if matches!(draft.status, DispatchStatus::Rejected | DispatchStatus::Failed) {
                out.push(format!(
                    "{}: {}",
                    draft.path.display(),
                    draft.detail.as_deref().unwrap_or("not sent")
                ));
            }
            if let Some(report) = &draft.report {
                out.extend(
                    report
                        .warnings()
                        .into_iter()
                        .map(|w| format!("{}: {w}", draft.path.display())),
                );
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DraftListing {
    pub local: Vec<LocalDraftEntry>,
    /// `None` unless remote drafts were requested
    pub remote: Option<Vec<MessageSummary>>,
    pub remote_error: Option<String>,
}

impl Warnings for DraftListing {
    fn warnings(&self) -> Vec<String> {
        self.remote_error
            .iter()
            .map(|e| format!("remote drafts unavailable: {e}"))
            .collect()
    }
}

impl<C, T> Dispatcher<C, T>
where
    C: StoreConnector + Clone,
    T: MailTransport,
{
    /// Command: compose and send one message
    pub async fn send(&self, intent: MessageIntent) -> AppResult<CommandReport<DeliveryReport>> {
        let started = Instant::now();
        finalize(started, self.send_impl(&intent).await)
    }

    /// Command: reply to a message by UID or Message-ID
    pub async fn reply(&self, request: ReplyRequest) -> AppResult<CommandReport<ComposeOutcome>> {
        let started = Instant::now();
        finalize(started, self.reply_impl(request).await)
    }

    /// Command: forward a message with its attachments
    pub async fn forward(
        &self,
        request: ForwardRequest,
    ) -> AppResult<CommandReport<ComposeOutcome>> {
        let started = Instant::now();
        finalize(started, self.forward_impl(request).await)
    }

    /// Command: send a Markdown file with optional frontmatter
    pub async fn send_file(
        &self,
        request: SendFileRequest,
    ) -> AppResult<CommandReport<DeliveryReport>> {
        let started = Instant::now();
        finalize(started, self.send_file_impl(&request).await)
    }

    /// Command: send every due local draft
    pub async fn send_drafts(
        &self,
        request: SendDraftsRequest,
    ) -> AppResult<CommandReport<DraftBatch>> {
        let started = Instant::now();
        finalize(started, self.send_drafts_impl(&request).await)
    }

    /// Command: save a new draft locally and remotely
    pub async fn draft_create(&self, draft: Draft) -> AppResult<CommandReport<DraftOutcome>> {
        let started = Instant::now();
        finalize(started, self.draft_create_impl(draft, &[]).await)
    }

    /// Command: list local drafts and, optionally, remote ones
    pub async fn draft_list(
        &self,
        remote: bool,
        include_body: bool,
    ) -> AppResult<CommandReport<DraftListing>> {
        let started = Instant::now();
        finalize(started, self.draft_list_impl(remote, include_body).await)
    }

    /// Command: edit a remote draft by UID
    pub async fn draft_edit(
        &self,
        uid: u32,
        changes: DraftChanges,
    ) -> AppResult<CommandReport<DraftEditOutcome>> {
        let started = Instant::now();
        let result = self.drafts().edit(uid, &changes).await.map(|outcome| {
            let summary = match &outcome.created.remote {
                Ok(remote) => format!(
                    "Draft UID {uid} replaced by {} in '{}'",
                    remote.uid.map_or_else(|| "a new copy".to_owned(), |u| format!("UID {u}")),
                    remote.folder
                ),
                Err(_) => format!("Draft UID {uid} removed; replacement saved locally only"),
            };
            (summary, outcome)
        });
        finalize(started, result)
    }

    /// Command: delete a remote draft and its local file
    pub async fn draft_delete(&self, uid: u32) -> AppResult<CommandReport<DeletedMessage>> {
        let started = Instant::now();
        let result = self.drafts().delete(uid).await.map(|deleted| {
            (
                format!("Draft UID {uid} deleted from '{}'", deleted.folder),
                deleted,
            )
        });
        finalize(started, result)
    }

    /// Command: delete any message by folder and UID
    pub async fn delete(&self, folder: &str, uid: u32) -> AppResult<CommandReport<DeletedMessage>> {
        let started = Instant::now();
        let result = drafts::delete_remote(&self.connector, folder, uid)
            .await
            .map(|deleted| (format!("Message UID {uid} deleted from '{folder}'"), deleted));
        finalize(started, result)
    }
}

/// Command implementation methods
impl<C, T> Dispatcher<C, T>
where
    C: StoreConnector + Clone,
    T: MailTransport,
{
    fn drafts(&self) -> DraftManager<C> {
        DraftManager::new(self.connector.clone(), self.local.clone(), self.sender.clone())
    }

    async fn send_impl(&self, intent: &MessageIntent) -> AppResult<(String, DeliveryReport)> {
        let built = builder::build(intent, &self.sender, &self.decorations, BuildMode::Send)?;
        let report = self.deliver(&built).await?;
        Ok((
            format!("Sent '{}' to {}", built.subject, built.recipients.join(", ")),
            report,
        ))
    }

    /// Transmit once, then persist and verify
    ///
    /// A failed transmission is an error; nothing is persisted for it.
    async fn deliver(&self, built: &BuiltMessage) -> AppResult<DeliveryReport> {
        let result = self.transport.transmit(built).await;
        result.clone().into_result()?;
        info!(message_id = %built.message_id, recipients = built.recipients.len(), "message sent");
        let verifier =
            DeliveryVerifier::new(self.connector.clone(), self.local.clone(), self.verifier);
        Ok(verifier.record(built, result).await)
    }

    async fn reply_impl(&self, request: ReplyRequest) -> AppResult<(String, ComposeOutcome)> {
        let parent = self.fetch_parent(&request.folder, &request.target).await?;
        let intent = reply_intent(&parent, &request, &self.own_addresses)?;
        self.send_or_draft(intent, &request.attachments, &[], request.as_draft)
            .await
    }

    async fn forward_impl(&self, request: ForwardRequest) -> AppResult<(String, ComposeOutcome)> {
        let parent = self.fetch_parent(&request.folder, &request.target).await?;
        let intent = forward_intent(&parent, &request)?;
        let carried = parent.attachment_bytes();
        self.send_or_draft(intent, &request.attachments, &carried, request.as_draft)
            .await
    }

    /// Send `intent`, or save it as a draft
    ///
    /// `carried` holds in-memory attachments; for a draft they go to the
    /// server copy only, while `paths` are recorded in the local file too.
    async fn send_or_draft(
        &self,
        mut intent: MessageIntent,
        paths: &[PathBuf],
        carried: &[Attachment],
        as_draft: bool,
    ) -> AppResult<(String, ComposeOutcome)> {
        if as_draft {
            let draft = Draft {
                to: intent.to,
                cc: intent.cc,
                bcc: intent.bcc,
                subject: intent.subject,
                body: intent.plain_body,
                attachments: paths.iter().map(|p| p.display().to_string()).collect(),
                priority: intent.priority,
                in_reply_to: intent.in_reply_to,
                references: intent.references,
                ..Draft::default()
            };
            let (summary, outcome) = self.draft_create_impl(draft, carried).await?;
            return Ok((summary, ComposeOutcome::Drafted { outcome }));
        }

        let mut attachments = carried.to_vec();
        attachments.append(&mut intent.attachments);
        intent.attachments = attachments;
        let (summary, report) = self.send_impl(&intent).await?;
        Ok((summary, ComposeOutcome::Sent { report }))
    }

    async fn send_file_impl(&self, request: &SendFileRequest) -> AppResult<(String, DeliveryReport)> {
        let draft = local_store::read_draft(&request.path)?;
        let intent = file_intent(draft, request);
        self.send_impl(&intent).await
    }

    async fn fetch_parent(&self, folder: &str, target: &MessageRef) -> AppResult<ParsedMessage> {
        let mut store = self.connector.connect().await?;
        let parsed: AppResult<_> = async {
            store.select(folder).await?;
            match target {
                MessageRef::Uid(uid) => {
                    mime::parse_message(&drafts::fetch_one(&mut store, folder, *uid).await?.raw)
                }
                MessageRef::MessageId(raw) => find_by_message_id(&mut store, folder, raw).await,
            }
        }
        .await;
        if let Err(e) = store.logout().await {
            debug!(error = %e, "IMAP logout failed");
        }
        parsed
    }

    async fn send_drafts_impl(&self, request: &SendDraftsRequest) -> AppResult<(String, DraftBatch)> {
        let now = Local::now();
        let mut batch = DraftBatch { drafts: Vec::new() };

        for entry in self.local.list_drafts()? {
            if let Some(filter) = &request.filter
                && !filter.matches(&entry.draft)
            {
                continue;
            }
            let mut dispatch = DraftDispatch {
                path: entry.path.clone(),
                subject: entry.draft.subject.clone(),
                status: DispatchStatus::WouldSend,
                detail: None,
                moved_to: None,
                report: None,
            };

            if entry.draft.is_scheduled_after(now) {
                dispatch.status = DispatchStatus::Scheduled;
                dispatch.detail = entry.draft.send_after.map(|at| format!("scheduled for {at}"));
            } else if let Err(e) = check_sendable(&entry.draft) {
                dispatch.status = DispatchStatus::Rejected;
                dispatch.detail = Some(e.to_string());
            } else if !request.dry_run {
                self.dispatch_one(&entry, request.delete_sent, &mut dispatch).await;
            }
            batch.drafts.push(dispatch);
        }

        let mut summary = if request.dry_run {
            format!("{} draft(s) would be sent", batch.count(DispatchStatus::WouldSend))
        } else {
            format!("{} draft(s) sent", batch.count(DispatchStatus::Sent))
        };
        for (status, label) in [
            (DispatchStatus::Scheduled, "scheduled"),
            (DispatchStatus::Failed, "failed"),
            (DispatchStatus::Rejected, "rejected"),
        ] {
            let n = batch.count(status);
            if n > 0 {
                let _ = write!(summary, ", {n} {label}");
            }
        }
        Ok((summary, batch))
    }

    async fn dispatch_one(&self, entry: &LocalDraftEntry, delete_sent: bool, out: &mut DraftDispatch) {
        let sent: AppResult<DeliveryReport> = async {
            let intent = entry.draft.to_intent(true, true);
            let built = builder::build(&intent, &self.sender, &self.decorations, BuildMode::Send)?;
            self.deliver(&built).await
        }
        .await;

        match sent {
            Ok(report) => {
                out.status = DispatchStatus::Sent;
                out.report = Some(report);
                let filed = if delete_sent {
                    self.local.remove_draft(&entry.path).map(|()| None)
                } else {
                    self.local.file_draft(&entry.path, "sent").map(Some)
                };
                match filed {
                    Ok(moved) => out.moved_to = moved,
                    Err(e) => warn!(path = %entry.path.display(), error = %e, "sent draft not filed"),
                }
            }
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "draft not sent");
                out.status = DispatchStatus::Failed;
                out.detail = Some(e.to_string());
                match self.local.file_draft(&entry.path, "failed") {
                    Ok(moved) => out.moved_to = Some(moved),
                    Err(e) => warn!(path = %entry.path.display(), error = %e, "failed draft not filed"),
                }
            }
        }
    }

    async fn draft_create_impl(
        &self,
        draft: Draft,
        extra: &[Attachment],
    ) -> AppResult<(String, DraftOutcome)> {
        let subject = draft.subject.clone();
        let outcome = self.drafts().create(draft, extra).await?;
        if !outcome.fully_succeeded() {
            warn!(subject = %subject, "draft saved to one store only");
        }
        let summary = match (&outcome.local, &outcome.remote) {
            (Err(local), Err(remote)) => {
                return Err(AppError::Internal(format!(
                    "draft not saved anywhere (local: {local}; remote: {remote})"
                )));
            }
            (Ok(path), Ok(remote)) => format!(
                "Draft '{subject}' saved to {} and '{}'{}",
                path.display(),
                remote.folder,
                remote.uid.map(|u| format!(" (UID {u})")).unwrap_or_default()
            ),
            (Ok(path), Err(_)) => format!("Draft '{subject}' saved locally to {}", path.display()),
            (Err(_), Ok(remote)) => format!("Draft '{subject}' saved to '{}' only", remote.folder),
        };
        Ok((summary, outcome))
    }

    async fn draft_list_impl(
        &self,
        remote: bool,
        include_body: bool,
    ) -> AppResult<(String, DraftListing)> {
        let manager = self.drafts();
        let local = manager.list_local()?;
        let (remote, remote_error) = if remote {
            match manager.list_remote(include_body).await {
                Ok(listed) => (Some(listed), None),
                Err(e) => {
                    warn!(error = %e, "remote drafts unavailable");
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        let mut summary = format!("{} local draft(s)", local.len());
        for entry in &local {
            let _ = write!(
                summary,
                "\n  {}  {}  to: {}",
                entry.path.display(),
                entry.draft.subject,
                entry.draft.to.join(", ")
            );
        }
        if let Some(listed) = &remote {
            let _ = write!(summary, "\n{} remote draft(s)", listed.len());
            for message in listed {
                let _ = write!(
                    summary,
                    "\n  UID {}  {}  to: {}",
                    message.uid,
                    message.subject.as_deref().unwrap_or("(no subject)"),
                    message.to.as_deref().unwrap_or_default()
                );
            }
        }
        Ok((
            summary,
            DraftListing {
                local,
                remote,
                remote_error,
            },
        ))
    }
}

/// Look a message up by `Message-ID`, newest match first
///
/// The server-side search can be broader than asked, so every candidate is
/// checked against the parsed header before it is accepted.
async fn find_by_message_id<S: MailStore>(
    store: &mut S,
    folder: &str,
    raw: &str,
) -> AppResult<ParsedMessage> {
    let id = message_id::normalize(raw)?
        .ok_or_else(|| AppError::invalid("message id must not be empty"))?;
    let criteria = SearchCriteria {
        message_id: Some(id.clone()),
        ..SearchCriteria::default()
    };
    let mut uids = store.search(&criteria).await?;
    uids.sort_unstable_by(|a, b| b.cmp(a));
    for uid in uids {
        let parsed = mime::parse_message(&drafts::fetch_one(&mut *store, folder, uid).await?.raw)?;
        let found = parsed
            .message_id
            .as_deref()
            .and_then(|m| message_id::normalize(m).ok().flatten())
            .is_some_and(|m| m == id);
        if found {
            return Ok(parsed);
        }
    }
    Err(AppError::NotFound(format!(
        "no message with Message-ID {id} in '{folder}'"
    )))
}

/// Recipients, subject, body and threading headers for a reply
///
/// Explicit To, Cc, Bcc and subject values replace the derived ones.
///
/// # Errors
///
/// `InvalidInput` when the parent has no usable From address.
pub fn reply_intent(
    parent: &ParsedMessage,
    request: &ReplyRequest,
    own_addresses: &[String],
) -> AppResult<MessageIntent> {
    let from = parent
        .from
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .ok_or_else(|| AppError::invalid("message has no From address to reply to"))?;

    let is_own = |addr: &str| {
        let bare = address::bare_address(addr).to_lowercase();
        own_addresses.iter().any(|own| *own == bare)
    };
    let mut to = vec![from.to_owned()];
    if request.all {
        for addr in &parent.to_list {
            let bare = address::bare_address(addr).to_lowercase();
            let seen = to
                .iter()
                .any(|t| address::bare_address(t).to_lowercase() == bare);
            if !seen && !is_own(addr) {
                to.push(addr.clone());
            }
        }
    }
    let given = |list: &[String], derived: Vec<String>| {
        if list.iter().all(|a| a.trim().is_empty()) {
            derived
        } else {
            list.to_vec()
        }
    };

    let threading = message_id::reply_threading(&parent.parent_headers());
    Ok(MessageIntent {
        to: given(&request.to, to),
        cc: given(&request.cc, Vec::new()),
        bcc: given(&request.bcc, Vec::new()),
        subject: request
            .subject
            .clone()
            .unwrap_or_else(|| reply_subject(parent.subject.as_deref().unwrap_or_default())),
        plain_body: request
            .body
            .clone()
            .unwrap_or_else(|| format!("\n\n{}", quote_parent(parent))),
        attachments: request
            .attachments
            .iter()
            .cloned()
            .map(Attachment::Path)
            .collect(),
        in_reply_to: threading.in_reply_to,
        references: threading.references,
        include_signature: request.include_signature,
        use_template: request.use_template,
        priority: request.priority,
        ..MessageIntent::default()
    })
}

/// `Re: ` prefix, never doubled
pub fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    if subject.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        subject.to_owned()
    } else {
        format!("Re: {subject}")
    }
}

/// Attribution line followed by the parent body with `> ` on every line
pub fn quote_parent(parent: &ParsedMessage) -> String {
    let mut out = format!(
        "On {}, {} wrote:\n",
        parent.date.as_deref().map(display_date).unwrap_or_default(),
        parent.from.as_deref().map(str::trim).unwrap_or("unknown sender")
    );
    for line in parent.display_body().unwrap_or_default().lines() {
        let _ = writeln!(out, "> {line}");
    }
    out
}

/// `Mar 4, 2025 at 3:07 PM` in local time, or the header as received
fn display_date(raw: &str) -> String {
    mailparse::dateparse(raw)
        .ok()
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .map(|at| {
            at.with_timezone(&Local)
                .format("%b %-d, %Y at %-I:%M %p")
                .to_string()
        })
        .unwrap_or_else(|| raw.trim().to_owned())
}

/// Recipients, subject and body for a forward
///
/// Parent attachments are not included; callers add them as in-memory parts.
///
/// # Errors
///
/// `InvalidInput` when no To recipient is given.
pub fn forward_intent(parent: &ParsedMessage, request: &ForwardRequest) -> AppResult<MessageIntent> {
    if request.to.iter().all(|t| t.trim().is_empty()) {
        return Err(AppError::invalid("forward needs at least one To recipient"));
    }
    let block = forward_block(parent);
    let plain_body = match request.body.as_deref().filter(|b| !b.trim().is_empty()) {
        Some(note) => format!("{note}\n\n{block}"),
        None => format!("\n\n{block}"),
    };
    Ok(MessageIntent {
        to: request.to.clone(),
        cc: request.cc.clone(),
        bcc: request.bcc.clone(),
        subject: request
            .subject
            .clone()
            .unwrap_or_else(|| forward_subject(parent.subject.as_deref().unwrap_or_default())),
        plain_body,
        attachments: request
            .attachments
            .iter()
            .cloned()
            .map(Attachment::Path)
            .collect(),
        include_signature: request.include_signature,
        use_template: request.use_template,
        priority: request.priority,
        ..MessageIntent::default()
    })
}

/// `Fwd: ` prefix unless the subject already starts with `Fwd:` or `Fw:`
pub fn forward_subject(subject: &str) -> String {
    let subject = subject.trim();
    let lower = subject.to_ascii_lowercase();
    if lower.starts_with("fwd:") || lower.starts_with("fw:") {
        subject.to_owned()
    } else {
        format!("Fwd: {subject}")
    }
}

fn forward_block(parent: &ParsedMessage) -> String {
    let mut block = String::from("---------- Forwarded message ----------\n");
    let _ = writeln!(block, "From: {}", parent.from.as_deref().unwrap_or_default().trim());
    let _ = writeln!(
        block,
        "Date: {}",
        parent.date.as_deref().map(display_date).unwrap_or_default()
    );
    let _ = writeln!(block, "Subject: {}", parent.subject.as_deref().unwrap_or_default());
    if !parent.to_list.is_empty() {
        let _ = writeln!(block, "To: {}", address::format_list(&parent.to_list));
    }
    block.push('\n');
    block.push_str(&parent.display_body().unwrap_or_default());
    block
}

/// Intent for a Markdown file
///
/// Frontmatter values win; the request fills recipients, subject and
/// attachments the file leaves empty.
pub fn file_intent(draft: Draft, request: &SendFileRequest) -> MessageIntent {
    let fill = |from_file: Vec<String>, fallback: &[String]| {
        if from_file.is_empty() {
            fallback.to_vec()
        } else {
            from_file
        }
    };
    let mut intent = draft.to_intent(request.include_signature, request.use_template);
    intent.to = fill(intent.to, &request.to);
    intent.cc = fill(intent.cc, &request.cc);
    intent.bcc = fill(intent.bcc, &request.bcc);
    if intent.subject.trim().is_empty()
        && let Some(subject) = &request.subject
    {
        intent.subject = subject.clone();
    }
    if intent.attachments.is_empty() {
        intent.attachments = request
            .attachments
            .iter()
            .cloned()
            .map(Attachment::Path)
            .collect();
    }
    intent
}

fn check_sendable(draft: &Draft) -> AppResult<()> {
    if draft.to.iter().all(|t| t.trim().is_empty()) {
        return Err(AppError::invalid("draft has no 'to' recipients"));
    }
    if draft.subject.trim().is_empty() {
        return Err(AppError::invalid("draft has no subject"));
    }
    Ok(())
}

fn duration_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Wrap a command result in the standard report envelope
fn finalize<T: Warnings>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> AppResult<CommandReport<T>> {
    let (summary, data) = result?;
    Ok(CommandReport {
        summary,
        warnings: data.warnings(),
        data,
        meta: Meta::now(duration_ms(started)),
    })
}
