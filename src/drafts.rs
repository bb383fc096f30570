//! Draft lifecycle across the local drafts directory and the remote Drafts folder
//!
//! The two stores are written independently: a failed APPEND never undoes
//! the local file and vice versa, and both outcomes are reported. Remote
//! drafts are immutable on IMAP, so editing one deletes it and appends a
//! replacement under a new UID.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::builder::{self, BuildMode, BuiltMessage, Decorations, Sender};
use crate::errors::{AppError, AppResult};
use crate::folders::{self, Discovery, FolderRole};
use crate::imap::{FetchedMessage, MailStore, SearchCriteria, StoreConnector};
use crate::local_store::LocalStore;
use crate::mime;
use crate::models::{
    Attachment, DeletedMessage, Draft, DraftEditOutcome, DraftOutcome, LocalDraftEntry,
    MessageSummary, Priority, RemoteDraft,
};

/// Field replacements applied by [`DraftManager::edit`]
#[derive(Debug, Clone, Default)]
pub struct DraftChanges {
    pub to: Option<Vec<String>>,
    pub cc: Option<Vec<String>>,
    pub bcc: Option<Vec<String>>,
    pub subject: Option<String>,
    pub body: Option<String>,
    /// Replaces every existing attachment
    pub attachments: Option<Vec<String>>,
    pub priority: Option<Priority>,
}

impl DraftChanges {
    fn apply(&self, draft: &mut Draft) {
        if let Some(to) = &self.to {
            draft.to = to.clone();
        }
        if let Some(cc) = &self.cc {
            draft.cc = cc.clone();
        }
        if let Some(bcc) = &self.bcc {
            draft.bcc = bcc.clone();
        }
        if let Some(subject) = &self.subject {
            draft.subject = subject.clone();
        }
        if let Some(body) = &self.body {
            draft.body = body.clone();
        }
        if let Some(attachments) = &self.attachments {
            draft.attachments = attachments.clone();
        }
        if let Some(priority) = self.priority {
            draft.priority = priority;
        }
    }
}

pub struct DraftManager<C> {
    connector: C,
    local: LocalStore,
    sender: Sender,
}

impl<C: StoreConnector> DraftManager<C> {
    pub fn new(connector: C, local: LocalStore, sender: Sender) -> Self {
        Self {
            connector,
            local,
            sender,
        }
    }

    /// Save a draft locally, then append it to the remote Drafts folder
    ///
    /// `extra` carries in-memory attachments on top of the draft's paths.
    ///
    /// # Errors
    ///
    /// Only composition failures (no recipients, missing attachment) are
    /// errors; store failures are reported in the outcome.
    pub async fn create(&self, mut draft: Draft, extra: &[Attachment]) -> AppResult<DraftOutcome> {
        let built = self.compose(&draft, extra)?;
        draft.message_id = Some(built.message_id.clone());
        draft.remote_uid = None;
        draft.remote_folder = None;

        let local = self.save_local(&draft, None);
        let remote = self.push_remote(&built).await;
        self.note_remote(&local, &mut draft, &remote);
        Ok(DraftOutcome { local, remote })
    }

    pub fn list_local(&self) -> AppResult<Vec<LocalDraftEntry>> {
        self.local.list_drafts()
    }

    /// Remote drafts, oldest UID first
    ///
    /// An account without a Drafts folder keeps its drafts in INBOX, where
    /// only `\Draft`-flagged messages are listed.
    ///
    /// # Errors
    ///
    /// Connection, select, search or fetch failures.
    pub async fn list_remote(&self, include_body: bool) -> AppResult<Vec<MessageSummary>> {
        let mut store = self.connector.connect().await?;
        let listed = list_in_session(&mut store, include_body).await;
        close(store).await;
        listed
    }

    /// Replace remote draft `uid` with an edited copy
    ///
    /// `uid` is invalid as soon as this is called, whatever the outcome.
    ///
    /// # Errors
    ///
    /// `NotFound` when there is no such UID (or it is not a `\Draft` in an
    /// INBOX used for drafts), and composition failures. Nothing is deleted
    /// in either case.
    pub async fn edit(&self, uid: u32, changes: &DraftChanges) -> AppResult<DraftEditOutcome> {
        let mut store = self.connector.connect().await?;
        let edited = self.edit_in_session(&mut store, uid, changes).await;
        close(store).await;
        edited
    }

    /// Delete remote draft `uid` and its correlated local file
    ///
    /// # Errors
    ///
    /// `NotFound` when there is no such UID, or when the drafts live in INBOX
    /// and `uid` is not flagged `\Draft`.
    pub async fn delete(&self, uid: u32) -> AppResult<DeletedMessage> {
        let recorded = self.recorded_folder(uid);
        let mut store = self.connector.connect().await?;
        let deleted = async {
            let location = locate_drafts(&mut store, recorded.as_deref()).await?;
            store.select(&location.folder).await?;
            let removed = fetch_draft(&mut store, &location, uid).await?;
            remove_uid(&mut store, uid).await?;
            Ok::<_, AppError>((location.folder, removed))
        }
        .await;
        close(store).await;
        let (folder, removed) = deleted?;

        let parsed = mime::parse_message(&removed.raw).ok();
        let message_id = parsed.as_ref().and_then(|p| p.message_id.as_deref());
        let local_removed = match self.local.find_draft(Some(uid), message_id) {
            Ok(Some(entry)) => match self.local.remove_draft(&entry.path) {
                Ok(()) => Some(entry.path),
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "local draft not removed");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "could not scan local drafts");
                None
            }
        };

        info!(uid, folder = %folder, "draft deleted");
        Ok(DeletedMessage {
            folder,
            uid,
            subject: parsed.and_then(|p| p.subject),
            local_removed,
        })
    }

    /// Folder recorded by the local copy of remote draft `uid`
    fn recorded_folder(&self, uid: u32) -> Option<String> {
        match self.local.find_draft(Some(uid), None) {
            Ok(entry) => entry.and_then(|e| e.draft.remote_folder),
            Err(e) => {
                warn!(error = %e, "could not scan local drafts");
                None
            }
        }
    }

    async fn edit_in_session(
        &self,
        store: &mut C::Store,
        uid: u32,
        changes: &DraftChanges,
    ) -> AppResult<DraftEditOutcome> {
        let location = locate_drafts(store, self.recorded_folder(uid).as_deref()).await?;
        let folder = location.folder.clone();
        store.select(&folder).await?;
        let fetched = fetch_draft(store, &location, uid).await?;
        let parsed = mime::parse_message(&fetched.raw)?;
        let (mut draft, mut extra) = parsed.to_draft();

        let correlated = self
            .local
            .find_draft(Some(uid), parsed.message_id.as_deref())
            .unwrap_or_else(|e| {
                warn!(error = %e, "could not scan local drafts");
                None
            });
        if let Some(entry) = &correlated {
            // local paths are the source of truth for attachments
            draft.attachments = entry.draft.attachments.clone();
            draft.send_after = entry.draft.send_after;
            extra.clear();
        }
        if changes.attachments.is_some() {
            extra.clear();
        }
        changes.apply(&mut draft);

        let built = self.compose(&draft, &extra)?;
        draft.message_id = Some(built.message_id.clone());
        draft.remote_uid = None;

        info!(uid, folder = %folder, "replacing remote draft");
        let old_copy_removed = remove_uid(store, uid).await.map_err(|e| {
            warn!(uid, error = %e, "old draft copy not removed");
            e.to_string()
        });

        let local = self.save_local(&draft, correlated.as_ref().map(|e| e.path.as_path()));
        let remote = append_draft(store, Some(&folder), &built)
            .await
            .map_err(|e| {
                warn!(error = %e, "replacement draft not appended");
                e.to_string()
            });
        self.note_remote(&local, &mut draft, &remote);

        Ok(DraftEditOutcome {
            invalidated_uid: uid,
            old_copy_removed,
            created: DraftOutcome { local, remote },
        })
    }

    /// Drafts are never decorated
    fn compose(&self, draft: &Draft, extra: &[Attachment]) -> AppResult<BuiltMessage> {
        let mut intent = draft.to_intent(false, false);
        intent.attachments.extend(extra.iter().cloned());
        builder::build(&intent, &self.sender, &Decorations::default(), BuildMode::Draft)
    }

    fn save_local(&self, draft: &Draft, existing: Option<&Path>) -> Result<PathBuf, String> {
        let saved = match existing {
            Some(path) => self
                .local
                .rewrite_draft(path, draft)
                .map(|()| path.to_path_buf()),
            None => self.local.write_draft(draft),
        };
        saved.map_err(|e| {
            warn!(error = %e, "local draft not saved");
            e.to_string()
        })
    }

    async fn push_remote(&self, built: &BuiltMessage) -> Result<RemoteDraft, String> {
        let pushed: AppResult<RemoteDraft> = async {
            let mut store = self.connector.connect().await?;
            let appended = append_draft(&mut store, None, built).await;
            close(store).await;
            appended
        }
        .await;
        pushed.map_err(|e| {
            warn!(error = %e, "remote draft not saved");
            e.to_string()
        })
    }

    /// Record the captured UID and its folder in the local file
    fn note_remote(
        &self,
        local: &Result<PathBuf, String>,
        draft: &mut Draft,
        remote: &Result<RemoteDraft, String>,
    ) {
        let (Ok(path), Ok(RemoteDraft {
            uid: Some(uid),
            folder,
            ..
        })) = (local, remote)
        else {
            return;
        };
        draft.remote_uid = Some(*uid);
        draft.remote_folder = Some(folder.clone());
        if let Err(e) = self.local.rewrite_draft(path, draft) {
            warn!(path = %path.display(), error = %e, "remote UID not recorded locally");
        }
    }
}

/// Select `folder`, confirm `uid` exists, then flag it `\Deleted` and expunge
///
/// Returns the message as it was before removal.
///
/// # Errors
///
/// `NotFound` when the folder cannot be selected or the UID is absent.
pub async fn delete_message<S: MailStore>(
    store: &mut S,
    folder: &str,
    uid: u32,
) -> AppResult<FetchedMessage> {
    store.select(folder).await?;
    let message = fetch_one(store, folder, uid).await?;
    remove_uid(store, uid).await?;
    Ok(message)
}

/// Delete one message from any folder in its own session
///
/// # Errors
///
/// Connection failures and those of [`delete_message`].
pub async fn delete_remote<C: StoreConnector>(
    connector: &C,
    folder: &str,
    uid: u32,
) -> AppResult<DeletedMessage> {
    let mut store = connector.connect().await?;
    let deleted = delete_message(&mut store, folder, uid).await;
    close(store).await;
    let removed = deleted?;
    info!(uid, folder, "message deleted");
    Ok(DeletedMessage {
        folder: folder.to_owned(),
        uid,
        subject: mime::parse_message(&removed.raw).ok().and_then(|p| p.subject),
        local_removed: None,
    })
}

/// Where remote drafts live
///
/// INBOX stands in for a missing Drafts folder, in which case only
/// `\Draft`-flagged messages count as drafts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DraftsLocation {
    folder: String,
    draft_only: bool,
}

impl DraftsLocation {
    fn new(folder: String) -> Self {
        let draft_only = FolderRole::Drafts
            .fallback()
            .is_some_and(|f| f.eq_ignore_ascii_case(&folder));
        Self { folder, draft_only }
    }
}

/// The recorded folder when known, else the discovered Drafts folder, else INBOX
async fn locate_drafts<S: MailStore>(
    store: &mut S,
    recorded: Option<&str>,
) -> AppResult<DraftsLocation> {
    if let Some(folder) = recorded {
        return Ok(DraftsLocation::new(folder.to_owned()));
    }
    if let Some(folder) = folders::resolve(store, FolderRole::Drafts, Discovery::Existing).await? {
        return Ok(DraftsLocation::new(folder));
    }
    let fallback = FolderRole::Drafts
        .fallback()
        .ok_or_else(|| AppError::NotFound("no Drafts folder on the server".to_owned()))?;
    debug!(folder = fallback, "no Drafts folder; using INBOX drafts");
    Ok(DraftsLocation::new(fallback.to_owned()))
}

/// Fetch `uid`, refusing non-drafts in a shared folder
async fn fetch_draft<S: MailStore>(
    store: &mut S,
    location: &DraftsLocation,
    uid: u32,
) -> AppResult<FetchedMessage> {
    let message = fetch_one(store, &location.folder, uid).await?;
    if location.draft_only && !message.flags.iter().any(|f| f.eq_ignore_ascii_case("\\Draft")) {
        return Err(AppError::NotFound(format!(
            "UID {uid} in '{}' is not a draft",
            location.folder
        )));
    }
    Ok(message)
}

pub(crate) async fn fetch_one<S: MailStore>(store: &mut S, folder: &str, uid: u32) -> AppResult<FetchedMessage> {
    store
        .fetch(&[uid])
        .await?
        .into_iter()
        .find(|m| m.uid == uid)
        .ok_or_else(|| AppError::NotFound(format!("message UID {uid} not found in '{folder}'")))
}

async fn remove_uid<S: MailStore>(store: &mut S, uid: u32) -> AppResult<()> {
    store.mark_deleted(uid).await?;
    store.expunge().await
}

/// APPEND with `\Draft`, then look the message up again to learn its UID
async fn append_draft<S: MailStore>(
    store: &mut S,
    folder: Option<&str>,
    built: &BuiltMessage,
) -> AppResult<RemoteDraft> {
    let folder = match folder {
        Some(folder) => folder.to_owned(),
        None => folders::resolve(store, FolderRole::Drafts, Discovery::CreateIfMissing)
            .await?
            .ok_or_else(|| AppError::NotFound("no Drafts folder available".to_owned()))?,
    };
    store.append(&folder, "(\\Draft)", &built.bytes).await?;

    let uid = match capture_uid(store, &folder, &built.message_id).await {
        Ok(uid) => uid,
        Err(e) => {
            warn!(folder = %folder, error = %e, "draft UID not captured");
            None
        }
    };
    info!(folder = %folder, ?uid, message_id = %built.message_id, "draft appended");
    Ok(RemoteDraft {
        folder,
        uid,
        message_id: built.message_id.clone(),
    })
}

async fn capture_uid<S: MailStore>(
    store: &mut S,
    folder: &str,
    message_id: &str,
) -> AppResult<Option<u32>> {
    store.select(folder).await?;
    let criteria = SearchCriteria {
        message_id: Some(message_id.to_owned()),
        ..SearchCriteria::default()
    };
    Ok(store.search(&criteria).await?.into_iter().max())
}

async fn list_in_session<S: MailStore>(
    store: &mut S,
    include_body: bool,
) -> AppResult<Vec<MessageSummary>> {
    let DraftsLocation { folder, draft_only } = locate_drafts(store, None).await?;
    if store.select(&folder).await?.exists == 0 {
        return Ok(Vec::new());
    }
    let criteria = SearchCriteria {
        draft_only,
        ..SearchCriteria::default()
    };
    let uids = store.search(&criteria).await?;
    if uids.is_empty() {
        return Ok(Vec::new());
    }
    let mut summaries: Vec<MessageSummary> = store
        .fetch(&uids)
        .await?
        .into_iter()
        .map(|fetched| summarize(&folder, fetched, include_body))
        .collect();
    summaries.sort_by_key(|s| s.uid);
    Ok(summaries)
}

fn summarize(folder: &str, fetched: FetchedMessage, include_body: bool) -> MessageSummary {
    let mut summary = MessageSummary {
        folder: folder.to_owned(),
        uid: fetched.uid,
        from: None,
        to: None,
        subject: None,
        date: None,
        flags: fetched.flags,
        body: None,
    };
    match mime::parse_message(&fetched.raw) {
        Ok(parsed) => {
            if include_body {
                summary.body = parsed.display_body();
            }
            summary.from = parsed.from;
            summary.to = parsed.to;
            summary.subject = parsed.subject;
            summary.date = parsed.date;
        }
        Err(e) => debug!(uid = summary.uid, error = %e, "unparseable draft listed without headers"),
    }
    summary
}

async fn close<S: MailStore>(store: S) {
    if let Err(e) = store.logout().await {
        debug!(error = %e, "IMAP logout failed");
    }
}
