//! Domain types shared across the pipeline
//!
//! Message intents flow into the builder, transport and persistence outcomes
//! flow out into reports. Report types derive `Serialize` so the CLI can emit
//! them as JSON.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};
use crate::providers::SmtpSecurity;

/// Metadata included in all command reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Command execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard envelope for all command output
///
/// Wraps command-specific data with a human-readable summary and execution
/// metadata.
#[derive(Debug, Clone, Serialize)]
pub struct CommandReport<T> {
    /// Human-readable summary of the outcome
    pub summary: String,
    /// Non-fatal problems (persistence, verification, partial drafts)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Command-specific payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Non-fatal problems carried by a command result
pub trait Warnings {
    fn warnings(&self) -> Vec<String>;
}

/// Message priority, carried as `X-Priority` when not normal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// `X-Priority` header value, `None` for normal priority
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            Self::High => Some("1 (Highest)"),
            Self::Normal => None,
            Self::Low => Some("5 (Lowest)"),
        }
    }

    /// Interpret an `X-Priority` header (`1 (Highest)`, `5`, `high`, ...)
    pub fn from_header(value: &str) -> Self {
        let value = value.trim();
        if let Ok(p) = value.parse::<Self>() {
            return p;
        }
        match value.chars().next() {
            Some('1' | '2') => Self::High,
            Some('4' | '5') => Self::Low,
            _ => Self::Normal,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "urgent" => Ok(Self::High),
            "" | "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(AppError::invalid(format!(
                "unknown priority '{other}' (expected high, normal or low)"
            ))),
        }
    }
}

/// A file to attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// Read from disk at build time; a missing file fails the build
    Path(PathBuf),
    /// Already in memory
    Bytes { filename: String, data: Vec<u8> },
}

/// Structured description of a message to compose
///
/// Immutable once handed to the builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageIntent {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub plain_body: String,
    pub html_body: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Parent Message-ID, with or without angle brackets
    pub in_reply_to: Option<String>,
    /// Ordered Message-ID chain, oldest first
    pub references: Vec<String>,
    pub include_signature: bool,
    pub use_template: bool,
    pub priority: Priority,
}

impl MessageIntent {
    /// All envelope recipients: To, then CC, then BCC
    pub fn recipients(&self) -> Vec<String> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(|r| r.trim().to_owned())
            .filter(|r| !r.is_empty())
            .collect()
    }
}

/// A draft as stored locally and mirrored remotely
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Draft {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<String>,
    pub priority: Priority,
    pub send_after: Option<DateTime<Local>>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// UID of the remote copy, when one was captured
    pub remote_uid: Option<u32>,
    /// Folder holding the remote copy; INBOX when no Drafts folder existed
    pub remote_folder: Option<String>,
    /// Message-ID of the remote copy
    pub message_id: Option<String>,
}

impl Draft {
    /// Convert into a composable intent
    ///
    /// Drafts never carry HTML; signature and template follow the caller.
    pub fn to_intent(&self, include_signature: bool, use_template: bool) -> MessageIntent {
        MessageIntent {
            to: self.to.clone(),
            cc: self.cc.clone(),
            bcc: self.bcc.clone(),
            subject: self.subject.clone(),
            plain_body: self.body.clone(),
            html_body: None,
            attachments: self
                .attachments
                .iter()
                .map(|p| Attachment::Path(PathBuf::from(p)))
                .collect(),
            in_reply_to: self.in_reply_to.clone(),
            references: self.references.clone(),
            include_signature,
            use_template,
            priority: self.priority,
        }
    }

    /// Whether `send_after` lies in the future relative to `now`
    pub fn is_scheduled_after(&self, now: DateTime<Local>) -> bool {
        self.send_after.is_some_and(|at| at > now)
    }
}

/// Outcome of one transmission attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransportResult {
    Delivered {
        strategy: SmtpSecurity,
        response: String,
    },
    Failed {
        strategy: SmtpSecurity,
        detail: String,
        /// Alias-related explanation when the error matched known patterns
        diagnostic: Option<String>,
    },
}

impl TransportResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Outcome of mirroring a sent message into a remote Sent folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteSentOutcome {
    Appended { folder: String },
    NoFolder,
    Failed { error: String },
}

/// Outcome of the best-effort post-send checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verification {
    /// Found in the Sent folder, no bounce seen
    Confirmed { folder: String },
    /// Not found in any Sent folder within the search window
    NotFound,
    /// A bounce referencing this send arrived in the inbox
    Bounced {
        subject: String,
        failed_recipients: Vec<String>,
    },
    Skipped { reason: String },
}

/// Independent results of each post-send step
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub message_id: String,
    pub transport: TransportResult,
    /// Local Sent archive path or the error that prevented it
    pub local_archive: Result<PathBuf, String>,
    pub remote_sent: RemoteSentOutcome,
    pub verification: Verification,
}

impl Warnings for DeliveryReport {
    fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Err(e) = &self.local_archive {
            out.push(format!("local Sent archive failed: {e}"));
        }
        match &self.remote_sent {
            RemoteSentOutcome::Failed { error } => {
                out.push(format!("remote Sent copy failed: {error}"));
            }
            RemoteSentOutcome::NoFolder => out.push("no remote Sent folder found".to_owned()),
            RemoteSentOutcome::Appended { .. } => {}
        }
        match &self.verification {
            Verification::NotFound => {
                out.push("message not found in Sent folder; delivery unconfirmed".to_owned());
            }
            Verification::Bounced {
                failed_recipients, ..
            } => {
                let who = if failed_recipients.is_empty() {
                    "unknown recipients".to_owned()
                } else {
                    failed_recipients.join(", ")
                };
                out.push(format!("bounce detected for {who}"));
            }
            Verification::Confirmed { .. } | Verification::Skipped { .. } => {}
        }
        out
    }
}

/// Remote copy of a draft
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteDraft {
    pub folder: String,
    /// Captured after APPEND; `None` when the server could not be searched
    pub uid: Option<u32>,
    pub message_id: String,
}

/// Independent results of persisting a draft to both stores
#[derive(Debug, Clone, Serialize)]
pub struct DraftOutcome {
    pub local: Result<PathBuf, String>,
    pub remote: Result<RemoteDraft, String>,
}

impl DraftOutcome {
    pub fn fully_succeeded(&self) -> bool {
        self.local.is_ok() && self.remote.is_ok()
    }
}

impl Warnings for DraftOutcome {
    fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Err(e) = &self.local {
            out.push(format!("local draft not saved: {e}"));
        }
        match &self.remote {
            Err(e) => out.push(format!("remote draft not saved: {e}")),
            Ok(RemoteDraft { uid: None, folder, .. }) => {
                out.push(format!("draft UID in '{folder}' could not be determined"));
            }
            Ok(_) => {}
        }
        out
    }
}

/// Result of editing a remote draft
#[derive(Debug, Clone, Serialize)]
pub struct DraftEditOutcome {
    /// UID that no longer refers to the draft
    pub invalidated_uid: u32,
    /// Whether the old copy was removed; `false` leaves a duplicate behind
    pub old_copy_removed: Result<(), String>,
    pub created: DraftOutcome,
}

impl Warnings for DraftEditOutcome {
    fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Err(e) = &self.old_copy_removed {
            out.push(format!(
                "UID {} was not removed and may remain as a duplicate: {e}",
                self.invalidated_uid
            ));
        }
        out.extend(self.created.warnings());
        out
    }
}

/// A message removed with `\Deleted` + EXPUNGE
#[derive(Debug, Clone, Serialize)]
pub struct DeletedMessage {
    pub folder: String,
    pub uid: u32,
    pub subject: Option<String>,
    /// Correlated local draft file that was removed alongside
    pub local_removed: Option<PathBuf>,
}

impl Warnings for DeletedMessage {
    fn warnings(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Remote message summary for listings
#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    pub folder: String,
    pub uid: u32,
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub date: Option<String>,
    pub flags: Vec<String>,
    /// Decoded body text when requested
    pub body: Option<String>,
}

/// Local draft file entry for listings
#[derive(Debug, Clone, Serialize)]
pub struct LocalDraftEntry {
    pub path: PathBuf,
    pub draft: Draft,
}
