//! Message parsing and MIME handling
//!
//! Parses RFC822 messages using `mailparse`, extracts body text/HTML and
//! attachments, and reconstructs drafts from what a mail server hands back.

use std::collections::BTreeMap;

use mailparse::{DispositionType, MailHeader, MailHeaderMap, ParsedMail};

use crate::address;
use crate::errors::{AppError, AppResult};
use crate::message_id;
use crate::models::{Attachment, Draft, Priority};

/// Parsed message representation
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub subject: Option<String>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub priority: Option<String>,
    /// One entry per mailbox in `To`, `Cc` and `Bcc`
    pub to_list: Vec<String>,
    pub cc_list: Vec<String>,
    pub bcc_list: Vec<String>,
    /// All headers as key-value pairs
    pub headers_all: Vec<(String, String)>,
    /// First non-attachment `text/plain` part
    pub body_text: Option<String>,
    /// First non-attachment `text/html` part, unsanitized
    pub body_html: Option<String>,
    pub attachments: Vec<ParsedAttachment>,
}

/// Decoded attachment
#[derive(Debug, Clone)]
pub struct ParsedAttachment {
    pub filename: Option<String>,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Parse RFC822 message into structured representation
///
/// # Errors
///
/// - `Internal` if `mailparse` fails
pub fn parse_message(raw: &[u8]) -> AppResult<ParsedMessage> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse RFC822 message: {e}")))?;

    let headers = parse_all_headers(raw)?;
    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();

    walk_parts(&parsed, &mut body_text, &mut body_html, &mut attachments)?;

    let header_map = to_header_map(&headers);
    let get = |key: &str| header_map.get(key).cloned();
    let list = |key: &str| {
        parsed
            .headers
            .get_first_header(key)
            .map(address::from_header)
            .unwrap_or_default()
    };
    Ok(ParsedMessage {
        date: get("date"),
        from: get("from"),
        to: get("to"),
        cc: get("cc"),
        bcc: get("bcc"),
        subject: get("subject"),
        message_id: get("message-id"),
        in_reply_to: get("in-reply-to"),
        references: get("references"),
        priority: get("x-priority"),
        to_list: list("To"),
        cc_list: list("Cc"),
        bcc_list: list("Bcc"),
        headers_all: headers,
        body_text,
        body_html,
        attachments,
    })
}

impl ParsedMessage {
    /// Readable body: plain text, or HTML rendered to text
    pub fn display_body(&self) -> Option<String> {
        if let Some(text) = self.body_text.as_ref().filter(|t| !t.trim().is_empty()) {
            return Some(normalize_body(text));
        }
        self.body_html.as_ref().map(|html| {
            html2text::from_read(html.as_bytes(), 80).unwrap_or_else(|_| html.clone())
        })
    }

    /// Threading headers of this message
    pub fn parent_headers(&self) -> message_id::ParentHeaders {
        message_id::ParentHeaders {
            message_id: self.message_id.clone(),
            in_reply_to: self.in_reply_to.clone(),
            references: self
                .references
                .as_deref()
                .map(message_id::parse_list)
                .unwrap_or_default(),
        }
    }

    /// Reconstruct a draft, carrying attachments as in-memory bytes
    ///
    /// Line endings become `\n` and trailing blank lines are dropped.
    pub fn to_draft(&self) -> (Draft, Vec<Attachment>) {
        let draft = Draft {
            to: self.to_list.clone(),
            cc: self.cc_list.clone(),
            bcc: self.bcc_list.clone(),
            subject: self.subject.clone().unwrap_or_default(),
            body: self.display_body().unwrap_or_default(),
            attachments: Vec::new(),
            priority: self
                .priority
                .as_deref()
                .map(Priority::from_header)
                .unwrap_or_default(),
            send_after: None,
            in_reply_to: self
                .in_reply_to
                .as_deref()
                .and_then(|v| message_id::parse_list(v).into_iter().next()),
            references: self
                .references
                .as_deref()
                .map(message_id::parse_list)
                .unwrap_or_default(),
            remote_uid: None,
            remote_folder: None,
            message_id: self.message_id.clone(),
        };
        (draft, self.attachment_bytes())
    }

    /// Attachments as in-memory parts, unnamed ones numbered from 1
    pub fn attachment_bytes(&self) -> Vec<Attachment> {
        self.attachments
            .iter()
            .enumerate()
            .map(|(idx, a)| Attachment::Bytes {
                filename: a
                    .filename
                    .clone()
                    .unwrap_or_else(|| format!("attachment-{}", idx + 1)),
                data: a.data.clone(),
            })
            .collect()
    }
}

/// Walk MIME part tree recursively
///
/// Collects the first text/plain and text/html bodies and every attachment.
fn walk_parts(
    part: &ParsedMail<'_>,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<ParsedAttachment>,
) -> AppResult<()> {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disp = part.get_content_disposition();
        let filename = attachment_filename(part, &disp.params);
        let is_attachment = disp.disposition == DispositionType::Attachment || filename.is_some();

        if is_attachment {
            let data = part
                .get_body_raw()
                .map_err(|e| AppError::Internal(format!("failed decoding attachment body: {e}")))?;
            attachments.push(ParsedAttachment {
                filename,
                content_type: ctype,
                data,
            });
            return Ok(());
        }

        if ctype == "text/plain"
            && body_text.is_none()
            && let Ok(text) = part.get_body()
        {
            *body_text = Some(text);
        }

        if ctype == "text/html"
            && body_html.is_none()
            && let Ok(html) = part.get_body()
        {
            *body_html = Some(html);
        }

        return Ok(());
    }

    for sub in &part.subparts {
        walk_parts(sub, body_text, body_html, attachments)?;
    }
    Ok(())
}

/// Extract attachment filename from part
///
/// Checks Content-Disposition parameter first, falls back to Content-Type
/// name parameter.
fn attachment_filename(
    part: &ParsedMail<'_>,
    disp_params: &BTreeMap<String, String>,
) -> Option<String> {
    disp_params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

/// Parse all headers from raw message
fn parse_all_headers(raw: &[u8]) -> AppResult<Vec<(String, String)>> {
    let (headers, _) = mailparse::parse_headers(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse message headers: {e}")))?;
    Ok(to_tuples(headers))
}

/// Convert mailparse headers to tuples
fn to_tuples(headers: Vec<MailHeader<'_>>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect()
}

/// Convert header tuples to case-insensitive map
///
/// Returns first value for each header key (case-insensitive).
fn to_header_map(headers: &[(String, String)]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (k, v) in headers {
        let key = k.to_ascii_lowercase();
        map.entry(key).or_insert_with(|| v.clone());
    }
    map
}

/// `\n` line endings, no trailing blank lines
pub fn normalize_body(text: &str) -> String {
    text.replace("\r\n", "\n")
        .trim_end_matches(['\n', '\r'])
        .to_owned()
}
