//! Local file tree for sent mail and drafts
//!
//! Layout under the storage root:
//!
//! ```text
//! sent/sent_20250102_150405_Quarterly-plan.eml
//! drafts/001-Quarterly-plan-2025-01-02-150405.md
//! drafts/sent/     drafts delivered by `send-drafts`
//! drafts/failed/   drafts that could not be delivered
//! ```
//!
//! Draft files are Markdown with a frontmatter block. The block also records
//! the remote UID and Message-ID so a local draft stays correlated with its
//! server copy.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};
use tracing::{debug, warn};

use crate::address;
use crate::builder::BuiltMessage;
use crate::errors::{AppError, AppResult};
use crate::models::{Draft, LocalDraftEntry, Priority};

const SUBJECT_CHARS: usize = 50;

/// Root of the local mail tree
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sent_dir(&self) -> PathBuf {
        self.root.join("sent")
    }

    pub fn drafts_dir(&self) -> PathBuf {
        self.root.join("drafts")
    }

    /// Write the exact transmitted bytes to the Sent archive
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the directory or file cannot be written.
    pub fn archive_sent(&self, message: &BuiltMessage) -> AppResult<PathBuf> {
        let dir = self.sent_dir();
        fs::create_dir_all(&dir)?;
        let stem = format!(
            "sent_{}_{}",
            Local::now().format("%Y%m%d_%H%M%S"),
            sanitize_filename(&message.subject, "email")
        );
        let path = unique_path(&dir, &stem, "eml");
        fs::write(&path, &message.bytes)?;
        debug!(path = %path.display(), "sent message archived");
        Ok(path)
    }

    /// Create a new draft file
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the file cannot be written.
    pub fn write_draft(&self, draft: &Draft) -> AppResult<PathBuf> {
        let dir = self.drafts_dir();
        fs::create_dir_all(&dir)?;
        let index = draft_files(&dir)?.len() + 1;
        let stem = format!(
            "{index:03}-{}-{}",
            sanitize_filename(&draft.subject, "draft"),
            Local::now().format("%Y-%m-%d-%H%M%S")
        );
        let path = unique_path(&dir, &stem, "md");
        fs::write(&path, render_draft(draft))?;
        debug!(path = %path.display(), "draft written");
        Ok(path)
    }

    /// Replace an existing draft file's contents
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the file cannot be written.
    pub fn rewrite_draft(&self, path: &Path, draft: &Draft) -> AppResult<()> {
        fs::write(path, render_draft(draft))?;
        Ok(())
    }

    /// All parseable drafts, in filename order
    ///
    /// Unparseable files are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the directory cannot be read.
    pub fn list_drafts(&self) -> AppResult<Vec<LocalDraftEntry>> {
        let dir = self.drafts_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for path in draft_files(&dir)? {
            match read_draft(&path) {
                Ok(draft) => out.push(LocalDraftEntry { path, draft }),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable draft"),
            }
        }
        Ok(out)
    }

    /// Draft correlated with a remote UID or Message-ID
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the directory cannot be read.
    pub fn find_draft(
        &self,
        uid: Option<u32>,
        message_id: Option<&str>,
    ) -> AppResult<Option<LocalDraftEntry>> {
        Ok(self.list_drafts()?.into_iter().find(|entry| {
            let by_uid = uid.is_some() && entry.draft.remote_uid == uid;
            let by_id = message_id.is_some() && entry.draft.message_id.as_deref() == message_id;
            by_uid || by_id
        }))
    }

    /// Move a draft file into `drafts/<bucket>/`
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the move fails.
    pub fn file_draft(&self, path: &Path, bucket: &str) -> AppResult<PathBuf> {
        let dir = self.drafts_dir().join(bucket);
        fs::create_dir_all(&dir)?;
        let name = path
            .file_name()
            .ok_or_else(|| AppError::invalid(format!("not a draft file: {}", path.display())))?;
        let target = dir.join(name);
        fs::rename(path, &target)?;
        Ok(target)
    }

    /// Delete a draft file
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the file exists but cannot be removed.
    pub fn remove_draft(&self, path: &Path) -> AppResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Top-level `.md` files of the drafts directory, sorted
fn draft_files(dir: &Path) -> AppResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "md"))
        .collect();
    files.sort();
    Ok(files)
}

fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let mut path = dir.join(format!("{stem}.{ext}"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{stem}-{n}.{ext}"));
        n += 1;
    }
    path
}

/// Filesystem-safe slug of a subject
///
/// Keeps ASCII alphanumerics, `-` and `_`; spaces become `-`; everything
/// else is dropped. At most 50 characters; `fallback` when nothing remains.
pub fn sanitize_filename(subject: &str, fallback: &str) -> String {
    let slug: String = subject
        .chars()
        .filter_map(|c| match c {
            ' ' => Some('-'),
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => Some(c),
            _ => None,
        })
        .take(SUBJECT_CHARS)
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        fallback.to_owned()
    } else {
        slug.to_owned()
    }
}

/// Read and parse one draft file
///
/// # Errors
///
/// `Internal` for I/O failures, `InvalidInput` for malformed frontmatter.
pub fn read_draft(path: &Path) -> AppResult<Draft> {
    let text = fs::read_to_string(path)?;
    parse_draft(&text)
}

/// Render a draft as frontmatter plus body
pub fn render_draft(draft: &Draft) -> String {
    let mut out = String::from("---\n");
    let list = |l: &[String]| quote_scalar(&address::format_list(l));
    out.push_str(&format!("to: {}\n", list(&draft.to)));
    if !draft.cc.is_empty() {
        out.push_str(&format!("cc: {}\n", list(&draft.cc)));
    }
    if !draft.bcc.is_empty() {
        out.push_str(&format!("bcc: {}\n", list(&draft.bcc)));
    }
    out.push_str(&format!("subject: {}\n", quote_scalar(&draft.subject)));
    if !draft.attachments.is_empty() {
        out.push_str("attachments:\n");
        for attachment in &draft.attachments {
            out.push_str(&format!("  - {}\n", quote_scalar(attachment)));
        }
    }
    if let Some(at) = draft.send_after {
        out.push_str(&format!("send_after: {}\n", at.format("%Y-%m-%d %H:%M:%S")));
    }
    if draft.priority != Priority::Normal {
        out.push_str(&format!("priority: {}\n", draft.priority));
    }
    if let Some(parent) = &draft.in_reply_to {
        out.push_str(&format!("in_reply_to: {parent}\n"));
    }
    if !draft.references.is_empty() {
        out.push_str(&format!("references: {}\n", draft.references.join(" ")));
    }
    if let Some(uid) = draft.remote_uid {
        out.push_str(&format!("remote_uid: {uid}\n"));
    }
    if let Some(folder) = &draft.remote_folder {
        out.push_str(&format!("remote_folder: {}\n", quote_scalar(folder)));
    }
    if let Some(id) = &draft.message_id {
        out.push_str(&format!("message_id: {id}\n"));
    }
    out.push_str("---\n\n");
    out.push_str(&draft.body);
    if !draft.body.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Parse frontmatter plus body
///
/// A file without a frontmatter block is all body.
///
/// # Errors
///
/// `InvalidInput` for an unterminated block or malformed values.
pub fn parse_draft(text: &str) -> AppResult<Draft> {
    let text = text.replace("\r\n", "\n");
    let Some(rest) = text.strip_prefix("---\n") else {
        return Ok(Draft {
            body: text.trim_end_matches('\n').to_owned(),
            ..Draft::default()
        });
    };
    let (block, body) = if let Some(body) = rest.strip_prefix("---\n") {
        ("", body)
    } else {
        match rest.find("\n---\n") {
            Some(idx) => (&rest[..idx], &rest[idx + 5..]),
            None => match rest.strip_suffix("\n---") {
                Some(block) => (block, ""),
                None => return Err(AppError::invalid("unterminated frontmatter block")),
            },
        }
    };

    let mut draft = Draft {
        body: body
            .strip_prefix('\n')
            .unwrap_or(body)
            .trim_end_matches('\n')
            .to_owned(),
        ..Draft::default()
    };

    let mut lines = block.lines().peekable();
    while let Some(line) = lines.next() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(AppError::invalid(format!("malformed frontmatter line '{line}'")));
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match key.as_str() {
            "to" => draft.to = parse_addresses(value),
            "cc" => draft.cc = parse_addresses(value),
            "bcc" => draft.bcc = parse_addresses(value),
            "subject" => draft.subject = unquote(value),
            "attachments" => {
                if value.is_empty() {
                    while let Some(item) = lines.peek().and_then(|l| l.trim_start().strip_prefix("- ")) {
                        draft.attachments.push(unquote(item.trim()));
                        lines.next();
                    }
                } else {
                    draft.attachments = parse_list(value);
                }
            }
            "send_after" => {
                let value = unquote(value);
                if !value.is_empty() {
                    draft.send_after = Some(parse_send_after(&value)?);
                }
            }
            "priority" => draft.priority = unquote(value).parse()?,
            "in_reply_to" => {
                draft.in_reply_to = Some(unquote(value)).filter(|v| !v.is_empty());
            }
            "references" => {
                draft.references = unquote(value)
                    .split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|r| !r.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            "remote_uid" => {
                let value = unquote(value);
                draft.remote_uid = Some(value.parse::<u32>().map_err(|_| {
                    AppError::invalid(format!("invalid remote_uid '{value}'"))
                })?);
            }
            "message_id" => draft.message_id = Some(unquote(value)).filter(|v| !v.is_empty()),
            "remote_folder" => {
                draft.remote_folder = Some(unquote(value)).filter(|v| !v.is_empty());
            }
            other => debug!(key = other, "ignoring unknown frontmatter key"),
        }
    }
    Ok(draft)
}

/// Comma list, optionally written `[a, b]`; quoted items keep their commas
fn parse_list(value: &str) -> Vec<String> {
    let value = value.trim();
    let inner = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or(value);
    split_items(inner)
        .iter()
        .map(|item| unquote(item))
        .filter(|item| !item.is_empty())
        .collect()
}

/// Address list as a scalar (`a, "Doe, J" <j@x>`) or as `[a, b]`
fn parse_addresses(value: &str) -> Vec<String> {
    if value.starts_with('[') && value.ends_with(']') {
        return parse_list(value)
            .iter()
            .flat_map(|item| address::split_list(item))
            .collect();
    }
    address::split_list(&unquote(value))
}

/// Split on commas outside quoted strings
fn split_items(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for ch in value.chars() {
        match (quote, ch) {
            _ if escaped => escaped = false,
            (Some('"'), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (None, '"' | '\'') => quote = Some(ch),
            (None, ',') => {
                items.push(current.trim().to_owned());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    items.push(current.trim().to_owned());
    items.retain(|item| !item.is_empty());
    items
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        let inner = &value[1..value.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some(other) => out.push(other),
                    None => out.push('\\'),
                }
            } else {
                out.push(c);
            }
        }
        return out;
    }
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        return value[1..value.len() - 1].replace("''", "'");
    }
    value.to_owned()
}

/// Quote a scalar when it would otherwise be read back differently
fn quote_scalar(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value != value.trim()
        || value.starts_with(['"', '\'', '[', '#', '-'])
        || value.contains(": ")
        || value.contains(',');
    if needs_quotes {
        format!(
            "\"{}\"",
            value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n")
        )
    } else {
        value.to_owned()
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD HH:MM`, `YYYY-MM-DD`
///
/// # Errors
///
/// `InvalidInput` for any other form.
pub fn parse_send_after(value: &str) -> AppResult<DateTime<Local>> {
    let value = value.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Local));
    }
    let naive = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| AppError::invalid(format!("invalid send_after '{value}'")))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| AppError::invalid(format!("send_after '{value}' does not exist locally")))
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::{LocalStore, parse_draft, parse_send_after, render_draft, sanitize_filename};
    use crate::builder::BuiltMessage;
    use crate::models::{Draft, Priority};

    #[test]
    fn subjects_become_safe_slugs() {
        assert_eq!(sanitize_filename("Hello, World: Q3/Q4 plan!", "draft"), "Hello-World-Q3Q4-plan");
        assert_eq!(sanitize_filename("???", "draft"), "draft");
        assert_eq!(sanitize_filename(&"x".repeat(80), "draft").len(), 50);
    }

    #[test]
    fn frontmatter_parses_block_lists_and_quoted_values() {
        let text = "---\nto: a@x.com, \"Doe\" <d@x.com>\ncc: [c@x.com]\nsubject: \"Re: plan, v2\"\nattachments:\n  - /tmp/a.pdf\n  - \"/tmp/b c.txt\"\nsend_after: 2030-05-06 07:08\npriority: HIGH\nremote_uid: 42\n---\n\nHello\nthere\n";
        let draft = parse_draft(text).expect("parse");
        assert_eq!(draft.to, vec!["a@x.com", "Doe <d@x.com>"]);
        assert_eq!(draft.cc, vec!["c@x.com"]);
        assert_eq!(draft.subject, "Re: plan, v2");
        assert_eq!(draft.attachments, vec!["/tmp/a.pdf", "/tmp/b c.txt"]);
        assert_eq!(draft.priority, Priority::High);
        assert_eq!(draft.remote_uid, Some(42));
        assert_eq!(draft.body, "Hello\nthere");
        let at = draft.send_after.expect("send_after");
        assert_eq!((at.year(), at.month(), at.day(), at.hour(), at.minute()), (2030, 5, 6, 7, 8));
    }

    #[test]
    fn rendered_drafts_parse_back() {
        let draft = Draft {
            to: vec!["a@x.com".into()],
            bcc: vec!["b@x.com".into()],
            subject: "Plan: next steps, maybe".into(),
            body: "Body text".into(),
            attachments: vec!["/tmp/file.txt".into()],
            priority: Priority::Low,
            in_reply_to: Some("<p@x>".into()),
            references: vec!["<gp@x>".into(), "<p@x>".into()],
            remote_uid: Some(7),
            remote_folder: Some("INBOX".into()),
            message_id: Some("<m@x>".into()),
            ..Draft::default()
        };
        assert_eq!(parse_draft(&render_draft(&draft)).expect("parse"), draft);
    }

    #[test]
    fn display_names_with_commas_survive_a_round_trip() {
        let draft = Draft {
            to: vec![r#""Doe, John" <d@x.com>"#.into(), "e@x.com".into()],
            cc: vec![r#""Roe, Ann" <r@x.com>"#.into()],
            subject: "Hi".into(),
            body: "b".into(),
            ..Draft::default()
        };
        let rendered = render_draft(&draft);
        assert!(rendered.contains(r#"to: "\"Doe, John\" <d@x.com>, e@x.com""#));
        assert_eq!(parse_draft(&rendered).expect("parse"), draft);

        let inline = "---\nto: [\"\\\"Doe, John\\\" <d@x.com>\", e@x.com]\nattachments: [\"/tmp/a, b.txt\", /tmp/c.txt]\n---\n";
        let parsed = parse_draft(inline).expect("inline");
        assert_eq!(parsed.to, draft.to);
        assert_eq!(parsed.attachments, vec!["/tmp/a, b.txt", "/tmp/c.txt"]);
    }

    #[test]
    fn send_after_formats() {
        assert!(parse_send_after("2030-01-02T03:04:05Z").is_ok());
        assert!(parse_send_after("2030-01-02 03:04:05").is_ok());
        assert_eq!(parse_send_after("2030-01-02").expect("date").hour(), 0);
        assert!(parse_send_after("next tuesday").is_err());
    }

    #[test]
    fn missing_frontmatter_is_all_body_and_unterminated_is_rejected() {
        assert_eq!(parse_draft("just text\n").expect("body").body, "just text");
        assert!(parse_draft("---\nto: a@x.com\n").is_err());
    }

    #[test]
    fn drafts_are_numbered_listed_and_correlated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());
        let first = Draft {
            to: vec!["a@x.com".into()],
            subject: "First one".into(),
            ..Draft::default()
        };
        let second = Draft {
            subject: "Second".into(),
            remote_uid: Some(99),
            ..first.clone()
        };
        let p1 = store.write_draft(&first).expect("write");
        let p2 = store.write_draft(&second).expect("write");
        let name = p1.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("001-First-one-"), "{name}");
        assert!(p2.file_name().and_then(|n| n.to_str()).expect("name").starts_with("002-Second-"));

        let listed = store.list_drafts().expect("list");
        assert_eq!(listed.len(), 2);
        let found = store.find_draft(Some(99), None).expect("find").expect("some");
        assert_eq!(found.path, p2);

        let moved = store.file_draft(&p1, "sent").expect("move");
        assert!(moved.starts_with(dir.path().join("drafts").join("sent")));
        assert_eq!(store.list_drafts().expect("list").len(), 1);
    }

    #[test]
    fn sent_archive_holds_exact_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());
        let message = BuiltMessage {
            bytes: b"Subject: Hi\r\n\r\nHello".to_vec(),
            message_id: "<m@x>".into(),
            envelope_from: "me@x.com".into(),
            recipients: vec!["a@x.com".into()],
            subject: "Hi there".into(),
        };
        let path = store.archive_sent(&message).expect("archive");
        let name = path.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("sent_") && name.ends_with("_Hi-there.eml"), "{name}");
        assert_eq!(std::fs::read(&path).expect("read"), message.bytes);
    }
}
