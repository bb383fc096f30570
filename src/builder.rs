//! Message composition
//!
//! Turns a [`MessageIntent`] into CRLF-terminated RFC 822/2045 bytes through
//! `lettre`'s message builder. The MIME shape follows the content: a single
//! `text/plain` part, a `multipart/alternative` when HTML exists, wrapped in
//! `multipart/mixed` when attachments exist. Attachments are read in full
//! before anything is sent anywhere.

use std::error::Error;
use std::path::Path;

use chrono::Utc;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{
    Attachment as AttachmentPart, Mailbox, Message, MessageBuilder, MultiPart, SinglePart,
};
use tracing::debug;

use crate::address;
use crate::config::AccountConfig;
use crate::errors::{AppError, AppResult};
use crate::message_id;
use crate::models::{Attachment, MessageIntent};
use crate::template::{self, Template};

const ATTRIBUTION_PLAIN: &str = "\n\nSent with mail-dispatch";
const ATTRIBUTION_HTML: &str = "<br><br>Sent with <em>mail-dispatch</em>";

/// Whether the message is going out or being parked as a draft
///
/// Drafts keep their `Bcc` header and are not decorated, so re-parsing one
/// recovers exactly what the author wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Send,
    Draft,
}

/// Visible sender identity
#[derive(Debug, Clone, Default)]
pub struct Sender {
    /// Address shown in `From` and used as the envelope sender
    pub address: String,
    pub display_name: Option<String>,
    pub signature: Option<String>,
}

impl Sender {
    /// Identity derived from an account, honoring its From override
    pub fn from_account(account: &AccountConfig) -> Self {
        Self {
            address: account.visible_from().to_owned(),
            display_name: account.from_name.clone(),
            signature: account.signature.clone(),
        }
    }

    fn mailbox(&self) -> AppResult<Mailbox> {
        let mut mailbox = address::mailboxes(&self.address)?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::invalid("sender address is empty"))?;
        if let Some(name) = self
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            mailbox.name = Some(name.to_owned());
        }
        Ok(mailbox)
    }
}

/// Send-time additions to the body
#[derive(Debug, Clone, Default)]
pub struct Decorations {
    /// Append the "Sent with" footer
    pub attribution: bool,
    pub template: Option<Template>,
    /// Pre-rendered `<img>` element for `{{PROFILE_IMAGE}}`
    pub profile_image_tag: String,
}

/// Wire-ready message
#[derive(Debug, Clone)]
pub struct BuiltMessage {
    /// RFC 822 bytes with CRLF line endings, ending in CRLF
    pub bytes: Vec<u8>,
    /// Generated `<...@domain>` identifier
    pub message_id: String,
    /// MAIL FROM address
    pub envelope_from: String,
    /// Bare RCPT TO addresses: To, then CC, then BCC
    pub recipients: Vec<String>,
    pub subject: String,
}

struct LoadedAttachment {
    filename: String,
    content_type: String,
    data: Vec<u8>,
}

/// `X-Priority`, which lettre has no typed header for
#[derive(Debug, Clone, PartialEq, Eq)]
struct XPriority(String);

impl Header for XPriority {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Priority")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(Self(s.to_owned()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// Compose a message
///
/// # Errors
///
/// - `InvalidInput` if there are no recipients, an address is malformed, a
///   header value contains a line break, or an attachment is missing or
///   unreadable
pub fn build(
    intent: &MessageIntent,
    sender: &Sender,
    decorations: &Decorations,
    mode: BuildMode,
) -> AppResult<BuiltMessage> {
    if intent.recipients().is_empty() {
        return Err(AppError::invalid("message has no recipients"));
    }
    if sender.address.trim().is_empty() {
        return Err(AppError::invalid("sender address is empty"));
    }
    for value in intent
        .to
        .iter()
        .chain(&intent.cc)
        .chain(&intent.bcc)
        .chain(std::iter::once(&intent.subject))
        .chain(std::iter::once(&sender.address))
        .chain(sender.display_name.iter())
    {
        validate_header_value(value)?;
    }

    let to = mailboxes(&intent.to)?;
    let cc = mailboxes(&intent.cc)?;
    let bcc = mailboxes(&intent.bcc)?;
    let recipients: Vec<String> = to
        .iter()
        .chain(&cc)
        .chain(&bcc)
        .map(|m| m.email.to_string())
        .collect();
    let from = sender.mailbox()?;

    let attachments = load_attachments(&intent.attachments)?;
    let (plain, html) = match mode {
        BuildMode::Send => decorate(intent, sender, decorations),
        BuildMode::Draft => (intent.plain_body.clone(), intent.html_body.clone()),
    };
    let html = html.filter(|h| !h.trim().is_empty());

    let message_id = message_id::generate(&sender.address);
    let mut builder = Message::builder()
        .from(from.clone())
        .subject(intent.subject.clone())
        .date_now()
        .message_id(Some(message_id.clone()));
    for mailbox in to {
        builder = builder.to(mailbox);
    }
    for mailbox in cc {
        builder = builder.cc(mailbox);
    }
    for mailbox in bcc {
        builder = builder.bcc(mailbox);
    }
    if mode == BuildMode::Draft {
        builder = builder.keep_bcc();
    }
    builder = thread(builder, intent)?;
    if let Some(priority) = intent.priority.header_value() {
        builder = builder.header(XPriority(priority.to_owned()));
    }

    let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let assembled = if attachments.is_empty() {
        match &html {
            Some(html) => builder.multipart(alternative(stamp, &plain, html)),
            None => builder.singlepart(SinglePart::plain(plain.clone())),
        }
    } else {
        let mut mixed = match &html {
            Some(html) => MultiPart::mixed()
                .boundary(format!("mixed-{stamp}"))
                .multipart(alternative(stamp, &plain, html)),
            None => MultiPart::mixed()
                .boundary(format!("mixed-{stamp}"))
                .singlepart(SinglePart::plain(plain.clone())),
        };
        for attachment in &attachments {
            mixed = mixed.singlepart(attachment_part(attachment)?);
        }
        builder.multipart(mixed)
    };
    let message = assembled
        .map_err(|e| AppError::invalid(format!("message could not be assembled: {e}")))?;

    let mut bytes = message.formatted();
    if !bytes.ends_with(b"\r\n") {
        bytes.extend_from_slice(b"\r\n");
    }

    debug!(
        message_id = %message_id,
        recipients = recipients.len(),
        attachments = attachments.len(),
        html = html.is_some(),
        bytes = bytes.len(),
        "message built"
    );

    Ok(BuiltMessage {
        bytes,
        message_id,
        envelope_from: from.email.to_string(),
        recipients,
        subject: intent.subject.clone(),
    })
}

fn mailboxes(list: &[String]) -> AppResult<Vec<Mailbox>> {
    let mut out = Vec::new();
    for entry in list.iter().filter(|e| !e.trim().is_empty()) {
        out.extend(address::mailboxes(entry)?);
    }
    Ok(out)
}

/// `In-Reply-To` and `References`, each id bracketed
fn thread(mut builder: MessageBuilder, intent: &MessageIntent) -> AppResult<MessageBuilder> {
    if let Some(parent) = intent.in_reply_to.as_deref()
        && let Some(id) = message_id::normalize(parent)?
    {
        builder = builder.in_reply_to(id);
    }
    let references: Vec<String> = intent
        .references
        .iter()
        .map(|r| message_id::normalize(r))
        .collect::<AppResult<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();
    if !references.is_empty() {
        builder = builder.references(message_id::references_header(&references));
    }
    Ok(builder)
}

fn alternative(stamp: i64, plain: &str, html: &str) -> MultiPart {
    MultiPart::alternative()
        .boundary(format!("alt-{stamp}"))
        .singlepart(SinglePart::plain(plain.to_owned()))
        .singlepart(SinglePart::html(html.to_owned()))
}

fn attachment_part(attachment: &LoadedAttachment) -> AppResult<SinglePart> {
    let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
        AppError::invalid(format!(
            "content type '{}' rejected: {e}",
            attachment.content_type
        ))
    })?;
    Ok(AttachmentPart::new(attachment.filename.clone()).body(attachment.data.clone(), content_type))
}

/// Apply signature, footer and template, in that order
fn decorate(
    intent: &MessageIntent,
    sender: &Sender,
    decorations: &Decorations,
) -> (String, Option<String>) {
    let mut plain = intent.plain_body.clone();
    let mut html = intent.html_body.clone().filter(|h| !h.trim().is_empty());

    if intent.include_signature
        && let Some(signature) = sender.signature.as_deref().filter(|s| !s.trim().is_empty())
    {
        let signature = if signature.starts_with('\n') {
            signature.to_owned()
        } else {
            format!("\n\n{signature}")
        };
        if let Some(h) = html.as_mut() {
            h.push_str(&template::plain_to_html(&signature));
        }
        plain.push_str(&signature);
    }

    if decorations.attribution {
        plain.push_str(ATTRIBUTION_PLAIN);
        if let Some(h) = html.as_mut() {
            h.push_str(ATTRIBUTION_HTML);
        }
    }

    if intent.use_template
        && let Some(template) = decorations.template.as_ref()
    {
        html = Some(template.render(&plain, html.as_deref(), &decorations.profile_image_tag));
    }

    (plain, html)
}

/// Read every attachment into memory
fn load_attachments(attachments: &[Attachment]) -> AppResult<Vec<LoadedAttachment>> {
    attachments
        .iter()
        .map(|attachment| match attachment {
            Attachment::Path(path) => {
                let data = std::fs::read(path).map_err(|e| {
                    AppError::invalid(format!("attachment {} unreadable: {e}", path.display()))
                })?;
                let filename = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("attachment")
                    .to_owned();
                Ok(LoadedAttachment {
                    content_type: content_type_for(path),
                    filename,
                    data,
                })
            }
            Attachment::Bytes { filename, data } => Ok(LoadedAttachment {
                content_type: content_type_for(Path::new(filename)),
                filename: filename.clone(),
                data: data.clone(),
            }),
        })
        .collect()
}

fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_owned()
}

/// Normalize raw message bytes to CRLF, leaving existing CRLF untouched
pub fn ensure_crlf(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + raw.len() / 32);
    let mut prev = 0u8;
    for &b in raw {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

fn validate_header_value(value: &str) -> AppResult<()> {
    if value.contains(['\r', '\n']) {
        return Err(AppError::invalid(format!(
            "header value must not contain line breaks: {value:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use mailparse::{DispositionType, MailHeaderMap};

    use super::{BuildMode, BuiltMessage, Decorations, Sender, build, ensure_crlf};
    use crate::models::{Attachment, MessageIntent, Priority};
    use crate::template::Template;

    fn sender() -> Sender {
        Sender {
            address: "me@example.com".into(),
            display_name: Some("Me".into()),
            signature: Some("-- \nMe".into()),
        }
    }

    fn intent(to: &str, body: &str) -> MessageIntent {
        MessageIntent {
            to: vec![to.into()],
            subject: "Greetings".into(),
            plain_body: body.into(),
            ..MessageIntent::default()
        }
    }

    fn text(msg: &BuiltMessage) -> String {
        String::from_utf8(msg.bytes.clone()).expect("utf8")
    }

    #[test]
    fn plain_only_message_is_a_single_text_part() {
        let msg = build(
            &intent("a@x.com", "Hello"),
            &sender(),
            &Decorations::default(),
            BuildMode::Send,
        )
        .expect("build");
        let raw = text(&msg);

        assert!(raw.contains("To: a@x.com\r\n"));
        assert!(raw.contains("MIME-Version: 1.0\r\n"));
        assert!(!raw.contains("multipart"));
        assert_eq!(msg.recipients, vec!["a@x.com"]);
        assert_eq!(msg.envelope_from, "me@example.com");

        let parsed = mailparse::parse_mail(&msg.bytes).expect("parse");
        assert!(parsed.subparts.is_empty());
        assert_eq!(parsed.ctype.mimetype, "text/plain");
        assert_eq!(parsed.ctype.charset.to_lowercase(), "utf-8");
        assert_eq!(parsed.get_body().expect("body").trim_end(), "Hello");
        assert_eq!(
            parsed.headers.get_first_value("Message-ID").as_deref(),
            Some(msg.message_id.as_str())
        );
    }

    #[test]
    fn html_body_yields_alternative_with_plain_first() {
        let mut i = intent("a@x.com", "plain text");
        i.html_body = Some("<p>rich</p>".into());
        let msg = build(&i, &sender(), &Decorations::default(), BuildMode::Send).expect("build");

        let parsed = mailparse::parse_mail(&msg.bytes).expect("parse");
        assert_eq!(parsed.ctype.mimetype, "multipart/alternative");
        assert!(parsed.ctype.params["boundary"].starts_with("alt-"));
        assert_eq!(parsed.subparts.len(), 2);
        assert_eq!(parsed.subparts[0].ctype.mimetype, "text/plain");
        assert_eq!(parsed.subparts[1].ctype.mimetype, "text/html");
        assert_eq!(parsed.subparts[1].get_body().expect("html").trim_end(), "<p>rich</p>");
    }

    #[test]
    fn attachment_yields_mixed_with_wrapped_base64() {
        let mut file = tempfile::Builder::new()
            .suffix(".pdf")
            .tempfile()
            .expect("tmp");
        let payload: Vec<u8> = (0..200u8).collect();
        file.write_all(&payload).expect("write");

        let mut i = intent("a@x.com", "see attached");
        i.html_body = Some("<p>see attached</p>".into());
        i.attachments = vec![Attachment::Path(file.path().to_path_buf())];
        let msg = build(&i, &sender(), &Decorations::default(), BuildMode::Send).expect("build");

        let parsed = mailparse::parse_mail(&msg.bytes).expect("parse");
        assert_eq!(parsed.ctype.mimetype, "multipart/mixed");
        assert!(parsed.ctype.params["boundary"].starts_with("mixed-"));
        assert_eq!(parsed.subparts[0].ctype.mimetype, "multipart/alternative");
        let att = &parsed.subparts[1];
        assert_eq!(att.ctype.mimetype, "application/pdf");
        assert_eq!(att.get_body_raw().expect("raw"), payload);

        let file_name = file
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .expect("name")
            .to_owned();
        let disposition = att.get_content_disposition();
        assert_eq!(disposition.disposition, DispositionType::Attachment);
        assert_eq!(disposition.params.get("filename"), Some(&file_name));
        assert!(text(&msg).lines().all(|l| l.len() <= 78));
    }

    #[test]
    fn unknown_extension_defaults_to_octet_stream() {
        let mut i = intent("a@x.com", "blob");
        i.attachments = vec![Attachment::Bytes {
            filename: "data.zzunknown".into(),
            data: vec![1, 2, 3],
        }];
        let msg = build(&i, &sender(), &Decorations::default(), BuildMode::Send).expect("build");
        let parsed = mailparse::parse_mail(&msg.bytes).expect("parse");
        assert_eq!(parsed.subparts[1].ctype.mimetype, "application/octet-stream");
    }

    #[test]
    fn every_shape_ends_with_crlf() {
        let plain = intent("a@x.com", "no trailing newline");
        let mut alternative = plain.clone();
        alternative.html_body = Some("<p>no trailing newline</p>".into());
        let mut mixed = alternative.clone();
        mixed.attachments = vec![Attachment::Bytes {
            filename: "notes.txt".into(),
            data: b"notes".to_vec(),
        }];

        for i in [plain, alternative, mixed] {
            let msg = build(&i, &sender(), &Decorations::default(), BuildMode::Send).expect("b");
            assert!(msg.bytes.ends_with(b"\r\n"), "{}", text(&msg));
        }
    }

    #[test]
    fn missing_attachment_and_empty_recipients_fail_before_io() {
        let mut i = intent("a@x.com", "x");
        i.attachments = vec![Attachment::Path("/nonexistent/file.txt".into())];
        let err = build(&i, &sender(), &Decorations::default(), BuildMode::Send)
            .expect_err("missing file");
        assert_eq!(err.code(), "invalid_input");

        let empty = MessageIntent::default();
        let err = build(&empty, &sender(), &Decorations::default(), BuildMode::Send)
            .expect_err("no recipients");
        assert!(err.to_string().contains("no recipients"));
    }

    #[test]
    fn header_injection_is_rejected() {
        let mut i = intent("a@x.com", "x");
        i.subject = "hi\r\nBcc: evil@x.com".into();
        assert!(build(&i, &sender(), &Decorations::default(), BuildMode::Send).is_err());
    }

    #[test]
    fn display_names_with_commas_stay_one_recipient() {
        let mut i = intent(r#""Doe, John" <d@x.com>"#, "x");
        i.cc = vec!["Ann <ann@x.com>, bob@x.com".into()];
        let msg = build(&i, &sender(), &Decorations::default(), BuildMode::Send).expect("b");
        assert_eq!(msg.recipients, vec!["d@x.com", "ann@x.com", "bob@x.com"]);

        let parsed = mailparse::parse_mail(&msg.bytes).expect("parse");
        let to = mailparse::addrparse_header(
            parsed.headers.get_first_header("To").expect("to"),
        )
        .expect("addresses");
        assert_eq!(to.len(), 1);
    }

    #[test]
    fn signature_and_footer_precede_template() {
        let mut i = intent("a@x.com", "Body");
        i.include_signature = true;
        i.use_template = true;
        let decorations = Decorations {
            attribution: true,
            template: Some(Template::new("<div>{{BODY}}</div>")),
            profile_image_tag: String::new(),
        };
        let msg = build(&i, &sender(), &decorations, BuildMode::Send).expect("build");
        let parsed = mailparse::parse_mail(&msg.bytes).expect("parse");

        let plain = parsed.subparts[0].get_body().expect("plain");
        assert!(plain.starts_with("Body\r\n\r\n-- \r\nMe"));
        assert!(plain.contains("Sent with mail-dispatch"));
        let html = parsed.subparts[1].get_body().expect("html");
        assert!(html.starts_with("<div>Body<br><br>--&#32;<br>Me"));
        assert!(html.trim_end().ends_with("</div>"));
    }

    #[test]
    fn drafts_keep_bcc_and_skip_decorations() {
        let mut i = intent("a@x.com", "Body");
        i.bcc = vec!["hidden@x.com".into()];
        i.include_signature = true;
        i.priority = Priority::High;
        let decorations = Decorations {
            attribution: true,
            ..Decorations::default()
        };

        let draft = text(&build(&i, &sender(), &decorations, BuildMode::Draft).expect("draft"));
        assert!(draft.contains("Bcc: hidden@x.com\r\n"));
        assert!(draft.contains("X-Priority: 1 (Highest)\r\n"));
        assert!(!draft.contains("Sent with"));

        let sent = build(&i, &sender(), &decorations, BuildMode::Send).expect("send");
        assert!(!text(&sent).contains("Bcc:"));
        assert_eq!(sent.recipients, vec!["a@x.com", "hidden@x.com"]);
    }

    #[test]
    fn threading_headers_are_bracketed() {
        let mut i = intent("a@x.com", "re");
        i.in_reply_to = Some("parent@x".into());
        i.references = vec!["gp@x".into(), "<parent@x>".into()];
        let raw = text(&build(&i, &sender(), &Decorations::default(), BuildMode::Send).expect("b"));
        assert!(raw.contains("In-Reply-To: <parent@x>\r\n"));
        assert!(raw.contains("References: <gp@x> <parent@x>\r\n"));
    }

    #[test]
    fn non_ascii_subject_and_body_are_encoded() {
        let mut i = intent("a@x.com", "Grüße");
        i.subject = "Überraschung".into();
        let msg = build(&i, &sender(), &Decorations::default(), BuildMode::Send).expect("b");
        assert!(msg.bytes.is_ascii());
        let parsed = mailparse::parse_mail(&msg.bytes).expect("parse");
        assert_eq!(
            parsed.headers.get_first_value("Subject").as_deref(),
            Some("Überraschung")
        );
        assert_eq!(parsed.get_body().expect("body").trim_end(), "Grüße");
    }

    #[test]
    fn bare_newlines_become_crlf() {
        assert_eq!(ensure_crlf(b"a\nb\r\nc"), b"a\r\nb\r\nc".to_vec());
    }
}
