//! mail-dispatch: personal email from the command line
//!
//! Composes MIME messages, sends them over SMTP with the configured security
//! mode, mirrors them into the server's Sent folder, checks for bounces, and
//! keeps drafts in sync between a local directory and the IMAP Drafts folder.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading and argument parsing
//! - [`config`]: Environment-driven account and pipeline configuration
//! - [`providers`]: Well-known SMTP/IMAP endpoints and security modes
//! - [`address`]: Address list parsing and formatting
//! - [`errors`]: Application error model with stable codes and exit statuses
//! - [`builder`]: MIME composition with signature, footer and template
//! - [`transport`]: SMTP transmission and alias diagnostics
//! - [`verify`]: Sent archiving, remote Sent append and bounce detection
//! - [`drafts`]: Local/remote draft create, list, edit and delete
//! - [`folders`]: Sent/Drafts folder discovery
//! - [`imap`]: IMAP session operations with timeout wrappers
//! - [`local_store`]: Local Sent archive and Markdown draft files
//! - [`commands`]: Command handlers producing report envelopes
//! - [`models`]: Domain types and serializable reports
//! - [`mime`]: Message parsing and body extraction
//! - [`message_id`]: Message-ID generation and reply threading
//! - [`template`]: HTML template rendering

mod address;
mod builder;
mod commands;
mod config;
mod drafts;
mod errors;
mod folders;
mod imap;
mod local_store;
mod message_id;
mod mime;
mod models;
mod providers;
mod template;
#[cfg(test)]
mod test_support;
mod transport;
mod verify;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use commands::{
    Dispatcher, DraftFilter, ForwardRequest, MessageRef, ReplyRequest, SendDraftsRequest,
    SendFileRequest,
};
use config::AppConfig;
use drafts::DraftChanges;
use errors::{AppError, AppResult};
use models::{Attachment, CommandReport, Draft, MessageIntent, Priority};

#[derive(Parser, Debug)]
#[command(name = "mail-dispatch", version, about, long_about = None)]
struct Cli {
    /// Account to use; defaults to `default` or the only configured account
    #[arg(long, global = true)]
    account: Option<String>,

    /// Print the full JSON report instead of the summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compose and send a message
    Send(SendArgs),
    /// Reply to a message by UID or Message-ID
    Reply(ReplyArgs),
    /// Forward a message and its attachments
    Forward(ForwardArgs),
    /// Send a Markdown file; frontmatter fields win over flags
    SendFile(SendFileArgs),
    /// Send every due local draft
    SendDrafts(SendDraftsArgs),
    /// Manage drafts
    #[command(subcommand)]
    Draft(DraftCommand),
    /// Delete a message from a folder
    Delete {
        #[arg(long, default_value = "INBOX")]
        folder: String,
        uid: u32,
    },
}

#[derive(Subcommand, Debug)]
enum DraftCommand {
    /// Save a draft locally and to the server
    Create(DraftCreateArgs),
    /// List local drafts, and remote ones with --remote
    List {
        #[arg(long)]
        remote: bool,
        /// Include decoded bodies of remote drafts
        #[arg(long)]
        body: bool,
    },
    /// Replace a remote draft; its UID changes
    Edit(DraftEditArgs),
    /// Delete a remote draft and its local file
    Delete { uid: u32 },
}

#[derive(Args, Debug)]
struct BodyArgs {
    /// Plain-text body
    #[arg(long, conflicts_with = "body_file")]
    body: Option<String>,
    /// Read the plain-text body from a file
    #[arg(long)]
    body_file: Option<PathBuf>,
}

impl BodyArgs {
    fn read(&self) -> AppResult<Option<String>> {
        match (&self.body, &self.body_file) {
            (Some(body), _) => Ok(Some(body.clone())),
            (None, Some(path)) => std::fs::read_to_string(path).map(Some).map_err(|e| {
                AppError::invalid(format!("cannot read body file {}: {e}", path.display()))
            }),
            (None, None) => Ok(None),
        }
    }
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long, value_delimiter = ',', required = true)]
    to: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    cc: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    bcc: Vec<String>,
    #[arg(long, short)]
    subject: String,
    #[command(flatten)]
    body: BodyArgs,
    /// HTML alternative read from a file
    #[arg(long)]
    html_file: Option<PathBuf>,
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,
    #[arg(long, default_value = "normal")]
    priority: Priority,
    /// Parent Message-ID for threading
    #[arg(long)]
    in_reply_to: Option<String>,
    #[arg(long)]
    no_signature: bool,
    #[arg(long)]
    no_template: bool,
}

impl SendArgs {
    fn into_intent(self) -> AppResult<MessageIntent> {
        let html_body = match &self.html_file {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                AppError::invalid(format!("cannot read HTML file {}: {e}", path.display()))
            })?),
            None => None,
        };
        let in_reply_to = self.in_reply_to.clone();
        Ok(MessageIntent {
            plain_body: self.body.read()?.unwrap_or_default(),
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            subject: self.subject,
            html_body,
            attachments: self.attachments.into_iter().map(Attachment::Path).collect(),
            references: in_reply_to.iter().cloned().collect(),
            in_reply_to,
            include_signature: !self.no_signature,
            use_template: !self.no_template,
            priority: self.priority,
        })
    }
}

/// Selects the message a reply or forward refers to
#[derive(Args, Debug)]
struct TargetArgs {
    #[arg(required_unless_present = "message_id", conflicts_with = "message_id")]
    uid: Option<u32>,
    /// Look the message up by its Message-ID instead of a UID
    #[arg(long)]
    message_id: Option<String>,
    #[arg(long, default_value = "INBOX")]
    folder: String,
}

impl TargetArgs {
    fn target(&self) -> AppResult<MessageRef> {
        match (self.uid, &self.message_id) {
            (Some(uid), _) => Ok(MessageRef::Uid(uid)),
            (None, Some(id)) => Ok(MessageRef::MessageId(id.clone())),
            (None, None) => Err(AppError::invalid("a UID or --message-id is required")),
        }
    }
}

#[derive(Args, Debug)]
struct ReplyArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Also reply to the other To recipients
    #[arg(long)]
    all: bool,
    /// Replace the derived recipients
    #[arg(long, value_delimiter = ',')]
    to: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    cc: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    bcc: Vec<String>,
    /// Replace the `Re:` subject
    #[arg(long, short)]
    subject: Option<String>,
    // without a body the original message is quoted
    #[command(flatten)]
    body: BodyArgs,
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,
    #[arg(long, default_value = "normal")]
    priority: Priority,
    /// Save the reply as a draft instead of sending it
    #[arg(long)]
    draft: bool,
    #[arg(long)]
    no_signature: bool,
    #[arg(long)]
    no_template: bool,
}

#[derive(Args, Debug)]
struct ForwardArgs {
    #[command(flatten)]
    target: TargetArgs,
    #[arg(long, value_delimiter = ',', required = true)]
    to: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    cc: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    bcc: Vec<String>,
    /// Replace the `Fwd:` subject
    #[arg(long, short)]
    subject: Option<String>,
    // note placed above the forwarded message
    #[command(flatten)]
    body: BodyArgs,
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,
    #[arg(long, default_value = "normal")]
    priority: Priority,
    /// Save the forward as a draft instead of sending it
    #[arg(long)]
    draft: bool,
    #[arg(long)]
    no_signature: bool,
    #[arg(long)]
    no_template: bool,
}

#[derive(Args, Debug)]
struct SendFileArgs {
    path: PathBuf,
    /// Used when the frontmatter has no `to`
    #[arg(long, value_delimiter = ',')]
    to: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    cc: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    bcc: Vec<String>,
    #[arg(long, short)]
    subject: Option<String>,
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,
    #[arg(long)]
    no_signature: bool,
    #[arg(long)]
    no_template: bool,
}

#[derive(Args, Debug)]
struct SendDraftsArgs {
    /// Only drafts matching `priority:<level>`, `to:<text>` or `subject:<text>`
    #[arg(long)]
    filter: Option<DraftFilter>,
    /// Report what would be sent without sending
    #[arg(long)]
    dry_run: bool,
    /// Delete sent drafts instead of moving them to drafts/sent
    #[arg(long)]
    delete_sent: bool,
}

#[derive(Args, Debug)]
struct DraftCreateArgs {
    #[arg(long, value_delimiter = ',', required = true)]
    to: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    cc: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    bcc: Vec<String>,
    #[arg(long, short, default_value = "")]
    subject: String,
    #[command(flatten)]
    body: BodyArgs,
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,
    #[arg(long, default_value = "normal")]
    priority: Priority,
    /// Earliest send time for `send-drafts` (`YYYY-MM-DD HH:MM` or RFC 3339)
    #[arg(long)]
    send_after: Option<String>,
}

#[derive(Args, Debug)]
struct DraftEditArgs {
    uid: u32,
    #[arg(long, value_delimiter = ',')]
    to: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    cc: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    bcc: Option<Vec<String>>,
    #[arg(long, short)]
    subject: Option<String>,
    #[command(flatten)]
    body: BodyArgs,
    /// Replace all attachments
    #[arg(long = "attach")]
    attachments: Option<Vec<PathBuf>>,
    #[arg(long)]
    priority: Option<Priority>,
}

fn path_strings(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| p.display().to_string()).collect()
}

/// Application entry point
///
/// Loads `.env`, initializes tracing on stderr, and runs one command. The
/// exit status is 0 on success, 2 for input or configuration errors and 1
/// for everything else.
///
/// # Environment Variables
///
/// See [`AppConfig::load_from_env`] for configuration options.
#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.json;
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                let body = serde_json::json!({
                    "error": { "code": e.code(), "message": e.to_string() }
                });
                println!("{body}");
            } else {
                eprintln!("error: {e}");
            }
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> AppResult<()> {
    let config = AppConfig::load_from_env()?;
    let account = config.get_account(cli.account.as_deref())?;
    let dispatcher = Dispatcher::for_account(&config, account);
    let json = cli.json;

    match cli.command {
        Command::Send(args) => emit(&dispatcher.send(args.into_intent()?).await?, json),
        Command::Reply(args) => {
            let request = ReplyRequest {
                target: args.target.target()?,
                folder: args.target.folder,
                body: args.body.read()?,
                all: args.all,
                to: args.to,
                cc: args.cc,
                bcc: args.bcc,
                subject: args.subject,
                attachments: args.attachments,
                include_signature: !args.no_signature,
                use_template: !args.no_template,
                priority: args.priority,
                as_draft: args.draft,
            };
            emit(&dispatcher.reply(request).await?, json)
        }
        Command::Forward(args) => {
            let request = ForwardRequest {
                target: args.target.target()?,
                folder: args.target.folder,
                body: args.body.read()?,
                to: args.to,
                cc: args.cc,
                bcc: args.bcc,
                subject: args.subject,
                attachments: args.attachments,
                include_signature: !args.no_signature,
                use_template: !args.no_template,
                priority: args.priority,
                as_draft: args.draft,
            };
            emit(&dispatcher.forward(request).await?, json)
        }
        Command::SendFile(args) => {
            let request = SendFileRequest {
                path: args.path,
                to: args.to,
                cc: args.cc,
                bcc: args.bcc,
                subject: args.subject,
                attachments: args.attachments,
                include_signature: !args.no_signature,
                use_template: !args.no_template,
            };
            emit(&dispatcher.send_file(request).await?, json)
        }
        Command::SendDrafts(args) => {
            let request = SendDraftsRequest {
                filter: args.filter,
                dry_run: args.dry_run,
                delete_sent: args.delete_sent,
            };
            emit(&dispatcher.send_drafts(request).await?, json)
        }
        Command::Draft(DraftCommand::Create(args)) => {
            let send_after = args
                .send_after
                .as_deref()
                .map(local_store::parse_send_after)
                .transpose()?;
            let draft = Draft {
                body: args.body.read()?.unwrap_or_default(),
                to: args.to,
                cc: args.cc,
                bcc: args.bcc,
                subject: args.subject,
                attachments: path_strings(&args.attachments),
                priority: args.priority,
                send_after,
                ..Draft::default()
            };
            emit(&dispatcher.draft_create(draft).await?, json)
        }
        Command::Draft(DraftCommand::List { remote, body }) => {
            emit(&dispatcher.draft_list(remote, body).await?, json)
        }
        Command::Draft(DraftCommand::Edit(args)) => {
            let changes = DraftChanges {
                body: args.body.read()?,
                to: args.to,
                cc: args.cc,
                bcc: args.bcc,
                subject: args.subject,
                attachments: args.attachments.as_deref().map(path_strings),
                priority: args.priority,
            };
            emit(&dispatcher.draft_edit(args.uid, changes).await?, json)
        }
        Command::Draft(DraftCommand::Delete { uid }) => {
            emit(&dispatcher.draft_delete(uid).await?, json)
        }
        Command::Delete { folder, uid } => emit(&dispatcher.delete(&folder, uid).await?, json),
    }
}

/// Print a report as JSON or as its summary plus warnings
fn emit<T: Serialize>(report: &CommandReport<T>, json: bool) -> AppResult<()> {
    if json {
        let text = serde_json::to_string_pretty(report)
            .map_err(|e| AppError::Internal(format!("failed to encode report: {e}")))?;
        println!("{text}");
    } else {
        println!("{}", report.summary);
        for warning in &report.warnings {
            eprintln!("warning: {warning}");
        }
    }
    Ok(())
}
