//! Address lists
//!
//! Recipients arrive as free-form strings: bare addresses, `Name <addr>`
//! forms, and comma-separated lists whose display names may themselves
//! contain commas when quoted. Parsing goes through `mailparse`; the builder
//! turns the result into `lettre` mailboxes.

use lettre::Address;
use lettre::message::Mailbox;
use mailparse::{MailAddr, MailAddrList, MailHeader, SingleInfo, addrparse, addrparse_header};
use tracing::debug;

use crate::errors::{AppError, AppResult};

/// Characters that force a display name into a quoted string
const SPECIALS: &[char] = &['(', ')', '<', '>', '[', ']', ':', ';', '@', '\\', ',', '.', '"'];

/// Parse an address list, flattening groups into their members
///
/// # Errors
///
/// - `InvalidInput` when the list is not RFC 5322 parseable
pub fn parse(raw: &str) -> AppResult<Vec<SingleInfo>> {
    let list = addrparse(raw)
        .map_err(|e| AppError::invalid(format!("invalid address list '{raw}': {e}")))?;
    Ok(flatten(&list))
}

fn flatten(list: &MailAddrList) -> Vec<SingleInfo> {
    list.iter()
        .flat_map(|addr| match addr {
            MailAddr::Single(info) => vec![info.clone()],
            MailAddr::Group(group) => group.addrs.clone(),
        })
        .collect()
}

/// Mailboxes of a received header, decoding encoded-word display names
pub fn from_header(header: &MailHeader<'_>) -> Vec<String> {
    match addrparse_header(header) {
        Ok(list) => flatten(&list).iter().map(format_single).collect(),
        Err(_) => split_list(&header.get_value()),
    }
}

/// Split a header-style list into one display string per mailbox
///
/// Unparseable input falls back to comma splitting so a malformed header
/// still yields something the user can correct.
pub fn split_list(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    match parse(raw) {
        Ok(list) => list.iter().map(format_single).collect(),
        Err(e) => {
            debug!(error = %e, "address list fallback to comma split");
            raw.split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_owned)
                .collect()
        }
    }
}

/// Render one mailbox, quoting the display name when it needs it
pub fn format_single(info: &SingleInfo) -> String {
    match info
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
    {
        Some(name) if name.contains(SPECIALS) => format!(
            "\"{}\" <{}>",
            name.replace('\\', "\\\\").replace('"', "\\\""),
            info.addr
        ),
        Some(name) => format!("{name} <{}>", info.addr),
        None => info.addr.clone(),
    }
}

/// Join entries into a single header-style list
pub fn format_list(list: &[String]) -> String {
    list.iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// `addr@host` out of any single-address form
pub fn bare_address(raw: &str) -> String {
    parse(raw)
        .ok()
        .and_then(|list| list.into_iter().next())
        .map(|info| info.addr)
        .unwrap_or_else(|| raw.trim().trim_matches(['<', '>']).to_owned())
}

/// Mailboxes for every address in `raw`
///
/// # Errors
///
/// - `InvalidInput` when the list or any address in it is malformed
pub fn mailboxes(raw: &str) -> AppResult<Vec<Mailbox>> {
    parse(raw)?
        .into_iter()
        .map(|info| {
            let email = info
                .addr
                .parse::<Address>()
                .map_err(|e| AppError::invalid(format!("invalid address '{}': {e}", info.addr)))?;
            let name = info
                .display_name
                .map(|n| n.trim().to_owned())
                .filter(|n| !n.is_empty());
            Ok(Mailbox::new(name, email))
        })
        .collect()
}
