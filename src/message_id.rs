//! RFC 5322 Message-ID generation and reply threading
//!
//! Every outgoing message gets a fresh `<uuid@domain>` identifier. Threading
//! headers are always angle-bracket-wrapped; `References` is an ordered chain
//! with the immediate parent last.

use uuid::Uuid;

use crate::errors::{AppError, AppResult};

/// Generate a new Message-ID for the domain of `from_address`
///
/// Falls back to `localhost` when the address has no domain part.
///
/// # Example
///
/// ```text
/// <6f1c2b1e-...@example.com>
/// ```
pub fn generate(from_address: &str) -> String {
    let domain = from_address
        .rsplit_once('@')
        .map(|(_, d)| d.trim().trim_end_matches('>'))
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost");
    format!("<{}@{}>", Uuid::new_v4(), domain)
}

/// Normalize a single identifier to `<...>` form
///
/// Returns `None` for empty input.
///
/// # Errors
///
/// Returns `InvalidInput` if the identifier contains whitespace, control
/// characters, or nested angle brackets.
pub fn normalize(raw: &str) -> AppResult<Option<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let inner = trimmed.strip_prefix('<').unwrap_or(trimmed);
    let inner = inner.strip_suffix('>').unwrap_or(inner);
    if inner.is_empty()
        || inner
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '<' || c == '>')
    {
        return Err(AppError::invalid(format!("malformed message id '{raw}'")));
    }
    Ok(Some(format!("<{inner}>")))
}

/// Split a `References`/`In-Reply-To` header into normalized identifiers
///
/// Tokens that do not form a valid identifier are dropped.
pub fn parse_list(header: &str) -> Vec<String> {
    header
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter_map(|token| normalize(token).ok().flatten())
        .collect()
}

/// Threading headers of a message being replied to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentHeaders {
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

/// Threading headers for a reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Threading {
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

/// Derive reply threading from a parent message
///
/// The chain is the parent's own `References` (or its `In-Reply-To` when it
/// has none) followed by the parent's Message-ID. Duplicates keep their first
/// position.
pub fn reply_threading(parent: &ParentHeaders) -> Threading {
    let parent_id = parent
        .message_id
        .as_deref()
        .and_then(|id| normalize(id).ok().flatten());

    let mut chain: Vec<String> = if parent.references.is_empty() {
        parent
            .in_reply_to
            .as_deref()
            .map(parse_list)
            .unwrap_or_default()
    } else {
        parent
            .references
            .iter()
            .filter_map(|r| normalize(r).ok().flatten())
            .collect()
    };
    if let Some(id) = &parent_id {
        chain.push(id.clone());
    }

    let mut seen = std::collections::HashSet::new();
    chain.retain(|id| seen.insert(id.clone()));

    Threading {
        in_reply_to: parent_id,
        references: chain,
    }
}

/// Render a `References` header value
pub fn references_header(chain: &[String]) -> String {
    chain.join(" ")
}
