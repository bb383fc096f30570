//! Remote folder discovery
//!
//! Servers name their Sent and Drafts folders differently. Each role carries
//! an ordered candidate table; discovery tries, in order, a LIST match, a
//! SELECT probe of each candidate, creating the folder, and a default.

use tracing::{debug, warn};

use crate::errors::AppResult;
use crate::imap::MailStore;

/// Folder purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderRole {
    Sent,
    Drafts,
}

/// Whether discovery may change the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// Only find an existing folder
    Existing,
    /// Create the folder, or fall back to a default, when none exists
    CreateIfMissing,
}

impl FolderRole {
    pub fn candidates(self) -> &'static [&'static str] {
        match self {
            Self::Sent => &[
                "Sent",
                "Sent Items",
                "Sent Messages",
                "[Gmail]/Sent Mail",
                "INBOX.Sent",
            ],
            Self::Drafts => &[
                "Drafts",
                "INBOX.Drafts",
                "[Gmail]/Drafts",
                "Draft",
                "INBOX.Draft",
            ],
        }
    }

    /// Substring that marks a listed folder as a match
    fn keyword(self) -> Option<&'static str> {
        match self {
            Self::Sent => None,
            Self::Drafts => Some("draft"),
        }
    }

    /// Sent folders are probed only; listing is reserved for drafts
    fn uses_list(self) -> bool {
        matches!(self, Self::Drafts)
    }

    fn create_name(self) -> Option<&'static str> {
        match self {
            Self::Sent => None,
            Self::Drafts => Some("Drafts"),
        }
    }

    /// Last-resort folder when nothing suitable exists
    pub fn fallback(self) -> Option<&'static str> {
        match self {
            Self::Sent => None,
            Self::Drafts => Some("INBOX"),
        }
    }

    /// Pick the best listed folder: an exact candidate in table order, then
    /// the first name containing the keyword
    pub fn match_listed(self, listed: &[String]) -> Option<String> {
        for candidate in self.candidates() {
            if let Some(name) = listed.iter().find(|n| n.eq_ignore_ascii_case(candidate)) {
                return Some(name.clone());
            }
        }
        let keyword = self.keyword()?;
        listed
            .iter()
            .find(|n| n.to_lowercase().contains(keyword))
            .cloned()
    }
}

/// Find (and optionally create) the folder for a role
///
/// Returns `None` when nothing suitable exists and the role has no default.
/// A failed LIST is logged and discovery continues with probing.
///
/// # Errors
///
/// Only propagates errors from the store that are not part of probing; in
/// practice discovery itself does not fail.
pub async fn resolve<S: MailStore>(
    store: &mut S,
    role: FolderRole,
    discovery: Discovery,
) -> AppResult<Option<String>> {
    if role.uses_list() {
        match store.list_folders().await {
            Ok(listed) => {
                if let Some(found) = role.match_listed(&listed) {
                    debug!(?role, folder = %found, "folder matched from LIST");
                    return Ok(Some(found));
                }
            }
            Err(e) => warn!(?role, error = %e, "LIST failed, probing candidates"),
        }
    }

    for candidate in role.candidates() {
        if store.select(candidate).await.is_ok() {
            debug!(?role, folder = %candidate, "folder found by probing");
            return Ok(Some((*candidate).to_owned()));
        }
    }

    if discovery == Discovery::Existing {
        return Ok(None);
    }

    if let Some(name) = role.create_name() {
        match store.create(name).await {
            Ok(()) => {
                debug!(?role, folder = %name, "folder created");
                return Ok(Some(name.to_owned()));
            }
            Err(e) => warn!(?role, folder = %name, error = %e, "folder creation failed"),
        }
    }

    Ok(role.fallback().map(str::to_owned))
}

#[cfg(test)]
mod tests {
    use super::{Discovery, FolderRole, resolve};
    use crate::imap::StoreConnector;
    use crate::test_support::FakeServer;

    #[tokio::test]
    async fn gmail_drafts_folder_is_found_by_listing() {
        let server = FakeServer::with_folders(&["INBOX", "[Gmail]/Drafts", "[Gmail]/Sent Mail"]);
        let mut store = server.connect().await.expect("connect");
        let folder = resolve(&mut store, FolderRole::Drafts, Discovery::CreateIfMissing)
            .await
            .expect("resolve");
        assert_eq!(folder.as_deref(), Some("[Gmail]/Drafts"));
        assert!(!server.state().folders.contains_key("Drafts"));
    }

    #[tokio::test]
    async fn unlisted_drafts_folder_is_found_by_probing() {
        let server = FakeServer::with_folders(&["INBOX", "[Gmail]/Drafts"]);
        server.state().hide_from_list = true;
        let mut store = server.connect().await.expect("connect");
        let folder = resolve(&mut store, FolderRole::Drafts, Discovery::CreateIfMissing)
            .await
            .expect("resolve");
        assert_eq!(folder.as_deref(), Some("[Gmail]/Drafts"));
    }

    #[tokio::test]
    async fn drafts_folder_is_created_then_falls_back_to_inbox() {
        let server = FakeServer::with_folders(&["INBOX"]);
        let mut store = server.connect().await.expect("connect");
        let created = resolve(&mut store, FolderRole::Drafts, Discovery::CreateIfMissing)
            .await
            .expect("resolve");
        assert_eq!(created.as_deref(), Some("Drafts"));

        let locked = FakeServer::with_folders(&["INBOX"]);
        locked.state().allow_create = false;
        let mut store = locked.connect().await.expect("connect");
        let fallback = resolve(&mut store, FolderRole::Drafts, Discovery::CreateIfMissing)
            .await
            .expect("resolve");
        assert_eq!(fallback.as_deref(), Some("INBOX"));
    }

    #[tokio::test]
    async fn missing_sent_folder_is_not_created() {
        let server = FakeServer::with_folders(&["INBOX"]);
        let mut store = server.connect().await.expect("connect");
        let sent = resolve(&mut store, FolderRole::Sent, Discovery::CreateIfMissing)
            .await
            .expect("resolve");
        assert_eq!(sent, None);
        assert_eq!(server.state().folders.len(), 1);
    }

    #[tokio::test]
    async fn sent_candidates_are_probed_in_order() {
        let server = FakeServer::with_folders(&["INBOX", "Sent Items", "INBOX.Sent"]);
        let mut store = server.connect().await.expect("connect");
        let sent = resolve(&mut store, FolderRole::Sent, Discovery::Existing)
            .await
            .expect("resolve");
        assert_eq!(sent.as_deref(), Some("Sent Items"));
    }

    #[test]
    fn listing_prefers_exact_names_over_keyword_matches() {
        let listed = vec!["Old Drafts Archive".to_owned(), "INBOX.Drafts".to_owned()];
        assert_eq!(
            FolderRole::Drafts.match_listed(&listed).as_deref(),
            Some("INBOX.Drafts")
        );
        let custom = vec!["My Draft Box".to_owned()];
        assert_eq!(
            FolderRole::Drafts.match_listed(&custom).as_deref(),
            Some("My Draft Box")
        );
    }
}
