//! In-memory mail store for tests
//!
//! Mimics the subset of IMAP server behavior the pipeline relies on: folder
//! listing and selection, APPEND with flags, UID allocation, header search
//! with `SINCE` and `DRAFT`, and `\Deleted` + EXPUNGE.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Local, NaiveDate};

use crate::errors::{AppError, AppResult};
use crate::imap::{FetchedMessage, MailStore, MailboxStatus, SearchCriteria, StoreConnector};
use crate::mime;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub raw: Vec<u8>,
    /// Server-side arrival date, which `SINCE` compares against
    pub internal_date: NaiveDate,
}

#[derive(Debug)]
pub struct FakeState {
    pub folders: BTreeMap<String, Vec<StoredMessage>>,
    pub next_uid: u32,
    /// LIST returns nothing while SELECT still works
    pub hide_from_list: bool,
    pub allow_create: bool,
    pub fail_append: bool,
    pub connections: usize,
    /// Internal date stamped on APPEND; today when unset
    pub append_date: Option<NaiveDate>,
}

/// Shared server state; every `connect` yields a fresh session over it
#[derive(Debug, Clone)]
pub struct FakeServer {
    state: Arc<Mutex<FakeState>>,
}

impl FakeServer {
    pub fn with_folders(folders: &[&str]) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                folders: folders
                    .iter()
                    .map(|f| ((*f).to_owned(), Vec::new()))
                    .collect(),
                next_uid: 1,
                hide_from_list: false,
                allow_create: true,
                fail_append: false,
                connections: 0,
                append_date: None,
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state poisoned")
    }

    /// Place a message directly, bypassing APPEND
    pub fn seed(&self, folder: &str, uid: u32, flags: &[&str], raw: &[u8]) {
        let mut state = self.state();
        state.next_uid = state.next_uid.max(uid + 1);
        state
            .folders
            .entry(folder.to_owned())
            .or_default()
            .push(StoredMessage {
                uid,
                flags: flags.iter().map(|f| (*f).to_owned()).collect(),
                raw: raw.to_vec(),
                internal_date: Local::now().date_naive(),
            });
    }

    pub fn messages(&self, folder: &str) -> Vec<StoredMessage> {
        self.state().folders.get(folder).cloned().unwrap_or_default()
    }

    pub fn uids(&self, folder: &str) -> Vec<u32> {
        self.messages(folder).iter().map(|m| m.uid).collect()
    }
}

pub struct FakeStore {
    server: FakeServer,
    selected: Option<String>,
}

impl FakeStore {
    fn selected(&self) -> AppResult<String> {
        self.selected
            .clone()
            .ok_or_else(|| AppError::Internal("no folder selected".to_owned()))
    }
}

impl StoreConnector for FakeServer {
    type Store = FakeStore;

    async fn connect(&self) -> AppResult<FakeStore> {
        self.state().connections += 1;
        Ok(FakeStore {
            server: self.clone(),
            selected: None,
        })
    }
}

fn matches(criteria: &SearchCriteria, message: &StoredMessage) -> bool {
    if criteria.since.is_some_and(|since| message.internal_date < since) {
        return false;
    }
    if criteria.draft_only && !message.flags.iter().any(|f| f == "\\Draft") {
        return false;
    }
    let Ok(parsed) = mime::parse_message(&message.raw) else {
        return false;
    };
    let contains = |hay: &Option<String>, needle: &str| {
        hay.as_deref()
            .is_some_and(|h| h.to_lowercase().contains(&needle.to_lowercase()))
    };
    if let Some(subject) = &criteria.subject
        && !contains(&parsed.subject, subject)
    {
        return false;
    }
    if let Some(id) = &criteria.message_id
        && parsed.message_id.as_deref().map(str::trim) != Some(id.as_str())
    {
        return false;
    }
    if !criteria.from_any.is_empty()
        && !criteria.from_any.iter().any(|f| contains(&parsed.from, f))
    {
        return false;
    }
    true
}

impl MailStore for FakeStore {
    async fn list_folders(&mut self) -> AppResult<Vec<String>> {
        let state = self.server.state();
        if state.hide_from_list {
            return Ok(Vec::new());
        }
        Ok(state.folders.keys().cloned().collect())
    }

    async fn select(&mut self, folder: &str) -> AppResult<MailboxStatus> {
        let status = {
            let state = self.server.state();
            let messages = state
                .folders
                .get(folder)
                .ok_or_else(|| AppError::NotFound(format!("cannot select folder '{folder}'")))?;
            MailboxStatus {
                exists: u32::try_from(messages.len()).unwrap_or(u32::MAX),
            }
        };
        self.selected = Some(folder.to_owned());
        Ok(status)
    }

    async fn create(&mut self, folder: &str) -> AppResult<()> {
        let mut state = self.server.state();
        if !state.allow_create || state.folders.contains_key(folder) {
            return Err(AppError::Internal(format!("CREATE '{folder}' failed")));
        }
        state.folders.insert(folder.to_owned(), Vec::new());
        Ok(())
    }

    async fn append(&mut self, folder: &str, flags: &str, content: &[u8]) -> AppResult<()> {
        let mut state = self.server.state();
        if state.fail_append {
            return Err(AppError::Internal(format!("APPEND to '{folder}' failed")));
        }
        let uid = state.next_uid;
        let internal_date = state.append_date.unwrap_or_else(|| Local::now().date_naive());
        let messages = state
            .folders
            .get_mut(folder)
            .ok_or_else(|| AppError::Internal(format!("APPEND to '{folder}' failed")))?;
        messages.push(StoredMessage {
            uid,
            flags: flags
                .trim_matches(|c| c == '(' || c == ')')
                .split_whitespace()
                .map(str::to_owned)
                .collect(),
            raw: content.to_vec(),
            internal_date,
        });
        state.next_uid += 1;
        Ok(())
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> AppResult<Vec<u32>> {
        let folder = self.selected()?;
        let state = self.server.state();
        let mut uids: Vec<u32> = state
            .folders
            .get(&folder)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| matches(criteria, m))
                    .map(|m| m.uid)
                    .collect()
            })
            .unwrap_or_default();
        uids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(uids)
    }

    async fn fetch(&mut self, uids: &[u32]) -> AppResult<Vec<FetchedMessage>> {
        let folder = self.selected()?;
        let state = self.server.state();
        Ok(state
            .folders
            .get(&folder)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| uids.contains(&m.uid))
                    .map(|m| FetchedMessage {
                        uid: m.uid,
                        flags: m.flags.clone(),
                        raw: m.raw.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_deleted(&mut self, uid: u32) -> AppResult<()> {
        let folder = self.selected()?;
        let mut state = self.server.state();
        if let Some(message) = state
            .folders
            .get_mut(&folder)
            .and_then(|messages| messages.iter_mut().find(|m| m.uid == uid))
        {
            message.flags.push("\\Deleted".to_owned());
        }
        Ok(())
    }

    async fn expunge(&mut self) -> AppResult<()> {
        let folder = self.selected()?;
        let mut state = self.server.state();
        if let Some(messages) = state.folders.get_mut(&folder) {
            messages.retain(|m| !m.flags.iter().any(|f| f == "\\Deleted"));
        }
        Ok(())
    }

    async fn logout(self) -> AppResult<()> {
        Ok(())
    }
}
