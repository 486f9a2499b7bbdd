use crate::catalog::CatalogItem;
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use teloxide::types::{ChatId, MessageId};
use tokio::time::Instant;

pub const PENDING_TTL: Duration = Duration::from_secs(10 * 60);

/// Output encoding family delivered to the chat.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// ALAC in an MP4 container, as produced by the fetch pipeline.
    #[default]
    Alac,
    /// FLAC re-encoded from the ALAC source; the only variant that can be shrunk.
    Flac,
}

impl Variant {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "alac" => Some(Self::Alac),
            "flac" => Some(Self::Flac),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alac => "alac",
            Self::Flac => "flac",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Alac => "ALAC",
            Self::Flac => "FLAC",
        }
    }

    /// Whether `ext` (without the dot, any case) is a valid container for this variant.
    pub fn accepts_extension(self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        match self {
            Self::Alac => ext == "m4a" || ext == "mp4",
            Self::Flac => ext == "flac",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct ChatPreferences {
    inner: Arc<DashMap<ChatId, Variant>>,
    default: Variant,
}

impl ChatPreferences {
    pub fn new(default: Variant) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            default,
        }
    }

    pub fn get(&self, chat_id: ChatId) -> Variant {
        self.inner
            .get(&chat_id)
            .map(|entry| *entry)
            .unwrap_or(self.default)
    }

    pub fn set(&self, chat_id: ChatId, variant: Variant) {
        self.inner.insert(chat_id, variant);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListingKind {
    Song,
    Album,
    Artist,
    ArtistAlbums,
}

impl ListingKind {
    pub fn parse_search(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "song" => Some(Self::Song),
            "album" => Some(Self::Album),
            "artist" => Some(Self::Artist),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Song => "song",
            Self::Album => "album",
            Self::Artist => "artist",
            Self::ArtistAlbums => "artist_album",
        }
    }
}

/// The chooser currently shown in a chat.
#[derive(Clone, Debug)]
pub struct PendingSelection {
    pub kind: ListingKind,
    /// Search query, or the artist id for a drill-down.
    pub query: String,
    /// Artist name for a drill-down, empty otherwise.
    pub title: String,
    pub offset: usize,
    pub has_next: bool,
    pub items: Vec<CatalogItem>,
    pub created_at: Instant,
    pub results_message: MessageId,
    pub reply_to: Option<MessageId>,
}

#[derive(Clone, Debug)]
pub struct Choice {
    pub kind: ListingKind,
    pub item: CatalogItem,
    pub reply_to: Option<MessageId>,
}

#[derive(Clone, Debug)]
pub struct PageRequest {
    pub kind: ListingKind,
    pub query: String,
    pub title: String,
    pub offset: usize,
    pub reply_to: Option<MessageId>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SelectionError {
    NoSelection,
    /// The callback targets a superseded listing message.
    Stale,
    Expired { reply_to: Option<MessageId> },
    OutOfRange { reply_to: Option<MessageId> },
    /// Paging past the first page or on a listing without a query.
    NoPage,
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<DashMap<ChatId, PendingSelection>>,
    ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(PENDING_TTL)
    }
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Replaces whatever listing the chat had.
    pub fn set(&self, chat_id: ChatId, pending: PendingSelection) {
        self.inner.insert(chat_id, pending);
    }

    #[cfg(test)]
    pub fn get(&self, chat_id: ChatId) -> Option<PendingSelection> {
        self.inner.get(&chat_id).map(|entry| entry.clone())
    }

    pub fn choose(&self, chat_id: ChatId, message_id: MessageId, choice: usize) -> Result<Choice, SelectionError> {
        self.choose_at(chat_id, message_id, choice, Instant::now())
    }

    pub fn choose_at(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        choice: usize,
        now: Instant,
    ) -> Result<Choice, SelectionError> {
        let Entry::Occupied(entry) = self.inner.entry(chat_id) else {
            return Err(SelectionError::NoSelection);
        };
        let pending = entry.get();
        if pending.results_message != message_id {
            return Err(SelectionError::Stale);
        }
        let reply_to = pending.reply_to;
        if now.saturating_duration_since(pending.created_at) > self.ttl {
            entry.remove();
            return Err(SelectionError::Expired { reply_to });
        }
        if choice < 1 || choice > pending.items.len() {
            return Err(SelectionError::OutOfRange { reply_to });
        }
        let chosen = Choice {
            kind: pending.kind,
            item: pending.items[choice - 1].clone(),
            reply_to,
        };
        match chosen.kind {
            ListingKind::Song | ListingKind::Album | ListingKind::ArtistAlbums => {
                entry.remove();
            }
            // Replaced by the drill-down listing once it is shown.
            ListingKind::Artist => {}
        }
        Ok(chosen)
    }

    pub fn page(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        delta: i64,
        page_size: usize,
    ) -> Result<PageRequest, SelectionError> {
        self.page_at(chat_id, message_id, delta, page_size, Instant::now())
    }

    pub fn page_at(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        delta: i64,
        page_size: usize,
        now: Instant,
    ) -> Result<PageRequest, SelectionError> {
        let Entry::Occupied(entry) = self.inner.entry(chat_id) else {
            return Err(SelectionError::NoSelection);
        };
        let pending = entry.get();
        if pending.results_message != message_id {
            return Err(SelectionError::Stale);
        }
        let reply_to = pending.reply_to;
        if now.saturating_duration_since(pending.created_at) > self.ttl {
            entry.remove();
            return Err(SelectionError::Expired { reply_to });
        }
        if pending.query.is_empty() || (delta > 0 && !pending.has_next) {
            return Err(SelectionError::NoPage);
        }
        let offset = pending.offset as i64 + delta * page_size as i64;
        if offset < 0 {
            return Err(SelectionError::NoPage);
        }
        Ok(PageRequest {
            kind: pending.kind,
            query: pending.query.clone(),
            title: pending.title.clone(),
            offset: offset as usize,
            reply_to,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallbackAction {
    Select(usize),
    Setting(Variant),
    Page(i64),
}

const SELECTION_CALLBACK_PREFIX: &str = "selection:";
const SETTING_CALLBACK_PREFIX: &str = "setting:";
const PAGE_CALLBACK_PREFIX: &str = "page:";

pub fn build_selection_callback(index: usize) -> String {
    format!("{SELECTION_CALLBACK_PREFIX}{index}")
}

pub fn build_setting_callback(variant: Variant) -> String {
    format!("{SETTING_CALLBACK_PREFIX}{variant}")
}

pub fn build_page_callback(delta: i64) -> String {
    format!("{PAGE_CALLBACK_PREFIX}{delta}")
}

pub fn parse_callback(data: &str) -> Option<CallbackAction> {
    let data = data.trim();
    if let Some(payload) = data.strip_prefix(SELECTION_CALLBACK_PREFIX) {
        return payload.trim().parse().ok().map(CallbackAction::Select);
    }
    if let Some(payload) = data.strip_prefix(SETTING_CALLBACK_PREFIX) {
        return Variant::parse(payload).map(CallbackAction::Setting);
    }
    if let Some(payload) = data.strip_prefix(PAGE_CALLBACK_PREFIX) {
        return payload.trim().parse().ok().map(CallbackAction::Page);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> CatalogItem {
        CatalogItem {
            id: id.to_string(),
            name: format!("Track {id}"),
            ..CatalogItem::default()
        }
    }

    fn listing(kind: ListingKind, message: i32, items: Vec<CatalogItem>) -> PendingSelection {
        PendingSelection {
            kind,
            query: "daft punk".into(),
            title: String::new(),
            offset: 0,
            has_next: true,
            items,
            created_at: Instant::now(),
            results_message: MessageId(message),
            reply_to: Some(MessageId(1)),
        }
    }

    #[test]
    fn callback_roundtrip() {
        assert_eq!(parse_callback(&build_selection_callback(3)), Some(CallbackAction::Select(3)));
        assert_eq!(parse_callback(&build_page_callback(-1)), Some(CallbackAction::Page(-1)));
        assert_eq!(
            parse_callback(&build_setting_callback(Variant::Flac)),
            Some(CallbackAction::Setting(Variant::Flac))
        );
        assert_eq!(parse_callback("setting:mp3"), None);
        assert_eq!(parse_callback("task:abc"), None);
    }

    #[test]
    fn preferences_fall_back_to_default() {
        let prefs = ChatPreferences::new(Variant::Alac);
        assert_eq!(prefs.get(ChatId(7)), Variant::Alac);
        prefs.set(ChatId(7), Variant::Flac);
        assert_eq!(prefs.get(ChatId(7)), Variant::Flac);
        assert_eq!(prefs.get(ChatId(8)), Variant::Alac);
    }

    #[tokio::test]
    async fn choice_is_validated_against_current_page() {
        let store = SessionStore::default();
        let chat = ChatId(1);
        store.set(chat, listing(ListingKind::Song, 10, vec![item("a"), item("b")]));

        assert_eq!(
            store.choose(chat, MessageId(9), 1).unwrap_err(),
            SelectionError::Stale
        );
        assert_eq!(
            store.choose(chat, MessageId(10), 3).unwrap_err(),
            SelectionError::OutOfRange { reply_to: Some(MessageId(1)) }
        );
        let choice = store.choose(chat, MessageId(10), 2).unwrap();
        assert_eq!(choice.item.id, "b");
        assert!(store.get(chat).is_none());
    }

    #[tokio::test]
    async fn artist_choice_keeps_listing_until_drilldown() {
        let store = SessionStore::default();
        let chat = ChatId(1);
        store.set(chat, listing(ListingKind::Artist, 10, vec![item("artist")]));
        let choice = store.choose(chat, MessageId(10), 1).unwrap();
        assert_eq!(choice.kind, ListingKind::Artist);
        assert!(store.get(chat).is_some());
    }

    #[tokio::test]
    async fn expired_selection_is_rejected_without_touching_items() {
        let store = SessionStore::default();
        let chat = ChatId(1);
        let pending = listing(ListingKind::Song, 10, vec![item("a")]);
        let late = pending.created_at + PENDING_TTL + Duration::from_secs(1);
        store.set(chat, pending);

        let err = store.choose_at(chat, MessageId(10), 1, late).unwrap_err();
        assert_eq!(err, SelectionError::Expired { reply_to: Some(MessageId(1)) });
        assert_eq!(
            store.choose(chat, MessageId(10), 1).unwrap_err(),
            SelectionError::NoSelection
        );
    }

    #[tokio::test]
    async fn paging_moves_by_page_size_and_stops_at_zero() {
        let store = SessionStore::default();
        let chat = ChatId(1);
        store.set(chat, listing(ListingKind::Album, 10, vec![item("a")]));

        let next = store.page(chat, MessageId(10), 1, 8).unwrap();
        assert_eq!(next.offset, 8);
        assert_eq!(
            store.page(chat, MessageId(10), -1, 8).unwrap_err(),
            SelectionError::NoPage
        );
        assert_eq!(
            store.page(chat, MessageId(11), 1, 8).unwrap_err(),
            SelectionError::Stale
        );
    }

    #[tokio::test]
    async fn last_page_cannot_move_forward() {
        let store = SessionStore::default();
        let chat = ChatId(1);
        let mut last = listing(ListingKind::Song, 10, vec![item("a")]);
        last.offset = 16;
        last.has_next = false;
        store.set(chat, last);

        assert_eq!(
            store.page(chat, MessageId(10), 1, 8).unwrap_err(),
            SelectionError::NoPage
        );
        assert_eq!(store.page(chat, MessageId(10), -1, 8).unwrap().offset, 8);
    }

    #[test]
    fn variant_extension_rules() {
        assert!(Variant::Alac.accepts_extension("M4A"));
        assert!(Variant::Alac.accepts_extension("mp4"));
        assert!(!Variant::Alac.accepts_extension("flac"));
        assert!(Variant::Flac.accepts_extension("flac"));
    }
}
