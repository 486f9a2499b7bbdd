use crate::{error::AppError, session::ListingKind};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use std::{cmp::Reverse, collections::HashMap};
use tracing::{debug, info, instrument, warn};

const CATALOG_BASE: &str = "https://amp-api.music.apple.com/v1/catalog";
const CATALOG_ORIGIN: &str = "https://music.apple.com";
const ARTIST_ALBUMS_BATCH: usize = 100;

/// One row of a numbered listing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    pub detail: String,
    pub artist: String,
    pub album: String,
    pub content_rating: String,
}

/// Descriptive metadata for one catalog track.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrackMeta {
    pub track_id: String,
    pub title: String,
    pub performer: String,
    pub duration_millis: u64,
}

#[async_trait]
pub trait TrackLookup: Send + Sync {
    async fn track_meta(&self, track_id: &str) -> Result<TrackMeta, AppError>;
}

#[async_trait]
pub trait Catalog: TrackLookup {
    /// One page of search results and whether a further page exists.
    async fn search(
        &self,
        kind: ListingKind,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<CatalogItem>, bool), AppError>;

    async fn artist_albums(
        &self,
        artist_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<CatalogItem>, bool), AppError>;
}

pub struct AppleMusicCatalog {
    client: reqwest::Client,
    token: String,
    storefront: String,
    language: String,
}

impl AppleMusicCatalog {
    pub fn new(client: reqwest::Client, token: String, storefront: String, language: String) -> Self {
        Self {
            client,
            token,
            storefront,
            language,
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{CATALOG_BASE}/{}/{path}", self.storefront);
        let mut builder = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ORIGIN, CATALOG_ORIGIN);
        if !self.language.is_empty() {
            builder = builder.query(&[("l", self.language.as_str())]);
        }
        builder
    }

    async fn get_json<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T, AppError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(event = "catalog_request_failed", status = %status);
            return Err(AppError::Catalog(format!("catalog responded {status}")));
        }
        Ok(response.json().await?)
    }
}

#[derive(Deserialize, Default)]
struct SearchResponse {
    #[serde(default)]
    results: SearchResults,
}

#[derive(Deserialize, Default)]
struct SearchResults {
    songs: Option<ResourcePage>,
    albums: Option<ResourcePage>,
    artists: Option<ResourcePage>,
}

#[derive(Deserialize, Default)]
struct ResourcePage {
    #[serde(default)]
    data: Vec<Resource>,
    next: Option<String>,
}

#[derive(Deserialize)]
struct Resource {
    id: String,
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct Attributes {
    name: String,
    artist_name: String,
    album_name: String,
    content_rating: String,
    release_date: String,
    track_count: u32,
    genre_names: Vec<String>,
    duration_in_millis: u64,
}

#[async_trait]
impl TrackLookup for AppleMusicCatalog {
    #[instrument(skip(self))]
    async fn track_meta(&self, track_id: &str) -> Result<TrackMeta, AppError> {
        if track_id.is_empty() {
            return Err(AppError::Catalog("empty track id".into()));
        }
        let page: ResourcePage = self.get_json(self.request(&format!("songs/{track_id}"))).await?;
        let song = page
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Catalog("empty song response".into()))?;
        Ok(TrackMeta {
            track_id: track_id.to_string(),
            title: song.attributes.name.trim().to_string(),
            performer: song.attributes.artist_name.trim().to_string(),
            duration_millis: song.attributes.duration_in_millis,
        })
    }
}

#[async_trait]
impl Catalog for AppleMusicCatalog {
    #[instrument(skip(self))]
    async fn search(
        &self,
        kind: ListingKind,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<CatalogItem>, bool), AppError> {
        let types = format!("{}s", kind.as_str());
        let builder = self.request("search").query(&[
            ("term", query.to_string()),
            ("types", types),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ]);
        let response: SearchResponse = self.get_json(builder).await?;
        let (items, has_next) = build_search_items(kind, response.results);
        info!(event = "catalog_search", kind = kind.as_str(), results = items.len(), has_next);
        Ok((items, has_next))
    }

    #[instrument(skip(self))]
    async fn artist_albums(
        &self,
        artist_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<CatalogItem>, bool), AppError> {
        let mut items = Vec::new();
        let mut api_offset = 0;
        loop {
            let builder = self.request(&format!("artists/{artist_id}/albums")).query(&[
                ("limit", ARTIST_ALBUMS_BATCH.to_string()),
                ("offset", api_offset.to_string()),
            ]);
            let page: ResourcePage = self.get_json(builder).await?;
            items.extend(page.data.into_iter().map(|album| CatalogItem {
                id: album.id,
                name: album.attributes.name,
                detail: album.attributes.release_date,
                artist: album.attributes.artist_name,
                album: String::new(),
                content_rating: album.attributes.content_rating,
            }));
            if page.next.is_none() {
                break;
            }
            api_offset += ARTIST_ALBUMS_BATCH;
        }
        debug!(event = "artist_albums_loaded", total = items.len());
        sort_newest_first(&mut items);
        Ok(paginate(items, limit, offset))
    }
}

fn build_search_items(kind: ListingKind, results: SearchResults) -> (Vec<CatalogItem>, bool) {
    let page = match kind {
        ListingKind::Song => results.songs,
        ListingKind::Album => results.albums,
        ListingKind::Artist => results.artists,
        ListingKind::ArtistAlbums => None,
    };
    let Some(page) = page else {
        return (Vec::new(), false);
    };
    let has_next = page.next.is_some();
    let mut items: Vec<CatalogItem> = page
        .data
        .into_iter()
        .map(|res| {
            let attrs = res.attributes;
            let detail = match kind {
                ListingKind::Song => format!("{} / {}", attrs.artist_name, attrs.album_name),
                ListingKind::Album => {
                    let year = attrs.release_date.get(..4).unwrap_or("");
                    format!("{} ({}, {} tracks)", attrs.artist_name, year, attrs.track_count)
                }
                _ => attrs.genre_names.join(", "),
            };
            CatalogItem {
                id: res.id,
                name: attrs.name,
                detail,
                artist: attrs.artist_name,
                album: attrs.album_name,
                content_rating: attrs.content_rating,
            }
        })
        .collect();
    if kind == ListingKind::Song {
        sort_song_variants(&mut items);
    }
    (items, has_next)
}

fn rating_rank(rating: &str) -> u8 {
    match rating.to_ascii_lowercase().as_str() {
        "explicit" => 0,
        "clean" => 1,
        _ => 2,
    }
}

/// Groups releases of the same song together at the position of the first one,
/// explicit before clean before unrated.
pub fn sort_song_variants(items: &mut Vec<CatalogItem>) {
    if items.len() < 2 {
        return;
    }
    let mut groups: Vec<Vec<CatalogItem>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for item in items.drain(..) {
        let key = format!("{}|{}|{}", item.name.trim(), item.artist.trim(), item.album.trim()).to_lowercase();
        if key == "||" {
            groups.push(vec![item]);
            continue;
        }
        match index.get(&key) {
            Some(&idx) => groups[idx].push(item),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![item]);
            }
        }
    }
    for mut group in groups {
        group.sort_by_key(|item| rating_rank(&item.content_rating));
        items.extend(group);
    }
}

/// Dated releases newest first, then undated ones, each run ordered by name.
fn sort_newest_first(items: &mut [CatalogItem]) {
    items.sort_by_cached_key(|item| {
        let released = chrono::NaiveDate::parse_from_str(&item.detail, "%Y-%m-%d").ok();
        (Reverse(released), item.name.clone())
    });
}

fn paginate(items: Vec<CatalogItem>, limit: usize, offset: usize) -> (Vec<CatalogItem>, bool) {
    if limit == 0 {
        return (items, false);
    }
    if offset >= items.len() {
        return (Vec::new(), false);
    }
    let end = (offset + limit).min(items.len());
    let has_next = end < items.len();
    (items[offset..end].to_vec(), has_next)
}

fn rating_badge(rating: &str) -> Option<&'static str> {
    match rating.to_ascii_lowercase().as_str() {
        "explicit" => Some("E"),
        "clean" => Some("C"),
        _ => None,
    }
}

fn item_label(item: &CatalogItem, paren_detail: bool) -> String {
    let label = match (item.detail.is_empty(), paren_detail) {
        (true, _) => item.name.clone(),
        (false, false) => format!("{} - {}", item.name, item.detail),
        (false, true) => format!("{} ({})", item.name, item.detail),
    };
    match rating_badge(&item.content_rating) {
        Some(badge) => format!("[{badge}] {label}"),
        None => label,
    }
}

pub fn format_search_results(kind: ListingKind, query: &str, items: &[CatalogItem]) -> String {
    let mut text = format!("Search {}: {query}\n", kind.as_str());
    for (i, item) in items.iter().enumerate() {
        text.push_str(&format!("{}. {}\n", i + 1, item_label(item, false)));
    }
    text.trim().to_string()
}

pub fn format_artist_albums(artist_name: &str, items: &[CatalogItem]) -> String {
    let mut text = format!("Albums by {artist_name}:\n");
    for (i, item) in items.iter().enumerate() {
        text.push_str(&format!("{}. {}\n", i + 1, item_label(item, true)));
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(id: &str, name: &str, rating: &str) -> CatalogItem {
        CatalogItem {
            id: id.into(),
            name: name.into(),
            artist: "Artist".into(),
            album: "Album".into(),
            content_rating: rating.into(),
            ..CatalogItem::default()
        }
    }

    #[test]
    fn song_variants_group_explicit_first() {
        let mut items = vec![
            song("1", "One", "clean"),
            song("2", "Two", ""),
            song("3", "One", "explicit"),
        ];
        sort_song_variants(&mut items);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1", "2"]);
    }

    #[test]
    fn artist_albums_sort_newest_first_and_paginate() {
        let mut items = vec![
            CatalogItem { id: "old".into(), detail: "2001-03-12".into(), ..CatalogItem::default() },
            CatalogItem { id: "new".into(), detail: "2020-01-01".into(), ..CatalogItem::default() },
            CatalogItem { id: "mid".into(), detail: "2010-06-30".into(), ..CatalogItem::default() },
        ];
        sort_newest_first(&mut items);
        let (page, has_next) = paginate(items.clone(), 2, 0);
        assert_eq!(page[0].id, "new");
        assert!(has_next);
        let (page, has_next) = paginate(items, 2, 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "old");
        assert!(!has_next);
    }

    #[test]
    fn undated_albums_follow_dated_ones_by_name() {
        let album = |id: &str, name: &str, detail: &str| CatalogItem {
            id: id.into(),
            name: name.into(),
            detail: detail.into(),
            ..CatalogItem::default()
        };
        let mut items = vec![
            album("c", "Charlie", ""),
            album("x", "Xray", "1999-01-01"),
            album("a", "Alpha", ""),
            album("y", "Yankee", "2015-05-05"),
            album("b", "Bravo", "not a date"),
            album("z", "Zulu", "2015-05-05"),
        ];
        sort_newest_first(&mut items);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["y", "z", "x", "a", "b", "c"]);
    }

    #[test]
    fn large_mixed_album_lists_sort_consistently() {
        let mut items: Vec<CatalogItem> = (0..200)
            .map(|i| CatalogItem {
                id: i.to_string(),
                name: format!("Album {:03}", (i * 37) % 200),
                detail: if i % 2 == 0 { format!("20{:02}-01-{:02}", i % 24, i % 28 + 1) } else { String::new() },
                ..CatalogItem::default()
            })
            .collect();
        sort_newest_first(&mut items);
        let first_undated = items.iter().position(|i| i.detail.is_empty()).unwrap();
        assert!(items[..first_undated].iter().all(|i| !i.detail.is_empty()));
        assert!(items[first_undated..].iter().all(|i| i.detail.is_empty()));
        assert!(items[..first_undated].windows(2).all(|w| w[0].detail >= w[1].detail));
        assert!(items[first_undated..].windows(2).all(|w| w[0].name <= w[1].name));
    }

    #[test]
    fn listing_text_is_numbered_with_badges() {
        let mut items = vec![song("1", "One", "explicit")];
        items[0].detail = "Artist / Album".into();
        let text = format_search_results(ListingKind::Song, "one", &items);
        assert_eq!(text, "Search song: one\n1. [E] One - Artist / Album");
    }

    #[test]
    fn album_search_detail_includes_year_and_tracks() {
        let results: SearchResults = serde_json::from_value(serde_json::json!({
            "albums": {
                "data": [{
                    "id": "42",
                    "attributes": {
                        "name": "Discovery",
                        "artistName": "Daft Punk",
                        "releaseDate": "2001-03-12",
                        "trackCount": 14
                    }
                }],
                "next": "/v1/next"
            }
        }))
        .unwrap();
        let (items, has_next) = build_search_items(ListingKind::Album, results);
        assert!(has_next);
        assert_eq!(items[0].detail, "Daft Punk (2001, 14 tracks)");
    }
}
