use crate::{
    cache::ArtifactCache,
    catalog::{format_artist_albums, format_search_results, Catalog, CatalogItem, TrackLookup},
    config::Config,
    delivery::{format_caption, Delivery},
    error::AppError,
    fetch::{FetchTarget, TrackHint},
    progress::is_message_not_modified,
    queue::{DownloadQueue, DownloadRequest},
    session::{
        build_page_callback, build_selection_callback, build_setting_callback, parse_callback, CallbackAction,
        ChatPreferences, ListingKind, PendingSelection, SelectionError, SessionStore, Variant,
    },
};
use std::sync::Arc;
use teloxide::{
    dispatching::DpHandlerDescription,
    prelude::*,
    types::{
        InlineKeyboardButton, InlineKeyboardMarkup, InlineQuery, InlineQueryResult, InlineQueryResultArticle,
        InlineQueryResultCachedAudio, InputMessageContent, InputMessageContentText, MessageId,
    },
    RequestError,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

const KEYBOARD_ROW_SIZE: usize = 4;
const NOT_AUTHORIZED: &str = "Not authorized for this bot.";

#[derive(Clone)]
pub struct AppServices {
    config: Arc<Config>,
    catalog: Arc<dyn Catalog>,
    lookup: Arc<dyn TrackLookup>,
    cache: Arc<ArtifactCache>,
    sessions: SessionStore,
    preferences: ChatPreferences,
    delivery: Delivery,
    queue: DownloadQueue,
}

impl AppServices {
    pub fn new(
        config: Arc<Config>,
        catalog: Arc<dyn Catalog>,
        lookup: Arc<dyn TrackLookup>,
        cache: Arc<ArtifactCache>,
        delivery: Delivery,
        queue: DownloadQueue,
    ) -> Self {
        let preferences = ChatPreferences::new(config.default_variant);
        Self {
            config,
            catalog,
            lookup,
            cache,
            sessions: SessionStore::default(),
            preferences,
            delivery,
            queue,
        }
    }
}

/// A slash command split into its lowercase name and arguments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

pub fn build_handler() -> Handler<'static, DependencyMap, Result<(), AppError>, DpHandlerDescription> {
    dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback))
        .branch(Update::filter_inline_query().endpoint(handle_inline_query))
}

pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }
    let mut parts = text.split_whitespace();
    let head = parts.next()?.trim_start_matches('/');
    let name = head.split('@').next().unwrap_or_default().to_lowercase();
    Some(Command {
        name,
        args: parts.map(str::to_string).collect(),
    })
}

async fn reply(bot: &Bot, chat_id: ChatId, reply_to: Option<MessageId>, text: impl Into<String>) -> Result<Message, AppError> {
    let mut request = bot.send_message(chat_id, text.into());
    if let Some(reply_to) = reply_to {
        request = request.reply_to_message_id(reply_to);
    }
    Ok(request.await?)
}

async fn reply_with_keyboard(
    bot: &Bot,
    chat_id: ChatId,
    reply_to: Option<MessageId>,
    text: impl Into<String>,
    keyboard: InlineKeyboardMarkup,
) -> Result<Message, AppError> {
    let mut request = bot.send_message(chat_id, text.into()).reply_markup(keyboard);
    if let Some(reply_to) = reply_to {
        request = request.reply_to_message_id(reply_to);
    }
    Ok(request.await?)
}

/// An edit that leaves the message unchanged counts as applied.
fn edit_outcome(result: Result<Message, RequestError>) -> Result<(), AppError> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_message_not_modified(&err) => {
            debug!(event = "edit_not_modified");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[instrument(skip_all, fields(chat_id = msg.chat.id.0))]
async fn handle_message(bot: Bot, services: AppServices, msg: Message) -> Result<(), AppError> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat_id = msg.chat.id;
    if !services.config.is_allowed(chat_id) {
        info!(event = "chat_not_allowed");
        reply(&bot, chat_id, None, NOT_AUTHORIZED).await?;
        return Ok(());
    }
    let Some(command) = parse_command(text) else {
        return Ok(());
    };
    debug!(event = "command_received", command = %command.name);
    handle_command(&bot, &services, chat_id, msg.id, command).await
}

async fn handle_command(
    bot: &Bot,
    services: &AppServices,
    chat_id: ChatId,
    message_id: MessageId,
    command: Command,
) -> Result<(), AppError> {
    let reply_to = Some(message_id);
    let args = command.args;
    match command.name.as_str() {
        "start" | "help" => {
            bot.send_message(chat_id, help_text()).await?;
        }
        "search_song" => search(bot, services, chat_id, reply_to, "song", &args.join(" ")).await?,
        "search_album" => search(bot, services, chat_id, reply_to, "album", &args.join(" ")).await?,
        "search_artist" => search(bot, services, chat_id, reply_to, "artist", &args.join(" ")).await?,
        "search" => {
            if args.len() < 2 {
                reply(bot, chat_id, reply_to, "Usage: /search <song|album|artist> <keywords>").await?;
                return Ok(());
            }
            search(bot, services, chat_id, reply_to, &args[0], &args[1..].join(" ")).await?;
        }
        "id" => match args.as_slice() {
            [id] => queue_song(bot, services, chat_id, reply_to, id, None).await?,
            [kind, id, ..] if kind.eq_ignore_ascii_case("song") => {
                queue_song(bot, services, chat_id, reply_to, id, None).await?
            }
            [kind, id, ..] if kind.eq_ignore_ascii_case("album") => {
                queue_album(bot, services, chat_id, reply_to, id).await?
            }
            _ => {
                reply(bot, chat_id, reply_to, "Usage: /id <song|album> <id>").await?;
            }
        },
        "songid" => match args.first() {
            Some(id) => queue_song(bot, services, chat_id, reply_to, id, None).await?,
            None => {
                reply(bot, chat_id, reply_to, "Usage: /songid <id>").await?;
            }
        },
        "albumid" => match args.first() {
            Some(id) => queue_album(bot, services, chat_id, reply_to, id).await?,
            None => {
                reply(bot, chat_id, reply_to, "Usage: /albumid <id>").await?;
            }
        },
        "settings" => match args.first() {
            Some(raw) => {
                let Some(variant) = Variant::parse(raw) else {
                    reply(bot, chat_id, reply_to, "Usage: /settings <alac|flac>").await?;
                    return Ok(());
                };
                services.preferences.set(chat_id, variant);
                info!(event = "variant_changed", chat_id = chat_id.0, variant = %variant);
                let text = format!("Download format set to {}.", variant.label());
                reply_with_keyboard(bot, chat_id, reply_to, text, build_settings_keyboard(variant)).await?;
            }
            None => {
                let current = services.preferences.get(chat_id);
                let text = format!("Download format: {}", current.label());
                reply_with_keyboard(bot, chat_id, reply_to, text, build_settings_keyboard(current)).await?;
            }
        },
        _ => {
            bot.send_message(chat_id, "Unknown command. Send /help for usage.").await?;
        }
    }
    Ok(())
}

async fn search(
    bot: &Bot,
    services: &AppServices,
    chat_id: ChatId,
    reply_to: Option<MessageId>,
    kind: &str,
    query: &str,
) -> Result<(), AppError> {
    let query = query.trim();
    if query.is_empty() {
        reply(bot, chat_id, reply_to, "Please provide a search query.").await?;
        return Ok(());
    }
    let Some(kind) = ListingKind::parse_search(kind) else {
        reply(bot, chat_id, reply_to, "Search type must be song, album, or artist.").await?;
        return Ok(());
    };
    let page_size = services.config.search_page_size;
    let (items, has_next) = match services.catalog.search(kind, query, page_size, 0).await {
        Ok(page) => page,
        Err(err) => {
            warn!(event = "search_failed", error = %err);
            reply(bot, chat_id, reply_to, format!("Search failed: {err}")).await?;
            return Ok(());
        }
    };
    if items.is_empty() {
        reply(bot, chat_id, reply_to, "No results found.").await?;
        return Ok(());
    }
    let text = format_search_results(kind, query, &items);
    let keyboard = build_selection_keyboard(items.len(), false, has_next);
    let listing = reply_with_keyboard(bot, chat_id, reply_to, text, keyboard).await?;
    services.sessions.set(
        chat_id,
        PendingSelection {
            kind,
            query: query.to_string(),
            title: String::new(),
            offset: 0,
            has_next,
            items,
            created_at: Instant::now(),
            results_message: listing.id,
            reply_to,
        },
    );
    Ok(())
}

async fn queue_song(
    bot: &Bot,
    services: &AppServices,
    chat_id: ChatId,
    reply_to: Option<MessageId>,
    song_id: &str,
    hint: Option<TrackHint>,
) -> Result<(), AppError> {
    let song_id = song_id.trim();
    if song_id.is_empty() {
        reply(bot, chat_id, reply_to, "Song ID is empty.").await?;
        return Ok(());
    }
    let variant = services.preferences.get(chat_id);
    if services.delivery.send_cached(chat_id, reply_to, song_id, Some(variant)).await {
        return Ok(());
    }
    enqueue(
        bot,
        services,
        DownloadRequest {
            chat_id,
            reply_to,
            variant,
            target: FetchTarget::Song(song_id.to_string()),
            hint,
        },
    )
    .await
}

async fn queue_album(
    bot: &Bot,
    services: &AppServices,
    chat_id: ChatId,
    reply_to: Option<MessageId>,
    album_id: &str,
) -> Result<(), AppError> {
    let album_id = album_id.trim();
    if album_id.is_empty() {
        reply(bot, chat_id, reply_to, "Album ID is empty.").await?;
        return Ok(());
    }
    let variant = services.preferences.get(chat_id);
    enqueue(
        bot,
        services,
        DownloadRequest {
            chat_id,
            reply_to,
            variant,
            target: FetchTarget::Album(album_id.to_string()),
            hint: None,
        },
    )
    .await
}

async fn enqueue(bot: &Bot, services: &AppServices, request: DownloadRequest) -> Result<(), AppError> {
    let (chat_id, reply_to) = (request.chat_id, request.reply_to);
    match services.queue.enqueue(request) {
        Ok(admission) if admission.notify => {
            reply(bot, chat_id, reply_to, format!("Queued. Position: {}", admission.position)).await?;
        }
        Ok(_) => {}
        Err(err) => {
            reply(bot, chat_id, reply_to, err.to_string()).await?;
        }
    }
    Ok(())
}

#[instrument(skip_all)]
async fn handle_callback(bot: Bot, services: AppServices, q: CallbackQuery) -> Result<(), AppError> {
    let Some(message) = q.message.as_ref() else {
        return Ok(());
    };
    let chat_id = message.chat.id;
    if !services.config.is_allowed(chat_id) {
        return Ok(());
    }
    let action = q.data.as_deref().and_then(parse_callback);
    let result = match action {
        Some(CallbackAction::Select(choice)) => handle_selection(&bot, &services, chat_id, message.id, choice).await,
        Some(CallbackAction::Page(delta)) => handle_page(&bot, &services, chat_id, message.id, delta).await,
        Some(CallbackAction::Setting(variant)) => {
            services.preferences.set(chat_id, variant);
            let text = format!("Download format set to {}.", variant.label());
            edit_outcome(
                bot.edit_message_text(chat_id, message.id, text)
                    .reply_markup(build_settings_keyboard(variant))
                    .await,
            )
        }
        None => {
            debug!(event = "callback_unrecognized", data = ?q.data);
            Ok(())
        }
    };
    if let Err(err) = bot.answer_callback_query(q.id.clone()).await {
        debug!(event = "callback_answer_failed", error = %err);
    }
    result
}

async fn handle_selection(
    bot: &Bot,
    services: &AppServices,
    chat_id: ChatId,
    message_id: MessageId,
    choice: usize,
) -> Result<(), AppError> {
    let chosen = match services.sessions.choose(chat_id, message_id, choice) {
        Ok(chosen) => chosen,
        Err(SelectionError::NoSelection) => {
            reply(bot, chat_id, None, "No active selection. Start with /search_song or /search_album.").await?;
            return Ok(());
        }
        Err(SelectionError::Stale) | Err(SelectionError::NoPage) => return Ok(()),
        Err(SelectionError::Expired { reply_to }) => {
            reply(bot, chat_id, reply_to, "Selection expired. Please search again.").await?;
            return Ok(());
        }
        Err(SelectionError::OutOfRange { reply_to }) => {
            reply(bot, chat_id, reply_to, "Selection out of range.").await?;
            return Ok(());
        }
    };
    let item = chosen.item;
    match chosen.kind {
        ListingKind::Song => {
            let hint = TrackHint {
                title: item.name.clone(),
                performer: item.artist.clone(),
            };
            queue_song(bot, services, chat_id, chosen.reply_to, &item.id, Some(hint)).await
        }
        ListingKind::Album | ListingKind::ArtistAlbums => {
            queue_album(bot, services, chat_id, chosen.reply_to, &item.id).await
        }
        ListingKind::Artist => show_artist_albums(bot, services, chat_id, chosen.reply_to, item).await,
    }
}

async fn show_artist_albums(
    bot: &Bot,
    services: &AppServices,
    chat_id: ChatId,
    reply_to: Option<MessageId>,
    artist: CatalogItem,
) -> Result<(), AppError> {
    let page_size = services.config.search_page_size;
    let (albums, has_next) = match services.catalog.artist_albums(&artist.id, page_size, 0).await {
        Ok(page) => page,
        Err(err) => {
            warn!(event = "artist_albums_failed", error = %err);
            reply(bot, chat_id, reply_to, format!("Failed to load artist albums: {err}")).await?;
            return Ok(());
        }
    };
    if albums.is_empty() {
        reply(bot, chat_id, reply_to, "No albums found for this artist.").await?;
        return Ok(());
    }
    let text = format_artist_albums(&artist.name, &albums);
    let keyboard = build_selection_keyboard(albums.len(), false, has_next);
    let listing = reply_with_keyboard(bot, chat_id, reply_to, text, keyboard).await?;
    services.sessions.set(
        chat_id,
        PendingSelection {
            kind: ListingKind::ArtistAlbums,
            query: artist.id,
            title: artist.name,
            offset: 0,
            has_next,
            items: albums,
            created_at: Instant::now(),
            results_message: listing.id,
            reply_to,
        },
    );
    Ok(())
}

async fn handle_page(
    bot: &Bot,
    services: &AppServices,
    chat_id: ChatId,
    message_id: MessageId,
    delta: i64,
) -> Result<(), AppError> {
    let page_size = services.config.search_page_size;
    let page = match services.sessions.page(chat_id, message_id, delta, page_size) {
        Ok(page) => page,
        Err(SelectionError::Expired { reply_to }) => {
            reply(bot, chat_id, reply_to, "Selection expired. Please search again.").await?;
            return Ok(());
        }
        Err(_) => return Ok(()),
    };

    let fetched = match page.kind {
        ListingKind::ArtistAlbums => services
            .catalog
            .artist_albums(&page.query, page_size, page.offset)
            .await
            .map_err(|err| format!("Failed to load artist albums: {err}")),
        kind => services
            .catalog
            .search(kind, &page.query, page_size, page.offset)
            .await
            .map_err(|err| format!("Search failed: {err}")),
    };
    let (items, has_next) = match fetched {
        Ok(page) => page,
        Err(text) => {
            warn!(event = "page_fetch_failed", error = %text);
            return edit_outcome(bot.edit_message_text(chat_id, message_id, text).await);
        }
    };
    if items.is_empty() {
        return Ok(());
    }

    let text = match page.kind {
        ListingKind::ArtistAlbums => format_artist_albums(&page.title, &items),
        kind => format_search_results(kind, &page.query, &items),
    };
    let keyboard = build_selection_keyboard(items.len(), page.offset > 0, has_next);
    edit_outcome(
        bot.edit_message_text(chat_id, message_id, text)
            .reply_markup(keyboard)
            .await,
    )?;
    services.sessions.set(
        chat_id,
        PendingSelection {
            kind: page.kind,
            query: page.query,
            title: page.title,
            offset: page.offset,
            has_next,
            items,
            created_at: Instant::now(),
            results_message: message_id,
            reply_to: page.reply_to,
        },
    );
    Ok(())
}

#[instrument(skip_all)]
async fn handle_inline_query(bot: Bot, services: AppServices, q: InlineQuery) -> Result<(), AppError> {
    let track_id = extract_inline_track_id(&q.query);
    let mut results = Vec::new();
    if !track_id.is_empty() {
        results.push(inline_result(&services, &track_id).await);
    }
    bot.answer_inline_query(q.id, results)
        .is_personal(true)
        .cache_time(0)
        .await?;
    Ok(())
}

async fn inline_result(services: &AppServices, track_id: &str) -> InlineQueryResult {
    let max_bytes = services.delivery.max_file_bytes();
    if let Some(entry) = services.cache.get(track_id, None, max_bytes).await {
        let entry = services.cache.enrich(track_id, entry, services.lookup.as_ref()).await;
        let caption = format_caption(entry.effective_size(), entry.bitrate_kbps, entry.format);
        return InlineQueryResult::CachedAudio(
            InlineQueryResultCachedAudio::new(format!("song_{track_id}"), entry.file_id).caption(caption),
        );
    }

    let command = format!("/songid {track_id}");
    let send_hint = format!("Send {command}");
    let (title, description) = match services.lookup.track_meta(track_id).await {
        Ok(meta) if !meta.title.is_empty() && !meta.performer.is_empty() => {
            (format!("{} - {}", meta.performer, meta.title), send_hint.clone())
        }
        Ok(meta) if !meta.title.is_empty() => (meta.title, send_hint.clone()),
        Ok(_) => (send_hint.clone(), String::new()),
        Err(err) => {
            debug!(event = "inline_lookup_failed", error = %err);
            (send_hint.clone(), String::new())
        }
    };
    let mut article = InlineQueryResultArticle::new(
        format!("songcmd_{track_id}"),
        title,
        InputMessageContent::Text(InputMessageContentText::new(command)),
    );
    if !description.is_empty() {
        article = article.description(description);
    }
    InlineQueryResult::Article(article)
}

/// Pulls a song id out of inline query text: `/songid <id>`, `songid <id>`,
/// `song:<id>` or a bare id.
pub fn extract_inline_track_id(query: &str) -> String {
    let trimmed = query.trim();
    let lower = trimmed.to_lowercase();
    if lower.starts_with("/songid") || lower.starts_with("songid") {
        return trimmed.split_whitespace().nth(1).unwrap_or_default().to_string();
    }
    if lower.starts_with("song:") {
        return trimmed.get(5..).unwrap_or_default().trim().to_string();
    }
    trimmed.to_string()
}

pub fn build_selection_keyboard(count: usize, has_prev: bool, has_next: bool) -> InlineKeyboardMarkup {
    let buttons: Vec<InlineKeyboardButton> = (1..=count)
        .map(|i| InlineKeyboardButton::callback(i.to_string(), build_selection_callback(i)))
        .collect();
    let mut rows: Vec<Vec<InlineKeyboardButton>> = buttons
        .chunks(KEYBOARD_ROW_SIZE)
        .map(|row| row.to_vec())
        .collect();
    let mut nav = Vec::new();
    if has_prev {
        nav.push(InlineKeyboardButton::callback("Prev", build_page_callback(-1)));
    }
    if has_next {
        nav.push(InlineKeyboardButton::callback("Next", build_page_callback(1)));
    }
    if !nav.is_empty() {
        rows.push(nav);
    }
    InlineKeyboardMarkup::new(rows)
}

pub fn build_settings_keyboard(current: Variant) -> InlineKeyboardMarkup {
    let button = |variant: Variant| {
        let label = if variant == current {
            format!("{} (current)", variant.label())
        } else {
            variant.label().to_string()
        };
        InlineKeyboardButton::callback(label, build_setting_callback(variant))
    };
    InlineKeyboardMarkup::new(vec![vec![button(Variant::Alac), button(Variant::Flac)]])
}

pub fn help_text() -> &'static str {
    "Commands:
/search_song <keywords>   search for songs
/search_album <keywords>  search for albums
/search_artist <keywords> search for artists
/search <type> <keywords> unified search (type: song|album|artist)
/songid <id>              download a song by ID
/albumid <id>             download an album by ID
/id <song|album> <id>     download by ID
/settings [alac|flac]     set download format
/help                     show this message"
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::{types::InlineKeyboardButtonKind, ApiError};

    fn callback_data(button: &InlineKeyboardButton) -> &str {
        match &button.kind {
            InlineKeyboardButtonKind::CallbackData(data) => data,
            _ => panic!("not a callback button"),
        }
    }

    #[test]
    fn commands_are_case_insensitive_and_strip_bot_suffix() {
        let command = parse_command("/Search@MusicBot song  daft punk").unwrap();
        assert_eq!(command.name, "search");
        assert_eq!(command.args, vec!["song", "daft", "punk"]);
        assert!(parse_command("hello").is_none());
        assert_eq!(parse_command("/help").unwrap().args.len(), 0);
    }

    #[test]
    fn inline_ids_accept_shorthands() {
        assert_eq!(extract_inline_track_id("/songid 1440818"), "1440818");
        assert_eq!(extract_inline_track_id("SongID 42"), "42");
        assert_eq!(extract_inline_track_id("song: 77 "), "77");
        assert_eq!(extract_inline_track_id(" 99 "), "99");
        assert_eq!(extract_inline_track_id("/songid"), "");
        assert_eq!(extract_inline_track_id("   "), "");
    }

    #[test]
    fn selection_keyboard_rows_of_four_with_nav() {
        let keyboard = build_selection_keyboard(6, true, true);
        let rows = &keyboard.inline_keyboard;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].len(), 4);
        assert_eq!(rows[1].len(), 2);
        assert_eq!(callback_data(&rows[1][1]), "selection:6");
        assert_eq!(callback_data(&rows[2][0]), "page:-1");
        assert_eq!(callback_data(&rows[2][1]), "page:1");

        let single_page = build_selection_keyboard(3, false, false);
        assert_eq!(single_page.inline_keyboard.len(), 1);
    }

    #[test]
    fn settings_keyboard_marks_current() {
        let keyboard = build_settings_keyboard(Variant::Flac);
        let row = &keyboard.inline_keyboard[0];
        assert_eq!(row[0].text, "ALAC");
        assert_eq!(row[1].text, "FLAC (current)");
        assert_eq!(callback_data(&row[1]), "setting:flac");
    }

    #[test]
    fn unchanged_edits_are_not_errors() {
        assert!(edit_outcome(Err(RequestError::Api(ApiError::MessageNotModified))).is_ok());
        let err = edit_outcome(Err(RequestError::Api(ApiError::MessageToEditNotFound))).unwrap_err();
        assert!(matches!(err, AppError::Teloxide(_)));
    }

    #[test]
    fn help_lists_every_command() {
        for command in ["/search_song", "/search_album", "/search_artist", "/search ", "/songid", "/albumid", "/id ", "/settings"] {
            assert!(help_text().contains(command), "{command} missing");
        }
    }
}
