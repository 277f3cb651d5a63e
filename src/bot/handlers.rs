//! Command, text and callback handlers.
//!
//! The front-end stays thin: parse what the user wants, gate it on the
//! channel subscription, hand it to the orchestrator, and translate the
//! terminal outcome into exactly one status message.

use crate::bot::delivery::TelegramDelivery;
use crate::bot::resilient::{edit_message_safe_resilient, send_message_resilient};
use crate::bot::search_cache::SearchCache;
use crate::bot::state::State;
use crate::config::Settings;
use crate::core::error::JobError;
use crate::core::orchestrator::{JobOutcome, JobRequest, Orchestrator};
use crate::extractor::{RequestKind, SearchHit};
use crate::utils::{format_duration, truncate_str};
use anyhow::Result;
use std::sync::Arc;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode, Recipient, UserId,
};
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

/// Shared dependencies for all handlers
pub struct BotContext {
    /// The orchestration core
    pub orchestrator: Arc<Orchestrator>,
    /// Application settings
    pub settings: Arc<Settings>,
    /// Live search results per user
    pub search_cache: SearchCache,
}

/// Dialogue handle used by message handlers
pub type BotDialogue = Dialogue<State, InMemStorage<State>>;

/// Supported bot commands
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    /// Welcome + kind picker
    #[command(description = "start and pick what to download.")]
    Start,
    /// Usage guide
    #[command(description = "how to use the bot.")]
    Help,
    /// Video download
    #[command(description = "download a video: /video <link>.")]
    Video(String),
    /// Audio download
    #[command(description = "download audio only: /audio <link>.")]
    Audio(String),
    /// Image download
    #[command(description = "download an image: /image <link>.")]
    Image(String),
    /// Instagram story download
    #[command(description = "download an Instagram story: /story <link>.")]
    Story(String),
    /// Metadata view
    #[command(description = "show link info: /info <link>.")]
    Info(String),
    /// Song search
    #[command(description = "search a song: /search <name>.")]
    Search(String),
    /// Developer-only statistics
    #[command(description = "bot statistics (developer only).")]
    Stats,
    /// Developer-only broadcast
    #[command(description = "message all users (developer only).")]
    Broadcast(String),
}

/// Safe extraction of user ID from a message.
/// Returns 0 if the user information is missing.
#[must_use]
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

/// The kind-picker shown by /start
#[must_use]
pub fn kind_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback("🎬 Video", "kind:video")],
        vec![
            InlineKeyboardButton::callback("🎵 Audio", "kind:audio"),
            InlineKeyboardButton::callback("🖼 Image", "kind:image"),
        ],
        vec![
            InlineKeyboardButton::callback("📸 Instagram story", "kind:story"),
            InlineKeyboardButton::callback("📊 Link info", "kind:info"),
        ],
        vec![InlineKeyboardButton::callback(
            "🔍 Song search",
            "kind:search",
        )],
    ])
}

fn subscription_keyboard(settings: &Settings) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    if let Some(link) = settings
        .channel_link
        .as_deref()
        .and_then(|l| reqwest::Url::parse(l).ok())
    {
        rows.push(vec![InlineKeyboardButton::url("📢 Join the channel", link)]);
    }
    rows.push(vec![InlineKeyboardButton::callback(
        "✅ I subscribed",
        "check_sub",
    )]);
    InlineKeyboardMarkup::new(rows)
}

async fn is_subscribed(bot: &Bot, settings: &Settings, user_id: i64) -> bool {
    let Some(channel) = settings.required_channel.as_deref() else {
        return true;
    };

    let recipient = Recipient::ChannelUsername(format!("@{channel}"));
    match bot
        .get_chat_member(recipient, UserId(user_id.unsigned_abs()))
        .await
    {
        // Owner, admin or plain member counts as subscribed
        Ok(member) => member.is_privileged() || member.is_member(),
        Err(e) => {
            warn!(user_id, error = %e, "subscription check failed");
            false
        }
    }
}

/// Subscription gate: sends the join prompt and returns `false` when the
/// user is not subscribed to the required channel.
async fn ensure_subscribed(bot: &Bot, ctx: &BotContext, chat_id: ChatId, user_id: i64) -> bool {
    if is_subscribed(bot, &ctx.settings, user_id).await {
        return true;
    }
    let text = "🔒 Please join our channel first!\n\n\
                Tap the button below to subscribe, then tap \"✅ I subscribed\".";
    let _ = bot
        .send_message(chat_id, text)
        .reply_markup(subscription_keyboard(&ctx.settings))
        .await;
    false
}

/// Dispatch one parsed command
///
/// # Errors
///
/// Propagates Telegram API failures worth logging at the dispatcher level.
pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    ctx: Arc<BotContext>,
    dialogue: BotDialogue,
) -> Result<()> {
    let chat_id = msg.chat.id;
    let user_id = get_user_id_safe(&msg);

    // Admin commands skip the subscription gate
    match &cmd {
        Command::Stats => return stats(&bot, &ctx, chat_id, user_id).await,
        Command::Broadcast(text) => {
            return broadcast(&bot, &ctx, chat_id, user_id, text.clone()).await
        }
        _ => {}
    }

    if !ensure_subscribed(&bot, &ctx, chat_id, user_id).await {
        return Ok(());
    }

    match cmd {
        Command::Start => start(&bot, &msg, &ctx, &dialogue).await,
        Command::Help => help(&bot, chat_id).await,
        Command::Video(url) => download_command(&bot, &ctx, &msg, RequestKind::Video, url).await,
        Command::Audio(url) => download_command(&bot, &ctx, &msg, RequestKind::Audio, url).await,
        Command::Image(url) => download_command(&bot, &ctx, &msg, RequestKind::Image, url).await,
        Command::Story(url) => download_command(&bot, &ctx, &msg, RequestKind::Story, url).await,
        Command::Info(url) => {
            if url.trim().is_empty() {
                send_usage_hint(&bot, chat_id, "/info https://youtube.com/...").await;
                return Ok(());
            }
            show_info(&bot, &ctx, chat_id, user_id, url.trim().to_string()).await
        }
        Command::Search(query) => {
            if query.trim().is_empty() {
                send_usage_hint(&bot, chat_id, "/search Imagine Dragons Believer").await;
                return Ok(());
            }
            run_search(&bot, &ctx, chat_id, user_id, query.trim().to_string()).await
        }
        Command::Stats | Command::Broadcast(_) => Ok(()),
    }
}

async fn start(bot: &Bot, msg: &Message, ctx: &BotContext, dialogue: &BotDialogue) -> Result<()> {
    let user_id = get_user_id_safe(msg);
    if let Some(user) = msg.from.as_ref() {
        ctx.orchestrator
            .stats()
            .record_user_seen(
                user_id,
                &user.full_name(),
                user.username.as_deref().unwrap_or("no handle"),
            )
            .await;
    }
    let _ = dialogue.update(State::Start).await;

    let welcome = "🎉 <b>Welcome!</b> I download media from social platforms.\n\n\
        📥 What I can fetch:\n\
        🎬 videos, 🎵 audio, 🖼 images, 📸 Instagram stories\n\n\
        🌐 YouTube, Instagram, TikTok, Facebook, Twitter/X, Pinterest, SoundCloud and more.\n\n\
        📝 Two ways to use me:\n\
        1️⃣ pick a type below, then send a link\n\
        2️⃣ or use commands directly:\n\
        /video &lt;link&gt;  /audio &lt;link&gt;  /image &lt;link&gt;\n\
        /story &lt;link&gt;  /info &lt;link&gt;  /search &lt;song name&gt;\n\n\
        ✨ Enjoy!";

    bot.send_message(msg.chat.id, welcome)
        .parse_mode(ParseMode::Html)
        .reply_markup(kind_keyboard())
        .await?;
    Ok(())
}

async fn help(bot: &Bot, chat_id: ChatId) -> Result<()> {
    let text = format!(
        "📚 <b>How to use the bot</b>\n\n\
         1️⃣ Buttons: /start, pick a type, send a link or a song name\n\
         2️⃣ Commands:\n{}\n\n\
         💡 Videos over 50 MB cannot be sent; try /audio for those.",
        html_escape::encode_text(&Command::descriptions().to_string())
    );
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

async fn send_usage_hint(bot: &Bot, chat_id: ChatId, example: &str) {
    let text = format!("⚠️ Please add a link or query after the command\nExample: {example}");
    if let Err(e) = bot.send_message(chat_id, text).await {
        error!(error = %e, "failed to send usage hint");
    }
}

async fn download_command(
    bot: &Bot,
    ctx: &BotContext,
    msg: &Message,
    kind: RequestKind,
    url: String,
) -> Result<()> {
    let url = url.trim().to_string();
    if url.is_empty() {
        let example = format!("/{} https://youtube.com/...", kind.label());
        send_usage_hint(bot, msg.chat.id, &example).await;
        return Ok(());
    }

    let task = DownloadTask {
        user_id: get_user_id_safe(msg),
        chat_id: msg.chat.id,
        kind,
        target: url,
        performer: None,
        status_id: None,
    };
    run_download(bot, ctx, task).await?;
    Ok(())
}

/// One download about to be submitted from the front-end
struct DownloadTask {
    user_id: i64,
    chat_id: ChatId,
    kind: RequestKind,
    target: String,
    performer: Option<String>,
    /// Reuse an existing status message instead of sending a new one
    status_id: Option<MessageId>,
}

fn spinner_text(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Video => "🎬 Downloading the video...",
        RequestKind::Audio => "🎵 Downloading the audio...",
        RequestKind::Image => "📸 Downloading the image...",
        RequestKind::Story => "📸 Downloading the story...",
        RequestKind::Song => "🎵 Downloading the song...",
    }
}

/// Submit the job and translate its outcome into one status message.
/// Returns `true` when the file was delivered.
async fn run_download(bot: &Bot, ctx: &BotContext, task: DownloadTask) -> Result<bool> {
    let status_id = match task.status_id {
        Some(id) => id,
        None => {
            send_message_resilient(bot, task.chat_id, spinner_text(task.kind), None)
                .await?
                .id
        }
    };

    let delivery = Arc::new(TelegramDelivery::new(
        bot.clone(),
        task.chat_id,
        task.performer.clone(),
    ));
    let request = JobRequest {
        user_id: task.user_id,
        kind: task.kind,
        target: task.target.clone(),
    };

    let handle = match ctx.orchestrator.submit(request, delivery).await {
        Ok(handle) => handle,
        Err(err) => {
            edit_message_safe_resilient(bot, task.chat_id, status_id, &format!("❌ {err}")).await;
            return Ok(false);
        }
    };

    match handle.outcome().await {
        JobOutcome::Delivered { title } => {
            info!(user_id = task.user_id, title = %title, "delivered");
            let _ = bot.delete_message(task.chat_id, status_id).await;
            Ok(true)
        }
        JobOutcome::TimedOut => {
            edit_message_safe_resilient(
                bot,
                task.chat_id,
                status_id,
                &format!("❌ {}", JobError::TimedOut),
            )
            .await;
            Ok(false)
        }
        JobOutcome::Failed(err) => {
            let mut text = format!("❌ {err}");
            if matches!(err, JobError::FileTooLarge { .. }) && task.kind == RequestKind::Video {
                text.push_str(&format!("\n💡 Try audio only: /audio {}", task.target));
            }
            edit_message_safe_resilient(bot, task.chat_id, status_id, &text).await;
            Ok(false)
        }
    }
}

async fn run_search(
    bot: &Bot,
    ctx: &BotContext,
    chat_id: ChatId,
    user_id: i64,
    query: String,
) -> Result<()> {
    let status =
        send_message_resilient(bot, chat_id, format!("🔍 Searching: {query}..."), None).await?;

    let hits = match ctx.orchestrator.search(user_id, &query).await {
        Ok(hits) => hits,
        Err(err) => {
            edit_message_safe_resilient(bot, chat_id, status.id, &format!("❌ {err}")).await;
            return Ok(());
        }
    };

    if hits.is_empty() {
        edit_message_safe_resilient(bot, chat_id, status.id, "❌ Nothing found").await;
        return Ok(());
    }

    let keyboard = search_results_keyboard(&hits);
    ctx.search_cache.store(user_id, hits).await;

    bot.edit_message_text(
        chat_id,
        status.id,
        format!("🎵 Results for: {query}\n\nPick the song to download:"),
    )
    .reply_markup(keyboard)
    .await?;
    Ok(())
}

fn search_results_keyboard(hits: &[SearchHit]) -> InlineKeyboardMarkup {
    let rows = hits
        .iter()
        .enumerate()
        .map(|(i, hit)| {
            let duration = hit
                .duration_secs
                .map_or_else(|| "?".to_string(), format_duration);
            let label = format!("🎵 {} ({duration})", truncate_str(&hit.title, 45));
            vec![InlineKeyboardButton::callback(label, format!("song:{i}"))]
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

async fn show_info(
    bot: &Bot,
    ctx: &BotContext,
    chat_id: ChatId,
    user_id: i64,
    url: String,
) -> Result<()> {
    let status = send_message_resilient(bot, chat_id, "🔍 Fetching info...", None).await?;

    match ctx.orchestrator.inspect(user_id, &url).await {
        Ok(probe) => {
            let duration = probe
                .duration_secs
                .map_or_else(|| "unknown".to_string(), format_duration);
            let views = probe
                .view_count
                .map_or_else(|| "unknown".to_string(), |v| v.to_string());
            let likes = probe
                .like_count
                .map_or_else(|| "unknown".to_string(), |v| v.to_string());
            let text = format!(
                "📊 <b>Content info</b>\n\n\
                 📌 Title: {}\n\
                 👤 Uploader: {}\n\
                 ⏱ Duration: {duration}\n\
                 👁 Views: {views}\n\
                 ❤️ Likes: {likes}",
                html_escape::encode_text(&probe.title),
                html_escape::encode_text(&probe.uploader),
            );
            bot.edit_message_text(chat_id, status.id, text)
                .parse_mode(ParseMode::Html)
                .await?;
        }
        Err(err) => {
            edit_message_safe_resilient(bot, chat_id, status.id, &format!("❌ {err}")).await;
        }
    }
    Ok(())
}

async fn stats(bot: &Bot, ctx: &BotContext, chat_id: ChatId, user_id: i64) -> Result<()> {
    if ctx.settings.developer_id != Some(user_id) {
        bot.send_message(chat_id, "⛔ This command is for the developer only")
            .await?;
        return Ok(());
    }

    let report = ctx.orchestrator.stats().report().await;
    bot.send_message(chat_id, report).await?;
    Ok(())
}

async fn broadcast(
    bot: &Bot,
    ctx: &BotContext,
    chat_id: ChatId,
    user_id: i64,
    text: String,
) -> Result<()> {
    if ctx.settings.developer_id != Some(user_id) {
        bot.send_message(chat_id, "⛔ This command is for the developer only")
            .await?;
        return Ok(());
    }
    if text.trim().is_empty() {
        send_usage_hint(bot, chat_id, "/broadcast Hello everyone!").await;
        return Ok(());
    }

    let status = send_message_resilient(bot, chat_id, "📤 Broadcasting...", None).await?;
    let targets = ctx.orchestrator.broadcast_targets().await;
    let message = format!("📢 Message from the developer:\n\n{}", text.trim());

    let mut sent = 0u32;
    let mut failed = 0u32;
    for target in targets {
        match bot.send_message(ChatId(target), message.clone()).await {
            Ok(_) => sent += 1,
            Err(e) => {
                failed += 1;
                warn!(target, error = %e, "broadcast delivery failed");
            }
        }
    }

    edit_message_safe_resilient(
        bot,
        chat_id,
        status.id,
        &format!("✅ Broadcast finished\n\n✅ sent: {sent}\n❌ failed: {failed}"),
    )
    .await;
    Ok(())
}

/// Plain text messages: search queries and bare links, routed by the
/// user's pending choice
///
/// # Errors
///
/// Propagates Telegram API failures worth logging at the dispatcher level.
pub async fn handle_text(
    bot: Bot,
    msg: Message,
    ctx: Arc<BotContext>,
    dialogue: BotDialogue,
) -> Result<()> {
    let Some(text) = msg.text().map(str::trim) else {
        return Ok(());
    };
    let chat_id = msg.chat.id;
    let user_id = get_user_id_safe(&msg);

    if !ensure_subscribed(&bot, &ctx, chat_id, user_id).await {
        return Ok(());
    }

    let state = dialogue.get().await.ok().flatten().unwrap_or_default();

    if let State::AwaitingSearchQuery = state {
        return run_search(&bot, &ctx, chat_id, user_id, text.to_string()).await;
    }

    if !text.starts_with("http://") && !text.starts_with("https://") {
        return Ok(());
    }

    match state {
        State::AwaitingTarget(kind) => {
            let task = DownloadTask {
                user_id,
                chat_id,
                kind,
                target: text.to_string(),
                performer: None,
                status_id: None,
            };
            run_download(&bot, &ctx, task).await?;
            Ok(())
        }
        State::AwaitingInfoTarget => show_info(&bot, &ctx, chat_id, user_id, text.to_string()).await,
        State::Start | State::AwaitingSearchQuery => {
            bot.send_message(chat_id, "⚠️ Pick what to download first:")
                .reply_markup(kind_keyboard())
                .await?;
            Ok(())
        }
    }
}

/// Inline keyboard presses: kind selection, subscription re-check and
/// song picks
///
/// # Errors
///
/// Propagates Telegram API failures worth logging at the dispatcher level.
pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    ctx: Arc<BotContext>,
    storage: Arc<InMemStorage<State>>,
) -> Result<()> {
    let Some(data) = q.data.clone() else {
        return Ok(());
    };

    let _ = bot.answer_callback_query(q.id.clone()).await;

    let user_id = q.from.id.0.cast_signed();
    let Some(message) = q.message.as_ref() else {
        return Ok(());
    };
    let chat_id = message.chat().id;
    let message_id = message.id();
    let dialogue = BotDialogue::new(storage, chat_id);

    if data == "check_sub" {
        return check_subscription_callback(&bot, &ctx, chat_id, message_id, user_id).await;
    }

    if let Some(kind) = data.strip_prefix("kind:") {
        return kind_selected(&bot, &dialogue, chat_id, message_id, kind).await;
    }

    if let Some(index) = data.strip_prefix("song:") {
        return song_picked(&bot, &ctx, chat_id, message_id, user_id, index).await;
    }

    Ok(())
}

async fn check_subscription_callback(
    bot: &Bot,
    ctx: &BotContext,
    chat_id: ChatId,
    message_id: MessageId,
    user_id: i64,
) -> Result<()> {
    if is_subscribed(bot, &ctx.settings, user_id).await {
        bot.edit_message_text(
            chat_id,
            message_id,
            "✅ Great, you're in!\nSend /start to begin 🎉",
        )
        .await?;
    } else {
        bot.edit_message_text(
            chat_id,
            message_id,
            "🔒 Still not subscribed. Join the channel, then tap \"✅ I subscribed\".",
        )
        .reply_markup(subscription_keyboard(&ctx.settings))
        .await?;
    }
    Ok(())
}

async fn kind_selected(
    bot: &Bot,
    dialogue: &BotDialogue,
    chat_id: ChatId,
    message_id: MessageId,
    kind: &str,
) -> Result<()> {
    let (state, prompt) = match kind {
        "video" => (
            State::AwaitingTarget(RequestKind::Video),
            "🎬 Video picked. Now send the link...",
        ),
        "audio" => (
            State::AwaitingTarget(RequestKind::Audio),
            "🎵 Audio picked. Now send the link...",
        ),
        "image" => (
            State::AwaitingTarget(RequestKind::Image),
            "🖼 Image picked. Now send the link...",
        ),
        "story" => (
            State::AwaitingTarget(RequestKind::Story),
            "📸 Story picked. Send a link like\nhttps://www.instagram.com/stories/username/123.../",
        ),
        "info" => (
            State::AwaitingInfoTarget,
            "📊 Info picked. Now send the link...",
        ),
        "search" => (
            State::AwaitingSearchQuery,
            "🔍 Song search picked. Send the song name...\n\nExample: Imagine Dragons Believer",
        ),
        _ => return Ok(()),
    };

    if let Err(e) = dialogue.update(state).await {
        error!(error = %e, "failed to update dialogue state");
    }

    bot.edit_message_text(chat_id, message_id, format!("{prompt}\n\n💡 Or pick another type:"))
        .reply_markup(kind_keyboard())
        .await?;
    Ok(())
}

async fn song_picked(
    bot: &Bot,
    ctx: &BotContext,
    chat_id: ChatId,
    message_id: MessageId,
    user_id: i64,
    index: &str,
) -> Result<()> {
    let Ok(index) = index.parse::<usize>() else {
        return Ok(());
    };

    let Some(hit) = ctx.search_cache.pick(user_id, index).await else {
        bot.edit_message_text(chat_id, message_id, "❌ Search expired. Please search again")
            .await?;
        return Ok(());
    };

    edit_message_safe_resilient(
        bot,
        chat_id,
        message_id,
        &format!("🎵 Downloading: {}...", truncate_str(&hit.title, 50)),
    )
    .await;

    let task = DownloadTask {
        user_id,
        chat_id,
        kind: RequestKind::Song,
        target: hit.url.clone(),
        performer: Some(hit.channel.clone()),
        status_id: Some(message_id),
    };

    if run_download(bot, ctx, task).await? {
        ctx.search_cache.clear(user_id).await;
    }
    Ok(())
}
