//! Telegram-backed implementation of the core `Delivery` trait.
//!
//! One value per job, bound to the requesting chat. Sends go through the
//! retry wrapper so a transient network hiccup does not burn an otherwise
//! finished download.

use crate::core::lifecycle::Delivery;
use crate::extractor::MediaKind;
use crate::utils::{retry_telegram_operation, truncate_str};
use async_trait::async_trait;
use std::path::Path;
use teloxide::prelude::*;
use teloxide::types::InputFile;

/// Telegram caption limit, with headroom for the emoji prefix
const CAPTION_LIMIT: usize = 950;

/// Sends finished files into one chat
pub struct TelegramDelivery {
    bot: Bot,
    chat_id: ChatId,
    /// Shown as the track performer for songs picked from search
    performer: Option<String>,
}

impl TelegramDelivery {
    /// Bind a delivery to the requesting chat
    #[must_use]
    pub const fn new(bot: Bot, chat_id: ChatId, performer: Option<String>) -> Self {
        Self {
            bot,
            chat_id,
            performer,
        }
    }
}

#[async_trait]
impl Delivery for TelegramDelivery {
    async fn send(&self, path: &Path, caption: &str, kind: MediaKind) -> anyhow::Result<()> {
        let title = truncate_str(caption, CAPTION_LIMIT);

        match kind {
            MediaKind::Video => {
                retry_telegram_operation(|| async {
                    self.bot
                        .send_video(self.chat_id, InputFile::file(path.to_path_buf()))
                        .caption(format!("🎬 {title}"))
                        .supports_streaming(true)
                        .await
                        .map_err(|e| anyhow::anyhow!("Telegram video send error: {e}"))
                })
                .await?;
            }
            MediaKind::Audio => {
                retry_telegram_operation(|| async {
                    let mut req = self
                        .bot
                        .send_audio(self.chat_id, InputFile::file(path.to_path_buf()))
                        .caption(match &self.performer {
                            Some(performer) => format!("🎵 {title}\n👤 {performer}"),
                            None => format!("🎵 {title}"),
                        })
                        .title(title.clone());
                    if let Some(performer) = &self.performer {
                        req = req.performer(performer.clone());
                    }
                    req.await
                        .map_err(|e| anyhow::anyhow!("Telegram audio send error: {e}"))
                })
                .await?;
            }
            MediaKind::Image => {
                retry_telegram_operation(|| async {
                    self.bot
                        .send_photo(self.chat_id, InputFile::file(path.to_path_buf()))
                        .caption(format!("📸 {title}"))
                        .await
                        .map_err(|e| anyhow::anyhow!("Telegram photo send error: {e}"))
                })
                .await?;
            }
        }

        Ok(())
    }
}
