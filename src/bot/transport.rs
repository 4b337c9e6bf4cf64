//! Outbound messaging seam between the request pipeline and Telegram.
//!
//! Everything the bot sends goes through [`ChatTransport`], so the pipeline can
//! be driven in tests without a live bot token.

use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatId, InputFile, MessageId, ParseMode, ReplyParameters};

/// Presence action shown to the user while a request is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceAction {
    /// "typing..." indicator
    Typing,
    /// "sending photo..." indicator
    UploadPhoto,
}

/// Parse mode of an outgoing text message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    /// Telegram HTML subset
    Html,
    /// Sent verbatim
    Plain,
}

/// Where a reply goes: the originating chat, quoting the inbound message if known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTarget {
    /// Chat the reply is posted to
    pub chat_id: i64,
    /// Message being answered
    pub message_id: Option<i32>,
}

/// Outbound side of the messaging platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send one text message
    async fn send_text(&self, target: ReplyTarget, text: &str, format: TextFormat) -> Result<()>;
    /// Send one image
    async fn send_image(&self, target: ReplyTarget, image: Vec<u8>) -> Result<()>;
    /// Emit a single presence action
    async fn send_presence(&self, chat_id: i64, action: PresenceAction) -> Result<()>;
}

/// [`ChatTransport`] backed by the Telegram Bot API
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    /// Wrap a bot handle
    #[must_use]
    pub const fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn reply_parameters(target: ReplyTarget) -> Option<ReplyParameters> {
    target
        .message_id
        .map(|id| ReplyParameters::new(MessageId(id)).allow_sending_without_reply())
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(&self, target: ReplyTarget, text: &str, format: TextFormat) -> Result<()> {
        let mut req = self.bot.send_message(ChatId(target.chat_id), text.to_string());
        if format == TextFormat::Html {
            req = req.parse_mode(ParseMode::Html);
        }
        if let Some(params) = reply_parameters(target) {
            req = req.reply_parameters(params);
        }
        req.await?;
        Ok(())
    }

    async fn send_image(&self, target: ReplyTarget, image: Vec<u8>) -> Result<()> {
        let file = InputFile::memory(image).file_name("image.png");
        let mut req = self.bot.send_photo(ChatId(target.chat_id), file);
        if let Some(params) = reply_parameters(target) {
            req = req.reply_parameters(params);
        }
        req.await?;
        Ok(())
    }

    async fn send_presence(&self, chat_id: i64, action: PresenceAction) -> Result<()> {
        let action = match action {
            PresenceAction::Typing => ChatAction::Typing,
            PresenceAction::UploadPhoto => ChatAction::UploadPhoto,
        };
        self.bot.send_chat_action(ChatId(chat_id), action).await?;
        Ok(())
    }
}
