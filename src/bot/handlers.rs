//! teloxide glue: command parsing and conversion of Telegram messages
//! into [`InboundMessage`] for the request pipeline.

use crate::bot::dispatcher::{ChatKind, InboundMessage, Outcome, RequestDispatcher};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use teloxide::{
    prelude::*,
    types::{Me, ParseMode, ReplyParameters, User, UserId},
    utils::command::BotCommands,
};
use tracing::info;

/// Supported bot commands
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    /// Greet the user
    #[command(description = "Say hello.")]
    Start,
    /// Generate an image from a description
    #[command(description = "Generate an image: /image <description>.")]
    Image(String),
}

/// Telegram user ID as a signed 64-bit integer
#[must_use]
pub fn user_id(user: &User) -> i64 {
    user.id.0.cast_signed()
}

/// Convert a Telegram text message into the pipeline's view of it.
///
/// Returns `None` for messages without text or without a sender.
#[must_use]
pub fn inbound_message(msg: &Message, bot_handle: &str) -> Option<InboundMessage> {
    let text = msg.text()?;
    let user = msg.from.as_ref()?;
    let chat_kind = if msg.chat.is_group() || msg.chat.is_supergroup() {
        ChatKind::Group
    } else {
        ChatKind::Direct
    };

    Some(InboundMessage {
        chat_id: msg.chat.id.0,
        message_id: Some(msg.id.0),
        user_id: user_id(user),
        user_handle: user
            .username
            .clone()
            .unwrap_or_else(|| user.full_name()),
        text: text.to_string(),
        chat_kind,
        bot_handle: bot_handle.to_string(),
    })
}

/// HTML greeting that mentions the user by name
#[must_use]
pub fn greeting(id: UserId, full_name: &str) -> String {
    format!(
        "Shalom <a href=\"tg://user?id={id}\">{}</a>!",
        html_escape::encode_text(full_name)
    )
}

/// Handle `/start`
///
/// # Errors
///
/// Returns an error if the message has no sender or the greeting cannot be sent.
pub async fn start(bot: Bot, msg: Message) -> Result<()> {
    let user = msg
        .from
        .as_ref()
        .ok_or_else(|| anyhow!("/start without a sender"))?;
    info!(user_id = user_id(user), "Start command");

    bot.send_message(msg.chat.id, greeting(user.id, &user.full_name()))
        .parse_mode(ParseMode::Html)
        .reply_parameters(ReplyParameters::new(msg.id))
        .await?;
    Ok(())
}

/// Handle `/image <description>`
///
/// # Errors
///
/// Returns an error if the message carries no sender.
pub async fn image(
    msg: Message,
    prompt: String,
    dispatcher: Arc<RequestDispatcher>,
    me: Me,
) -> Result<Outcome> {
    let inbound = inbound_message(&msg, me.username())
        .ok_or_else(|| anyhow!("/image without text or sender"))?;
    Ok(dispatcher.image_reply(&inbound, &prompt).await)
}

/// Handle a non-command text message
///
/// # Errors
///
/// Returns an error if the message carries no sender.
pub async fn text(msg: Message, dispatcher: Arc<RequestDispatcher>, me: Me) -> Result<Outcome> {
    let inbound =
        inbound_message(&msg, me.username()).ok_or_else(|| anyhow!("text without sender"))?;
    Ok(dispatcher.text_reply(&inbound).await)
}
