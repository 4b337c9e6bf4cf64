//! Request orchestration for text and image replies.
//!
//! Every inbound request ends in exactly one [`Outcome`]. Failures are turned
//! into a single user-facing message here and never escape to the transport
//! layer.

use crate::bot::access::AccessGate;
use crate::bot::formatter::ResponseFormatter;
use crate::bot::ledger::BalanceLedger;
use crate::bot::presence::with_presence;
use crate::bot::transport::{ChatTransport, PresenceAction, ReplyTarget, TextFormat};
use crate::config::Settings;
use crate::llm::{ImageProvider, LlmError, TextProvider};
use crate::storage::{AccountStore, DebitOutcome};
use crate::utils::truncate_str;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reply to a user outside the allow-list asking for text
pub const TEXT_DENIED_REPLY: &str = "Sorry, you are not allowed to text with me.";
/// Reply to a user outside the allow-list asking for an image
pub const IMAGE_DENIED_REPLY: &str = "Sorry, you are not allowed to generate images.";
/// Reply to `/image` without a description
pub const IMAGE_USAGE_HINT: &str =
    "Please provide a description for the image after the /image command.";
/// Reply when the completion provider fails or answers with nothing
pub const TEXT_FAILURE_REPLY: &str = "Sorry, I couldn't process your message at the moment.";
/// Reply when the image provider answers without an image
pub const IMAGE_EMPTY_REPLY: &str = "Sorry, the image generation did not succeed.";
/// Reply when the image provider or the store fails
pub const IMAGE_FAILURE_REPLY: &str = "Sorry, there was an error generating your image.";
/// Reply when the balance was spent by a concurrent request during generation
pub const CHARGE_REJECTED_REPLY: &str =
    "Sorry, your balance is no longer enough to pay for this image.";

const LOG_PREVIEW_CHARS: usize = 200;

/// Kind of chat a message arrived in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    /// One-to-one chat with the bot
    Direct,
    /// Group or supergroup
    Group,
}

/// Transport-neutral view of an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Chat the message arrived in
    pub chat_id: i64,
    /// Message ID, used to quote it in the reply
    pub message_id: Option<i32>,
    /// Sender's user ID
    pub user_id: i64,
    /// Sender's handle, informational only
    pub user_handle: String,
    /// Full message text
    pub text: String,
    /// Direct or group chat
    pub chat_kind: ChatKind,
    /// The bot's own username, without `@`
    pub bot_handle: String,
}

impl InboundMessage {
    /// Where replies to this message go
    #[must_use]
    pub const fn reply_target(&self) -> ReplyTarget {
        ReplyTarget {
            chat_id: self.chat_id,
            message_id: self.message_id,
        }
    }

    /// Whether the text starts with `@<bot_handle>`
    #[must_use]
    pub fn mentions_bot(&self) -> bool {
        !self.bot_handle.is_empty()
            && self
                .text
                .strip_prefix('@')
                .is_some_and(|rest| rest.starts_with(&self.bot_handle))
    }
}

/// Terminal state reached by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Group message not addressed to the bot
    Ignored,
    /// `/image` without a description
    UsageHint,
    /// Sender is not on the allow-list
    AccessDenied,
    /// Balance below the image price
    InsufficientBalance {
        /// Balance at the time of the check
        balance: Decimal,
    },
    /// Provider call failed
    ProviderFailed,
    /// Provider answered without content
    EmptyResult,
    /// Generation succeeded but the debit was refused
    ChargeRejected,
    /// Store failure during a balance operation
    Aborted,
    /// Reply or image sent
    Delivered,
    /// Image paid for but the send failed
    ChargedUndelivered,
}

/// Read-only knobs of the request pipeline
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// System instruction for text completions
    pub system_prompt: String,
    /// Price of one image
    pub image_price: Decimal,
    /// Currency symbol for balance messages
    pub currency_symbol: String,
    /// Interval between presence actions
    pub presence_interval: Duration,
    /// Maximum characters per outgoing text message
    pub chunk_size: usize,
}

impl From<&Settings> for DispatcherSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            system_prompt: settings.system_prompt.clone(),
            image_price: settings.image_price,
            currency_symbol: settings.currency_symbol.clone(),
            presence_interval: settings.presence_interval(),
            chunk_size: settings.message_chunk_size,
        }
    }
}

/// Runs the provider call on its own task so a slow or panicking provider
/// cannot stall the presence loop or the caller.
async fn run_provider<T, F>(call: F) -> Result<T, LlmError>
where
    F: Future<Output = Result<T, LlmError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(call).await {
        Ok(result) => result,
        Err(e) => Err(LlmError::Unknown(format!("provider task failed: {e}"))),
    }
}

/// Orchestrates access, balance, presence, providers and delivery
pub struct RequestDispatcher {
    access: AccessGate,
    ledger: BalanceLedger,
    formatter: ResponseFormatter,
    transport: Arc<dyn ChatTransport>,
    text_provider: Arc<dyn TextProvider>,
    image_provider: Arc<dyn ImageProvider>,
    settings: DispatcherSettings,
}

impl RequestDispatcher {
    /// Wire the pipeline together
    #[must_use]
    pub fn new(
        store: Arc<dyn AccountStore>,
        transport: Arc<dyn ChatTransport>,
        text_provider: Arc<dyn TextProvider>,
        image_provider: Arc<dyn ImageProvider>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            access: AccessGate::new(Arc::clone(&store)),
            ledger: BalanceLedger::new(store),
            formatter: ResponseFormatter::new(Arc::clone(&transport), settings.chunk_size),
            transport,
            text_provider,
            image_provider,
            settings,
        }
    }

    /// Answer a plain text message with a model completion
    pub async fn text_reply(&self, msg: &InboundMessage) -> Outcome {
        if msg.chat_kind == ChatKind::Group && !msg.mentions_bot() {
            debug!(chat_id = msg.chat_id, "Group message not addressed to the bot, ignoring");
            return Outcome::Ignored;
        }

        info!(
            user_id = msg.user_id,
            user = %msg.user_handle,
            text = %truncate_str(&msg.text, LOG_PREVIEW_CHARS),
            "Text request"
        );

        if !self.access.is_allowed(msg.user_id).await {
            info!(user_id = msg.user_id, "Text request denied");
            self.reply(msg, TEXT_DENIED_REPLY).await;
            return Outcome::AccessDenied;
        }

        let provider = Arc::clone(&self.text_provider);
        let system_prompt = self.settings.system_prompt.clone();
        let user_text = msg.text.clone();
        let call = run_provider(async move { provider.complete(&system_prompt, &user_text).await });
        let result = self.while_signaling(msg.chat_id, PresenceAction::Typing, call).await;

        match result {
            Ok(reply) if !reply.trim().is_empty() => {
                let levels = self.formatter.deliver(msg.reply_target(), reply.trim()).await;
                info!(user_id = msg.user_id, chunks = levels.len(), "Text reply delivered");
                Outcome::Delivered
            }
            Ok(_) => {
                warn!(user_id = msg.user_id, "Completion provider returned empty text");
                self.reply(msg, TEXT_FAILURE_REPLY).await;
                Outcome::EmptyResult
            }
            Err(e) => {
                error!(user_id = msg.user_id, error = %e, "Completion provider failed");
                self.reply(msg, TEXT_FAILURE_REPLY).await;
                Outcome::ProviderFailed
            }
        }
    }

    /// Generate an image for `prompt` and charge it to the sender
    pub async fn image_reply(&self, msg: &InboundMessage, prompt: &str) -> Outcome {
        let prompt = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
        if prompt.is_empty() {
            self.reply(msg, IMAGE_USAGE_HINT).await;
            return Outcome::UsageHint;
        }

        info!(
            user_id = msg.user_id,
            user = %msg.user_handle,
            prompt = %truncate_str(&prompt, LOG_PREVIEW_CHARS),
            "Image request"
        );

        if !self.access.is_allowed(msg.user_id).await {
            info!(user_id = msg.user_id, "Image request denied");
            self.reply(msg, IMAGE_DENIED_REPLY).await;
            return Outcome::AccessDenied;
        }

        let price = self.settings.image_price;
        let check = match self.ledger.check_balance(msg.user_id, price).await {
            Ok(check) => check,
            Err(e) => {
                error!(user_id = msg.user_id, error = %e, "Balance check failed");
                self.reply(msg, IMAGE_FAILURE_REPLY).await;
                return Outcome::Aborted;
            }
        };
        if !check.sufficient {
            info!(user_id = msg.user_id, balance = %check.balance, "Insufficient balance");
            self.reply(msg, &self.insufficient_balance_text(check.balance))
                .await;
            return Outcome::InsufficientBalance {
                balance: check.balance,
            };
        }

        let provider = Arc::clone(&self.image_provider);
        let call = run_provider(async move { provider.generate(&prompt).await });
        let result = self
            .while_signaling(msg.chat_id, PresenceAction::UploadPhoto, call)
            .await;

        match result {
            Ok(image) if !image.is_empty() => self.charge_and_send(msg, image).await,
            Ok(_) => {
                warn!(user_id = msg.user_id, "Image provider returned no image");
                self.reply(msg, IMAGE_EMPTY_REPLY).await;
                Outcome::EmptyResult
            }
            Err(e) => {
                error!(user_id = msg.user_id, error = %e, "Image provider failed");
                self.reply(msg, IMAGE_FAILURE_REPLY).await;
                Outcome::ProviderFailed
            }
        }
    }

    // The debit happens before the send: a failure in between leaves the user
    // charged for an undelivered image, never the reverse.
    async fn charge_and_send(&self, msg: &InboundMessage, image: Vec<u8>) -> Outcome {
        let price = self.settings.image_price;
        match self.ledger.debit(msg.user_id, price).await {
            Ok(DebitOutcome::Applied) => {}
            Ok(DebitOutcome::NotFound) if price.is_zero() => {
                debug!(user_id = msg.user_id, "Free image for user without balance account");
            }
            Ok(DebitOutcome::NotFound | DebitOutcome::Insufficient) => {
                self.reply(msg, CHARGE_REJECTED_REPLY).await;
                return Outcome::ChargeRejected;
            }
            Err(e) => {
                error!(user_id = msg.user_id, error = %e, "Debit failed, image withheld");
                self.reply(msg, IMAGE_FAILURE_REPLY).await;
                return Outcome::Aborted;
            }
        }

        match self.transport.send_image(msg.reply_target(), image).await {
            Ok(()) => {
                info!(user_id = msg.user_id, "Image delivered");
                Outcome::Delivered
            }
            Err(e) => {
                error!(user_id = msg.user_id, error = %e, "Image charged but could not be sent");
                Outcome::ChargedUndelivered
            }
        }
    }

    fn insufficient_balance_text(&self, balance: Decimal) -> String {
        let cur = &self.settings.currency_symbol;
        format!(
            "Sorry, your current balance ({balance}{cur}) is not enough to generate an image. \
             Price per image is {}{cur}.",
            self.settings.image_price
        )
    }

    async fn while_signaling<F: Future>(
        &self,
        chat_id: i64,
        action: PresenceAction,
        work: F,
    ) -> F::Output {
        with_presence(
            Arc::clone(&self.transport),
            chat_id,
            action,
            self.settings.presence_interval,
            work,
        )
        .await
    }

    async fn reply(&self, msg: &InboundMessage, text: &str) {
        if let Err(e) = self
            .transport
            .send_text(msg.reply_target(), text, TextFormat::Plain)
            .await
        {
            error!(chat_id = msg.chat_id, error = %e, "Failed to send reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::transport::MockChatTransport;
    use crate::llm::{MockImageProvider, MockTextProvider};
    use crate::storage::{MockAccountStore, StorageError};
    use mockall::predicate::eq;
    use rust_decimal_macros::dec;

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            system_prompt: "Be brief.".to_string(),
            image_price: dec!(1.00),
            currency_symbol: "₪".to_string(),
            presence_interval: Duration::from_millis(5),
            chunk_size: 4096,
        }
    }

    fn message(text: &str, chat_kind: ChatKind) -> InboundMessage {
        InboundMessage {
            chat_id: 100,
            message_id: Some(7),
            user_id: 42,
            user_handle: "alice".to_string(),
            text: text.to_string(),
            chat_kind,
            bot_handle: "chatpix_bot".to_string(),
        }
    }

    fn quiet_transport() -> MockChatTransport {
        let mut transport = MockChatTransport::new();
        transport.expect_send_presence().returning(|_, _| Ok(()));
        transport
    }

    fn expect_plain_reply(transport: &mut MockChatTransport, expected: &'static str) {
        transport
            .expect_send_text()
            .withf(move |_, text, format| text == expected && *format == TextFormat::Plain)
            .times(1)
            .returning(|_, _, _| Ok(()));
    }

    fn dispatcher(
        store: MockAccountStore,
        transport: MockChatTransport,
        text: MockTextProvider,
        image: MockImageProvider,
    ) -> RequestDispatcher {
        RequestDispatcher::new(
            Arc::new(store),
            Arc::new(transport),
            Arc::new(text),
            Arc::new(image),
            settings(),
        )
    }

    #[test]
    fn test_mentions_bot() {
        assert!(message("@chatpix_bot hi", ChatKind::Group).mentions_bot());
        assert!(!message("hi @chatpix_bot", ChatKind::Group).mentions_bot());
        assert!(!message("chatpix_bot hi", ChatKind::Group).mentions_bot());
    }

    #[tokio::test]
    async fn test_group_message_without_mention_is_ignored() {
        let d = dispatcher(
            MockAccountStore::new(),
            MockChatTransport::new(),
            MockTextProvider::new(),
            MockImageProvider::new(),
        );
        let outcome = d.text_reply(&message("hello", ChatKind::Group)).await;
        assert_eq!(outcome, Outcome::Ignored);
    }

    #[tokio::test]
    async fn test_text_denied_without_provider_call() {
        let mut store = MockAccountStore::new();
        store.expect_is_allowed().with(eq(42)).returning(|_| Ok(false));
        let mut transport = MockChatTransport::new();
        expect_plain_reply(&mut transport, TEXT_DENIED_REPLY);
        let mut text = MockTextProvider::new();
        text.expect_complete().never();

        let d = dispatcher(store, transport, text, MockImageProvider::new());
        let outcome = d.text_reply(&message("hello", ChatKind::Direct)).await;
        assert_eq!(outcome, Outcome::AccessDenied);
    }

    #[tokio::test]
    async fn test_mentioned_group_message_is_answered_with_full_text() {
        let mut store = MockAccountStore::new();
        store.expect_is_allowed().returning(|_| Ok(true));
        let mut transport = quiet_transport();
        transport
            .expect_send_text()
            .withf(|_, text, format| text == "<b>pong</b>" && *format == TextFormat::Html)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut text = MockTextProvider::new();
        text.expect_complete()
            .withf(|system, user| system == "Be brief." && user == "@chatpix_bot ping")
            .times(1)
            .returning(|_, _| Ok("**pong**\n".to_string()));

        let d = dispatcher(store, transport, text, MockImageProvider::new());
        let outcome = d
            .text_reply(&message("@chatpix_bot ping", ChatKind::Group))
            .await;
        assert_eq!(outcome, Outcome::Delivered);
    }

    #[tokio::test]
    async fn test_text_provider_failure_sends_apology() {
        let mut store = MockAccountStore::new();
        store.expect_is_allowed().returning(|_| Ok(true));
        let mut transport = quiet_transport();
        expect_plain_reply(&mut transport, TEXT_FAILURE_REPLY);
        let mut text = MockTextProvider::new();
        text.expect_complete()
            .returning(|_, _| Err(LlmError::NetworkError("timeout".to_string())));

        let d = dispatcher(store, transport, text, MockImageProvider::new());
        let outcome = d.text_reply(&message("hello", ChatKind::Direct)).await;
        assert_eq!(outcome, Outcome::ProviderFailed);
    }

    #[tokio::test]
    async fn test_image_without_prompt_skips_authorization() {
        let mut store = MockAccountStore::new();
        store.expect_is_allowed().never();
        let mut transport = MockChatTransport::new();
        expect_plain_reply(&mut transport, IMAGE_USAGE_HINT);

        let d = dispatcher(store, transport, MockTextProvider::new(), MockImageProvider::new());
        let outcome = d
            .image_reply(&message("/image", ChatKind::Direct), "   ")
            .await;
        assert_eq!(outcome, Outcome::UsageHint);
    }

    #[tokio::test]
    async fn test_insufficient_balance_reports_amounts() {
        let mut store = MockAccountStore::new();
        store.expect_is_allowed().returning(|_| Ok(true));
        store.expect_get_balance().returning(|_| Ok(Some(dec!(0.50))));
        store.expect_atomic_debit().never();
        let mut transport = MockChatTransport::new();
        transport
            .expect_send_text()
            .withf(|_, text, _| {
                text == "Sorry, your current balance (0.50₪) is not enough to generate an image. \
                         Price per image is 1.00₪."
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut image = MockImageProvider::new();
        image.expect_generate().never();

        let d = dispatcher(store, transport, MockTextProvider::new(), image);
        let outcome = d
            .image_reply(&message("/image a cat", ChatKind::Direct), "a cat")
            .await;
        assert_eq!(
            outcome,
            Outcome::InsufficientBalance {
                balance: dec!(0.50)
            }
        );
    }

    #[tokio::test]
    async fn test_balance_store_failure_aborts() {
        let mut store = MockAccountStore::new();
        store.expect_is_allowed().returning(|_| Ok(true));
        store
            .expect_get_balance()
            .returning(|_| Err(StorageError::Config("down".to_string())));
        let mut transport = MockChatTransport::new();
        expect_plain_reply(&mut transport, IMAGE_FAILURE_REPLY);
        let mut image = MockImageProvider::new();
        image.expect_generate().never();

        let d = dispatcher(store, transport, MockTextProvider::new(), image);
        let outcome = d
            .image_reply(&message("/image a cat", ChatKind::Direct), "a cat")
            .await;
        assert_eq!(outcome, Outcome::Aborted);
    }

    #[tokio::test]
    async fn test_image_is_debited_before_send() {
        let mut seq = mockall::Sequence::new();
        let mut store = MockAccountStore::new();
        store.expect_is_allowed().returning(|_| Ok(true));
        store.expect_get_balance().returning(|_| Ok(Some(dec!(1.00))));
        store
            .expect_atomic_debit()
            .with(eq(42), eq(dec!(1.00)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(DebitOutcome::Applied));
        let mut transport = quiet_transport();
        transport
            .expect_send_image()
            .withf(|_, image| image == &vec![1, 2, 3])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        let mut image = MockImageProvider::new();
        image
            .expect_generate()
            .withf(|prompt| prompt == "a red cat")
            .returning(|_| Ok(vec![1, 2, 3]));

        let d = dispatcher(store, transport, MockTextProvider::new(), image);
        let outcome = d
            .image_reply(&message("/image a  red\ncat", ChatKind::Direct), " a  red\ncat ")
            .await;
        assert_eq!(outcome, Outcome::Delivered);
    }

    #[tokio::test]
    async fn test_lost_debit_race_withholds_image() {
        let mut store = MockAccountStore::new();
        store.expect_is_allowed().returning(|_| Ok(true));
        store.expect_get_balance().returning(|_| Ok(Some(dec!(1.00))));
        store
            .expect_atomic_debit()
            .returning(|_, _| Ok(DebitOutcome::Insufficient));
        let mut transport = quiet_transport();
        transport.expect_send_image().never();
        expect_plain_reply(&mut transport, CHARGE_REJECTED_REPLY);
        let mut image = MockImageProvider::new();
        image.expect_generate().returning(|_| Ok(vec![9]));

        let d = dispatcher(store, transport, MockTextProvider::new(), image);
        let outcome = d
            .image_reply(&message("/image cat", ChatKind::Direct), "cat")
            .await;
        assert_eq!(outcome, Outcome::ChargeRejected);
    }

    #[tokio::test]
    async fn test_debit_failure_aborts_without_sending() {
        let mut store = MockAccountStore::new();
        store.expect_is_allowed().returning(|_| Ok(true));
        store.expect_get_balance().returning(|_| Ok(Some(dec!(5.00))));
        store
            .expect_atomic_debit()
            .times(1)
            .returning(|_, _| Err(StorageError::Config("connection reset".to_string())));
        let mut transport = quiet_transport();
        transport.expect_send_image().never();
        expect_plain_reply(&mut transport, IMAGE_FAILURE_REPLY);
        let mut image = MockImageProvider::new();
        image.expect_generate().returning(|_| Ok(vec![4, 2]));

        let d = dispatcher(store, transport, MockTextProvider::new(), image);
        let outcome = d
            .image_reply(&message("/image owl", ChatKind::Direct), "owl")
            .await;
        assert_eq!(outcome, Outcome::Aborted);
    }

    #[tokio::test]
    async fn test_failed_send_after_debit_is_reported() {
        let mut store = MockAccountStore::new();
        store.expect_is_allowed().returning(|_| Ok(true));
        store.expect_get_balance().returning(|_| Ok(Some(dec!(1.00))));
        store
            .expect_atomic_debit()
            .times(1)
            .returning(|_, _| Ok(DebitOutcome::Applied));
        let mut transport = quiet_transport();
        transport
            .expect_send_image()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("file is too big")));
        transport.expect_send_text().never();
        let mut image = MockImageProvider::new();
        image.expect_generate().returning(|_| Ok(vec![4, 2]));

        let d = dispatcher(store, transport, MockTextProvider::new(), image);
        let outcome = d
            .image_reply(&message("/image owl", ChatKind::Direct), "owl")
            .await;
        assert_eq!(outcome, Outcome::ChargedUndelivered);
    }
}
