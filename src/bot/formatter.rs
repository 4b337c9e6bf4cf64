//! Splitting and delivering model replies.
//!
//! Each chunk goes through a fallback chain: rendered HTML first, the raw text
//! if rendering or the rich send fails, and a fixed apology as a last resort.

use crate::bot::transport::{ChatTransport, ReplyTarget, TextFormat};
use crate::utils;
use std::sync::Arc;
use tracing::{error, warn};

/// Sent when neither the rich nor the plain form of a chunk could be delivered.
pub const APOLOGY_TEXT: &str = "Sorry, I couldn't send you reply at the moment.";

/// Characters of a failing chunk kept in log records
const LOG_PREVIEW_CHARS: usize = 200;

/// How far down the fallback chain a chunk had to go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryLevel {
    /// Delivered as rendered HTML
    Rich,
    /// Delivered as unformatted text
    Plain,
    /// Only the apology got through
    Apology,
    /// Nothing was delivered
    Undelivered,
}

/// Split `text` into consecutive pieces of at most `max_len` characters.
///
/// Concatenating the pieces gives back `text`. Every piece but the last is
/// exactly `max_len` characters long. Markup may be cut in half; the renderer
/// rejects such chunks and they are sent plain.
#[must_use]
pub fn chunk(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut count = 0;

    for ch in text.chars() {
        if count == max_len {
            parts.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Delivers model output to a chat with graceful degradation
#[derive(Clone)]
pub struct ResponseFormatter {
    transport: Arc<dyn ChatTransport>,
    chunk_size: usize,
}

impl ResponseFormatter {
    /// Create a formatter that sends at most `chunk_size` characters per message
    #[must_use]
    pub fn new(transport: Arc<dyn ChatTransport>, chunk_size: usize) -> Self {
        Self {
            transport,
            chunk_size,
        }
    }

    /// Chunk `text` and deliver every chunk in order.
    ///
    /// A failed chunk does not stop the following ones.
    pub async fn deliver(&self, target: ReplyTarget, text: &str) -> Vec<DeliveryLevel> {
        let mut levels = Vec::new();
        for part in chunk(text, self.chunk_size) {
            levels.push(self.format_for_delivery(target, &part).await);
        }
        levels
    }

    /// Deliver a single chunk through the fallback chain
    pub async fn format_for_delivery(&self, target: ReplyTarget, part: &str) -> DeliveryLevel {
        let preview = utils::truncate_str(part, LOG_PREVIEW_CHARS);

        match utils::render_html(part) {
            Ok(html) => match self.transport.send_text(target, &html, TextFormat::Html).await {
                Ok(()) => return DeliveryLevel::Rich,
                Err(e) => warn!(
                    chat_id = target.chat_id,
                    chunk = %preview,
                    error = %e,
                    "Rich send failed, retrying as plain text"
                ),
            },
            Err(e) => warn!(
                chat_id = target.chat_id,
                chunk = %preview,
                error = %e,
                "Cannot render chunk, sending as plain text"
            ),
        }

        match self.transport.send_text(target, part, TextFormat::Plain).await {
            Ok(()) => return DeliveryLevel::Plain,
            Err(e) => warn!(
                chat_id = target.chat_id,
                chunk = %preview,
                error = %e,
                "Plain send failed, sending apology"
            ),
        }

        match self
            .transport
            .send_text(target, APOLOGY_TEXT, TextFormat::Plain)
            .await
        {
            Ok(()) => DeliveryLevel::Apology,
            Err(e) => {
                error!(
                    chat_id = target.chat_id,
                    chunk = %preview,
                    error = %e,
                    "Reply could not be delivered"
                );
                DeliveryLevel::Undelivered
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::transport::MockChatTransport;
    use mockall::Sequence;
    use proptest::prelude::*;
    use std::io::{self, Write};
    use std::sync::{Mutex, PoisonError};

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            let buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            String::from_utf8_lossy(&buf).into_owned()
        }
    }

    impl Write for LogBuffer {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const TARGET: ReplyTarget = ReplyTarget {
        chat_id: 10,
        message_id: Some(99),
    };

    #[test]
    fn test_chunk_exact_boundaries() {
        assert_eq!(chunk("abcdef", 3), vec!["abc", "def"]);
        assert_eq!(chunk("abcdefg", 3), vec!["abc", "def", "g"]);
        assert_eq!(chunk("ab", 3), vec!["ab"]);
        assert!(chunk("", 3).is_empty());
    }

    #[test]
    fn test_chunk_counts_characters_not_bytes() {
        let parts = chunk("שלום עולם", 4);
        assert_eq!(parts, vec!["שלום", " עול", "ם"]);
    }

    proptest! {
        #[test]
        fn prop_chunk_reassembles(text in "\\PC{0,300}", max_len in 1usize..64) {
            let parts = chunk(&text, max_len);
            prop_assert_eq!(parts.concat(), text.clone());

            let total = text.chars().count();
            prop_assert_eq!(parts.len(), total.div_ceil(max_len));
            for (i, part) in parts.iter().enumerate() {
                let len = part.chars().count();
                prop_assert!(len >= 1 && len <= max_len);
                if i + 1 < parts.len() {
                    prop_assert_eq!(len, max_len);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_rich_delivery() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_send_text()
            .withf(|_, text, format| *format == TextFormat::Html && text == "<b>hi</b>")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let formatter = ResponseFormatter::new(Arc::new(transport), 4096);
        assert_eq!(
            formatter.format_for_delivery(TARGET, "**hi**").await,
            DeliveryLevel::Rich
        );
    }

    #[tokio::test]
    async fn test_unrenderable_chunk_goes_plain() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_send_text()
            .withf(|_, text, format| *format == TextFormat::Plain && text == "```rust\nfn x")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let formatter = ResponseFormatter::new(Arc::new(transport), 4096);
        assert_eq!(
            formatter.format_for_delivery(TARGET, "```rust\nfn x").await,
            DeliveryLevel::Plain
        );
    }

    #[tokio::test]
    async fn test_rejected_html_falls_back_to_plain() {
        let mut seq = Sequence::new();
        let mut transport = MockChatTransport::new();
        transport
            .expect_send_text()
            .withf(|_, _, format| *format == TextFormat::Html)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(anyhow::anyhow!("can't parse entities")));
        transport
            .expect_send_text()
            .withf(|_, text, format| *format == TextFormat::Plain && text == "*hi*")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let formatter = ResponseFormatter::new(Arc::new(transport), 4096);
        assert_eq!(
            formatter.format_for_delivery(TARGET, "*hi*").await,
            DeliveryLevel::Plain
        );
    }

    #[tokio::test]
    async fn test_apology_when_plain_fails() {
        let mut seq = Sequence::new();
        let mut transport = MockChatTransport::new();
        transport
            .expect_send_text()
            .withf(|_, text, _| text != APOLOGY_TEXT)
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(anyhow::anyhow!("Bad Request")));
        transport
            .expect_send_text()
            .withf(|_, text, _| text == APOLOGY_TEXT)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let formatter = ResponseFormatter::new(Arc::new(transport), 4096);
        assert_eq!(
            formatter.format_for_delivery(TARGET, "hello").await,
            DeliveryLevel::Apology
        );
    }

    #[tokio::test]
    async fn test_everything_failing_is_reported() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_send_text()
            .times(3)
            .returning(|_, _, _| Err(anyhow::anyhow!("network down")));

        let formatter = ResponseFormatter::new(Arc::new(transport), 4096);
        assert_eq!(
            formatter.format_for_delivery(TARGET, "hello").await,
            DeliveryLevel::Undelivered
        );
    }

    #[tokio::test]
    async fn test_deliver_sends_every_chunk_in_order() {
        let mut seq = Sequence::new();
        let mut transport = MockChatTransport::new();
        for expected in ["abcd", "efgh", "ij"] {
            transport
                .expect_send_text()
                .withf(move |target, text, format| {
                    target.chat_id == 10 && text == expected && *format == TextFormat::Html
                })
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Ok(()));
        }

        let formatter = ResponseFormatter::new(Arc::new(transport), 4);
        let levels = formatter.deliver(TARGET, "abcdefghij").await;
        assert_eq!(levels, vec![DeliveryLevel::Rich; 3]);
    }

    #[tokio::test]
    async fn test_fallback_logs_name_the_failing_chunk() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut transport = MockChatTransport::new();
        transport
            .expect_send_text()
            .times(2)
            .returning(|_, _, _| Err(anyhow::anyhow!("network down")));

        let formatter = ResponseFormatter::new(Arc::new(transport), 4096);
        assert_eq!(
            formatter.format_for_delivery(TARGET, "```x").await,
            DeliveryLevel::Undelivered
        );

        let output = logs.contents();
        assert!(output.contains("Cannot render chunk"));
        assert!(output.contains("Plain send failed"));
        assert!(output.contains("Reply could not be delivered"));
        assert_eq!(output.matches("chunk=```x").count(), 3);
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_stop_the_next() {
        let mut seq = Sequence::new();
        let mut transport = MockChatTransport::new();
        transport
            .expect_send_text()
            .withf(|_, text, _| text == "ab" || text == APOLOGY_TEXT)
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(anyhow::anyhow!("Too Many Requests")));
        transport
            .expect_send_text()
            .withf(|_, text, format| text == "cd" && *format == TextFormat::Html)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let formatter = ResponseFormatter::new(Arc::new(transport), 2);
        let levels = formatter.deliver(TARGET, "abcd").await;
        assert_eq!(
            levels,
            vec![DeliveryLevel::Undelivered, DeliveryLevel::Rich]
        );
    }
}
