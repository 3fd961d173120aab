//! Telegram client using teloxide.

use teloxide::prelude::*;
use teloxide::types::{ChatAction, MessageId, ReplyParameters};
use tracing::{debug, warn};

/// Telegram rejects messages longer than this many UTF-16 code units.
pub const MAX_MESSAGE_UNITS: usize = 4096;

/// Outbound side of the messaging boundary.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    /// Send plain text, split into as many messages as Telegram needs.
    ///
    /// Model output is sent without a parse mode so stray markup can't make
    /// the request fail. Only the first chunk is threaded as a reply.
    pub async fn send_text(&self, chat_id: i64, text: &str, reply_to_message_id: Option<i32>) -> Result<(), String> {
        let chat_id = ChatId(chat_id);
        let chunks = split_message(text, MAX_MESSAGE_UNITS);
        debug!("Sending {} chunk(s) to chat {}", chunks.len(), chat_id);

        for (i, chunk) in chunks.iter().enumerate() {
            let mut request = self.bot.send_message(chat_id, *chunk);
            if i == 0
                && let Some(msg_id) = reply_to_message_id
            {
                request = request.reply_parameters(ReplyParameters::new(MessageId(msg_id)));
            }

            request.await.map_err(|e| {
                let msg = format!("Failed to send: {e}");
                warn!("{}", msg);
                msg
            })?;
        }

        Ok(())
    }

    /// Show "typing…" while the model works. Failures are only logged.
    pub async fn send_typing(&self, chat_id: i64) {
        if let Err(e) = self.bot.send_chat_action(ChatId(chat_id), ChatAction::Typing).await {
            debug!("Failed to send typing action: {e}");
        }
    }
}

/// Split `text` into chunks of at most `max_units` UTF-16 code units.
///
/// Prefers breaking after a newline, then after whitespace, and only cuts
/// mid-word when a chunk has neither. Empty input yields one empty chunk.
pub fn split_message(text: &str, max_units: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while utf16_len(rest) > max_units {
        // Byte offset just past the longest prefix that fits
        let mut units = 0;
        let mut limit = 0;
        for c in rest.chars() {
            units += c.len_utf16();
            if units > max_units {
                break;
            }
            limit += c.len_utf8();
        }
        if limit == 0 {
            // A limit below one character still has to make progress
            limit = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let head = &rest[..limit];

        let cut = head
            .rfind('\n')
            .or_else(|| head.rfind(char::is_whitespace))
            .map(|i| i + head[i..].chars().next().map(char::len_utf8).unwrap_or(1))
            .unwrap_or(limit);

        chunks.push(&rest[..cut]);
        rest = &rest[cut..];
    }

    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest);
    }
    chunks
}

fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}
