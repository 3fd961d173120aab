//! Chatbot module - relays Telegram messages to a chat-completion API.

pub mod completion;
pub mod handler;
pub mod memory;
pub mod message;
pub mod prompt;
pub mod telegram;

pub use completion::CompletionClient;
pub use handler::{HandleError, MessageHandler};
pub use memory::{ConversationStore, MemoryScope, StoreError};
pub use message::{History, Message, Role};
pub use telegram::TelegramClient;
