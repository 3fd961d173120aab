//! Telegram chat relay: forwards messages plus a bounded conversation history
//! to a chat-completion API and replies with the model's answer.

pub mod chatbot;
pub mod config;
