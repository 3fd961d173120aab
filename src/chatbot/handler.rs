//! Inbound message handling: history in, model reply out.
//!
//! This is the port the Telegram runtime calls. It knows nothing about
//! teloxide; a conversation is just an id and the text that arrived.

use std::fmt;
use std::path::PathBuf;
use tracing::info;

use crate::chatbot::completion::{self, CompletionClient};
use crate::chatbot::memory::{ConversationStore, StoreError};
use crate::chatbot::message::Message;
use crate::chatbot::prompt::load_system_prompt;

/// A failed handling cycle. Nothing was persisted.
#[derive(Debug)]
pub enum HandleError {
    Storage(StoreError),
    Completion(completion::Error),
}

impl HandleError {
    /// Text shown to the user in place of a reply.
    pub fn user_message(&self) -> &'static str {
        match self {
            HandleError::Storage(StoreError::Corrupt { .. }) => {
                "⚠️ Our conversation history is damaged. Send /reset to start over."
            }
            HandleError::Storage(_) => "⚠️ Sorry, I couldn't access our conversation history. Please try again later.",
            HandleError::Completion(completion::Error::Timeout) => {
                "⚠️ The model took too long to answer. Please try again."
            }
            HandleError::Completion(_) => "⚠️ Sorry, I couldn't get a reply from the model. Please try again.",
        }
    }
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleError::Storage(e) => write!(f, "storage: {e}"),
            HandleError::Completion(e) => write!(f, "completion: {e}"),
        }
    }
}

impl std::error::Error for HandleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandleError::Storage(e) => Some(e),
            HandleError::Completion(e) => Some(e),
        }
    }
}

impl From<StoreError> for HandleError {
    fn from(e: StoreError) -> Self {
        HandleError::Storage(e)
    }
}

impl From<completion::Error> for HandleError {
    fn from(e: completion::Error) -> Self {
        HandleError::Completion(e)
    }
}

pub struct MessageHandler {
    store: ConversationStore,
    client: CompletionClient,
    system_prompt_file: PathBuf,
}

impl MessageHandler {
    pub fn new(store: ConversationStore, client: CompletionClient, system_prompt_file: PathBuf) -> Self {
        Self {
            store,
            client,
            system_prompt_file,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Run one exchange and return the reply to deliver.
    ///
    /// Holds the conversation lock from load to save, so concurrent messages
    /// against the same history are applied one after another.
    pub async fn handle(&self, conversation_id: i64, text: &str) -> Result<String, HandleError> {
        let _guard = self.store.lock(conversation_id).await;

        let history = self.store.load(conversation_id).await?;
        let history = self.store.append_and_bound(history, Message::user(text));

        let system_prompt = load_system_prompt(&self.system_prompt_file).await;
        let reply = self.client.complete(&system_prompt, &history).await?;

        let history = self.store.append_and_bound(history, Message::assistant(reply.clone()));
        self.store.save(conversation_id, &history).await?;

        info!(
            "💬 Replied in chat {} ({} chars, model {})",
            conversation_id,
            reply.chars().count(),
            self.client.model()
        );
        Ok(reply)
    }

    /// Forget the conversation's history.
    pub async fn reset(&self, conversation_id: i64) -> Result<(), HandleError> {
        let _guard = self.store.lock(conversation_id).await;
        self.store.clear(conversation_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatbot::memory::MemoryScope;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    struct Fixture {
        dir: TempDir,
        server: MockServer,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join("system_prompt.txt"), "You are helpful.").unwrap();
            Self {
                dir,
                server: MockServer::start().await,
            }
        }

        fn handler(&self, scope: MemoryScope) -> MessageHandler {
            let store = ConversationStore::new(self.dir.path().join("memory.json"), scope, 10);
            let client = CompletionClient::new("sk-test".into(), "openai/gpt-3.5-turbo".into(), Duration::from_secs(5))
                .unwrap()
                .with_api_url(format!("{}/chat/completions", self.server.uri()));
            MessageHandler::new(store, client, self.dir.path().join("system_prompt.txt"))
        }

        async fn reply_with(&self, content: &str) {
            Mock::given(method("POST"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(json!({"choices": [{"message": {"content": content}}]})),
                )
                .mount(&self.server)
                .await;
        }
    }

    /// Replies "re: <last user message>" so each exchange is distinguishable.
    fn echo(request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let last = body["messages"].as_array().unwrap().last().unwrap()["content"]
            .as_str()
            .unwrap()
            .to_string();
        ResponseTemplate::new(200)
            .set_body_json(json!({"choices": [{"message": {"content": format!("re: {last}")}}]}))
            .set_delay(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_first_exchange() {
        let fx = Fixture::new().await;
        fx.reply_with("hello!").await;
        let handler = fx.handler(MemoryScope::Shared);

        let reply = handler.handle(1, "hi").await.unwrap();
        assert_eq!(reply, "hello!");
        assert_eq!(
            handler.store().load(1).await.unwrap(),
            vec![Message::user("hi"), Message::assistant("hello!")]
        );

        let requests = fx.server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(
            body["messages"],
            json!([
                {"role": "system", "content": "You are helpful."},
                {"role": "user", "content": "hi"}
            ])
        );
    }

    #[tokio::test]
    async fn test_full_window_evicts_oldest_two() {
        let fx = Fixture::new().await;
        fx.reply_with("answer").await;
        let handler = fx.handler(MemoryScope::Shared);

        let preloaded: Vec<Message> = (0..10)
            .map(|i| if i % 2 == 0 { Message::user(format!("q{i}")) } else { Message::assistant(format!("a{i}")) })
            .collect();
        handler.store().save(1, &preloaded).await.unwrap();

        handler.handle(1, "new question").await.unwrap();

        let saved = handler.store().load(1).await.unwrap();
        assert_eq!(saved.len(), 10);
        assert_eq!(&saved[..8], &preloaded[2..]);
        assert_eq!(saved[8], Message::user("new question"));
        assert_eq!(saved[9], Message::assistant("answer"));

        // The model saw the oldest entry evicted once the user turn was appended
        let requests = fx.server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        let sent = body["messages"].as_array().unwrap();
        assert_eq!(sent.len(), 11);
        assert_eq!(sent[1]["content"], "a1");
    }

    #[tokio::test]
    async fn test_completion_failure_leaves_history() {
        let fx = Fixture::new().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&fx.server)
            .await;
        let handler = fx.handler(MemoryScope::Shared);
        let before = vec![Message::user("old"), Message::assistant("reply")];
        handler.store().save(1, &before).await.unwrap();

        let err = handler.handle(1, "hi").await.unwrap_err();
        assert!(matches!(err, HandleError::Completion(completion::Error::Status { status: 500, .. })));
        assert!(!err.user_message().is_empty());
        assert_eq!(handler.store().load(1).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_corrupt_memory_is_reported() {
        let fx = Fixture::new().await;
        fx.reply_with("unused").await;
        let handler = fx.handler(MemoryScope::Shared);
        std::fs::write(fx.dir.path().join("memory.json"), "not json").unwrap();

        let err = handler.handle(1, "hi").await.unwrap_err();
        assert!(matches!(err, HandleError::Storage(StoreError::Corrupt { .. })));
        assert!(err.user_message().contains("/reset"));
        // The model is never called and the file is left for inspection
        assert!(fx.server.received_requests().await.unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(fx.dir.path().join("memory.json")).unwrap(), "not json");
    }

    #[tokio::test]
    async fn test_unreadable_memory_is_reported() {
        let fx = Fixture::new().await;
        fx.reply_with("unused").await;
        let handler = fx.handler(MemoryScope::Shared);
        std::fs::create_dir(fx.dir.path().join("memory.json")).unwrap();

        let err = handler.handle(1, "hi").await.unwrap_err();
        assert!(matches!(err, HandleError::Storage(StoreError::Read { .. })), "{err}");
        assert!(err.user_message().contains("try again later"));
        assert!(fx.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_prompt_sends_empty_system_message() {
        let fx = Fixture::new().await;
        fx.reply_with("ok").await;
        std::fs::remove_file(fx.dir.path().join("system_prompt.txt")).unwrap();
        let handler = fx.handler(MemoryScope::Shared);

        handler.handle(1, "hi").await.unwrap();

        let requests = fx.server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["messages"][0], json!({"role": "system", "content": ""}));
    }

    #[tokio::test]
    async fn test_shared_scope_mixes_chats() {
        let fx = Fixture::new().await;
        fx.reply_with("ok").await;
        let handler = fx.handler(MemoryScope::Shared);

        handler.handle(1, "from one").await.unwrap();
        handler.handle(2, "from two").await.unwrap();

        let history = handler.store().load(3).await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0], Message::user("from one"));
        assert_eq!(history[2], Message::user("from two"));
    }

    #[tokio::test]
    async fn test_per_chat_scope_isolates() {
        let fx = Fixture::new().await;
        fx.reply_with("ok").await;
        let handler = fx.handler(MemoryScope::PerChat);

        handler.handle(1, "from one").await.unwrap();
        handler.handle(2, "from two").await.unwrap();

        assert_eq!(handler.store().load(1).await.unwrap()[0], Message::user("from one"));
        assert_eq!(handler.store().load(2).await.unwrap()[0], Message::user("from two"));
    }

    #[tokio::test]
    async fn test_concurrent_messages_keep_both_turns() {
        let fx = Fixture::new().await;
        Mock::given(method("POST")).respond_with(echo).mount(&fx.server).await;
        let handler = Arc::new(fx.handler(MemoryScope::Shared));

        let a = tokio::spawn({
            let handler = handler.clone();
            async move { handler.handle(1, "first").await }
        });
        let b = tokio::spawn({
            let handler = handler.clone();
            async move { handler.handle(2, "second").await }
        });
        assert_eq!(a.await.unwrap().unwrap(), "re: first");
        assert_eq!(b.await.unwrap().unwrap(), "re: second");

        let history = handler.store().load(1).await.unwrap();
        assert_eq!(history.len(), 4);
        assert!(history.contains(&Message::user("first")));
        assert!(history.contains(&Message::user("second")));
        assert!(history.contains(&Message::assistant("re: first")));
        assert!(history.contains(&Message::assistant("re: second")));
    }

    #[tokio::test]
    async fn test_reset() {
        let fx = Fixture::new().await;
        fx.reply_with("ok").await;
        let handler = fx.handler(MemoryScope::Shared);

        handler.handle(1, "remember me").await.unwrap();
        handler.reset(1).await.unwrap();
        assert!(handler.store().load(1).await.unwrap().is_empty());
    }
}
