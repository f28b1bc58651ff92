use futures::StreamExt;

use crate::chat::{AnswerStream, ChatApp, Conversation};
use crate::client::Scorer;
use crate::error::Result;
use crate::observability::{CHAT_EXCHANGES, CHAT_FAILURES};
use crate::types::{ScoringRequest, SimpleResponse};

/// A chat that sends every message, with the history so far, to a [`Scorer`].
#[derive(Debug)]
pub struct EndpointChat<S: Scorer> {
    scorer: S,
    conversation: Conversation,
}

impl<S: Scorer> EndpointChat<S> {
    /// Creates a chat with an empty history.
    pub fn new(scorer: S) -> Self {
        Self {
            scorer,
            conversation: Conversation::new(),
        }
    }

    /// The scorer this chat talks to.
    pub fn scorer(&self) -> &S {
        &self.scorer
    }

    fn request(&self, message: &str) -> ScoringRequest {
        ScoringRequest::new(message, self.conversation.for_scoring())
    }
}

fn failed(err: &crate::Error) {
    CHAT_FAILURES.click();
    tracing::error!("chat request failed: {err}");
}

#[async_trait::async_trait]
impl<S: Scorer> ChatApp for EndpointChat<S> {
    fn history(&self) -> &Conversation {
        &self.conversation
    }

    fn history_mut(&mut self) -> &mut Conversation {
        &mut self.conversation
    }

    async fn respond_simple(&mut self, message: &str) -> Result<SimpleResponse> {
        let request = self.request(message);
        let response = self.scorer.score(&request).await.inspect_err(failed)?;
        self.conversation
            .record_exchange(message, response.answer.as_str());
        CHAT_EXCHANGES.click();
        Ok(response)
    }

    fn respond_stream<'a>(&'a mut self, message: &'a str) -> AnswerStream<'a> {
        Box::pin(async_stream::try_stream! {
            let request = self.request(message).streaming();
            let mut chunks = self.scorer.score_stream(&request).await.inspect_err(failed)?;
            let mut answer = String::new();
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.inspect_err(failed)?;
                answer.push_str(&chunk.answer);
                yield chunk;
            }
            self.conversation.record_exchange(message, answer);
            CHAT_EXCHANGES.click();
        })
    }
}
