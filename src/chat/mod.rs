//! The base chat application.
//!
//! A [`ChatApp`] answers one user message at a time, either whole ([`ChatApp::respond_simple`])
//! or as a lazy stream of fragments ([`ChatApp::respond_stream`]).  Both record the exchange in
//! the app's [`Conversation`] only once the answer is complete; a failed or abandoned call leaves
//! the history exactly as it was.
//!
//! - [`conversation`]: the ordered user/assistant history
//! - [`session`]: [`EndpointChat`], the app that talks to a [`Scorer`](crate::Scorer)

mod conversation;
mod session;

use std::pin::Pin;

use futures::Stream;

use crate::error::Result;
use crate::types::{SimpleResponse, StreamedChunk};

pub use conversation::Conversation;
pub use session::EndpointChat;

/// A stream of answer fragments that borrows the app producing it.
pub type AnswerStream<'a> = Pin<Box<dyn Stream<Item = Result<StreamedChunk>> + Send + 'a>>;

/// A chat front-end's view of the model.
#[async_trait::async_trait]
pub trait ChatApp: Send {
    /// The conversation so far.
    fn history(&self) -> &Conversation;

    /// Mutable access to the conversation.
    fn history_mut(&mut self) -> &mut Conversation;

    /// Forget the conversation.
    fn clear(&mut self) {
        self.history_mut().clear();
    }

    /// Answer `message` in one piece.
    async fn respond_simple(&mut self, message: &str) -> Result<SimpleResponse>;

    /// Answer `message` incrementally.
    ///
    /// Nothing is sent until the stream is first polled.  The exchange is recorded after the last
    /// fragment; dropping the stream early records nothing.
    fn respond_stream<'a>(&'a mut self, message: &'a str) -> AnswerStream<'a>;
}
