// Public modules
pub mod conversation_turn;
pub mod scoring_request;
pub mod simple_response;
pub mod streamed_chunk;

mod payload;

// Re-exports
pub use conversation_turn::{ConversationTurn, Role};
pub use scoring_request::{ChatHistoryEntry, HistoryInputs, ScoringRequest};
pub use simple_response::SimpleResponse;
pub use streamed_chunk::StreamedChunk;
