// Public modules
pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod resolver;
pub mod sse;
pub mod trace;
pub mod types;
pub mod web;

// Re-exports
pub use chat::{AnswerStream, ChatApp, Conversation, EndpointChat};
pub use client::{ChunkStream, Scorer, ScoringClient};
pub use config::{Config, ServerSettings};
pub use error::{Error, Result};
pub use observability::register_biometrics;
pub use resolver::{
    AuthMode, EndpointDescriptor, EndpointResolver, ManagementResolver, StaticResolver,
};
pub use trace::{HttpTraceLine, HttpTraceLogger, TraceBuffer, TraceDirection};
pub use types::*;
pub use web::UiLevel;
