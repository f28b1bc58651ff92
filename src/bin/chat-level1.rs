//! Chat with a hosted scoring endpoint from the browser.
//!
//! Level 1: complete answers, one request per message.
//!
//! Reads its settings from the environment (and `.env`), resolves the endpoint, then serves the
//! chat page on `CHAT_BIND_ADDR` (default `127.0.0.1:7860`) until Ctrl-C.

use std::process::ExitCode;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use endpoint_chat::UiLevel;
use endpoint_chat::config::load_dotenv;
use endpoint_chat::web::launch;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    load_dotenv(".env");
    match launch(UiLevel::OneShot).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
