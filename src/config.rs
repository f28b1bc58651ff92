//! Configuration loaded from the environment.
//!
//! [`Config`] identifies the workspace, endpoint and deployment to chat with; it is read once at
//! startup and never changes afterwards.  [`ServerSettings`] holds the knobs of the local web
//! front-end.  Both can be seeded from a `.env` file via [`load_dotenv`].

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Azure subscription that owns the workspace.
pub const SUBSCRIPTION_ID: &str = "SUBSCRIPTION_ID";
/// Resource group of the workspace.
pub const RESOURCE_GROUP_NAME: &str = "RESOURCE_GROUP_NAME";
/// Machine learning workspace name.
pub const WORKSPACE_NAME: &str = "WORKSPACE_NAME";
/// Online endpoint name.
pub const ENDPOINT_NAME: &str = "ENDPOINT_NAME";
/// Deployment behind the endpoint.
pub const DEPLOYMENT_NAME: &str = "DEPLOYMENT_NAME";
/// Static bearer token for the management API.
pub const AZURE_MANAGEMENT_TOKEN: &str = "AZURE_MANAGEMENT_TOKEN";
/// Base URL of the management API.
pub const AZURE_MANAGEMENT_URL: &str = "AZURE_MANAGEMENT_URL";
/// Pre-resolved scoring URI; skips the management lookup when set together with `SCORING_KEY`.
pub const SCORING_URI: &str = "SCORING_URI";
/// Pre-resolved scoring key.
pub const SCORING_KEY: &str = "SCORING_KEY";
/// Address the local web front-end binds to.
pub const CHAT_BIND_ADDR: &str = "CHAT_BIND_ADDR";
/// Scoring request timeout in seconds.
pub const SCORING_TIMEOUT_SECS: &str = "SCORING_TIMEOUT_SECS";
/// Per-character delay when a complete answer is replayed as a stream.
pub const STREAM_REPLAY_DELAY_MS: &str = "STREAM_REPLAY_DELAY_MS";
/// Most browser sessions kept in memory at once.
pub const CHAT_MAX_SESSIONS: &str = "CHAT_MAX_SESSIONS";

const DEFAULT_MANAGEMENT_URL: &str = "https://management.azure.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_REPLAY_DELAY: Duration = Duration::from_millis(10);

/// Load a `.env` file from the current directory or one of its parents.
///
/// Returns false if no file was found; variables already set in the process environment win.
pub fn load_dotenv(filename: &str) -> bool {
    tracing::info!("Loading {filename} info...");
    match dotenvy::from_filename(filename) {
        Ok(path) => {
            tracing::debug!(path = %path.display(), "loaded environment file");
            true
        }
        Err(err) => {
            tracing::warn!("{filename} file not found or couldn't be loaded: {err}");
            false
        }
    }
}

/// Identifiers of the scoring endpoint to chat with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Azure subscription id.
    pub subscription_id: String,

    /// Resource group name.
    pub resource_group: String,

    /// Machine learning workspace name.
    pub workspace_name: String,

    /// Online endpoint name.
    pub endpoint_name: String,

    /// Deployment name.
    pub deployment_name: String,

    /// Bearer token for the management API.
    pub management_token: Option<String>,

    /// Base URL of the management API.
    pub management_url: String,

    /// Pre-resolved scoring URI.
    pub scoring_uri: Option<String>,

    /// Pre-resolved scoring key.
    pub scoring_key: Option<String>,
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name to its value.
    ///
    /// Blank values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let required = |name: &str| {
            optional(name).ok_or_else(|| {
                tracing::error!("Environment variable {name} is missing.");
                Error::configuration(
                    format!("required environment variable '{name}' is not set"),
                    Some(name.to_string()),
                )
            })
        };

        Ok(Self {
            subscription_id: required(SUBSCRIPTION_ID)?,
            resource_group: required(RESOURCE_GROUP_NAME)?,
            workspace_name: required(WORKSPACE_NAME)?,
            endpoint_name: required(ENDPOINT_NAME)?,
            deployment_name: required(DEPLOYMENT_NAME)?,
            management_token: optional(AZURE_MANAGEMENT_TOKEN),
            management_url: optional(AZURE_MANAGEMENT_URL)
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_MANAGEMENT_URL.to_string()),
            scoring_uri: optional(SCORING_URI),
            scoring_key: optional(SCORING_KEY),
        })
    }

    /// Returns true if the scoring endpoint was supplied directly.
    pub fn has_static_endpoint(&self) -> bool {
        self.scoring_uri.is_some() && self.scoring_key.is_some()
    }

    /// The management API path of the workspace.
    pub fn workspace_path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.MachineLearningServices/workspaces/{}",
            self.subscription_id, self.resource_group, self.workspace_name
        )
    }
}

/// Settings of the local web front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Address to listen on.
    pub bind_addr: SocketAddr,

    /// Timeout applied to every scoring request.
    pub request_timeout: Duration,

    /// Delay between characters when a complete answer is replayed as a stream.
    pub replay_delay: Duration,

    /// Sessions kept before the least recently used one is dropped.
    pub max_sessions: usize,
}

impl ServerSettings {
    /// Read the settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read the settings through `lookup`; unset variables fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let bind_addr = match lookup(CHAT_BIND_ADDR) {
            Some(addr) => addr.parse().map_err(|_| {
                Error::configuration(
                    format!("'{addr}' is not a socket address"),
                    Some(CHAT_BIND_ADDR.to_string()),
                )
            })?,
            None => defaults.bind_addr,
        };
        let request_timeout = parse_u64(&lookup, SCORING_TIMEOUT_SECS)?
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);
        let replay_delay = parse_u64(&lookup, STREAM_REPLAY_DELAY_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.replay_delay);
        let max_sessions = match parse_u64(&lookup, CHAT_MAX_SESSIONS)? {
            Some(0) => {
                return Err(Error::configuration(
                    "at least one session must be allowed",
                    Some(CHAT_MAX_SESSIONS.to_string()),
                ));
            }
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
            None => defaults.max_sessions,
        };
        Ok(Self {
            bind_addr,
            request_timeout,
            replay_delay,
            max_sessions,
        })
    }

    /// Sets the bind address.
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the replay delay.
    pub fn with_replay_delay(mut self, delay: Duration) -> Self {
        self.replay_delay = delay;
        self
    }

    /// Sets the session cap.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7860)),
            request_timeout: DEFAULT_TIMEOUT,
            replay_delay: DEFAULT_REPLAY_DELAY,
            max_sessions: crate::web::DEFAULT_MAX_SESSIONS,
        }
    }
}

fn parse_u64<F>(lookup: &F, name: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => value.trim().parse().map(Some).map_err(|_| {
            Error::configuration(
                format!("'{value}' is not a non-negative integer"),
                Some(name.to_string()),
            )
        }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn complete() -> Vec<(&'static str, &'static str)> {
        vec![
            (SUBSCRIPTION_ID, "00000000-0000-0000-0000-000000000000"),
            (RESOURCE_GROUP_NAME, "rg-chat"),
            (WORKSPACE_NAME, "ws-chat"),
            (ENDPOINT_NAME, "chat-ep"),
            (DEPLOYMENT_NAME, "blue"),
        ]
    }

    #[test]
    fn required_variables() {
        let config = Config::from_lookup(lookup_from(&complete())).unwrap();
        assert_eq!(config.resource_group, "rg-chat");
        assert_eq!(config.endpoint_name, "chat-ep");
        assert_eq!(config.deployment_name, "blue");
        assert_eq!(config.management_url, DEFAULT_MANAGEMENT_URL);
        assert!(config.management_token.is_none());
        assert!(!config.has_static_endpoint());
    }

    #[test]
    fn each_missing_variable_is_named() {
        for missing in [
            SUBSCRIPTION_ID,
            RESOURCE_GROUP_NAME,
            WORKSPACE_NAME,
            ENDPOINT_NAME,
            DEPLOYMENT_NAME,
        ] {
            let vars: Vec<_> = complete()
                .into_iter()
                .filter(|(k, _)| *k != missing)
                .collect();
            let err = Config::from_lookup(lookup_from(&vars)).unwrap_err();
            assert!(err.is_configuration());
            assert!(
                matches!(err, Error::Configuration { variable: Some(ref v), .. } if v == missing)
            );
        }
    }

    #[test]
    fn blank_counts_as_missing() {
        let vars: Vec<_> = complete()
            .into_iter()
            .map(|(k, v)| if k == ENDPOINT_NAME { (k, "   ") } else { (k, v) })
            .collect();
        assert!(Config::from_lookup(lookup_from(&vars)).is_err());
    }

    #[test]
    fn optional_variables() {
        let mut vars = complete();
        vars.push((AZURE_MANAGEMENT_URL, "http://127.0.0.1:9000/"));
        vars.push((AZURE_MANAGEMENT_TOKEN, "token"));
        vars.push((SCORING_URI, "https://chat-ep.eastus.inference.ml.azure.com/score"));
        vars.push((SCORING_KEY, "key"));
        let config = Config::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(config.management_url, "http://127.0.0.1:9000");
        assert_eq!(config.management_token.as_deref(), Some("token"));
        assert!(config.has_static_endpoint());
    }

    #[test]
    fn workspace_path() {
        let config = Config::from_lookup(lookup_from(&complete())).unwrap();
        assert_eq!(
            config.workspace_path(),
            "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/rg-chat/providers/Microsoft.MachineLearningServices/workspaces/ws-chat"
        );
    }

    #[test]
    fn server_defaults() {
        let settings = ServerSettings::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(settings, ServerSettings::default());
        assert_eq!(settings.bind_addr.to_string(), "127.0.0.1:7860");
        assert_eq!(settings.request_timeout, Duration::from_secs(60));
        assert_eq!(settings.replay_delay, Duration::from_millis(10));
        assert_eq!(settings.max_sessions, 1000);
    }

    #[test]
    fn server_overrides() {
        let settings = ServerSettings::from_lookup(lookup_from(&[
            (CHAT_BIND_ADDR, "0.0.0.0:8080"),
            (SCORING_TIMEOUT_SECS, "5"),
            (STREAM_REPLAY_DELAY_MS, "0"),
            (CHAT_MAX_SESSIONS, "25"),
        ]))
        .unwrap();
        assert_eq!(settings.max_sessions, 25);
        assert_eq!(settings.bind_addr.port(), 8080);
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.replay_delay, Duration::ZERO);
    }

    #[test]
    fn server_rejects_garbage() {
        assert!(ServerSettings::from_lookup(lookup_from(&[(CHAT_BIND_ADDR, "nowhere")])).is_err());
        let err =
            ServerSettings::from_lookup(lookup_from(&[(SCORING_TIMEOUT_SECS, "-1")])).unwrap_err();
        assert!(
            matches!(err, Error::Configuration { variable: Some(ref v), .. } if v == SCORING_TIMEOUT_SECS)
        );
    }

    #[test]
    fn server_needs_room_for_a_session() {
        let err =
            ServerSettings::from_lookup(lookup_from(&[(CHAT_MAX_SESSIONS, "0")])).unwrap_err();
        assert!(
            matches!(err, Error::Configuration { variable: Some(ref v), .. } if v == CHAT_MAX_SESSIONS)
        );
    }
}
