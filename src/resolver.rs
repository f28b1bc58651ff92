//! Endpoint resolution.
//!
//! Before the first chat message can be sent the scoring URL and key of the configured deployment
//! have to be known.  [`ManagementResolver`] looks them up through the Azure management REST API;
//! [`StaticResolver`] hands out a descriptor that was supplied directly.  Resolution happens once,
//! at startup, and any failure is fatal.

use std::fmt;
use std::time::Duration;

use reqwest::{Client as ReqwestClient, Method, Response};
use serde::Deserialize;
use url::Url;

use crate::config::{AZURE_MANAGEMENT_TOKEN, Config};
use crate::error::{Error, Result};
use crate::observability::RESOLVER_LOOKUPS;

const MANAGEMENT_API_VERSION: &str = "2023-10-01";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How the scoring endpoint authenticates callers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// A static endpoint key.
    Key,

    /// A short-lived Azure ML token.
    AmlToken,
}

impl AuthMode {
    fn parse(mode: &str) -> Result<Self> {
        match mode.to_ascii_lowercase().replace('_', "").as_str() {
            "key" => Ok(AuthMode::Key),
            "amltoken" => Ok(AuthMode::AmlToken),
            other => Err(Error::authentication(format!(
                "endpoint auth mode '{other}' is not supported; use key or aml_token"
            ))),
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::Key => write!(f, "key"),
            AuthMode::AmlToken => write!(f, "aml_token"),
        }
    }
}

/// Everything needed to call a deployment: where, with which key, and under which name.
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// The scoring URL.
    pub scoring_uri: Url,

    /// The bearer key or token.
    pub key: String,

    /// The deployment requests are routed to.
    pub deployment: String,

    /// How the key was obtained.
    pub auth_mode: AuthMode,
}

impl EndpointDescriptor {
    /// Create a new `EndpointDescriptor`.
    pub fn new(
        scoring_uri: Url,
        key: impl Into<String>,
        deployment: impl Into<String>,
        auth_mode: AuthMode,
    ) -> Self {
        Self {
            scoring_uri,
            key: key.into(),
            deployment: deployment.into(),
            auth_mode,
        }
    }
}

impl fmt::Debug for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDescriptor")
            .field("scoring_uri", &self.scoring_uri.as_str())
            .field("key", &"<masked>")
            .field("deployment", &self.deployment)
            .field("auth_mode", &self.auth_mode)
            .finish()
    }
}

/// Turns a [`Config`] into an [`EndpointDescriptor`].
#[async_trait::async_trait]
pub trait EndpointResolver: Send + Sync {
    /// Resolve the configured endpoint and deployment.
    async fn resolve(&self, config: &Config) -> Result<EndpointDescriptor>;
}

/// Pick the resolver `config` asks for: static when a scoring URI and key are given, the
/// management API otherwise.
pub fn resolver_for(config: &Config) -> Result<Box<dyn EndpointResolver>> {
    if config.has_static_endpoint() {
        tracing::info!("Using the scoring endpoint from the environment");
        Ok(Box::new(StaticResolver::from_config(config)?))
    } else {
        Ok(Box::new(ManagementResolver::from_config(config)?))
    }
}

/// Resolve the endpoint described by `config` and log the workspace summary.
pub async fn resolve_endpoint(config: &Config) -> Result<EndpointDescriptor> {
    let resolver = resolver_for(config)?;
    let endpoint = resolver.resolve(config).await?;
    log_workspace_info(config, &endpoint);
    Ok(endpoint)
}

/// Log where the chat is pointed, one level per line.
pub fn log_workspace_info(config: &Config, endpoint: &EndpointDescriptor) {
    tracing::info!("**Workspace Info**");
    for line in workspace_tree(config, endpoint) {
        tracing::info!("{line}");
    }
}

fn workspace_tree(config: &Config, endpoint: &EndpointDescriptor) -> Vec<String> {
    vec![
        format!("Subscription: {}", config.subscription_id),
        format!("└── Resource Group: {}", config.resource_group),
        format!("    └── Machine Learning Workspace: {}", config.workspace_name),
        format!(
            "        └── Managed Online Endpoint: {}",
            endpoint.scoring_uri
        ),
        format!("            └── Deployment: {}", endpoint.deployment),
    ]
}

/////////////////////////////////////////// Static ///////////////////////////////////////////

/// A resolver that always returns the same descriptor.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    endpoint: EndpointDescriptor,
}

impl StaticResolver {
    /// Create a resolver for a known descriptor.
    pub fn new(endpoint: EndpointDescriptor) -> Self {
        Self { endpoint }
    }

    /// Build the descriptor from `SCORING_URI`, `SCORING_KEY` and the deployment name.
    pub fn from_config(config: &Config) -> Result<Self> {
        let (Some(uri), Some(key)) = (&config.scoring_uri, &config.scoring_key) else {
            return Err(Error::configuration(
                "a static endpoint needs both SCORING_URI and SCORING_KEY",
                None,
            ));
        };
        let scoring_uri = Url::parse(uri).map_err(|e| {
            Error::configuration(
                format!("'{uri}' is not a valid URL: {e}"),
                Some(crate::config::SCORING_URI.to_string()),
            )
        })?;
        Ok(Self::new(EndpointDescriptor::new(
            scoring_uri,
            key.clone(),
            config.deployment_name.clone(),
            AuthMode::Key,
        )))
    }
}

#[async_trait::async_trait]
impl EndpointResolver for StaticResolver {
    async fn resolve(&self, _: &Config) -> Result<EndpointDescriptor> {
        Ok(self.endpoint.clone())
    }
}

///////////////////////////////////////// Management /////////////////////////////////////////

/// A resolver backed by the Azure management REST API.
#[derive(Clone)]
pub struct ManagementResolver {
    client: ReqwestClient,
    base_url: String,
    token: String,
}

impl fmt::Debug for ManagementResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementResolver")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnlineEndpoint {
    properties: OnlineEndpointProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnlineEndpointProperties {
    scoring_uri: Option<String>,
    auth_mode: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointKeys {
    primary_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointToken {
    access_token: Option<String>,
}

impl ManagementResolver {
    /// Create a resolver talking to `base_url` with a static bearer `token`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = ReqwestClient::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Create a resolver from the management settings in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let Some(token) = &config.management_token else {
            return Err(Error::configuration(
                "a management API token is required to look up the endpoint",
                Some(AZURE_MANAGEMENT_TOKEN.to_string()),
            ));
        };
        Self::new(config.management_url.clone(), token.clone())
    }

    fn endpoint_url(&self, config: &Config, suffix: &str) -> String {
        format!(
            "{}{}/onlineEndpoints/{}{suffix}?api-version={MANAGEMENT_API_VERSION}",
            self.base_url,
            config.workspace_path(),
            config.endpoint_name,
        )
    }

    async fn call(
        &self,
        method: Method,
        url: &str,
        resource_type: &str,
        resource_name: &str,
    ) -> Result<Response> {
        RESOLVER_LOOKUPS.click();
        tracing::debug!(%method, url, "management API call");
        let response = self
            .client
            .request(method, url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(
                        format!("Management API timed out: {e}"),
                        Some(DEFAULT_TIMEOUT.as_secs_f64()),
                    )
                } else if e.is_connect() {
                    Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
                } else {
                    Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
                }
            })?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(Self::process_error_response(response, resource_type, resource_name).await)
    }

    async fn process_error_response(
        response: Response,
        resource_type: &str,
        resource_name: &str,
    ) -> Error {
        #[derive(Deserialize)]
        struct ErrorResponse {
            error: Option<ErrorDetail>,
        }

        #[derive(Deserialize)]
        struct ErrorDetail {
            code: Option<String>,
            message: Option<String>,
        }

        let status_code = response.status().as_u16();
        let request_id = response
            .headers()
            .get("x-ms-request-id")
            .and_then(|val| val.to_str().ok())
            .map(String::from);
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Error::http_client(
                    format!(
                        "Failed to read management API error response ({status_code} for {resource_type} '{resource_name}'): {e}"
                    ),
                    Some(Box::new(e)),
                );
            }
        };
        let detail = serde_json::from_str::<ErrorResponse>(&body)
            .ok()
            .and_then(|e| e.error);
        let code = detail.as_ref().and_then(|d| d.code.clone());
        let message = detail
            .and_then(|d| d.message)
            .unwrap_or_else(|| if body.is_empty() { "no details".to_string() } else { body });

        match status_code {
            404 => Error::not_found(
                message,
                Some(resource_type.to_string()),
                Some(resource_name.to_string()),
            ),
            401 => Error::authentication(message),
            403 => Error::permission(message),
            _ => Error::api(
                status_code,
                match code {
                    Some(code) => format!("{code}: {message}"),
                    None => message,
                },
                request_id,
            ),
        }
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: Response, what: &str) -> Result<T> {
        response.json::<T>().await.map_err(|e| {
            Error::serialization(
                format!("Failed to parse {what}: {e}"),
                Some(Box::new(e)),
            )
        })
    }
}

#[async_trait::async_trait]
impl EndpointResolver for ManagementResolver {
    async fn resolve(&self, config: &Config) -> Result<EndpointDescriptor> {
        tracing::info!("Getting endpoint info...");
        let response = self
            .call(
                Method::GET,
                &self.endpoint_url(config, ""),
                "online endpoint",
                &config.endpoint_name,
            )
            .await
            .inspect_err(|e| tracing::error!("Failed to retrieve endpoint information: {e}"))?;
        let endpoint: OnlineEndpoint = Self::json(response, "online endpoint").await?;
        let scoring_uri = endpoint.properties.scoring_uri.ok_or_else(|| {
            Error::validation(
                format!("endpoint '{}' has no scoring URI yet", config.endpoint_name),
                Some("scoringUri".to_string()),
            )
        })?;
        let scoring_uri = Url::parse(&scoring_uri)?;
        let auth_mode = AuthMode::parse(&endpoint.properties.auth_mode)?;

        tracing::info!("Validating Deployment info...");
        self.call(
            Method::GET,
            &self.endpoint_url(config, &format!("/deployments/{}", config.deployment_name)),
            "deployment",
            &config.deployment_name,
        )
        .await
        .inspect_err(|e| tracing::error!("Failed to retrieve model deployment information: {e}"))?;

        let key = match auth_mode {
            AuthMode::Key => {
                let response = self
                    .call(
                        Method::POST,
                        &self.endpoint_url(config, "/listKeys"),
                        "endpoint keys",
                        &config.endpoint_name,
                    )
                    .await?;
                Self::json::<EndpointKeys>(response, "endpoint keys")
                    .await?
                    .primary_key
            }
            AuthMode::AmlToken => {
                let response = self
                    .call(
                        Method::POST,
                        &self.endpoint_url(config, "/token"),
                        "endpoint token",
                        &config.endpoint_name,
                    )
                    .await?;
                Self::json::<EndpointToken>(response, "endpoint token")
                    .await?
                    .access_token
            }
        };
        let key = key.ok_or_else(|| {
            Error::authentication(format!(
                "no {auth_mode} credential returned for endpoint '{}'",
                config.endpoint_name
            ))
        })?;

        Ok(EndpointDescriptor::new(
            scoring_uri,
            key,
            config.deployment_name.clone(),
            auth_mode,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::Json;
    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::{get, post};
    use serde_json::json;

    const WORKSPACE: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.MachineLearningServices/workspaces/ws";

    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<Vec<String>>>);

    impl Calls {
        fn push(&self, call: String) {
            self.0.lock().unwrap().push(call);
        }

        fn all(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    fn not_found(what: &str) -> AxumResponse {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"code": "ResourceNotFound", "message": format!("{what} not found")}})),
        )
            .into_response()
    }

    /// A 500 whose body breaks off after the first chunk.
    fn cut_off_error() -> AxumResponse {
        let chunks = futures::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"{\"error\": {\"code\": ")),
            Err(std::io::Error::other("connection reset")),
        ]);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::body::Body::from_stream(chunks),
        )
            .into_response()
    }

    async fn get_endpoint(
        State(calls): State<Calls>,
        Path(endpoint): Path<String>,
        headers: HeaderMap,
    ) -> AxumResponse {
        calls.push(format!("GET {endpoint}"));
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer mgmt-token") {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": {"code": "InvalidAuthenticationToken", "message": "bad token"}})),
            )
                .into_response();
        }
        let auth_mode = match endpoint.as_str() {
            "chat-ep" => "Key",
            "token-ep" => "AMLToken",
            "cut-ep" => return cut_off_error(),
            _ => return not_found("online endpoint"),
        };
        Json(json!({
            "name": endpoint,
            "properties": {
                "authMode": auth_mode,
                "scoringUri": format!("https://{endpoint}.eastus.inference.ml.azure.com/score"),
            }
        }))
        .into_response()
    }

    async fn get_deployment(
        State(calls): State<Calls>,
        Path((endpoint, deployment)): Path<(String, String)>,
    ) -> AxumResponse {
        calls.push(format!("GET {endpoint}/{deployment}"));
        if deployment == "blue" {
            Json(json!({"name": "blue", "properties": {}})).into_response()
        } else {
            not_found("deployment")
        }
    }

    async fn list_keys(State(calls): State<Calls>, Path(endpoint): Path<String>) -> AxumResponse {
        calls.push(format!("POST {endpoint}/listKeys"));
        Json(json!({"primaryKey": "primary", "secondaryKey": "secondary"})).into_response()
    }

    async fn get_token(State(calls): State<Calls>, Path(endpoint): Path<String>) -> AxumResponse {
        calls.push(format!("POST {endpoint}/token"));
        Json(json!({"accessToken": "aml-token", "expiryTimeUtc": 1700000000})).into_response()
    }

    async fn mock_management() -> (String, Calls) {
        let calls = Calls::default();
        let app = Router::new()
            .route(
                &format!("{WORKSPACE}/onlineEndpoints/{{endpoint}}"),
                get(get_endpoint),
            )
            .route(
                &format!("{WORKSPACE}/onlineEndpoints/{{endpoint}}/deployments/{{deployment}}"),
                get(get_deployment),
            )
            .route(
                &format!("{WORKSPACE}/onlineEndpoints/{{endpoint}}/listKeys"),
                post(list_keys),
            )
            .route(
                &format!("{WORKSPACE}/onlineEndpoints/{{endpoint}}/token"),
                post(get_token),
            )
            .with_state(calls.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), calls)
    }

    fn config(base: &str, endpoint: &str, deployment: &str) -> Config {
        let base = base.to_string();
        let endpoint = endpoint.to_string();
        let deployment = deployment.to_string();
        Config::from_lookup(move |name| {
            match name {
                "SUBSCRIPTION_ID" => Some("sub".to_string()),
                "RESOURCE_GROUP_NAME" => Some("rg".to_string()),
                "WORKSPACE_NAME" => Some("ws".to_string()),
                "ENDPOINT_NAME" => Some(endpoint.clone()),
                "DEPLOYMENT_NAME" => Some(deployment.clone()),
                "AZURE_MANAGEMENT_TOKEN" => Some("mgmt-token".to_string()),
                "AZURE_MANAGEMENT_URL" => Some(base.clone()),
                _ => None,
            }
        })
        .unwrap()
    }

    #[tokio::test]
    async fn resolves_key_endpoint() {
        let (base, calls) = mock_management().await;
        let config = config(&base, "chat-ep", "blue");
        let endpoint = resolve_endpoint(&config).await.unwrap();

        assert_eq!(
            endpoint.scoring_uri.as_str(),
            "https://chat-ep.eastus.inference.ml.azure.com/score"
        );
        assert_eq!(endpoint.key, "primary");
        assert_eq!(endpoint.deployment, "blue");
        assert_eq!(endpoint.auth_mode, AuthMode::Key);
        assert_eq!(
            calls.all(),
            vec!["GET chat-ep", "GET chat-ep/blue", "POST chat-ep/listKeys"]
        );
    }

    #[tokio::test]
    async fn resolves_token_endpoint() {
        let (base, calls) = mock_management().await;
        let config = config(&base, "token-ep", "blue");
        let endpoint = resolve_endpoint(&config).await.unwrap();
        assert_eq!(endpoint.key, "aml-token");
        assert_eq!(endpoint.auth_mode, AuthMode::AmlToken);
        assert_eq!(calls.all().last().unwrap(), "POST token-ep/token");
    }

    #[tokio::test]
    async fn missing_endpoint_is_not_found() {
        let (base, calls) = mock_management().await;
        let config = config(&base, "no-such-ep", "blue");
        let err = resolve_endpoint(&config).await.unwrap_err();

        assert!(err.is_not_found());
        assert!(err.to_string().contains("no-such-ep"));
        assert_eq!(calls.all(), vec!["GET no-such-ep"]);
    }

    #[tokio::test]
    async fn missing_deployment_is_not_found() {
        let (base, calls) = mock_management().await;
        let config = config(&base, "chat-ep", "green");
        let err = resolve_endpoint(&config).await.unwrap_err();

        assert!(matches!(
            err,
            Error::NotFound { ref resource_type, ref resource_id, .. }
                if resource_type.as_deref() == Some("deployment") && resource_id.as_deref() == Some("green")
        ));
        assert_eq!(calls.all(), vec!["GET chat-ep", "GET chat-ep/green"]);
    }

    #[tokio::test]
    async fn unreadable_error_body_is_reported() {
        let (base, _) = mock_management().await;
        let err = resolve_endpoint(&config(&base, "cut-ep", "blue"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::HttpClient { .. }));
        let message = err.to_string();
        assert!(message.contains("500"), "{message}");
        assert!(message.contains("cut-ep"), "{message}");
    }

    #[tokio::test]
    async fn bad_token_is_authentication_error() {
        let (base, _) = mock_management().await;
        let resolver = ManagementResolver::new(base.clone(), "wrong").unwrap();
        let err = resolver
            .resolve(&config(&base, "chat-ep", "blue"))
            .await
            .unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn management_needs_token() {
        let mut config = config("http://127.0.0.1:1", "chat-ep", "blue");
        config.management_token = None;
        let err = resolver_for(&config).err().unwrap();
        assert!(
            matches!(err, Error::Configuration { variable: Some(ref v), .. } if v == AZURE_MANAGEMENT_TOKEN)
        );
    }

    #[tokio::test]
    async fn static_endpoint_skips_lookup() {
        let mut config = config("http://127.0.0.1:1", "chat-ep", "blue");
        config.scoring_uri = Some("http://localhost:5001/score".to_string());
        config.scoring_key = Some("local-key".to_string());
        let endpoint = resolve_endpoint(&config).await.unwrap();
        assert_eq!(endpoint.scoring_uri.as_str(), "http://localhost:5001/score");
        assert_eq!(endpoint.key, "local-key");
        assert_eq!(endpoint.deployment, "blue");
    }

    #[test]
    fn auth_modes() {
        assert_eq!(AuthMode::parse("Key").unwrap(), AuthMode::Key);
        assert_eq!(AuthMode::parse("AMLToken").unwrap(), AuthMode::AmlToken);
        assert_eq!(AuthMode::parse("aml_token").unwrap(), AuthMode::AmlToken);
        assert!(AuthMode::parse("AADToken").is_err());
    }

    #[test]
    fn descriptor_debug_masks_key() {
        let endpoint = EndpointDescriptor::new(
            Url::parse("https://x/score").unwrap(),
            "super-secret",
            "blue",
            AuthMode::Key,
        );
        assert!(!format!("{endpoint:?}").contains("super-secret"));
    }

    #[test]
    fn tree_lists_every_level() {
        let config = config("http://127.0.0.1:1", "chat-ep", "blue");
        let endpoint = EndpointDescriptor::new(
            Url::parse("https://chat-ep/score").unwrap(),
            "k",
            "blue",
            AuthMode::Key,
        );
        let tree = workspace_tree(&config, &endpoint);
        assert_eq!(tree.len(), 5);
        assert!(tree[0].ends_with("sub"));
        assert!(tree[4].ends_with("Deployment: blue"));
    }
}
