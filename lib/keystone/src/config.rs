use mortar::middleware::auth::{AuthChain, Strategy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// One JSON document per POST response.
    Batch,
    /// The POST response framed as a single-event SSE stream.
    Stream,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthKind {
    None,
    Bearer,
    ApiKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub kind: AuthKind,
    pub secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> AuthConfig {
        AuthConfig {
            kind: AuthKind::None,
            secret: None,
        }
    }
}

/// The flat JSON configuration document the MCP server is assembled from.
/// Unrecognized keys are tolerated; every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct McpConfig {
    pub transport: Transport,
    pub url: Option<String>,
    pub port: u16,
    pub endpoint: String,
    pub host: String,
    pub response_mode: ResponseMode,
    pub max_message_size: usize,
    pub enable_resumability: bool,
    pub cors_origin: Option<String>,
    pub auth: AuthConfig,
    pub session_timeout_seconds: u64,
    pub sse_history_window_millis: u64,
    pub sse_max_events: usize,
    pub max_sessions: usize,
}

impl Default for McpConfig {
    fn default() -> McpConfig {
        McpConfig {
            transport: Transport::Http,
            url: None,
            port: 8080,
            endpoint: "/mcp".to_string(),
            host: "127.0.0.1".to_string(),
            response_mode: ResponseMode::Batch,
            max_message_size: 2 * 1024 * 1024,
            enable_resumability: false,
            cors_origin: None,
            auth: AuthConfig::default(),
            session_timeout_seconds: 3600,
            sse_history_window_millis: 300_000,
            sse_max_events: 1000,
            max_sessions: 4096,
        }
    }
}

impl McpConfig {
    pub fn load(path: &Path) -> Result<McpConfig, String> {
        let file = fs::File::open(path).map_err(|err| err.to_string())?;

        serde_json::from_reader(file).map_err(|err| err.to_string())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Authentication strategies implied by `auth.type`/`auth.secret`.
    /// `None` when the endpoint is open.
    pub fn auth_chain(&self) -> Option<AuthChain> {
        let secret = self.auth.secret.as_deref()?;
        let mut chain = AuthChain::new();

        match self.auth.kind {
            AuthKind::None => return None,
            AuthKind::Bearer => chain.push(Strategy::bearer(secret)),
            AuthKind::ApiKey => chain.push(Strategy::api_key("X-API-Key", secret)),
        }

        Some(chain)
    }
}
