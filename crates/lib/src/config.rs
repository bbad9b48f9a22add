//! Configuration types, loading, and validation.
//!
//! Config is loaded from a YAML (or `.json`) file, e.g. `~/.hookrelay/config.yaml`, and
//! environment. Validation turns it into [`Settings`], the only form the bridge runs on.

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ConfigError;

const DEFAULT_HOST_SERVER: &str = "ws://localhost";
const DEFAULT_CONTENT_TYPE: &str = "text/plain";
const STREAM_PATH: &str = "/stream";

/// Top-level application config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client token for the upstream stream. Overridden by HOOKRELAY_CLIENT_TOKEN env.
    #[serde(default)]
    pub client_token: Option<String>,

    /// Upstream base address (default "ws://localhost"); `/stream` is appended.
    #[serde(default = "default_host_server")]
    pub host_server: String,

    /// How the token is attached to the stream request.
    #[serde(default)]
    pub auth_mode: AuthMode,

    /// Webhook destinations, in order.
    #[serde(default)]
    pub web_hooks: Vec<WebhookConfig>,
}

/// Credential placement on the upstream connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// `Authorization: Bearer <token>` request header.
    #[default]
    Header,

    /// `?token=<token>` query parameter.
    Query,
}

/// One webhook as written by the operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// HTTP method (default POST).
    #[serde(default)]
    pub method: Option<String>,
    /// Body template: plain text, or a JSON object/array whose string values are templates.
    #[serde(default)]
    pub body: Option<String>,
    /// Request headers. Content-Type defaults to text/plain.
    #[serde(default)]
    pub header: Option<BTreeMap<String, String>>,
    /// Application ids allowed through. Empty forwards everything.
    #[serde(default)]
    pub apps: Vec<u64>,
}

fn default_host_server() -> String {
    DEFAULT_HOST_SERVER.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_token: None,
            host_server: default_host_server(),
            auth_mode: AuthMode::default(),
            web_hooks: Vec::new(),
        }
    }
}

/// A validated webhook destination.
#[derive(Debug, Clone)]
pub struct Destination {
    /// The URL as written in the config; used to tag errors and log lines.
    pub label: String,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: String,
    pub apps: Vec<u64>,
}

impl Destination {
    /// True when events from `appid` may be forwarded here.
    pub fn accepts(&self, appid: u64) -> bool {
        self.apps.is_empty() || self.apps.contains(&appid)
    }
}

/// Validated settings for one run of the bridge. Replaced wholesale on reconfiguration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub stream_url: Url,
    pub client_token: String,
    pub auth_mode: AuthMode,
    pub destinations: Arc<[Destination]>,
}

impl Settings {
    /// Validate `config`. Any invalid webhook rejects the whole set.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let host = config.host_server.trim();
        if host.is_empty() {
            return Err(ConfigError::MissingHostServer);
        }
        let stream_url = parse_stream_url(host)
            .ok_or_else(|| ConfigError::InvalidHostServer(host.to_string()))?;
        let client_token = resolve_client_token(config).ok_or(ConfigError::MissingToken)?;

        let destinations = config
            .web_hooks
            .iter()
            .map(validate_webhook)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            stream_url,
            client_token,
            auth_mode: config.auth_mode,
            destinations: destinations.into(),
        })
    }
}

impl Config {
    /// Shorthand for [`Settings::from_config`].
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        Settings::from_config(self)
    }
}

fn validate_webhook(hook: &WebhookConfig) -> Result<Destination, ConfigError> {
    let url = match Url::parse(hook.url.trim()) {
        Ok(u) if !u.scheme().is_empty() && u.host_str().is_some_and(|h| !h.is_empty()) => u,
        _ => return Err(ConfigError::InvalidUrl(hook.url.clone())),
    };

    let method = match hook.method.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| {
            ConfigError::InvalidMethod {
                url: hook.url.clone(),
                method: m.to_string(),
            }
        })?,
        None => Method::POST,
    };

    let mut headers = HeaderMap::new();
    for (name, value) in hook.header.iter().flatten() {
        let invalid = || ConfigError::InvalidHeader {
            url: hook.url.clone(),
            name: name.clone(),
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid())?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
        headers.append(name, value);
    }
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    }

    Ok(Destination {
        label: hook.url.clone(),
        url,
        method,
        headers,
        body: hook.body.clone().unwrap_or_default(),
        apps: hook.apps.clone(),
    })
}

/// Parse the stream endpoint, mapping http(s) to ws(s). None when the address is not usable.
fn parse_stream_url(host_server: &str) -> Option<Url> {
    let mut url = Url::parse(&stream_url(host_server)).ok()?;
    if !url.has_host() {
        return None;
    }
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;
    Some(url)
}

/// Stream endpoint for a host server address.
pub fn stream_url(host_server: &str) -> String {
    format!("{}{}", host_server.trim().trim_end_matches('/'), STREAM_PATH)
}

/// Resolve the client token: env HOOKRELAY_CLIENT_TOKEN overrides config.
pub fn resolve_client_token(config: &Config) -> Option<String> {
    std::env::var("HOOKRELAY_CLIENT_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .client_token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("HOOKRELAY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".hookrelay").join("config.yaml"))
                .unwrap_or_else(|| PathBuf::from("config.yaml"))
        })
}

fn is_json_path(path: &Path) -> bool {
    path.extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Parse config text; `.json` paths use JSON, everything else YAML.
pub fn parse_config(text: &str, path: &Path) -> Result<Config> {
    if is_json_path(path) {
        serde_json::from_str(text).with_context(|| format!("parsing config from {}", path.display()))
    } else {
        serde_yaml::from_str(text).with_context(|| format!("parsing config from {}", path.display()))
    }
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        parse_config(&s, &path)?
    };
    Ok((config, path))
}

/// Write a default config file (and its directory) unless one already exists.
/// Returns true when a file was written.
pub fn write_default_config(path: &Path) -> Result<bool> {
    if path.exists() {
        log::debug!("config already exists at {}, skipping", path.display());
        return Ok(false);
    }
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating config directory {}", dir.display()))?;
    let text = if is_json_path(path) {
        serde_json::to_string_pretty(&Config::default())?
    } else {
        serde_yaml::to_string(&Config::default())?
    };
    std::fs::write(path, text)
        .with_context(|| format!("writing default config to {}", path.display()))?;
    log::info!("created default config at {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(hooks: Vec<WebhookConfig>) -> Config {
        Config {
            client_token: Some("test-token".to_string()),
            host_server: "ws://localhost:8080".to_string(),
            auth_mode: AuthMode::Header,
            web_hooks: hooks,
        }
    }

    fn hook(url: &str) -> WebhookConfig {
        WebhookConfig {
            url: url.to_string(),
            body: Some(r#"{"message": "{{message}}"}"#.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn default_host_server_and_mode() {
        let c = Config::default();
        assert_eq!(c.host_server, "ws://localhost");
        assert_eq!(c.auth_mode, AuthMode::Header);
        assert!(c.web_hooks.is_empty());
    }

    #[test]
    fn valid_config_gets_defaults() {
        let settings = config_with(vec![hook("http://example.com")]).validate().unwrap();
        assert_eq!(settings.stream_url.as_str(), "ws://localhost:8080/stream");
        assert_eq!(settings.client_token, "test-token");
        assert_eq!(settings.destinations.len(), 1);
        let d = &settings.destinations[0];
        assert_eq!(d.method, Method::POST);
        assert_eq!(d.headers.get(CONTENT_TYPE).unwrap(), "text/plain");
    }

    #[test]
    fn empty_body_is_allowed() {
        let mut h = hook("http://example.com");
        h.body = None;
        let settings = config_with(vec![h]).validate().unwrap();
        assert_eq!(settings.destinations[0].body, "");
    }

    #[test]
    fn explicit_content_type_is_kept_case_insensitively() {
        let mut h = hook("http://example.com");
        h.method = Some("put".to_string());
        h.header = Some(BTreeMap::from([(
            "content-type".to_string(),
            "application/json".to_string(),
        )]));
        let settings = config_with(vec![h]).validate().unwrap();
        let d = &settings.destinations[0];
        assert_eq!(d.method, Method::PUT);
        assert_eq!(d.headers.get_all(CONTENT_TYPE).iter().count(), 1);
        assert_eq!(d.headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn malformed_urls_reject_the_whole_set() {
        for bad in ["", "example.com", "http://", "/just/a/path"] {
            let hooks = vec![hook("http://ok.example.com"), hook(bad)];
            let err = config_with(hooks).validate().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidUrl(_)), "{bad:?} accepted");
        }
    }

    #[test]
    fn invalid_method_and_header_are_rejected() {
        let mut h = hook("http://example.com");
        h.method = Some("NOT A METHOD".to_string());
        assert!(matches!(
            config_with(vec![h]).validate(),
            Err(ConfigError::InvalidMethod { .. })
        ));

        let mut h = hook("http://example.com");
        h.header = Some(BTreeMap::from([("bad header".to_string(), "x".to_string())]));
        assert!(matches!(
            config_with(vec![h]).validate(),
            Err(ConfigError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn host_server_is_required() {
        let mut c = config_with(vec![]);
        c.host_server = "  ".to_string();
        assert!(matches!(c.validate(), Err(ConfigError::MissingHostServer)));

        c.host_server = "localhost".to_string();
        assert!(matches!(c.validate(), Err(ConfigError::InvalidHostServer(_))));
    }

    #[test]
    fn http_host_server_maps_to_websocket_scheme() {
        let mut c = config_with(vec![]);
        c.host_server = "https://push.example.com/".to_string();
        assert_eq!(
            c.validate().unwrap().stream_url.as_str(),
            "wss://push.example.com/stream"
        );
        c.host_server = "ftp://push.example.com".to_string();
        assert!(matches!(c.validate(), Err(ConfigError::InvalidHostServer(_))));
    }

    #[test]
    fn stream_url_trims_trailing_slash() {
        assert_eq!(stream_url("wss://push.example.com/"), "wss://push.example.com/stream");
        assert_eq!(stream_url("ws://localhost"), "ws://localhost/stream");
    }

    #[test]
    fn allow_list() {
        let mut d = config_with(vec![hook("http://example.com")]).validate().unwrap().destinations[0].clone();
        assert!(d.accepts(42));
        d.apps = vec![1, 2];
        assert!(d.accepts(1));
        assert!(!d.accepts(3));
    }

    #[test]
    fn parses_yaml_config() {
        let yaml = r#"
client_token: abc
host_server: wss://push.example.com
auth_mode: query
web_hooks:
  - url: http://example.com/api/messages
    body: "{{title}}\n\n{{message}}"
  - url: http://192.168.1.2:10201/api/sendTextMsg
    apps: [1]
    method: POST
    header:
      Content-Type: application/json
    body: '{"wxid":"x","msg":"{{title}}\n{{message}}"}'
"#;
        let c = parse_config(yaml, Path::new("config.yaml")).unwrap();
        assert_eq!(c.auth_mode, AuthMode::Query);
        assert_eq!(c.web_hooks.len(), 2);
        assert_eq!(c.web_hooks[1].apps, vec![1]);
        assert_eq!(c.web_hooks[0].body.as_deref(), Some("{{title}}\n\n{{message}}"));
    }

    #[test]
    fn parses_json_config_by_extension() {
        let json = r#"{"client_token":"abc","web_hooks":[{"url":"http://example.com"}]}"#;
        let c = parse_config(json, Path::new("config.JSON")).unwrap();
        assert_eq!(c.host_server, "ws://localhost");
        assert_eq!(c.web_hooks[0].url, "http://example.com");
    }
}
