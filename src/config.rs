use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backend_url: String,
    pub encryption: EncryptionConfig,
    pub key_cache: KeyCacheConfig,
    pub session_cache: SessionCacheConfig,
    pub script_injection: ScriptInjectionConfig,
    pub websocket: WebsocketConfig,
    pub log: LogConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub tls_cert_path: String,
    pub tls_key_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            tls_cert_path: String::new(),
            tls_key_path: String::new(),
        }
    }
}

/// Which request-confidentiality protocol the deployment runs. Fixed at
/// startup; the two profiles never coexist in one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionProfile {
    #[default]
    Symmetric,
    Ecdh,
}

/// Whether a distributed key may be used once or repeatedly within its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KeyUsage {
    #[default]
    OneShot,
    Reusable,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub profile: EncryptionProfile,
    pub key_usage: KeyUsage,
    pub must_encrypt_routes: Vec<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            profile: EncryptionProfile::Symmetric,
            key_usage: KeyUsage::OneShot,
            must_encrypt_routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeyCacheConfig {
    /// "in-process" or "remote"
    #[serde(rename = "type")]
    pub cache_type: String,
    pub ttl_seconds: u64,
    pub remote: RemoteCacheConfig,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self {
            cache_type: "in-process".to_string(),
            ttl_seconds: 300,
            remote: RemoteCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteCacheConfig {
    pub addr: String,
    pub password: String,
    pub db: i64,
}

impl Default for RemoteCacheConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:6379".to_string(),
            password: String::new(),
            db: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionCacheConfig {
    pub ttl_seconds: u64,
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self { ttl_seconds: 3600 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScriptInjectionConfig {
    /// The tag injected before the first `</body>` of HTML responses.
    pub script_content: String,
    /// Directory holding the client script asset referenced by the tag.
    pub asset_dir: String,
}

impl Default for ScriptInjectionConfig {
    fn default() -> Self {
        Self {
            script_content: r#"<script src="/goga-crypto.min.js" defer></script>"#.to_string(),
            asset_dir: "static".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct WebsocketConfig {
    pub allowed_origins: Vec<String>,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub output_paths: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output_paths: vec!["stdout".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides.
    pub async fn load(path: &str) -> Result<Self> {
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path))?,
            // A missing file is acceptable: defaults plus environment
            // variables are a complete configuration.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e).with_context(|| format!("Failed to read config file: {}", path)),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `GOGA_`-prefixed environment variables. The variable name is
    /// the upper-cased hierarchical key with `.` replaced by `_`, e.g.
    /// `GOGA_BACKEND_URL` or `GOGA_KEY_CACHE_REMOTE_ADDR`.
    pub fn apply_env_overrides(&mut self) {
        fn env(key: &str) -> Option<String> {
            std::env::var(format!("GOGA_{}", key)).ok()
        }

        if let Some(v) = env("SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = v;
        }
        if let Some(v) = env("SERVER_TLS_CERT_PATH") {
            self.server.tls_cert_path = v;
        }
        if let Some(v) = env("SERVER_TLS_KEY_PATH") {
            self.server.tls_key_path = v;
        }
        if let Some(v) = env("BACKEND_URL") {
            self.backend_url = v;
        }
        if let Some(v) = env("ENCRYPTION_ENABLED").and_then(|v| v.parse().ok()) {
            self.encryption.enabled = v;
        }
        if let Some(v) = env("ENCRYPTION_PROFILE") {
            match v.as_str() {
                "symmetric" => self.encryption.profile = EncryptionProfile::Symmetric,
                "ecdh" => self.encryption.profile = EncryptionProfile::Ecdh,
                _ => {}
            }
        }
        if let Some(v) = env("ENCRYPTION_KEY_USAGE") {
            match v.as_str() {
                "one-shot" => self.encryption.key_usage = KeyUsage::OneShot,
                "reusable" => self.encryption.key_usage = KeyUsage::Reusable,
                _ => {}
            }
        }
        if let Some(v) = env("KEY_CACHE_TYPE") {
            self.key_cache.cache_type = v;
        }
        if let Some(v) = env("KEY_CACHE_TTL_SECONDS").and_then(|v| v.parse().ok()) {
            self.key_cache.ttl_seconds = v;
        }
        if let Some(v) = env("KEY_CACHE_REMOTE_ADDR") {
            self.key_cache.remote.addr = v;
        }
        if let Some(v) = env("KEY_CACHE_REMOTE_PASSWORD") {
            self.key_cache.remote.password = v;
        }
        if let Some(v) = env("KEY_CACHE_REMOTE_DB").and_then(|v| v.parse().ok()) {
            self.key_cache.remote.db = v;
        }
        if let Some(v) = env("SESSION_CACHE_TTL_SECONDS").and_then(|v| v.parse().ok()) {
            self.session_cache.ttl_seconds = v;
        }
        if let Some(v) = env("SCRIPT_INJECTION_SCRIPT_CONTENT") {
            self.script_injection.script_content = v;
        }
        if let Some(v) = env("SCRIPT_INJECTION_ASSET_DIR") {
            self.script_injection.asset_dir = v;
        }
        if let Some(v) = env("WEBSOCKET_ALLOWED_ORIGINS") {
            self.websocket.allowed_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = env("WEBSOCKET_INSECURE_SKIP_VERIFY").and_then(|v| v.parse().ok()) {
            self.websocket.insecure_skip_verify = v;
        }
        if let Some(v) = env("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = env("LOG_OUTPUT_PATHS") {
            self.log.output_paths = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = env("METRICS_ENABLED").and_then(|v| v.parse().ok()) {
            self.metrics.enabled = v;
        }
        if let Some(v) = env("METRICS_PORT").and_then(|v| v.parse().ok()) {
            self.metrics.port = v;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port cannot be zero");
        }

        if self.backend_url.is_empty() {
            anyhow::bail!("backend_url cannot be empty");
        }

        let backend = reqwest::Url::parse(&self.backend_url)
            .with_context(|| format!("backend_url is not a valid URL: {}", self.backend_url))?;
        if backend.scheme() != "http" && backend.scheme() != "https" {
            anyhow::bail!("backend_url must use the http or https scheme");
        }
        if backend.host_str().is_none() {
            anyhow::bail!("backend_url must include a host");
        }

        if self.server.tls_cert_path.is_empty() != self.server.tls_key_path.is_empty() {
            anyhow::bail!("server.tls_cert_path and server.tls_key_path must be set together");
        }

        match self.key_cache.cache_type.as_str() {
            "in-process" | "remote" => {}
            other => anyhow::bail!("unsupported key_cache.type: {}", other),
        }

        if self.key_cache.ttl_seconds == 0 {
            anyhow::bail!("key_cache.ttl_seconds cannot be zero");
        }

        if self.encryption.enabled && self.script_injection.script_content.is_empty() {
            anyhow::bail!("script_injection.script_content cannot be empty when encryption is enabled");
        }

        Ok(())
    }
}
