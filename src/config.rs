use crate::error::JappsError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_VERSION: u32 = 1;
pub const DEFAULT_ACCESS_SCOPE: &str = "access:services";

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub version: u32,
    pub hub: HubConfig,
    pub service: ServiceSection,
    pub auth: AuthConfig,
    pub cors: CorsConfig,
    pub spawner: SpawnerConfig,
    pub repository: RepositoryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct HubConfig {
    pub api_url: String,
    pub client_id: String,
    pub api_token: String,
    pub request_timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSection {
    pub public_host: String,
    pub prefix: String,
    pub listen_host: String,
    pub listen_port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub required_scopes: Vec<String>,
    pub session_secret: String,
    pub session_ttl_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct SpawnerConfig {
    pub python_executable: String,
    pub bind_url: String,
    pub launcher: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct RepositoryConfig {
    pub clone_timeout_sec: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            hub: HubConfig::default(),
            service: ServiceSection::default(),
            auth: AuthConfig::default(),
            cors: CorsConfig::default(),
            spawner: SpawnerConfig::default(),
            repository: RepositoryConfig::default(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8081/hub/api".to_string(),
            client_id: "service-japps".to_string(),
            api_token: String::new(),
            request_timeout_sec: 10,
        }
    }
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            public_host: "http://localhost:8000".to_string(),
            prefix: "/services/japps".to_string(),
            listen_host: "127.0.0.1".to_string(),
            listen_port: 10202,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required_scopes: vec![DEFAULT_ACCESS_SCOPE.to_string()],
            session_secret: String::new(),
            session_ttl_sec: 86_400,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_origins: Vec::new(),
        }
    }
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            python_executable: "python3".to_string(),
            bind_url: "http://localhost:8000".to_string(),
            launcher: "jhub-app-proxy".to_string(),
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            clone_timeout_sec: 120,
        }
    }
}

impl ServiceConfig {
    pub fn hub_timeout(&self) -> Duration {
        Duration::from_secs(self.hub.request_timeout_sec)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.repository.clone_timeout_sec)
    }

    pub fn session_secret(&self) -> Option<&str> {
        let secret = self.auth.session_secret.trim();
        if secret.is_empty() {
            None
        } else {
            Some(secret)
        }
    }

    /// Origins allowed by the CORS layer. The public host is always first.
    pub fn cors_origins(&self) -> Vec<String> {
        let mut origins = vec![self.service.public_host.trim_end_matches('/').to_string()];
        for origin in &self.cors.allowed_origins {
            let origin = origin.trim().trim_end_matches('/');
            if !origin.is_empty() && !origins.iter().any(|existing| existing == origin) {
                origins.push(origin.to_string());
            }
        }
        origins
    }

    pub fn required_scopes(&self) -> BTreeSet<String> {
        self.auth.required_scopes.iter().cloned().collect()
    }

    pub fn hub_endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.hub.api_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

pub fn read_config_from_str(content: &str) -> Result<ServiceConfig, JappsError> {
    let cfg: ServiceConfig = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(JappsError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<ServiceConfig, JappsError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// Reads the config file (or defaults when it does not exist), applies the
/// process environment once, and validates the result.
pub fn load_service_config(path: &Path) -> Result<ServiceConfig, JappsError> {
    let mut cfg = if path.exists() {
        read_config(path)?
    } else {
        ServiceConfig::default()
    };
    apply_env_overrides(&mut cfg, |key| env::var(key).ok())?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn apply_env_overrides<F>(cfg: &mut ServiceConfig, lookup: F) -> Result<(), JappsError>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    if let Some(value) = non_empty("JUPYTERHUB_API_URL") {
        cfg.hub.api_url = value;
    }
    if let Some(value) = non_empty("JUPYTERHUB_CLIENT_ID") {
        cfg.hub.client_id = value;
    }
    if let Some(value) = non_empty("JUPYTERHUB_API_TOKEN") {
        cfg.hub.api_token = value;
    }
    if let Some(value) = non_empty("PUBLIC_HOST") {
        cfg.service.public_host = value;
    }
    if let Some(value) = non_empty("JUPYTERHUB_SERVICE_PREFIX") {
        cfg.service.prefix = value;
    }
    if let Some(value) = non_empty("ENABLE_CORS") {
        cfg.cors.enabled = value.trim().eq_ignore_ascii_case("true");
    }
    if let Some(value) = non_empty("CORS_ALLOWED_ORIGINS") {
        cfg.cors.allowed_origins = value
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();
    }
    if let Some(value) = non_empty("JUPYTERHUB_OAUTH_SCOPES") {
        let scopes: Vec<String> = serde_json::from_str(&value).map_err(|err| {
            JappsError::Config(format!(
                "JUPYTERHUB_OAUTH_SCOPES must be a JSON array of strings: {err}"
            ))
        })?;
        cfg.auth.required_scopes = scopes;
    }
    if let Some(value) = non_empty("JWT_SECRET_KEY") {
        cfg.auth.session_secret = value;
    }
    if let Some(value) = non_empty("JAPPS_PYTHON_EXEC") {
        cfg.spawner.python_executable = value;
    }
    if let Some(value) = non_empty("JAPPS_BIND_URL") {
        cfg.spawner.bind_url = value;
    }
    Ok(())
}

pub fn validate_config(cfg: &ServiceConfig) -> Result<(), JappsError> {
    for (field, value) in [
        ("hub.api_url", &cfg.hub.api_url),
        ("service.public_host", &cfg.service.public_host),
        ("spawner.bind_url", &cfg.spawner.bind_url),
    ] {
        let parsed = url::Url::parse(value.trim())
            .map_err(|err| JappsError::Config(format!("{field} is not a valid url: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(JappsError::Config(format!(
                "{field} must use http or https"
            )));
        }
    }
    if cfg.hub.client_id.trim().is_empty() {
        return Err(JappsError::Config(
            "hub.client_id must be non-empty".to_string(),
        ));
    }
    if cfg.hub.request_timeout_sec == 0 {
        return Err(JappsError::Config(
            "hub.request_timeout_sec must be greater than 0".to_string(),
        ));
    }
    if !cfg.service.prefix.starts_with('/') {
        return Err(JappsError::Config(
            "service.prefix must start with '/'".to_string(),
        ));
    }
    if cfg.service.listen_port == 0 {
        return Err(JappsError::Config(
            "service.listen_port must be greater than 0".to_string(),
        ));
    }
    if cfg.auth.required_scopes.is_empty()
        || cfg
            .auth
            .required_scopes
            .iter()
            .any(|scope| scope.trim().is_empty())
    {
        return Err(JappsError::Config(
            "auth.required_scopes must contain at least one non-empty scope".to_string(),
        ));
    }
    if cfg.auth.session_ttl_sec == 0 {
        return Err(JappsError::Config(
            "auth.session_ttl_sec must be greater than 0".to_string(),
        ));
    }
    if cfg.spawner.python_executable.trim().is_empty() {
        return Err(JappsError::Config(
            "spawner.python_executable must be non-empty".to_string(),
        ));
    }
    if cfg.spawner.launcher.trim().is_empty() {
        return Err(JappsError::Config(
            "spawner.launcher must be non-empty".to_string(),
        ));
    }
    if cfg.repository.clone_timeout_sec == 0 {
        return Err(JappsError::Config(
            "repository.clone_timeout_sec must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

/// Resolves a bare interpreter name like `python3` through `PATH`; absolute
/// paths and unresolvable names are returned unchanged.
pub fn resolve_python_executable(configured: &str) -> String {
    let configured = configured.trim();
    if Path::new(configured).is_absolute() {
        return configured.to_string();
    }
    match which::which(configured) {
        Ok(path) => path.to_string_lossy().to_string(),
        Err(_) => configured.to_string(),
    }
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("JAPPS_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("japps");
    base
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("JAPPS_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

pub fn ensure_parent(path: &Path) -> Result<(), JappsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
