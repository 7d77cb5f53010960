//! Builds an `AppConfiguration` from a git repository's conda-project file.

use base64::Engine;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use url::Url;

use crate::app_config::{AppConfiguration, Repository, UserOptions};
use crate::config::ServiceConfig;
use crate::error::JappsError;

pub const ALLOWED_SCHEMES: [&str; 4] = ["https", "http", "git", "ssh"];
pub const CONFIG_VARIABLE_PREFIX: &str = "JHUB_APP_CONFIG_";
pub const PROJECT_FILES: [&str; 2] = ["conda-project.yml", "conda-project.yaml"];

const FORBIDDEN_URL_CHARS: [char; 7] = [';', '|', '&', '$', '`', '\n', '\r'];
const FORBIDDEN_REF_PATTERNS: [&str; 8] = [";", "|", "&", "$", "`", "../", "\n", "\r"];
const REF_PATTERN: &str = r"^[\w\-./ ]+$";
const SCP_LIKE_PATTERN: &str = r"^[\w.\-]+@[\w.\-]+:[\w.\-/~]+$";

fn unsafe_input(message: &str) -> JappsError {
    JappsError::UnsafeInput(message.to_string())
}

fn compile(pattern: &str) -> Result<Regex, JappsError> {
    Regex::new(pattern).map_err(|err| JappsError::Process(format!("invalid pattern: {err}")))
}

fn is_plain_relative(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Strips credentials from an http(s) url before it is logged or echoed.
pub fn redacted_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() || !parsed.username().is_empty() => {
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => raw.to_string(),
    }
}

pub fn validate_repository(repository: &Repository) -> Result<(), JappsError> {
    let url = repository.url.trim();
    if url.is_empty() {
        return Err(JappsError::configuration("url", "repository url is required"));
    }
    if url.contains(FORBIDDEN_URL_CHARS) {
        return Err(unsafe_input("invalid characters in repository url"));
    }
    match Url::parse(url) {
        Ok(parsed) if ALLOWED_SCHEMES.contains(&parsed.scheme()) => {}
        Ok(_) => return Err(unsafe_input("repository url scheme is not allowed")),
        Err(_) if compile(SCP_LIKE_PATTERN)?.is_match(url) => {}
        Err(_) => return Err(unsafe_input("repository url is not a valid url")),
    }

    if let Some(git_ref) = repository.requested_ref() {
        if FORBIDDEN_REF_PATTERNS
            .iter()
            .any(|pattern| git_ref.contains(pattern))
        {
            return Err(unsafe_input("invalid characters in branch or ref name"));
        }
        if !compile(REF_PATTERN)?.is_match(git_ref) || git_ref.starts_with('-') {
            return Err(unsafe_input("invalid branch or ref name"));
        }
    }

    if !is_plain_relative(Path::new(&repository.config_directory)) {
        return Err(unsafe_input("config directory must be a relative path inside the repository"));
    }
    Ok(())
}

pub trait GitRunner {
    /// Shallow-clones `repository` into `target`, which must not exist yet.
    fn clone_repository(
        &self,
        repository: &Repository,
        target: &Path,
        timeout: Duration,
    ) -> Result<(), JappsError>;
}

pub fn clone_args(repository: &Repository, target: &Path) -> Vec<String> {
    let mut args = vec!["clone".to_string(), "--depth".to_string(), "1".to_string()];
    if let Some(git_ref) = repository.requested_ref() {
        args.push("--branch".to_string());
        args.push(git_ref.to_string());
    }
    args.push("--".to_string());
    args.push(repository.url.clone());
    args.push(target.to_string_lossy().to_string());
    args
}

pub fn classify_clone_failure(stderr: &str, repository: &Repository) -> JappsError {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("could not read password")
        || lower.contains("permission denied (publickey)")
    {
        return JappsError::Unauthenticated(
            "git authentication failed, check the repository credentials".to_string(),
        );
    }
    if lower.contains("repository not found") || lower.contains("does not exist") {
        return JappsError::NotFound(format!(
            "repository not found: {}",
            redacted_url(&repository.url)
        ));
    }
    if let Some(git_ref) = repository.requested_ref() {
        if lower.contains("unknown revision")
            || lower.contains("not found in upstream")
            || lower.contains("not found")
        {
            return JappsError::NotFound(format!(
                "branch or ref '{git_ref}' not found in repository"
            ));
        }
    }
    if lower.contains("could not resolve host")
        || lower.contains("connection timed out")
        || lower.contains("unable to access")
        || lower.contains("connection refused")
    {
        return JappsError::UpstreamUnavailable("git server is unreachable".to_string());
    }
    JappsError::configuration(
        "repository",
        "failed to clone repository, verify the repository url is correct",
    )
}

pub struct SystemGit {
    program: PathBuf,
}

impl SystemGit {
    pub fn locate() -> Result<Self, JappsError> {
        let program = which::which("git")
            .map_err(|_| JappsError::Process("git executable not found on PATH".to_string()))?;
        Ok(Self { program })
    }
}

impl GitRunner for SystemGit {
    fn clone_repository(
        &self,
        repository: &Repository,
        target: &Path,
        timeout: Duration,
    ) -> Result<(), JappsError> {
        let mut child = Command::new(&self.program)
            .args(clone_args(repository, target))
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| JappsError::Process(format!("failed to run git: {err}")))?;
        let stderr_pipe = child.stderr.take();
        let reader = thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_string(&mut text);
            }
            text
        });

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                warn!(
                    repo_url = %redacted_url(&repository.url),
                    timeout_sec = timeout.as_secs(),
                    "git clone timed out"
                );
                return Err(JappsError::UpstreamUnavailable(
                    "git clone timed out, the repository may be too large or the server unreachable"
                        .to_string(),
                ));
            }
            thread::sleep(Duration::from_millis(100));
        };
        let stderr = reader.join().unwrap_or_default();
        if status.success() {
            return Ok(());
        }
        error!(
            repo_url = %redacted_url(&repository.url),
            status = %status,
            stderr = %stderr.trim(),
            "git clone failed"
        );
        Err(classify_clone_failure(&stderr, repository))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProjectFile {
    #[serde(default)]
    variables: BTreeMap<String, serde_yaml::Value>,
}

fn scalar_to_string(key: &str, value: &serde_yaml::Value) -> Result<String, JappsError> {
    match value {
        serde_yaml::Value::String(text) => Ok(text.clone()),
        serde_yaml::Value::Bool(flag) => Ok(flag.to_string()),
        serde_yaml::Value::Number(number) => Ok(number.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        _ => Err(JappsError::configuration(
            "variables",
            format!("'{key}' must be a scalar value"),
        )),
    }
}

fn field_value(field: &str, value: &serde_yaml::Value) -> Result<serde_json::Value, JappsError> {
    if let ("keep_alive" | "public" | "skip_conda", serde_yaml::Value::String(text)) = (field, value)
    {
        return match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(serde_json::Value::Bool(true)),
            "false" | "no" | "0" | "" => Ok(serde_json::Value::Bool(false)),
            _ => Err(JappsError::configuration(field, "expected a boolean")),
        };
    }
    serde_json::to_value(value)
        .map_err(|err| JappsError::configuration(field, format!("unsupported value: {err}")))
}

pub fn thumbnail_mime(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        _ => "application/octet-stream",
    }
}

pub fn encode_data_url(path: &Path, contents: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        thumbnail_mime(path),
        base64::engine::general_purpose::STANDARD.encode(contents)
    )
}

pub struct RepositoryLoader<G: GitRunner> {
    git: G,
    clone_timeout: Duration,
}

impl<G: GitRunner> RepositoryLoader<G> {
    pub fn new(git: G, clone_timeout: Duration) -> Self {
        Self { git, clone_timeout }
    }

    pub fn from_config(git: G, cfg: &ServiceConfig) -> Self {
        Self::new(git, cfg.clone_timeout())
    }

    /// Clones into a scratch directory that is removed when this returns.
    pub fn load(&self, repository: &Repository) -> Result<AppConfiguration, JappsError> {
        validate_repository(repository)?;
        let workspace = tempfile::Builder::new().prefix("japps-clone-").tempdir()?;
        let checkout = workspace.path().join("repo");
        info!(repo_url = %redacted_url(&repository.url), git_ref = ?repository.requested_ref(), "cloning repository");
        self.git
            .clone_repository(repository, &checkout, self.clone_timeout)?;
        read_app_configuration(&checkout, repository)
    }
}

/// Resolves `path` with symlinks followed and requires the result to stay
/// under `root` (already canonical). A missing path yields `None`.
fn resolve_inside(root: &Path, path: &Path) -> Result<Option<PathBuf>, JappsError> {
    let resolved = match fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if !resolved.starts_with(root) {
        warn!(path = %path.display(), "repository path resolves outside the checkout");
        return Err(unsafe_input("repository path must stay inside the repository"));
    }
    Ok(Some(resolved))
}

fn find_project_file(root: &Path, config_dir: &Path) -> Result<Option<PathBuf>, JappsError> {
    for name in PROJECT_FILES {
        if let Some(path) = resolve_inside(root, &config_dir.join(name))? {
            if path.is_file() {
                return Ok(Some(path));
            }
        }
    }
    Ok(None)
}

/// Reads the project file of an already checked-out repository.
pub fn read_app_configuration(
    checkout: &Path,
    repository: &Repository,
) -> Result<AppConfiguration, JappsError> {
    let root = fs::canonicalize(checkout)?;
    let config_dir = match resolve_inside(&root, &root.join(&repository.config_directory))? {
        Some(dir) if dir.is_dir() => dir,
        _ => {
            return Err(JappsError::NotFound(format!(
                "path '{}' doesn't exist in the repository",
                repository.config_directory
            )))
        }
    };
    let project_path = find_project_file(&root, &config_dir)?.ok_or_else(|| {
        JappsError::NotFound(format!(
            "no conda-project.yml found in '{}'",
            repository.config_directory
        ))
    })?;
    let content = fs::read_to_string(&project_path)?;
    let project: ProjectFile = serde_yaml::from_str(&content).map_err(|err| {
        error!(error = %err, "invalid conda-project file");
        JappsError::configuration("conda-project", "invalid conda-project file")
    })?;

    let mut options = serde_json::Map::new();
    let mut env = BTreeMap::new();
    let mut thumbnail_path = None;
    for (key, value) in &project.variables {
        let Some(field) = key.strip_prefix(CONFIG_VARIABLE_PREFIX) else {
            env.insert(key.clone(), scalar_to_string(key, value)?);
            continue;
        };
        let field = field.to_ascii_lowercase();
        match field.as_str() {
            "thumbnail_path" => thumbnail_path = Some(scalar_to_string(key, value)?),
            "name" | "display_name" => {
                options.insert("display_name".to_string(), field_value(&field, value)?);
            }
            _ => {
                options.insert(field.clone(), field_value(&field, value)?);
            }
        }
    }

    if let Some(relative) = thumbnail_path.filter(|path| !path.trim().is_empty()) {
        let relative = PathBuf::from(relative.trim());
        if !is_plain_relative(&relative) {
            return Err(unsafe_input("thumbnail path must stay inside the repository"));
        }
        let not_found = || {
            JappsError::NotFound(format!(
                "thumbnail '{}' not found in repository",
                relative.display()
            ))
        };
        let full = resolve_inside(&root, &root.join(&relative))?.ok_or_else(not_found)?;
        let bytes = fs::read(&full).map_err(|_| not_found())?;
        options.insert(
            "thumbnail".to_string(),
            serde_json::Value::String(encode_data_url(&relative, &bytes)),
        );
    }

    options.insert("jhub_app".to_string(), serde_json::Value::Bool(true));
    options.insert("env".to_string(), serde_json::to_value(&env)?);
    options.insert(
        "repository".to_string(),
        serde_json::to_value(repository)?,
    );
    UserOptions::from_value(&serde_json::Value::Object(options))?.into_app_configuration()
}
