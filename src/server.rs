//! HTTP control plane: a small blocking HTTP/1.1 server, one thread per
//! connection, with the service configuration shared read-only.

use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::app_config::{Repository, UserOptions};
use crate::auth::{AuthGate, IdentityProvider, Principal, SESSION_COOKIE};
use crate::command::{synthesize, SpawnContext, SpawnUser};
use crate::config::ServiceConfig;
use crate::error::JappsError;
use crate::framework::frameworks;
use crate::repository::{GitRunner, RepositoryLoader};
use crate::spawner::{app_env, SpawnerSettings};

const MAX_HEADER_BYTES: usize = 1024 * 1024;
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_APP_NAME: &str = "app";

#[derive(Debug, Clone, Default)]
pub struct ApiRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    /// Keys are lowercased.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl ApiRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers
            .insert(key.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie")?
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| key.trim() == name)
            .map(|(_, value)| value.trim().trim_matches('"'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json(status: u16, payload: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: serde_json::to_vec(payload).unwrap_or_default(),
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn redirect(location: &str) -> Self {
        Self {
            status: 302,
            headers: vec![("Location".to_string(), location.to_string())],
            body: Vec::new(),
        }
    }

    pub fn from_error(err: &JappsError) -> Self {
        Self::json(err.status_code(), &json!({"detail": err.public_detail()}))
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json_body(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

pub fn parse_query_map(query: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

pub fn read_request<R: Read>(stream: &mut R) -> Result<Option<ApiRequest>, JappsError> {
    let mut buf = Vec::new();
    let mut header_end: Option<usize> = None;
    let mut chunk = [0u8; 1024];
    while header_end.is_none() {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            header_end = Some(pos);
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(JappsError::Process("request headers too large".to_string()));
        }
    }
    let header_end = header_end
        .ok_or_else(|| JappsError::Process("request missing header delimiter".to_string()))?;
    let header_text = String::from_utf8_lossy(&buf[..header_end]);
    let mut lines = header_text.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| JappsError::Process("request missing request line".to_string()))?;
    let mut request_parts = request_line.split_whitespace();
    let method = request_parts
        .next()
        .ok_or_else(|| JappsError::Process("request missing method".to_string()))?
        .to_ascii_uppercase();
    let target = request_parts
        .next()
        .ok_or_else(|| JappsError::Process("request missing target".to_string()))?;
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query_map(query)),
        None => (target.to_string(), BTreeMap::new()),
    };
    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(JappsError::Process("request body too large".to_string()));
    }
    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
    }
    if buf.len() < body_start + content_length {
        return Err(JappsError::Process(
            "request ended before full body was received".to_string(),
        ));
    }
    let body = buf[body_start..body_start + content_length].to_vec();
    Ok(Some(ApiRequest {
        method,
        path,
        query,
        headers,
        body,
    }))
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        302 => "Found",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "OK",
    }
}

pub fn write_response<W: Write>(stream: &mut W, response: &ApiResponse) -> Result<(), JappsError> {
    let mut header = format!("HTTP/1.1 {} {}\r\n", response.status, status_text(response.status));
    for (key, value) in &response.headers {
        header.push_str(&format!("{key}: {value}\r\n"));
    }
    header.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        response.body.len()
    ));
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AppCommandRequest {
    user_options: serde_json::Value,
    port: u16,
    #[serde(default)]
    app_name: Option<String>,
}

pub struct ServiceState<P: IdentityProvider, G: GitRunner> {
    config: ServiceConfig,
    gate: AuthGate<P>,
    loader: RepositoryLoader<G>,
    settings: SpawnerSettings,
}

impl<P: IdentityProvider, G: GitRunner> ServiceState<P, G> {
    pub fn new(config: ServiceConfig, provider: P, git: G) -> Self {
        let gate = AuthGate::from_config(provider, &config);
        let loader = RepositoryLoader::from_config(git, &config);
        let settings = SpawnerSettings::from_config(&config);
        Self {
            config,
            gate,
            loader,
            settings,
        }
    }

    fn prefix(&self) -> &str {
        self.config.service.prefix.trim_end_matches('/')
    }

    fn callback_url(&self) -> String {
        format!(
            "{}{}/oauth_callback",
            self.config.service.public_host.trim_end_matches('/'),
            self.prefix()
        )
    }

    fn route<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.prefix())?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        let route = rest.trim_end_matches('/');
        Some(if route.is_empty() { "/" } else { route })
    }

    fn cors_headers(&self, request: &ApiRequest, mut response: ApiResponse) -> ApiResponse {
        if !self.config.cors.enabled {
            return response;
        }
        let Some(origin) = request.header("origin") else {
            return response;
        };
        let origin = origin.trim_end_matches('/');
        if self.config.cors_origins().iter().any(|allowed| allowed == origin) {
            response = response
                .with_header("Access-Control-Allow-Origin", origin)
                .with_header("Access-Control-Allow-Credentials", "true")
                .with_header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
                .with_header("Access-Control-Allow-Headers", "Authorization, Content-Type")
                .with_header("Vary", "Origin");
        }
        response
    }

    pub fn handle(&self, request: &ApiRequest) -> ApiResponse {
        let response = if request.method == "OPTIONS" {
            ApiResponse::no_content()
        } else {
            match self.dispatch(request) {
                Ok(response) => response,
                Err(err) => {
                    if err.status_code() >= 500 {
                        error!(path = %request.path, error = %err, "request failed");
                    } else {
                        warn!(path = %request.path, status = err.status_code(), error = %err, "request rejected");
                    }
                    ApiResponse::from_error(&err)
                }
            }
        };
        self.cors_headers(request, response)
    }

    fn dispatch(&self, request: &ApiRequest) -> Result<ApiResponse, JappsError> {
        let route = self
            .route(&request.path)
            .ok_or_else(|| JappsError::NotFound(format!("no route for {}", request.path)))?;
        match (request.method.as_str(), route) {
            ("GET", "/status") => Ok(ApiResponse::json(
                200,
                &json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}),
            )),
            ("GET", "/oauth_callback") => self.oauth_callback(request),
            ("GET", "/user") => {
                let principal = self.gate.authenticate(request)?;
                Ok(ApiResponse::json(200, &serde_json::to_value(principal)?))
            }
            ("GET", "/frameworks") => {
                self.gate.authenticate(request)?;
                Ok(ApiResponse::json(200, &serde_json::to_value(frameworks())?))
            }
            ("POST", "/app-config-from-git") => {
                self.gate.authenticate(request)?;
                let repository: Repository = serde_json::from_slice(&request.body)?;
                let config = self.loader.load(&repository)?;
                Ok(ApiResponse::json(200, &serde_json::to_value(config)?))
            }
            ("POST", "/app-command") => {
                let principal = self.gate.authenticate(request)?;
                self.app_command(&principal, request)
            }
            (_, "/status" | "/oauth_callback" | "/user" | "/frameworks" | "/app-config-from-git" | "/app-command") => {
                Ok(ApiResponse::json(405, &json!({"detail": "method not allowed"})))
            }
            _ => Err(JappsError::NotFound(format!("no route for {route}"))),
        }
    }

    fn oauth_callback(&self, request: &ApiRequest) -> Result<ApiResponse, JappsError> {
        let code = request.query_param("code").unwrap_or_default();
        let grant = self.gate.complete_login(code, &self.callback_url())?;
        let cookie = format!(
            "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            grant.token,
            grant.max_age.as_secs()
        );
        let location = format!("{}/", self.prefix());
        Ok(ApiResponse::redirect(&location).with_header("Set-Cookie", cookie))
    }

    fn app_command(
        &self,
        principal: &Principal,
        request: &ApiRequest,
    ) -> Result<ApiResponse, JappsError> {
        let body: AppCommandRequest = serde_json::from_slice(&request.body)?;
        let config = UserOptions::from_value(&body.user_options)?.into_app_configuration()?;
        let ctx = SpawnContext {
            port: body.port,
            python_executable: self.settings.python_executable.clone(),
            bind_url: self.settings.bind_url.clone(),
            user: SpawnUser {
                name: principal.name.clone(),
                id: principal.id.unwrap_or_default(),
            },
            app_name: body.app_name.unwrap_or_else(|| DEFAULT_APP_NAME.to_string()),
        };
        let argv = synthesize(&config, &ctx, &self.settings.launcher)?;
        let env = app_env(&config, &ctx);
        Ok(ApiResponse::json(200, &json!({"argv": argv, "env": env})))
    }
}

fn handle_connection<P, G>(mut stream: TcpStream, state: Arc<ServiceState<P, G>>)
where
    P: IdentityProvider,
    G: GitRunner,
{
    let started = Instant::now();
    if let Err(err) = stream.set_read_timeout(Some(Duration::from_secs(10))) {
        warn!(error = %err, "failed to set read timeout");
    }
    let response = match read_request(&mut stream) {
        Ok(Some(request)) => {
            let response = state.handle(&request);
            info!(
                method = %request.method,
                path = %request.path,
                status = response.status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "request"
            );
            response
        }
        Ok(None) => return,
        Err(err) => {
            warn!(error = %err, "malformed request");
            ApiResponse::json(400, &json!({"detail": "malformed request"}))
        }
    };
    if let Err(err) = write_response(&mut stream, &response) {
        warn!(error = %err, "failed to write response");
    }
}

pub fn serve<P, G>(listener: TcpListener, state: Arc<ServiceState<P, G>>) -> Result<(), JappsError>
where
    P: IdentityProvider + 'static,
    G: GitRunner + Send + Sync + 'static,
{
    info!(addr = %listener.local_addr()?, prefix = %state.prefix(), "control plane listening");
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&state);
                thread::spawn(move || handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                thread::sleep(Duration::from_millis(250));
            }
        }
    }
    Ok(())
}
