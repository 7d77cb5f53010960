use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JappsError {
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid app configuration: {field}: {reason}")]
    Configuration { field: String, reason: String },
    #[error("unsafe input: {0}")]
    UnsafeInput(String),
    #[error("not authenticated: {0}")]
    Unauthenticated(String),
    #[error("user '{user}' is not authorized to access this service")]
    Unauthorized { user: String },
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl JappsError {
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Configuration { .. } | Self::UnsafeInput(_) => 400,
            Self::Unauthenticated(_) => 401,
            Self::Unauthorized { .. } => 403,
            Self::NotFound(_) => 404,
            Self::UpstreamUnavailable(_) => 504,
            Self::Http(err) if err.is_timeout() || err.is_connect() => 504,
            Self::Http(_) => 502,
            Self::Json(_) => 400,
            Self::Config(_)
            | Self::Spawn(_)
            | Self::Io(_)
            | Self::Yaml(_)
            | Self::Process(_) => 500,
        }
    }

    /// Message safe to return to an API client. Internal failures collapse to a
    /// generic string so that paths and upstream bodies stay in the logs.
    pub fn public_detail(&self) -> String {
        match self {
            Self::Configuration { .. } | Self::Unauthorized { .. } | Self::NotFound(_) => {
                self.to_string()
            }
            Self::UnsafeInput(_) => "request contains invalid characters".to_string(),
            Self::Unauthenticated(_) => {
                "Authentication failed. Please try logging in again.".to_string()
            }
            Self::UpstreamUnavailable(_) | Self::Http(_) => {
                "upstream service is unavailable, try again later".to_string()
            }
            Self::Json(_) => "request body is not valid JSON".to_string(),
            Self::Config(_)
            | Self::Spawn(_)
            | Self::Io(_)
            | Self::Yaml(_)
            | Self::Process(_) => "internal server error".to_string(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "service_config_invalid",
            Self::Configuration { .. } => "app_config_invalid",
            Self::UnsafeInput(_) => "unsafe_input",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Unauthorized { .. } => "unauthorized",
            Self::UpstreamUnavailable(_) | Self::Http(_) => "upstream_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Spawn(_) => "spawn_failed",
            Self::Io(_) | Self::Yaml(_) | Self::Json(_) | Self::Process(_) => "internal_error",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JsonResult<T: Serialize> {
    pub ok: bool,
    pub result: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_status() {
        assert_eq!(JappsError::configuration("filepath", "missing").status_code(), 400);
        assert_eq!(JappsError::UnsafeInput("x".into()).status_code(), 400);
        assert_eq!(JappsError::Unauthenticated("x".into()).status_code(), 401);
        assert_eq!(
            JappsError::Unauthorized {
                user: "alice".into()
            }
            .status_code(),
            403
        );
        assert_eq!(JappsError::NotFound("ref".into()).status_code(), 404);
        assert_eq!(JappsError::UpstreamUnavailable("hub".into()).status_code(), 504);
    }

    #[test]
    fn unsafe_input_detail_does_not_echo_input() {
        let err = JappsError::UnsafeInput("https://x;rm -rf /".into());
        assert!(!err.public_detail().contains("rm -rf"));
    }

    #[test]
    fn configuration_detail_names_field() {
        let err = JappsError::configuration("filepath", "required for framework streamlit");
        assert!(err.public_detail().contains("filepath"));
    }

    #[test]
    fn unauthenticated_detail_is_uniform() {
        let a = JappsError::Unauthenticated("hub returned 403".into());
        let b = JappsError::Unauthenticated("no credential".into());
        assert_eq!(a.public_detail(), b.public_detail());
    }
}
