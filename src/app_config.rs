//! Spawn-time app descriptors.
//!
//! `UserOptions` is the loose record stored by the hub alongside a server
//! (unknown keys are tolerated). `AppConfiguration` is the validated form the
//! command synthesizer consumes; it is never persisted by this crate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::JappsError;
use crate::framework::{FilepathRequirement, Framework, FrameworkSpec};

pub const DEFAULT_CONFIG_DIRECTORY: &str = ".";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Repository {
    pub url: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    #[serde(default = "default_config_directory")]
    pub config_directory: String,
}

fn default_config_directory() -> String {
    DEFAULT_CONFIG_DIRECTORY.to_string()
}

impl Repository {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            git_ref: None,
            config_directory: default_config_directory(),
        }
    }

    /// The ref to check out. An empty ref means the default branch.
    pub fn requested_ref(&self) -> Option<&str> {
        self.git_ref.as_deref().filter(|git_ref| !git_ref.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UserOptions {
    pub jhub_app: bool,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub framework: Option<String>,
    pub custom_command: Option<String>,
    pub filepath: Option<String>,
    pub conda_env: Option<String>,
    pub skip_conda: bool,
    pub env: Option<BTreeMap<String, String>>,
    pub thumbnail: Option<String>,
    pub repository: Option<Repository>,
    pub keep_alive: bool,
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppConfiguration {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub framework: Framework,
    pub custom_command: Option<String>,
    pub filepath: Option<String>,
    pub conda_env: Option<String>,
    pub skip_conda: bool,
    pub thumbnail: Option<String>,
    pub repository: Option<Repository>,
    pub env: BTreeMap<String, String>,
    pub keep_alive: bool,
    pub public: bool,
}

/// What drives command construction for a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppLaunch<'a> {
    Builtin {
        spec: FrameworkSpec,
        filepath: Option<&'a str>,
    },
    Custom {
        command: &'a str,
    },
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|text| {
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    })
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}

impl UserOptions {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, JappsError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|err| JappsError::configuration("user_options", err.to_string()))
    }

    pub fn into_app_configuration(self) -> Result<AppConfiguration, JappsError> {
        let framework: Framework = match non_empty(self.framework) {
            Some(name) => name.parse()?,
            None => {
                return Err(JappsError::configuration(
                    "framework",
                    "a framework is required",
                ))
            }
        };
        let config = AppConfiguration {
            display_name: non_empty(self.display_name),
            description: non_empty(self.description),
            framework,
            custom_command: non_empty(self.custom_command),
            filepath: non_empty(self.filepath),
            conda_env: non_empty(self.conda_env),
            skip_conda: self.skip_conda,
            thumbnail: non_empty(self.thumbnail),
            repository: self.repository,
            env: self.env.unwrap_or_default(),
            keep_alive: self.keep_alive,
            public: self.public,
        };
        config.validate()?;
        Ok(config)
    }
}

impl AppConfiguration {
    pub fn new(framework: Framework) -> Self {
        Self {
            display_name: None,
            description: None,
            framework,
            custom_command: None,
            filepath: None,
            conda_env: None,
            skip_conda: false,
            thumbnail: None,
            repository: None,
            env: BTreeMap::new(),
            keep_alive: false,
            public: false,
        }
    }

    /// Shape checks that do not depend on spawn-time state.
    pub fn validate(&self) -> Result<(), JappsError> {
        if !self.framework.is_custom()
            && self
                .custom_command
                .as_deref()
                .is_some_and(|cmd| !cmd.trim().is_empty())
        {
            return Err(JappsError::configuration(
                "custom_command",
                format!(
                    "only valid with framework 'custom', not '{}'",
                    self.framework
                ),
            ));
        }
        for key in self.env.keys() {
            if !is_valid_env_key(key) {
                return Err(JappsError::configuration(
                    "env",
                    format!("'{key}' is not a valid environment variable name"),
                ));
            }
        }
        if self.env.values().any(|value| value.contains('\0')) {
            return Err(JappsError::configuration(
                "env",
                "environment values must not contain NUL bytes",
            ));
        }
        if let Some(thumbnail) = &self.thumbnail {
            if !thumbnail.starts_with("data:") {
                return Err(JappsError::configuration(
                    "thumbnail",
                    "must be a data URL",
                ));
            }
        }
        Ok(())
    }

    /// Conda environment to activate, honouring `skip_conda`.
    pub fn active_conda_env(&self) -> Option<&str> {
        if self.skip_conda {
            return None;
        }
        self.conda_env
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn launch(&self) -> Result<AppLaunch<'_>, JappsError> {
        if self.framework.is_custom() {
            let command = self
                .custom_command
                .as_deref()
                .filter(|cmd| !cmd.trim().is_empty())
                .ok_or_else(|| {
                    JappsError::configuration(
                        "custom_command",
                        "required for framework 'custom'",
                    )
                })?;
            return Ok(AppLaunch::Custom { command });
        }
        let spec = self.framework.spec();
        let filepath = self
            .filepath
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty());
        let filepath = match spec.filepath {
            FilepathRequirement::Required => Some(filepath.ok_or_else(|| {
                JappsError::configuration(
                    "filepath",
                    format!("required for framework '{}'", self.framework),
                )
            })?),
            FilepathRequirement::Optional => filepath,
            FilepathRequirement::Unused => None,
        };
        Ok(AppLaunch::Builtin { spec, filepath })
    }

    pub fn to_user_options(&self) -> UserOptions {
        UserOptions {
            jhub_app: true,
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            framework: Some(self.framework.as_str().to_string()),
            custom_command: self.custom_command.clone(),
            filepath: self.filepath.clone(),
            conda_env: self.conda_env.clone(),
            skip_conda: self.skip_conda,
            env: Some(self.env.clone()),
            thumbnail: self.thumbnail.clone(),
            repository: self.repository.clone(),
            keep_alive: self.keep_alive,
            public: self.public,
        }
    }
}
