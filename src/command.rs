//! Spawn command synthesis.
//!
//! Built-in frameworks get their `{port}` resolved here because the spawner
//! runs them directly. Custom commands keep the literal `{port}` token: the
//! proxy that launches them substitutes it at runtime.

use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::app_config::{AppConfiguration, AppLaunch};
use crate::error::JappsError;

pub const SHELL: &str = "/bin/sh";
pub const SHELL_COMMAND_FLAG: &str = "-c";
pub const CONDA_ENV_FLAG: &str = "--conda-env=";
pub const MAX_CUSTOM_COMMAND_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnUser {
    pub name: String,
    pub id: u64,
}

/// Live spawner state supplied at spawn time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnContext {
    pub port: u16,
    pub python_executable: String,
    pub bind_url: String,
    pub user: SpawnUser,
    pub app_name: String,
}

impl SpawnContext {
    pub fn base_url(&self) -> String {
        format!("/user/{}/{}/", self.user.name, self.app_name)
    }

    /// `host[:port]` of the hub's public bind url.
    pub fn origin_host(&self) -> String {
        match url::Url::parse(&self.bind_url) {
            Ok(parsed) => match (parsed.host_str(), parsed.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                _ => self.bind_url.clone(),
            },
            Err(_) => self.bind_url.clone(),
        }
    }

    fn validate(&self) -> Result<(), JappsError> {
        for (field, value) in [("user.name", &self.user.name), ("app_name", &self.app_name)] {
            if value.is_empty() {
                return Err(JappsError::configuration(field, "must be non-empty"));
            }
            if value
                .chars()
                .any(|ch| ch.is_control() || matches!(ch, '{' | '}' | '/'))
            {
                return Err(JappsError::configuration(
                    field,
                    "contains characters that cannot appear in a url path segment",
                ));
            }
        }
        if self.port == 0 {
            return Err(JappsError::configuration("port", "must be greater than 0"));
        }
        Ok(())
    }
}

struct Slots<'a> {
    ctx: &'a SpawnContext,
    filepath: Option<&'a str>,
}

impl Slots<'_> {
    fn get(&self, name: &str) -> Option<Cow<'_, str>> {
        match name {
            "port" => Some(Cow::Owned(self.ctx.port.to_string())),
            "python_executable" => Some(Cow::Borrowed(self.ctx.python_executable.as_str())),
            "filepath" => self.filepath.map(Cow::Borrowed),
            "base_url" => Some(Cow::Owned(self.ctx.base_url())),
            "origin_host" => Some(Cow::Owned(self.ctx.origin_host())),
            "username" => Some(Cow::Borrowed(self.ctx.user.name.as_str())),
            "app_name" => Some(Cow::Borrowed(self.ctx.app_name.as_str())),
            _ => None,
        }
    }
}

/// Single-pass slot substitution. Inserted values are never rescanned, and
/// unknown slots are kept verbatim.
fn render_template(template: &str, slots: &Slots<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match slots.get(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn validate_custom_command(command: &str) -> Result<(), JappsError> {
    if command.len() > MAX_CUSTOM_COMMAND_BYTES {
        return Err(JappsError::UnsafeInput(format!(
            "custom_command exceeds {MAX_CUSTOM_COMMAND_BYTES} bytes"
        )));
    }
    if command
        .chars()
        .any(|ch| ch.is_control() && ch != '\t' && ch != '\n')
    {
        return Err(JappsError::UnsafeInput(
            "custom_command contains control characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_filepath(filepath: &str) -> Result<(), JappsError> {
    if filepath.starts_with('-') {
        return Err(JappsError::configuration(
            "filepath",
            "must not start with '-'",
        ));
    }
    if filepath
        .chars()
        .any(|ch| ch.is_control() || matches!(ch, '{' | '}'))
    {
        return Err(JappsError::configuration(
            "filepath",
            "must not contain braces or control characters",
        ));
    }
    Ok(())
}

fn validate_conda_env(name: &str) -> Result<&str, JappsError> {
    let valid = name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
        && !name.starts_with('-');
    if !valid {
        return Err(JappsError::configuration(
            "conda_env",
            "may only contain letters, digits, '.', '_' and '-'",
        ));
    }
    Ok(name)
}

/// Builds the argv for one app launch.
///
/// With an active conda environment the result is
/// `[launcher, --conda-env=<name>, framework-args...]`; otherwise it is the
/// framework args alone. For custom commands the framework args are
/// `["/bin/sh", "-c", <custom_command>]`.
pub fn synthesize(
    config: &AppConfiguration,
    ctx: &SpawnContext,
    launcher: &str,
) -> Result<Vec<String>, JappsError> {
    config.validate()?;
    ctx.validate()?;
    let launch = config.launch()?;

    let mut argv = Vec::new();
    if let Some(env_name) = config.active_conda_env() {
        let env_name = validate_conda_env(env_name)?;
        argv.push(launcher.to_string());
        argv.push(format!("{CONDA_ENV_FLAG}{env_name}"));
    }

    match launch {
        AppLaunch::Custom { command } => {
            validate_custom_command(command)?;
            argv.push(SHELL.to_string());
            argv.push(SHELL_COMMAND_FLAG.to_string());
            argv.push(command.to_string());
        }
        AppLaunch::Builtin { spec, filepath } => {
            if let Some(filepath) = filepath {
                validate_filepath(filepath)?;
            }
            let slots = Slots { ctx, filepath };
            for arg in spec.template {
                if *arg == "{filepath}" && filepath.is_none() {
                    continue;
                }
                argv.push(render_template(arg, &slots));
            }
        }
    }
    Ok(argv)
}

/// Framework-specific environment defaults with their slots resolved.
pub fn framework_env(config: &AppConfiguration, ctx: &SpawnContext) -> BTreeMap<String, String> {
    let spec = config.framework.spec();
    let filepath = config.filepath.as_deref();
    let slots = Slots { ctx, filepath };
    spec.env
        .iter()
        .map(|(key, value)| (key.to_string(), render_template(value, &slots)))
        .collect()
}

/// Copy-pasteable rendering of an argv, for logs and CLI output. Arguments
/// with shell metacharacters are single-quoted.
pub fn render_command(argv: &[String]) -> String {
    argv.iter()
        .map(|part| {
            let plain = !part.is_empty()
                && part.chars().all(|ch| {
                    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/' | '=' | ':')
                });
            if plain {
                part.clone()
            } else {
                format!("'{}'", part.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{Framework, ALL_FRAMEWORKS};

    fn context(port: u16) -> SpawnContext {
        SpawnContext {
            port,
            python_executable: "python3".to_string(),
            bind_url: "http://localhost:8000".to_string(),
            user: SpawnUser {
                name: "testuser".to_string(),
                id: 1,
            },
            app_name: "test-app".to_string(),
        }
    }

    fn custom(command: &str) -> AppConfiguration {
        let mut config = AppConfiguration::new(Framework::Custom);
        config.custom_command = Some(command.to_string());
        config.skip_conda = true;
        config
    }

    fn builtin(framework: Framework) -> AppConfiguration {
        let mut config = AppConfiguration::new(framework);
        config.filepath = Some("app.py".to_string());
        config
    }

    #[test]
    fn custom_command_is_wrapped_in_shell_with_port_intact() {
        let argv = synthesize(
            &custom("python app.py --port {port}"),
            &context(8888),
            "jhub-app-proxy",
        )
        .unwrap();
        assert_eq!(argv, vec!["/bin/sh", "-c", "python app.py --port {port}"]);
    }

    #[test]
    fn custom_command_keeps_shell_operators() {
        let body = "uvicorn main:app --port {port} | tee app.log";
        let argv = synthesize(&custom(body), &context(8888), "jhub-app-proxy").unwrap();
        assert_eq!(argv.len(), 3);
        assert_eq!(argv[2], body);
    }

    #[test]
    fn custom_command_keeps_cd_and_export() {
        for body in [
            "cd /home/user/app && npm start -- --port {port}",
            "export MY_VAR=value && python app.py --port $JHUB_APPS_SPAWNER_PORT",
        ] {
            let argv = synthesize(&custom(body), &context(8888), "jhub-app-proxy").unwrap();
            assert_eq!(argv[2], body);
        }
    }

    #[test]
    fn custom_command_with_conda_env_prefixes_launcher() {
        let mut config = custom("python app.py --port {port}");
        config.skip_conda = false;
        config.conda_env = Some("myenv".to_string());
        let argv = synthesize(&config, &context(8888), "jhub-app-proxy").unwrap();
        assert_eq!(
            argv,
            vec![
                "jhub-app-proxy",
                "--conda-env=myenv",
                "/bin/sh",
                "-c",
                "python app.py --port {port}"
            ]
        );
        assert_eq!(argv.iter().filter(|a| *a == "--conda-env=myenv").count(), 1);
    }

    #[test]
    fn skip_conda_always_wins() {
        for framework in ALL_FRAMEWORKS {
            let mut config = if framework.is_custom() {
                custom("run {port}")
            } else {
                builtin(framework)
            };
            config.conda_env = Some("myenv".to_string());
            config.skip_conda = true;
            let argv = synthesize(&config, &context(9000), "jhub-app-proxy").unwrap();
            assert!(
                !argv.iter().any(|arg| arg.contains("--conda-env=")),
                "{framework}: {argv:?}"
            );
        }
    }

    #[test]
    fn conda_flag_appears_exactly_once_for_builtins() {
        let mut config = builtin(Framework::Panel);
        config.conda_env = Some("x".to_string());
        let argv = synthesize(&config, &context(9000), "jhub-app-proxy").unwrap();
        assert_eq!(argv[0], "jhub-app-proxy");
        assert_eq!(argv[1], "--conda-env=x");
        assert_eq!(argv[2], "python3");
        assert_eq!(argv.iter().filter(|a| *a == "--conda-env=x").count(), 1);
    }

    #[test]
    fn streamlit_port_is_resolved() {
        let argv = synthesize(&builtin(Framework::Streamlit), &context(8888), "launcher").unwrap();
        assert!(argv.contains(&"--server.port=8888".to_string()));
        assert!(argv.contains(&"app.py".to_string()));
        assert!(!argv.iter().any(|arg| arg.contains("{port}")));
        assert_eq!(argv[0], "python3");
    }

    #[test]
    fn no_port_placeholder_survives_for_any_builtin() {
        for framework in ALL_FRAMEWORKS.into_iter().filter(|f| !f.is_custom()) {
            let argv = synthesize(&builtin(framework), &context(4321), "launcher").unwrap();
            assert!(
                !argv.iter().any(|arg| arg.contains("{port}")),
                "{framework}: {argv:?}"
            );
            assert!(
                argv.iter().any(|arg| arg.contains("4321")),
                "{framework}: {argv:?}"
            );
            assert!(!argv.iter().any(|arg| arg.contains('{')), "{framework}: {argv:?}");
        }
    }

    #[test]
    fn repeated_port_slots_substitute_identically() {
        let slots_ctx = context(7000);
        let slots = Slots {
            ctx: &slots_ctx,
            filepath: None,
        };
        assert_eq!(
            render_template("--port={port} --proxy={port}/{port}", &slots),
            "--port=7000 --proxy=7000/7000"
        );
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let mut ctx = context(7000);
        ctx.python_executable = "/opt/{filepath}/bin/python".to_string();
        let argv = synthesize(&builtin(Framework::Python), &ctx, "launcher").unwrap();
        assert_eq!(argv[0], "/opt/{filepath}/bin/python");
        assert_eq!(argv[1], "app.py");
    }

    #[test]
    fn unknown_and_unclosed_slots_are_literal() {
        let ctx = context(1);
        let slots = Slots {
            ctx: &ctx,
            filepath: None,
        };
        assert_eq!(render_template("{nope} {port", &slots), "{nope} {port");
    }

    #[test]
    fn voila_without_filepath_drops_the_slot() {
        let config = AppConfiguration::new(Framework::Voila);
        let argv = synthesize(&config, &context(8000), "launcher").unwrap();
        assert_eq!(&argv[..3], &["python3", "-m", "voila"]);
        assert_eq!(argv[3], "--port=8000");
    }

    #[test]
    fn missing_filepath_is_a_configuration_error() {
        let config = AppConfiguration::new(Framework::Bokeh);
        let err = synthesize(&config, &context(8000), "launcher").expect_err("no filepath");
        assert!(matches!(err, JappsError::Configuration { ref field, .. } if field == "filepath"));
    }

    #[test]
    fn empty_custom_command_is_a_configuration_error() {
        let err = synthesize(&custom("   "), &context(8000), "launcher").expect_err("empty");
        assert!(
            matches!(err, JappsError::Configuration { ref field, .. } if field == "custom_command")
        );
    }

    #[test]
    fn custom_command_with_nul_is_unsafe() {
        let err =
            synthesize(&custom("python app.py\0"), &context(8000), "launcher").expect_err("nul");
        assert!(matches!(err, JappsError::UnsafeInput(_)));
    }

    #[test]
    fn option_like_filepath_is_rejected() {
        let mut config = builtin(Framework::Panel);
        config.filepath = Some("--dev".to_string());
        let err = synthesize(&config, &context(8000), "launcher").expect_err("option");
        assert!(err.to_string().contains("filepath"));
    }

    #[test]
    fn conda_env_with_shell_characters_is_rejected() {
        let mut config = builtin(Framework::Panel);
        config.conda_env = Some("env; rm -rf ~".to_string());
        let err = synthesize(&config, &context(8000), "launcher").expect_err("bad env");
        assert!(err.to_string().contains("conda_env"));
    }

    #[test]
    fn panel_uses_service_prefix_and_origin() {
        let argv = synthesize(&builtin(Framework::Panel), &context(8000), "launcher").unwrap();
        assert!(argv.contains(&"--prefix=/user/testuser/test-app/".to_string()));
        assert!(argv.contains(&"--allow-websocket-origin=localhost:8000".to_string()));
    }

    #[test]
    fn gradio_env_is_rendered() {
        let env = framework_env(&builtin(Framework::Gradio), &context(8123));
        assert_eq!(env.get("GRADIO_SERVER_PORT").map(String::as_str), Some("8123"));
        assert_eq!(
            env.get("GRADIO_ROOT_PATH").map(String::as_str),
            Some("/user/testuser/test-app/")
        );
    }

    #[test]
    fn render_command_quotes_shell_body() {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo it's {port}".to_string(),
        ];
        assert_eq!(render_command(&argv), "/bin/sh -c 'echo it'\\''s {port}'");
    }
}
