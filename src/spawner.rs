use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::{debug, error, info, warn};

use crate::app_config::{AppConfiguration, UserOptions};
use crate::command::{framework_env, render_command, synthesize, SpawnContext, SpawnUser};
use crate::config::{resolve_python_executable, ServiceConfig};
use crate::error::JappsError;

pub const SPAWNER_PORT_ENV: &str = "JHUB_APPS_SPAWNER_PORT";
pub const FRAMEWORK_ENV: &str = "JHUB_APPS_FRAMEWORK";

/// Final argv and environment handed to a base spawner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnedServer {
    pub ip: String,
    pub port: u16,
    pub pid: Option<u32>,
}

/// Capability set of a generic process spawner.
pub trait Spawner {
    fn name(&self) -> &str;
    fn user(&self) -> &SpawnUser;
    fn port(&self) -> u16;
    fn user_options(&self) -> &serde_json::Value;
    fn load_user_options(&mut self) -> Result<(), JappsError>;
    fn get_args(&self) -> Vec<String>;
    fn get_env(&self) -> BTreeMap<String, String>;
    fn start(&mut self, launch: LaunchSpec) -> Result<SpawnedServer, JappsError>;
    fn stop(&mut self) -> Result<(), JappsError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnerSettings {
    pub python_executable: String,
    pub bind_url: String,
    pub launcher: String,
}

impl SpawnerSettings {
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self {
            python_executable: resolve_python_executable(&cfg.spawner.python_executable),
            bind_url: cfg.spawner.bind_url.clone(),
            launcher: cfg.spawner.launcher.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnPhase {
    Idle,
    Configuring,
    Synthesizing,
    Delegating,
    Running,
    Failed,
}

/// Wraps a base spawner and replaces its argv/env construction for app
/// servers (`user_options.jhub_app == true`). Everything else is delegated.
pub struct AppSpawner<S: Spawner> {
    base: S,
    settings: SpawnerSettings,
    phase: SpawnPhase,
}

pub fn is_app_launch(user_options: &serde_json::Value) -> bool {
    user_options
        .get("jhub_app")
        .and_then(|value| value.as_bool())
        .unwrap_or(false)
}

/// Variables injected into an app's environment: the service variables, then
/// the app's own `env`, which wins on key collision.
pub fn app_env(config: &AppConfiguration, ctx: &SpawnContext) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(SPAWNER_PORT_ENV.to_string(), ctx.port.to_string());
    env.insert(FRAMEWORK_ENV.to_string(), config.framework.to_string());
    env.extend(framework_env(config, ctx));
    env.extend(config.env.clone());
    env
}

impl<S: Spawner> AppSpawner<S> {
    pub fn new(base: S, settings: SpawnerSettings) -> Self {
        Self {
            base,
            settings,
            phase: SpawnPhase::Idle,
        }
    }

    pub fn phase(&self) -> SpawnPhase {
        self.phase
    }

    pub fn base(&self) -> &S {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut S {
        &mut self.base
    }

    pub fn is_app(&self) -> bool {
        is_app_launch(self.base.user_options())
    }

    pub fn app_configuration(&self) -> Result<AppConfiguration, JappsError> {
        UserOptions::from_value(self.base.user_options())?.into_app_configuration()
    }

    pub fn spawn_context(&self) -> SpawnContext {
        SpawnContext {
            port: self.base.port(),
            python_executable: self.settings.python_executable.clone(),
            bind_url: self.settings.bind_url.clone(),
            user: self.base.user().clone(),
            app_name: self.base.name().to_string(),
        }
    }

    pub fn get_args(&self) -> Result<Vec<String>, JappsError> {
        if !self.is_app() {
            return Ok(self.base.get_args());
        }
        let config = self.app_configuration()?;
        synthesize(&config, &self.spawn_context(), &self.settings.launcher)
    }

    /// Base environment overlaid with `app_env`.
    pub fn get_env(&self) -> Result<BTreeMap<String, String>, JappsError> {
        let mut env = self.base.get_env();
        if !self.is_app() {
            return Ok(env);
        }
        let config = self.app_configuration()?;
        env.extend(app_env(&config, &self.spawn_context()));
        Ok(env)
    }

    fn prepare_app_launch(&mut self) -> Result<LaunchSpec, JappsError> {
        let config = self.app_configuration()?;
        let ctx = self.spawn_context();
        self.phase = SpawnPhase::Synthesizing;
        let argv = synthesize(&config, &ctx, &self.settings.launcher)?;
        let mut env = self.base.get_env();
        env.extend(app_env(&config, &ctx));
        info!(
            user = %ctx.user.name,
            app = %ctx.app_name,
            framework = %config.framework,
            port = ctx.port,
            command = %render_command(&argv),
            env_keys = ?env.keys().collect::<Vec<_>>(),
            "synthesized app command"
        );
        Ok(LaunchSpec { argv, env })
    }

    fn run_start(&mut self) -> Result<SpawnedServer, JappsError> {
        self.phase = SpawnPhase::Configuring;
        self.base.load_user_options()?;
        let launch = if self.is_app() {
            self.prepare_app_launch()?
        } else {
            debug!(app = %self.base.name(), "not an app launch, delegating unchanged");
            LaunchSpec {
                argv: self.base.get_args(),
                env: self.base.get_env(),
            }
        };
        self.phase = SpawnPhase::Delegating;
        self.base.start(launch)
    }

    pub fn start(&mut self) -> Result<SpawnedServer, JappsError> {
        if self.phase == SpawnPhase::Running {
            return Err(JappsError::Spawn(format!(
                "app '{}' is already running",
                self.base.name()
            )));
        }
        match self.run_start() {
            Ok(server) => {
                self.phase = SpawnPhase::Running;
                info!(app = %self.base.name(), port = server.port, pid = ?server.pid, "app started");
                Ok(server)
            }
            Err(err) => {
                self.phase = SpawnPhase::Failed;
                error!(app = %self.base.name(), error = %err, "app failed to start");
                Err(err)
            }
        }
    }

    pub fn stop(&mut self) -> Result<(), JappsError> {
        self.base.stop()?;
        self.phase = SpawnPhase::Idle;
        Ok(())
    }
}

/// Base spawner that runs the launch argv as a local child process.
pub struct LocalProcessSpawner {
    name: String,
    user: SpawnUser,
    port: u16,
    user_options: serde_json::Value,
    options_path: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    child: Option<Child>,
}

impl LocalProcessSpawner {
    pub fn new(name: impl Into<String>, user: SpawnUser, port: u16) -> Self {
        Self {
            name: name.into(),
            user,
            port,
            user_options: serde_json::Value::Null,
            options_path: None,
            working_dir: None,
            child: None,
        }
    }

    /// `load_user_options` reads the options from this JSON file.
    pub fn with_options_file(mut self, path: PathBuf) -> Self {
        self.options_path = Some(path);
        self
    }

    pub fn with_user_options(mut self, options: serde_json::Value) -> Self {
        self.user_options = options;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Blocks until the child exits and returns its status code.
    pub fn wait(&mut self) -> Result<i32, JappsError> {
        let Some(child) = self.child.as_mut() else {
            return Err(JappsError::Spawn("no process has been started".to_string()));
        };
        let status = child.wait()?;
        self.child = None;
        Ok(status
            .code()
            .unwrap_or(if status.success() { 0 } else { 1 }))
    }
}

impl Spawner for LocalProcessSpawner {
    fn name(&self) -> &str {
        &self.name
    }

    fn user(&self) -> &SpawnUser {
        &self.user
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn user_options(&self) -> &serde_json::Value {
        &self.user_options
    }

    fn load_user_options(&mut self) -> Result<(), JappsError> {
        if let Some(path) = &self.options_path {
            let content = fs::read_to_string(path)?;
            self.user_options = serde_json::from_str(&content)?;
        }
        Ok(())
    }

    fn get_args(&self) -> Vec<String> {
        vec![
            "jupyterhub-singleuser".to_string(),
            format!("--port={}", self.port),
        ]
    }

    fn get_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for key in ["PATH", "HOME", "LANG", "TMPDIR"] {
            if let Ok(value) = env::var(key) {
                env.insert(key.to_string(), value);
            }
        }
        env.insert("JUPYTERHUB_USER".to_string(), self.user.name.clone());
        env.insert("JUPYTERHUB_SERVER_NAME".to_string(), self.name.clone());
        env
    }

    fn start(&mut self, launch: LaunchSpec) -> Result<SpawnedServer, JappsError> {
        let Some((program, args)) = launch.argv.split_first() else {
            return Err(JappsError::Spawn("launch argv is empty".to_string()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&launch.env)
            .stdin(Stdio::null());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        let child = cmd.spawn().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                JappsError::Spawn(format!("executable not found: {program}"))
            } else {
                JappsError::Spawn(format!("failed to start {program}: {err}"))
            }
        })?;
        let pid = child.id();
        self.child = Some(child);
        Ok(SpawnedServer {
            ip: "127.0.0.1".to_string(),
            port: self.port,
            pid: Some(pid),
        })
    }

    fn stop(&mut self) -> Result<(), JappsError> {
        if let Some(mut child) = self.child.take() {
            match child.kill() {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
                Err(err) => return Err(JappsError::Io(err)),
            }
            if let Err(err) = child.wait() {
                warn!(app = %self.name, error = %err, "failed to reap stopped app process");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct MockSpawner {
        user_options: serde_json::Value,
        base_env: BTreeMap<String, String>,
        starts: RefCell<Vec<LaunchSpec>>,
        fail_start: bool,
        stops: RefCell<u32>,
        loads: RefCell<u32>,
        user: Option<SpawnUser>,
        option_reads: Cell<u32>,
    }

    impl MockSpawner {
        fn with_options(options: serde_json::Value) -> Self {
            Self {
                user_options: options,
                user: Some(SpawnUser {
                    name: "testuser".to_string(),
                    id: 1,
                }),
                ..Self::default()
            }
        }

        fn starts(&self) -> Vec<LaunchSpec> {
            self.starts.borrow().clone()
        }
    }

    impl Spawner for MockSpawner {
        fn name(&self) -> &str {
            "test-app"
        }

        fn user(&self) -> &SpawnUser {
            self.user.as_ref().expect("user")
        }

        fn port(&self) -> u16 {
            8888
        }

        fn user_options(&self) -> &serde_json::Value {
            self.option_reads.set(self.option_reads.get() + 1);
            &self.user_options
        }

        fn load_user_options(&mut self) -> Result<(), JappsError> {
            *self.loads.borrow_mut() += 1;
            Ok(())
        }

        fn get_args(&self) -> Vec<String> {
            vec!["base-server".to_string()]
        }

        fn get_env(&self) -> BTreeMap<String, String> {
            self.base_env.clone()
        }

        fn start(&mut self, launch: LaunchSpec) -> Result<SpawnedServer, JappsError> {
            self.starts.borrow_mut().push(launch);
            if self.fail_start {
                return Err(JappsError::Spawn("runtime refused".to_string()));
            }
            Ok(SpawnedServer {
                ip: "localhost".to_string(),
                port: 8888,
                pid: None,
            })
        }

        fn stop(&mut self) -> Result<(), JappsError> {
            *self.stops.borrow_mut() += 1;
            Ok(())
        }
    }

    fn settings() -> SpawnerSettings {
        SpawnerSettings {
            python_executable: "python3".to_string(),
            bind_url: "http://localhost:8000".to_string(),
            launcher: "jhub-app-proxy".to_string(),
        }
    }

    #[test]
    fn pass_through_when_not_an_app() {
        let mut spawner = AppSpawner::new(MockSpawner::with_options(json!({})), settings());
        spawner.start().unwrap();
        let starts = spawner.base().starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].argv, vec!["base-server"]);
        assert!(!starts[0].env.contains_key(SPAWNER_PORT_ENV));
        assert_eq!(spawner.phase(), SpawnPhase::Running);
    }

    #[test]
    fn app_launch_uses_synthesized_args() {
        let base = MockSpawner::with_options(json!({
            "jhub_app": true,
            "framework": "custom",
            "custom_command": "python app.py --port {port}",
            "filepath": "",
            "skip_conda": true,
        }));
        let mut spawner = AppSpawner::new(base, settings());
        spawner.start().unwrap();
        let starts = spawner.base().starts();
        assert_eq!(
            starts[0].argv,
            vec!["/bin/sh", "-c", "python app.py --port {port}"]
        );
        assert_eq!(
            starts[0].env.get(SPAWNER_PORT_ENV).map(String::as_str),
            Some("8888")
        );
        assert_eq!(
            starts[0].env.get(FRAMEWORK_ENV).map(String::as_str),
            Some("custom")
        );
        assert_eq!(*spawner.base().loads.borrow(), 1);
    }

    #[test]
    fn app_env_wins_over_defaults() {
        let mut base = MockSpawner::with_options(json!({
            "jhub_app": true,
            "framework": "panel",
            "filepath": "app.py",
            "env": {"PATH": "/opt/app/bin", "API_URL": "https://api"},
        }));
        base.base_env
            .insert("PATH".to_string(), "/usr/bin".to_string());
        base.base_env
            .insert("JUPYTERHUB_USER".to_string(), "testuser".to_string());
        let spawner = AppSpawner::new(base, settings());
        let env = spawner.get_env().unwrap();
        assert_eq!(env.get("PATH").map(String::as_str), Some("/opt/app/bin"));
        assert_eq!(env.get("API_URL").map(String::as_str), Some("https://api"));
        assert_eq!(env.get("JUPYTERHUB_USER").map(String::as_str), Some("testuser"));
    }

    #[test]
    fn start_parses_user_options_once() {
        let mut base = MockSpawner::with_options(json!({
            "jhub_app": true,
            "framework": "panel",
            "filepath": "app.py",
        }));
        base.base_env
            .insert("HOME".to_string(), "/home/testuser".to_string());
        let mut spawner = AppSpawner::new(base, settings());
        spawner.start().unwrap();
        // One read to detect the app launch, one to build its configuration.
        assert_eq!(spawner.base().option_reads.get(), 2);
        let starts = spawner.base().starts();
        let env = &starts[0].env;
        assert_eq!(env.get("HOME").map(String::as_str), Some("/home/testuser"));
        assert_eq!(env.get(FRAMEWORK_ENV).map(String::as_str), Some("panel"));
    }

    #[test]
    fn spawn_context_comes_from_base_spawner() {
        let spawner = AppSpawner::new(MockSpawner::with_options(json!({})), settings());
        let ctx = spawner.spawn_context();
        assert_eq!(ctx.port, 8888);
        assert_eq!(ctx.app_name, "test-app");
        assert_eq!(ctx.user.name, "testuser");
        assert_eq!(ctx.python_executable, "python3");
    }

    #[test]
    fn invalid_config_fails_before_delegating() {
        let base = MockSpawner::with_options(json!({
            "jhub_app": true,
            "framework": "streamlit",
        }));
        let mut spawner = AppSpawner::new(base, settings());
        let err = spawner.start().expect_err("filepath missing");
        assert!(matches!(err, JappsError::Configuration { .. }));
        assert!(spawner.base().starts().is_empty());
        assert_eq!(spawner.phase(), SpawnPhase::Failed);
    }

    #[test]
    fn runtime_errors_propagate() {
        let mut base = MockSpawner::with_options(json!({
            "jhub_app": true,
            "framework": "panel",
            "filepath": "app.py",
        }));
        base.fail_start = true;
        let mut spawner = AppSpawner::new(base, settings());
        let err = spawner.start().expect_err("runtime failure");
        assert!(err.to_string().contains("runtime refused"));
        assert_eq!(spawner.phase(), SpawnPhase::Failed);
    }

    #[test]
    fn second_start_while_running_is_rejected() {
        let mut spawner = AppSpawner::new(MockSpawner::with_options(json!({})), settings());
        spawner.start().unwrap();
        assert!(spawner.start().is_err());
        spawner.stop().unwrap();
        assert_eq!(spawner.phase(), SpawnPhase::Idle);
        assert_eq!(*spawner.base().stops.borrow(), 1);
        spawner.start().unwrap();
    }

    #[test]
    fn get_args_with_conda_env_prefixes_launcher() {
        let base = MockSpawner::with_options(json!({
            "jhub_app": true,
            "framework": "custom",
            "custom_command": "python app.py --port {port}",
            "conda_env": "myenv",
            "skip_conda": false,
        }));
        let spawner = AppSpawner::new(base, settings());
        let args = spawner.get_args().unwrap();
        assert!(args.contains(&"--conda-env=myenv".to_string()));
        assert!(args.iter().any(|arg| arg.contains("{port}")));
        assert_eq!(args[0], "jhub-app-proxy");
    }

    #[cfg(unix)]
    #[test]
    fn local_spawner_runs_synthesized_command() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker.txt");
        let options = json!({
            "jhub_app": true,
            "framework": "custom",
            "custom_command": format!("printf '%s' \"$JHUB_APPS_SPAWNER_PORT\" > {}", marker.display()),
            "skip_conda": true,
        });
        let base = LocalProcessSpawner::new(
            "demo",
            SpawnUser {
                name: "alice".to_string(),
                id: 7,
            },
            9123,
        )
        .with_user_options(options);
        let mut spawner = AppSpawner::new(base, settings());
        spawner.start().unwrap();
        let code = spawner.base_mut().wait().unwrap();
        assert_eq!(code, 0);
        assert_eq!(fs::read_to_string(&marker).unwrap(), "9123");
    }

    #[cfg(unix)]
    #[test]
    fn local_spawner_stop_kills_and_reaps_child() {
        let mut base = LocalProcessSpawner::new(
            "demo",
            SpawnUser {
                name: "alice".to_string(),
                id: 7,
            },
            9124,
        );
        base.start(LaunchSpec {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
            env: BTreeMap::new(),
        })
        .unwrap();
        base.stop().unwrap();
        assert!(base.wait().is_err());
        base.stop().unwrap();
    }

    #[test]
    fn local_spawner_reports_missing_executable() {
        let mut base = LocalProcessSpawner::new(
            "demo",
            SpawnUser {
                name: "alice".to_string(),
                id: 7,
            },
            9123,
        );
        let err = base
            .start(LaunchSpec {
                argv: vec!["/nonexistent/japps-test-binary".to_string()],
                env: BTreeMap::new(),
            })
            .expect_err("missing binary");
        assert!(err.to_string().contains("executable not found"));
    }
}
