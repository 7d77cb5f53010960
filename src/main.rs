mod app_config;
mod auth;
mod command;
mod config;
mod error;
mod framework;
mod repository;
mod server;
mod spawner;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::app_config::{Repository, UserOptions};
use crate::auth::{AuthGate, HubClient};
use crate::command::{render_command, SpawnUser};
use crate::config::{
    ensure_parent, load_service_config, read_config, resolve_config_path, validate_config,
    ServiceConfig, DEFAULT_CONFIG_YAML,
};
use crate::error::{JappsError, JsonResult};
use crate::framework::frameworks;
use crate::repository::{RepositoryLoader, SystemGit};
use crate::server::{serve, ApiRequest, ServiceState, DEFAULT_APP_NAME};
use crate::spawner::{app_env, AppSpawner, LocalProcessSpawner, SpawnerSettings};

#[derive(Parser, Debug)]
#[command(name = "japps", version, about = "App launcher control plane")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    /// Used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP control plane.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// List the supported frameworks and their command templates.
    Frameworks,
    /// Print the argv and environment an app would be launched with.
    Command {
        #[command(flatten)]
        launch: LaunchArgs,
    },
    /// Launch an app in the foreground and wait for it to exit.
    Spawn {
        #[command(flatten)]
        launch: LaunchArgs,
        #[arg(long)]
        working_dir: Option<PathBuf>,
    },
    Repo {
        #[command(subcommand)]
        command: RepoCommand,
    },
    /// Resolve the identity behind a hub token.
    Whoami {
        #[arg(long)]
        token: String,
    },
}

#[derive(clap::Args, Debug)]
struct LaunchArgs {
    /// JSON file holding the app's user_options.
    #[arg(long)]
    options: PathBuf,
    #[arg(long)]
    port: u16,
    #[arg(long, default_value = "user")]
    user: String,
    #[arg(long, default_value_t = 0)]
    user_id: u64,
    #[arg(long, default_value = DEFAULT_APP_NAME)]
    app_name: String,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    /// Print the effective configuration after environment overrides.
    Show,
}

#[derive(Subcommand, Debug)]
enum RepoCommand {
    /// Clone a repository and print the app configuration it declares.
    Load {
        #[arg(long)]
        url: String,
        #[arg(long = "ref")]
        git_ref: Option<String>,
        #[arg(long, default_value = ".")]
        config_directory: String,
    },
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn main() -> Result<(), JappsError> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let ctx = Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Serve { host, port } => handle_serve(&ctx, host, port),
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Frameworks => handle_frameworks(&ctx),
        Commands::Command { launch } => handle_command(&ctx, &launch),
        Commands::Spawn {
            launch,
            working_dir,
        } => handle_spawn(&ctx, &launch, working_dir),
        Commands::Repo { command } => handle_repo(&ctx, command),
        Commands::Whoami { token } => handle_whoami(&ctx, &token),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_code: Some(err.error_code().to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn service_config(ctx: &Context) -> Result<ServiceConfig, JappsError> {
    load_service_config(&ctx.config_path)
}

fn handle_serve(ctx: &Context, host: Option<String>, port: Option<u16>) -> Result<(), JappsError> {
    let cfg = service_config(ctx)?;
    let host = host.unwrap_or_else(|| cfg.service.listen_host.clone());
    let port = port.unwrap_or(cfg.service.listen_port);
    let listener = TcpListener::bind((host.as_str(), port))?;
    let provider = HubClient::new(&cfg)?;
    let git = SystemGit::locate()?;
    info!(hub = %cfg.hub.api_url, public_host = %cfg.service.public_host, "starting control plane");
    let state = Arc::new(ServiceState::new(cfg, provider, git));
    serve(listener, state)
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), JappsError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let cfg = read_config(&ctx.config_path)?;
            validate_config(&cfg)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let mut cfg = service_config(ctx)?;
            if !cfg.hub.api_token.is_empty() {
                cfg.hub.api_token = "<redacted>".to_string();
            }
            if !cfg.auth.session_secret.is_empty() {
                cfg.auth.session_secret = "<redacted>".to_string();
            }
            output(ctx, serde_json::to_value(cfg)?)
        }
    }
}

fn handle_frameworks(ctx: &Context) -> Result<(), JappsError> {
    output(ctx, serde_json::to_value(frameworks())?)
}

fn read_user_options(path: &Path) -> Result<serde_json::Value, JappsError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn base_spawner(launch: &LaunchArgs) -> LocalProcessSpawner {
    LocalProcessSpawner::new(
        launch.app_name.clone(),
        SpawnUser {
            name: launch.user.clone(),
            id: launch.user_id,
        },
        launch.port,
    )
}

fn handle_command(ctx: &Context, launch: &LaunchArgs) -> Result<(), JappsError> {
    let cfg = service_config(ctx)?;
    let mut options = read_user_options(&launch.options)?;
    // A preview always takes the app path.
    if let Some(map) = options.as_object_mut() {
        map.insert("jhub_app".to_string(), serde_json::Value::Bool(true));
    }
    let config = UserOptions::from_value(&options)?.into_app_configuration()?;
    let spawner = AppSpawner::new(
        base_spawner(launch).with_user_options(options),
        SpawnerSettings::from_config(&cfg),
    );
    let argv = spawner.get_args()?;
    let env = app_env(&config, &spawner.spawn_context());
    output(
        ctx,
        json!({
            "framework": config.framework,
            "argv": argv,
            "command": render_command(&argv),
            "env": env,
        }),
    )
}

fn handle_spawn(
    ctx: &Context,
    launch: &LaunchArgs,
    working_dir: Option<PathBuf>,
) -> Result<(), JappsError> {
    let cfg = service_config(ctx)?;
    let mut base = base_spawner(launch).with_options_file(launch.options.clone());
    if let Some(dir) = working_dir {
        base = base.with_working_dir(dir);
    }
    let mut spawner = AppSpawner::new(base, SpawnerSettings::from_config(&cfg));
    let server = spawner.start()?;
    let exit_code = spawner.base_mut().wait()?;
    output(
        ctx,
        json!({
            "pid": server.pid,
            "port": server.port,
            "phase": spawner.phase(),
            "exit_code": exit_code,
        }),
    )
}

fn handle_repo(ctx: &Context, command: RepoCommand) -> Result<(), JappsError> {
    match command {
        RepoCommand::Load {
            url,
            git_ref,
            config_directory,
        } => {
            let cfg = service_config(ctx)?;
            let repository = Repository {
                url,
                git_ref,
                config_directory,
            };
            // Reject bad input before requiring git on PATH.
            repository::validate_repository(&repository)?;
            let loader = RepositoryLoader::from_config(SystemGit::locate()?, &cfg);
            let config = loader.load(&repository)?;
            output(ctx, serde_json::to_value(config)?)
        }
    }
}

fn handle_whoami(ctx: &Context, token: &str) -> Result<(), JappsError> {
    let cfg = service_config(ctx)?;
    let gate = AuthGate::from_config(HubClient::new(&cfg)?, &cfg);
    let request = ApiRequest::new("GET", "/user")
        .with_header("Authorization", &format!("Bearer {token}"));
    let principal = gate.authenticate(&request)?;
    output(ctx, serde_json::to_value(principal)?)
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), JappsError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_code: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), JappsError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
