use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("japps");
    let mut cmd = Command::new(path);
    for key in [
        "JAPPS_CONFIG",
        "JAPPS_CONFIG_DIR",
        "JAPPS_PYTHON_EXEC",
        "JAPPS_BIND_URL",
        "JUPYTERHUB_API_URL",
        "JUPYTERHUB_API_TOKEN",
        "JUPYTERHUB_CLIENT_ID",
        "JUPYTERHUB_SERVICE_PREFIX",
        "JUPYTERHUB_OAUTH_SCOPES",
        "JWT_SECRET_KEY",
        "PUBLIC_HOST",
        "ENABLE_CORS",
        "CORS_ALLOWED_ORIGINS",
        "RUST_LOG",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

fn write_options(dir: &Path, options: Value) -> PathBuf {
    let path = dir.join("options.json");
    fs::write(&path, options.to_string()).unwrap();
    path
}

fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.yaml");
    fs::write(
        &path,
        "version: 1\nspawner:\n  python_executable: /opt/conda/bin/python\n  bind_url: http://hub.example.com:8000\n",
    )
    .unwrap();
    path
}

fn run_command(config: &Path, options: &Path, port: &str) -> Value {
    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(config)
        .arg("command")
        .arg("--options")
        .arg(options)
        .arg("--port")
        .arg(port)
        .arg("--user")
        .arg("alice")
        .arg("--app-name")
        .arg("dash1")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    parse_json(&output)
}

fn argv(value: &Value) -> Vec<String> {
    value["result"]["argv"]
        .as_array()
        .expect("argv")
        .iter()
        .filter_map(|arg| arg.as_str().map(ToString::to_string))
        .collect()
}

#[test]
fn config_init_creates_and_preserves_existing() {
    let dir = tempdir().unwrap();
    let config_dir = dir.path().join("config");

    let output = bin()
        .env("JAPPS_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("config")
        .arg("init")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert!(value["ok"].as_bool().unwrap());
    assert!(value["result"]["created"].as_bool().unwrap());

    let config_path = config_dir.join("config.yaml");
    let content = fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("jhub-app-proxy"));

    fs::write(&config_path, "sentinel: true\n").unwrap();
    let output = bin()
        .env("JAPPS_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("config")
        .arg("init")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert!(!value["result"]["created"].as_bool().unwrap());
    assert_eq!(fs::read_to_string(&config_path).unwrap(), "sentinel: true\n");
}

#[test]
fn config_validate_rejects_unknown_fields() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, "version: 1\nunknown_field: true\n").unwrap();

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("validate")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert!(!value["ok"].as_bool().unwrap());
    let error = value["error"].as_str().unwrap_or_default();
    assert!(error.contains("unknown_field") || error.contains("unknown field"));
}

#[test]
fn config_validate_rejects_non_http_hub_url() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, "version: 1\nhub:\n  api_url: ftp://hub/api\n").unwrap();

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("validate")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    let error = value["error"].as_str().unwrap_or_default();
    assert!(error.contains("hub.api_url"));
}

#[test]
fn config_show_applies_environment_and_redacts_secrets() {
    let dir = tempdir().unwrap();
    let config_path = write_config(dir.path());

    let output = bin()
        .env("PUBLIC_HOST", "https://hub.example.org")
        .env("JWT_SECRET_KEY", "very-secret")
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("show")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert_eq!(
        value["result"]["service"]["public_host"],
        "https://hub.example.org"
    );
    assert_eq!(value["result"]["auth"]["session_secret"], "<redacted>");
    assert!(!String::from_utf8_lossy(&output).contains("very-secret"));
}

#[test]
fn frameworks_lists_every_framework() {
    let output = bin()
        .arg("--json")
        .arg("frameworks")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    let names: Vec<&str> = value["result"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|row| row["framework"].as_str())
        .collect();
    for expected in ["streamlit", "panel", "voila", "gradio", "custom"] {
        assert!(names.contains(&expected), "{expected}");
    }
}

#[test]
fn command_keeps_port_placeholder_in_custom_command() {
    let dir = tempdir().unwrap();
    let config_path = write_config(dir.path());
    let options = write_options(
        dir.path(),
        serde_json::json!({
            "framework": "custom",
            "custom_command": "python -m http.server {port} | tee log.txt",
            "conda_env": "myenv",
            "skip_conda": false,
        }),
    );

    let value = run_command(&config_path, &options, "9000");
    let argv = argv(&value);
    assert_eq!(argv[0], "jhub-app-proxy");
    assert_eq!(argv[1], "--conda-env=myenv");
    assert_eq!(
        &argv[2..],
        ["/bin/sh", "-c", "python -m http.server {port} | tee log.txt"]
    );
    assert_eq!(value["result"]["env"]["JHUB_APPS_SPAWNER_PORT"], "9000");
}

#[test]
fn command_resolves_port_for_builtin_framework() {
    let dir = tempdir().unwrap();
    let config_path = write_config(dir.path());
    let options = write_options(
        dir.path(),
        serde_json::json!({
            "framework": "streamlit",
            "filepath": "app.py",
            "conda_env": "analytics",
            "skip_conda": true,
            "env": {"API_URL": "https://api.example.com"},
        }),
    );

    let value = run_command(&config_path, &options, "8888");
    let argv = argv(&value);
    assert_eq!(argv[0], "/opt/conda/bin/python");
    assert!(argv.contains(&"--server.port=8888".to_string()));
    assert!(argv.contains(&"--server.baseUrlPath=/user/alice/dash1/".to_string()));
    assert!(argv.contains(&"--browser.serverAddress=hub.example.com:8000".to_string()));
    assert!(!argv.iter().any(|arg| arg.starts_with("--conda-env")));
    assert_eq!(value["result"]["env"]["API_URL"], "https://api.example.com");
    assert_eq!(value["result"]["env"]["JHUB_APPS_FRAMEWORK"], "streamlit");
}

#[test]
fn command_reports_missing_filepath() {
    let dir = tempdir().unwrap();
    let config_path = write_config(dir.path());
    let options = write_options(dir.path(), serde_json::json!({"framework": "panel"}));

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("command")
        .arg("--options")
        .arg(&options)
        .arg("--port")
        .arg("8000")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert_eq!(value["error_code"], "app_config_invalid");
    assert!(value["error"].as_str().unwrap_or_default().contains("filepath"));
}

#[test]
fn repo_load_rejects_unsafe_ref_before_cloning() {
    let dir = tempdir().unwrap();
    let config_path = write_config(dir.path());

    let output = bin()
        .env("PATH", "")
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("repo")
        .arg("load")
        .arg("--url")
        .arg("https://github.com/org/app.git")
        .arg("--ref")
        .arg("main;touch /tmp/pwned")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert_eq!(value["error_code"], "unsafe_input");
}

#[cfg(unix)]
#[test]
fn spawn_runs_custom_command_in_foreground() {
    let dir = tempdir().unwrap();
    let config_path = write_config(dir.path());
    let marker = dir.path().join("started.txt");
    let options = write_options(
        dir.path(),
        serde_json::json!({
            "jhub_app": true,
            "framework": "custom",
            "custom_command": format!("echo \"$JHUB_APPS_FRAMEWORK\" > {}", marker.display()),
            "skip_conda": true,
        }),
    );

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("spawn")
        .arg("--options")
        .arg(&options)
        .arg("--port")
        .arg("9100")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert_eq!(value["result"]["exit_code"], 0);
    assert_eq!(value["result"]["phase"], "running");
    assert_eq!(fs::read_to_string(&marker).unwrap().trim(), "custom");
}

#[test]
fn unknown_subcommand_is_rejected() {
    bin()
        .arg("launch")
        .assert()
        .failure()
        .stderr(contains("unrecognized subcommand"));
}
