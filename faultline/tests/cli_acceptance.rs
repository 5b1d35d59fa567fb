use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn queue_path(&self) -> PathBuf {
        self.xdg_data.join("faultline/queue.db")
    }

    /// Config pointing at a loopback port that refuses connections
    fn write_unreachable_config(&self) {
        let dir = self.xdg_config.join("faultline");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(
            dir.join("config.toml"),
            r#"
[telemetry]
api_key = "flt_test_key"
api_url = "http://127.0.0.1:9/events"
environment = "ci"

[delivery]
timeout_secs = 2
retry_delays_ms = []
"#,
        )
        .expect("failed to write config");
    }

    fn write_events(&self, lines: &[&str]) -> PathBuf {
        let path = self.home.join("events.jsonl");
        fs::write(&path, lines.join("\n")).expect("failed to write events");
        path
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("faultline"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .env_remove("HTTP_PROXY")
        .env_remove("http_proxy")
        .env_remove("ALL_PROXY")
        .env_remove("all_proxy")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute faultline: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "faultline {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn config_defaults_print_builtin_settings() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["config", "--defaults"]);
    assert_success(&["config", "--defaults"], &output);

    let json: serde_json::Value =
        serde_json::from_str(&stdout_of(&output)).expect("config output should be JSON");
    assert_eq!(json["environment"], "production");
    assert_eq!(json["max_batch_size"], 20);
    assert_eq!(json["max_queue_size"], 1000);
}

#[test]
fn config_without_telemetry_reports_missing_api_key() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["config"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("api_key"),
        "expected missing api_key in stderr, got:\n{stderr}"
    );
}

#[test]
fn status_without_config_explains_setup() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = stdout_of(&output);
    assert!(stdout.contains("Faultline Configuration"));
    assert!(stdout.contains("Status: Not configured"));
    assert!(stdout.contains("Queued Events:   0"));
}

#[test]
fn undeliverable_events_stay_queued_until_cleared() {
    let env = CliTestEnv::new();
    env.write_unreachable_config();
    let events = env.write_events(&[
        r#"{"message": "payment declined", "level": "error", "tags": {"region": "eu"}}"#,
        "",
        r#"{"message": "retrying checkout", "level": "warning", "extra": {"attempt": 2}}"#,
    ]);
    let events_arg = events.to_string_lossy().into_owned();

    let send = run_bin(&env, &["send", &events_arg]);
    assert_success(&["send", &events_arg], &send);
    let send_stdout = stdout_of(&send);
    assert!(send_stdout.contains("Queued 2 event(s)"));
    assert!(
        send_stdout.contains("2 event(s) remain queued"),
        "expected queued events after failed delivery, got:\n{send_stdout}"
    );
    assert!(env.queue_path().exists());

    let status = run_bin(&env, &["status"]);
    assert_success(&["status"], &status);
    let status_stdout = stdout_of(&status);
    assert!(status_stdout.contains("Environment:     ci"));
    assert!(status_stdout.contains("Queued Events:   2"));
    assert!(status_stdout.contains("flt_****"));

    let clear = run_bin(&env, &["clear"]);
    assert_success(&["clear"], &clear);
    assert!(stdout_of(&clear).contains("Cleared 2 queued event(s)"));

    let status = run_bin(&env, &["status"]);
    assert!(stdout_of(&status).contains("Queued Events:   0"));
}

#[test]
fn send_rejects_malformed_lines() {
    let env = CliTestEnv::new();
    env.write_unreachable_config();
    let events = env.write_events(&[r#"{"level": "error"}"#]);
    let events_arg = events.to_string_lossy().into_owned();

    let output = run_bin(&env, &["send", &events_arg]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid event on line 1"), "got:\n{stderr}");
    assert!(!Path::new(&env.queue_path()).exists());
}
