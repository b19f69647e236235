//! Config layering for promhoused: defaults < TOML file < `PROMHOUSE_*` env < CLI flags.

use std::process::Command;

/// Run promhoused in a subprocess with the given args and env. Returns (success, stdout, stderr).
fn run_promhoused(args: &[&str], env_extra: &[(&str, &str)]) -> (bool, String, String) {
    let exe = env!("CARGO_BIN_EXE_promhoused");
    let mut cmd = Command::new(exe);
    cmd.args(args);
    for (k, v) in env_extra {
        cmd.env(k, v);
    }
    let out = cmd.output().expect("run promhoused");
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    (out.status.success(), stdout, stderr)
}

fn write_config(contents: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("promhoused.toml");
    std::fs::write(&path, contents).expect("write config");
    let path = path.to_str().expect("utf-8 path").to_string();
    (dir, path)
}

#[test]
fn validate_config_no_config_prints_defaults() {
    let (ok, stdout, stderr) = run_promhoused(&["--validate-config", "--no-config"], &[]);
    assert!(ok, "stderr: {}", stderr);
    for expected in [
        "http_bind=0.0.0.0:9201",
        "write_path=/write",
        "read_path=/read",
        "store=clickhouse",
        "queue_capacity=8192",
        "batch_size=8192",
        "max_batch_wait_ms=0",
        "max_samples=8192",
        "min_period_secs=10",
        "quantile=0.75",
        "database=metrics",
        "table=samples",
        "clickhouse_url=http://127.0.0.1:8123",
    ] {
        assert!(stdout.contains(expected), "missing {:?} in:\n{}", expected, stdout);
    }
}

#[test]
fn valid_config_file_merges_with_defaults() {
    let (_dir, path) = write_config(
        r#"
batch_size = 500
max_batch_wait_ms = 250
table = "raw_samples"
write_path = "/api/v1/write"

[clickhouse]
url = "http://clickhouse:8123"
create_table = true
"#,
    );
    let (ok, stdout, stderr) = run_promhoused(&["--validate-config", "--config", &path], &[]);
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("batch_size=500"));
    assert!(stdout.contains("max_batch_wait_ms=250"));
    assert!(stdout.contains("table=raw_samples"));
    assert!(stdout.contains("write_path=/api/v1/write"));
    assert!(stdout.contains("read_path=/read"));
    assert!(stdout.contains("clickhouse_url=http://clickhouse:8123"));
    assert!(stdout.contains("create_table=true"));
    assert!(stdout.contains("queue_capacity=8192"));
}

#[test]
fn env_overrides_file() {
    let (_dir, path) = write_config("batch_size = 500\n");
    let (ok, stdout, stderr) = run_promhoused(
        &["--validate-config", "--config", &path],
        &[
            ("PROMHOUSE_BATCH_SIZE", "64"),
            ("PROMHOUSE_CLICKHOUSE__URL", "http://from-env:8123"),
        ],
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("batch_size=64"), "stdout: {}", stdout);
    assert!(stdout.contains("clickhouse_url=http://from-env:8123"), "stdout: {}", stdout);
}

#[test]
fn cli_overrides_env() {
    let (ok, stdout, stderr) = run_promhoused(
        &[
            "--validate-config",
            "--no-config",
            "--http-bind",
            "127.0.0.1:9999",
            "--store",
            "memory",
        ],
        &[("PROMHOUSE_HTTP_BIND", "127.0.0.1:1111"), ("PROMHOUSE_STORE", "clickhouse")],
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("http_bind=127.0.0.1:9999"));
    assert!(stdout.contains("store=memory"));
}

#[test]
fn zero_batch_size_fails() {
    let (ok, _stdout, stderr) = run_promhoused(
        &["--validate-config", "--no-config"],
        &[("PROMHOUSE_BATCH_SIZE", "0")],
    );
    assert!(!ok, "batch_size=0 should fail");
    assert!(
        stderr.contains("config error") && stderr.contains("batch_size"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn quantile_out_of_range_fails() {
    let (_dir, path) = write_config("quantile = 1.5\n");
    let (ok, _stdout, stderr) = run_promhoused(&["--validate-config", "--config", &path], &[]);
    assert!(!ok, "quantile=1.5 should fail");
    assert!(stderr.contains("quantile"), "stderr: {}", stderr);
}

#[test]
fn non_identifier_table_fails() {
    let (_dir, path) = write_config("table = \"samples; DROP TABLE x\"\n");
    let (ok, _stdout, stderr) = run_promhoused(&["--validate-config", "--config", &path], &[]);
    assert!(!ok, "hostile table name should fail");
    assert!(stderr.contains("config error"), "stderr: {}", stderr);
}

#[test]
fn unknown_store_fails() {
    let (ok, _stdout, stderr) =
        run_promhoused(&["--validate-config", "--no-config", "--store", "postgres"], &[]);
    assert!(!ok);
    assert!(stderr.contains("invalid store"), "stderr: {}", stderr);
}

#[test]
fn route_paths_must_be_absolute_and_distinct() {
    let (_dir, path) = write_config("write_path = \"write\"\n");
    let (ok, _stdout, stderr) = run_promhoused(&["--validate-config", "--config", &path], &[]);
    assert!(!ok);
    assert!(stderr.contains("write_path"), "stderr: {}", stderr);

    let (_dir, path) = write_config("write_path = \"/rw\"\nread_path = \"/rw\"\n");
    let (ok, _stdout, stderr) = run_promhoused(&["--validate-config", "--config", &path], &[]);
    assert!(!ok);
    assert!(stderr.contains("both"), "stderr: {}", stderr);
}

#[test]
fn explicit_config_missing_file_fails() {
    let (ok, _stdout, stderr) = run_promhoused(
        &["--validate-config", "--config", "/nonexistent/promhoused.toml"],
        &[],
    );
    assert!(!ok, "missing config file with explicit --config should fail");
    assert!(
        stderr.contains("not found") || stderr.contains("config error"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn invalid_http_bind_fails() {
    let (ok, _stdout, stderr) = run_promhoused(
        &["--validate-config", "--no-config", "--http-bind", "not-a-valid-address"],
        &[],
    );
    assert!(!ok, "invalid http_bind should fail");
    assert!(stderr.contains("invalid http_bind"), "stderr: {}", stderr);
}
