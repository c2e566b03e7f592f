#![cfg(all(unix, feature = "cli"))]

use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after epoch")
        .as_nanos();
    let dir = PathBuf::from(format!(
        "/tmp/streamrpc-{tag}-{}-{nanos}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("temp dir should be created");
    dir
}

fn wait_for_connect(socket: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if UnixStream::connect(socket).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("server did not start listening on {}", socket.display());
}

struct Server {
    child: Child,
    dir: PathBuf,
    socket: PathBuf,
}

impl Server {
    fn start(tag: &str, extra: &[&str]) -> Self {
        let dir = unique_temp_dir(tag);
        let socket = dir.join("rpc.sock");
        let child = Command::new(env!("CARGO_BIN_EXE_streamrpc"))
            .args(["--log-level", "error", "serve"])
            .arg(&socket)
            .args(extra)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("serve should spawn");
        wait_for_connect(&socket);
        Self { child, dir, socket }
    }

    fn call(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_streamrpc"))
            .args(["--log-level", "error", "--format", "json", "call"])
            .arg(&self.socket)
            .args(args)
            .output()
            .expect("call should run")
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn unary_echo_prints_the_input() {
    let server = Server::start("echo", &[]);
    let output = server.call(&["echo", "--json", r#"{"v":1}"#]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    assert_eq!(stdout_lines(&output), vec![r#"{"v":1}"#]);
}

#[test]
fn server_stream_prints_one_line_per_output() {
    let server = Server::start("count", &[]);
    let output = server.call(&["countTo", "--shape", "server", "--json", "3"]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    assert_eq!(stdout_lines(&output), vec!["1", "2", "3"]);
}

#[test]
fn client_stream_and_duplex_calls_complete() {
    let server = Server::start("streams", &[]);

    let output = server.call(&[
        "sum", "--shape", "client", "--json", "4", "--json", "5", "--json", "6",
    ]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    assert_eq!(stdout_lines(&output), vec!["15"]);

    let output = server.call(&["chat", "--shape", "duplex", "--json", "1", "--json", r#""a""#]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    assert_eq!(
        stdout_lines(&output),
        vec![r#"{"echo":1}"#, r#"{"echo":"a"}"#]
    );
}

#[test]
fn raw_call_round_trips_the_payload() {
    let server = Server::start("raw", &[]);
    let output = server.call(&["cat", "--shape", "raw", "--data", "hello}{"]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let line = stdout_lines(&output).join("");
    let printed: serde_json::Value =
        serde_json::from_str(&line).expect("raw call output should be JSON");
    assert_eq!(printed["payload"], "hello}{");
    assert_eq!(printed["payload_size"], 7);
    assert_eq!(printed["result"]["method"], "cat");
}

#[test]
fn unknown_method_exits_with_failure() {
    let server = Server::start("missing", &[]);
    let output = server.call(&["nope"]);
    assert_eq!(output.status.code(), Some(1), "{output:?}");
    assert!(String::from_utf8_lossy(&output.stderr).contains("nope"));
}

#[test]
fn handler_parse_failure_exits_with_data_invalid() {
    let server = Server::start("parse", &[]);
    let output = server.call(&["countTo", "--shape", "server", "--json", r#""three""#]);
    assert_eq!(output.status.code(), Some(60), "{output:?}");
}

#[test]
fn invalid_json_input_is_a_usage_error() {
    let server = Server::start("usage", &[]);
    let output = server.call(&["echo", "--json", "{nope"]);
    assert_eq!(output.status.code(), Some(64), "{output:?}");

    let output = server.call(&["echo", "--data", "x"]);
    assert_eq!(output.status.code(), Some(64), "{output:?}");
}

#[test]
fn missing_socket_is_a_transport_error() {
    let dir = unique_temp_dir("nosock");
    let output = Command::new(env!("CARGO_BIN_EXE_streamrpc"))
        .args(["--log-level", "error", "call"])
        .arg(dir.join("absent.sock"))
        .arg("echo")
        .output()
        .expect("call should run");
    let _ = fs::remove_dir_all(&dir);
    assert_eq!(output.status.code(), Some(3), "{output:?}");
}

#[test]
fn validate_rejects_params_that_break_the_schema() {
    let schemas = unique_temp_dir("schemas");
    fs::write(
        schemas.join("echo.schema.json"),
        r#"{"type":"object","properties":{"v":{"type":"integer"}},"required":["v"]}"#,
    )
    .expect("schema should be written");

    let schema_dir = schemas.to_string_lossy().to_string();
    let server = Server::start("validate", &["--validate", &schema_dir]);

    let output = server.call(&["echo", "--json", r#"{"v":2}"#]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let output = server.call(&["echo", "--json", r#"{"v":"two"}"#]);
    assert_eq!(output.status.code(), Some(60), "{output:?}");

    let output = server.call(&["echo", "--json", r#"{"v":2,"extra":true}"#]);
    assert_eq!(output.status.code(), Some(60), "{output:?}");

    let _ = fs::remove_dir_all(&schemas);
}

#[test]
fn version_prints_the_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_streamrpc"))
        .arg("version")
        .output()
        .expect("version should run");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        format!("streamrpc {}", env!("CARGO_PKG_VERSION"))
    );
}
