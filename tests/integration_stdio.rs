//! Binary-level smoke tests over real stdio.

use assert_cmd::Command;
use std::io::Write;
use std::process::Stdio;

#[test]
fn binary_help_mentions_querygate() {
    let bin_path = env!("CARGO_BIN_EXE_querygate");
    let mut cmd = Command::new(bin_path);
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("querygate"));
}

#[test]
fn binary_reports_version() {
    let bin_path = env!("CARGO_BIN_EXE_querygate");
    let mut cmd = Command::new(bin_path);
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn proxy_answers_initialize_and_tools_list_without_a_target() {
    let bin_path = env!("CARGO_BIN_EXE_querygate");

    let mut child = std::process::Command::new(bin_path)
        .arg("--storage")
        .arg("memory")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn proxy");

    {
        let stdin = child.stdin.as_mut().expect("failed to open stdin");
        let initialize = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "test-runner", "version": "1.0" }
            },
            "id": 1
        });
        let tools_list = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "tools/list",
            "params": {},
            "id": 2
        });
        writeln!(stdin, "{initialize}").unwrap();
        writeln!(stdin, "{tools_list}").unwrap();
    }
    // Dropping stdin closes the pipe; the proxy exits on EOF

    let output = child.wait_with_output().expect("proxy did not exit");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"querygate\""), "missing serverInfo: {stdout}");
    assert!(stdout.contains("session_start"), "missing proxy tools: {stdout}");
    assert!(stdout.contains("cast_table"), "missing proxy tools: {stdout}");
}
