//! Drives the built binary over stdio the way git-lfs does.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use serde_json::{Value, json};

fn run_agent(work: &Path, input: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_lfs-bridge"))
        .current_dir(work)
        .args(["--backend", "local", "--store-dir"])
        .arg(work.join("store"))
        .arg("--download-dir")
        .arg(work.join("downloads"))
        .env_remove("LFS_BRIDGE_LOG_FILE")
        .env_remove("LFS_BRIDGE_STATUS_FILE")
        .env("LFS_BRIDGE_LOG_LEVEL", "debug")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn lfs-bridge");

    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(input.as_bytes()).unwrap();
    drop(stdin);
    child.wait_with_output().unwrap()
}

fn messages(output: &Output) -> Vec<Value> {
    String::from_utf8(output.stdout.clone())
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn lines(values: &[Value]) -> String {
    values.iter().map(|value| format!("{value}\n")).collect()
}

const OID: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

#[test]
fn upload_then_download_through_the_binary() {
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("hello.txt");
    std::fs::write(&source, b"hello").unwrap();

    let output = run_agent(
        work.path(),
        &lines(&[
            json!({"event": "init", "operation": "upload", "remote": "origin",
                   "concurrent": true, "concurrenttransfers": 3}),
            json!({"event": "upload", "oid": OID, "size": 5,
                   "path": source.display().to_string(), "action": null}),
            json!({"event": "terminate"}),
        ]),
    );
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let uploaded = messages(&output);
    assert_eq!(uploaded[0], json!({}));
    assert_eq!(
        uploaded.last().unwrap(),
        &json!({"event": "complete", "oid": OID})
    );
    let stored = work.path().join("store/2c/f2").join(OID);
    assert_eq!(std::fs::read(stored).unwrap(), b"hello");
    // Diagnostics never leak onto the protocol channel.
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("session initialized")
    );

    let output = run_agent(
        work.path(),
        &lines(&[
            json!({"event": "init", "operation": "download", "remote": "origin",
                   "concurrent": false, "concurrenttransfers": 1}),
            json!({"event": "download", "oid": OID, "size": 5, "action": null}),
            json!({"event": "terminate"}),
        ]),
    );
    assert!(output.status.success());
    let downloaded = messages(&output);
    let complete = downloaded.last().unwrap();
    assert_eq!(complete["event"], "complete");
    let path = complete["path"].as_str().unwrap();
    assert!(Path::new(path).starts_with(work.path().join("downloads")));
    assert_eq!(std::fs::read(path).unwrap(), b"hello");
}

#[test]
fn garbage_before_init_is_answered_and_exits_with_failure() {
    let work = tempfile::tempdir().unwrap();
    let output = run_agent(work.path(), "definitely not json\n");
    assert!(!output.status.success());
    let replies = messages(&output);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["error"]["code"], 400);
    assert!(String::from_utf8_lossy(&output.stderr).contains("malformed message on line 1"));
}
