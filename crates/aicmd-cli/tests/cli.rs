use assert_cmd::Command;
use serde_json::Value;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::thread;
use tempfile::TempDir;

/// `ai` with its state and home pointed into `root` and no ambient key.
fn ai(root: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("ai"));
    cmd.env("AICMD_HOME", root.join("state"))
        .env("HOME", root.join("home"))
        .env("SHELL", "/bin/sh")
        .env("AICMD_NO_HISTORY", "1")
        .env_remove("OPENAI_API_KEY")
        .env_remove("AICMD_NO_CACHE");
    cmd
}

fn write_settings(root: &Path, endpoint: &str) {
    let state = root.join("state");
    fs::create_dir_all(&state).expect("state dir");
    fs::write(
        state.join("settings.json"),
        format!(r#"{{"llm":{{"endpoint":"{endpoint}","max_retries":0}}}}"#),
    )
    .expect("settings");
}

/// Serve `replies` (one completion text per connection), then stop.
fn serve_completions(replies: Vec<&'static str>) -> (String, thread::JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let addr = listener.local_addr().expect("addr");
    let handle = thread::spawn(move || {
        let mut served = 0;
        for reply in replies {
            let Ok((mut stream, _)) = listener.accept() else {
                break;
            };
            drain_request(&mut stream);
            let body = serde_json::json!({
                "choices": [{"index": 0, "message": {"role": "assistant", "content": reply}}]
            })
            .to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
            served += 1;
        }
        served
    });
    (format!("http://{addr}/v1/chat/completions"), handle)
}

fn drain_request(stream: &mut std::net::TcpStream) {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let Ok(read) = stream.read(&mut chunk) else {
            return;
        };
        if read == 0 {
            return;
        }
        buffer.extend_from_slice(&chunk[..read]);
        let Some(header_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&buffer[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buffer.len() >= header_end + 4 + content_length {
            return;
        }
    }
}

#[test]
fn list_context_prints_catalog() {
    let root = TempDir::new().expect("root");
    let output = ai(root.path())
        .arg("--list-context")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("0  files"), "{text}");
    assert!(text.contains("6  firewall"), "{text}");

    let output = ai(root.path())
        .args(["--list-context", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let listed: Value = serde_json::from_slice(&output).expect("json");
    assert_eq!(listed.as_array().map(Vec::len), Some(7));
    assert_eq!(listed[1]["name"], "processes");
}

#[test]
fn out_of_range_context_index_is_rejected() {
    let root = TempDir::new().expect("root");
    let assert = ai(root.path())
        .args(["--context", "9", "list", "files"])
        .assert()
        .code(2);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("out of range"), "{stderr}");
}

#[test]
fn missing_credential_exits_with_dedicated_status() {
    let root = TempDir::new().expect("root");
    ai(root.path()).args(["list", "files"]).assert().code(3);
}

#[test]
fn empty_request_is_an_error() {
    let root = TempDir::new().expect("root");
    ai(root.path()).assert().code(1);
}

#[test]
fn reset_history_and_clear_cache_remove_state_files() {
    let root = TempDir::new().expect("root");
    let state = root.path().join("state");
    fs::create_dir_all(&state).expect("state dir");
    fs::write(state.join("history.json"), "[]").expect("history");
    fs::write(state.join("cache.json"), r#"{"version":1,"entries":[]}"#).expect("cache");

    let output = ai(root.path())
        .args(["--reset-history", "--clear-cache", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&output).expect("json");
    assert_eq!(report["history_reset"], true);
    assert_eq!(report["cache_cleared"], true);
    assert!(!state.join("history.json").exists());
    assert!(!state.join("cache.json").exists());

    // A second run has nothing left to remove and still succeeds.
    let output = ai(root.path())
        .args(["--reset-history", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&output).expect("json");
    assert_eq!(report["history_reset"], false);
}

#[test]
fn dry_run_json_is_served_from_cache_on_repeat() {
    let root = TempDir::new().expect("root");
    let (endpoint, server) = serve_completions(vec!["```bash\nls -la\n```"]);
    write_settings(root.path(), &endpoint);

    for _ in 0..2 {
        let output = ai(root.path())
            .env("OPENAI_API_KEY", "sk-test")
            .args(["--json", "list", "all", "files"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let outcome: Value = serde_json::from_slice(&output).expect("json");
        assert_eq!(outcome["outcome"], "printed");
        assert_eq!(outcome["command"], "ls -la");
    }
    assert_eq!(server.join().expect("server thread"), 1);
    assert!(root.path().join("state").join("cache.json").exists());
}

#[test]
fn yes_runs_the_command_through_the_shell() {
    let root = TempDir::new().expect("root");
    let (endpoint, server) = serve_completions(vec!["echo aicmd-ran"]);
    write_settings(root.path(), &endpoint);

    let output = ai(root.path())
        .env("OPENAI_API_KEY", "sk-test")
        .args(["-y", "say", "hello"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("aicmd-ran"), "{text}");
    assert_eq!(server.join().expect("server thread"), 1);
}

#[test]
fn key_file_supplies_the_credential() {
    let root = TempDir::new().expect("root");
    let (endpoint, server) = serve_completions(vec!["uptime"]);
    write_settings(root.path(), &endpoint);
    let config = root.path().join("home").join(".config");
    fs::create_dir_all(&config).expect("config dir");
    fs::write(config.join("openai"), "sk-from-file\n").expect("key file");

    ai(root.path())
        .args(["--dry-run", "how", "long", "up"])
        .assert()
        .success();
    assert_eq!(server.join().expect("server thread"), 1);
}

#[test]
fn json_stdout_holds_only_the_outcome_even_with_explanation() {
    let root = TempDir::new().expect("root");
    let (endpoint, server) = serve_completions(vec!["df -h", "df shows disk usage."]);
    write_settings(root.path(), &endpoint);

    let output = ai(root.path())
        .env("OPENAI_API_KEY", "sk-test")
        .args(["--json", "-e", "disk", "usage"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    assert!(!text.contains("AI wants to execute"), "{text}");
    let outcome: Value = serde_json::from_slice(&output).expect("json");
    assert_eq!(outcome["command"], "df -h");
    assert_eq!(outcome["explanation"], "df shows disk usage.");
    assert_eq!(server.join().expect("server thread"), 2);
}

#[cfg(unix)]
mod interrupt {
    use super::*;
    use std::process::{Child, ChildStdout, Stdio};
    use std::time::{Duration, Instant};

    fn read_until_prompts(stdout: &mut ChildStdout, prompts: usize) -> String {
        let mut seen = Vec::new();
        let mut chunk = [0_u8; 256];
        while String::from_utf8_lossy(&seen).matches("> ").count() < prompts {
            let read = stdout.read(&mut chunk).expect("read stdout");
            assert!(read > 0, "stdout closed early");
            seen.extend_from_slice(&chunk[..read]);
        }
        String::from_utf8_lossy(&seen).to_string()
    }

    fn wait_with_deadline(child: &mut Child, limit: Duration) -> Option<i32> {
        let started = Instant::now();
        while started.elapsed() < limit {
            if let Some(status) = child.try_wait().expect("try_wait") {
                return status.code();
            }
            thread::sleep(Duration::from_millis(50));
        }
        let _ = child.kill();
        None
    }

    #[test]
    fn single_sigint_while_waiting_for_input_exits_130_with_history_saved() {
        let root = TempDir::new().expect("root");
        let (endpoint, server) = serve_completions(vec!["hi, how can I help?"]);
        write_settings(root.path(), &endpoint);

        let mut cmd = std::process::Command::new(assert_cmd::cargo::cargo_bin!("ai"));
        cmd.env("AICMD_HOME", root.path().join("state"))
            .env("HOME", root.path().join("home"))
            .env("SHELL", "/bin/sh")
            .env("OPENAI_API_KEY", "sk-test")
            .arg("--chat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().expect("spawn ai --chat");
        let mut stdin = child.stdin.take().expect("stdin");
        let mut stdout = child.stdout.take().expect("stdout");

        read_until_prompts(&mut stdout, 1);
        stdin.write_all(b"hello there\n").expect("write line");
        stdin.flush().expect("flush");
        let transcript = read_until_prompts(&mut stdout, 2);
        assert!(transcript.contains("hi, how can I help?"), "{transcript}");
        assert_eq!(server.join().expect("server thread"), 1);

        // stdin stays open: the process is parked in the read.
        thread::sleep(Duration::from_millis(200));
        let killed = std::process::Command::new("kill")
            .args(["-INT", &child.id().to_string()])
            .status()
            .expect("kill");
        assert!(killed.success());

        assert_eq!(wait_with_deadline(&mut child, Duration::from_secs(5)), Some(130));
        drop(stdin);
        let saved = fs::read_to_string(root.path().join("state").join("history.json"))
            .expect("history");
        assert!(saved.contains("hello there"), "{saved}");
        assert!(saved.contains("hi, how can I help?"), "{saved}");
    }
}
