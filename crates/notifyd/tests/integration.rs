use anyhow::{Context, Result};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct TestServer {
    child: Child,
    port: u16,
    _dir: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

const RULES: &str = r#"[
    {"notificationType": "news", "maxLimit": 2, "timeInterval": "60s"},
    {"notificationType": "x", "maxLimit": 1, "timeInterval": "1s"}
]"#;

#[tokio::test]
async fn news_is_throttled_on_third_send() -> Result<()> {
    let server = start_server(RULES).await?;

    let (status, _) = request(server.port, "POST", "/notifications/news/users/u1").await?;
    assert_eq!(status, 200);
    let (status, _) = request(server.port, "POST", "/notifications/News/users/u1").await?;
    assert_eq!(status, 200);
    let (status, body) = request(server.port, "POST", "/notifications/news/users/u1").await?;
    assert_eq!(status, 429);
    assert!(body.contains("rate_limit_exceeded"));

    let (status, _) = request(server.port, "POST", "/notifications/news/users/u2").await?;
    assert_eq!(status, 200);
    Ok(())
}

#[tokio::test]
async fn short_window_reopens() -> Result<()> {
    let server = start_server(RULES).await?;

    let (status, _) = request(server.port, "POST", "/notifications/x/users/u1").await?;
    assert_eq!(status, 200);
    let (status, _) = request(server.port, "POST", "/notifications/x/users/u1").await?;
    assert_eq!(status, 429);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let (status, _) = request(server.port, "POST", "/notifications/x/users/u1").await?;
    assert_eq!(status, 200);
    Ok(())
}

#[tokio::test]
async fn concurrent_sends_admit_once() -> Result<()> {
    let server = start_server(RULES).await?;
    let port = server.port;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        tasks.push(tokio::spawn(async move {
            request(port, "POST", "/notifications/x/users/racer").await
        }));
    }
    let mut ok = 0;
    let mut throttled = 0;
    for task in tasks {
        match task.await??.0 {
            200 => ok += 1,
            429 => throttled += 1,
            other => anyhow::bail!("unexpected status {other}"),
        }
    }
    assert_eq!((ok, throttled), (1, 7));
    Ok(())
}

#[tokio::test]
async fn rules_are_listed() -> Result<()> {
    let server = start_server(RULES).await?;

    let (status, body) = request(server.port, "GET", "/rules").await?;
    assert_eq!(status, 200);
    assert!(body.contains("\"notificationType\":\"news\""));
    let (status, _) = request(server.port, "GET", "/rules/promo").await?;
    assert_eq!(status, 404);
    Ok(())
}

#[test]
fn malformed_rules_fail_startup() -> Result<()> {
    let dir = tempdir()?;
    let rules = dir.path().join("rules.json");
    std::fs::write(&rules, r#"[{"notificationType": "news", "maxLimit": 0, "timeInterval": "1m"}]"#)?;
    let status = Command::new(env!("CARGO_BIN_EXE_notifyd"))
        .arg("--rules")
        .arg(&rules)
        .arg("--bind")
        .arg("127.0.0.1:0")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("run notifyd")?;
    assert!(!status.success());
    Ok(())
}

#[test]
fn unknown_backend_is_rejected() -> Result<()> {
    let status = Command::new(env!("CARGO_BIN_EXE_notifyd"))
        .arg("--backend")
        .arg("mongodb")
        .arg("rules")
        .arg("check")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("run notifyd")?;
    assert!(!status.success());
    Ok(())
}

#[test]
fn rules_check_reports_count() -> Result<()> {
    let dir = tempdir()?;
    let rules = dir.path().join("rules.json");
    std::fs::write(&rules, RULES)?;
    let output = Command::new(env!("CARGO_BIN_EXE_notifyd"))
        .arg("--rules")
        .arg(&rules)
        .arg("rules")
        .arg("check")
        .output()
        .context("run notifyd")?;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("2 rules ok"));
    Ok(())
}

async fn start_server(rules: &str) -> Result<TestServer> {
    let dir = tempdir()?;
    let port = pick_port()?;
    let rules_path = dir.path().join("rules.json");
    std::fs::write(&rules_path, rules)?;

    let child = Command::new(env!("CARGO_BIN_EXE_notifyd"))
        .arg("--bind")
        .arg(format!("127.0.0.1:{port}"))
        .arg("--rules")
        .arg(&rules_path)
        .arg("--backend")
        .arg("memory")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("spawn notifyd")?;

    let server = TestServer {
        child,
        port,
        _dir: dir,
    };
    wait_for_port(port).await?;
    Ok(server)
}

async fn request(port: u16, method: &str, path: &str) -> Result<(u16, String)> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let head = format!(
        "{method} {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(head.as_bytes()).await?;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    let text = String::from_utf8_lossy(&raw).to_string();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .context("parse status line")?;
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

fn pick_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

async fn wait_for_port(port: u16) -> Result<()> {
    let addr = format!("127.0.0.1:{port}");
    for _ in 0..50 {
        if TcpStream::connect(&addr).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("server did not start");
}
