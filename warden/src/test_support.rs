//! Test-only helpers: scripted collaborators and a throwaway git setup.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::launch::LaunchSpec;
use crate::core::types::{HealthSignal, TestOutcome};
use crate::io::config::WardenConfig;
use crate::io::health::HealthPinger;
use crate::io::notify::Notifier;
use crate::io::supervisor::Supervisor;
use crate::io::test_gate::{TestRequest, TestRunner};

/// A call observed by [`ScriptedSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCall {
    Status(String),
    Restart(String),
    Launch(String, LaunchSpec),
}

/// Supervisor that answers status queries from a queue and records every call.
#[derive(Debug, Default)]
pub struct ScriptedSupervisor {
    statuses: RefCell<VecDeque<String>>,
    calls: RefCell<Vec<SupervisorCall>>,
    pub fail_status: bool,
    pub fail_restart: bool,
    pub fail_launch: bool,
}

impl ScriptedSupervisor {
    pub fn new(statuses: &[&str]) -> Self {
        Self {
            statuses: RefCell::new(statuses.iter().map(|s| s.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<SupervisorCall> {
        self.calls.borrow().clone()
    }

    pub fn restarts(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| matches!(call, SupervisorCall::Restart(_)))
            .count()
    }

    pub fn launches(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| matches!(call, SupervisorCall::Launch(..)))
            .count()
    }

    /// Ensure every scripted status was consumed.
    pub fn assert_drained(&self) -> Result<()> {
        let left = self.statuses.borrow().len();
        if left > 0 {
            bail!("{left} scripted statuses were not consumed");
        }
        Ok(())
    }
}

impl Supervisor for ScriptedSupervisor {
    fn status(&self, name: &str) -> Result<String> {
        self.calls
            .borrow_mut()
            .push(SupervisorCall::Status(name.to_string()));
        if self.fail_status {
            bail!("scripted status failure");
        }
        self.statuses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted status left"))
    }

    fn restart(&self, name: &str) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(SupervisorCall::Restart(name.to_string()));
        if self.fail_restart {
            bail!("scripted restart failure");
        }
        Ok(())
    }

    fn launch(&self, name: &str, spec: &LaunchSpec) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(SupervisorCall::Launch(name.to_string(), spec.clone()));
        if self.fail_launch {
            bail!("scripted launch failure");
        }
        Ok(())
    }
}

/// Pinger that records signals instead of making HTTP calls.
#[derive(Debug, Default)]
pub struct RecordingPinger {
    signals: RefCell<Vec<HealthSignal>>,
    pub fail: bool,
}

impl RecordingPinger {
    pub fn signals(&self) -> Vec<HealthSignal> {
        self.signals.borrow().clone()
    }
}

impl HealthPinger for RecordingPinger {
    fn ping(&self, signal: HealthSignal) -> Result<bool> {
        self.signals.borrow_mut().push(signal);
        if self.fail {
            bail!("scripted ping failure");
        }
        Ok(true)
    }
}

/// Notifier that keeps messages in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: RefCell<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, message: &str) -> Result<()> {
        self.messages.borrow_mut().push(message.to_string());
        Ok(())
    }
}

/// Test runner returning a fixed outcome.
#[derive(Debug)]
pub struct ScriptedTestRunner {
    pub outcome: TestOutcome,
    runs: Cell<u32>,
}

impl ScriptedTestRunner {
    pub fn new(outcome: TestOutcome) -> Self {
        Self {
            outcome,
            runs: Cell::new(0),
        }
    }

    pub fn runs(&self) -> u32 {
        self.runs.get()
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, _request: &TestRequest) -> Result<TestOutcome> {
        self.runs.set(self.runs.get() + 1);
        Ok(self.outcome)
    }
}

/// One HTTP request as seen by [`OneShotHttp`].
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CapturedRequest {
    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Loopback HTTP server that answers a single request with a fixed status.
pub struct OneShotHttp {
    addr: String,
    handle: JoinHandle<Result<CapturedRequest>>,
}

impl OneShotHttp {
    pub fn respond_with(status: u16, body: &str) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").context("bind loopback listener")?;
        let addr = listener.local_addr().context("listener address")?.to_string();
        let body = body.to_string();
        let handle = thread::spawn(move || -> Result<CapturedRequest> {
            let (mut stream, _) = listener.accept().context("accept request")?;
            let mut reader = BufReader::new(stream.try_clone().context("clone stream")?);

            let mut request_line = String::new();
            reader.read_line(&mut request_line).context("read request line")?;
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let path = parts.next().unwrap_or_default().to_string();

            let mut headers = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).context("read header")?;
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((key, value)) = line.split_once(':') {
                    headers.push((key.trim().to_string(), value.trim().to_string()));
                }
            }
            let length = headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.parse::<usize>().ok())
                .unwrap_or(0);
            let mut raw_body = vec![0u8; length];
            reader.read_exact(&mut raw_body).context("read body")?;

            let reason = if status < 400 { "OK" } else { "Error" };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream
                .write_all(response.as_bytes())
                .context("write response")?;
            Ok(CapturedRequest {
                method,
                path,
                headers,
                body: String::from_utf8_lossy(&raw_body).into_owned(),
            })
        });
        Ok(Self { addr, handle })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Wait for the request to be served and return it.
    pub fn request(self) -> Result<CapturedRequest> {
        self.handle
            .join()
            .map_err(|_| anyhow!("http responder thread panicked"))?
    }
}

/// A bare "origin", an upstream clone that publishes commits, and the watched checkout.
pub struct TestRepo {
    _temp: TempDir,
    remote: PathBuf,
    upstream: PathBuf,
    checkout: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let remote = temp.path().join("origin.git");
        let upstream = temp.path().join("upstream");
        let checkout = temp.path().join("checkout");

        git(temp.path(), &["init", "--bare", "--quiet", path_str(&remote)?])?;
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"])?;

        fs::create_dir_all(&upstream).context("create upstream")?;
        git(&upstream, &["init", "--quiet"])?;
        git(&upstream, &["checkout", "--quiet", "-b", "main"])?;
        configure_identity(&upstream)?;
        fs::write(upstream.join("README.md"), "validator\n").context("write readme")?;
        git(&upstream, &["add", "-A"])?;
        git(&upstream, &["commit", "--quiet", "-m", "initial"])?;
        git(
            &upstream,
            &["remote", "add", "origin", path_str(&remote)?],
        )?;
        git(&upstream, &["push", "--quiet", "origin", "main"])?;

        git(
            temp.path(),
            &[
                "clone",
                "--quiet",
                "-b",
                "main",
                path_str(&remote)?,
                path_str(&checkout)?,
            ],
        )?;
        configure_identity(&checkout)?;

        Ok(Self {
            _temp: temp,
            remote,
            upstream,
            checkout,
        })
    }

    /// The watched checkout.
    pub fn path(&self) -> &Path {
        &self.checkout
    }

    pub fn remote(&self) -> &Path {
        &self.remote
    }

    /// Commit `contents` to `file` upstream and push it to origin. Returns the new revision.
    pub fn publish(&self, file: &str, contents: &str) -> Result<String> {
        let path = self.upstream.join(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create upstream dir")?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        git(&self.upstream, &["add", "-A"])?;
        git(&self.upstream, &["commit", "--quiet", "-m", file])?;
        git(&self.upstream, &["push", "--quiet", "origin", "main"])?;
        let sha = git(&self.upstream, &["rev-parse", "HEAD"])?;
        Ok(sha.trim().to_string())
    }

    /// Config pointed at the checkout with instant, side-effect free defaults.
    pub fn config(&self) -> WardenConfig {
        let mut cfg = WardenConfig {
            repo_dir: self.checkout.clone(),
            interval_secs: 1,
            command_timeout_secs: 30,
            ..WardenConfig::default()
        };
        cfg.install.command = vec!["true".to_string()];
        cfg
    }
}

fn configure_identity(dir: &Path) -> Result<()> {
    git(dir, &["config", "user.email", "warden@example.com"])?;
    git(dir, &["config", "user.name", "warden tests"])?;
    git(dir, &["config", "commit.gpgsign", "false"])?;
    Ok(())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-utf8 path {}", path.display()))
}

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
