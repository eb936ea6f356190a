//! beastd integration test harness.
//!
//! Tests here run the compiled `beastd` binary against a loopback fake
//! aggregator. Build it first:
//!
//!   cargo build -p beastd
//!   cargo test --test integration
//!
//! Each test gets its own ports, config file and database, and is
//! responsible for the daemon it spawns.

mod api;
mod relay;
mod shutdown;

use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Path to the daemon binary: `$BEASTD_BIN`, else the workspace debug build.
pub fn beastd_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("BEASTD_BIN") {
        return Some(PathBuf::from(p));
    }
    let target = std::env::var("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../target"));
    let bin = target.join("debug").join("beastd");
    bin.exists().then_some(bin)
}

/// Tests call this and skip gracefully if the daemon has not been built.
pub fn skip_unless_built() -> bool {
    if beastd_binary().is_none() {
        eprintln!("SKIP: beastd binary not found; run cargo build -p beastd first");
        return false;
    }
    true
}

pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}

/// Poll `check` until it returns true or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

/// Three Mode-S short frames and one long frame.
pub fn sample_frames() -> Vec<u8> {
    let short = [
        0x1A, 0x32, 0, 0, 0, 0, 0, 1, 0x30, 0x5D, 0x4B, 0x86, 0x3F, 0x11, 0x22, 0x33,
    ];
    let long = [
        0x1A, 0x33, 0, 0, 0, 0, 0, 2, 0x40, 0x8D, 0x4B, 0x86, 0x3F, 0x58, 0xC3, 0x82, 0xD6,
        0x90, 0xC8, 0xAC, 0x28, 0x63, 0xA7,
    ];
    let mut out = Vec::new();
    for _ in 0..3 {
        out.extend_from_slice(&short);
    }
    out.extend_from_slice(&long);
    out
}

/// Loopback aggregator stand-in collecting everything it receives.
pub struct FakeAggregator {
    pub port: u16,
    received: Arc<Mutex<Vec<u8>>>,
}

impl FakeAggregator {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let sink = sink.clone();
                thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    while let Ok(n) = stream.read(&mut buf) {
                        if n == 0 {
                            break;
                        }
                        sink.lock().unwrap().extend_from_slice(&buf[..n]);
                    }
                });
            }
        });
        Self { port, received }
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }
}

/// A running daemon with its own scratch directory.
pub struct Daemon {
    child: Option<Child>,
    pub dir: PathBuf,
    pub listen: SocketAddr,
    pub api_port: u16,
}

impl Daemon {
    pub fn spawn(upstream_port: u16, interval_secs: u64) -> Result<Self> {
        let bin = beastd_binary().context("beastd binary not built")?;
        let dir = std::env::temp_dir().join(format!(
            "beastd-it-{}-{}",
            std::process::id(),
            free_port()
        ));
        std::fs::create_dir_all(&dir)?;

        let listen_port = free_port();
        let api_port = free_port();
        let child = Command::new(bin)
            .env("RUST_LOG", "beastd=debug,beast_services=debug")
            .env("BEAST_CONFIG", dir.join("config.toml"))
            .env("BEAST_NETWORK__LISTEN_HOST", "127.0.0.1")
            .env("BEAST_NETWORK__LISTEN_PORT", listen_port.to_string())
            .env("BEAST_NETWORK__UPSTREAM_HOST", "127.0.0.1")
            .env("BEAST_NETWORK__UPSTREAM_PORT", upstream_port.to_string())
            .env("BEAST_NETWORK__API_PORT", api_port.to_string())
            .env("BEAST_STATS__INTERVAL_SECS", interval_secs.to_string())
            .env("BEAST_STORE__DB_PATH", dir.join("aggregator.db"))
            .env("BEAST_TAILSCALE__ENABLED", "false")
            .env("BEAST_MLAT__CLIENTS_PATH", dir.join("clients.json"))
            .env("BEAST_READSB__AIRCRAFT_PATH", dir.join("aircraft.json"))
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .context("failed to spawn beastd")?;

        let daemon = Self {
            child: Some(child),
            dir,
            listen: SocketAddr::from(([127, 0, 0, 1], listen_port)),
            api_port,
        };
        // The API comes up after the feeder listener is bound. Probing the
        // feeder port itself would open a session.
        if !wait_until(Duration::from_secs(10), || {
            api_get(daemon.api_port, "/api/status").is_ok()
        }) {
            bail!("beastd did not come up on {}", daemon.listen);
        }
        Ok(daemon)
    }

    pub fn db(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(self.dir.join("aggregator.db")).unwrap()
    }

    /// SIGTERM and wait for exit. The scratch directory stays until drop.
    pub fn terminate(&mut self) -> Result<ExitStatus> {
        let mut child = self.child.take().context("daemon already stopped")?;
        kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM)?;
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if Instant::now() > deadline {
                let _ = child.kill();
                bail!("beastd did not exit after SIGTERM");
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Request against the daemon's loopback API, decoded as JSON.
pub fn api_request(port: u16, method: reqwest::Method, path: &str) -> Result<serde_json::Value> {
    let response = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?
        .request(method.clone(), format!("http://127.0.0.1:{port}{path}"))
        .send()?;
    let status = response.status();
    if !status.is_success() {
        bail!("{method} {path} failed: {status}");
    }
    Ok(response.json()?)
}

pub fn api_get(port: u16, path: &str) -> Result<serde_json::Value> {
    api_request(port, reqwest::Method::GET, path)
}

pub fn api_post(port: u16, path: &str) -> Result<serde_json::Value> {
    api_request(port, reqwest::Method::POST, path)
}
