//! Two `porlink` processes exchanging PoR checks, observed through their logs.
//!
//! Run with: cargo test --test log_test -- --nocapture

use parking_lot::Mutex;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const BINARY: &str = env!("CARGO_BIN_EXE_porlink");

/// Every PoR transition a node logs while checking, and answering, a peer
const TRANSITIONS: [&str; 4] = [
    "Sending PoR request",
    "Received PoR request",
    "Sending PoR response",
    "Received PoR response",
];

struct TestNode {
    process: Child,
    lines: Arc<Mutex<Vec<String>>>,
    data_dir: PathBuf,
}

impl TestNode {
    fn spawn(port: u16, boot_node: Option<u16>) -> Self {
        let data_dir = std::env::temp_dir().join(format!("porlink_log_test_{}_{}", port, std::process::id()));
        let _ = fs::remove_dir_all(&data_dir);

        let mut cmd = Command::new(BINARY);
        cmd.arg("--port")
            .arg(port.to_string())
            .arg("--data-dir")
            .arg(&data_dir)
            .arg("--por-enabled")
            .env("RUST_LOG", "porlink=info,por=info")
            .env("NO_COLOR", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(boot) = boot_node {
            cmd.arg("--boot-nodes").arg(format!("127.0.0.1:{}", boot));
        }

        let mut process = cmd.spawn().expect("failed to spawn porlink");
        let stdout = process.stdout.take().expect("stdout is piped");

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => sink.lock().push(line),
                    Err(_) => break,
                }
            }
        });

        Self { process, lines, data_dir }
    }

    fn has_line(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }

    fn wait_for(&self, needle: &str, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.has_line(needle) {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }

    fn dump(&self, name: &str) {
        for line in self.lines.lock().iter() {
            println!("  [{}] {}", name, line);
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
        let _ = fs::remove_dir_all(&self.data_dir);
    }
}

#[test]
fn test_two_processes_log_every_por_transition() {
    let node0 = TestNode::spawn(29650, None);
    assert!(node0.wait_for("Listening on", Duration::from_secs(10)), "node 0 did not start");

    let node1 = TestNode::spawn(29651, Some(29650));
    assert!(node1.wait_for("Listening on", Duration::from_secs(10)), "node 1 did not start");

    // Both sides check each other on connect, so each logs all four lines
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut missing = Vec::new();
    for (name, node) in [("node 0", &node0), ("node 1", &node1)] {
        for line in TRANSITIONS {
            let left = deadline.saturating_duration_since(Instant::now());
            if !node.wait_for(line, left) {
                missing.push(format!("{}: {}", name, line));
            }
        }
    }

    if !missing.is_empty() {
        node0.dump("node 0");
        node1.dump("node 1");
    }
    assert!(missing.is_empty(), "missing log lines: {:?}", missing);
}
