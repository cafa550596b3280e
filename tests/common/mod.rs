#![allow(dead_code)]

use ish::config::{Config, ShellConfig};
use ish::packet::Packet;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const OUTPUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Config running `program` with `args` and the given grace period.
pub fn shell_config(program: &str, args: &[&str], grace_period_secs: u64) -> Config {
    Config {
        shell: ShellConfig::command(program, args),
        grace_period_secs,
        ..Config::default()
    }
}

/// A daemon running in-process on a temporary socket.
pub struct TestDaemon {
    pub socket_path: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<std::io::Result<()>>>,
    _dir: TempDir,
}

impl TestDaemon {
    pub async fn start(mut config: Config) -> Self {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("ish.sock");
        config.socket_path = Some(socket_path.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(ish::server::run_daemon(config, async move {
            let _ = shutdown_rx.await;
        }));

        // Wait for socket to appear
        for _ in 0..100 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Self {
            socket_path,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
            _dir: dir,
        }
    }

    pub async fn connect(&self) -> UnixStream {
        UnixStream::connect(&self.socket_path).await.unwrap()
    }

    /// Trigger shutdown and wait for the daemon to return.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("daemon did not shut down in time")
                .unwrap()
                .unwrap();
        }
    }
}

/// Send `text` to the shell as Data packets.
pub async fn send_text<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) {
    for packet in Packet::data_chunks(text.as_bytes()) {
        writer.write_all(&packet.encode()).await.unwrap();
        // Keep frames in separate reads on the daemon side.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Read until the accumulated output contains `needle`.
pub async fn read_until<R: AsyncRead + Unpin>(reader: &mut R, needle: &str) -> String {
    let mut output = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + OUTPUT_TIMEOUT;
    loop {
        let n = tokio::time::timeout_at(deadline, reader.read(&mut buf))
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "timed out waiting for {:?}; got {:?}",
                    needle,
                    String::from_utf8_lossy(&output)
                )
            })
            .unwrap();
        if n == 0 {
            panic!(
                "connection closed before {:?}; got {:?}",
                needle,
                String::from_utf8_lossy(&output)
            );
        }
        output.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&output);
        if text.contains(needle) {
            return text.into_owned();
        }
    }
}

/// Read until EOF, returning everything received.
pub async fn read_to_eof<R: AsyncRead + Unpin>(reader: &mut R) -> String {
    let mut output = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), reader.read_to_end(&mut output))
        .await
        .expect("connection was not closed in time")
        .unwrap();
    String::from_utf8_lossy(&output).into_owned()
}
