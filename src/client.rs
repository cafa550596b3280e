//! Thin client for the ish daemon.
//!
//! Connects to the daemon's Unix socket and proxies the local terminal:
//! stdin is framed into Data packets, SIGWINCH becomes a Resize packet, and
//! everything the daemon sends back is copied to stdout unchanged.

use std::io;
use std::path::Path;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use crate::packet::{Packet, WindowSize};

const STDIN_BUFFER: usize = 4096;
const OUTPUT_BUFFER: usize = 4096;

/// A connection to the ish daemon.
pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Connect to the daemon's Unix domain socket.
    pub async fn connect(socket_path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        Ok(Self { stream })
    }

    /// Proxy the local terminal until the daemon closes the connection.
    ///
    /// `initial_size` is sent as a Resize before any input so the remote pty
    /// starts with the local geometry. The caller owns raw mode.
    pub async fn run_streaming(self, initial_size: Option<WindowSize>) -> io::Result<()> {
        let (reader, writer) = self.stream.into_split();

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Bytes>(64);
        tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; STDIN_BUFFER];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if stdin_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let (sigwinch_tx, mut sigwinch_rx) = mpsc::channel::<WindowSize>(4);
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigwinch = match signal(SignalKind::window_change()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(?e, "cannot watch for window size changes");
                    return;
                }
            };
            while sigwinch.recv().await.is_some() {
                match crate::terminal::window_size() {
                    Ok(size) => {
                        if sigwinch_tx.send(size).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!(%e, "failed to read window size"),
                }
            }
        });

        streaming_loop(
            reader,
            writer,
            tokio::io::stdout(),
            initial_size,
            &mut stdin_rx,
            &mut sigwinch_rx,
        )
        .await
    }
}

/// The proxy loop, factored out of `run_streaming` for testability.
///
/// Forwards `stdin_rx` as Data packets and `sigwinch_rx` as one Resize per
/// event, and copies everything read from `reader` to `out`. Once stdin is
/// exhausted the write side is shut down, which the daemon treats as a
/// disconnect; output keeps flowing until the daemon closes the connection.
pub async fn streaming_loop<R, W, O>(
    mut reader: R,
    mut writer: W,
    mut out: O,
    initial_size: Option<WindowSize>,
    stdin_rx: &mut mpsc::Receiver<Bytes>,
    sigwinch_rx: &mut mpsc::Receiver<WindowSize>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    if let Some(size) = initial_size {
        writer.write_all(&Packet::resize(size).encode()).await?;
    }

    let mut input_open = true;
    let mut buf = [0u8; OUTPUT_BUFFER];
    loop {
        tokio::select! {
            data = stdin_rx.recv(), if input_open => match data {
                Some(data) => {
                    if let Err(e) = send_input(&mut writer, &data).await {
                        tracing::debug!(?e, "failed to send input");
                        break;
                    }
                }
                None => {
                    input_open = false;
                    let _ = writer.shutdown().await;
                }
            },

            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => {
                    out.write_all(&buf[..n]).await?;
                    out.flush().await?;
                }
                Err(e) => {
                    tracing::debug!(?e, "connection read failed");
                    break;
                }
            },

            Some(size) = sigwinch_rx.recv(), if input_open => {
                if let Err(e) = writer.write_all(&Packet::resize(size).encode()).await {
                    tracing::debug!(?e, "failed to send resize");
                    break;
                }
            }
        }
    }

    if input_open {
        let _ = writer.shutdown().await;
    }
    Ok(())
}

/// Frame `data` into maximal Data packets and write them in order.
async fn send_input<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    for packet in Packet::data_chunks(data) {
        writer.write_all(&packet.encode()).await?;
    }
    Ok(())
}
