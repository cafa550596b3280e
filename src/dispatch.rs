//! Connection dispatcher: socket → packet decoder → dispatch table.
//!
//! One dispatcher runs per connection. It is the only reader of the
//! connection, so packets reach the session in wire order. The opposite
//! direction (pty output → peer) is a raw relay owned by the session.

use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::packet::{Packet, PacketError, PacketKind, WindowSize, MAX_FRAME_LEN};
use crate::session::{SessionError, SessionHandle};

/// Bytes requested per socket read.
///
/// Several frames fit, so writes the kernel coalesced are still decoded.
/// Frames split across reads are not reassembled.
pub const READ_BUFFER_LEN: usize = 4 * MAX_FRAME_LEN;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Handler for one packet kind.
pub type PacketHandler<S> = fn(&S, &Packet) -> Result<(), DispatchError>;

/// The dispatch table: packet kind → handler.
pub fn handler_for<S: SessionHandle>(kind: PacketKind) -> PacketHandler<S> {
    match kind {
        PacketKind::Data => handle_data::<S>,
        PacketKind::Resize => handle_resize::<S>,
    }
}

/// Route one packet to its handler.
pub fn dispatch<S: SessionHandle>(session: &S, packet: &Packet) -> Result<(), DispatchError> {
    handler_for::<S>(packet.kind())(session, packet)
}

fn handle_data<S: SessionHandle>(session: &S, packet: &Packet) -> Result<(), DispatchError> {
    session.write_data(packet.payload())?;
    Ok(())
}

fn handle_resize<S: SessionHandle>(session: &S, packet: &Packet) -> Result<(), DispatchError> {
    let size = WindowSize::from_payload(packet.payload())?;
    session.resize(size)?;
    Ok(())
}

/// Read packets from `reader` and dispatch them to `session`.
///
/// Malformed, oversized and unknown frames are logged and dropped; they
/// never end the loop. When the peer disconnects (or the read fails) the
/// session is closed. When `cancel` fires the loop returns without closing,
/// since the session is already tearing itself down.
pub async fn serve_connection<S, R>(mut reader: R, session: Arc<S>, cancel: CancellationToken)
where
    S: SessionHandle,
    R: AsyncRead + Unpin,
{
    let id = session.id();
    let mut buf = [0u8; READ_BUFFER_LEN];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(session = %id, "dispatcher cancelled");
                return;
            }
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    tracing::debug!(session = %id, "peer closed connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(session = %id, ?e, "connection read failed");
                    break;
                }
            },
        };

        let mut packets = Vec::new();
        for frame in Packet::frames(&buf[..n]) {
            match frame {
                Ok(packet) => packets.push(packet),
                Err(e) => tracing::warn!(session = %id, %e, read = n, "dropping malformed packet"),
            }
        }
        if packets.is_empty() {
            continue;
        }

        // Pty writes and ioctls are syscalls; keep them off the runtime.
        let target = session.clone();
        let dispatched = tokio::task::spawn_blocking(move || {
            for packet in &packets {
                if let Err(e) = dispatch(&*target, packet) {
                    tracing::warn!(session = %target.id(), kind = ?packet.kind(), %e, "packet dispatch failed");
                }
            }
        })
        .await;
        if let Err(e) = dispatched {
            tracing::error!(session = %id, ?e, "dispatch task failed");
        }
    }

    let mut errors = session.close();
    while let Some(e) = errors.next().await {
        tracing::warn!(session = %id, %e, "error while closing session");
    }
}
