//! Per-connection socket actor. Owns the socket in a dedicated task and
//! talks to the rest of the stack through channels only.

use crate::bridge::{Delivery, EventBridge};
use crate::error::NetconnError;
use crate::registry::ConnId;
use crate::stack::Reply;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use netconn_core::Pbuf;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Bytes read from a socket per delivered buffer.
const READ_CHUNK: usize = 2048;

/// Commands sent to a connection actor.
pub(crate) enum ConnCmd {
    Send { data: Bytes, reply: Reply },
    Close { reply: Option<Reply> },
    Abort,
}

/// Clonable handle to a connection actor.
#[derive(Clone)]
pub(crate) struct ActorHandle {
    cmd_tx: mpsc::UnboundedSender<ConnCmd>,
}

impl ActorHandle {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<ConnCmd>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (Self { cmd_tx }, cmd_rx)
    }

    /// Forward a command; gives it back if the actor is gone.
    pub(crate) fn send(&self, cmd: ConnCmd) -> Result<(), ConnCmd> {
        self.cmd_tx.send(cmd).map_err(|e| e.0)
    }
}

/// Table of live actors, shared by the driver, listener tasks and the
/// actors themselves.
pub(crate) type ActorTable = Arc<DashMap<ConnId, ActorHandle>>;

/// Answer a command whose actor no longer exists.
pub(crate) fn reject(cmd: ConnCmd) {
    match cmd {
        ConnCmd::Send { reply, .. } => {
            let _ = reply.send(Err(NetconnError::closed()));
        }
        ConnCmd::Close { reply: Some(reply) } => {
            let _ = reply.send(Ok(()));
        }
        ConnCmd::Close { reply: None } | ConnCmd::Abort => {}
    }
}

/// Why a socket loop ended.
enum Exit {
    Local,
    Remote,
    Reset,
    Idle,
}

/// Run a TCP connection until either side closes it.
pub(crate) async fn run_stream_actor(
    id: ConnId,
    stream: TcpStream,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    bridge: EventBridge,
    actors: ActorTable,
    idle_timeout: Option<Duration>,
) {
    let _ = stream.set_nodelay(true);
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let exit = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Send { data, reply }) => {
                    let len = data.len();
                    match wr.write_all(&data).await {
                        Ok(()) => {
                            bridge.on_sent(id, len);
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            warn!(conn = id, error = %e, "Socket write failed");
                            let _ = reply.send(Err(NetconnError::Io(e)));
                            break Exit::Reset;
                        }
                    }
                }
                Some(ConnCmd::Close { reply }) => {
                    let result = wr.shutdown().await.map_err(NetconnError::Io);
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                    break Exit::Local;
                }
                Some(ConnCmd::Abort) | None => break Exit::Local,
            },

            read = rd.read_buf(&mut buf) => match read {
                Ok(0) => break Exit::Remote,
                Ok(n) => {
                    trace!(conn = id, len = n, "Socket read");
                    let delivery = bridge.on_data(id, Pbuf::new(buf.split().freeze()));
                    if delivery.should_abort() {
                        debug!(conn = id, ?delivery, "Stopping reads");
                        break Exit::Local;
                    }
                    buf.reserve(READ_CHUNK);
                }
                Err(e) => {
                    debug!(conn = id, error = %e, "Socket read failed");
                    break if is_reset(&e) { Exit::Reset } else { Exit::Remote };
                }
            },

            _ = tokio::time::sleep(idle_timeout.unwrap_or(Duration::MAX)), if idle_timeout.is_some() => {
                break Exit::Idle;
            }
        }
    };

    finish(id, exit, &bridge, &actors, &mut cmd_rx);
}

/// Run a connected UDP socket. Datagrams have no remote close, so this
/// only ends on a local close or a socket error.
pub(crate) async fn run_datagram_actor(
    id: ConnId,
    socket: UdpSocket,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    bridge: EventBridge,
    actors: ActorTable,
) {
    let mut buf = vec![0u8; u16::MAX as usize];

    let exit = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Send { data, reply }) => {
                    let result = socket.send(&data).await.map(|_| ()).map_err(NetconnError::Io);
                    if result.is_ok() {
                        bridge.on_sent(id, data.len());
                    }
                    let _ = reply.send(result);
                }
                Some(ConnCmd::Close { reply }) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                    break Exit::Local;
                }
                Some(ConnCmd::Abort) | None => break Exit::Local,
            },

            recv = socket.recv(&mut buf) => match recv {
                Ok(n) => {
                    let delivery = bridge.on_data(id, Pbuf::new(Bytes::copy_from_slice(&buf[..n])));
                    if delivery.should_abort() {
                        break Exit::Local;
                    }
                }
                // A previous send hit a closed port; the socket stays usable.
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    trace!(conn = id, "Datagram refused by peer");
                }
                Err(e) => {
                    warn!(conn = id, error = %e, "Datagram receive failed");
                    break Exit::Reset;
                }
            },
        }
    };

    finish(id, exit, &bridge, &actors, &mut cmd_rx);
}

fn finish(
    id: ConnId,
    exit: Exit,
    bridge: &EventBridge,
    actors: &ActorTable,
    cmd_rx: &mut mpsc::UnboundedReceiver<ConnCmd>,
) {
    actors.remove(&id);
    match exit {
        Exit::Local => {}
        Exit::Remote => bridge.on_remote_closed(id),
        Exit::Idle => {
            debug!(conn = id, "Idle timeout");
            bridge.on_remote_closed(id);
        }
        Exit::Reset => bridge.on_reset(id),
    }

    // Commands that raced with the shutdown still get an answer.
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        reject(cmd);
    }
    trace!(conn = id, "Actor stopped");
}

fn is_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}
