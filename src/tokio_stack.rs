//! [`Stack`] implementation over tokio TCP and UDP sockets.
//!
//! ```text
//!   consumer threads ──StackRequest──► driver task
//!                                        ├── connect tasks ──► actor per connection
//!                                        └── listener tasks ─► actor per client
//!   actors / listeners ──► EventBridge ──► consumer queues
//! ```

use crate::actor::{self, ActorHandle, ActorTable, ConnCmd};
use crate::bridge::EventBridge;
use crate::config::ConnType;
use crate::error::{ConnectionError, NetconnError, Result};
use crate::registry::ConnId;
use crate::stack::{Reply, Stack, StackRequest};

use dashmap::DashMap;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Network stack running on a tokio runtime.
///
/// Consumer threads must live outside the runtime: replies are awaited with
/// blocking receives.
pub struct TokioStack {
    req_tx: mpsc::UnboundedSender<StackRequest>,
}

impl TokioStack {
    /// Start the driver task on `handle`.
    pub fn spawn(handle: &Handle, bridge: EventBridge) -> Self {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        handle.spawn(run_driver(req_rx, bridge));
        Self { req_tx }
    }
}

impl Stack for TokioStack {
    fn submit(&self, request: StackRequest) -> Result<()> {
        self.req_tx
            .send(request)
            .map_err(|_| NetconnError::stack("tokio stack driver has stopped"))
    }
}

struct Driver {
    bridge: EventBridge,
    actors: ActorTable,
    listeners: HashMap<ConnId, JoinHandle<()>>,
}

async fn run_driver(mut req_rx: mpsc::UnboundedReceiver<StackRequest>, bridge: EventBridge) {
    let mut driver = Driver {
        bridge,
        actors: Arc::new(DashMap::new()),
        listeners: HashMap::new(),
    };
    debug!("Tokio stack driver started");

    while let Some(request) = req_rx.recv().await {
        trace!(?request, "Stack request");
        driver.handle(request).await;
    }

    for (_, task) in driver.listeners.drain() {
        task.abort();
    }
    for entry in driver.actors.iter() {
        let _ = entry.value().send(ConnCmd::Abort);
    }
    debug!("Tokio stack driver stopped");
}

impl Driver {
    async fn handle(&mut self, request: StackRequest) {
        match request {
            StackRequest::Connect {
                id,
                conn_type,
                host,
                port,
                timeout,
                reply,
            } => {
                let bridge = self.bridge.clone();
                let actors = self.actors.clone();
                tokio::spawn(connect(id, conn_type, host, port, timeout, reply, bridge, actors));
            }

            StackRequest::Listen {
                id,
                conn_type,
                port,
                idle_timeout,
                reply,
                ..
            } => {
                let result = self.listen(id, conn_type, port, idle_timeout).await;
                let _ = reply.send(result);
            }

            StackRequest::Unlisten { id, port } => {
                if let Some(task) = self.listeners.remove(&id) {
                    task.abort();
                    info!(conn = id, port, "Stopped listening");
                }
            }

            StackRequest::Send { id, data, reply } => {
                self.forward(id, ConnCmd::Send { data, reply });
            }

            StackRequest::Close { id, reply } => {
                self.forward(id, ConnCmd::Close { reply });
            }

            StackRequest::Abort { id } => {
                if let Some((_, handle)) = self.actors.remove(&id) {
                    let _ = handle.send(ConnCmd::Abort);
                }
            }
        }
    }

    fn forward(&self, id: ConnId, cmd: ConnCmd) {
        let handle = self.actors.get(&id).map(|entry| entry.value().clone());
        match handle {
            Some(handle) => {
                if let Err(cmd) = handle.send(cmd) {
                    actor::reject(cmd);
                }
            }
            None => actor::reject(cmd),
        }
    }

    async fn listen(
        &mut self,
        id: ConnId,
        conn_type: ConnType,
        port: u16,
        idle_timeout: Option<Duration>,
    ) -> Result<()> {
        if conn_type != ConnType::Stream {
            return Err(NetconnError::stack(format!(
                "tokio stack cannot listen for {conn_type} connections"
            )));
        }
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(conn = id, port, "TCP listener bound");

        let task = tokio::spawn(run_listener(
            port,
            listener,
            self.bridge.clone(),
            self.actors.clone(),
            idle_timeout,
        ));
        if let Some(old) = self.listeners.insert(id, task) {
            old.abort();
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn connect(
    id: ConnId,
    conn_type: ConnType,
    host: String,
    port: u16,
    timeout: Duration,
    reply: Reply,
    bridge: EventBridge,
    actors: ActorTable,
) {
    let established = tokio::time::timeout(timeout, open_socket(conn_type, &host, port)).await;

    let socket = match established {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            debug!(conn = id, %host, port, error = %e, "Connect failed");
            let err = if e.kind() == io::ErrorKind::ConnectionRefused {
                NetconnError::connection(ConnectionError::Refused)
            } else {
                NetconnError::Io(e)
            };
            let _ = reply.send(Err(err));
            return;
        }
        Err(_) => {
            let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            let _ = reply.send(Err(NetconnError::timeout(ms)));
            return;
        }
    };

    // The actor is registered before the reply so the first send finds it.
    let (handle, cmd_rx) = ActorHandle::channel();
    actors.insert(id, handle);
    match socket {
        Socket::Stream(stream) => {
            tokio::spawn(actor::run_stream_actor(
                id,
                stream,
                cmd_rx,
                bridge,
                actors.clone(),
                None,
            ));
        }
        Socket::Datagram(socket) => {
            tokio::spawn(actor::run_datagram_actor(
                id,
                socket,
                cmd_rx,
                bridge,
                actors.clone(),
            ));
        }
    }
    if reply.send(Ok(())).is_err() {
        // Nobody is waiting any more.
        if let Some((_, handle)) = actors.remove(&id) {
            let _ = handle.send(ConnCmd::Abort);
        }
    }
}

enum Socket {
    Stream(TcpStream),
    Datagram(UdpSocket),
}

async fn open_socket(conn_type: ConnType, host: &str, port: u16) -> io::Result<Socket> {
    match conn_type {
        ConnType::Stream => Ok(Socket::Stream(TcpStream::connect((host, port)).await?)),
        ConnType::Datagram => {
            let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
            socket.connect((host, port)).await?;
            Ok(Socket::Datagram(socket))
        }
        ConnType::EncryptedStream => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "encrypted streams are not supported by the tokio stack",
        )),
    }
}

async fn run_listener(
    port: u16,
    listener: TcpListener,
    bridge: EventBridge,
    actors: ActorTable,
    idle_timeout: Option<Duration>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(port, error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let Some(id) = bridge.begin_accept(port, Some(peer)) else {
            debug!(port, %peer, "Client refused");
            continue;
        };

        let (handle, cmd_rx) = ActorHandle::channel();
        actors.insert(id, handle);
        tokio::spawn(actor::run_stream_actor(
            id,
            stream,
            cmd_rx,
            bridge.clone(),
            actors.clone(),
            idle_timeout,
        ));

        if !bridge.publish_accept(id) {
            if let Some((_, handle)) = actors.remove(&id) {
                let _ = handle.send(ConnCmd::Abort);
            }
        }
    }
}
