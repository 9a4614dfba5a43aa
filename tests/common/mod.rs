//! Shared test helpers for netconn integration tests

#![allow(dead_code)]

use bytes::Bytes;
use netconn::{
    ConnId, ConnectionError, EventBridge, NetconnConfig, NetconnError, Netstack, Reply, Stack,
    StackRequest,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A request as seen by the scripted stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Connect { id: ConnId, host: String, port: u16 },
    Listen { id: ConnId, port: u16, max_conns: usize },
    Unlisten { id: ConnId, port: u16 },
    Send { id: ConnId, data: Bytes },
    Close { id: ConnId },
    Abort { id: ConnId },
}

/// Stack that records every request and answers from a script. The test
/// itself plays the event context through an [`EventBridge`].
#[derive(Default)]
pub struct MockStack {
    log: Mutex<Vec<Recorded>>,
    refuse_connects: AtomicBool,
    fail_listens: AtomicBool,
    hold_sends: AtomicBool,
    held: Mutex<Vec<Reply>>,
    before_connect_reply: Mutex<Option<ConnectHook>>,
}

/// Event played by the stack after a connect starts and before it answers.
type ConnectHook = Box<dyn Fn(ConnId) + Send + Sync>;

impl MockStack {
    pub fn refuse_connects(&self, refuse: bool) {
        self.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    /// Answer every `Listen` with a stack failure.
    pub fn fail_listens(&self, fail: bool) {
        self.fail_listens.store(fail, Ordering::SeqCst);
    }

    /// Run `hook` with the connection id before each connect is answered.
    pub fn before_connect_reply(&self, hook: impl Fn(ConnId) + Send + Sync + 'static) {
        *self.before_connect_reply.lock() = Some(Box::new(hook));
    }

    /// Keep send acknowledgements back until `release_sends`.
    pub fn hold_sends(&self, hold: bool) {
        self.hold_sends.store(hold, Ordering::SeqCst);
    }

    pub fn release_sends(&self) {
        self.hold_sends(false);
        for reply in self.held.lock().drain(..) {
            let _ = reply.send(Ok(()));
        }
    }

    pub fn held_sends(&self) -> usize {
        self.held.lock().len()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().clone()
    }

    /// Payloads sent on `id`, concatenated.
    pub fn sent_bytes(&self, id: ConnId) -> Vec<u8> {
        self.log
            .lock()
            .iter()
            .filter_map(|r| match r {
                Recorded::Send { id: sid, data } if *sid == id => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn sends(&self, id: ConnId) -> Vec<Bytes> {
        self.log
            .lock()
            .iter()
            .filter_map(|r| match r {
                Recorded::Send { id: sid, data } if *sid == id => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Poll until `pred` holds for the recorded requests.
    pub fn wait_until(&self, timeout: Duration, pred: impl Fn(&[Recorded]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred(&self.log.lock()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }
}

impl Stack for MockStack {
    fn submit(&self, request: StackRequest) -> netconn::Result<()> {
        match request {
            StackRequest::Connect {
                id,
                host,
                port,
                reply,
                ..
            } => {
                self.log.lock().push(Recorded::Connect { id, host, port });
                if let Some(hook) = self.before_connect_reply.lock().as_ref() {
                    hook(id);
                }
                let result = if self.refuse_connects.load(Ordering::SeqCst) {
                    Err(NetconnError::connection(ConnectionError::Refused))
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            }
            StackRequest::Listen {
                id,
                port,
                max_conns,
                reply,
                ..
            } => {
                self.log.lock().push(Recorded::Listen {
                    id,
                    port,
                    max_conns,
                });
                let result = if self.fail_listens.load(Ordering::SeqCst) {
                    Err(NetconnError::stack("bind failed"))
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            }
            StackRequest::Unlisten { id, port } => {
                self.log.lock().push(Recorded::Unlisten { id, port });
            }
            StackRequest::Send { id, data, reply } => {
                self.log.lock().push(Recorded::Send { id, data });
                if self.hold_sends.load(Ordering::SeqCst) {
                    self.held.lock().push(reply);
                } else {
                    let _ = reply.send(Ok(()));
                }
            }
            StackRequest::Close { id, reply } => {
                self.log.lock().push(Recorded::Close { id });
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            StackRequest::Abort { id } => {
                self.log.lock().push(Recorded::Abort { id });
            }
        }
        Ok(())
    }
}

/// A netstack over a fresh [`MockStack`], plus the bridge the test drives.
pub fn mock_netstack(config: NetconnConfig) -> (Netstack, EventBridge, Arc<MockStack>) {
    init_tracing();
    let mock = Arc::new(MockStack::default());
    let netstack = Netstack::with_stack(config, |_| mock.clone()).unwrap();
    let bridge = netstack.bridge();
    (netstack, bridge, mock)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
