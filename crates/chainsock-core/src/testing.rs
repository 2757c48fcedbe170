//! In-memory node for engine unit tests.
//!
//! Every `open()` creates a fresh `tokio::io::duplex` pair and spawns a task
//! that answers framed requests through a scripted handler.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::ProviderError;
use crate::framing::MessageFramer;
use crate::request::{JsonRpcRequest, RpcId, SUBSCRIPTION_METHOD};
use crate::transport::{ByteStreamReader, ByteStreamWriter, SocketConnector, SocketWriter};

type Handler = Box<dyn Fn(&JsonRpcRequest) -> Vec<String> + Send + Sync>;

enum NodeCommand {
    Send(String),
    Close,
}

pub(crate) struct MockNode {
    handler: Handler,
    /// Number of upcoming `open()` calls that fail with `ConnectionRefused`.
    pub fail_opens: AtomicU32,
    /// Number of upcoming writes that fail with `BrokenPipe`.
    pub broken_writes: AtomicU32,
    opens: AtomicU32,
    writes: AtomicU32,
    open_times: Mutex<Vec<Instant>>,
    methods: Mutex<Vec<String>>,
    sockets: Mutex<Vec<mpsc::UnboundedSender<NodeCommand>>>,
}

impl MockNode {
    pub fn new(handler: impl Fn(&JsonRpcRequest) -> Vec<String> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            fail_opens: AtomicU32::new(0),
            broken_writes: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            writes: AtomicU32::new(0),
            open_times: Mutex::default(),
            methods: Mutex::default(),
            sockets: Mutex::default(),
        })
    }

    /// Every `open()` call, failed or not.
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Every `send_message` call, failed or not.
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.open_times.lock().unwrap().clone()
    }

    /// Methods received, in order.
    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap().clone()
    }

    /// Write raw bytes to the newest socket, unsolicited.
    pub fn push(&self, raw: String) {
        self.command(NodeCommand::Send(raw));
    }

    /// Drop the node's end of the newest socket.
    pub fn close_latest(&self) {
        self.command(NodeCommand::Close);
    }

    fn command(&self, cmd: NodeCommand) {
        let sockets = self.sockets.lock().unwrap();
        let _ = sockets.last().expect("no socket opened").send(cmd);
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

async fn serve(node: Arc<MockNode>, stream: DuplexStream, mut commands: mpsc::UnboundedReceiver<NodeCommand>) {
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut framer = MessageFramer::new();
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            n = rd.read(&mut buf) => {
                let n = match n {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                framer.push(&buf[..n]);
                while let Ok(Some(value)) = framer.next_message() {
                    let Ok(req) = serde_json::from_value::<JsonRpcRequest>(value) else {
                        continue;
                    };
                    node.methods.lock().unwrap().push(req.method.clone());
                    for out in (node.handler)(&req) {
                        if wr.write_all(out.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            }
            cmd = commands.recv() => match cmd {
                Some(NodeCommand::Send(raw)) => {
                    let _ = wr.write_all(raw.as_bytes()).await;
                }
                Some(NodeCommand::Close) | None => return,
            },
        }
    }
}

pub(crate) struct MockConnector {
    node: Arc<MockNode>,
}

impl MockConnector {
    pub fn new(node: &Arc<MockNode>) -> Self {
        Self {
            node: Arc::clone(node),
        }
    }
}

#[async_trait]
impl SocketConnector for MockConnector {
    type Reader = ByteStreamReader<ReadHalf<DuplexStream>>;
    type Writer = FlakyWriter;

    async fn open(&self) -> Result<(Self::Reader, Self::Writer), ProviderError> {
        self.node.opens.fetch_add(1, Ordering::SeqCst);
        self.node.open_times.lock().unwrap().push(Instant::now());
        if take_one(&self.node.fail_opens) {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        self.node.sockets.lock().unwrap().push(tx);
        tokio::spawn(serve(Arc::clone(&self.node), server, rx));

        let (rd, wr) = tokio::io::split(client);
        let writer = FlakyWriter {
            inner: ByteStreamWriter::new(wr),
            node: Arc::clone(&self.node),
        };
        Ok((ByteStreamReader::new(rd), writer))
    }

    fn endpoint(&self) -> &str {
        "mock://node"
    }

    fn kind(&self) -> &'static str {
        "MockProvider"
    }
}

/// Writer that fails with `BrokenPipe` while the node's counter allows.
pub(crate) struct FlakyWriter {
    inner: ByteStreamWriter<WriteHalf<DuplexStream>>,
    node: Arc<MockNode>,
}

#[async_trait]
impl SocketWriter for FlakyWriter {
    async fn send_message(&mut self, message: &str) -> Result<(), ProviderError> {
        self.node.writes.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.node.broken_writes) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        self.inner.send_message(message).await
    }

    async fn close(&mut self) -> Result<(), ProviderError> {
        self.inner.close().await
    }
}

pub(crate) fn reply(id: &RpcId, result: Value) -> String {
    json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
}

pub(crate) fn notification(subscription: &str, result: Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": SUBSCRIPTION_METHOD,
        "params": {"subscription": subscription, "result": result},
    })
    .to_string()
}

/// Poll `cond` until it holds, panicking after about a second.
pub(crate) async fn eventually(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}
