use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};

use crate::portmux::{
    net,
    socket::{Listener, ListenerTasks, NewConnectFn, READ_BUF, SocketCore},
    tunnel::endpoint::{EndPoint, Subscriber},
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts TCP connections and hands each one out as a [`TcpSession`].
pub struct TcpServer {
    bind_addr: String,
    on_new_connect: NewConnectFn,
    tasks: ListenerTasks,
}

impl TcpServer {
    pub fn new(bind_addr: impl Into<String>, on_new_connect: NewConnectFn) -> Arc<Self> {
        Arc::new(Self {
            bind_addr: bind_addr.into(),
            on_new_connect,
            tasks: ListenerTasks::default(),
        })
    }
}

#[async_trait]
impl Listener for TcpServer {
    async fn start(&self) -> bool {
        let bind = net::normalize_bind_addr(&self.bind_addr);
        let ln = match TcpListener::bind(bind.as_ref()).await {
            Ok(ln) => ln,
            Err(err) => {
                tracing::warn!(bind = %self.bind_addr, err = %err, "tcp: listen failed");
                return false;
            }
        };
        let local = ln.local_addr().ok();
        let cb = self.on_new_connect.clone();
        let task = tokio::spawn(accept_loop(ln, cb));
        if !self.tasks.install(local, vec![task]) {
            return false;
        }
        tracing::debug!(bind = %self.bind_addr, local = ?local, "tcp: listening");
        true
    }

    fn close(&self) {
        if self.tasks.close() {
            tracing::debug!(bind = %self.bind_addr, "tcp: listener closed");
        }
    }

    async fn wait_closed(&self) {
        self.tasks.wait_closed().await;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.tasks.local_addr()
    }
}

async fn accept_loop(ln: TcpListener, on_new_connect: NewConnectFn) {
    loop {
        match ln.accept().await {
            Ok((stream, peer)) => {
                tracing::trace!(peer = %peer, "tcp: accepted");
                on_new_connect(TcpSession::new(stream));
            }
            Err(err) => {
                // Usually fd exhaustion; back off instead of spinning.
                tracing::warn!(err = %err, "tcp: accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// An accepted connection. Reading begins at `start`.
pub struct TcpSession {
    core: Arc<SocketCore>,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpSession {
    pub fn new(stream: TcpStream) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(SocketCore::default()),
            stream: Mutex::new(Some(stream)),
        })
    }
}

#[async_trait]
impl EndPoint for TcpSession {
    fn subscribe(&self, subscriber: Subscriber) {
        self.core.subscribe(subscriber);
    }

    async fn start(&self) -> bool {
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match stream {
            Some(s) => attach(&self.core, s),
            None => false,
        }
    }

    fn write(&self, data: Bytes) {
        self.core.write(data);
    }

    fn close(&self) {
        // Drops the stream if start never ran.
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.core.close();
    }

    fn on_receive_data(&self, data: Bytes) {
        self.core.emit_data(data);
    }
}

/// Outbound connection to a target; `start` resolves to the connect result.
pub struct TcpClient {
    core: Arc<SocketCore>,
    target: String,
    connect_timeout: Duration,
}

impl TcpClient {
    pub fn new(target: impl Into<String>) -> Arc<Self> {
        Self::with_timeout(target, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(target: impl Into<String>, connect_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(SocketCore::default()),
            target: target.into(),
            connect_timeout,
        })
    }
}

#[async_trait]
impl EndPoint for TcpClient {
    fn subscribe(&self, subscriber: Subscriber) {
        self.core.subscribe(subscriber);
    }

    async fn start(&self) -> bool {
        if self.core.is_closed() {
            return false;
        }
        let res = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.target)).await;
        match res {
            Ok(Ok(stream)) => attach(&self.core, stream),
            Ok(Err(err)) => {
                tracing::debug!(target_addr = %self.target, err = %err, "tcp: connect failed");
                self.core.close();
                false
            }
            Err(_) => {
                tracing::debug!(target_addr = %self.target, "tcp: connect timed out");
                self.core.close();
                false
            }
        }
    }

    fn write(&self, data: Bytes) {
        self.core.write(data);
    }

    fn close(&self) {
        self.core.close();
    }

    fn on_receive_data(&self, data: Bytes) {
        self.core.emit_data(data);
    }
}

fn attach(core: &Arc<SocketCore>, stream: TcpStream) -> bool {
    let _ = stream.set_nodelay(true);
    let (rd, wr) = stream.into_split();
    core.install(|| {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(wr, rx, Arc::downgrade(core)));
        let reader = tokio::spawn(read_loop(rd, core.clone()));
        (tx, reader)
    })
}

async fn read_loop(mut rd: OwnedReadHalf, core: Arc<SocketCore>) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => core.emit_data(Bytes::copy_from_slice(&buf[..n])),
            Err(err) => {
                tracing::trace!(err = %err, "tcp: read failed");
                break;
            }
        }
    }
    core.close();
}

async fn write_loop(
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    core: Weak<SocketCore>,
) {
    while let Some(b) = rx.recv().await {
        if let Err(err) = wr.write_all(&b).await {
            tracing::trace!(err = %err, "tcp: write failed");
            if let Some(core) = core.upgrade() {
                core.close();
            }
            return;
        }
    }
    let _ = wr.shutdown().await;
}
