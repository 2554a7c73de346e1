// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::frame::{encode_frame, FrameAssembler};
use crate::service::ConnectionConfig;
use crate::{AppError, AppResult};

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Callbacks of a [`FramedConnection`].
///
/// `on_message` is awaited once per assembled frame, in receive order, from
/// the connection's assemble task. `on_close` is awaited exactly once, after
/// all three connection tasks have terminated.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_message<'a>(&'a self, conn: &'a FramedConnection, payload: Bytes) -> HandlerFuture<'a>;

    fn on_close<'a>(&'a self, _conn: &'a FramedConnection) -> HandlerFuture<'a> {
        Box::pin(async {})
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSide {
    /// dialed by us
    Client,
    /// accepted by a listener
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Open,
    Closing,
    Closed,
}

tokio::task_local! {
    /// Identity of the connection whose receive, assemble or send task is running.
    static OWNER: usize;
}

struct ConnectionTasks {
    receive: JoinHandle<()>,
    assemble: JoinHandle<()>,
    send: JoinHandle<()>,
}

struct Inner {
    side: ConnectionSide,
    remote_addr: SocketAddr,
    state: AtomicCell<LifecycleState>,
    /// stops the receive and send tasks
    cancel: CancellationToken,
    /// fired once the close sequence has joined every task
    closed: CancellationToken,
    inbound_tx: async_channel::Sender<Bytes>,
    inbound_rx: async_channel::Receiver<Bytes>,
    outbound_tx: async_channel::Sender<Bytes>,
    outbound_rx: async_channel::Receiver<Bytes>,
    tasks: Mutex<Option<ConnectionTasks>>,
    handler: Arc<dyn ConnectionHandler>,
    max_frame_size: usize,
}

/// One TCP stream speaking the `[u32 BE length][payload]` protocol.
///
/// The same type serves both sides of a link. Cloning is cheap and every
/// clone refers to the same connection; equality and hashing follow that
/// shared identity, which makes the type usable as a set or map key.
///
/// Three tasks are started at construction:
/// * receive: reads raw chunks off the socket into the bounded inbound queue
/// * assemble: cuts chunks into frames and hands each one to the handler
/// * send: drains the bounded outbound queue onto the socket
///
/// Any stream failure closes the connection; errors never surface to
/// callers of [`FramedConnection::write`].
#[derive(Clone)]
pub struct FramedConnection(Arc<Inner>);

impl FramedConnection {
    /// Dials `address` and starts a client side connection.
    pub async fn dial(
        address: &str,
        config: &ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> AppResult<FramedConnection> {
        config.validate()?;
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| AppError::Dial {
                address: address.to_string(),
                source,
            })?;
        let conn = Self::start(stream, ConnectionSide::Client, config, handler)?;
        info!(peer = %conn.remote_addr(), "dialed connection");
        Ok(conn)
    }

    /// Wraps a stream handed out by a listener.
    pub fn accept(
        stream: TcpStream,
        config: &ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> AppResult<FramedConnection> {
        Self::start(stream, ConnectionSide::Server, config, handler)
    }

    fn start(
        stream: TcpStream,
        side: ConnectionSide,
        config: &ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> AppResult<FramedConnection> {
        config.validate()?;
        let remote_addr = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %remote_addr, "set_nodelay failed: {}", e);
        }
        let (reader, writer) = stream.into_split();
        let (inbound_tx, inbound_rx) = async_channel::bounded(config.inbound_queue_capacity);
        let (outbound_tx, outbound_rx) = async_channel::bounded(config.outbound_queue_capacity);

        let conn = FramedConnection(Arc::new(Inner {
            side,
            remote_addr,
            state: AtomicCell::new(LifecycleState::Open),
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
            tasks: Mutex::new(None),
            handler,
            max_frame_size: config.max_frame_size,
        }));

        // a task failing right away closes the connection; its close sequence
        // takes this lock, so the handles are always stored before it looks
        let mut tasks = conn.0.tasks.lock();
        let id = conn.id();
        let receive = tokio::spawn(OWNER.scope(
            id,
            conn.clone().receive_loop(reader, config.read_buffer_size),
        ));
        let assemble = tokio::spawn(OWNER.scope(id, conn.clone().assemble_loop()));
        let send = tokio::spawn(OWNER.scope(id, conn.clone().send_loop(writer)));
        *tasks = Some(ConnectionTasks {
            receive,
            assemble,
            send,
        });
        drop(tasks);

        debug!(peer = %remote_addr, side = ?side, "connection started");
        Ok(conn)
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    fn is_own_task(&self) -> bool {
        OWNER.try_with(|owner| *owner == self.id()).unwrap_or(false)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.0.remote_addr
    }

    pub fn side(&self) -> ConnectionSide {
        self.0.side
    }

    pub fn state(&self) -> LifecycleState {
        self.0.state.load()
    }

    /// True from the moment a close sequence has started.
    pub fn is_closing(&self) -> bool {
        self.state() != LifecycleState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LifecycleState::Closed
    }

    /// Resolves once the close sequence has joined every connection task.
    pub async fn closed(&self) {
        self.0.closed.cancelled().await
    }

    /// Queues `message` for sending, waiting while the outbound queue is full.
    ///
    /// A no-op on a closing connection; a wait in progress is abandoned as
    /// soon as the connection starts closing. Payloads above the frame limit
    /// are dropped with a warning.
    pub async fn write(&self, message: Bytes) {
        if self.is_closing() {
            return;
        }
        if message.len() > self.0.max_frame_size {
            warn!(
                peer = %self.0.remote_addr,
                "dropping outbound message of {} bytes, limit is {}",
                message.len(),
                self.0.max_frame_size
            );
            return;
        }
        tokio::select! {
            _ = self.0.cancel.cancelled() => {}
            _ = self.0.outbound_tx.send(message) => {}
        }
    }

    /// Non-waiting [`FramedConnection::write`]; false when the message was
    /// not queued.
    pub fn try_write(&self, message: Bytes) -> bool {
        if self.is_closing() || message.len() > self.0.max_frame_size {
            return false;
        }
        self.0.outbound_tx.try_send(message).is_ok()
    }

    /// Closes the connection. Only the first call runs the close sequence
    /// and returns after the close handler; concurrent callers return once
    /// [`FramedConnection::closed`] fires, possibly before that handler ends.
    ///
    /// Called from one of the connection's own tasks, the sequence is moved
    /// to a fresh task and this returns immediately, since the sequence joins
    /// those tasks.
    pub async fn close(&self) {
        let first = self
            .0
            .state
            .compare_exchange(LifecycleState::Open, LifecycleState::Closing)
            .is_ok();
        if self.is_own_task() {
            if first {
                let conn = self.clone();
                tokio::spawn(async move { conn.run_close_sequence().await });
            }
            return;
        }
        if first {
            self.run_close_sequence().await;
        } else {
            self.closed().await;
        }
    }

    async fn run_close_sequence(&self) {
        debug!(peer = %self.0.remote_addr, side = ?self.0.side, "closing connection");
        // the receive and send tasks drop their stream halves on cancel
        self.0.cancel.cancel();

        self.0.inbound_rx.close();
        self.0.outbound_rx.close();
        while self.0.inbound_rx.try_recv().is_ok() {}
        let mut discarded = 0usize;
        while self.0.outbound_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(peer = %self.0.remote_addr, "discarded {} unsent messages", discarded);
        }

        let tasks = self.0.tasks.lock().take();
        if let Some(tasks) = tasks {
            let (receive, assemble, send) = tokio::join!(tasks.receive, tasks.assemble, tasks.send);
            for result in [receive, assemble, send] {
                if let Err(e) = result {
                    warn!(peer = %self.0.remote_addr, "connection task failed: {}", e);
                }
            }
        }

        self.0.state.store(LifecycleState::Closed);
        self.0.closed.cancel();
        self.0.handler.on_close(self).await;
        debug!(peer = %self.0.remote_addr, side = ?self.0.side, "connection closed");
    }

    async fn receive_loop(self, mut reader: OwnedReadHalf, read_buffer_size: usize) {
        let mut buf = vec![0u8; read_buffer_size];
        loop {
            let read = tokio::select! {
                _ = self.0.cancel.cancelled() => return,
                read = reader.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => {
                    // let the assemble task deliver what is queued, it closes after
                    trace!(peer = %self.0.remote_addr, "peer closed the stream");
                    self.0.inbound_tx.close();
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(peer = %self.0.remote_addr, "read failed: {}", e);
                    self.close().await;
                    return;
                }
            };
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            tokio::select! {
                _ = self.0.cancel.cancelled() => return,
                sent = self.0.inbound_tx.send(chunk) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn assemble_loop(self) {
        let mut assembler = FrameAssembler::new(self.0.max_frame_size);
        while let Ok(chunk) = self.0.inbound_rx.recv().await {
            assembler.push(&chunk);
            loop {
                if self.is_closing() {
                    return;
                }
                match assembler.next_frame() {
                    Ok(Some(payload)) => {
                        tokio::select! {
                            _ = self.0.cancel.cancelled() => return,
                            _ = self.0.handler.on_message(&self, payload) => {}
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %self.0.remote_addr, "framing violation: {}", e);
                        self.close().await;
                        return;
                    }
                }
            }
        }
        // the queue only closes on its own after the peer hung up
        if !self.is_closing() {
            if assembler.buffered() > 0 {
                debug!(
                    peer = %self.0.remote_addr,
                    "peer hung up with {} bytes of an unfinished frame",
                    assembler.buffered()
                );
            }
            self.close().await;
        }
    }

    async fn send_loop(self, writer: OwnedWriteHalf) {
        let mut writer = BufWriter::new(writer);
        let mut frame = BytesMut::new();
        loop {
            let message = tokio::select! {
                _ = self.0.cancel.cancelled() => break,
                message = self.0.outbound_rx.recv() => match message {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            frame.clear();
            if let Err(e) = encode_frame(&message, &mut frame) {
                warn!(peer = %self.0.remote_addr, "dropping outbound message: {}", e);
                continue;
            }
            let flush = self.0.outbound_rx.is_empty();
            let written = tokio::select! {
                _ = self.0.cancel.cancelled() => break,
                written = write_frame(&mut writer, &frame, flush) => written,
            };
            if let Err(e) = written {
                debug!(peer = %self.0.remote_addr, "write failed: {}", e);
                self.close().await;
                break;
            }
        }
        let _ = writer.get_mut().shutdown().await;
    }
}

async fn write_frame(
    writer: &mut BufWriter<OwnedWriteHalf>,
    frame: &[u8],
    flush: bool,
) -> io::Result<()> {
    writer.write_all(frame).await?;
    if flush {
        writer.flush().await?;
    }
    Ok(())
}

impl PartialEq for FramedConnection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for FramedConnection {}

impl Hash for FramedConnection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for FramedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedConnection")
            .field("side", &self.0.side)
            .field("remote_addr", &self.0.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}
