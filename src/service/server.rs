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

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, error, info, trace};

use crate::network::{ConnectionHandler, ConnectionRegistry, FramedConnection, HandlerFuture};
use crate::AppResult;

use super::config::ConnectionConfig;
use super::context::NetContext;
use super::listener::{ConnectionSlot, Listener};
use super::Shutdown;

/// Application logic behind the server: sees every non-empty frame of every
/// token, and each token's disconnect once.
pub trait FrameProcessor: Send + Sync + 'static {
    fn process<'a>(&'a self, token: &'a FramedConnection, payload: Bytes) -> HandlerFuture<'a>;

    fn on_disconnect<'a>(&'a self, _token: &'a FramedConnection) -> HandlerFuture<'a> {
        Box::pin(async {})
    }
}

/// Writes every frame back to the token it came from.
#[derive(Debug, Default)]
pub struct EchoProcessor;

impl FrameProcessor for EchoProcessor {
    fn process<'a>(&'a self, token: &'a FramedConnection, payload: Bytes) -> HandlerFuture<'a> {
        Box::pin(token.write(payload))
    }
}

// one per accepted token
struct TokenHandler {
    tokens: Arc<ConnectionRegistry>,
    processor: Arc<dyn FrameProcessor>,
    slot: Mutex<Option<ConnectionSlot>>,
}

impl ConnectionHandler for TokenHandler {
    fn on_message<'a>(&'a self, conn: &'a FramedConnection, payload: Bytes) -> HandlerFuture<'a> {
        Box::pin(async move {
            // keep-alive
            if payload.is_empty() {
                return;
            }
            self.processor.process(conn, payload).await;
        })
    }

    fn on_close<'a>(&'a self, conn: &'a FramedConnection) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.tokens.remove(conn);
            if let Some(slot) = self.slot.lock().take() {
                slot.release();
            }
            debug!(peer = %conn.remote_addr(), "token released");
            self.processor.on_disconnect(conn).await;
        })
    }
}

/// Accept loop feeding server-side connections ("tokens") into a registry
/// and their frames into a [`FrameProcessor`].
pub struct Server {
    listener: Listener,
    tokens: Arc<ConnectionRegistry>,
    processor: Arc<dyn FrameProcessor>,
    connection_config: ConnectionConfig,
    keepalive: Option<Duration>,
    context: NetContext,
}

impl Server {
    pub fn new(
        listener: Listener,
        processor: Arc<dyn FrameProcessor>,
        connection_config: ConnectionConfig,
        keepalive: Option<Duration>,
        context: NetContext,
    ) -> Self {
        Server {
            listener,
            tokens: Arc::new(ConnectionRegistry::new()),
            processor,
            connection_config,
            keepalive,
            context,
        }
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        self.listener.local_addr()
    }

    /// Registry of the currently open tokens.
    pub fn tokens(&self) -> Arc<ConnectionRegistry> {
        self.tokens.clone()
    }

    /// Accepts tokens until the shutdown notice, then closes every token.
    ///
    /// Returns an error when accepting keeps failing; the tokens are closed
    /// in that case too.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> AppResult<()> {
        let keepalive = self.keepalive.and_then(|interval| {
            self.context.spawn(keepalive_loop(
                self.tokens.clone(),
                interval,
                self.context.subscribe_shutdown(),
            ))
        });

        let result = self
            .listener
            .accept_loop(self.context.subscribe_shutdown(), |stream, slot| {
                self.register(stream, slot)
            })
            .await;
        if let Err(err) = &result {
            error!(cause = %err, "failed to accept");
        }

        if let Some(keepalive) = keepalive {
            keepalive.abort();
        }
        info!("closing {} tokens", self.tokens.size());
        self.tokens.close_all().await;
        result
    }

    fn register(&self, stream: TcpStream, slot: ConnectionSlot) {
        let handler = Arc::new(TokenHandler {
            tokens: self.tokens.clone(),
            processor: self.processor.clone(),
            slot: Mutex::new(Some(slot)),
        });
        // on failure the handler, and with it the slot, is dropped here
        match FramedConnection::accept(stream, &self.connection_config, handler) {
            Ok(token) => {
                self.tokens.add(token.clone());
                // the token may have closed before it was added
                if token.is_closing() {
                    self.tokens.remove(&token);
                }
                debug!(peer = %token.remote_addr(), "token registered");
            }
            Err(err) => error!("failed to set up accepted connection: {}", err),
        }
    }
}

async fn keepalive_loop(tokens: Arc<ConnectionRegistry>, interval: Duration, mut shutdown: Shutdown) {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {}
        }
        let mut sent = 0usize;
        tokens.for_each(|token| {
            if token.try_write(Bytes::new()) {
                sent += 1;
            }
        });
        trace!("keep-alive sent to {} tokens", sent);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}
