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

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::network::{ConnectionHandler, ConnectionRegistry, FramedConnection, HandlerFuture};
use crate::service::ConnectionConfig;
use crate::{AppError, AppResult};

/// Receives every frame a bound backend sends, together with the principal
/// the backend is bound to.
pub trait ResponseHandler: Send + Sync + 'static {
    fn on_response<'a>(&'a self, principal: &'a FramedConnection, payload: Bytes)
        -> HandlerFuture<'a>;
}

/// Writes backend frames back to the bound principal unchanged.
#[derive(Debug, Default)]
pub struct ForwardToPrincipal;

impl ResponseHandler for ForwardToPrincipal {
    fn on_response<'a>(
        &'a self,
        principal: &'a FramedConnection,
        payload: Bytes,
    ) -> HandlerFuture<'a> {
        Box::pin(principal.write(payload))
    }
}

struct ProxyTarget {
    address: String,
    response_handler: Arc<dyn ResponseHandler>,
}

#[derive(Default)]
struct ProxyState {
    idle: HashSet<FramedConnection>,
    /// principal -> backend
    forward: HashMap<FramedConnection, FramedConnection>,
    /// backend -> principal
    reverse: HashMap<FramedConnection, FramedConnection>,
    closed: bool,
}

impl ProxyState {
    fn take_idle(&mut self) -> Option<FramedConnection> {
        loop {
            let backend = self.idle.iter().next().cloned()?;
            self.idle.remove(&backend);
            // closing backends leave through on_backend_closed shortly
            if !backend.is_closing() {
                return Some(backend);
            }
        }
    }

    fn bind(&mut self, principal: FramedConnection, backend: FramedConnection) {
        self.reverse.insert(backend.clone(), principal.clone());
        self.forward.insert(principal, backend);
    }
}

struct ProxyInner {
    connection_config: ConnectionConfig,
    target: OnceLock<ProxyTarget>,
    state: Mutex<ProxyState>,
    backends: ConnectionRegistry,
    dialed: AtomicUsize,
}

/// Multiplexes principals over a pool of backend connections to one fixed
/// address.
///
/// A backend is either idle or bound to exactly one principal. Binding takes
/// an idle backend or, with none left, dials a new one; recycling returns it
/// to the idle set with the connection still open. The state lock is never
/// held across a dial or a write.
#[derive(Clone)]
pub struct Proxy(Arc<ProxyInner>);

impl Proxy {
    pub fn new(connection_config: ConnectionConfig) -> Self {
        Proxy(Arc::new(ProxyInner {
            connection_config,
            target: OnceLock::new(),
            state: Mutex::new(ProxyState::default()),
            backends: ConnectionRegistry::new(),
            dialed: AtomicUsize::new(0),
        }))
    }

    /// Dials `initial_count` idle backends to `address`. Individual dial
    /// failures are logged; returns how many backends were established.
    pub async fn connect(
        &self,
        address: &str,
        initial_count: usize,
        response_handler: Arc<dyn ResponseHandler>,
    ) -> AppResult<usize> {
        self.0
            .target
            .set(ProxyTarget {
                address: address.to_string(),
                response_handler,
            })
            .map_err(|_| AppError::IllegalStateError("proxy is already connected".to_string()))?;

        let mut established = 0;
        for _ in 0..initial_count {
            let backend = match self.dial_backend().await {
                Ok(backend) => backend,
                Err(err) => {
                    warn!("failed to establish backend connection: {}", err);
                    continue;
                }
            };
            let pooled = {
                let mut state = self.0.state.lock();
                if state.closed {
                    false
                } else {
                    if !backend.is_closing() {
                        state.idle.insert(backend.clone());
                        established += 1;
                    }
                    true
                }
            };
            if !pooled {
                backend.close().await;
                return Err(AppError::NoBackendAvailable("proxy is closed".to_string()));
            }
        }
        info!(
            "proxy made {} idle connections to {}",
            established, address
        );
        Ok(established)
    }

    fn target(&self) -> AppResult<&ProxyTarget> {
        self.0
            .target
            .get()
            .ok_or_else(|| AppError::IllegalStateError("proxy is not connected".to_string()))
    }

    async fn dial_backend(&self) -> AppResult<FramedConnection> {
        let target = self.target()?;
        let handler = Arc::new(BackendHandler {
            proxy: Arc::downgrade(&self.0),
        });
        let backend =
            FramedConnection::dial(&target.address, &self.0.connection_config, handler).await?;
        self.0.dialed.fetch_add(1, Ordering::Relaxed);
        self.0.backends.add(backend.clone());
        if backend.is_closing() {
            self.0.backends.remove(&backend);
        }
        Ok(backend)
    }

    /// The backend bound to `principal`, binding one first when needed.
    pub async fn bind_if_needed(&self, principal: &FramedConnection) -> AppResult<FramedConnection> {
        {
            let mut state = self.0.state.lock();
            if state.closed {
                return Err(AppError::NoBackendAvailable("proxy is closed".to_string()));
            }
            if let Some(backend) = state.forward.get(principal) {
                return Ok(backend.clone());
            }
            if let Some(backend) = state.take_idle() {
                state.bind(principal.clone(), backend.clone());
                return Ok(backend);
            }
        }

        let backend = self.dial_backend().await?;
        info!(
            principal = %principal.remote_addr(),
            "idle set empty, dialed an extra backend connection"
        );

        let bound = {
            let mut state = self.0.state.lock();
            if state.closed {
                None
            } else if backend.is_closing() {
                return Err(AppError::ConnectionClosed);
            } else if let Some(bound) = state.forward.get(principal).cloned() {
                // bound concurrently, keep the new one for later
                state.idle.insert(backend.clone());
                Some(bound)
            } else {
                state.bind(principal.clone(), backend.clone());
                Some(backend.clone())
            }
        };
        match bound {
            Some(bound) => Ok(bound),
            None => {
                backend.close().await;
                Err(AppError::NoBackendAvailable("proxy is closed".to_string()))
            }
        }
    }

    /// Sends `payload` to the backend bound to `principal`.
    pub async fn forward(&self, principal: &FramedConnection, payload: Bytes) -> AppResult<()> {
        let backend = self.bind_if_needed(principal).await?;
        backend.write(payload).await;
        Ok(())
    }

    /// Routes a backend frame to its principal through the response handler.
    /// Empty keep-alive frames are dropped.
    pub async fn on_backend_frame(&self, backend: &FramedConnection, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        let principal = self.0.state.lock().reverse.get(backend).cloned();
        let principal = match principal {
            Some(principal) => principal,
            None => {
                warn!(
                    backend = %backend.remote_addr(),
                    "dropping {} bytes from an unbound backend",
                    payload.len()
                );
                return;
            }
        };
        if let Ok(target) = self.target() {
            target.response_handler.on_response(&principal, payload).await;
        }
    }

    /// Unbinds `principal`, returning its backend to the idle set. False when
    /// nothing was bound.
    pub fn recycle(&self, principal: &FramedConnection) -> bool {
        let mut state = self.0.state.lock();
        let backend = match state.forward.remove(principal) {
            Some(backend) => backend,
            None => return false,
        };
        state.reverse.remove(&backend);
        if !backend.is_closing() && !state.closed {
            state.idle.insert(backend);
        }
        debug!(principal = %principal.remote_addr(), "recycled backend connection");
        true
    }

    /// Drops every trace of a backend whose stream is gone.
    pub fn on_backend_closed(&self, backend: &FramedConnection) {
        self.0.backends.remove(backend);
        let mut state = self.0.state.lock();
        state.idle.remove(backend);
        if let Some(principal) = state.reverse.remove(backend) {
            state.forward.remove(&principal);
            debug!(
                principal = %principal.remote_addr(),
                "backend connection lost, principal unbound"
            );
        }
    }

    pub fn has_principal(&self, principal: &FramedConnection) -> bool {
        self.0.state.lock().forward.contains_key(principal)
    }

    pub fn idle_count(&self) -> usize {
        self.0.state.lock().idle.len()
    }

    pub fn bound_count(&self) -> usize {
        self.0.state.lock().forward.len()
    }

    /// Backends currently open, idle or bound.
    pub fn backend_count(&self) -> usize {
        self.0.backends.size()
    }

    /// Backends dialed successfully since creation.
    pub fn dial_count(&self) -> usize {
        self.0.dialed.load(Ordering::Relaxed)
    }

    /// Closes every bound and idle backend. Later bindings fail.
    pub async fn close(&self) {
        {
            let mut state = self.0.state.lock();
            state.closed = true;
            state.idle.clear();
            state.forward.clear();
            state.reverse.clear();
        }
        self.0.backends.close_all().await;
        info!("proxy closed");
    }
}

// backends must not keep the proxy alive
struct BackendHandler {
    proxy: Weak<ProxyInner>,
}

impl ConnectionHandler for BackendHandler {
    fn on_message<'a>(&'a self, conn: &'a FramedConnection, payload: Bytes) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let Some(inner) = self.proxy.upgrade() {
                Proxy(inner).on_backend_frame(conn, payload).await;
            }
        })
    }

    fn on_close<'a>(&'a self, conn: &'a FramedConnection) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let Some(inner) = self.proxy.upgrade() {
                Proxy(inner).on_backend_closed(conn);
            }
        })
    }
}
