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

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use super::{AppError, AppResult, Shutdown};

/// Capacity held by one accepted connection. Dropping it, or calling
/// [`ConnectionSlot::release`], gives the capacity back to the listener.
#[derive(Debug)]
pub struct ConnectionSlot {
    _permit: OwnedSemaphorePermit,
}

impl ConnectionSlot {
    pub fn release(self) {}
}

/// TCP listener with a global cap on concurrently open inbound connections.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    pub async fn bind(address: &str, max_connections: usize) -> AppResult<Listener> {
        let listener = TcpListener::bind(address).await.map_err(|err| {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                address, err
            );
            error!("{}", error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        info!("tcp server binding to {} for listening", address);
        Ok(Listener {
            listener,
            limit_connections: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn available_slots(&self) -> usize {
        self.limit_connections.available_permits()
    }

    /// Waits for a free slot, then for the next inbound stream.
    pub async fn accept(&self) -> AppResult<(TcpStream, ConnectionSlot)> {
        let permit = self
            .limit_connections
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::IllegalStateError("connection limiter closed".to_string()))?;
        let stream = self.accept_with_backoff().await?;
        Ok((stream, ConnectionSlot { _permit: permit }))
    }

    /// Hands every accepted stream to `on_accept` until `shutdown` fires.
    /// Returns an error only when accepting keeps failing.
    pub async fn accept_loop<F>(&self, mut shutdown: Shutdown, mut on_accept: F) -> AppResult<()>
    where
        F: FnMut(TcpStream, ConnectionSlot),
    {
        loop {
            let (stream, slot) = tokio::select! {
                accepted = self.accept() => accepted?,
                _ = shutdown.recv() => {
                    debug!("listener exit accept loop after recv shutdown signal");
                    return Ok(());
                }
            };
            on_accept(stream, slot);
        }
    }

    async fn accept_with_backoff(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, peer)) => {
                    debug!(peer = %peer, "accept new connection");
                    return Ok(socket);
                }
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    warn!("accept failed, retry in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_blocks_at_the_cap_until_a_slot_is_released() {
        let listener = Listener::bind("127.0.0.1:0", 1).await.unwrap();
        let address = listener.local_addr().unwrap();
        let _first = TcpStream::connect(address).await.unwrap();
        let _second = TcpStream::connect(address).await.unwrap();

        let (_stream, slot) = listener.accept().await.unwrap();
        assert_eq!(listener.available_slots(), 0);
        assert!(
            time::timeout(Duration::from_millis(100), listener.accept())
                .await
                .is_err()
        );

        slot.release();
        assert_eq!(listener.available_slots(), 1);
        let (_stream, slot) = time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        drop(slot);
        assert_eq!(listener.available_slots(), listener.max_connections());
    }
}
