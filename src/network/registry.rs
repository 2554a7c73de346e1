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

use std::collections::HashSet;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::debug;

use super::FramedConnection;

/// Thread-safe set of live connections, keyed by connection identity.
///
/// Used as the server's token pool and as the proxy's backend pool. Entries
/// are removed from within close handlers, so nothing here holds the lock
/// while a connection is being closed.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashSet<FramedConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: FramedConnection) {
        self.connections.lock().insert(conn);
    }

    /// Returns false when `conn` was not registered.
    pub fn remove(&self, conn: &FramedConnection) -> bool {
        self.connections.lock().remove(conn)
    }

    pub fn contains(&self, conn: &FramedConnection) -> bool {
        self.connections.lock().contains(conn)
    }

    pub fn size(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<FramedConnection> {
        self.connections.lock().iter().cloned().collect()
    }

    /// Applies `f` to every registered connection while holding the lock.
    ///
    /// `f` must not call back into this registry and must not wait; use
    /// [`FramedConnection::try_write`] to send from here.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&FramedConnection),
    {
        let connections = self.connections.lock();
        for conn in connections.iter() {
            f(conn);
        }
    }

    /// Closes every registered connection concurrently and waits for all of
    /// them. Connections added while this runs are not covered.
    pub async fn close_all(&self) {
        let connections = self.snapshot();
        if connections.is_empty() {
            return;
        }
        debug!("closing {} connections", connections.len());
        let mut closing = JoinSet::new();
        for conn in connections {
            closing.spawn(async move { conn.close().await });
        }
        while closing.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::network::{ConnectionHandler, HandlerFuture};
    use crate::service::ConnectionConfig;

    struct Discard;

    impl ConnectionHandler for Discard {
        fn on_message<'a>(&'a self, _conn: &'a FramedConnection, _payload: Bytes) -> HandlerFuture<'a> {
            Box::pin(async {})
        }
    }

    async fn open_connections(count: usize) -> (Vec<FramedConnection>, Vec<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let mut conns = Vec::new();
        let mut peers = Vec::new();
        for _ in 0..count {
            peers.push(TcpStream::connect(address).await.unwrap());
            let (stream, _) = listener.accept().await.unwrap();
            conns.push(
                FramedConnection::accept(stream, &ConnectionConfig::default(), Arc::new(Discard))
                    .unwrap(),
            );
        }
        (conns, peers)
    }

    #[tokio::test]
    async fn add_remove_and_size() {
        let (conns, _peers) = open_connections(2).await;
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());

        registry.add(conns[0].clone());
        registry.add(conns[0].clone());
        registry.add(conns[1].clone());
        assert_eq!(registry.size(), 2);
        assert!(registry.contains(&conns[1]));

        assert!(registry.remove(&conns[0]));
        assert!(!registry.remove(&conns[0]));
        assert_eq!(registry.size(), 1);

        registry.close_all().await;
        assert!(conns[1].is_closed());
        assert!(!conns[0].is_closed());
        conns[0].close().await;
    }

    #[tokio::test]
    async fn for_each_visits_every_connection_once() {
        let (conns, _peers) = open_connections(5).await;
        let registry = ConnectionRegistry::new();
        for conn in &conns {
            registry.add(conn.clone());
        }

        let mut visited = HashSet::new();
        registry.for_each(|conn| {
            assert!(visited.insert(conn.clone()));
        });
        assert_eq!(visited.len(), 5);

        registry.close_all().await;
        assert!(conns.iter().all(FramedConnection::is_closed));
    }
}
