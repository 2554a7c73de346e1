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

use std::future::Future;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::Shutdown;

/// Owner of the process lifecycle: the shutdown notice and the wait for
/// outstanding work.
///
/// Tasks started through [`NetContext::spawn`] each hold a completion
/// sender; [`Lifecycle::shutdown`] broadcasts the notice and then waits for
/// every one of those senders to be dropped.
#[derive(Debug)]
pub struct Lifecycle {
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        Lifecycle {
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
        }
    }

    pub fn context(&self) -> NetContext {
        NetContext {
            notify_shutdown: self.notify_shutdown.clone(),
            shutdown_complete_tx: self.shutdown_complete_tx.downgrade(),
        }
    }

    /// Sends the shutdown notice and waits for all spawned work to finish.
    pub async fn shutdown(self) {
        let Lifecycle {
            notify_shutdown,
            shutdown_complete_tx,
            mut shutdown_complete_rx,
        } = self;
        // no receiver just means nobody is listening
        let _ = notify_shutdown.send(());
        drop(shutdown_complete_tx);
        trace!("waiting for shutdown complete...");
        let _ = shutdown_complete_rx.recv().await;
        debug!("all tracked tasks finished");
    }
}

/// Cheap handle passed to every component that spawns long-lived work or
/// must stop on shutdown.
#[derive(Debug, Clone)]
pub struct NetContext {
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::WeakSender<()>,
}

impl NetContext {
    pub fn subscribe_shutdown(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    /// Spawns `future` as tracked work: [`Lifecycle::shutdown`] does not
    /// return before it completes. `None` once the lifecycle has shut down.
    pub fn spawn<F>(&self, future: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let shutdown_complete_tx = self.shutdown_complete_tx.upgrade()?;
        Some(tokio::spawn(async move {
            let output = future.await;
            drop(shutdown_complete_tx);
            output
        }))
    }
}
