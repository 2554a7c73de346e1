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
use std::sync::Arc;

use tokio::{runtime, signal};
use tracing::{error, info, warn};

use crate::proxy::{ForwardToPrincipal, Proxy, ProxyProcessor};
use crate::{AppError, AppResult};

use super::config::GatewayConfig;
use super::context::Lifecycle;
use super::listener::Listener;
use super::server::{EchoProcessor, FrameProcessor, Server};

/// Composition root of the `wirepool` binary: a framed echo server, or a
/// framed proxy when `[proxy].enabled` is set.
pub struct Gateway {
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Gateway { config }
    }

    /// Builds the runtime and serves until Ctrl-C.
    pub fn start(&self) -> AppResult<()> {
        let rt = runtime::Builder::new_multi_thread()
            .worker_threads(self.config.worker_threads())
            .enable_all()
            .build()?;
        rt.block_on(self.run(async {
            if let Err(err) = signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {}", err);
            }
        }))
    }

    /// Serves until `shutdown_signal` resolves or the server stops on its
    /// own, then shuts everything down: stop accepting, close the tokens,
    /// close the proxy backends, wait for tracked tasks.
    pub async fn run<F>(&self, shutdown_signal: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        let lifecycle = Lifecycle::new();
        let context = lifecycle.context();

        let listener = Listener::bind(
            &self.config.listen_address(),
            self.config.network.max_connection,
        )
        .await?;

        let (processor, proxy): (Arc<dyn FrameProcessor>, Option<Proxy>) =
            if self.config.proxy.enabled {
                let proxy = Proxy::new(self.config.connection.clone());
                proxy
                    .connect(
                        &self.config.proxy.backend_address,
                        self.config.proxy.initial_connections,
                        Arc::new(ForwardToPrincipal),
                    )
                    .await?;
                (Arc::new(ProxyProcessor::new(proxy.clone())), Some(proxy))
            } else {
                (Arc::new(EchoProcessor), None)
            };

        let server = Server::new(
            listener,
            processor,
            self.config.connection.clone(),
            self.config.keepalive_interval(),
            context.clone(),
        );
        let server_task = context
            .spawn(async move { server.run().await })
            .ok_or_else(|| AppError::IllegalStateError("lifecycle already shut down".to_string()))?;

        tokio::select! {
            _ = shutdown_signal => {
                info!("get shutdown signal");
            }
            res = server_task => {
                match res {
                    Ok(Ok(())) => warn!("server stopped before the shutdown signal"),
                    Ok(Err(err)) => error!(cause = %err, "server stopped"),
                    Err(err) => error!("server task failed: {}", err),
                }
            }
        }

        lifecycle.shutdown().await;
        if let Some(proxy) = proxy {
            proxy.close().await;
        }
        info!("gateway shutdown complete");
        Ok(())
    }
}
