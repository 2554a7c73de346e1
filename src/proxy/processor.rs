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

use bytes::Bytes;
use tracing::warn;

use super::Proxy;
use crate::network::{FramedConnection, HandlerFuture};
use crate::service::FrameProcessor;

/// Server-side processor that relays every token frame through a [`Proxy`].
///
/// A token whose frame cannot be forwarded is closed. Its disconnect puts
/// the bound backend back into the idle set.
#[derive(Clone)]
pub struct ProxyProcessor {
    proxy: Proxy,
}

impl ProxyProcessor {
    pub fn new(proxy: Proxy) -> Self {
        ProxyProcessor { proxy }
    }
}

impl FrameProcessor for ProxyProcessor {
    fn process<'a>(&'a self, token: &'a FramedConnection, payload: Bytes) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let Err(err) = self.proxy.forward(token, payload).await {
                warn!(principal = %token.remote_addr(), "forward failed, closing: {}", err);
                token.close().await;
            }
        })
    }

    fn on_disconnect<'a>(&'a self, token: &'a FramedConnection) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.proxy.recycle(token);
        })
    }
}
