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

//! Principal-to-backend multiplexing.
//!
//! Inbound principals borrow a backend connection from an idle pool for as
//! long as they stay connected. Frames flow principal -> backend through
//! [`Proxy::forward`] and backend -> principal through a [`ResponseHandler`].

pub use multiplexer::{ForwardToPrincipal, Proxy, ResponseHandler};
pub use processor::ProxyProcessor;

mod multiplexer;
mod processor;
