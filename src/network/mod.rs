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

//! Framed TCP transport.
//!
//! Every message travels as a 4-byte big-endian length followed by that many
//! payload bytes. There is no handshake, magic or version field, and a
//! zero-length payload is a valid frame.
//!
//! # Components
//!
//! - `StreamBuffer`: byte accumulation with a read cursor and an undo mark
//! - `FrameAssembler`: cuts arbitrarily chunked stream data into frames
//! - `FramedConnection`: one socket with its receive, assemble and send tasks,
//!   shared by the dialing and the accepting side
//! - `ConnectionRegistry`: the set of live connections with broadcast and
//!   close-all

pub use connection::{
    ConnectionHandler, ConnectionSide, FramedConnection, HandlerFuture, LifecycleState,
};
pub use frame::{encode_frame, FrameAssembler, DEFAULT_MAX_FRAME_SIZE, LENGTH_FIELD_SIZE};
pub use registry::ConnectionRegistry;
pub use stream_buffer::StreamBuffer;

mod connection;
mod frame;
mod registry;
mod stream_buffer;
