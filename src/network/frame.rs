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

use bytes::{BufMut, Bytes, BytesMut};

use super::StreamBuffer;
use crate::{AppError, AppResult};

/// Size of the big-endian length prefix in front of every payload.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Default upper bound of a single payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Appends `[u32 BE length][payload]` to `dst`.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> AppResult<()> {
    let length = u32::try_from(payload.len()).map_err(|_| AppError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(LENGTH_FIELD_SIZE + payload.len());
    dst.put_u32(length);
    dst.put_slice(payload);
    Ok(())
}

/// Reassembles frames out of arbitrarily chunked stream data.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: StreamBuffer,
    max_frame_size: usize,
}

impl FrameAssembler {
    pub fn new(max_frame_size: usize) -> Self {
        FrameAssembler {
            buffer: StreamBuffer::new(),
            max_frame_size,
        }
    }

    /// Bytes buffered but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        // everything before the cursor belongs to frames already handed out
        self.buffer.reclaim();
        self.buffer.append(chunk);
    }

    /// Extracts the next complete frame, `Ok(None)` when more data is needed.
    ///
    /// A length above the configured maximum is a framing violation; the
    /// length field stays buffered so repeated calls report the same error.
    pub fn next_frame(&mut self) -> AppResult<Option<Bytes>> {
        if self.buffer.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }
        let length = self.buffer.read_u32()? as usize;
        if length > self.max_frame_size {
            self.buffer.undo();
            return Err(AppError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }
        match self.buffer.read_bytes(length) {
            Ok(payload) => Ok(Some(payload)),
            Err(AppError::Incomplete) => {
                // a failed read leaves the mark on the length field
                self.buffer.undo();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    fn encoded(payloads: &[&[u8]]) -> BytesMut {
        let mut wire = BytesMut::new();
        for payload in payloads {
            encode_frame(payload, &mut wire).unwrap();
        }
        wire
    }

    fn drain(assembler: &mut FrameAssembler) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = assembler.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn hello_wire_bytes() {
        let wire = encoded(&[b"hello"]);
        assert_eq!(
            wire.as_ref(),
            &[0x00, 0x00, 0x00, 0x05, 0x68, 0x65, 0x6C, 0x6C, 0x6F]
        );
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::one_byte(b"x")]
    #[case::text(b"hello")]
    fn single_frame_round_trips(#[case] payload: &[u8]) {
        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_SIZE);
        assembler.push(&encoded(&[payload]));
        let frames = drain(&mut assembler);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), payload);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn trailing_empty_frame_is_delivered_immediately() {
        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_SIZE);
        assembler.push(&encoded(&[b"ab", b""]));
        let frames = drain(&mut assembler);
        assert_eq!(frames.len(), 2);
        assert!(frames[1].is_empty());
    }

    #[test]
    fn partial_length_field_waits() {
        let wire = encoded(&[b"abc"]);
        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_SIZE);
        assembler.push(&wire[..2]);
        assert!(assembler.next_frame().unwrap().is_none());
        assembler.push(&wire[2..5]);
        assert!(assembler.next_frame().unwrap().is_none());
        assert_eq!(assembler.buffered(), 5);
        assembler.push(&wire[5..]);
        assert_eq!(assembler.next_frame().unwrap().unwrap().as_ref(), b"abc");
    }

    #[test]
    fn oversize_length_is_rejected() {
        let mut assembler = FrameAssembler::new(8);
        assembler.push(&encoded(&[b"0123456789"]));
        assert!(matches!(
            assembler.next_frame(),
            Err(AppError::FrameTooLarge { size: 10, max: 8 })
        ));
        assert!(assembler.next_frame().is_err());
    }

    proptest! {
        #[test]
        fn arbitrary_chunking_preserves_frames(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..16),
            cuts in prop::collection::vec(1usize..32, 0..64),
        ) {
            let refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
            let wire = encoded(&refs);

            let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_SIZE);
            let mut frames = Vec::new();
            let mut offset = 0;
            let mut cuts = cuts.into_iter();
            while offset < wire.len() {
                let step = cuts.next().unwrap_or(wire.len() - offset);
                let end = (offset + step).min(wire.len());
                assembler.push(&wire[offset..end]);
                frames.extend(drain(&mut assembler));
                offset = end;
            }

            prop_assert_eq!(frames.len(), payloads.len());
            for (frame, payload) in frames.iter().zip(payloads.iter()) {
                prop_assert_eq!(frame.as_ref(), payload.as_slice());
            }
            prop_assert_eq!(assembler.buffered(), 0);
        }
    }
}
