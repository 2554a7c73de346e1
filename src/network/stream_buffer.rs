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

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// Byte accumulation buffer with a read cursor and a single undo mark.
///
/// Every successful read remembers the cursor position it started from, so
/// [`StreamBuffer::undo`] rolls back exactly one read. This is what lets the
/// frame assembler read a length prefix, find that the payload has not fully
/// arrived, and re-read the same prefix once more data is appended.
///
/// Reads never go past the written end: a read that needs more bytes than are buffered
/// returns [`AppError::Incomplete`] and leaves both cursor and mark untouched.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    buf: BytesMut,
    cursor: usize,
    mark: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.buf.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The unread bytes, without consuming them.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.cursor..]
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Rolls the cursor back to where the last read started.
    pub fn undo(&mut self) {
        self.cursor = self.mark;
    }

    /// Rewinds to the start of the retained data, clearing the mark.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.mark = 0;
    }

    /// Drops everything, read or not.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.cursor = 0;
        self.mark = 0;
    }

    /// Releases the already consumed prefix. The undo history is lost, so
    /// only call this at a boundary you will never roll back over.
    pub fn reclaim(&mut self) {
        if self.cursor == 0 {
            return;
        }
        if self.cursor == self.buf.len() {
            self.buf.clear();
        } else {
            self.buf.advance(self.cursor);
        }
        self.cursor = 0;
        self.mark = 0;
    }

    fn take(&mut self, n: usize) -> AppResult<&[u8]> {
        if self.len() < n {
            return Err(AppError::Incomplete);
        }
        let start = self.cursor;
        self.mark = start;
        self.cursor += n;
        Ok(&self.buf[start..start + n])
    }

    pub fn read_u8(&mut self) -> AppResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> AppResult<u32> {
        let mut field = self.take(4)?;
        Ok(field.get_u32())
    }

    pub fn read_i32(&mut self) -> AppResult<i32> {
        let mut field = self.take(4)?;
        Ok(field.get_i32())
    }

    pub fn read_u64(&mut self) -> AppResult<u64> {
        let mut field = self.take(8)?;
        Ok(field.get_u64())
    }

    pub fn read_f32(&mut self) -> AppResult<f32> {
        let mut field = self.take(4)?;
        Ok(field.get_f32())
    }

    pub fn read_f64(&mut self) -> AppResult<f64> {
        let mut field = self.take(8)?;
        Ok(field.get_f64())
    }

    /// Reads exactly `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> AppResult<Bytes> {
        self.take(n).map(Bytes::copy_from_slice)
    }

    /// Reads up to the next `\n`, which is consumed but not returned. Without
    /// a newline the remaining bytes form the line.
    pub fn read_line(&mut self) -> AppResult<String> {
        if self.is_empty() {
            return Err(AppError::Incomplete);
        }
        let unread = self.bytes();
        let (line_len, consumed) = match unread.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos, pos + 1),
            None => (unread.len(), unread.len()),
        };
        let line = self.take(consumed)?;
        Ok(String::from_utf8_lossy(&line[..line_len]).into_owned())
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    pub fn write_line(&mut self, line: &str) {
        self.buf.put_slice(line.as_bytes());
        self.buf.put_u8(b'\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_primitives() {
        let mut buffer = StreamBuffer::new();
        buffer.write_u8(7);
        buffer.write_u32(0xDEAD_BEEF);
        buffer.write_i32(-42);
        buffer.write_u64(u64::MAX - 1);
        buffer.write_f32(1.5);
        buffer.write_f64(-0.25);

        assert_eq!(buffer.read_u8().unwrap(), 7);
        assert_eq!(buffer.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(buffer.read_i32().unwrap(), -42);
        assert_eq!(buffer.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(buffer.read_f32().unwrap(), 1.5);
        assert_eq!(buffer.read_f64().unwrap(), -0.25);
        assert!(buffer.is_empty());
    }

    #[test]
    fn integers_are_big_endian() {
        let mut buffer = StreamBuffer::new();
        buffer.write_u32(5);
        assert_eq!(buffer.bytes(), &[0, 0, 0, 5]);
    }

    #[test]
    fn undo_rolls_back_the_last_read_only() {
        let mut buffer = StreamBuffer::new();
        buffer.write_u32(1);
        buffer.write_u32(2);

        assert_eq!(buffer.read_u32().unwrap(), 1);
        assert_eq!(buffer.read_u32().unwrap(), 2);
        buffer.undo();
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.read_u32().unwrap(), 2);
    }

    #[test]
    fn underrun_is_incomplete_and_keeps_state() {
        let mut buffer = StreamBuffer::new();
        buffer.append(&[0, 0]);
        assert!(matches!(buffer.read_u32(), Err(AppError::Incomplete)));
        assert_eq!(buffer.len(), 2);

        buffer.append(&[0, 9]);
        assert_eq!(buffer.read_u32().unwrap(), 9);
    }

    #[test]
    fn read_bytes_beyond_end_is_rejected() {
        let mut buffer = StreamBuffer::new();
        buffer.append(b"abc");
        assert!(matches!(buffer.read_bytes(4), Err(AppError::Incomplete)));
        assert_eq!(buffer.read_bytes(3).unwrap().as_ref(), b"abc");
        assert!(matches!(buffer.read_u8(), Err(AppError::Incomplete)));
    }

    #[test]
    fn lines_with_and_without_terminator() {
        let mut buffer = StreamBuffer::new();
        buffer.write_line("first");
        buffer.append(b"tail");

        assert_eq!(buffer.read_line().unwrap(), "first");
        assert_eq!(buffer.read_line().unwrap(), "tail");
        assert!(matches!(buffer.read_line(), Err(AppError::Incomplete)));
    }

    #[test]
    fn reclaim_keeps_unread_bytes() {
        let mut buffer = StreamBuffer::new();
        buffer.append(b"xxhello");
        buffer.read_bytes(2).unwrap();
        buffer.reclaim();

        assert_eq!(buffer.bytes(), b"hello");
        // the mark now points at the new start
        buffer.undo();
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn reset_and_clear() {
        let mut buffer = StreamBuffer::new();
        buffer.append(b"data");
        buffer.read_bytes(4).unwrap();
        buffer.reset();
        assert_eq!(buffer.len(), 4);

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.bytes().is_empty());
    }
}
