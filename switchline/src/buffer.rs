//! Byte buffer for scatter/gather I/O.
//!
//! An ordered queue of slices with O(1) front drain and O(1) slice
//! transfer between buffers. Writers reserve space, fill a prefix, and
//! commit exactly the bytes they produced; readers see the committed
//! slices in order. Each buffer is exclusively owned by one logical
//! endpoint (a connection's read side, a connection's write side, or a
//! stream's decoding buffer).

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};

use bytes::{Bytes, BytesMut};

/// Ordered byte queue backed by a list of slices.
///
/// `length()` always equals the sum of the readable slice lengths;
/// reserved-but-uncommitted space is never visible to readers.
#[derive(Debug, Default)]
pub struct Buffer {
    slices: VecDeque<Bytes>,
    tail: BytesMut,
    length: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::default()
    }

    /// Total readable bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Append a copy of `data`.
    pub fn add(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.slices.push_back(Bytes::copy_from_slice(data));
        self.length += data.len();
    }

    /// Append an owned slice without copying.
    pub fn add_bytes(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.length += data.len();
        self.slices.push_back(data);
    }

    /// Move all of `src`'s bytes into this buffer. Slice ownership is
    /// transferred; no bytes are copied. Afterwards `src` is empty.
    pub fn move_from(&mut self, src: &mut Buffer) {
        self.length += src.length;
        self.slices.append(&mut src.slices);
        src.length = 0;
    }

    /// Move up to `n` bytes from the front of `src` into this buffer.
    pub fn move_from_limit(&mut self, src: &mut Buffer, n: usize) {
        let mut remaining = n.min(src.length);
        while remaining > 0 {
            let front = src.slices.front_mut().expect("length tracks slices");
            if front.len() <= remaining {
                let slice = src.slices.pop_front().expect("checked front");
                remaining -= slice.len();
                src.length -= slice.len();
                self.length += slice.len();
                self.slices.push_back(slice);
            } else {
                let head = front.split_to(remaining);
                src.length -= remaining;
                self.length += remaining;
                self.slices.push_back(head);
                remaining = 0;
            }
        }
    }

    /// Drop `n` bytes from the front.
    pub fn drain(&mut self, n: usize) {
        let mut remaining = n.min(self.length);
        self.length -= remaining;
        while remaining > 0 {
            let front = self.slices.front_mut().expect("length tracks slices");
            if front.len() <= remaining {
                remaining -= front.len();
                self.slices.pop_front();
            } else {
                front.advance_front(remaining);
                remaining = 0;
            }
        }
    }

    /// Reserve `n` writable bytes. The returned slice is valid until
    /// [`commit`](Self::commit); committing publishes a prefix of it.
    pub fn reserve(&mut self, n: usize) -> &mut [u8] {
        self.tail.clear();
        self.tail.resize(n, 0);
        &mut self.tail[..]
    }

    /// Publish the first `written` bytes of the current reservation.
    pub fn commit(&mut self, written: usize) {
        debug_assert!(written <= self.tail.len());
        let written = written.min(self.tail.len());
        if written > 0 {
            let slice = self.tail.split_to(written).freeze();
            self.length += slice.len();
            self.slices.push_back(slice);
        }
        self.tail.clear();
    }

    /// Readable slices in order.
    pub fn slices(&self) -> impl Iterator<Item = &[u8]> {
        self.slices.iter().map(|s| s.as_ref())
    }

    /// Coalesce the first `n` bytes into a single slice and return it.
    pub fn linearize(&mut self, n: usize) -> &[u8] {
        let n = n.min(self.length);
        if n == 0 {
            return &[];
        }
        if self.slices[0].len() < n {
            let mut flat = BytesMut::with_capacity(n);
            while flat.len() < n {
                let front = self.slices.front_mut().expect("length tracks slices");
                let take = front.len().min(n - flat.len());
                flat.extend_from_slice(&front[..take]);
                if take == front.len() {
                    self.slices.pop_front();
                } else {
                    front.advance_front(take);
                }
            }
            self.slices.push_front(flat.freeze());
        }
        &self.slices[0][..n]
    }

    /// Coalesce everything into a single slice and return it.
    pub fn linearize_all(&mut self) -> &[u8] {
        self.linearize(self.length)
    }

    /// Index of the first occurrence of `needle` at or after `start`, or
    /// None. The scan crosses slice boundaries.
    pub fn search(&self, needle: &[u8], start: usize) -> Option<usize> {
        if needle.is_empty() {
            return Some(start.min(self.length));
        }
        if self.length < needle.len() {
            return None;
        }
        let mut flat_cursor = FlatCursor::new(&self.slices);
        for pos in start..=self.length - needle.len() {
            if flat_cursor.matches_at(pos, needle) {
                return Some(pos);
            }
        }
        None
    }

    /// Read once from `r` into a fresh reservation of up to `max` bytes.
    pub fn read_from(&mut self, r: &mut impl Read, max: usize) -> io::Result<usize> {
        let slice = self.reserve(max);
        match r.read(slice) {
            Ok(n) => {
                self.commit(n);
                Ok(n)
            }
            Err(e) => {
                self.commit(0);
                Err(e)
            }
        }
    }

    /// Write the readable slices to `w` with one vectored call and drain
    /// what was written.
    pub fn write_to(&mut self, w: &mut impl Write) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let iov: Vec<IoSlice> = self.slices.iter().map(|s| IoSlice::new(s)).collect();
        let n = w.write_vectored(&iov)?;
        self.drain(n);
        Ok(n)
    }

    /// Copy out all readable bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length);
        for slice in &self.slices {
            out.extend_from_slice(slice);
        }
        out
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Buffer {
        Buffer {
            slices: self.slices.clone(),
            tail: BytesMut::new(),
            length: self.length,
        }
    }
}

trait AdvanceFront {
    fn advance_front(&mut self, n: usize);
}

impl AdvanceFront for Bytes {
    fn advance_front(&mut self, n: usize) {
        let _ = self.split_to(n);
    }
}

/// Byte-addressed view over a slice list with a memoized cursor, so a
/// forward scan stays linear.
struct FlatCursor<'a> {
    slices: &'a VecDeque<Bytes>,
    slice_idx: usize,
    slice_base: usize,
}

impl<'a> FlatCursor<'a> {
    fn new(slices: &'a VecDeque<Bytes>) -> FlatCursor<'a> {
        FlatCursor {
            slices,
            slice_idx: 0,
            slice_base: 0,
        }
    }

    fn byte_at(&mut self, pos: usize) -> u8 {
        if pos < self.slice_base {
            self.slice_idx = 0;
            self.slice_base = 0;
        }
        loop {
            let slice = &self.slices[self.slice_idx];
            if pos < self.slice_base + slice.len() {
                return slice[pos - self.slice_base];
            }
            self.slice_base += slice.len();
            self.slice_idx += 1;
        }
    }

    fn matches_at(&mut self, pos: usize, needle: &[u8]) -> bool {
        needle
            .iter()
            .enumerate()
            .all(|(i, &b)| self.byte_at(pos + i) == b)
    }
}
