//! Sparse reassembly buffer for partially received byte ranges.
//!
//! A [`SparseBuffer`] covers the window `[base, base + length)` of a remote
//! resource. Bytes may arrive in any order; each write lands in a chunk, and
//! chunks that touch are merged so the buffer always holds the minimum number
//! of disjoint runs.
//!
//! ```text
//!  base                                              base + length
//!   │                                                      │
//!   ▼                                                      ▼
//!   ┌──────────┐      ┌──────────────────┐        ┌────┐
//!   │  chunk   │ gap  │      chunk       │  gap   │chnk│ gap
//!   └──────────┘      └──────────────────┘        └────┘
//! ```
//!
//! Readers walk the buffer with [`SparseBuffer::data_at`], advancing by the
//! length of each returned [`Span`] until they reach [`Span::End`].

use std::collections::BTreeMap;

use crate::range::ByteRange;

/// What a buffer holds at a given offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Span<'a> {
    /// The longest contiguous run of known bytes starting at the offset.
    Data(&'a [u8]),
    /// Unmapped bytes inside the declared length.
    Gap(u64),
    /// The offset lies outside `[base, base + length)`.
    End,
}

impl Span<'_> {
    /// Number of bytes covered by this span (0 for `End`).
    pub fn len(&self) -> u64 {
        match self {
            Span::Data(data) => data.len() as u64,
            Span::Gap(len) => *len,
            Span::End => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Byte store for one transfer direction.
///
/// Chunk keys are offsets relative to `base`, so re-basing never has to
/// rewrite keys; the public API speaks absolute resource offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseBuffer {
    base: u64,
    length: u64,
    open_ended: bool,
    chunks: BTreeMap<u64, Vec<u8>>,
}

impl SparseBuffer {
    /// Creates an empty buffer whose window starts at `base`.
    pub fn new(base: u64) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    /// Creates an empty buffer positioned for a requested range.
    pub fn for_range(range: ByteRange) -> Self {
        Self {
            base: range.start(),
            open_ended: range.goes_to_end(),
            ..Self::default()
        }
    }

    /// Creates a fully mapped buffer holding `data` at `base`.
    pub fn from_bytes(base: u64, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let mut buffer = Self::new(base);
        buffer.length = data.len() as u64;
        if !data.is_empty() {
            buffer.chunks.insert(0, data);
        }
        buffer
    }

    /// First absolute offset of the window.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Declared length of the window (mapped or not).
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Exclusive absolute end of the window.
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    /// True if the window may still grow past its current length.
    pub fn is_open_ended(&self) -> bool {
        self.open_ended
    }

    /// The window as a closed range.
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.base, self.length)
    }

    /// Grows the window to `length` bytes.
    ///
    /// Never truncates: a smaller `length` leaves the extent untouched. The
    /// open-ended flag is always updated. The window never extends past
    /// `u64::MAX`.
    pub fn set_length(&mut self, length: u64, open_ended: bool) {
        self.open_ended = open_ended;
        let length = length.min(u64::MAX - self.base);
        if length > self.length {
            self.length = length;
        }
    }

    /// Moves the window origin to `base`, dropping all data.
    ///
    /// Used when the server answers a partial request with the full resource:
    /// what arrives next starts at a different offset than what was asked for.
    pub fn set_base(&mut self, base: u64) {
        self.base = base;
        self.length = 0;
        self.chunks.clear();
    }

    /// Copies `data` into the window at absolute `offset`.
    ///
    /// Bytes before `base` or past the declared length are dropped; the caller
    /// grows the window with [`set_length`](Self::set_length) first. Returns the
    /// number of bytes stored.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> usize {
        let (rel, data) = if offset < self.base {
            let skip = self.base - offset;
            if skip >= data.len() as u64 {
                return 0;
            }
            (0, &data[skip as usize..])
        } else {
            (offset - self.base, data)
        };
        if rel >= self.length || data.is_empty() {
            return 0;
        }
        let room = (self.length - rel).min(data.len() as u64) as usize;
        let data = &data[..room];
        let new_end = rel + data.len() as u64;

        // Appending to or overwriting inside one run: no later run is touched,
        // so the preceding chunk is extended in place.
        if self.chunks.range(rel + 1..=new_end).next().is_none() {
            if let Some((&key, chunk)) = self.chunks.range_mut(..=rel).next_back() {
                let at = (rel - key) as usize;
                if at <= chunk.len() {
                    let overlap = (chunk.len() - at).min(data.len());
                    chunk[at..at + overlap].copy_from_slice(&data[..overlap]);
                    chunk.extend_from_slice(&data[overlap..]);
                    return data.len();
                }
            }
            self.chunks.insert(rel, data.to_vec());
            return data.len();
        }

        // Chunks overlapping or touching [rel, new_end) get merged.
        let touching: Vec<u64> = self
            .chunks
            .range(..=new_end)
            .rev()
            .take_while(|(key, chunk)| **key + chunk.len() as u64 >= rel)
            .map(|(key, _)| *key)
            .collect();

        let merged_start = touching.last().copied().map_or(rel, |key| key.min(rel));
        let mut merged_end = new_end;
        for key in &touching {
            merged_end = merged_end.max(key + self.chunks[key].len() as u64);
        }

        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        for key in touching {
            if let Some(chunk) = self.chunks.remove(&key) {
                let at = (key - merged_start) as usize;
                merged[at..at + chunk.len()].copy_from_slice(&chunk);
            }
        }
        let at = (rel - merged_start) as usize;
        merged[at..at + data.len()].copy_from_slice(data);
        self.chunks.insert(merged_start, merged);

        data.len()
    }

    /// Returns what the buffer holds at absolute `offset`.
    pub fn data_at(&self, offset: u64) -> Span<'_> {
        if offset < self.base || offset >= self.end() {
            return Span::End;
        }
        let rel = offset - self.base;

        if let Some((key, chunk)) = self.chunks.range(..=rel).next_back() {
            let chunk_end = key + chunk.len() as u64;
            if chunk_end > rel {
                return Span::Data(&chunk[(rel - key) as usize..]);
            }
        }

        let gap_end = self
            .chunks
            .range(rel + 1..)
            .next()
            .map_or(self.length, |(key, _)| (*key).min(self.length));
        Span::Gap(gap_end - rel)
    }

    /// Copies bytes starting at `offset` into `out`, zero-filling gaps.
    ///
    /// Stops at the end of the window. Returns the number of bytes produced.
    pub fn read_into(&self, offset: u64, out: &mut [u8]) -> usize {
        let mut filled = 0;
        while filled < out.len() {
            let pos = offset + filled as u64;
            let want = out.len() - filled;
            match self.data_at(pos) {
                Span::End => break,
                Span::Gap(len) => {
                    let n = (len.min(want as u64)) as usize;
                    out[filled..filled + n].fill(0);
                    filled += n;
                }
                Span::Data(data) => {
                    let n = data.len().min(want);
                    out[filled..filled + n].copy_from_slice(&data[..n]);
                    filled += n;
                }
            }
        }
        filled
    }

    /// Total number of mapped bytes.
    pub fn mapped_len(&self) -> u64 {
        self.chunks.values().map(|chunk| chunk.len() as u64).sum()
    }

    /// Number of disjoint runs.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Iterates over `(absolute offset, bytes)` runs in offset order.
    pub fn chunks(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.chunks
            .iter()
            .map(move |(key, chunk)| (self.base + key, chunk.as_slice()))
    }

    /// Absolute ranges of the unmapped holes inside the window.
    pub fn gaps(&self) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        let mut pos = self.base;
        while pos < self.end() {
            let span = self.data_at(pos);
            if let Span::Gap(len) = span {
                gaps.push(ByteRange::new(pos, len));
            }
            if span.is_empty() {
                break;
            }
            pos += span.len();
        }
        gaps
    }

    /// True if every byte of the window is mapped.
    pub fn is_complete(&self) -> bool {
        self.mapped_len() == self.length
    }

    /// The whole window as one slice, if it is a single run.
    pub fn contiguous(&self) -> Option<&[u8]> {
        if self.length == 0 {
            return Some(&[]);
        }
        match self.data_at(self.base) {
            Span::Data(data) if data.len() as u64 == self.length => Some(data),
            _ => None,
        }
    }

    /// Copies the window into a dense vector, zero-filling gaps.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.length as usize];
        self.read_into(self.base, &mut out);
        out
    }
}
