use {
    crate::{
        config::MAX_WINDOW_SIZE,
        ring::{OffsetRange, RingIndex},
    },
    bytes::{Bytes, BytesMut},
};

/// Slice of data received ahead of the delivery frontier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivingChunk {
    /// Offset of the first byte of `data`.
    pub offset: RingIndex,
    /// Slice contents.
    pub data: Bytes,
    /// Repeat count the slice was received with.
    pub repeat_count: u16,
}

impl ReceivingChunk {
    /// First offset after this chunk.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than the ring. Chunks stored in a
    /// [`ReceivingChunkList`] never are.
    #[must_use]
    pub fn end(&self) -> RingIndex {
        self.offset.advance(self.data.len())
    }
}

/// Out-of-order slices waiting to be joined into the delivered byte stream.
///
/// All positions are measured from a *frontier*, the next offset the receiver
/// expects to deliver. Chunks are kept sorted by that distance and never
/// overlap: adding a slice only stores the parts of it which no stored chunk
/// already covers.
#[derive(Debug, Clone, Default)]
pub struct ReceivingChunkList {
    chunks: Vec<ReceivingChunk>,
}

impl ReceivingChunkList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns `true` if nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Iterates stored chunks in offset order.
    pub fn iter(&self) -> impl Iterator<Item = &ReceivingChunk> {
        self.chunks.iter()
    }

    /// Stores the parts of `chunk` which are not already stored.
    ///
    /// `chunk` must not start before `frontier`.
    ///
    /// Returns `false` if every byte of `chunk` was already stored, or if
    /// `chunk` ends further than [`MAX_WINDOW_SIZE`] past `frontier`.
    pub fn add(&mut self, frontier: RingIndex, chunk: ReceivingChunk) -> bool {
        let rel = |offset: RingIndex| usize::from(frontier.distance(offset));
        let start = rel(chunk.offset);
        let end = start + chunk.data.len();
        if end > MAX_WINDOW_SIZE {
            return false;
        }

        let mut pieces = Vec::new();
        let mut cursor = start;
        for stored in &self.chunks {
            let stored_start = rel(stored.offset);
            let stored_end = stored_start + stored.data.len();
            if stored_end <= cursor {
                continue;
            }
            if stored_start >= end {
                break;
            }
            if stored_start > cursor {
                pieces.push((cursor, stored_start));
            }
            cursor = cursor.max(stored_end);
        }
        if cursor < end {
            pieces.push((cursor, end));
        }
        if pieces.is_empty() {
            return false;
        }

        for (piece_start, piece_end) in pieces {
            let piece = ReceivingChunk {
                offset: frontier.advance(piece_start),
                data: chunk.data.slice(piece_start - start..piece_end - start),
                repeat_count: chunk.repeat_count,
            };
            let pos = self
                .chunks
                .partition_point(|stored| rel(stored.offset) < piece_start);
            self.chunks.insert(pos, piece);
        }
        true
    }

    /// Removes the contiguous run of chunks starting exactly at `frontier`,
    /// returning their joined contents.
    pub fn pop_completed(&mut self, frontier: RingIndex) -> Option<Bytes> {
        let mut next = frontier;
        let run = self
            .chunks
            .iter()
            .take_while(|chunk| {
                let contiguous = chunk.offset == next;
                if contiguous {
                    next = chunk.end();
                }
                contiguous
            })
            .count();
        if run == 0 {
            return None;
        }

        let mut drained = self.chunks.drain(..run);
        if run == 1 {
            return drained.next().map(|chunk| chunk.data);
        }
        let mut joined = BytesMut::new();
        for chunk in drained {
            joined.extend_from_slice(&chunk.data);
        }
        Some(joined.freeze())
    }

    /// Gets the holes between `frontier` and the last stored chunk.
    #[must_use]
    pub fn missing(&self, frontier: RingIndex) -> Vec<OffsetRange> {
        let mut missing = Vec::new();
        let mut cursor = frontier;
        for chunk in &self.chunks {
            if chunk.offset != cursor {
                missing.push(OffsetRange {
                    begin: cursor,
                    end: chunk.offset,
                });
            }
            cursor = chunk.end();
        }
        missing
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(offset: u16, data: &'static [u8]) -> ReceivingChunk {
        ReceivingChunk {
            offset: RingIndex(offset),
            data: Bytes::from_static(data),
            repeat_count: 0,
        }
    }

    fn layout(list: &ReceivingChunkList) -> Vec<(u16, &[u8])> {
        list.iter()
            .map(|chunk| (chunk.offset.0, &chunk.data[..]))
            .collect()
    }

    #[test]
    fn rejects_chunk_past_ring() {
        let mut list = ReceivingChunkList::new();
        let chunk = ReceivingChunk {
            offset: RingIndex(10),
            data: Bytes::from(vec![0; 70_000]),
            repeat_count: 0,
        };
        assert!(!list.add(RingIndex(0), chunk));
        assert!(list.is_empty());
    }

    #[test]
    fn joins_in_order() {
        let mut list = ReceivingChunkList::new();
        let frontier = RingIndex(0);
        assert!(list.add(frontier, chunk(3, b"def")));
        assert_eq!(None, list.pop_completed(frontier));
        assert_eq!(list.missing(frontier), [OffsetRange {
            begin: RingIndex(0),
            end: RingIndex(3)
        }]);

        assert!(list.add(frontier, chunk(0, b"abc")));
        assert_eq!(
            Some(Bytes::from_static(b"abcdef")),
            list.pop_completed(frontier)
        );
        assert!(list.is_empty());
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut list = ReceivingChunkList::new();
        let frontier = RingIndex(0);
        assert!(list.add(frontier, chunk(0, b"abcd")));
        assert!(!list.add(frontier, chunk(0, b"abcd")));
        assert!(!list.add(frontier, chunk(1, b"bc")));
        assert_eq!(1, list.len());
    }

    #[test]
    fn overlaps_fill_only_gaps() {
        let mut list = ReceivingChunkList::new();
        let frontier = RingIndex(10);
        list.add(frontier, chunk(12, b"cd"));
        list.add(frontier, chunk(16, b"gh"));
        list.add(frontier, chunk(10, b"abcdefghij"));

        assert_eq!(layout(&list), [
            (10, &b"ab"[..]),
            (12, &b"cd"[..]),
            (14, &b"ef"[..]),
            (16, &b"gh"[..]),
            (18, &b"ij"[..]),
        ]);
        assert_eq!(
            Some(Bytes::from_static(b"abcdefghij")),
            list.pop_completed(frontier)
        );
    }

    #[test]
    fn missing_reports_every_hole() {
        let mut list = ReceivingChunkList::new();
        let frontier = RingIndex(u16::MAX - 1);
        list.add(frontier, chunk(0, b"xx"));
        list.add(frontier, chunk(4, b"yy"));
        assert_eq!(list.missing(frontier), [
            OffsetRange {
                begin: RingIndex(u16::MAX - 1),
                end: RingIndex(0)
            },
            OffsetRange {
                begin: RingIndex(2),
                end: RingIndex(4)
            },
        ]);
    }
}
