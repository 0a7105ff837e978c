use {
    crate::ring::{OffsetRange, RingIndex},
    alloc::collections::VecDeque,
    web_time::Instant,
};

/// Range of offsets which was transmitted and is waiting for confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendingChunk {
    /// First offset sent.
    pub begin: RingIndex,
    /// First offset after the sent range.
    pub end: RingIndex,
    /// How many times this range has been repeated.
    pub repeat_count: u16,
    /// When this range was last transmitted.
    pub send_time: Instant,
}

impl SendingChunk {
    /// Gets the offsets covered by this chunk.
    #[must_use]
    pub const fn range(&self) -> OffsetRange {
        OffsetRange {
            begin: self.begin,
            end: self.end,
        }
    }
}

/// Tracks which ranges are in flight, when they were sent, and how often they
/// were repeated.
///
/// Chunks are kept in the order they were last sent, so the front chunk is the
/// one which has waited longest for a confirmation. Chunks never overlap:
/// registering a range cuts it out of any chunks it overlaps.
#[derive(Debug, Clone, Default)]
pub struct SendingChunkList {
    chunks: VecDeque<SendingChunk>,
}

impl SendingChunkList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns `true` if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Gets the chunk which was sent the longest time ago.
    #[must_use]
    pub fn front(&self) -> Option<&SendingChunk> {
        self.chunks.front()
    }

    /// Iterates chunks from least to most recently sent.
    pub fn iter(&self) -> impl Iterator<Item = &SendingChunk> {
        self.chunks.iter()
    }

    /// Records that `range` was transmitted at `send_time`, returning how many
    /// times it has now been repeated.
    ///
    /// - a range matching a tracked chunk exactly has its repeat count
    ///   incremented
    /// - a range overlapping tracked chunks gets one more than the smallest of
    ///   their repeat counts
    /// - a new range has a repeat count of 0
    pub fn register(&mut self, range: OffsetRange, send_time: Instant) -> u16 {
        if let Some(pos) = self.chunks.iter().position(|chunk| chunk.range() == range) {
            if let Some(mut chunk) = self.chunks.remove(pos) {
                chunk.repeat_count = chunk.repeat_count.saturating_add(1);
                chunk.send_time = send_time;
                self.chunks.push_back(chunk);
                return chunk.repeat_count;
            }
        }

        let repeat_count = self
            .chunks
            .iter()
            .filter(|chunk| chunk.range().overlaps(&range))
            .map(|chunk| chunk.repeat_count)
            .min()
            .map_or(0, |count| count.saturating_add(1));
        self.remove(range);
        self.chunks.push_back(SendingChunk {
            begin: range.begin,
            end: range.end,
            repeat_count,
            send_time,
        });
        repeat_count
    }

    /// Stops tracking every offset in `range`, trimming or splitting chunks
    /// which only partly overlap it.
    pub fn remove(&mut self, range: OffsetRange) {
        if range.is_empty() {
            return;
        }
        let len = i32::from(range.len());
        let mut kept = VecDeque::with_capacity(self.chunks.len() + 1);
        for chunk in self.chunks.drain(..) {
            let (begin, end) = range.relative(&chunk.range());
            if end <= 0 || begin >= len {
                kept.push_back(chunk);
                continue;
            }
            if begin < 0 {
                kept.push_back(SendingChunk {
                    end: range.begin,
                    ..chunk
                });
            }
            if end > len {
                kept.push_back(SendingChunk {
                    begin: range.end,
                    ..chunk
                });
            }
        }
        self.chunks = kept;
    }

    /// Stops tracking every offset from `origin` up to, but not including,
    /// `offset`.
    pub fn remove_up_to(&mut self, origin: RingIndex, offset: RingIndex) {
        self.remove(OffsetRange {
            begin: origin,
            end: offset,
        });
    }

    /// Stops tracking everything.
    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use {super::*, core::time::Duration};

    fn range(begin: u16, end: u16) -> OffsetRange {
        OffsetRange {
            begin: RingIndex(begin),
            end: RingIndex(end),
        }
    }

    fn ranges(list: &SendingChunkList) -> Vec<(u16, u16, u16)> {
        list.iter()
            .map(|chunk| (chunk.begin.0, chunk.end.0, chunk.repeat_count))
            .collect()
    }

    #[test]
    fn exact_repeat_moves_to_back() {
        let now = Instant::now();
        let later = now + Duration::from_millis(10);
        let mut list = SendingChunkList::new();
        assert_eq!(0, list.register(range(0, 10), now));
        assert_eq!(0, list.register(range(10, 20), now));
        assert_eq!(1, list.register(range(0, 10), later));

        assert_eq!(ranges(&list), [(10, 20, 0), (0, 10, 1)]);
        assert_eq!(Some(now), list.front().map(|chunk| chunk.send_time));
    }

    #[test]
    fn overlap_takes_min_repeat() {
        let now = Instant::now();
        let mut list = SendingChunkList::new();
        list.register(range(0, 10), now);
        list.register(range(0, 10), now);
        list.register(range(0, 10), now);
        list.register(range(10, 20), now);
        list.register(range(10, 20), now);

        // overlaps [0, 10) x2 and [10, 20) x1
        assert_eq!(2, list.register(range(5, 15), now));
        assert_eq!(ranges(&list), [(0, 5, 2), (15, 20, 1), (5, 15, 2)]);
    }

    #[test]
    fn remove_splits() {
        let now = Instant::now();
        let mut list = SendingChunkList::new();
        list.register(range(0, 30), now);
        list.remove(range(10, 20));
        assert_eq!(ranges(&list), [(0, 10, 0), (20, 30, 0)]);

        list.remove_up_to(RingIndex(0), RingIndex(25));
        assert_eq!(ranges(&list), [(25, 30, 0)]);
    }

    #[test]
    fn works_across_wrap() {
        let now = Instant::now();
        let mut list = SendingChunkList::new();
        list.register(range(u16::MAX - 9, 10), now);
        list.remove_up_to(RingIndex(u16::MAX - 9), RingIndex(0));
        assert_eq!(ranges(&list), [(0, 10, 0)]);
    }
}
