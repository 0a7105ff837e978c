//! Multiplexing several logical streams over one byte stream.

use {
    crate::api::{Api, ChildData, MessageId, ParseError},
    bytes::{Bytes, BytesMut},
    core::fmt,
    octs::Read,
};

/// Identifies one logical stream inside a multiplexed byte stream.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamId(pub u8);

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StreamId").field(&self.0).finish()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages of a multiplexed byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamApi {
    /// Data for one logical stream.
    Stream {
        /// Stream the data belongs to.
        stream_id: StreamId,
        /// Data for the stream.
        child_data: ChildData,
    },
}

impl StreamApi {
    const STREAM: MessageId = 2;

    /// Number of bytes a [`StreamApi::Stream`] message adds on top of
    /// `data_len` bytes of child data.
    #[must_use]
    pub fn overhead(data_len: usize) -> usize {
        1 + 1 + crate::api::payload_len(data_len) - data_len
    }
}

impl Api for StreamApi {
    const NAME: &'static str = "StreamApi";

    fn message_id(&self) -> MessageId {
        match self {
            Self::Stream { .. } => Self::STREAM,
        }
    }

    fn encode_body(&self, dst: &mut BytesMut) {
        match self {
            Self::Stream {
                stream_id,
                child_data,
            } => {
                crate::api::put(dst, &stream_id.0);
                child_data.encode(dst);
            }
        }
    }

    fn decode_body(id: MessageId, src: &mut Bytes) -> Result<Self, ParseError> {
        match id {
            Self::STREAM => Ok(Self::Stream {
                stream_id: StreamId(src.read()?),
                child_data: ChildData::decode(src)?,
            }),
            id => Err(ParseError::UnknownMessage {
                api: Self::NAME,
                id,
            }),
        }
    }
}

/// Which side of a connection allocates stream ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamSide {
    /// Allocates odd ids, starting at 1.
    Client,
    /// Allocates even ids, starting at 2.
    Server,
}

/// Allocates stream ids which never collide with the ids allocated by the
/// other side of the connection.
///
/// # Example
///
/// ```
/// # use aether_proto::stream_api::{StreamId, StreamIdGenerator, StreamSide};
/// let mut client = StreamIdGenerator::new(StreamSide::Client);
/// let mut server = StreamIdGenerator::new(StreamSide::Server);
/// assert_eq!(StreamId(1), client.next_id());
/// assert_eq!(StreamId(3), client.next_id());
/// assert_eq!(StreamId(2), server.next_id());
/// assert_eq!(StreamId(4), server.next_id());
/// ```
#[derive(Debug, Clone)]
pub struct StreamIdGenerator {
    next: u8,
}

impl StreamIdGenerator {
    /// Creates a generator for `side`.
    #[must_use]
    pub const fn new(side: StreamSide) -> Self {
        Self {
            next: match side {
                StreamSide::Client => 1,
                StreamSide::Server => 2,
            },
        }
    }

    /// Allocates the next id, wrapping around within this side's parity.
    pub const fn next_id(&mut self) -> StreamId {
        let id = StreamId(self.next);
        self.next = self.next.wrapping_add(2);
        if self.next == 0 {
            // 0 is never allocated, so that even ids restart at 2
            self.next = 2;
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::api::{ApiParser, PacketBuilder},
    };

    #[test]
    fn nested_packet_round_trip() {
        let inner = PacketBuilder::new().with(&crate::safe_stream::SafeStreamApi::Close);
        let message = StreamApi::Stream {
            stream_id: StreamId(5),
            child_data: inner.clone().into(),
        };
        let packet = message.pack();
        assert_eq!(packet.len(), inner.len() + StreamApi::overhead(inner.len()));

        let parsed = ApiParser::new(packet)
            .collect::<StreamApi>()
            .expect("valid packet");
        assert_eq!(parsed, [StreamApi::Stream {
            stream_id: StreamId(5),
            child_data: ChildData::Bytes(inner.build()),
        }]);
    }

    #[test]
    fn generator_wraps_within_parity() {
        let mut server = StreamIdGenerator::new(StreamSide::Server);
        let ids = (0..130).map(|_| server.next_id().0).collect::<Vec<_>>();
        assert!(ids.iter().all(|id| id % 2 == 0 && *id != 0));

        let mut client = StreamIdGenerator::new(StreamSide::Client);
        let ids = (0..130).map(|_| client.next_id().0).collect::<Vec<_>>();
        assert!(ids.iter().all(|id| id % 2 == 1));
    }
}
