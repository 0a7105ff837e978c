//! Wire messages and bookkeeping of the safe stream, a sliding-window
//! retransmission protocol which turns a lossy packet stream into an ordered,
//! reliable byte stream.
//!
//! # Protocol
//!
//! Every byte written to the stream is assigned a [`RingIndex`] offset. The
//! sender transmits slices of at most `max_data_size` bytes as
//! [`SafeStreamApi::Send`] messages, keeping at most `window_size` unconfirmed
//! bytes in flight.
//!
//! The receiver reassembles slices in offset order and periodically
//! [confirms](SafeStreamApi::Confirm) the last offset it delivered. Gaps in
//! the received data are reported with [`SafeStreamApi::RequestRepeat`], and
//! the sender answers with [`SafeStreamApi::Repeat`] messages, which carry how
//! many times the slice has been repeated.
//!
//! Slices which stay unconfirmed for `wait_confirm_timeout` are repeated
//! without being requested. A slice repeated more than `max_repeat_count`
//! times is abandoned.

mod receiving;
mod sending;

pub use {receiving::*, sending::*};
use {
    crate::{
        api::{Api, MessageId, ParseError, payload_len, put, put_payload, read_payload},
        ring::RingIndex,
    },
    bytes::{Bytes, BytesMut},
    octs::{FixedEncodeLen, Read},
};

/// Messages exchanged by the two halves of a safe stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafeStreamApi {
    /// Peer closed the stream.
    Close,
    /// Asks the peer to report its receive offset.
    RequestReport,
    /// Reports the receive offset.
    PutReport {
        /// Next offset the reporter expects.
        offset: RingIndex,
    },
    /// Every byte up to and including `offset` was delivered.
    Confirm {
        /// Last delivered offset.
        offset: RingIndex,
    },
    /// Data starting at `offset` is missing.
    RequestRepeat {
        /// First missing offset.
        offset: RingIndex,
    },
    /// First transmission of a slice of data.
    Send {
        /// Offset of the first byte of `data`.
        offset: RingIndex,
        /// Slice contents.
        data: Bytes,
    },
    /// Retransmission of a slice of data.
    Repeat {
        /// How many times this slice has been repeated, starting at 1.
        repeat_count: u16,
        /// Offset of the first byte of `data`.
        offset: RingIndex,
        /// Slice contents.
        data: Bytes,
    },
}

impl SafeStreamApi {
    const CLOSE: MessageId = 2;
    const REQUEST_REPORT: MessageId = 3;
    const PUT_REPORT: MessageId = 4;
    const CONFIRM: MessageId = 5;
    const REQUEST_REPEAT: MessageId = 6;
    const SEND: MessageId = 7;
    const REPEAT: MessageId = 8;

    /// Largest number of bytes a [`SafeStreamApi::Repeat`] of `data_len` bytes
    /// adds on top of the data.
    ///
    /// The sender subtracts this from the downstream element size to get the
    /// largest slice it may send.
    #[must_use]
    pub fn data_overhead(data_len: usize) -> usize {
        1 + u16::ENCODE_LEN + RingIndex::ENCODE_LEN + payload_len(data_len) - data_len
    }
}

impl Api for SafeStreamApi {
    const NAME: &'static str = "SafeStreamApi";

    fn message_id(&self) -> MessageId {
        match self {
            Self::Close => Self::CLOSE,
            Self::RequestReport => Self::REQUEST_REPORT,
            Self::PutReport { .. } => Self::PUT_REPORT,
            Self::Confirm { .. } => Self::CONFIRM,
            Self::RequestRepeat { .. } => Self::REQUEST_REPEAT,
            Self::Send { .. } => Self::SEND,
            Self::Repeat { .. } => Self::REPEAT,
        }
    }

    fn encode_body(&self, dst: &mut BytesMut) {
        match self {
            Self::Close | Self::RequestReport => {}
            Self::PutReport { offset }
            | Self::Confirm { offset }
            | Self::RequestRepeat { offset } => put(dst, offset),
            Self::Send { offset, data } => {
                put(dst, offset);
                put_payload(dst, data);
            }
            Self::Repeat {
                repeat_count,
                offset,
                data,
            } => {
                put(dst, repeat_count);
                put(dst, offset);
                put_payload(dst, data);
            }
        }
    }

    fn decode_body(id: MessageId, src: &mut Bytes) -> Result<Self, ParseError> {
        Ok(match id {
            Self::CLOSE => Self::Close,
            Self::REQUEST_REPORT => Self::RequestReport,
            Self::PUT_REPORT => Self::PutReport {
                offset: src.read()?,
            },
            Self::CONFIRM => Self::Confirm {
                offset: src.read()?,
            },
            Self::REQUEST_REPEAT => Self::RequestRepeat {
                offset: src.read()?,
            },
            Self::SEND => Self::Send {
                offset: src.read()?,
                data: read_payload(src)?,
            },
            Self::REPEAT => Self::Repeat {
                repeat_count: src.read()?,
                offset: src.read()?,
                data: read_payload(src)?,
            },
            id => {
                return Err(ParseError::UnknownMessage {
                    api: Self::NAME,
                    id,
                });
            }
        })
    }
}
