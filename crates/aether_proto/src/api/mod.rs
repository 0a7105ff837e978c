//! Message framing shared by every protocol layer.
//!
//! A packet is a sequence of messages, each encoded as
//!
//! ```text
//! [message_id: u8][fields...]
//! ```
//!
//! where the meaning of the fields depends on which [`Api`] the packet is
//! parsed as. Variable-length fields (payloads, child data) are prefixed with
//! their length as a [`VarInt`].
//!
//! Message ids `0` and `1` are reserved in every API for
//! [`ReturnResultApi`], so that any API can answer a request.

mod context;
mod packet;
mod result;

pub use {context::*, packet::*, result::*};
use {
    bytes::{Bytes, BytesMut},
    core::convert::Infallible,
    derive_more::{Display, Error},
    octs::{BufTooShort, BufTooShortOr, Encode, Read, VarInt, VarIntTooLarge},
};

/// Identifies a message within an [`Api`].
pub type MessageId = u8;

/// Failed to parse a packet as messages of an [`Api`].
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ParseError {
    /// Packet ended in the middle of a message.
    #[display("buffer too short")]
    TooShort,
    /// Length prefix did not fit in a `usize`.
    #[display("length prefix too large")]
    LengthTooLarge,
    /// Message id is not defined by the API.
    #[display("unknown message id {id} for {api}")]
    UnknownMessage {
        /// Name of the API the packet was parsed as.
        api: &'static str,
        /// Received message id.
        id: MessageId,
    },
}

impl From<BufTooShort> for ParseError {
    fn from(_: BufTooShort) -> Self {
        Self::TooShort
    }
}

impl From<VarIntTooLarge> for ParseError {
    fn from(_: VarIntTooLarge) -> Self {
        Self::LengthTooLarge
    }
}

impl From<Infallible> for ParseError {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

impl<E: Into<Self>> From<BufTooShortOr<E>> for ParseError {
    fn from(value: BufTooShortOr<E>) -> Self {
        match value {
            BufTooShortOr::TooShort => Self::TooShort,
            BufTooShortOr::Or(err) => err.into(),
        }
    }
}

/// Set of messages which can be exchanged by one protocol layer.
///
/// Usually implemented by an enum with one variant per message.
pub trait Api: Sized + 'static {
    /// Name of this API, used in logs and errors.
    const NAME: &'static str;

    /// Gets the id this message is sent with.
    fn message_id(&self) -> MessageId;

    /// Writes the fields of this message, without its id.
    fn encode_body(&self, dst: &mut BytesMut);

    /// Reads the fields of the message identified by `id`.
    ///
    /// # Errors
    ///
    /// Errors if `id` is not part of this API, or the fields are malformed.
    fn decode_body(id: MessageId, src: &mut Bytes) -> Result<Self, ParseError>;

    /// Packs this single message into a packet.
    #[must_use]
    fn pack(&self) -> Bytes {
        PacketBuilder::new().with(self).build()
    }
}

/// Writes a value whose encoding can't fail into a growable buffer.
pub fn put<T: Encode<Error = Infallible>>(dst: &mut BytesMut, value: &T) {
    value
        .encode(&mut *dst)
        .expect("`BytesMut` grows to fit, and the encoding is infallible");
}

/// Writes `data` prefixed with its length.
pub fn put_payload(dst: &mut BytesMut, data: &[u8]) {
    put(dst, &VarInt(data.len()));
    dst.extend_from_slice(data);
}

/// Number of bytes [`put_payload`] writes for a payload of `len` bytes.
#[must_use]
pub fn payload_len(len: usize) -> usize {
    use octs::EncodeLen;

    VarInt(len).encode_len() + len
}

/// Reads a payload written by [`put_payload`].
///
/// # Errors
///
/// Errors if the length prefix or payload is truncated.
pub fn read_payload(src: &mut Bytes) -> Result<Bytes, ParseError> {
    let len = src.read::<VarInt<usize>>()?.0;
    Ok(src.read_next(len)?)
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    #[test]
    fn payload_round_trip() {
        let mut buf = BytesMut::new();
        put_payload(&mut buf, b"hello");
        put_payload(&mut buf, b"");
        assert_eq!(payload_len(5) + payload_len(0), buf.len());

        let mut src = buf.freeze();
        assert_eq!(&b"hello"[..], read_payload(&mut src).expect("valid payload"));
        assert_eq!(&b""[..], read_payload(&mut src).expect("valid payload"));
        assert!(src.is_empty());
    }

    #[test]
    fn truncated_payload() {
        let mut buf = BytesMut::new();
        put_payload(&mut buf, b"hello");
        let mut src = buf.freeze().slice(..3);
        assert_matches!(read_payload(&mut src), Err(ParseError::TooShort));
    }
}
