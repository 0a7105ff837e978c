use {
    super::{Api, MessageId, ParseError, put, put_payload, read_payload},
    bytes::{Bytes, BytesMut},
    core::{convert::Infallible, fmt},
    derive_more::{Display, Error},
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// Identifies a request so that its reply can be matched to it.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestId(pub u32);

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestId").field(&self.0).finish()
    }
}

impl FixedEncodeLen for RequestId {
    const ENCODE_LEN: usize = u32::ENCODE_LEN;
}

impl Encode for RequestId {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for RequestId {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

/// Remote side answered a request with an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Error)]
#[display("request failed with code {code}")]
pub struct RequestError {
    /// Application-defined error code.
    pub code: u32,
}

/// Replies to requests, usable from within any [`Api`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnResultApi {
    /// Request succeeded with a payload.
    SendResult {
        /// Request being answered.
        request_id: RequestId,
        /// Reply payload.
        data: Bytes,
    },
    /// Request failed.
    SendError {
        /// Request being answered.
        request_id: RequestId,
        /// Application-defined error code.
        error_code: u32,
    },
}

impl ReturnResultApi {
    const SEND_RESULT: MessageId = 0;
    const SEND_ERROR: MessageId = 1;

    /// Returns `true` if `id` is reserved for this API.
    #[must_use]
    pub const fn handles(id: MessageId) -> bool {
        id == Self::SEND_RESULT || id == Self::SEND_ERROR
    }

    /// Gets the request this message answers.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        match self {
            Self::SendResult { request_id, .. } | Self::SendError { request_id, .. } => *request_id,
        }
    }

    /// Converts this reply into the result of its request.
    ///
    /// # Errors
    ///
    /// Errors if this is a [`ReturnResultApi::SendError`].
    pub fn into_result(self) -> Result<Bytes, RequestError> {
        match self {
            Self::SendResult { data, .. } => Ok(data),
            Self::SendError { error_code, .. } => Err(RequestError { code: error_code }),
        }
    }
}

impl Api for ReturnResultApi {
    const NAME: &'static str = "ReturnResultApi";

    fn message_id(&self) -> MessageId {
        match self {
            Self::SendResult { .. } => Self::SEND_RESULT,
            Self::SendError { .. } => Self::SEND_ERROR,
        }
    }

    fn encode_body(&self, dst: &mut BytesMut) {
        match self {
            Self::SendResult { request_id, data } => {
                put(dst, request_id);
                put_payload(dst, data);
            }
            Self::SendError {
                request_id,
                error_code,
            } => {
                put(dst, request_id);
                put(dst, error_code);
            }
        }
    }

    fn decode_body(id: MessageId, src: &mut Bytes) -> Result<Self, ParseError> {
        match id {
            Self::SEND_RESULT => Ok(Self::SendResult {
                request_id: src.read()?,
                data: read_payload(src)?,
            }),
            Self::SEND_ERROR => Ok(Self::SendError {
                request_id: src.read()?,
                error_code: src.read()?,
            }),
            id => Err(ParseError::UnknownMessage {
                api: Self::NAME,
                id,
            }),
        }
    }
}
