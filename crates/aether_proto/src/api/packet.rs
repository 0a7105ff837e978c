use {
    super::{Api, MessageId, ParseError, ProtocolContext, ReturnResultApi, payload_len, put_payload},
    bytes::{Bytes, BytesMut},
    octs::Read,
};

/// Appends packed messages to a buffer.
#[derive(Debug)]
pub struct ApiPacker<'a> {
    dst: &'a mut BytesMut,
}

impl<'a> ApiPacker<'a> {
    /// Creates a packer writing to the end of `dst`.
    pub const fn new(dst: &'a mut BytesMut) -> Self {
        Self { dst }
    }

    /// Appends `message` as `[id][body]`.
    pub fn pack<A: Api>(&mut self, message: &A) -> &mut Self {
        self.dst.extend_from_slice(&[message.message_id()]);
        message.encode_body(self.dst);
        self
    }
}

/// Packet under construction, made of any number of messages, possibly from
/// different APIs.
///
/// # Example
///
/// ```
/// # use aether_proto::{api::{Api, PacketBuilder}, ring::RingIndex, safe_stream::SafeStreamApi};
/// let packet = PacketBuilder::new()
///     .with(&SafeStreamApi::Confirm { offset: RingIndex(9) })
///     .with(&SafeStreamApi::RequestRepeat { offset: RingIndex(20) })
///     .build();
/// assert_eq!(packet.len(), 6);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketBuilder {
    buf: BytesMut,
}

impl PacketBuilder {
    /// Creates an empty packet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `message`.
    pub fn push<A: Api>(&mut self, message: &A) {
        ApiPacker::new(&mut self.buf).pack(message);
    }

    /// Appends `message`, builder-style.
    #[must_use]
    pub fn with<A: Api>(mut self, message: &A) -> Self {
        self.push(message);
        self
    }

    /// Number of bytes packed so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing has been packed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Gets the packed bytes.
    #[must_use]
    pub fn build(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Payload nested inside another message, e.g. the data carried on one
/// sub-stream.
///
/// Outgoing child data may be given as an unbuilt [`PacketBuilder`]; incoming
/// child data is always raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildData {
    /// Raw bytes.
    Bytes(Bytes),
    /// Messages which are packed when the parent is encoded.
    Packet(PacketBuilder),
}

impl Default for ChildData {
    fn default() -> Self {
        Self::Bytes(Bytes::new())
    }
}

impl From<Bytes> for ChildData {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<PacketBuilder> for ChildData {
    fn from(value: PacketBuilder) -> Self {
        Self::Packet(value)
    }
}

impl ChildData {
    /// Number of bytes of content, excluding the length prefix.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bytes(bytes) => bytes.len(),
            Self::Packet(packet) => packet.len(),
        }
    }

    /// Returns `true` if there are no bytes of content.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes this takes on the wire, including the length prefix.
    #[must_use]
    pub fn encode_len(&self) -> usize {
        payload_len(self.len())
    }

    /// Gets the content bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Bytes(bytes) => bytes.clone(),
            Self::Packet(packet) => packet.clone().build(),
        }
    }

    /// Writes the content prefixed with its length.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Bytes(bytes) => put_payload(dst, bytes),
            Self::Packet(packet) => put_payload(dst, &packet.buf),
        }
    }

    /// Reads content written by [`ChildData::encode`].
    ///
    /// # Errors
    ///
    /// Errors if the content is truncated.
    pub fn decode(src: &mut Bytes) -> Result<Self, ParseError> {
        super::read_payload(src).map(Self::Bytes)
    }
}

/// Splits a packet into messages of an [`Api`].
///
/// Messages with ids reserved for [`ReturnResultApi`] are recognized in every
/// API, and are resolved against the [`ProtocolContext`] when parsing with
/// [`ApiParser::parse`].
#[derive(Debug, Clone)]
pub struct ApiParser {
    data: Bytes,
}

/// One message read by an [`ApiParser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<A> {
    /// A message of the API being parsed.
    Message(A),
    /// A result reply to an earlier request.
    Result(ReturnResultApi),
}

impl ApiParser {
    /// Creates a parser over `data`.
    #[must_use]
    pub const fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// Returns `true` if every message has been read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reads the next message.
    ///
    /// # Errors
    ///
    /// Errors if the message is malformed. The rest of the packet can't be
    /// parsed after an error.
    pub fn next_message<A: Api>(&mut self) -> Option<Result<Parsed<A>, ParseError>> {
        if self.data.is_empty() {
            return None;
        }
        Some(self.read_message())
    }

    fn read_message<A: Api>(&mut self) -> Result<Parsed<A>, ParseError> {
        let id = self.data.read::<MessageId>()?;
        if ReturnResultApi::handles(id) {
            ReturnResultApi::decode_body(id, &mut self.data).map(Parsed::Result)
        } else {
            A::decode_body(id, &mut self.data).map(Parsed::Message)
        }
    }

    /// Reads every message, dispatching them to the handlers registered in
    /// `context`.
    ///
    /// # Errors
    ///
    /// Errors on the first malformed message. Messages before it have already
    /// been dispatched.
    pub fn parse<A: Api>(mut self, context: &ProtocolContext) -> Result<(), ParseError> {
        while let Some(parsed) = self.next_message::<A>() {
            match parsed? {
                Parsed::Message(message) => context.dispatch(&message),
                Parsed::Result(result) => context.resolve(result),
            }
        }
        Ok(())
    }

    /// Reads every message of `A`, skipping result replies.
    ///
    /// # Errors
    ///
    /// Errors on the first malformed message.
    pub fn collect<A: Api>(mut self) -> Result<Vec<A>, ParseError> {
        let mut messages = Vec::new();
        while let Some(parsed) = self.next_message::<A>() {
            if let Parsed::Message(message) = parsed? {
                messages.push(message);
            }
        }
        Ok(messages)
    }
}
