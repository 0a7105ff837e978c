//! Encryption as a pipeline stage, on top of pluggable crypto providers.
//!
//! This crate implements no cryptography itself. Key material is supplied by a
//! [`SyncKeyProvider`] or [`AsyncKeyProvider`], and the actual algorithms by
//! an [`EncryptProvider`] and [`DecryptProvider`].

use {
    crate::{DynGate, Gate, GateLink, LinkOut, StreamInfo, WriteList, WriteState, WriteView},
    aether_action::{ActionContext, Event, EventSubscriber},
    alloc::rc::Rc,
    bytes::Bytes,
    core::fmt,
    derive_more::{Display, Error, From},
    log::{error, warn},
    web_time::Instant,
};

/// Supplies a symmetric key shared by both sides.
pub trait SyncKeyProvider {
    /// Gets the shared key.
    fn key(&self) -> &[u8];

    /// Gets the nonce to use for the next message.
    fn nonce(&self) -> Bytes;
}

/// Supplies an asymmetric key pair.
pub trait AsyncKeyProvider {
    /// Gets the key given out to the other side.
    fn public_key(&self) -> &[u8];

    /// Gets the key kept by this side.
    fn secret_key(&self) -> &[u8];
}

/// Encrypts outgoing data.
pub trait EncryptProvider {
    /// Encrypts `data`.
    ///
    /// # Errors
    ///
    /// Errors if the data can't be encrypted, e.g. because no key is available
    /// yet.
    fn encrypt(&self, data: &[u8]) -> Result<Bytes, CryptoError>;

    /// Largest number of bytes [`EncryptProvider::encrypt`] adds to the data.
    fn encrypt_overhead(&self) -> usize;
}

/// Decrypts incoming data.
pub trait DecryptProvider {
    /// Decrypts `data`.
    ///
    /// # Errors
    ///
    /// Errors if the data is not a valid encrypted message.
    fn decrypt(&self, data: &[u8]) -> Result<Bytes, CryptoError>;
}

/// Failed to encrypt or decrypt data.
#[derive(Debug, Display, Error, From)]
pub enum CryptoError {
    /// No key is available yet.
    #[display("no key available")]
    NoKey,
    /// Data was not a valid encrypted message.
    #[display("invalid encrypted data")]
    InvalidData,
    /// Crypto provider failed.
    #[display("crypto provider failed: {_0}")]
    #[from]
    Provider(#[error(not(source))] anyhow::Error),
}

/// Encrypts writes on the way down and decrypts reads on the way up.
///
/// A write which fails to encrypt fails immediately. A read which fails to
/// decrypt is logged and dropped.
pub struct CryptoGate {
    context: ActionContext,
    encrypt: Rc<dyn EncryptProvider>,
    decrypt: Rc<dyn DecryptProvider>,
    link: GateLink<Bytes, Bytes>,
    out_data: Rc<Event<Bytes>>,
    writes: WriteList,
}

impl fmt::Debug for CryptoGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoGate")
            .field("encrypt_overhead", &self.encrypt.encrypt_overhead())
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}

impl CryptoGate {
    /// Creates an unlinked gate using the given providers.
    #[must_use]
    pub fn new(
        context: &ActionContext,
        encrypt: Rc<dyn EncryptProvider>,
        decrypt: Rc<dyn DecryptProvider>,
    ) -> Rc<Self> {
        Rc::new(Self {
            context: context.clone(),
            encrypt,
            decrypt,
            link: GateLink::new(),
            out_data: Rc::new(Event::new()),
            writes: WriteList::new(),
        })
    }
}

impl Gate for CryptoGate {
    type In = Bytes;
    type Out = Bytes;

    fn write_in(&self, data: Bytes, now: Instant) -> WriteView {
        match self.encrypt.encrypt(&data) {
            Ok(encrypted) => self.link.write_out(encrypted, now),
            Err(err) => {
                error!("Failed to encrypt write of {} bytes: {err}", data.len());
                self.writes.finished(&self.context, WriteState::Failed)
            }
        }
    }

    fn out_data_event(&self) -> EventSubscriber<Bytes> {
        self.out_data.subscriber()
    }

    fn gate_update_event(&self) -> EventSubscriber<()> {
        self.link.gate_update_event()
    }

    fn stream_info(&self) -> StreamInfo {
        self.link
            .stream_info()
            .with_overhead(self.encrypt.encrypt_overhead())
    }
}

impl LinkOut for CryptoGate {
    type WriteIn = Bytes;
    type ReadOut = Bytes;

    fn link_out(&self, out: DynGate<Bytes, Bytes>) {
        let decrypt = self.decrypt.clone();
        let out_data = Rc::downgrade(&self.out_data);
        self.link.link(out, move |data: &Bytes| {
            let decrypted = match decrypt.decrypt(data) {
                Ok(decrypted) => decrypted,
                Err(err) => {
                    warn!("Dropping read of {} bytes: {err}", data.len());
                    return;
                }
            };
            if let Some(out_data) = out_data.upgrade() {
                out_data.emit(&decrypted);
            }
        });
    }
}
