#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

extern crate alloc;

mod buffer;
pub mod crypto;
mod debug;
mod gate;
mod header;
pub mod protocol;
pub mod safe_stream;
mod serialize;
mod sized;
mod splitter;
#[cfg(test)]
mod testing;
mod tied;
pub mod transport;
mod write;

pub use {
    self::{
        buffer::*, debug::*, gate::*, header::*, serialize::*, sized::*, splitter::*, tied::*,
        write::*,
    },
    aether_action as action, aether_proto as proto, bytes,
};

#[doc(hidden)]
pub mod __private {
    pub use alloc::rc::Rc;
}
