#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

extern crate alloc;

pub mod api;
pub mod config;
pub mod ring;
pub mod safe_stream;
pub mod stream_api;

pub use {bytes, octs};
