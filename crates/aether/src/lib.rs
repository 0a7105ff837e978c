#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub use {
    aether_action as action, aether_proto as proto, aether_stream as stream, bytes, web_time,
};
