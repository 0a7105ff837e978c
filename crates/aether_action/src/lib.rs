#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

extern crate alloc;

mod action;
pub mod event;
mod list;
mod notify;
mod processor;
mod registry;
mod state;
mod trigger;
mod view;

pub use {
    self::{
        action::*, event::*, list::*, notify::*, processor::*, registry::*, state::*, trigger::*,
        view::*,
    },
    web_time,
};
