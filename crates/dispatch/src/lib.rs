//! Outbound dispatch: reply-channel binding, reply-window enforcement,
//! `{{key}}` personalization, and per-attempt message persistence.

pub mod dispatcher;
pub mod template;

pub use {
    dispatcher::{Dispatched, Dispatcher},
    template::render,
};
