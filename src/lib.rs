//! Long-poll session transport.
//!
//! See [`long_poll`] for the server side. The `longpoll_client` crate in this
//! workspace speaks the same wire format from the other end.

pub mod long_poll;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
