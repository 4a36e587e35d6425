//! Client side of the long-poll session transport.
//!
//! [`HttpTransport`] posts one encoded message per request. [`LongPollClient`]
//! wraps it in a retry policy and drives whole conversations, sleeping for
//! the server's poll delay hint between polls.

#[macro_use]
extern crate tracing;

mod client;
pub mod retries;
mod transport;

pub use client::{ClientSettings, ClientStream, LongPollClient};
pub use transport::{ClientError, HttpTransport};
