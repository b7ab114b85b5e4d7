//! Shared value types for the dbmbind workspace.
//!
//! Every engine call and every binding operation reports its outcome through
//! a [`Status`]. A failed status can be turned into a [`StatusError`] when a
//! caller explicitly opts into error propagation, and a [`StatusError`] can be
//! parsed back into a [`Status`] from its rendered message.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod status;

pub use status::{Status, StatusCode, StatusError};
