//! Host binding layer over the dbmbind key-value engines.
//!
//! A host runtime drives databases through a small set of handles:
//!
//! - [`Database`]: open, read, update and maintain one database, plain or
//!   sharded.
//! - [`DbIterator`]: an ordered cursor over a database.
//! - [`File`]: offset-based access to a single file.
//! - [`AsyncDbm`] and [`Future`]: operations run on a worker pool and
//!   collected later.
//!
//! Every call goes through the [`Bridge`]. A handle opened with
//! `concurrent=true` releases the global [`HostLock`] for the duration of
//! the native call so other host threads can proceed; other handles run
//! with the lock held. Results come back as a [`Status`] plus host strings
//! ([`RString`]) tagged with the handle's [`Encoding`].
//!
//! Contract violations such as using a closed handle are reported as
//! [`BindingError`]s. Engine failures are ordinary [`Status`] values
//! unless the caller opts into raising them.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod async_dbm;
mod bridge;
mod database;
mod encoding;
mod error;
mod file;
mod future;
mod iterator;
mod marshal;
mod params;
mod runtime;
mod value;

pub use async_dbm::AsyncDbm;
pub use bridge::{Bridge, BridgeStats, Dispatch, HostGuard, HostLock};
pub use database::Database;
pub use dbmbind_core::{Status, StatusCode, StatusError};
pub use encoding::{Encoding, EncodingTable, RString};
pub use error::{BindingError, BindingResult};
pub use file::File;
pub use future::{Future, FutureValue};
pub use iterator::DbIterator;
pub use marshal::RecordMap;
pub use params::{Params, params, str_to_bool};
pub use runtime::Runtime;
pub use value::{HostObject, HostValue};
