//! Storage engines consumed by the dbmbind binding layer.
//!
//! The binding talks to databases only through the object-safe [`Engine`]
//! trait. Two implementations are provided:
//!
//! - [`TreeEngine`]: an ordered `BTreeMap` database, in memory or backed by
//!   a locked data file.
//! - [`ShardEngine`]: several tree shards behind one handle, routed by key
//!   hash and merged for ordered navigation.
//!
//! [`PositionalFile`] gives raw offset-based file access, and the
//! [`records`] module defines the flat record stream used for data files,
//! exports and imports.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod records;
pub mod search;

mod engine;
mod file;
mod lock;
mod poly;
mod shard;
mod tree;

pub use engine::{
    Engine, EngineResult, OpenOptions, Params, Record, RecordAction, Seek, decode_int, encode_int,
};
pub use file::{FILE_CLASS, PositionalFile};
pub use poly::{open_database, restore_database};
pub use shard::{SHARD_CLASS, ShardEngine, detect_shard_count, shard_index, shard_path};
pub use tree::{TREE_CLASS, TREE_MAGIC, TreeEngine};
