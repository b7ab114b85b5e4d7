//! Engine selection and whole-database maintenance entry points.

use std::path::Path;

use dbmbind_core::{Status, StatusCode};
use tracing::{info, warn};

use crate::engine::{Engine, EngineResult, OpenOptions, Params};
use crate::lock::{io_status, write_new_file};
use crate::records::salvage_pairs;
use crate::shard::{ShardEngine, detect_shard_count, shard_path};
use crate::tree::{RecordMap, TREE_CLASS, TREE_MAGIC, TreeEngine, encode_data_file};

/// Class names accepted for the `dbm` parameter.
const TREE_ALIASES: [&str; 4] = [TREE_CLASS, "StdTree", "stdtree", "std_tree"];

fn check_class(class_name: &str) -> EngineResult<()> {
    if class_name.is_empty() || TREE_ALIASES.contains(&class_name) {
        Ok(())
    } else {
        Err(Status::with_message(
            StatusCode::InvalidArgumentError,
            format!("unsupported DBM class: {class_name}"),
        ))
    }
}

/// Open a database, choosing the implementation from `params`.
///
/// A `num_shards` parameter of zero or more selects a [`ShardEngine`];
/// absent or negative selects a single [`TreeEngine`]. The `dbm` parameter
/// names the class.
///
/// # Errors
///
/// `INVALID_ARGUMENT_ERROR` for an unsupported class, otherwise the open
/// failure of the chosen engine.
pub fn open_database(
    path: &str,
    writable: bool,
    options: &OpenOptions,
    params: &Params,
) -> EngineResult<Box<dyn Engine>> {
    check_class(params.get("dbm").map_or("", String::as_str))?;
    let num_shards = params
        .get("num_shards")
        .and_then(|n| n.trim().parse::<i64>().ok())
        .unwrap_or(-1);
    match usize::try_from(num_shards) {
        Ok(num_shards) => Ok(Box::new(ShardEngine::open(
            path, num_shards, writable, options,
        )?)),
        Err(_) => Ok(Box::new(TreeEngine::open(path, writable, options)?)),
    }
}

/// Salvage every intact record of a damaged database into a new one.
///
/// `end_offset` bounds how much of the old file is read; a negative value
/// reads all of it. Sharded databases are restored shard by shard.
///
/// # Errors
///
/// `NOT_FOUND_ERROR` when neither a data file nor shard files exist at
/// `old_path`, `BROKEN_DATA_ERROR` when the file is not a database file, and
/// I/O failures writing the new file.
pub fn restore_database(
    old_path: &str,
    new_path: &str,
    class_name: &str,
    end_offset: i64,
) -> EngineResult<()> {
    check_class(class_name)?;
    if Path::new(old_path).is_file() {
        return restore_file(old_path, new_path, end_offset);
    }
    let Some(num_shards) = detect_shard_count(old_path) else {
        return Err(Status::with_message(
            StatusCode::NotFoundError,
            format!("no database at {old_path}"),
        ));
    };
    for idx in 0..num_shards {
        restore_file(
            &shard_path(old_path, idx, num_shards),
            &shard_path(new_path, idx, num_shards),
            end_offset,
        )?;
    }
    Ok(())
}

fn restore_file(old_path: &str, new_path: &str, end_offset: i64) -> EngineResult<()> {
    let data = std::fs::read(old_path).map_err(|e| io_status(&e, "read failed"))?;
    let limit = usize::try_from(end_offset).map_or(data.len(), |end| end.min(data.len()));
    let data = data.get(..limit).unwrap_or_default();
    let body = data.strip_prefix(TREE_MAGIC.as_slice()).ok_or_else(|| {
        Status::with_message(StatusCode::BrokenDataError, "invalid magic data")
    })?;
    let pairs = salvage_pairs(body);
    let salvaged = pairs.len();
    let records: RecordMap = pairs.into_iter().collect();
    if records.len() < salvaged {
        warn!(old_path, "duplicate keys collapsed during restore");
    }
    write_new_file(Path::new(new_path), &encode_data_file(&records), true)?;
    info!(old_path, new_path, records = records.len(), "restored database");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_selects_engine() {
        let mut params = Params::new();
        let engine = open_database("", true, &OpenOptions::default(), &params).unwrap();
        assert_eq!(engine.class_name(), TREE_CLASS);

        params.insert("num_shards".to_owned(), "2".to_owned());
        let engine = open_database("", true, &OpenOptions::default(), &params).unwrap();
        assert_eq!(engine.class_name(), crate::shard::SHARD_CLASS);

        params.insert("dbm".to_owned(), "HashDBM".to_owned());
        let err = open_database("", true, &OpenOptions::default(), &params)
            .err()
            .unwrap();
        assert_eq!(err, StatusCode::InvalidArgumentError);
    }

    #[test]
    fn test_restore_salvages_intact_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.tree");
        let new = dir.path().join("new.tree");
        let (old, new) = (old.to_str().unwrap(), new.to_str().unwrap());

        let engine = TreeEngine::open(old, true, &OpenOptions::default()).unwrap();
        for i in 0..10 {
            engine.set(format!("{i}").as_bytes(), b"value", true).unwrap();
        }
        engine.close().unwrap();

        let mut data = std::fs::read(old).unwrap();
        let cut = data.len() - 3;
        data.truncate(cut);
        std::fs::write(old, &data).unwrap();

        restore_database(old, new, "", -1).unwrap();
        let restored = TreeEngine::open(new, false, &OpenOptions::default()).unwrap();
        assert_eq!(restored.count().unwrap(), 9);
    }

    #[test]
    fn test_restore_missing_database() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("absent");
        let err = restore_database(old.to_str().unwrap(), "unused", "", -1).unwrap_err();
        assert_eq!(err, StatusCode::NotFoundError);
    }
}
