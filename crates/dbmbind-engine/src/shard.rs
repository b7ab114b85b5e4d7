//! Sharded engine spreading records over several tree shards.

use std::collections::BTreeMap;
use std::path::Path;

use dbmbind_core::{Status, StatusCode};
use tracing::{info, warn};

use crate::engine::{Engine, EngineResult, OpenOptions, Params, Record, RecordAction, Seek};
use crate::lock::write_new_file;
use crate::tree::{TREE_CLASS, TreeEngine, encode_data_file, exchange_in};

/// Class name reported by [`ShardEngine`].
pub const SHARD_CLASS: &str = "ShardDBM";

/// Engine routing each key to one of several [`TreeEngine`] shards.
///
/// Shard files are named `<path>-NNNNN-of-MMMMM`. Navigation merges across
/// shards so the whole database stays ordered.
#[derive(Debug)]
pub struct ShardEngine {
    shards: Vec<TreeEngine>,
    path: String,
}

impl ShardEngine {
    /// Open `num_shards` shards under `path`; zero detects the count from
    /// existing shard files and falls back to one.
    ///
    /// # Errors
    ///
    /// The first failure opening any shard.
    pub fn open(
        path: &str,
        num_shards: usize,
        writable: bool,
        options: &OpenOptions,
    ) -> EngineResult<Self> {
        let num_shards = match num_shards {
            0 => detect_shard_count(path).unwrap_or(1),
            n => n,
        };
        let mut shards = Vec::with_capacity(num_shards);
        for idx in 0..num_shards {
            let shard_path = if path.is_empty() {
                String::new()
            } else {
                shard_path(path, idx, num_shards)
            };
            match TreeEngine::open(&shard_path, writable, options) {
                Ok(shard) => shards.push(shard),
                Err(err) => {
                    for opened in &shards {
                        if let Err(status) = opened.close() {
                            warn!(path, %status, "failed to close shard after a failed open");
                        }
                    }
                    return Err(err);
                },
            }
        }
        info!(path, num_shards, writable, "opened shard database");
        Ok(Self {
            shards,
            path: path.to_owned(),
        })
    }

    /// Number of shards.
    #[must_use]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn route(&self, key: &[u8]) -> usize {
        shard_index(key, self.shards.len())
    }

    fn shard(&self, key: &[u8]) -> EngineResult<&TreeEngine> {
        self.shards
            .get(self.route(key))
            .ok_or_else(|| Status::with_message(StatusCode::PreconditionError, "no shards"))
    }

    fn all(&self, mut op: impl FnMut(&TreeEngine) -> EngineResult<()>) -> EngineResult<()> {
        let mut status = Status::success();
        for shard in &self.shards {
            if let Err(err) = op(shard) {
                status |= err;
            }
        }
        status.into_result()
    }

    fn sum(&self, op: impl Fn(&TreeEngine) -> EngineResult<i64>) -> EngineResult<i64> {
        self.shards
            .iter()
            .try_fold(0i64, |acc, shard| Ok(acc.saturating_add(op(shard)?)))
    }
}

impl Engine for ShardEngine {
    fn class_name(&self) -> &'static str {
        SHARD_CLASS
    }

    fn get(&self, key: &[u8]) -> EngineResult<Vec<u8>> {
        self.shard(key)?.get(key)
    }

    fn process(
        &self,
        key: &[u8],
        proc: &mut dyn FnMut(Option<&[u8]>) -> RecordAction,
    ) -> EngineResult<()> {
        self.shard(key)?.process(key, proc)
    }

    fn compare_exchange_multi(
        &self,
        expected: &[(&[u8], Option<&[u8]>)],
        desired: &[(&[u8], Option<&[u8]>)],
    ) -> EngineResult<()> {
        // Every shard is locked in index order, so concurrent transactions
        // cannot interleave.
        let mut guards = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            guards.push(shard.lock_records()?);
        }
        exchange_in(&mut guards, |key| self.route(key), expected, desired)?;
        drop(guards);
        let touched = desired.iter().map(|(key, _)| self.route(key));
        for idx in touched {
            if let Some(shard) = self.shards.get(idx) {
                shard.touch();
            }
        }
        Ok(())
    }

    fn pop_first(&self) -> EngineResult<Record> {
        loop {
            let Some((key, _)) = self.seek(Seek::First)? else {
                return Err(Status::new(StatusCode::NotFoundError));
            };
            match self.shard(&key)?.remove_and_get(&key) {
                Ok(value) => return Ok((key, value)),
                // Lost a race with another remover; look again.
                Err(err) if err == StatusCode::NotFoundError => {},
                Err(err) => return Err(err),
            }
        }
    }

    fn seek(&self, target: Seek<'_>) -> EngineResult<Option<Record>> {
        let mut best: Option<Record> = None;
        for shard in &self.shards {
            let Some(candidate) = shard.seek(target)? else {
                continue;
            };
            let better = best.as_ref().is_none_or(|(key, _)| {
                if target.is_backward() {
                    candidate.0 > *key
                } else {
                    candidate.0 < *key
                }
            });
            if better {
                best = Some(candidate);
            }
        }
        Ok(best)
    }

    fn for_each(&self, visitor: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> EngineResult<()> {
        let mut merged = BTreeMap::new();
        for shard in &self.shards {
            merged.append(&mut shard.snapshot()?);
        }
        for (key, value) in &merged {
            if !visitor(key, value) {
                break;
            }
        }
        Ok(())
    }

    fn count(&self) -> EngineResult<i64> {
        self.sum(TreeEngine::count)
    }

    fn file_size(&self) -> EngineResult<i64> {
        self.sum(TreeEngine::file_size)
    }

    fn file_path(&self) -> EngineResult<String> {
        Ok(self.path.clone())
    }

    fn timestamp(&self) -> EngineResult<f64> {
        self.shards
            .iter()
            .try_fold(0.0f64, |acc, shard| Ok(acc.max(shard.timestamp()?)))
    }

    fn clear(&self) -> EngineResult<()> {
        self.all(TreeEngine::clear)
    }

    fn rebuild(&self, params: &Params) -> EngineResult<()> {
        self.all(|shard| shard.rebuild(params))
    }

    fn should_be_rebuilt(&self) -> bool {
        self.shards.iter().any(TreeEngine::should_be_rebuilt)
    }

    fn synchronize(&self, hard: bool, params: &Params) -> EngineResult<()> {
        self.all(|shard| shard.synchronize(hard, params))
    }

    fn copy_file_data(&self, dest: &str, sync_hard: bool) -> EngineResult<()> {
        let num_shards = self.shards.len();
        for (idx, shard) in self.shards.iter().enumerate() {
            let data = encode_data_file(&shard.snapshot()?);
            write_new_file(
                Path::new(&shard_path(dest, idx, num_shards)),
                &data,
                sync_hard,
            )?;
        }
        Ok(())
    }

    fn inspect(&self) -> Vec<(String, String)> {
        let count = self.count().unwrap_or(0);
        vec![
            ("class".to_owned(), TREE_CLASS.to_owned()),
            ("path".to_owned(), self.path.clone()),
            ("num_shards".to_owned(), self.shards.len().to_string()),
            ("num_records".to_owned(), count.to_string()),
            ("writable".to_owned(), self.is_writable().to_string()),
            ("healthy".to_owned(), self.is_healthy().to_string()),
        ]
    }

    fn is_writable(&self) -> bool {
        self.shards.iter().all(TreeEngine::is_writable)
    }

    fn is_healthy(&self) -> bool {
        self.shards.iter().all(TreeEngine::is_healthy)
    }

    fn is_ordered(&self) -> bool {
        true
    }

    fn close(&self) -> EngineResult<()> {
        let result = self.all(TreeEngine::close);
        info!(path = %self.path, "closed shard database");
        result
    }
}

/// Path of one shard file.
#[must_use]
pub fn shard_path(base: &str, idx: usize, num_shards: usize) -> String {
    format!("{base}-{idx:05}-of-{num_shards:05}")
}

/// Shard index of a key.
#[must_use]
pub fn shard_index(key: &[u8], num_shards: usize) -> usize {
    let hash = blake3::hash(key);
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[..8]);
    let num_shards = u64::try_from(num_shards.max(1)).unwrap_or(1);
    let idx = u64::from_le_bytes(head).checked_rem(num_shards).unwrap_or(0);
    usize::try_from(idx).unwrap_or(0)
}

/// Detect the shard count from `<path>-00000-of-NNNNN` on disk.
#[must_use]
pub fn detect_shard_count(path: &str) -> Option<usize> {
    if path.is_empty() {
        return None;
    }
    let base = Path::new(path);
    let dir = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    let prefix = format!("{}-00000-of-", base.file_name()?.to_string_lossy());
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_prefix(&prefix)?.parse::<usize>().ok()
        })
        .find(|count| *count > 0)
}
