//! Pattern search over database keys and file lines.

use std::str::FromStr;

use dbmbind_core::{Status, StatusCode};
use regex::bytes::Regex;

use crate::engine::{Engine, EngineResult};

/// Matching mode of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Candidates containing the pattern.
    Contain,
    /// Case-insensitive `Contain`.
    ContainCase,
    /// Candidates containing the pattern as a whole word.
    ContainWord,
    /// Case-insensitive `ContainWord`.
    ContainCaseWord,
    /// Candidates starting with the pattern.
    Begin,
    /// Candidates ending with the pattern.
    End,
    /// Candidates matching a regular expression.
    Regex,
    /// Nearest candidates by edit distance over UTF-8 characters.
    Edit,
    /// Nearest candidates by edit distance over bytes.
    EditBin,
    /// Candidates greater than the pattern, ascending.
    Upper,
    /// Candidates greater than or equal to the pattern, ascending.
    UpperInc,
    /// Candidates less than the pattern, descending.
    Lower,
    /// Candidates less than or equal to the pattern, descending.
    LowerInc,
}

impl FromStr for SearchMode {
    type Err = Status;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        Ok(match mode {
            "contain" => Self::Contain,
            "containcase" => Self::ContainCase,
            "containword" => Self::ContainWord,
            "containcaseword" => Self::ContainCaseWord,
            "begin" => Self::Begin,
            "end" => Self::End,
            "regex" => Self::Regex,
            "edit" => Self::Edit,
            "editbin" => Self::EditBin,
            "upper" => Self::Upper,
            "upperinc" => Self::UpperInc,
            "lower" => Self::Lower,
            "lowerinc" => Self::LowerInc,
            other => {
                return Err(Status::with_message(
                    StatusCode::InvalidArgumentError,
                    format!("unknown mode: {other}"),
                ));
            },
        })
    }
}

enum Matcher {
    Filter(Box<dyn Fn(&[u8]) -> bool>),
    Nearest(Box<dyn Fn(&[u8]) -> usize>),
}

impl Matcher {
    fn new(mode: SearchMode, pattern: &[u8]) -> EngineResult<Self> {
        let pattern = pattern.to_vec();
        let filter = |f: Box<dyn Fn(&[u8]) -> bool>| Ok(Self::Filter(f));
        match mode {
            SearchMode::Contain => filter(Box::new(move |c: &[u8]| contains(c, &pattern))),
            SearchMode::ContainCase => {
                let pattern = pattern.to_ascii_lowercase();
                filter(Box::new(move |c: &[u8]| contains(&c.to_ascii_lowercase(), &pattern)))
            },
            SearchMode::ContainWord => {
                filter(Box::new(move |c: &[u8]| contains_word(c, &pattern)))
            },
            SearchMode::ContainCaseWord => {
                let pattern = pattern.to_ascii_lowercase();
                filter(Box::new(move |c: &[u8]| {
                    contains_word(&c.to_ascii_lowercase(), &pattern)
                }))
            },
            SearchMode::Begin => filter(Box::new(move |c: &[u8]| c.starts_with(&pattern))),
            SearchMode::End => filter(Box::new(move |c: &[u8]| c.ends_with(&pattern))),
            SearchMode::Regex => {
                let regex = Regex::new(&String::from_utf8_lossy(&pattern)).map_err(|e| {
                    Status::with_message(
                        StatusCode::InvalidArgumentError,
                        format!("invalid regex: {e}"),
                    )
                })?;
                filter(Box::new(move |c: &[u8]| regex.is_match(c)))
            },
            SearchMode::Upper => filter(Box::new(move |c: &[u8]| c > pattern.as_slice())),
            SearchMode::UpperInc => filter(Box::new(move |c: &[u8]| c >= pattern.as_slice())),
            SearchMode::Lower => filter(Box::new(move |c: &[u8]| c < pattern.as_slice())),
            SearchMode::LowerInc => filter(Box::new(move |c: &[u8]| c <= pattern.as_slice())),
            SearchMode::Edit => {
                let pattern = String::from_utf8_lossy(&pattern).into_owned();
                Ok(Self::Nearest(Box::new(move |c: &[u8]| {
                    edit_distance_lev(&pattern, &String::from_utf8_lossy(c))
                })))
            },
            SearchMode::EditBin => Ok(Self::Nearest(Box::new(move |c: &[u8]| {
                edit_distance_bytes(&pattern, c)
            }))),
        }
    }
}

/// Search a stream of candidates in order.
///
/// A `capacity` of zero means unlimited. Filter modes keep candidates in the
/// order given, except `lower`/`lowerinc` which return them descending.
/// Edit modes return the nearest candidates, ties kept in input order.
///
/// # Errors
///
/// `INVALID_ARGUMENT_ERROR` for a malformed regular expression.
pub fn search_candidates<'a>(
    candidates: impl IntoIterator<Item = &'a [u8]>,
    mode: SearchMode,
    pattern: &[u8],
    capacity: usize,
) -> EngineResult<Vec<Vec<u8>>> {
    let limit = if capacity == 0 { usize::MAX } else { capacity };
    let descending = matches!(mode, SearchMode::Lower | SearchMode::LowerInc);
    match Matcher::new(mode, pattern)? {
        Matcher::Filter(accept) => {
            let hits = candidates.into_iter().filter(|c| accept(*c));
            if descending {
                let mut all: Vec<Vec<u8>> = hits.map(<[u8]>::to_vec).collect();
                all.reverse();
                all.truncate(limit);
                Ok(all)
            } else {
                Ok(hits.take(limit).map(<[u8]>::to_vec).collect())
            }
        },
        Matcher::Nearest(distance) => {
            let mut scored: Vec<(usize, Vec<u8>)> = candidates
                .into_iter()
                .map(|c| (distance(c), c.to_vec()))
                .collect();
            scored.sort_by_key(|(dist, _)| *dist);
            scored.truncate(limit);
            Ok(scored.into_iter().map(|(_, c)| c).collect())
        },
    }
}

/// Search the keys of a database.
///
/// # Errors
///
/// `INVALID_ARGUMENT_ERROR` for an unknown mode or a malformed regular
/// expression, or any failure from the engine.
pub fn search_engine(
    engine: &dyn Engine,
    mode: &str,
    pattern: &[u8],
    capacity: usize,
) -> EngineResult<Vec<Vec<u8>>> {
    let mode = mode.parse::<SearchMode>()?;
    let mut keys = Vec::new();
    engine.for_each(&mut |key, _| {
        keys.push(key.to_vec());
        true
    })?;
    search_candidates(keys.iter().map(Vec::as_slice), mode, pattern, capacity)
}

/// Search the lines of a text buffer; a trailing newline does not produce an
/// empty final line.
///
/// # Errors
///
/// `INVALID_ARGUMENT_ERROR` for an unknown mode or a malformed regular
/// expression.
pub fn search_lines(
    content: &[u8],
    mode: &str,
    pattern: &[u8],
    capacity: usize,
) -> EngineResult<Vec<Vec<u8>>> {
    let mode = mode.parse::<SearchMode>()?;
    let body = content.strip_suffix(b"\n").unwrap_or(content);
    if body.is_empty() && content.len() <= 1 {
        return Ok(Vec::new());
    }
    search_candidates(body.split(|b| *b == b'\n'), mode, pattern, capacity)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find_all(haystack, needle).next().is_some()
}

fn contains_word(haystack: &[u8], needle: &[u8]) -> bool {
    find_all(haystack, needle).any(|start| {
        let before = start
            .checked_sub(1)
            .and_then(|idx| haystack.get(idx))
            .is_none_or(|b| !b.is_ascii_alphanumeric());
        let after = haystack
            .get(start.saturating_add(needle.len()))
            .is_none_or(|b| !b.is_ascii_alphanumeric());
        before && after
    })
}

fn find_all<'a>(haystack: &'a [u8], needle: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
    let last = haystack.len().checked_sub(needle.len());
    (0..=last.unwrap_or(0))
        .filter(move |_| last.is_some())
        .filter(move |start| haystack[*start..].starts_with(needle))
}

/// Levenshtein distance over UTF-8 characters.
#[must_use]
pub fn edit_distance_lev(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    levenshtein(&a, &b)
}

/// Levenshtein distance over raw bytes.
#[must_use]
pub fn edit_distance_bytes(a: &[u8], b: &[u8]) -> usize {
    levenshtein(a, b)
}

fn levenshtein<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0usize; b.len().saturating_add(1)];
    for (i, ca) in a.iter().enumerate() {
        row[0] = i.saturating_add(1);
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            let substitute = prev[j].saturating_add(cost);
            let delete = prev[j.saturating_add(1)].saturating_add(1);
            let insert = row[j].saturating_add(1);
            row[j.saturating_add(1)] = substitute.min(delete).min(insert);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeEngine;

    fn numbered() -> TreeEngine {
        let engine = TreeEngine::in_memory();
        for i in 1..=100 {
            let key = format!("{i:08}");
            engine.set(key.as_bytes(), b"", true).unwrap();
        }
        engine
    }

    #[test]
    fn test_search_modes_over_keys() {
        let engine = numbered();
        let count = |mode: &str, pattern: &str, capacity| {
            search_engine(&engine, mode, pattern.as_bytes(), capacity)
                .unwrap()
                .len()
        };
        assert_eq!(count("contain", "001", 0), 12);
        assert_eq!(count("contain", "001", 3), 3);
        assert_eq!(count("begin", "0000001", 0), 10);
        assert_eq!(count("end", "1", 0), 10);
        assert_eq!(count("regex", r"^\d+1$", 0), 10);
        assert_eq!(count("regex", r"^\d+1$", 3), 3);
        assert_eq!(count("edit", "00000100", 3), 3);
        assert_eq!(count("editbin", "00000100", 3), 3);
        assert_eq!(count("upper", "00000095", 0), 5);
        assert_eq!(count("lowerinc", "00000005", 0), 5);
    }

    #[test]
    fn test_edit_search_orders_by_distance() {
        let engine = numbered();
        let hits = search_engine(&engine, "edit", b"00000100", 1).unwrap();
        assert_eq!(hits, vec![b"00000100".to_vec()]);
    }

    #[test]
    fn test_lower_is_descending() {
        let engine = numbered();
        let hits = search_engine(&engine, "lower", b"00000004", 0).unwrap();
        assert_eq!(
            hits,
            vec![b"00000003".to_vec(), b"00000002".to_vec(), b"00000001".to_vec()]
        );
    }

    #[test]
    fn test_unknown_mode_and_bad_regex() {
        let engine = numbered();
        let err = search_engine(&engine, "foo", b"", 0).unwrap_err();
        assert_eq!(err, StatusCode::InvalidArgumentError);
        let err = search_engine(&engine, "regex", b"(", 0).unwrap_err();
        assert_eq!(err, StatusCode::InvalidArgumentError);
    }

    #[test]
    fn test_word_and_case_modes() {
        let lines = b"Hello world\nhelloworld\nsay HELLO\n";
        assert_eq!(search_lines(lines, "containword", b"Hello", 0).unwrap().len(), 1);
        assert_eq!(search_lines(lines, "containcase", b"hello", 0).unwrap().len(), 3);
        assert_eq!(
            search_lines(lines, "containcaseword", b"hello", 0).unwrap().len(),
            2
        );
        assert!(search_lines(b"", "contain", b"x", 0).unwrap().is_empty());
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance_lev("", "abc"), 3);
        assert_eq!(edit_distance_lev("kitten", "sitting"), 3);
        assert_eq!(edit_distance_lev("日本語", "日本"), 1);
        assert_eq!(edit_distance_bytes("日本語".as_bytes(), "日本".as_bytes()), 3);
    }
}
