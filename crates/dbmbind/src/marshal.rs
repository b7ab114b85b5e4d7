//! Conversion of native results into host values.
//!
//! Every byte string leaving a handle is tagged with the handle's encoding.
//! Engine failures are reported as [`Status`] values, either through an
//! optional out-parameter or as the status half of a returned pair.

use std::collections::BTreeMap;

use dbmbind_core::Status;
use dbmbind_engine::EngineResult;

use crate::encoding::{Encoding, RString};
use crate::future::FutureValue;

/// Records returned to the host, keyed and ordered by key bytes.
pub type RecordMap = BTreeMap<RString, RString>;

pub(crate) fn string(bytes: Vec<u8>, encoding: Encoding) -> RString {
    RString::new(bytes, encoding)
}

pub(crate) fn list(items: Vec<Vec<u8>>, encoding: Encoding) -> Vec<RString> {
    items
        .into_iter()
        .map(|item| RString::new(item, encoding))
        .collect()
}

pub(crate) fn map(records: BTreeMap<Vec<u8>, Vec<u8>>, encoding: Encoding) -> RecordMap {
    records
        .into_iter()
        .map(|(key, value)| (RString::new(key, encoding), RString::new(value, encoding)))
        .collect()
}

/// Store `status` in the caller's out-parameter, if any.
pub(crate) fn report(out: Option<&mut Status>, status: Status) {
    if let Some(out) = out {
        *out = status;
    }
}

/// Split an engine result into its value and a status for the caller.
pub(crate) fn settle<T>(result: EngineResult<T>, out: Option<&mut Status>) -> Option<T> {
    match result {
        Ok(value) => {
            report(out, Status::success());
            Some(value)
        },
        Err(status) => {
            report(out, status);
            None
        },
    }
}

/// Collapse a unit engine result into a status.
pub(crate) fn status_of(result: EngineResult<()>) -> Status {
    result.err().unwrap_or_default()
}

/// A native result produced on a worker thread, before marshaling.
#[derive(Debug)]
pub(crate) enum Payload {
    Status(Status),
    String(Status, Option<Vec<u8>>),
    StringList(Status, Vec<Vec<u8>>),
    StringMap(Status, BTreeMap<Vec<u8>, Vec<u8>>),
    Integer(Status, i64),
}

/// Which payload shape an operation produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    Status,
    String,
    StringList,
    StringMap,
    Integer,
}

impl Payload {
    /// A payload of the given shape carrying only a failure.
    pub(crate) fn failure(shape: Shape, status: Status) -> Self {
        match shape {
            Shape::Status => Self::Status(status),
            Shape::String => Self::String(status, None),
            Shape::StringList => Self::StringList(status, Vec::new()),
            Shape::StringMap => Self::StringMap(status, BTreeMap::new()),
            Shape::Integer => Self::Integer(status, 0),
        }
    }

    pub(crate) fn from_unit(result: EngineResult<()>) -> Self {
        Self::Status(status_of(result))
    }

    pub(crate) fn into_value(self, encoding: Encoding) -> FutureValue {
        match self {
            Self::Status(status) => FutureValue::Status(status),
            Self::String(status, value) => {
                FutureValue::String(status, value.map(|v| string(v, encoding)))
            },
            Self::StringList(status, items) => {
                FutureValue::StringList(status, list(items, encoding))
            },
            Self::StringMap(status, records) => {
                FutureValue::StringMap(status, map(records, encoding))
            },
            Self::Integer(status, value) => FutureValue::Integer(status, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbmbind_core::StatusCode;

    #[test]
    fn test_settle_reports_status() {
        let mut status = Status::new(StatusCode::UnknownError);
        let value = settle(Ok::<_, Status>(5), Some(&mut status));
        assert_eq!(value, Some(5));
        assert!(status.is_ok());

        let value = settle::<i32>(Err(StatusCode::NotFoundError.into()), Some(&mut status));
        assert_eq!(value, None);
        assert_eq!(status, StatusCode::NotFoundError);

        assert_eq!(settle::<i32>(Err(StatusCode::NotFoundError.into()), None), None);
    }

    #[test]
    fn test_map_carries_encoding() {
        let mut records = BTreeMap::new();
        records.insert(b"k".to_vec(), b"v".to_vec());
        let converted = map(records, Encoding::Utf8);
        let (key, value) = converted.iter().next().unwrap();
        assert_eq!(key.encoding(), Encoding::Utf8);
        assert_eq!(value.encoding(), Encoding::Utf8);
        assert_eq!(converted[b"k".as_slice()], "v");
    }

    #[test]
    fn test_failure_keeps_shape() {
        let status = Status::new(StatusCode::PreconditionError);
        match Payload::failure(Shape::StringMap, status).into_value(Encoding::Binary) {
            FutureValue::StringMap(status, records) => {
                assert_eq!(status, StatusCode::PreconditionError);
                assert!(records.is_empty());
            },
            other => panic!("unexpected value: {other:?}"),
        }
    }
}
