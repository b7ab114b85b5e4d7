//! Open and tuning parameters.
//!
//! The host passes options as a loose map. Keys and values are stringified
//! on entry; the binding then takes out the keys it handles itself and
//! forwards the rest to the engine untouched.

use dbmbind_engine::OpenOptions;

use crate::value::HostValue;

pub use dbmbind_engine::Params;

/// Keys consumed by the binding and never forwarded to the engine.
const PRIVATE_KEYS: [&str; 7] = [
    "concurrent",
    "truncate",
    "no_create",
    "no_wait",
    "no_lock",
    "sync_hard",
    "encoding",
];

/// Build a parameter map from host keys and values.
pub fn params<K, V, I>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<HostValue>,
    V: Into<HostValue>,
{
    pairs
        .into_iter()
        .map(|(key, value)| {
            (
                key.into().to_string_lossy(),
                value.into().to_string_lossy(),
            )
        })
        .collect()
}

/// Parse a stringified flag.
#[must_use]
pub fn str_to_bool(text: &str) -> bool {
    matches!(
        text.trim().to_ascii_lowercase().as_str(),
        "true" | "t" | "yes" | "y" | "on" | "1"
    )
}

/// Parameters of an open call, split into binding and engine parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct OpenParams {
    pub(crate) concurrent: bool,
    pub(crate) options: OpenOptions,
    pub(crate) encoding: String,
    pub(crate) engine: Params,
}

impl OpenParams {
    pub(crate) fn split(params: &Params) -> Self {
        let flag = |name: &str| params.get(name).is_some_and(|v| str_to_bool(v));
        let engine = params
            .iter()
            .filter(|(key, _)| !PRIVATE_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Self {
            concurrent: flag("concurrent"),
            options: OpenOptions {
                truncate: flag("truncate"),
                no_create: flag("no_create"),
                no_wait: flag("no_wait"),
                no_lock: flag("no_lock"),
                sync_hard: flag("sync_hard"),
            },
            encoding: params.get("encoding").cloned().unwrap_or_default(),
            engine,
        }
    }
}
