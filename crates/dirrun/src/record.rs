//! # On-disk Records
//!
//! A call record is a JSON object with up to three keys: `a` (positional
//! arguments), `k` (named arguments) and `r` (the result). The existence of
//! the file means the call was accepted; the presence of `r` means it was
//! completed, even when `r` is `null`. An attribute record holds a single
//! `v` key.

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::value::Args;

/// Correlation id of one call within one method directory.
///
/// Ids up to [`CallId::RESERVED`] are kept for internal use; the first id
/// handed to a caller is 11. `Display` prints the bare number because it is
/// also the record's file name.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl CallId {
    pub const RESERVED: u64 = 10;

    /// "No call yet": the floor every method directory starts from.
    pub const FLOOR: CallId = CallId(Self::RESERVED);

    pub const FIRST: CallId = CallId(Self::RESERVED + 1);

    pub fn next(self) -> CallId {
        CallId(self.0 + 1)
    }

    /// True for ids a caller may have been issued.
    pub fn is_user(self) -> bool {
        self.0 > Self::RESERVED
    }

    /// Parses a directory entry name; only canonical decimal names (digits,
    /// no leading zero) are call records, so the name always matches
    /// `Display`.
    pub fn parse(name: &str) -> Option<CallId> {
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if name.len() > 1 && name.starts_with('0') {
            return None;
        }
        name.parse().ok().map(CallId)
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The persisted request/result pair for one invocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    #[serde(rename = "a", default)]
    pub args: Vec<Value>,
    #[serde(rename = "k", default)]
    pub kwargs: Map<String, Value>,
    #[serde(
        rename = "r",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub result: Option<Value>,
}

impl CallRecord {
    pub fn request(args: &Args) -> Self {
        Self {
            args: args.positional().to_vec(),
            kwargs: args.named_args().clone(),
            result: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.result.is_some()
    }

    pub fn to_args(&self) -> Args {
        Args::from_parts(self.args.clone(), self.kwargs.clone())
    }
}

/// A present `"r": null` is a completed call with a null result, not a pending one.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// The persisted mirror of one attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttrRecord {
    #[serde(rename = "v", default)]
    pub value: Value,
}
