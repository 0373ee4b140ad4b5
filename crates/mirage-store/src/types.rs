//! Persisted schemas and the types exchanged with collaborators.
//!
//! Predicates and responses are opaque JSON throughout: this crate stores
//! and orders them but never interprets them, with the single exception of
//! `_behaviors.repeat` which sizes a response's share of the cycle.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// On-disk header of one imposter (`{port}/imposter.json`): the protocol
/// configuration this crate treats as opaque, plus the ordered stub list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImposterHeader {
    #[serde(flatten)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub stubs: Vec<StubEntry>,
}

/// One stub as recorded in the header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StubEntry {
    #[serde(default)]
    pub predicates: Vec<Value>,
    pub meta: StubMetaRef,
}

/// Pointer from a header entry to the stub's directory. The directory name
/// is stable for the stub's lifetime; it is never renumbered when other
/// stubs are inserted or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StubMetaRef {
    pub dir: String,
}

/// Cycling state of one stub (`{stubDir}/meta.json`).
///
/// `order_with_repeats` is the pre-expanded cycle: each element indexes into
/// `response_files`, and a response with repeat `r` occupies `r` consecutive
/// positions. `next_index` is the cursor into that sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StubMeta {
    pub response_files: Vec<String>,
    pub order_with_repeats: Vec<usize>,
    pub next_index: usize,
}

/// Stub definition as exchanged with the matching engine and the admin API:
/// opaque predicates plus opaque responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stub {
    #[serde(default)]
    pub predicates: Vec<Value>,
    #[serde(default)]
    pub responses: Vec<Value>,
}

/// How many consecutive cycle positions a response occupies:
/// `_behaviors.repeat`, defaulting to one, floored at one.
pub fn repeats_for(response: &Value) -> usize {
    response
        .get("_behaviors")
        .and_then(|behaviors| behaviors.get("repeat"))
        .and_then(Value::as_u64)
        .map_or(1, |repeat| repeat.max(1) as usize)
}

/// The response handed out when no stub matched: an empty `is`.
pub fn default_response() -> Value {
    json!({ "is": {} })
}

/// Ordering key parsed from a request filename, `{epoch}-{pid}-{counter}.json`.
///
/// Epoch millisecond, writer pid and a per-writer counter make the name
/// unique across every process sharing the data directory, and the derived
/// lexicographic order is the load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestFileName {
    pub epoch: u64,
    pub pid: u64,
    pub counter: u64,
}

impl RequestFileName {
    /// Parses a directory entry name; anything not matching
    /// `{epoch}-{pid}-{counter}.json` yields `None`.
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".json")?;
        let mut parts = stem.splitn(3, '-');
        let epoch = parts.next()?.parse().ok()?;
        let pid = parts.next()?.parse().ok()?;
        let counter = parts.next()?.parse().ok()?;
        Some(Self {
            epoch,
            pid,
            counter,
        })
    }
}

impl std::fmt::Display for RequestFileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}.json", self.epoch, self.pid, self.counter)
    }
}
