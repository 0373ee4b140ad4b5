//! Filesystem-backed persistence for Mirage imposters.
//!
//! An imposter is a mock server identified by its port; it owns an ordered
//! list of stubs (predicate/response rules) and a log of received requests.
//! This crate is the durability and concurrency layer beneath the matching
//! engine: it is consulted on every mock request to pick the next response
//! and mutated by the admin API, with several worker processes sharing one
//! data directory.
//!
//! Layout under the configured datadir:
//!
//! ```text
//! {datadir}/{port}/imposter.json                     header + stub order
//! {datadir}/{port}/stubs/{n}/meta.json               response cycle state
//! {datadir}/{port}/stubs/{n}/responses/{m}.json      response payloads
//! {datadir}/{port}/requests/{epoch}-{pid}-{counter}.json
//! ```
//!
//! Locking is deliberately fine-grained: the header is locked only while a
//! stub-list splice is rewritten, each stub's `meta.json` has its own lock
//! for cursor advances, and response/request files are never locked: the
//! former are immutable once written, the latter have globally unique names.

pub mod error;
pub mod fs;
pub mod imposters;
pub mod stubs;
pub mod types;

pub use error::{Result, StoreError};
pub use imposters::{ImposterRepository, StopFn};
pub use stubs::{NextResponse, StubHandle, StubMatch, StubRepository};
pub use types::{ImposterHeader, RequestFileName, Stub, StubEntry, StubMeta, StubMetaRef};
