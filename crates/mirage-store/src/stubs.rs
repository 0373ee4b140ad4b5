//! Per-imposter stub repository: stub list CRUD, response cycling with
//! materialized repeat counts, and request logging.
//!
//! All state lives under one imposter directory. The header (`imposter.json`)
//! carries the stub order and is locked only for read-modify-write splices;
//! each stub's `meta.json` is locked independently for cursor advances, so
//! responses on different stubs are selected in parallel; response and
//! request files are never locked at all.

use crate::error::{Result, StoreError};
use crate::fs;
use crate::types::{
    default_response, repeats_for, ImposterHeader, RequestFileName, Stub, StubEntry, StubMeta,
    StubMetaRef,
};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const HEADER_FILE: &str = "imposter.json";
const STUBS_DIR: &str = "stubs";
const REQUESTS_DIR: &str = "requests";

pub(crate) async fn read_header_at(base_dir: &Path) -> Result<ImposterHeader> {
    header_from(
        fs::read_json(&base_dir.join(HEADER_FILE)).await?,
        &base_dir.join(HEADER_FILE),
    )
}

fn header_from(value: Option<Value>, path: &Path) -> Result<ImposterHeader> {
    match value {
        Some(value) => serde_json::from_value(value).map_err(|e| StoreError::parse(path, e)),
        None => Ok(ImposterHeader::default()),
    }
}

fn header_to_value(header: &ImposterHeader, path: &Path) -> Result<Value> {
    serde_json::to_value(header).map_err(|e| StoreError::parse(path, e))
}

fn meta_from(value: Value, path: &Path) -> Result<StubMeta> {
    serde_json::from_value(value).map_err(|e| StoreError::parse(path, e))
}

fn meta_to_value(meta: &StubMeta, path: &Path) -> Result<Value> {
    serde_json::to_value(meta).map_err(|e| StoreError::parse(path, e))
}

/// True when a response was captured from a proxied upstream call.
fn is_proxy_recording(response: &Value) -> bool {
    response
        .get("is")
        .and_then(|is| is.get("_proxyResponseTime"))
        .map_or(false, |time| !time.is_null())
}

/// Repository for the stubs and request log of a single imposter, bound to
/// that imposter's directory. Obtain instances through
/// [`crate::ImposterRepository::stubs_for`], which hands out one per port so
/// the request counter stays monotonic within the process.
pub struct StubRepository {
    base_dir: PathBuf,
    /// Disambiguates request files written in the same millisecond by this
    /// process.
    request_counter: AtomicU64,
    /// High-water mark for stub directory numbering. Deleted directories
    /// leave no trace on disk, so reuse is prevented here.
    dir_watermark: AtomicU64,
}

/// Result of [`StubRepository::first`]: whether any stub matched, plus a
/// handle that is always usable. On a miss it serves the canonical empty
/// response and ignores mutations.
pub struct StubMatch {
    pub matched: bool,
    pub stub: StubHandle,
}

impl StubRepository {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            request_counter: AtomicU64::new(0),
            dir_watermark: AtomicU64::new(0),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn header_path(&self) -> PathBuf {
        self.base_dir.join(HEADER_FILE)
    }

    fn requests_dir(&self) -> PathBuf {
        self.base_dir.join(REQUESTS_DIR)
    }

    async fn read_header(&self) -> Result<ImposterHeader> {
        read_header_at(&self.base_dir).await
    }

    /// Number of stubs in the header; zero when no header exists yet.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.read_header().await?.stubs.len())
    }

    /// Walks the stub list from `start_index` and returns a handle to the
    /// first stub whose predicates satisfy `filter`.
    pub async fn first<F>(&self, filter: F, start_index: usize) -> Result<StubMatch>
    where
        F: Fn(&[Value]) -> bool,
    {
        let header = self.read_header().await?;
        for entry in header.stubs.iter().skip(start_index) {
            if filter(&entry.predicates) {
                return Ok(StubMatch {
                    matched: true,
                    stub: self.wrap(Some(entry)),
                });
            }
        }
        Ok(StubMatch {
            matched: false,
            stub: self.wrap(None),
        })
    }

    fn wrap(&self, entry: Option<&StubEntry>) -> StubHandle {
        StubHandle {
            base_dir: self.base_dir.clone(),
            stub_dir: entry.map(|e| e.meta.dir.clone()),
            predicates: entry.map(|e| e.predicates.clone()).unwrap_or_default(),
        }
    }

    /// Appends a stub at the end of the list.
    pub async fn add(&self, stub: Stub) -> Result<()> {
        self.insert_at_index(stub, usize::MAX).await
    }

    /// Inserts a stub at `index` (clamped to the list length).
    ///
    /// The stub gets a freshly numbered directory; its response files and
    /// meta are written concurrently with the locked header splice, since
    /// the three touch no common file. A crash in between leaves either an
    /// orphan directory (ignored by readers) or a header entry pointing at a
    /// partially written directory (surfaced per stub on read).
    pub async fn insert_at_index(&self, stub: Stub, index: usize) -> Result<()> {
        let header = self.read_header().await?;
        let stub_dir = self.allocate_stub_dir(&header).await?;

        let mut meta = StubMeta::default();
        let mut files: Vec<(PathBuf, Value)> = Vec::with_capacity(stub.responses.len() + 1);
        for (response_index, response) in stub.responses.iter().enumerate() {
            let response_file = format!("responses/{response_index}.json");
            for _ in 0..repeats_for(response) {
                meta.order_with_repeats.push(response_index);
            }
            files.push((
                self.base_dir.join(&stub_dir).join(&response_file),
                response.clone(),
            ));
            meta.response_files.push(response_file);
        }
        let meta_path = self.base_dir.join(&stub_dir).join("meta.json");
        files.push((meta_path.clone(), meta_to_value(&meta, &meta_path)?));

        let entry = StubEntry {
            predicates: stub.predicates,
            meta: StubMetaRef {
                dir: stub_dir.clone(),
            },
        };

        let header_path = self.header_path();
        let stub_writes =
            futures::future::try_join_all(files.iter().map(|(path, value)| fs::write_json(path, value)));
        let header_splice = fs::locked_read_modify_write(&header_path, |current| {
            let mut header = header_from(current, &header_path)?;
            let at = index.min(header.stubs.len());
            header.stubs.insert(at, entry);
            Ok((header_to_value(&header, &header_path)?, ()))
        });
        tokio::try_join!(stub_writes, header_splice)?;

        debug!(dir = %stub_dir, "stub inserted");
        Ok(())
    }

    /// Picks the next stub directory name. Numbers grow over the maximum of
    /// the header's entries, the directories on disk, and everything this
    /// repository has already handed out, so a deleted stub's number is
    /// never reissued.
    async fn allocate_stub_dir(&self, header: &ImposterHeader) -> Result<String> {
        let on_disk = fs::list_dir_names(&self.base_dir.join(STUBS_DIR)).await?;
        let floor = fs::next_index(
            header
                .stubs
                .iter()
                .map(|entry| entry.meta.dir.as_str())
                .chain(on_disk.iter().map(String::as_str)),
        );
        let previous = self
            .dir_watermark
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |mark| {
                Some(mark.max(floor) + 1)
            })
            .unwrap_or_else(|mark| mark);
        let allocated = previous.max(floor);
        Ok(format!("{STUBS_DIR}/{allocated}"))
    }

    /// Deletes the stub at `index`: its directory first, then the header
    /// entry. Racing a `next_response` against this on the same stub is
    /// outside the API contract.
    pub async fn delete_at_index(&self, index: usize) -> Result<()> {
        let header = self.read_header().await?;
        let entry = header
            .stubs
            .get(index)
            .ok_or_else(|| StoreError::missing_stub(index))?;
        let stub_dir = entry.meta.dir.clone();

        fs::remove_tree(&self.base_dir.join(&stub_dir)).await?;

        let header_path = self.header_path();
        fs::locked_read_modify_write(&header_path, |current| {
            let mut header = header_from(current, &header_path)?;
            // Splice by the stable directory name: concurrent writers may
            // have shifted positions since the unlocked read above.
            header.stubs.retain(|stub| stub.meta.dir != stub_dir);
            Ok((header_to_value(&header, &header_path)?, ()))
        })
        .await?;

        debug!(dir = %stub_dir, "stub deleted");
        Ok(())
    }

    /// Replaces the stub at `index`. Not atomic: between the delete and the
    /// insert the list is one entry short.
    pub async fn overwrite_at_index(&self, stub: Stub, index: usize) -> Result<()> {
        self.delete_at_index(index).await?;
        self.insert_at_index(stub, index).await
    }

    /// Replaces the whole stub list. The header reset and the removal of the
    /// `stubs/` subtree run concurrently; the re-adds run sequentially so
    /// directory allocation stays collision-free.
    pub async fn overwrite_all(&self, stubs: Vec<Stub>) -> Result<()> {
        let header_path = self.header_path();
        let reset_header = fs::locked_read_modify_write(&header_path, |current| {
            let mut header = header_from(current, &header_path)?;
            header.stubs.clear();
            Ok((header_to_value(&header, &header_path)?, ()))
        });
        let stubs_tree_path = self.base_dir.join(STUBS_DIR);
        let clear_tree = fs::remove_tree(&stubs_tree_path);
        tokio::try_join!(reset_header, clear_tree)?;

        for stub in stubs {
            self.add(stub).await?;
        }
        Ok(())
    }

    /// Materializes every stub for the admin API view: predicates plus the
    /// full response list, in cycle-file order, with the on-disk bookkeeping
    /// stripped. A header entry whose meta file is missing is an error; it
    /// means another writer tore the state mid-operation.
    pub async fn to_json(&self) -> Result<Vec<Stub>> {
        let header = self.read_header().await?;
        futures::future::try_join_all(
            header.stubs.iter().map(|entry| self.materialize(entry)),
        )
        .await
    }

    async fn materialize(&self, entry: &StubEntry) -> Result<Stub> {
        let stub_dir = self.base_dir.join(&entry.meta.dir);
        let meta_path = stub_dir.join("meta.json");
        let meta = meta_from(fs::read_json_required(&meta_path).await?, &meta_path)?;

        let response_paths: Vec<PathBuf> = meta
            .response_files
            .iter()
            .map(|file| stub_dir.join(file))
            .collect();
        let responses = futures::future::try_join_all(
            response_paths.iter().map(|path| fs::read_json_required(path)),
        )
        .await?;

        Ok(Stub {
            predicates: entry.predicates.clone(),
            responses,
        })
    }

    /// Records one received request. The stored copy gets a fresh ISO-8601
    /// timestamp, and the filename embeds the same instant as epoch millis
    /// together with the writer's pid and a process-local counter, which
    /// keeps names unique across every process sharing the data directory
    /// without any shared index file.
    pub async fn add_request(&self, request: &Value) -> Result<()> {
        let now = Utc::now();
        let mut stored = request.clone();
        if let Value::Object(map) = &mut stored {
            map.insert(
                "timestamp".to_string(),
                Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        let name = RequestFileName {
            epoch: now.timestamp_millis().max(0) as u64,
            pid: std::process::id() as u64,
            counter: self.request_counter.fetch_add(1, Ordering::SeqCst),
        };
        fs::write_json(&self.requests_dir().join(name.to_string()), &stored).await
    }

    /// Every recorded request, ordered by `(epoch, pid, counter)`.
    pub async fn load_requests(&self) -> Result<Vec<Value>> {
        fs::load_all_in_dir(&self.requests_dir()).await
    }

    /// Drops the request log wholesale.
    pub async fn delete_saved_requests(&self) -> Result<()> {
        fs::remove_tree(&self.requests_dir()).await
    }

    /// Removes every response captured from a proxied upstream, dropping
    /// stubs that end up with no responses at all.
    pub async fn delete_saved_proxy_responses(&self) -> Result<()> {
        let mut stubs = self.to_json().await?;
        for stub in &mut stubs {
            stub.responses.retain(|response| !is_proxy_recording(response));
        }
        stubs.retain(|stub| !stub.responses.is_empty());
        self.overwrite_all(stubs).await
    }
}

/// Snapshot handle to one stub, returned by [`StubRepository::first`].
///
/// Carries the predicates as seen at lookup time and operations bound to the
/// stub's directory. The directory name is the stable identity, so the
/// handle stays valid across unrelated stub-list mutations, but not across
/// its own stub's deletion. An unbound handle (no match) serves the
/// canonical empty response and ignores mutations.
pub struct StubHandle {
    base_dir: PathBuf,
    stub_dir: Option<String>,
    predicates: Vec<Value>,
}

impl StubHandle {
    pub fn predicates(&self) -> &[Value] {
        &self.predicates
    }

    fn meta_path(&self, stub_dir: &str) -> PathBuf {
        self.base_dir.join(stub_dir).join("meta.json")
    }

    /// Appends a response to this stub's cycle, keeping its file index for
    /// the stub's lifetime.
    ///
    /// Deliberately not guarded by the meta lock: proxy recording is
    /// serialized per stub by the caller, and that contract is part of the
    /// upstream API.
    pub async fn add_response(&self, response: &Value) -> Result<()> {
        let Some(stub_dir) = &self.stub_dir else {
            return Ok(());
        };
        let meta_path = self.meta_path(stub_dir);
        let mut meta = meta_from(fs::read_json_required(&meta_path).await?, &meta_path)?;

        let response_index = meta.response_files.len();
        let response_file = format!("responses/{response_index}.json");
        for _ in 0..repeats_for(response) {
            meta.order_with_repeats.push(response_index);
        }
        meta.response_files.push(response_file.clone());

        let response_path = self.base_dir.join(stub_dir).join(&response_file);
        let response_write = fs::write_json(&response_path, response);
        let meta_write = fs::write_json(&meta_path, &meta);
        tokio::try_join!(response_write, meta_write)?;
        Ok(())
    }

    /// Advances this stub's cycle by one under the meta lock and returns the
    /// selected response.
    ///
    /// Only `meta.json` is locked, so selections on different stubs of the
    /// same imposter proceed in parallel, and within one stub the cursor
    /// advances once per call in lock-acquisition order.
    pub async fn next_response(&self) -> Result<NextResponse> {
        let Some(stub_dir) = &self.stub_dir else {
            return Ok(NextResponse {
                value: default_response(),
                base_dir: self.base_dir.clone(),
                stub_dir: None,
            });
        };

        let meta_path = self.meta_path(stub_dir);
        let response_file: String = fs::locked_read_modify_write(&meta_path, |current| {
            let current = current.ok_or_else(|| {
                StoreError::io(
                    &meta_path,
                    std::io::Error::new(ErrorKind::NotFound, "stub directory vanished"),
                )
            })?;
            let mut meta = meta_from(current, &meta_path)?;

            let period = meta.order_with_repeats.len();
            if period == 0 {
                return Err(StoreError::MissingResource(format!(
                    "stub in {stub_dir} has no responses"
                )));
            }
            let response_index = meta.order_with_repeats[meta.next_index % period];
            let response_file = meta
                .response_files
                .get(response_index)
                .cloned()
                .ok_or_else(|| {
                    StoreError::io(
                        &meta_path,
                        std::io::Error::new(
                            ErrorKind::InvalidData,
                            "cycle references a response file that is not listed",
                        ),
                    )
                })?;
            meta.next_index = (meta.next_index + 1) % period;
            Ok((meta_to_value(&meta, &meta_path)?, response_file))
        })
        .await?;

        let value =
            fs::read_json_required(&self.base_dir.join(stub_dir).join(&response_file)).await?;
        Ok(NextResponse {
            value,
            base_dir: self.base_dir.clone(),
            stub_dir: Some(stub_dir.clone()),
        })
    }

    /// Match records are not persisted by this store.
    pub async fn record_match(&self) -> Result<()> {
        Ok(())
    }
}

/// A response selected by [`StubHandle::next_response`], tagged with a lazy
/// resolver for the originating stub's current list position.
#[derive(Debug, Clone)]
pub struct NextResponse {
    value: Value,
    base_dir: PathBuf,
    stub_dir: Option<String>,
}

impl NextResponse {
    pub fn json(&self) -> &Value {
        &self.value
    }

    pub fn into_json(self) -> Value {
        self.value
    }

    /// Re-reads the header and locates the originating stub by its stable
    /// directory name, so the position is current even after inserts have
    /// shifted the list. Zero when the stub (or the header) is gone.
    pub async fn stub_index(&self) -> Result<usize> {
        let Some(stub_dir) = &self.stub_dir else {
            return Ok(0);
        };
        let header = read_header_at(&self.base_dir).await?;
        Ok(header
            .stubs
            .iter()
            .position(|entry| entry.meta.dir == *stub_dir)
            .unwrap_or(0))
    }
}
