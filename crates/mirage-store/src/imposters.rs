//! Root repository: imposter lifecycle over a shared data directory.
//!
//! Persistence is entirely per-imposter: `{datadir}/{port}` holds
//! everything about one imposter, and removing that directory erases it.
//! The only in-memory state is the table of stop hooks for the imposters
//! this process created, which is what `exists` and `all` enumerate.

use crate::error::{Result, StoreError};
use crate::fs;
use crate::stubs::{read_header_at, StubRepository};
use crate::types::ImposterHeader;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Shutdown hook supplied by whoever started the imposter's server,
/// typically a send on the server's shutdown channel. Invoked synchronously
/// so process-exit paths can run it without a runtime.
pub type StopFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct RepoState {
    stops: HashMap<u16, StopFn>,
    stubs: HashMap<u16, Arc<StubRepository>>,
}

/// Filesystem-backed repository of imposters, rooted at a data directory
/// that may be shared by several worker processes.
pub struct ImposterRepository {
    datadir: PathBuf,
    state: RwLock<RepoState>,
}

impl ImposterRepository {
    /// Binds a repository to `datadir`. The directory is created on demand
    /// by the first write.
    pub fn new(datadir: impl Into<PathBuf>) -> Self {
        Self {
            datadir: datadir.into(),
            state: RwLock::new(RepoState::default()),
        }
    }

    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    fn imposter_dir(&self, id: u16) -> PathBuf {
        self.datadir.join(id.to_string())
    }

    /// Persists an imposter's header and registers its stop hook.
    ///
    /// Stubs may already be on disk (stub mutators tolerate a missing
    /// header, so creation flows are free to add stubs first); the header
    /// written here picks those entries up. Request logs are never part of
    /// the header.
    pub async fn add(
        &self,
        id: u16,
        mut imposter: Map<String, Value>,
        stop: StopFn,
    ) -> Result<()> {
        let dir = self.imposter_dir(id);
        let mut header = read_header_at(&dir).await?;

        imposter.remove("requests");
        imposter.remove("stubs");
        header.config = imposter;
        fs::write_json(&dir.join("imposter.json"), &header).await?;

        self.state.write().stops.insert(id, stop);
        info!(port = id, "imposter added");
        Ok(())
    }

    /// Fully materialized imposter: the stored header with its stub list
    /// expanded through the stub repository. `None` when nothing is stored
    /// under this id.
    pub async fn get(&self, id: u16) -> Result<Option<Value>> {
        let header_path = self.imposter_dir(id).join("imposter.json");
        let Some(raw) = fs::read_json(&header_path).await? else {
            return Ok(None);
        };
        let header: ImposterHeader =
            serde_json::from_value(raw).map_err(|e| StoreError::parse(&header_path, e))?;

        let stubs = self.stubs_for(id).to_json().await?;
        let mut imposter = header.config;
        imposter.insert(
            "stubs".to_string(),
            serde_json::to_value(stubs).map_err(|e| StoreError::parse(&header_path, e))?,
        );
        Ok(Some(Value::Object(imposter)))
    }

    /// Every imposter this process knows about, materialized in parallel.
    pub async fn all(&self) -> Result<Vec<Value>> {
        let mut ids: Vec<u16> = self.state.read().stops.keys().copied().collect();
        ids.sort_unstable();

        let imposters =
            futures::future::try_join_all(ids.iter().map(|id| self.get(*id))).await?;
        Ok(imposters.into_iter().flatten().collect())
    }

    /// Membership in the in-memory handle table only; says nothing about
    /// what other processes have persisted.
    pub fn exists(&self, id: u16) -> bool {
        self.state.read().stops.contains_key(&id)
    }

    /// Stops and erases one imposter, returning its last materialized state.
    pub async fn del(&self, id: u16) -> Result<Option<Value>> {
        let imposter = self.get(id).await?;

        let stop = {
            let mut state = self.state.write();
            state.stubs.remove(&id);
            state.stops.remove(&id)
        };
        if let Some(stop) = stop {
            stop();
            debug!(port = id, "stop hook invoked");
        }

        fs::remove_tree(&self.imposter_dir(id)).await?;
        info!(port = id, "imposter deleted");
        Ok(imposter)
    }

    /// Stops every imposter and removes the whole data directory.
    pub async fn delete_all(&self) -> Result<()> {
        for stop in self.drain_stops() {
            stop();
        }
        fs::remove_tree(&self.datadir).await?;
        info!("all imposters deleted");
        Ok(())
    }

    /// Synchronous variant of [`delete_all`](Self::delete_all) for process
    /// shutdown paths that have no runtime to await on.
    pub fn delete_all_sync(&self) -> Result<()> {
        for stop in self.drain_stops() {
            stop();
        }
        match std::fs::remove_dir_all(&self.datadir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.datadir, e)),
        }
    }

    fn drain_stops(&self) -> Vec<StopFn> {
        let mut state = self.state.write();
        state.stubs.clear();
        state.stops.drain().map(|(_, stop)| stop).collect()
    }

    /// The stub repository bound to `{datadir}/{id}`. One instance per id is
    /// handed out for the life of the process, keeping its request counter
    /// and directory numbering monotonic.
    pub fn stubs_for(&self, id: u16) -> Arc<StubRepository> {
        if let Some(repo) = self.state.read().stubs.get(&id) {
            return Arc::clone(repo);
        }
        let mut state = self.state.write();
        Arc::clone(
            state
                .stubs
                .entry(id)
                .or_insert_with(|| Arc::new(StubRepository::new(self.imposter_dir(id)))),
        )
    }

    /// Ports with a directory currently persisted under the datadir,
    /// ascending: what a fresh process would see before re-hydrating
    /// saved imposters.
    pub async fn stored_ports(&self) -> Result<Vec<u16>> {
        let mut ports: Vec<u16> = fs::list_dir_names(&self.datadir)
            .await?
            .into_iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        ports.sort_unstable();
        Ok(ports)
    }
}
