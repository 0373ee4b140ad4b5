//! Filesystem primitives shared by the repositories.
//!
//! Everything on disk is UTF-8 JSON, pretty-printed with two-space indent.
//! Plain reads and writes touch a single file and take no lock; read-modify-
//! write sequences hold an advisory flock on a sibling `<file>.lock` so that
//! multiple worker processes can safely share one data directory.

use crate::error::{Result, StoreError};
use crate::types::RequestFileName;
use fs2::FileExt;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Retry budget for advisory lock acquisition.
const LOCK_ATTEMPTS: u32 = 10;
/// Base delay before the first retry; doubles on each subsequent attempt.
const LOCK_BASE_DELAY: Duration = Duration::from_millis(50);

/// Serializes `value` as pretty-printed JSON and writes it to `path`,
/// creating parent directories on demand. No locking.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }
    let content = serde_json::to_string_pretty(value).map_err(|e| StoreError::parse(path, e))?;
    tokio::fs::write(path, content)
        .await
        .map_err(|e| StoreError::io(path, e))
}

/// Reads and parses a JSON file. A missing file is `Ok(None)`; every other
/// failure propagates.
pub async fn read_json(path: &Path) -> Result<Option<Value>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let value = serde_json::from_str(&content).map_err(|e| StoreError::parse(path, e))?;
    Ok(Some(value))
}

/// Like [`read_json`], but absence is an error. Used where a missing file
/// means another writer tore the state we were pointed at.
pub async fn read_json_required(path: &Path) -> Result<Value> {
    read_json(path).await?.ok_or_else(|| {
        StoreError::io(
            path,
            std::io::Error::new(ErrorKind::NotFound, "referenced file is missing"),
        )
    })
}

/// Recursively removes a directory tree; a missing tree is success.
pub async fn remove_tree(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Entry names of a directory, unordered. A missing directory is empty.
pub async fn list_dir_names(path: &Path) -> Result<Vec<String>> {
    let mut reader = match tokio::fs::read_dir(path).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let mut names = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| StoreError::io(path, e))?
    {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Loads every `{epoch}-{pid}-{counter}.json` file in `path`, ordered
/// ascending by that tuple. Entries that do not match the pattern are
/// ignored; a missing directory yields an empty list.
pub async fn load_all_in_dir(path: &Path) -> Result<Vec<Value>> {
    let mut entries: Vec<(RequestFileName, PathBuf)> = list_dir_names(path)
        .await?
        .into_iter()
        .filter_map(|name| RequestFileName::parse(&name).map(|key| (key, path.join(name))))
        .collect();
    entries.sort_by_key(|(key, _)| *key);

    futures::future::try_join_all(entries.iter().map(|(_, file)| read_json_required(file))).await
}

/// Allocates the next numeric name suffix: the first run of decimal digits
/// is extracted from each existing name, and the maximum plus one (zero when
/// there are none) is returned. Numbering therefore only ever grows.
pub fn next_index<I, S>(names: I) -> u64
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .filter_map(|name| first_digit_run(name.as_ref()))
        .max()
        .map_or(0, |max| max + 1)
}

fn first_digit_run(name: &str) -> Option<u64> {
    let start = name.find(|c: char| c.is_ascii_digit())?;
    name[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()
}

/// Advisory flock held on a sibling `.lock` file, released on drop.
struct FlockGuard {
    file: std::fs::File,
}

impl FlockGuard {
    /// Non-blocking probe; `Ok(None)` when another holder has the lock.
    fn try_acquire(lock_path: &Path) -> std::io::Result<Option<Self>> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for FlockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Acquires the advisory lock for `path` with bounded exponential backoff
/// and randomized jitter. Exhausting the budget is a hard error.
async fn acquire_lock(path: &Path) -> Result<FlockGuard> {
    let lock_path = lock_path_for(path);
    let mut delay = LOCK_BASE_DELAY;

    for attempt in 1..=LOCK_ATTEMPTS {
        let probe_path = lock_path.clone();
        let acquired = tokio::task::spawn_blocking(move || FlockGuard::try_acquire(&probe_path))
            .await
            .map_err(|e| StoreError::io(&lock_path, std::io::Error::new(ErrorKind::Other, e)))?
            .map_err(|e| StoreError::io(&lock_path, e))?;

        if let Some(guard) = acquired {
            return Ok(guard);
        }
        if attempt < LOCK_ATTEMPTS {
            let jitter = rand::thread_rng().gen_range(Duration::ZERO..=delay / 2);
            debug!(path = %path.display(), attempt, "lock held elsewhere, backing off");
            tokio::time::sleep(delay + jitter).await;
            delay *= 2;
        }
    }

    warn!(path = %path.display(), attempts = LOCK_ATTEMPTS, "lock retry budget exhausted");
    Err(StoreError::LockContention {
        path: path.to_path_buf(),
    })
}

/// Read-modify-write of a single JSON file under its advisory lock.
///
/// `transform` receives the parsed current value (`None` when the file does
/// not exist) and returns the value to write back plus an output for the
/// caller. The lock is released on every exit path, including a failing
/// transform.
pub async fn locked_read_modify_write<T, F>(path: &Path, transform: F) -> Result<T>
where
    F: FnOnce(Option<Value>) -> Result<(Value, T)>,
{
    let _guard = acquire_lock(path).await?;
    let current = read_json(path).await?;
    let (next, output) = transform(current)?;
    write_json(path, &next).await?;
    Ok(output)
}
