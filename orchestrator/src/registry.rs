//! Child → parent links for runs that expect to be told when a child ends.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;

use agentrun_protocol::OrchestrationLink;
use agentrun_protocol::RunId;
use serde::Deserialize;
use serde::Serialize;

use crate::error::RegistryError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    links: Vec<OrchestrationLink>,
}

/// Thread-safe lookup table keyed by child run id.
///
/// Every mutation happens under one lock. With a store attached, the whole
/// table is rewritten atomically after each mutation; a failed write rolls
/// the in-memory change back so memory and disk never disagree. Without a
/// store, links do not survive a restart.
#[derive(Debug, Default)]
pub struct OrchestrationLinkRegistry {
    links: Mutex<HashMap<RunId, OrchestrationLink>>,
    store: Option<PathBuf>,
}

impl OrchestrationLinkRegistry {
    /// In-memory registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry backed by a JSON file at `path`, loading any links already
    /// stored there. A missing file starts empty.
    pub fn with_store(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let links = match std::fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => HashMap::new(),
            Ok(bytes) => {
                let snapshot: Snapshot =
                    serde_json::from_slice(&bytes).map_err(|source| RegistryError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                snapshot
                    .links
                    .into_iter()
                    .map(|link| (link.child_run_id.clone(), link))
                    .collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(RegistryError::Io { path, source }),
        };
        tracing::debug!(path = %path.display(), links = links.len(), "loaded link store");
        Ok(Self {
            links: Mutex::new(links),
            store: Some(path),
        })
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.store.as_deref()
    }

    /// Records that `parent` wants to hear about `child`. Re-linking a child
    /// replaces its previous parent.
    pub fn link(&self, child: &RunId, parent: &RunId) -> Result<(), RegistryError> {
        let mut links = self.lock();
        let previous = links.insert(
            child.clone(),
            OrchestrationLink::new(child.clone(), parent.clone()),
        );
        if let Err(err) = self.persist(&links) {
            match previous {
                Some(previous) => links.insert(child.clone(), previous),
                None => links.remove(child),
            };
            return Err(err);
        }
        tracing::debug!(child_run_id = %child, parent_run_id = %parent, "linked child run");
        Ok(())
    }

    pub fn lookup_parent(&self, child: &RunId) -> Option<RunId> {
        self.lock()
            .get(child)
            .map(|link| link.parent_run_id.clone())
    }

    /// Removes the link for `child`, if any.
    pub fn unlink(&self, child: &RunId) -> Result<(), RegistryError> {
        self.take_link(child).map(|_| ())
    }

    /// Looks up and removes the link for `child` in one step. Of several
    /// concurrent callers for the same child, exactly one gets the link.
    pub fn take_link(&self, child: &RunId) -> Result<Option<OrchestrationLink>, RegistryError> {
        let mut links = self.lock();
        let Some(link) = links.remove(child) else {
            return Ok(None);
        };
        if let Err(err) = self.persist(&links) {
            links.insert(child.clone(), link);
            return Err(err);
        }
        Ok(Some(link))
    }

    pub fn children_of(&self, parent: &RunId) -> Vec<RunId> {
        let mut children: Vec<RunId> = self
            .lock()
            .values()
            .filter(|link| &link.parent_run_id == parent)
            .map(|link| link.child_run_id.clone())
            .collect();
        children.sort();
        children
    }

    /// Every link, oldest first.
    pub fn links(&self) -> Vec<OrchestrationLink> {
        let mut links: Vec<OrchestrationLink> = self.lock().values().cloned().collect();
        links.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.child_run_id.cmp(&b.child_run_id))
        });
        links
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RunId, OrchestrationLink>> {
        // The map is always left consistent, so a poisoned lock is still usable.
        self.links
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn persist(&self, links: &HashMap<RunId, OrchestrationLink>) -> Result<(), RegistryError> {
        let Some(path) = &self.store else {
            return Ok(());
        };
        let io_err = |source| RegistryError::Io {
            path: path.clone(),
            source,
        };

        let mut snapshot = Snapshot {
            links: links.values().cloned().collect(),
        };
        snapshot
            .links
            .sort_by(|a, b| a.child_run_id.cmp(&b.child_run_id));
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|source| RegistryError::Corrupt {
            path: path.clone(),
            source,
        })?;

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(io_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|err| io_err(err.error))?;
        Ok(())
    }
}
