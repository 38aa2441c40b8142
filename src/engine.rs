//! Process-level bootstrap: the two store instances and queue
//! construction.
//!
//! Startup order matters: the persistent store can only judge its own
//! snapshot after it knows which client refs the queues still hold, so
//! the engine first harvests every queue's recovery terms, then opens
//! the stores, then lets callers open queues against them. Once every
//! recovered queue is up, [`Engine::finish_recovery`] lets the
//! persistent store drop bodies nothing re-claimed.
//!
//! ```text
//! {root}/
//!   store-persistent/
//!   store-transient/
//!   queues/{name}/
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::clock::Clock;
use crate::meta;
use crate::qindex::IndexConfig;
use crate::queue::{QueueConfig, QueueSettings, QueueTerms, TieredQueue, TERMS_FILE};
use crate::store::{ClientRef, MessageStore, StoreConfig};
use crate::Result;

pub const PERSISTENT_STORE_DIR: &str = "store-persistent";
pub const TRANSIENT_STORE_DIR: &str = "store-transient";
pub const QUEUES_DIR: &str = "queues";

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub index: IndexConfig,
    pub queue: QueueConfig,
}

pub struct Engine {
    root: PathBuf,
    persistent: Arc<MessageStore>,
    transient: Arc<MessageStore>,
    persistent_recovered: bool,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine {
    /// Open the stores under `root`, recovering the persistent one
    /// against the refs found in the queues' recovery terms.
    pub fn start(
        root: impl Into<PathBuf>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(QUEUES_DIR))?;

        let expected_refs = harvest_expected_refs(&root.join(QUEUES_DIR))?;
        let (persistent, persistent_recovered) = MessageStore::open(
            root.join(PERSISTENT_STORE_DIR),
            config.store.clone(),
            &expected_refs,
        )?;
        let transient =
            MessageStore::open_transient(root.join(TRANSIENT_STORE_DIR), config.store.clone())?;
        info!(
            "engine at {}: persistent store recovered {}",
            root.display(),
            if persistent_recovered { "clean" } else { "by rescan" }
        );

        Ok(Self {
            root,
            persistent,
            transient,
            persistent_recovered,
            clock,
            config,
        })
    }

    /// Open (or recover) one queue.
    pub fn open_queue(&self, name: &str, durable: bool, recover: bool) -> Result<TieredQueue> {
        TieredQueue::init(
            name,
            self.queue_dir(name),
            durable,
            recover,
            &self.persistent,
            &self.transient,
            self.persistent_recovered,
            Arc::clone(&self.clock),
            QueueSettings {
                queue: self.config.queue.clone(),
                index: self.config.index.clone(),
            },
        )
    }

    /// After every recovered queue has been opened: drop store bodies no
    /// queue re-claimed.
    pub fn finish_recovery(&self) -> Result<()> {
        if !self.persistent_recovered {
            self.persistent.finish_recovery()?;
        }
        Ok(())
    }

    /// Clean process shutdown. Call after terminating every queue.
    pub fn terminate(&self) -> Result<()> {
        self.persistent.terminate()?;
        self.transient.terminate()?;
        Ok(())
    }

    pub fn persistent_store(&self) -> &Arc<MessageStore> {
        &self.persistent
    }

    pub fn transient_store(&self) -> &Arc<MessageStore> {
        &self.transient
    }

    pub fn persistent_recovered(&self) -> bool {
        self.persistent_recovered
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue_dir(&self, name: &str) -> PathBuf {
        self.root.join(QUEUES_DIR).join(name)
    }
}

/// Read every queue's terms file (without consuming it) to learn which
/// persistent-store refs survived the last shutdown.
fn harvest_expected_refs(queues_dir: &Path) -> Result<Vec<ClientRef>> {
    let mut refs = Vec::new();
    if !queues_dir.exists() {
        return Ok(refs);
    }
    for entry in std::fs::read_dir(queues_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let terms_path = entry.path().join(TERMS_FILE);
        if let Ok(Some(terms)) = meta::read_json::<QueueTerms>(&terms_path) {
            if let Some(client_ref) = ClientRef::from_hex(&terms.persistent_ref) {
                refs.push(client_ref);
            }
        }
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::clock::ManualClock;
    use crate::message::Message;

    fn start(root: &Path) -> Engine {
        Engine::start(root, EngineConfig::default(), Arc::new(ManualClock::new(0))).unwrap()
    }

    #[test]
    fn fresh_engine_has_empty_queues() {
        let dir = TempDir::new().unwrap();
        let engine = start(dir.path());
        let queue = engine.open_queue("orders", true, false).unwrap();
        assert!(queue.is_empty());
        assert!(!engine.persistent_recovered());
    }

    #[test]
    fn clean_shutdown_is_recovered_clean() {
        let dir = TempDir::new().unwrap();
        {
            let engine = start(dir.path());
            let mut queue = engine.open_queue("orders", true, false).unwrap();
            queue
                .publish(Message::new(b"m".to_vec(), Vec::new(), true))
                .unwrap();
            queue.sync().unwrap();
            queue.terminate().unwrap();
            engine.terminate().unwrap();
        }
        let engine = start(dir.path());
        assert!(engine.persistent_recovered());
        let queue = engine.open_queue("orders", true, true).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn queue_deletion_removes_its_directory() {
        let dir = TempDir::new().unwrap();
        let engine = start(dir.path());
        let mut queue = engine.open_queue("doomed", true, false).unwrap();
        queue
            .publish(Message::new(b"m".to_vec(), Vec::new(), true))
            .unwrap();
        let queue_dir = engine.queue_dir("doomed");
        assert!(queue_dir.exists());
        queue.delete_and_terminate().unwrap();
        assert!(!queue_dir.exists());
    }
}
