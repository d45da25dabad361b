//! Persistent settings store
//!
//! Small typed values that must survive restarts: the last visible page, the
//! active memory bank, per-control values. Backed by sled, values serialized
//! as JSON. Interested parties can `watch` a key and get woken when it
//! changes.

use crate::driver::ControlValue;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::watch;
use tracing::{debug, info};

const CONTROL_PREFIX: &str = "control:";
const LAST_PAGE_KEY: &str = "last_page";
const MEMORY_BANK_KEY: &str = "memory_bank";

pub struct Settings {
    db: sled::Db,
    watchers: Mutex<HashMap<String, watch::Sender<()>>>,
}

impl Settings {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)
            .with_context(|| format!("Failed to open settings database at {}", path.display()))?;
        info!("Settings store open at {} ({} keys)", path.display(), db.len());
        Ok(Self {
            db,
            watchers: Mutex::new(HashMap::new()),
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.db
            .get(key)
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).context("Failed to serialize setting")?;
        self.db
            .insert(key, bytes)
            .with_context(|| format!("Failed to store setting '{}'", key))?;
        debug!("Setting '{}' updated", key);
        if let Some(tx) = self.watchers.lock().get(key) {
            let _ = tx.send(());
        }
        Ok(())
    }

    /// Subscribe to changes of a key. The receiver is marked changed on every
    /// `set` of that key.
    pub fn watch(&self, key: &str) -> watch::Receiver<()> {
        let mut watchers = self.watchers.lock();
        watchers
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(()).0)
            .subscribe()
    }

    pub fn last_page(&self) -> Option<String> {
        self.get(LAST_PAGE_KEY)
    }

    pub fn set_last_page(&self, id: &str) -> Result<()> {
        self.set(LAST_PAGE_KEY, &id)
    }

    pub fn memory_bank(&self) -> Option<u8> {
        self.get(MEMORY_BANK_KEY)
    }

    pub fn set_memory_bank(&self, bank: u8) -> Result<()> {
        self.set(MEMORY_BANK_KEY, &bank)
    }

    pub fn control_value(&self, control_id: &str) -> Option<ControlValue> {
        self.get(&format!("{}{}", CONTROL_PREFIX, control_id))
    }

    pub fn set_control_value(&self, control_id: &str, value: ControlValue) -> Result<()> {
        self.set(&format!("{}{}", CONTROL_PREFIX, control_id), &value)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().context("Failed to flush settings database")?;
        Ok(())
    }
}
