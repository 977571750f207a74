//! Cumulative token-usage ledger with a hard cap.
//!
//! One JSON file, keyed by UTC day + model name, updated read-modify-
//! write under an in-process mutex so concurrent sessions cannot
//! jointly overshoot the cap between their own check and call. Writes
//! are atomic; a corrupt ledger is sidelined, never trusted.

use crate::store::write_atomic;
use anchorstitch_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DayUsage {
    pub spent: u64,
    pub cap: u64,
    pub updated_at_epoch_s: Option<u64>,
}

#[derive(Debug)]
pub struct UsageLedger {
    path: PathBuf,
    cap: u64,
    model: String,
    // Serializes the read-modify-write cycle within this process.
    lock: Mutex<()>,
}

fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn day_key(model: &str, epoch_s: u64) -> String {
    let date = chrono::DateTime::from_timestamp(epoch_s as i64, 0)
        .unwrap_or(chrono::DateTime::UNIX_EPOCH);
    format!("{}_{model}", date.format("%Y%m%d"))
}

impl UsageLedger {
    pub fn new(path: PathBuf, cap: u64, model: impl Into<String>) -> Self {
        Self {
            path,
            cap,
            model: model.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    fn load_all(&self) -> BTreeMap<String, DayUsage> {
        let Ok(bytes) = fs::read(&self.path) else {
            return BTreeMap::new();
        };
        match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(_) => {
                // Sideline the corrupt file so the evidence survives; start fresh.
                let bak = self.path.with_extension(format!("corrupt.{}", now_epoch_s()));
                let _ = fs::rename(&self.path, bak);
                BTreeMap::new()
            }
        }
    }

    fn today(&self) -> String {
        day_key(&self.model, now_epoch_s())
    }

    /// Tokens spent today (this model).
    pub fn spent(&self) -> u64 {
        let _g = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.load_all().get(&self.today()).map(|d| d.spent).unwrap_or(0)
    }

    /// Gate for issuing new work: errors once today's spend has reached
    /// the cap.
    pub fn ensure_under_cap(&self) -> Result<u64> {
        let spent = self.spent();
        if spent >= self.cap {
            return Err(Error::CapExceeded {
                spent,
                cap: self.cap,
            });
        }
        Ok(spent)
    }

    /// Record usage of a completed call. The call's spend is always
    /// persisted, even when it pushes past the cap; the next
    /// `ensure_under_cap` stops further work. Returns the new total.
    pub fn add(&self, tokens: u64) -> Result<u64> {
        let _g = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut all = self.load_all();
        let day = all.entry(self.today()).or_insert_with(|| DayUsage {
            spent: 0,
            cap: self.cap,
            updated_at_epoch_s: None,
        });
        day.spent += tokens;
        day.cap = self.cap;
        day.updated_at_epoch_s = Some(now_epoch_s());
        let spent = day.spent;
        let bytes =
            serde_json::to_vec_pretty(&all).map_err(|e| Error::Store(e.to_string()))?;
        write_atomic(&self.path, &bytes)?;
        Ok(spent)
    }
}
