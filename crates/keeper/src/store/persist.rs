// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential persistence: load/save to JSON file with atomic writes.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::CredentialRecord;

/// Everything the store keeps, as written to disk.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreState {
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub records: BTreeMap<u64, CredentialRecord>,
}

impl StoreState {
    /// Repair `next_id` after loading a file written by hand or an older build.
    pub fn normalize(&mut self) {
        let floor = self.records.keys().next_back().map_or(1, |max| max + 1);
        self.next_id = self.next_id.max(floor);
    }
}

/// Load persisted state from a JSON file.
pub fn load(path: &Path) -> anyhow::Result<StoreState> {
    let contents = std::fs::read_to_string(path)?;
    let mut state: StoreState = serde_json::from_str(&contents)?;
    state.normalize();
    Ok(state)
}

/// Save state to a JSON file atomically (write tmp + rename).
///
/// The temp name carries the PID and a counter so concurrent saves never
/// share a temp file.
pub fn save(path: &Path, state: &StoreState) -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let json = serde_json::to_string_pretty(state)?;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
