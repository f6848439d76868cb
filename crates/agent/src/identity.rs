// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stable client identity, created on first run and reused afterwards.

use std::path::Path;

use tokenkeep_wire::payload::MAX_IDENTITY_LEN;

const IDENTITY_FILE: &str = "client-id";

/// Read `<state_dir>/client-id`, creating it with a fresh UUID if missing.
pub fn load_or_create(state_dir: &Path) -> anyhow::Result<String> {
    let path = state_dir.join(IDENTITY_FILE);
    if path.exists() {
        let stored = std::fs::read_to_string(&path)?;
        let stored = stored.trim();
        if !stored.is_empty() && stored.chars().count() <= MAX_IDENTITY_LEN {
            return Ok(stored.to_owned());
        }
        tracing::warn!(path = %path.display(), "ignoring unusable client identity file");
    }

    let identity = uuid::Uuid::new_v4().to_string();
    std::fs::create_dir_all(state_dir)?;
    std::fs::write(&path, format!("{identity}\n"))?;
    tracing::info!(client = %identity, path = %path.display(), "created client identity");
    Ok(identity)
}
