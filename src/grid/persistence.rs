// =============================================================================
// Grid snapshot persistence — atomic, versioned, keyed by symbol
// =============================================================================
//
// Written on every ladder or position change and rehydrated on worker
// startup, so a restarted worker resumes the exact ladder it left behind.
// Same tmp + rename pattern as the engine config.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::grid::ladder::Ladder;
use crate::types::{Position, Venue};

/// Bumped whenever the snapshot layout changes incompatibly.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub schema_version: u32,
    pub symbol: String,
    pub venue: Venue,
    pub ladder: Ladder,
    pub position: Position,
    /// Cursor into the user-trade stream, so a restored engine never
    /// re-applies fills already folded into `position`.
    #[serde(default)]
    pub last_trade_id: u64,
    pub last_update_ms: i64,
}

impl GridSnapshot {
    pub fn new(
        symbol: &str,
        venue: Venue,
        ladder: Ladder,
        position: Position,
        last_trade_id: u64,
        last_update_ms: i64,
    ) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            symbol: symbol.to_string(),
            venue,
            ladder,
            position,
            last_trade_id,
            last_update_ms,
        }
    }

    fn path_for(dir: &Path, symbol: &str) -> PathBuf {
        dir.join(format!("grid_{symbol}.json"))
    }

    /// Atomically persist under `dir` (created on demand).
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create state dir {}", dir.display()))?;

        let path = Self::path_for(dir, &self.symbol);
        let tmp_path = path.with_extension("json.tmp");

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise grid snapshot")?;
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;

        debug!(symbol = %self.symbol, path = %path.display(), "grid snapshot saved");
        Ok(())
    }

    /// Load the snapshot for `symbol`, if one exists. A snapshot written by a
    /// newer schema is refused rather than misread.
    pub fn load(dir: impl AsRef<Path>, symbol: &str) -> Result<Option<Self>> {
        let path = Self::path_for(dir.as_ref(), symbol);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read snapshot {}", path.display()))
            }
        };

        let snapshot: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse snapshot {}", path.display()))?;

        if snapshot.schema_version > SNAPSHOT_SCHEMA_VERSION {
            bail!(
                "snapshot {} has schema {} newer than supported {}",
                path.display(),
                snapshot.schema_version,
                SNAPSHOT_SCHEMA_VERSION
            );
        }

        info!(symbol, path = %path.display(), "grid snapshot rehydrated");
        Ok(Some(snapshot))
    }

    /// Remove the persisted snapshot for `symbol` (worker retired cleanly).
    pub fn remove(dir: impl AsRef<Path>, symbol: &str) -> Result<()> {
        let path = Self::path_for(dir.as_ref(), symbol);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::ladder::GridLevel;
    use crate::types::{OrderSide, PositionSide};

    fn sample_snapshot() -> GridSnapshot {
        let ladder = Ladder {
            center_price: 2_000.0,
            spacing_fraction: 0.005,
            levels: vec![
                GridLevel {
                    price: 1_990.0,
                    side: OrderSide::Buy,
                    qty: 0.005,
                    order_id: Some(11),
                },
                GridLevel {
                    price: 2_010.0,
                    side: OrderSide::Sell,
                    qty: 0.005,
                    order_id: None,
                },
            ],
        };
        let mut position = Position::flat();
        position.apply_fill(OrderSide::Buy, 0.005, 1_990.0);
        GridSnapshot::new(
            "ETHUSDT",
            Venue::Derivatives,
            ladder,
            position,
            7,
            1_700_000_000_000,
        )
    }

    #[test]
    fn save_load_roundtrip_is_structurally_equal() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = sample_snapshot();
        snapshot.save(dir.path()).unwrap();

        let loaded = GridSnapshot::load(dir.path(), "ETHUSDT").unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.ladder.levels.len(), 2);
        assert_eq!(loaded.position.side, PositionSide::Long);
        assert_eq!(loaded.ladder.levels[0].order_id, Some(11));
        assert_eq!(loaded.last_trade_id, 7);
    }

    #[test]
    fn missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GridSnapshot::load(dir.path(), "NOPE").unwrap().is_none());
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut snapshot = sample_snapshot();
        snapshot.schema_version = SNAPSHOT_SCHEMA_VERSION + 1;
        snapshot.save(dir.path()).unwrap();
        assert!(GridSnapshot::load(dir.path(), "ETHUSDT").is_err());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = sample_snapshot();
        snapshot.save(dir.path()).unwrap();
        GridSnapshot::remove(dir.path(), "ETHUSDT").unwrap();
        GridSnapshot::remove(dir.path(), "ETHUSDT").unwrap();
        assert!(GridSnapshot::load(dir.path(), "ETHUSDT").unwrap().is_none());
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("grid_ETHUSDT.json"), "{not json").unwrap();
        assert!(GridSnapshot::load(dir.path(), "ETHUSDT").is_err());
    }
}
