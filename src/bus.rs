//! File-backed event bus shared by the bridge processes.
//!
//! Three roles over one directory layout:
//! - event writers append one immutable JSON file per event under a
//!   category directory, named `<ms-timestamp>_<random>.json` so
//!   concurrent producers never collide;
//! - snapshot writers publish whole position snapshots, filename-sortable
//!   by embedded timestamp, each superseding the previous one;
//! - control files (`mode`, `force_close`, `tuning`) are single
//!   current-value files, overwritten wholesale, last write wins.
//!
//! Readers never assume a file exists, is complete, or parses: anything
//! unreadable is skipped and counted, and the caller retries next poll.
//! No file is ever edited in place.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::logging::ts_epoch_ms;
use crate::portfolio::{Side, Venue};
use crate::state::BridgePaths;

// =============================================================================
// Event payloads
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradeEvent {
    Open {
        symbol: String,
        side: Side,
        qty: f64,
        price: f64,
        leverage: f64,
        exchange: Venue,
        strategy_id: String,
        rationale: String,
    },
    Close {
        order_ref: String,
        symbol: String,
        exit_price: f64,
        profit: f64,
        pnl_pct: f64,
        fees: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub open_risk_pct: f64,
    pub day_pnl_pct: f64,
    pub rolling_dd_pct: f64,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exposure {
    pub symbol: String,
    pub direction: Side,
    pub notional_eur: f64,
    pub risk_pct: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub ts: u64,
    pub exposures: Vec<Exposure>,
    pub avg_leverage: f64,
    pub paper_capital: f64,
}

// =============================================================================
// Control directives (last-write-wins current-value files)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeDirective {
    pub pause_new_signals: bool,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceCloseDirective {
    pub symbols: Vec<String>,
    pub ts: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuningOverride {
    #[serde(default)]
    pub risk_per_trade_pct: Option<f64>,
    #[serde(default)]
    pub atr_stop_mult: Option<f64>,
    #[serde(default)]
    pub atr_tp_mult: Option<f64>,
    #[serde(default)]
    pub max_concurrent_positions: Option<usize>,
}

// =============================================================================
// Writer role
// =============================================================================

/// Filename disambiguator so two writers stamping the same millisecond
/// still produce distinct names.
fn unique_name(ts: u64) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(1..1_000_000);
    format!("{}_{:06}.json", ts, suffix)
}

pub struct EventWriter {
    paths: BridgePaths,
}

impl EventWriter {
    pub fn new(paths: BridgePaths) -> Self {
        Self { paths }
    }

    /// Single-shot whole-file write of `{ "ts": .., "type": .., ..payload }`.
    fn write_event(&self, dir: &Path, kind: &str, payload: Value) -> Result<PathBuf> {
        let ts = ts_epoch_ms();
        let mut record = serde_json::Map::new();
        record.insert("ts".to_string(), Value::from(ts));
        record.insert("type".to_string(), Value::from(kind));
        if let Value::Object(fields) = payload {
            for (k, v) in fields {
                record.insert(k, v);
            }
        }
        let path = dir.join(unique_name(ts));
        fs::write(&path, Value::Object(record).to_string())
            .with_context(|| format!("cannot write event {}", path.display()))?;
        Ok(path)
    }

    pub fn trade(&self, ev: &TradeEvent) -> Result<PathBuf> {
        self.write_event(&self.paths.events_trades, "trades", serde_json::to_value(ev)?)
    }

    pub fn risk(&self, ev: &RiskEvent) -> Result<PathBuf> {
        self.write_event(&self.paths.events_risk, "risk", serde_json::to_value(ev)?)
    }

    pub fn equity(&self, equity: f64) -> Result<PathBuf> {
        self.write_event(
            &self.paths.events_equity,
            "equity",
            serde_json::json!({ "equity": equity }),
        )
    }

    pub fn snapshot(&self, exposures: Vec<Exposure>, avg_leverage: f64, paper_capital: f64) -> Result<PathBuf> {
        let ts = ts_epoch_ms();
        let snap = Snapshot { ts, exposures, avg_leverage, paper_capital };
        let path = self.paths.snapshots.join(format!("positions_{}", unique_name(ts)));
        fs::write(&path, serde_json::to_string(&snap)?)
            .with_context(|| format!("cannot write snapshot {}", path.display()))?;
        Ok(path)
    }
}

// =============================================================================
// Control file access
// =============================================================================

/// Overwrite a control (or report) file wholesale. Never appended, never
/// edited in place.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("cannot write {}", path.display()))
}

/// Read a current-value file fresh. Missing, empty, or half-written files
/// all read as `None`; the consumer keeps its previous behavior and
/// retries next cycle.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub fn clear_pause(paths: &BridgePaths) -> Result<()> {
    write_json(
        &paths.mode_file(),
        &ModeDirective { pause_new_signals: false, ts: ts_epoch_ms() },
    )
}

// =============================================================================
// Reader role
// =============================================================================

#[derive(Debug, Default)]
pub struct ReadBatch {
    /// Parsed records in filename (= timestamp) order.
    pub records: Vec<Value>,
    /// Files present but unreadable this pass; excluded, not fatal.
    pub skipped: usize,
}

/// Replay every event file in a category directory. A directory that does
/// not exist yet reads as an empty batch.
pub fn read_events(dir: &Path) -> ReadBatch {
    let mut names: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect(),
        Err(_) => return ReadBatch::default(),
    };
    names.sort();

    let mut batch = ReadBatch::default();
    for path in names {
        match fs::read(&path).ok().and_then(|b| serde_json::from_slice(&b).ok()) {
            Some(v) => batch.records.push(v),
            None => batch.skipped += 1,
        }
    }
    batch
}

/// The newest snapshot, or `None` when there is none yet or the newest
/// file is still being written.
pub fn latest_snapshot(dir: &Path) -> Option<Snapshot> {
    let mut names: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("positions_") && n.ends_with(".json"))
                .unwrap_or(false)
        })
        .collect();
    names.sort();
    read_json(names.last()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BridgePaths;

    fn temp_store() -> (tempfile::TempDir, BridgePaths) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("bridge_out");
        let paths = BridgePaths::new(root.to_str().unwrap());
        paths.ensure().unwrap();
        (tmp, paths)
    }

    fn open_event() -> TradeEvent {
        TradeEvent::Open {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            qty: 0.5,
            price: 30_000.0,
            leverage: 1.0,
            exchange: Venue::Bitget,
            strategy_id: "sma_cross_atr".to_string(),
            rationale: "SMA9/21 cross".to_string(),
        }
    }

    // ==========================================================================
    // Writer tests
    // ==========================================================================

    #[test]
    fn test_event_filenames_never_collide() {
        let (_tmp, paths) = temp_store();
        let writer = EventWriter::new(paths.clone());
        let mut seen = std::collections::HashSet::new();
        // Many writes inside the same millisecond must still be unique.
        for _ in 0..200 {
            let p = writer.equity(10_000.0).unwrap();
            assert!(seen.insert(p), "duplicate event filename");
        }
        assert_eq!(read_events(&paths.events_equity).records.len(), 200);
    }

    #[test]
    fn test_trade_event_wire_format() {
        let (_tmp, paths) = temp_store();
        let writer = EventWriter::new(paths.clone());
        writer.trade(&open_event()).unwrap();

        let batch = read_events(&paths.events_trades);
        assert_eq!(batch.records.len(), 1);
        let rec = &batch.records[0];
        assert_eq!(rec["type"], "trades");
        assert_eq!(rec["event"], "open");
        assert_eq!(rec["side"], "long");
        assert_eq!(rec["exchange"], "bitget");
        assert!(rec["ts"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_close_event_wire_format() {
        let (_tmp, paths) = temp_store();
        let writer = EventWriter::new(paths.clone());
        writer
            .trade(&TradeEvent::Close {
                order_ref: "bitget-BTCUSDT-1".to_string(),
                symbol: "BTCUSDT".to_string(),
                exit_price: 31_000.0,
                profit: 500.0,
                pnl_pct: 3.3,
                fees: 0.0,
            })
            .unwrap();
        let rec = &read_events(&paths.events_trades).records[0];
        assert_eq!(rec["event"], "close");
        assert_eq!(rec["profit"], 500.0);
    }

    // ==========================================================================
    // Reader leniency
    // ==========================================================================

    #[test]
    fn test_reader_skips_malformed_files() {
        let (_tmp, paths) = temp_store();
        let writer = EventWriter::new(paths.clone());
        writer.equity(1.0).unwrap();
        // A partial write from a crashed producer
        fs::write(paths.events_equity.join("9999999999999_000001.json"), "{\"ts\": 12").unwrap();
        fs::write(paths.events_equity.join("9999999999998_000001.json"), "").unwrap();

        let batch = read_events(&paths.events_equity);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.skipped, 2);
    }

    #[test]
    fn test_reader_missing_directory_is_empty() {
        let batch = read_events(Path::new("/nonexistent/bridge/events/trades"));
        assert!(batch.records.is_empty());
        assert_eq!(batch.skipped, 0);
    }

    #[test]
    fn test_replay_order_is_stable() {
        let (_tmp, paths) = temp_store();
        // Written out of order, replayed by timestamp
        fs::write(paths.events_equity.join("1700000000002_000001.json"), "{\"equity\": 2}").unwrap();
        fs::write(paths.events_equity.join("1700000000001_000001.json"), "{\"equity\": 1}").unwrap();
        fs::write(paths.events_equity.join("1700000000003_000001.json"), "{\"equity\": 3}").unwrap();
        let batch = read_events(&paths.events_equity);
        let values: Vec<i64> = batch.records.iter().map(|r| r["equity"].as_i64().unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    // ==========================================================================
    // Snapshots
    // ==========================================================================

    #[test]
    fn test_latest_snapshot_supersedes() {
        let (_tmp, paths) = temp_store();
        fs::write(
            paths.snapshots.join("positions_1700000000001_000001.json"),
            serde_json::json!({"ts": 1700000000001u64, "exposures": [], "avg_leverage": 1.0, "paper_capital": 10000.0}).to_string(),
        )
        .unwrap();
        fs::write(
            paths.snapshots.join("positions_1700000000002_000001.json"),
            serde_json::json!({"ts": 1700000000002u64, "exposures": [{"symbol": "SPY", "direction": "long", "notional_eur": 1200.0, "risk_pct": 0.75}], "avg_leverage": 1.0, "paper_capital": 10000.0}).to_string(),
        )
        .unwrap();

        let snap = latest_snapshot(&paths.snapshots).unwrap();
        assert_eq!(snap.ts, 1700000000002);
        assert_eq!(snap.exposures.len(), 1);
        assert_eq!(snap.exposures[0].unrealized_pnl, None);
    }

    #[test]
    fn test_latest_snapshot_none_when_empty_or_partial() {
        let (_tmp, paths) = temp_store();
        assert!(latest_snapshot(&paths.snapshots).is_none());
        fs::write(paths.snapshots.join("positions_1700000000001_000001.json"), "{").unwrap();
        assert!(latest_snapshot(&paths.snapshots).is_none());
    }

    // ==========================================================================
    // Control files
    // ==========================================================================

    #[test]
    fn test_control_last_write_wins() {
        let (_tmp, paths) = temp_store();
        write_json(&paths.mode_file(), &ModeDirective { pause_new_signals: true, ts: 1 }).unwrap();
        write_json(&paths.mode_file(), &ModeDirective { pause_new_signals: false, ts: 2 }).unwrap();
        let mode: ModeDirective = read_json(&paths.mode_file()).unwrap();
        assert!(!mode.pause_new_signals);
        assert_eq!(mode.ts, 2);
    }

    #[test]
    fn test_control_missing_reads_none() {
        let (_tmp, paths) = temp_store();
        assert!(read_json::<ModeDirective>(&paths.mode_file()).is_none());
    }

    #[test]
    fn test_tuning_partial_fields() {
        let (_tmp, paths) = temp_store();
        fs::write(paths.tuning_file(), "{\"risk_per_trade_pct\": 0.005}").unwrap();
        let t: TuningOverride = read_json(&paths.tuning_file()).unwrap();
        assert_eq!(t.risk_per_trade_pct, Some(0.005));
        assert_eq!(t.atr_stop_mult, None);
        assert_eq!(t.max_concurrent_positions, None);
    }
}
