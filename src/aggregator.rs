//! Status aggregator: replays the event store into one consolidated
//! read-model.
//!
//! Everything here is derived; the status file can be deleted at any
//! time and the next publish cycle rebuilds it from the event log alone.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{self, Exposure};
use crate::logging::{json_log, obj, ts_epoch_ms, v_num, v_str};
use crate::state::BridgePaths;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counts {
    pub trades_total: usize,
    pub equity_points: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub paper_capital: f64,
    pub realized_pnl: f64,
    pub profit_factor: f64,
    pub winrate_pct: f64,
    pub max_drawdown_pct: f64,
    pub day_pnl_pct: f64,
    pub exposures: Vec<Exposure>,
    pub avg_leverage: f64,
    pub last_update_ts: u64,
    pub counts: Counts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TradeMetrics {
    pub realized_pnl: f64,
    pub profit_factor: f64,
    pub winrate_pct: f64,
    pub max_drawdown_pct: f64,
}

/// Replay close events into realized PnL, profit factor, win rate, and a
/// max drawdown rebuilt by applying each PnL increment to the starting
/// capital.
pub fn compute_trade_metrics(trades: &[Value], paper_capital: f64) -> TradeMetrics {
    let pnls: Vec<f64> = trades
        .iter()
        .filter(|t| t["event"] == "close")
        .map(|t| {
            t["profit"].as_f64().unwrap_or(0.0) - t["fees"].as_f64().unwrap_or(0.0)
        })
        .collect();
    if pnls.is_empty() {
        return TradeMetrics::default();
    }

    let wins: f64 = pnls.iter().filter(|p| **p > 0.0).sum();
    let losses: f64 = pnls.iter().filter(|p| **p < 0.0).map(|p| p.abs()).sum();
    let win_count = pnls.iter().filter(|p| **p > 0.0).count();

    // Loss-free logs divide by a tiny constant instead of zero, which
    // reads as a very large positive factor downstream.
    let profit_factor = if losses > 0.0 { wins / losses } else { wins / 1e-9 };

    let mut equity = paper_capital;
    let mut peak = paper_capital;
    let mut max_dd = 0.0f64;
    for p in &pnls {
        equity += p;
        peak = peak.max(equity);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - equity) / peak);
        }
    }

    TradeMetrics {
        realized_pnl: pnls.iter().sum(),
        profit_factor,
        winrate_pct: win_count as f64 / pnls.len() as f64 * 100.0,
        max_drawdown_pct: max_dd * 100.0,
    }
}

/// Ordered equity series from the equity category. Records without a
/// usable value are dropped; ordering is by embedded timestamp.
pub fn collect_equity_points(records: &[Value]) -> Vec<(u64, f64)> {
    let mut points: Vec<(u64, f64)> = records
        .iter()
        .filter_map(|r| Some((r["ts"].as_u64()?, r["equity"].as_f64()?)))
        .collect();
    points.sort_by_key(|(ts, _)| *ts);
    points
}

pub fn write_equity_csv(path: &Path, points: &[(u64, f64)]) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("cannot create equity csv {}", path.display()))?;
    writeln!(file, "ts_ms,equity")?;
    for (ts, eq) in points {
        writeln!(file, "{},{:.4}", ts, eq)?;
    }
    Ok(())
}

/// Day PnL from the newest risk event. The sentinel's day-loss check
/// reads this off the published status.
fn latest_day_pnl(risk_records: &[Value]) -> f64 {
    risk_records
        .last()
        .and_then(|r| r["day_pnl_pct"].as_f64())
        .unwrap_or(0.0)
}

fn round_to(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}

/// One publish cycle: replay, derive, and overwrite status + equity CSV.
pub fn publish_status(paths: &BridgePaths, paper_capital: f64) -> Result<Status> {
    let trades = bus::read_events(&paths.events_trades);
    let equity = bus::read_events(&paths.events_equity);
    let risk = bus::read_events(&paths.events_risk);

    let skipped = trades.skipped + equity.skipped + risk.skipped;
    if skipped > 0 {
        json_log(
            "bridge",
            obj(&[("event", v_str("malformed_records_excluded")), ("count", v_num(skipped as f64))]),
        );
    }

    let metrics = compute_trade_metrics(&trades.records, paper_capital);

    let mut points = collect_equity_points(&equity.records);
    if points.is_empty() {
        points.push((ts_epoch_ms(), paper_capital));
    }
    write_equity_csv(&paths.equity_csv(), &points)?;

    let snap = bus::latest_snapshot(&paths.snapshots);

    let status = Status {
        paper_capital,
        realized_pnl: metrics.realized_pnl,
        profit_factor: round_to(metrics.profit_factor, 3),
        winrate_pct: round_to(metrics.winrate_pct, 2),
        max_drawdown_pct: round_to(metrics.max_drawdown_pct, 2),
        day_pnl_pct: round_to(latest_day_pnl(&risk.records), 4),
        exposures: snap.as_ref().map(|s| s.exposures.clone()).unwrap_or_default(),
        avg_leverage: snap.as_ref().map(|s| s.avg_leverage).unwrap_or(0.0),
        last_update_ts: ts_epoch_ms(),
        counts: Counts {
            trades_total: trades.records.len(),
            equity_points: points.len(),
        },
    };

    bus::write_json(&paths.status_file(), &status)?;
    Ok(status)
}
