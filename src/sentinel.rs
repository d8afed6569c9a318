//! Drawdown/day-loss sentinel.
//!
//! Watches the published status read-model and reacts through the control
//! plane: pause new entries, direct forced closure of the worst
//! offenders, tighten the live tuning, and leave an alert report behind.
//! Recovery is soft: a clean status on a later cycle lifts the pause.
//!
//! The sentinel holds no portfolio state of its own. A missing, stale, or
//! half-written status file means "no update yet", never a crash.

use anyhow::Result;
use serde::Serialize;

use crate::aggregator::Status;
use crate::bus::{self, ForceCloseDirective, ModeDirective, Snapshot, TuningOverride};
use crate::logging::{ts_epoch_ms, ts_now};
use crate::state::{BridgePaths, Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachKind {
    MaxDrawdownExceeded,
    DayLossExceeded,
}

impl BreachKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachKind::MaxDrawdownExceeded => "MAX_DRAWDOWN_EXCEEDED",
            BreachKind::DayLossExceeded => "DAY_LOSS_EXCEEDED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Status missing, unreadable, or unchanged since the last cycle.
    NoUpdate,
    /// Status read and within limits; any standing pause was lifted.
    Clear,
    Breach { kind: BreachKind, offenders: Vec<String> },
}

#[derive(Debug, Serialize)]
struct AlertReport<'a> {
    ts: u64,
    when: String,
    kind: &'static str,
    status: &'a Status,
    offenders: &'a [String],
    tuning: &'a TuningOverride,
}

/// The override written on every breach: halve the per-trade risk, widen
/// the stop, stretch the target, and cap concurrency at two.
pub fn conservative_tuning() -> TuningOverride {
    TuningOverride {
        risk_per_trade_pct: Some(0.005),
        atr_stop_mult: Some(1.6),
        atr_tp_mult: Some(2.2),
        max_concurrent_positions: Some(2),
    }
}

/// Pick up to `topn` symbols to force-close. Ranked by largest unrealized
/// loss when the snapshot carries live PnL; otherwise the largest
/// notional stands in as the risk proxy.
pub fn select_offenders(snap: Option<&Snapshot>, topn: usize) -> Vec<String> {
    let Some(snap) = snap else { return Vec::new() };
    let mut exposures = snap.exposures.clone();
    if exposures.iter().all(|e| e.unrealized_pnl.is_some()) && !exposures.is_empty() {
        exposures.sort_by(|a, b| {
            let (pa, pb) = (a.unrealized_pnl.unwrap_or(0.0), b.unrealized_pnl.unwrap_or(0.0));
            pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
        });
    } else {
        exposures.sort_by(|a, b| {
            b.notional_eur.partial_cmp(&a.notional_eur).unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    exposures.into_iter().take(topn).map(|e| e.symbol).collect()
}

fn detect_breach(cfg: &Config, status: &Status) -> Option<BreachKind> {
    if status.max_drawdown_pct >= cfg.max_drawdown_pct {
        return Some(BreachKind::MaxDrawdownExceeded);
    }
    if status.day_pnl_pct <= cfg.day_loss_limit_pct {
        return Some(BreachKind::DayLossExceeded);
    }
    None
}

pub struct Sentinel {
    last_seen_ts: Option<u64>,
}

impl Sentinel {
    pub fn new() -> Self {
        Self { last_seen_ts: None }
    }

    /// One poll cycle. Only a status whose publish stamp moved since the
    /// previous cycle is acted on.
    pub fn poll_cycle(&mut self, cfg: &Config, paths: &BridgePaths) -> Result<CycleOutcome> {
        let status: Status = match bus::read_json(&paths.status_file()) {
            Some(s) => s,
            None => return Ok(CycleOutcome::NoUpdate),
        };
        if self.last_seen_ts == Some(status.last_update_ts) {
            return Ok(CycleOutcome::NoUpdate);
        }
        self.last_seen_ts = Some(status.last_update_ts);

        let Some(kind) = detect_breach(cfg, &status) else {
            bus::clear_pause(paths)?;
            return Ok(CycleOutcome::Clear);
        };

        let snap = bus::latest_snapshot(&paths.snapshots);
        let offenders = select_offenders(snap.as_ref(), cfg.offender_topn);
        let tuning = conservative_tuning();
        let ts = ts_epoch_ms();

        bus::write_json(&paths.mode_file(), &ModeDirective { pause_new_signals: true, ts })?;
        if !offenders.is_empty() {
            bus::write_json(
                &paths.force_close_file(),
                &ForceCloseDirective { symbols: offenders.clone(), ts },
            )?;
        }
        bus::write_json(&paths.tuning_file(), &tuning)?;
        bus::write_json(
            &paths.reports.join(format!("guard_alert_{}.json", ts)),
            &AlertReport {
                ts,
                when: ts_now(),
                kind: kind.as_str(),
                status: &status,
                offenders: &offenders,
                tuning: &tuning,
            },
        )?;

        Ok(CycleOutcome::Breach { kind, offenders })
    }
}

impl Default for Sentinel {
    fn default() -> Self {
        Self::new()
    }
}
