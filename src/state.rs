//! Runtime configuration and the process-wide directory context.
//!
//! Every bridge process builds one `Config` and one `BridgePaths` at
//! startup and passes them down; nothing else reads the environment or
//! invents paths. `BridgePaths::ensure` is the single fatal startup step:
//! a process that cannot create its directories exits non-zero.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::bus::TuningOverride;
use crate::portfolio::Venue;

pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

/// Live strategy parameters. The sentinel's tuning directive overrides
/// these mid-run, so they sit apart from the static `Config` fields.
#[derive(Debug, Clone, Copy)]
pub struct StrategyParams {
    pub risk_per_trade_pct: f64,
    pub atr_stop_mult: f64,
    pub atr_tp_mult: f64,
    pub breakeven_rr: f64,
    pub max_concurrent_positions: usize,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: 0.0075,
            atr_stop_mult: 1.2,
            atr_tp_mult: 2.0,
            breakeven_rr: 1.0,
            max_concurrent_positions: 4,
        }
    }
}

impl StrategyParams {
    /// Apply a partial override, field by field. Absent fields keep their
    /// current value; max positions is floored at 1.
    pub fn apply(&mut self, t: &TuningOverride) {
        if let Some(v) = t.risk_per_trade_pct {
            self.risk_per_trade_pct = v;
        }
        if let Some(v) = t.atr_stop_mult {
            self.atr_stop_mult = v;
        }
        if let Some(v) = t.atr_tp_mult {
            self.atr_tp_mult = v;
        }
        if let Some(v) = t.max_concurrent_positions {
            self.max_concurrent_positions = v.max(1);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bridge_root: String,
    pub paper_capital: f64,
    pub hist_bars: usize,
    pub granularity_secs: u64,
    pub sma_fast: usize,
    pub sma_slow: usize,
    pub atr_len: usize,
    pub params: StrategyParams,
    pub max_drawdown_pct: f64,
    pub day_loss_limit_pct: f64,
    pub offender_topn: usize,
    pub symbols: Vec<(Venue, String)>,
    pub bitget_base: String,
    pub approval_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_symbols(key: &str, venue: Venue, default: &str) -> Vec<(Venue, String)> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| (venue, s.to_string()))
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        let mut symbols = env_symbols("BITGET_SYMBOLS", Venue::Bitget, "BTCUSDT");
        symbols.extend(env_symbols("ALPACA_SYMBOLS", Venue::Alpaca, "SPY"));
        Self {
            bridge_root: std::env::var("BRIDGE_OUT").unwrap_or_else(|_| "bridge_out".to_string()),
            paper_capital: env_parse("PAPER_CAPITAL", 10_000.0),
            hist_bars: env_parse("HIST_BARS", 200),
            granularity_secs: env_parse("CANDLE_SECS", 60),
            sma_fast: env_parse("SMA_FAST", 9),
            sma_slow: env_parse("SMA_SLOW", 21),
            atr_len: env_parse("ATR_LEN", 14),
            params: StrategyParams {
                risk_per_trade_pct: env_parse("RISK_PER_TRADE_PCT", 0.0075),
                atr_stop_mult: env_parse("ATR_STOP_MULT", 1.2),
                atr_tp_mult: env_parse("ATR_TP_MULT", 2.0),
                breakeven_rr: env_parse("BREAKEVEN_RR", 1.0),
                max_concurrent_positions: env_parse("MAX_POSITIONS", 4),
            },
            max_drawdown_pct: env_parse("MAX_DD_LIMIT", 8.0),
            day_loss_limit_pct: env_parse("DAY_LOSS_LIMIT", -3.0),
            offender_topn: env_parse("OFFENDER_TOPN", 2),
            symbols,
            bitget_base: std::env::var("BITGET_BASE")
                .unwrap_or_else(|_| "https://api.bitget.com".to_string()),
            approval_timeout_secs: env_parse("APPROVAL_TIMEOUT_SECS", 600),
            command_timeout_secs: env_parse("COMMAND_TIMEOUT_SECS", 300),
        }
    }

    /// Seconds until the next interval boundary (minute alignment for the
    /// trader loop, so forward-filled candles line up across processes).
    pub fn sleep_until_next_cycle(&self, now_secs: u64, interval_secs: u64) -> u64 {
        let interval = interval_secs.max(1);
        let next = ((now_secs / interval) + 1) * interval;
        next.saturating_sub(now_secs)
    }
}

/// All directories and well-known files of one bridge store, derived from
/// a single root. The gateway's inbox/outbox live beside the store, not
/// inside it, so operators can wipe `bridge_out/` without losing tasks.
#[derive(Debug, Clone)]
pub struct BridgePaths {
    pub root: PathBuf,
    pub events_trades: PathBuf,
    pub events_risk: PathBuf,
    pub events_equity: PathBuf,
    pub snapshots: PathBuf,
    pub reports: PathBuf,
    pub control: PathBuf,
    pub inbox: PathBuf,
    pub outbox: PathBuf,
    pub policies: PathBuf,
}

impl BridgePaths {
    pub fn new(bridge_root: &str) -> Self {
        let root = PathBuf::from(bridge_root);
        let events = root.join("events");
        let workspace = root.parent().map(Path::to_path_buf).unwrap_or_default();
        Self {
            root: root.clone(),
            events_trades: events.join("trades"),
            events_risk: events.join("risk"),
            events_equity: events.join("equity"),
            snapshots: root.join("snapshots"),
            reports: root.join("reports"),
            control: root.join("control"),
            inbox: workspace.join("agent_inbox"),
            outbox: workspace.join("agent_outbox"),
            policies: workspace.join("policies"),
        }
    }

    /// Create every directory the store needs. Callers treat failure as
    /// fatal startup (exit non-zero).
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.events_trades,
            &self.events_risk,
            &self.events_equity,
            &self.snapshots,
            &self.reports,
            &self.control,
            &self.inbox,
            &self.outbox,
            &self.policies,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn status_file(&self) -> PathBuf {
        self.reports.join("status.json")
    }

    pub fn equity_csv(&self) -> PathBuf {
        self.reports.join("equity_curve.csv")
    }

    pub fn mode_file(&self) -> PathBuf {
        self.control.join("mode.json")
    }

    pub fn force_close_file(&self) -> PathBuf {
        self.control.join("force_close.json")
    }

    pub fn tuning_file(&self) -> PathBuf {
        self.control.join("tuning.json")
    }

    pub fn policy_file(&self) -> PathBuf {
        self.policies.join("whitelist.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_until_next_cycle_boundary() {
        let cfg = Config::from_env();

        // Exactly at boundary
        assert_eq!(cfg.sleep_until_next_cycle(60, 60), 60);
        assert_eq!(cfg.sleep_until_next_cycle(120, 60), 60);

        // Just after / just before
        assert_eq!(cfg.sleep_until_next_cycle(61, 60), 59);
        assert_eq!(cfg.sleep_until_next_cycle(119, 60), 1);

        // Middle of the interval
        assert_eq!(cfg.sleep_until_next_cycle(90, 60), 30);
    }

    #[test]
    fn test_sleep_zero_interval_does_not_divide_by_zero() {
        let cfg = Config::from_env();
        assert_eq!(cfg.sleep_until_next_cycle(100, 0), 1);
    }

    #[test]
    fn test_params_apply_partial() {
        let mut p = StrategyParams::default();
        p.apply(&TuningOverride {
            risk_per_trade_pct: Some(0.005),
            atr_stop_mult: None,
            atr_tp_mult: Some(2.2),
            max_concurrent_positions: Some(0),
        });
        assert_eq!(p.risk_per_trade_pct, 0.005);
        assert_eq!(p.atr_stop_mult, 1.2); // untouched
        assert_eq!(p.atr_tp_mult, 2.2);
        assert_eq!(p.max_concurrent_positions, 1); // floored
    }

    #[test]
    fn test_paths_layout() {
        let paths = BridgePaths::new("work/bridge_out");
        assert!(paths.events_trades.ends_with("bridge_out/events/trades"));
        assert!(paths.mode_file().ends_with("bridge_out/control/mode.json"));
        // Gateway dirs sit beside the store, under the same workspace
        assert!(paths.inbox.ends_with("work/agent_inbox"));
        assert!(paths.policies.ends_with("work/policies"));
    }

    #[test]
    fn test_ensure_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("bridge_out");
        let paths = BridgePaths::new(root.to_str().unwrap());
        paths.ensure().unwrap();
        assert!(paths.events_trades.is_dir());
        assert!(paths.snapshots.is_dir());
        assert!(paths.control.is_dir());
        assert!(paths.inbox.is_dir());
    }
}
