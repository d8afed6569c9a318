//! Paper position ledger: the only code that creates, mutates, or
//! destroys positions.
//!
//! One `Portfolio` per trader process. Every mutation that matters to the
//! outside world (open, close, equity mark, risk posture) emits an event
//! through the bus in the same call, so independent consumers replaying
//! the store see the same history this process lived.

use std::collections::HashMap;

use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::bus::{EventWriter, Exposure, RiskEvent, TradeEvent};
use crate::logging::ts_epoch_ms;
use crate::state::StrategyParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Bitget,
    Alpaca,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Bitget => "bitget",
            Venue::Alpaca => "alpaca",
        }
    }

    /// Equity venues fill whole shares only; crypto venues take fractions.
    pub fn whole_units(&self) -> bool {
        matches!(self, Venue::Alpaca)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Stop,
    Target,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Stop => "stop",
            ExitReason::Target => "tp",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub venue: Venue,
    pub side: Side,
    pub entry: f64,
    pub qty: f64,
    pub atr: f64,
    pub stop: f64,
    pub target: f64,
    pub breakeven_armed: bool,
    pub open_ts: u64,
    pub rationale: String,
}

impl Position {
    /// Unrealized PnL at `px`.
    pub fn mtm(&self, px: f64) -> f64 {
        match self.side {
            Side::Long => (px - self.entry) * self.qty,
            Side::Short => (self.entry - px) * self.qty,
        }
    }

    /// Reward/risk multiple at `px`, risk being the stop distance.
    pub fn rr(&self, px: f64, params: &StrategyParams) -> f64 {
        let risk = params.atr_stop_mult * self.atr;
        if risk <= 0.0 {
            return 0.0;
        }
        let movement = match self.side {
            Side::Long => px - self.entry,
            Side::Short => self.entry - px,
        };
        movement / risk
    }

    /// Move the stop just past entry once the reward/risk threshold is
    /// reached. Arms once; later calls never move the stop again.
    pub fn arm_breakeven(&mut self, px: f64, params: &StrategyParams) {
        if !self.breakeven_armed && self.rr(px, params) >= params.breakeven_rr {
            self.stop = match self.side {
                Side::Long => self.entry * 1.0002,
                Side::Short => self.entry * 0.9998,
            };
            self.breakeven_armed = true;
        }
    }

    /// First exit condition hit at `px`, stop checked before target. The
    /// ordering is the tie-break when one tick satisfies both.
    pub fn exit_check(&self, px: f64) -> Option<(ExitReason, f64)> {
        match self.side {
            Side::Long => {
                if px <= self.stop {
                    return Some((ExitReason::Stop, self.stop));
                }
                if px >= self.target {
                    return Some((ExitReason::Target, self.target));
                }
            }
            Side::Short => {
                if px >= self.stop {
                    return Some((ExitReason::Stop, self.stop));
                }
                if px <= self.target {
                    return Some((ExitReason::Target, self.target));
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub key: String,
    pub symbol: String,
    pub exit_price: f64,
    pub profit: f64,
    pub pnl_pct: f64,
    pub reason: &'static str,
}

pub struct Portfolio {
    pub capital: f64,
    pub equity: f64,
    pub peak: f64,
    pub max_dd_pct: f64,
    pub day_start_date: NaiveDate,
    pub day_start_equity: f64,
    positions: HashMap<String, Position>,
}

pub fn pos_key(venue: Venue, symbol: &str) -> String {
    format!("{}:{}", venue.as_str(), symbol)
}

impl Portfolio {
    pub fn new(capital: f64, today: NaiveDate) -> Self {
        Self {
            capital,
            equity: capital,
            peak: capital,
            max_dd_pct: 0.0,
            day_start_date: today,
            day_start_equity: capital,
            positions: HashMap::new(),
        }
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn get(&self, key: &str) -> Option<&Position> {
        self.positions.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.positions.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn day_pnl_pct(&self) -> f64 {
        let base = self.day_start_equity.max(1e-9);
        (self.equity - base) / base * 100.0
    }

    /// Open a position, sized so the stop distance risks the configured
    /// fraction of capital. No-op when the (venue, symbol) key is already
    /// held or the stop distance is degenerate.
    pub fn open(
        &mut self,
        writer: &EventWriter,
        venue: Venue,
        symbol: &str,
        side: Side,
        entry: f64,
        atr: f64,
        params: &StrategyParams,
        rationale: &str,
    ) -> Result<bool> {
        let key = pos_key(venue, symbol);
        if self.positions.contains_key(&key) {
            return Ok(false);
        }
        let stop_dist = params.atr_stop_mult * atr;
        if !(stop_dist > 0.0) || !entry.is_finite() {
            return Ok(false);
        }
        let mut qty = (self.capital * params.risk_per_trade_pct / stop_dist).max(1e-6);
        if venue.whole_units() {
            qty = qty.round().max(1.0);
        }
        let (stop, target) = match side {
            Side::Long => (entry - stop_dist, entry + params.atr_tp_mult * atr),
            Side::Short => (entry + stop_dist, entry - params.atr_tp_mult * atr),
        };
        let pos = Position {
            symbol: symbol.to_string(),
            venue,
            side,
            entry,
            qty,
            atr,
            stop,
            target,
            breakeven_armed: false,
            open_ts: ts_epoch_ms(),
            rationale: rationale.to_string(),
        };
        writer.trade(&TradeEvent::Open {
            symbol: symbol.to_string(),
            side,
            qty,
            price: entry,
            leverage: 1.0,
            exchange: venue,
            strategy_id: "sma_cross_atr".to_string(),
            rationale: rationale.to_string(),
        })?;
        self.positions.insert(key, pos);
        Ok(true)
    }

    /// Arm breakeven, then run the exit check and close if one fires.
    pub fn maybe_exit(
        &mut self,
        writer: &EventWriter,
        venue: Venue,
        symbol: &str,
        px: f64,
        params: &StrategyParams,
    ) -> Result<Option<ClosedTrade>> {
        let key = pos_key(venue, symbol);
        let exit = match self.positions.get_mut(&key) {
            Some(pos) => {
                pos.arm_breakeven(px, params);
                pos.exit_check(px)
            }
            None => return Ok(None),
        };
        match exit {
            Some((reason, exit_px)) => self.close(writer, &key, exit_px, reason.as_str()),
            None => Ok(None),
        }
    }

    /// Remove the position and realize its PnL. The only path that
    /// destroys a `Position`.
    pub fn close(
        &mut self,
        writer: &EventWriter,
        key: &str,
        exit_price: f64,
        reason: &'static str,
    ) -> Result<Option<ClosedTrade>> {
        let pos = match self.positions.remove(key) {
            Some(p) => p,
            None => return Ok(None),
        };
        let profit = pos.mtm(exit_price);
        let notional = (pos.entry * pos.qty).max(1e-9);
        let pnl_pct = profit / notional * 100.0;
        writer.trade(&TradeEvent::Close {
            order_ref: format!("{}-{}-{}", pos.venue.as_str(), pos.symbol, ts_epoch_ms() / 1000),
            symbol: pos.symbol.clone(),
            exit_price,
            profit,
            pnl_pct,
            fees: 0.0,
        })?;
        Ok(Some(ClosedTrade {
            key: key.to_string(),
            symbol: pos.symbol,
            exit_price,
            profit,
            pnl_pct,
            reason,
        }))
    }

    /// Close every open position whose symbol appears in `symbols`, at the
    /// last known price. Positions without a price stay open this cycle.
    pub fn force_close(
        &mut self,
        writer: &EventWriter,
        symbols: &[String],
        prices: &HashMap<String, f64>,
    ) -> Result<Vec<ClosedTrade>> {
        let mut closed = Vec::new();
        for key in self.keys() {
            let matches = self
                .positions
                .get(&key)
                .map(|p| symbols.iter().any(|s| s == &p.symbol))
                .unwrap_or(false);
            if !matches {
                continue;
            }
            if let Some(&px) = prices.get(&key) {
                if let Some(trade) = self.close(writer, &key, px, "forced")? {
                    closed.push(trade);
                }
            }
        }
        Ok(closed)
    }

    /// Mark all open positions to market: equity, running peak, monotone
    /// max drawdown, and the once-per-UTC-day rollover of day-start
    /// equity.
    pub fn mark_to_market(&mut self, prices: &HashMap<String, f64>, today: NaiveDate) {
        let mut unrealized = 0.0;
        for (key, pos) in &self.positions {
            if let Some(&px) = prices.get(key) {
                unrealized += pos.mtm(px);
            }
        }
        self.equity = self.capital + unrealized;
        self.peak = self.peak.max(self.equity);
        if self.peak > 0.0 {
            let dd = (self.peak - self.equity) / self.peak * 100.0;
            self.max_dd_pct = self.max_dd_pct.max(dd);
        }
        if today != self.day_start_date {
            self.day_start_date = today;
            self.day_start_equity = self.equity;
        }
    }

    /// Open positions ranked worst-first by unrealized PnL. Positions with
    /// no price this cycle are left out.
    pub fn worst_offenders(&self, prices: &HashMap<String, f64>, topn: usize) -> Vec<(String, f64)> {
        let mut losses: Vec<(String, f64)> = self
            .positions
            .iter()
            .filter_map(|(key, pos)| prices.get(key).map(|&px| (key.clone(), pos.mtm(px))))
            .collect();
        losses.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        losses.truncate(topn);
        losses
    }

    pub fn exposures(&self, prices: &HashMap<String, f64>, params: &StrategyParams) -> Vec<Exposure> {
        let mut out: Vec<Exposure> = self
            .positions
            .iter()
            .map(|(key, pos)| {
                let px = prices.get(key).copied().unwrap_or(pos.entry);
                Exposure {
                    symbol: pos.symbol.clone(),
                    direction: pos.side,
                    notional_eur: px * pos.qty,
                    risk_pct: params.risk_per_trade_pct * 100.0,
                    unrealized_pnl: Some(pos.mtm(px)),
                }
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    /// Publish the per-cycle read-model: equity event, risk event, and a
    /// position snapshot superseding the previous one.
    pub fn publish_snapshot(
        &self,
        writer: &EventWriter,
        prices: &HashMap<String, f64>,
        params: &StrategyParams,
    ) -> Result<()> {
        writer.equity(self.equity)?;
        writer.risk(&RiskEvent {
            open_risk_pct: (self.positions.len() as f64 * params.risk_per_trade_pct * 100.0)
                .min(100.0),
            day_pnl_pct: self.day_pnl_pct(),
            rolling_dd_pct: self.max_dd_pct,
            mode: "normal".to_string(),
        })?;
        writer.snapshot(self.exposures(prices, params), 1.0, self.capital)?;
        Ok(())
    }
}
