//! Signal/ledger loop: candles in, paper trades and bus events out.
//!
//! Runs once per interval, aligned to the interval boundary. Control
//! directives are re-read fresh every cycle: a standing pause file
//! throttles entries, a force-close directive flattens named symbols,
//! and a tuning override mutates the live parameters before anything
//! else happens.

use std::collections::HashMap;

use anyhow::Result;
use clap::Parser;
use tokio::time::{sleep, Duration};

use paperbridge::bus::{self, EventWriter, ForceCloseDirective, ModeDirective, TuningOverride};
use paperbridge::feed::{CandleSource, HttpFeed, NullSource};
use paperbridge::logging::{json_log, obj, v_num, v_str};
use paperbridge::portfolio::{Portfolio, Venue};
use paperbridge::signal;
use paperbridge::state::{now_secs, BridgePaths, Config, StrategyParams};

#[derive(Parser, Debug)]
#[command(name = "trader", about = "Paper-trading signal and ledger loop")]
struct Args {
    /// Cycle interval in seconds, aligned to the wall-clock boundary
    #[arg(long, default_value_t = 60)]
    interval: u64,
    /// Bridge store root (overrides BRIDGE_OUT)
    #[arg(long)]
    out: Option<String>,
}

fn source_for(venue: Venue, cfg: &Config) -> Box<dyn CandleSource + Send + Sync> {
    match venue {
        Venue::Bitget => Box::new(HttpFeed::new(&cfg.bitget_base)),
        // No data client wired for the equity venue; its symbols skip
        // every cycle until one is configured.
        Venue::Alpaca => Box::new(NullSource),
    }
}

async fn run_cycle(
    cfg: &Config,
    paths: &BridgePaths,
    writer: &EventWriter,
    portfolio: &mut Portfolio,
    params: &mut StrategyParams,
    sources: &HashMap<Venue, Box<dyn CandleSource + Send + Sync>>,
) -> Result<()> {
    // Control plane first: last write wins, nothing is cached.
    let pause = bus::read_json::<ModeDirective>(&paths.mode_file())
        .map(|m| m.pause_new_signals)
        .unwrap_or(false);
    if let Some(tuning) = bus::read_json::<TuningOverride>(&paths.tuning_file()) {
        params.apply(&tuning);
    }

    let mut prices: HashMap<String, f64> = HashMap::new();
    for (venue, symbol) in &cfg.symbols {
        let source = match sources.get(venue) {
            Some(s) => s,
            None => continue,
        };
        let candles = match source.fetch_candles(symbol, cfg.granularity_secs, cfg.hist_bars).await
        {
            Ok(Some(c)) if !c.is_empty() => c,
            // No data for this symbol this cycle; the others continue.
            _ => continue,
        };
        let px = candles[candles.len() - 1].c;
        prices.insert(paperbridge::portfolio::pos_key(*venue, symbol), px);

        if let Some(closed) = portfolio.maybe_exit(writer, *venue, symbol, px, params)? {
            json_log(
                "trader",
                obj(&[
                    ("event", v_str("position_closed")),
                    ("symbol", v_str(&closed.symbol)),
                    ("reason", v_str(closed.reason)),
                    ("profit", v_num(closed.profit)),
                ]),
            );
        }

        if pause {
            continue;
        }
        let side = signal::crossover(&candles, cfg.sma_fast, cfg.sma_slow);
        let atr = signal::last_atr(&candles, cfg.atr_len);
        if let (Some(side), Some(atr)) = (side, atr) {
            if portfolio.position_count() < params.max_concurrent_positions {
                let rationale = format!(
                    "SMA{}/{} cross @{}s; ATR={:.4}",
                    cfg.sma_fast, cfg.sma_slow, cfg.granularity_secs, atr
                );
                if portfolio.open(writer, *venue, symbol, side, px, atr, params, &rationale)? {
                    json_log(
                        "trader",
                        obj(&[
                            ("event", v_str("position_opened")),
                            ("symbol", v_str(symbol)),
                            ("side", v_str(side.as_str())),
                            ("price", v_num(px)),
                        ]),
                    );
                }
            }
        }
    }

    if let Some(fc) = bus::read_json::<ForceCloseDirective>(&paths.force_close_file()) {
        for closed in portfolio.force_close(writer, &fc.symbols, &prices)? {
            json_log(
                "trader",
                obj(&[
                    ("event", v_str("force_closed")),
                    ("symbol", v_str(&closed.symbol)),
                    ("profit", v_num(closed.profit)),
                ]),
            );
        }
    }

    portfolio.mark_to_market(&prices, chrono::Utc::now().date_naive());
    portfolio.publish_snapshot(writer, &prices, params)?;
    json_log(
        "trader",
        obj(&[
            ("event", v_str("cycle")),
            ("equity", v_num(portfolio.equity)),
            ("day_pnl_pct", v_num(portfolio.day_pnl_pct())),
            ("max_dd_pct", v_num(portfolio.max_dd_pct)),
            ("open_positions", v_num(portfolio.position_count() as f64)),
            ("paused", serde_json::json!(pause)),
        ]),
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = Config::from_env();
    if let Some(out) = args.out {
        cfg.bridge_root = out;
    }
    let paths = BridgePaths::new(&cfg.bridge_root);
    paths.ensure()?;

    let writer = EventWriter::new(paths.clone());
    let mut portfolio = Portfolio::new(cfg.paper_capital, chrono::Utc::now().date_naive());
    let mut params = cfg.params;
    let mut sources: HashMap<Venue, Box<dyn CandleSource + Send + Sync>> = HashMap::new();
    for (venue, _) in &cfg.symbols {
        sources.entry(*venue).or_insert_with(|| source_for(*venue, &cfg));
    }

    json_log(
        "trader",
        obj(&[
            ("event", v_str("started")),
            ("symbols", v_num(cfg.symbols.len() as f64)),
            ("interval_secs", v_num(args.interval as f64)),
        ]),
    );

    loop {
        if let Err(err) =
            run_cycle(&cfg, &paths, &writer, &mut portfolio, &mut params, &sources).await
        {
            json_log(
                "trader",
                obj(&[("event", v_str("cycle_error")), ("error", v_str(&format!("{:#}", err)))]),
            );
        }

        let sleep_for = cfg.sleep_until_next_cycle(now_secs(), args.interval);
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                json_log("trader", obj(&[("event", v_str("interrupted"))]));
                return Ok(());
            }
            _ = sleep(Duration::from_secs(sleep_for)) => {}
        }
    }
}
