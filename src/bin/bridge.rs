//! Status aggregation loop: replay the event store, publish one
//! consolidated status record and the equity curve.

use anyhow::Result;
use clap::Parser;
use tokio::time::{sleep, Duration};

use paperbridge::aggregator;
use paperbridge::logging::{json_log, obj, v_num, v_str};
use paperbridge::state::{BridgePaths, Config};

#[derive(Parser, Debug)]
#[command(name = "bridge", about = "Event-log aggregator and status publisher")]
struct Args {
    /// Seconds between publish cycles
    #[arg(long, default_value_t = 60)]
    publish_interval: u64,
    /// Bridge store root (overrides BRIDGE_OUT)
    #[arg(long)]
    out: Option<String>,
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

    json_log(
        "bridge",
        obj(&[
            ("event", v_str("started")),
            ("publish_interval_secs", v_num(args.publish_interval as f64)),
        ]),
    );

    loop {
        match aggregator::publish_status(&paths, cfg.paper_capital) {
            Ok(status) => {
                json_log(
                    "bridge",
                    obj(&[
                        ("event", v_str("published")),
                        ("realized_pnl", v_num(status.realized_pnl)),
                        ("max_drawdown_pct", v_num(status.max_drawdown_pct)),
                        ("trades_total", v_num(status.counts.trades_total as f64)),
                    ]),
                );
            }
            Err(err) => {
                json_log(
                    "bridge",
                    obj(&[("event", v_str("publish_error")), ("error", v_str(&format!("{:#}", err)))]),
                );
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                json_log("bridge", obj(&[("event", v_str("interrupted"))]));
                return Ok(());
            }
            _ = sleep(Duration::from_secs(args.publish_interval)) => {}
        }
    }
}
