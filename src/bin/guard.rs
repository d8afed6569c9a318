//! Drawdown sentinel loop.
//!
//! Needs no market keys and no portfolio state: it watches the published
//! status file and answers through the control plane. Missing or broken
//! inputs are "no update yet"; the loop itself never dies.

use anyhow::Result;
use clap::Parser;
use tokio::time::{sleep, Duration};

use paperbridge::logging::{json_log, obj, v_num, v_str};
use paperbridge::sentinel::{CycleOutcome, Sentinel};
use paperbridge::state::{BridgePaths, Config};

#[derive(Parser, Debug)]
#[command(name = "guard", about = "Drawdown/day-loss sentinel")]
struct Args {
    /// Poll interval in seconds
    #[arg(long, default_value_t = 15)]
    interval: u64,
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

    let mut sentinel = Sentinel::new();
    json_log(
        "guard",
        obj(&[
            ("event", v_str("started")),
            ("max_dd_limit", v_num(cfg.max_drawdown_pct)),
            ("day_loss_limit", v_num(cfg.day_loss_limit_pct)),
        ]),
    );

    loop {
        match sentinel.poll_cycle(&cfg, &paths) {
            Ok(CycleOutcome::Breach { kind, offenders }) => {
                json_log(
                    "guard",
                    obj(&[
                        ("event", v_str("breach")),
                        ("kind", v_str(kind.as_str())),
                        ("offenders", serde_json::json!(offenders)),
                    ]),
                );
            }
            Ok(CycleOutcome::Clear) => {
                json_log("guard", obj(&[("event", v_str("clear"))]));
            }
            Ok(CycleOutcome::NoUpdate) => {}
            Err(err) => {
                json_log(
                    "guard",
                    obj(&[("event", v_str("cycle_error")), ("error", v_str(&format!("{:#}", err)))]),
                );
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                json_log("guard", obj(&[("event", v_str("interrupted"))]));
                return Ok(());
            }
            _ = sleep(Duration::from_secs(args.interval)) => {}
        }
    }
}
