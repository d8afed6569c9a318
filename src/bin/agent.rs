//! Approval gateway loop: watch the inbox, process tasks, record results.

use anyhow::Result;
use clap::Parser;
use tokio::time::{sleep, Duration};

use paperbridge::gateway::Gateway;
use paperbridge::logging::{json_log, obj, v_str};
use paperbridge::state::{BridgePaths, Config};

#[derive(Parser, Debug)]
#[command(name = "agent", about = "Approval-gated change-request gateway")]
struct Args {
    /// Inbox poll interval in milliseconds
    #[arg(long, default_value_t = 500)]
    poll_millis: u64,
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

    let gateway = Gateway::new(paths.clone(), &cfg);
    json_log(
        "agent",
        obj(&[("event", v_str("started")), ("inbox", v_str(&paths.inbox.display().to_string()))]),
    );

    loop {
        for task in gateway.scan_inbox() {
            let name = task.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let outcome = gateway.process_task_file(&task).await;
            json_log(
                "agent",
                obj(&[
                    ("event", v_str("task_processed")),
                    ("file", v_str(&name)),
                    ("outcome", v_str(&format!("{:?}", outcome))),
                ]),
            );
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                json_log("agent", obj(&[("event", v_str("interrupted"))]));
                return Ok(());
            }
            _ = sleep(Duration::from_millis(args.poll_millis)) => {}
        }
    }
}
