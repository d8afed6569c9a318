//! Paper-traded crossover strategy with file-bus process coordination.
//!
//! Four independent processes share one directory tree and nothing else:
//! the trader (signals + position ledger), the bridge (status
//! aggregation), the guard (drawdown sentinel writing control
//! directives), and the agent (approval-gated change requests).

pub mod aggregator;
pub mod bus;
pub mod feed;
pub mod gateway;
pub mod logging;
pub mod portfolio;
pub mod sentinel;
pub mod signal;
pub mod state;
