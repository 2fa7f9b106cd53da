//! Configuration for profiled.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// profiled - profile server daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "profiled")]
#[command(about = "Profile server: hosted identities, neighborhood sync, and relay")]
pub struct Config {
    /// Listen address for client (non-customer) requests
    #[arg(long, env = "PROFILED_CLIENT_LISTEN", default_value = "0.0.0.0:16987")]
    pub client_listen: SocketAddr,

    /// Listen address for application-service requests (relationship cards)
    #[arg(long, env = "PROFILED_APP_SERVICE_LISTEN", default_value = "0.0.0.0:16988")]
    pub app_service_listen: SocketAddr,

    /// Listen address for the neighbor-to-neighbor interface
    #[arg(long, env = "PROFILED_NEIGHBOR_LISTEN", default_value = "0.0.0.0:16989")]
    pub neighbor_listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(long, env = "PROFILED_DATA_DIR", default_value = "./data/profiled")]
    pub data_dir: PathBuf,

    /// Maximum number of neighborhood actions executed concurrently
    #[arg(long, default_value = "5")]
    pub action_concurrency: usize,

    /// How often the action queue scheduler scans for due work, in seconds
    #[arg(long, default_value = "20")]
    pub scheduler_tick_secs: u64,

    /// How long a claimed action reserves its (ServerId, class) slot, in seconds
    #[arg(long, default_value = "600")]
    pub action_reservation_secs: u64,

    /// Backoff applied to a soft-failed action before it becomes due again, in seconds
    #[arg(long, default_value = "600")]
    pub soft_failure_backoff_secs: u64,

    /// Safety margin subtracted from an AddNeighbor bulk-import deadline, in seconds
    #[arg(long, default_value = "90")]
    pub add_neighbor_safety_margin_secs: u64,

    /// How long a caller may wait for a callee to respond to a relay request, in seconds
    #[arg(long, default_value = "10")]
    pub relay_callee_response_timeout_secs: u64,

    /// How long a relay may wait for both ends to send their init message, in seconds
    #[arg(long, default_value = "30")]
    pub relay_init_timeout_secs: u64,

    /// How long shutdown waits for in-flight connections to drain, in seconds
    #[arg(long, default_value = "65")]
    pub shutdown_drain_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration invariants that clap's own parsing cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        let addrs = [self.client_listen, self.app_service_listen, self.neighbor_listen];
        for (i, a) in addrs.iter().enumerate() {
            for b in &addrs[i + 1..] {
                if a == b {
                    anyhow::bail!("listen addresses must be distinct, got duplicate {a}");
                }
            }
        }
        if self.action_concurrency == 0 {
            anyhow::bail!("action-concurrency must be at least 1");
        }
        if self.scheduler_tick_secs == 0 {
            anyhow::bail!("scheduler-tick-secs must be positive");
        }
        if self.action_reservation_secs == 0 {
            anyhow::bail!("action-reservation-secs must be positive");
        }
        if self.add_neighbor_safety_margin_secs >= self.action_reservation_secs {
            anyhow::bail!(
                "add-neighbor-safety-margin-secs must be smaller than action-reservation-secs"
            );
        }
        Ok(())
    }
}
