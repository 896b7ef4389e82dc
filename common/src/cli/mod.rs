//! Command-line arguments shared by both binaries.

mod color;

pub use color::ColorWhen;

use std::net::SocketAddr;

/// Logging and metrics flags flattened into each binary's `Args`.
#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
    // ---
    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9200")]
    pub metrics_bind: SocketAddr,

    /// Disable the metrics endpoint.
    #[arg(long)]
    pub no_metrics: bool,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    pub color: ColorWhen,
}
