//! Shared building blocks for the Scream/RTP receiver and sender.
//!
//! Wire formats (RTP, RTCP, SAP/SDP), PCM framing, configuration, clocks,
//! events, socket helpers and observability live here so both pipelines
//! agree on them.

pub mod audio;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod net;
pub mod observability;
pub mod rtcp;
pub mod rtp;
pub mod sap;
pub mod shutdown;

pub use audio::{AudioFormat, PCM_CHUNK};
pub use cli::{ColorWhen, CommonArgs};
pub use clock::{ManualClock, SystemClock, WallClock};
pub use config::{
    BufferConfig, ConfigHandle, ConfigProvider, DeviceMode, NetworkInfo, NodeConfig,
};
pub use error::{ConfigError, CoreError, ParseError};
pub use events::{EventBus, NodeEvent};
pub use observability::{
    init_tracing, MetricsContext, MetricsServerConfig, ReceiverMetrics, SenderMetrics,
};
pub use rtp::{RtpHeader, RtpView};
pub use shutdown::Shutdown;
