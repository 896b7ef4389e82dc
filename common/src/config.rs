//! Node configuration and the provider interface the pipelines read it through.
//!
//! Values are validated as a whole before they replace the active
//! configuration; a rejected update leaves the previous one in place.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::audio::{AudioFormat, BIT_DEPTH, SUPPORTED_RATES};
use crate::error::ConfigError;
use crate::sap::SAP_DEFAULT_ADDR;

/// Default RTP port for both directions.
pub const DEFAULT_PORT: u16 = 4010;

/// Default multicast destination for the sender.
pub const DEFAULT_MULTICAST: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);

/// Upper limit on jitter buffer slots.
pub const BUFFER_SLOTS_LIMIT: usize = 64;

/// Which pipelines run and which sample I/O backend they use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum DeviceMode {
    /// Receive RTP and play through the host audio device.
    ReceiverUsb,

    /// Receive RTP and write the digital PCM stream to a WAV file.
    ReceiverSpdif,

    /// Capture from the host audio input device and send RTP.
    SenderUsb,

    /// Stream a WAV file as RTP.
    SenderSpdif,
}

impl DeviceMode {
    // ---
    pub fn is_receiver(self) -> bool {
        // ---
        matches!(self, DeviceMode::ReceiverUsb | DeviceMode::ReceiverSpdif)
    }

    pub fn is_sender(self) -> bool {
        // ---
        !self.is_receiver()
    }

    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            DeviceMode::ReceiverUsb => "receiver-usb",
            DeviceMode::ReceiverSpdif => "receiver-spdif",
            DeviceMode::SenderUsb => "sender-usb",
            DeviceMode::SenderSpdif => "sender-spdif",
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "receiver-usb" => Ok(DeviceMode::ReceiverUsb),
            "receiver-spdif" => Ok(DeviceMode::ReceiverSpdif),
            "sender-usb" => Ok(DeviceMode::SenderUsb),
            "sender-spdif" => Ok(DeviceMode::SenderSpdif),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Jitter buffer sizing, in chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    // ---
    pub initial_buffer_size: usize,
    pub max_buffer_size: usize,
    pub buffer_grow_step: usize,
    pub max_grow_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        // ---
        Self {
            initial_buffer_size: 4,
            max_buffer_size: 24,
            buffer_grow_step: 2,
            max_grow_size: 16,
        }
    }
}

impl BufferConfig {
    // ---
    pub fn validate(&self) -> Result<(), ConfigError> {
        // ---
        let b = self;
        if b.initial_buffer_size == 0 {
            return Err(ConfigError::InvalidBuffer("initial_buffer_size must be >= 1".into()));
        }
        if b.buffer_grow_step == 0 {
            return Err(ConfigError::InvalidBuffer("buffer_grow_step must be >= 1".into()));
        }
        if b.initial_buffer_size > b.max_grow_size {
            return Err(ConfigError::InvalidBuffer(format!(
                "initial_buffer_size {} exceeds max_grow_size {}",
                b.initial_buffer_size, b.max_grow_size
            )));
        }
        if b.max_grow_size > b.max_buffer_size {
            return Err(ConfigError::InvalidBuffer(format!(
                "max_grow_size {} exceeds max_buffer_size {}",
                b.max_grow_size, b.max_buffer_size
            )));
        }
        if b.max_buffer_size > BUFFER_SLOTS_LIMIT {
            return Err(ConfigError::InvalidBuffer(format!(
                "max_buffer_size {} exceeds {}",
                b.max_buffer_size, BUFFER_SLOTS_LIMIT
            )));
        }
        Ok(())
    }
}

/// Every option the streaming core reacts to.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    // ---
    pub device_mode: DeviceMode,

    /// Unicast RTP receive port (RTCP on `port + 1`).
    pub port: u16,
    pub sample_rate: u32,
    pub bit_depth: u16,

    /// Linear gain, 0.0 to 1.0.
    pub volume: f32,
    pub muted: bool,
    pub buffer: BufferConfig,

    pub sender_destination_ip: Ipv4Addr,
    pub sender_destination_port: u16,

    /// Desired SAP stream; empty means passive.
    pub sap_stream_name: String,
    pub sap_address: SocketAddrV4,

    /// Name shown in announced SDP and RTCP CNAME.
    pub device_name: String,
    pub silence_threshold_ms: u64,
    pub rr_interval_ms: u64,
    pub sr_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        // ---
        Self {
            device_mode: DeviceMode::ReceiverUsb,
            port: DEFAULT_PORT,
            sample_rate: 48_000,
            bit_depth: BIT_DEPTH,
            volume: 1.0,
            muted: false,
            buffer: BufferConfig::default(),
            sender_destination_ip: DEFAULT_MULTICAST,
            sender_destination_port: DEFAULT_PORT,
            sap_stream_name: String::new(),
            sap_address: SAP_DEFAULT_ADDR,
            device_name: "scream-node".to_string(),
            silence_threshold_ms: 30_000,
            rr_interval_ms: 5_000,
            sr_interval_ms: 5_000,
        }
    }
}

impl NodeConfig {
    // ---
    /// Checks every field; the first violation is reported.
    ///
    /// # Errors
    ///
    /// Returns the `ConfigError` describing the offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // ---
        if self.port == 0 || self.port == u16::MAX {
            return Err(ConfigError::InvalidPort(self.port));
        }
        if !SUPPORTED_RATES.contains(&self.sample_rate) {
            return Err(ConfigError::UnsupportedSampleRate(self.sample_rate));
        }
        if self.bit_depth != BIT_DEPTH {
            return Err(ConfigError::UnsupportedBitDepth(self.bit_depth));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(ConfigError::InvalidVolume(self.volume));
        }
        self.buffer.validate()?;
        validate_destination(self.sender_destination_ip)?;
        if self.sender_destination_port == 0 || self.sender_destination_port == u16::MAX {
            return Err(ConfigError::InvalidPort(self.sender_destination_port));
        }
        if self.sap_address.port() == 0 || !self.sap_address.ip().is_multicast() {
            return Err(ConfigError::InvalidAddress(self.sap_address.to_string()));
        }
        Ok(())
    }

    pub fn audio_format(&self) -> AudioFormat {
        // ---
        AudioFormat::l16_stereo(self.sample_rate)
    }

    /// Volume to apply, folding in mute.
    pub fn effective_volume(&self) -> f32 {
        // ---
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }

    pub fn silence_threshold(&self) -> Duration {
        // ---
        Duration::from_millis(self.silence_threshold_ms)
    }

    pub fn sender_destination(&self) -> SocketAddrV4 {
        // ---
        SocketAddrV4::new(self.sender_destination_ip, self.sender_destination_port)
    }
}

/// Rejects addresses a sender cannot target.
pub fn validate_destination(ip: Ipv4Addr) -> Result<(), ConfigError> {
    // ---
    if ip.is_unspecified() || ip.is_broadcast() {
        return Err(ConfigError::InvalidAddress(ip.to_string()));
    }
    Ok(())
}

/// Parses a dotted IPv4 string into a validated destination.
pub fn parse_destination(s: &str) -> Result<Ipv4Addr, ConfigError> {
    // ---
    let ip = s
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
    validate_destination(ip)?;
    Ok(ip)
}

/// Source of typed configuration values and change notifications.
pub trait ConfigProvider: Send + Sync {
    /// Snapshot of the active configuration.
    fn current(&self) -> NodeConfig;

    /// Receiver that observes every accepted update.
    fn subscribe(&self) -> watch::Receiver<NodeConfig>;
}

/// In-process configuration store backed by a `watch` channel.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    // ---
    tx: Arc<watch::Sender<NodeConfig>>,
}

impl ConfigHandle {
    // ---
    /// Validates and installs the initial configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `initial` is invalid.
    pub fn new(initial: NodeConfig) -> Result<Self, ConfigError> {
        // ---
        initial.validate()?;
        let (tx, _rx) = watch::channel(initial);
        Ok(Self { tx: Arc::new(tx) })
    }

    /// Applies `f` to a copy of the active configuration and installs it if valid.
    ///
    /// Subscribers are only notified when something actually changed.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` and keeps the previous configuration when the
    /// candidate fails validation.
    pub fn update<F>(&self, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut NodeConfig),
    {
        // ---
        let mut candidate = self.tx.borrow().clone();
        f(&mut candidate);

        if let Err(e) = candidate.validate() {
            warn!("Rejected configuration update: {}", e);
            return Err(e);
        }

        self.tx.send_if_modified(|active| {
            if *active == candidate {
                return false;
            }
            info!("Configuration updated");
            *active = candidate;
            true
        });
        Ok(())
    }
}

impl ConfigProvider for ConfigHandle {
    fn current(&self) -> NodeConfig {
        // ---
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<NodeConfig> {
        // ---
        self.tx.subscribe()
    }
}

/// Local network state published by the connectivity layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    // ---
    pub local_ips: Vec<Ipv4Addr>,
}

impl NetworkInfo {
    // ---
    /// `NetworkReady`: at least one usable local address.
    pub fn is_ready(&self) -> bool {
        // ---
        !self.local_ips.is_empty()
    }

    pub fn is_local(&self, ip: Ipv4Addr) -> bool {
        // ---
        ip.is_loopback() || self.local_ips.contains(&ip)
    }

    /// Primary address used as SAP origin and SDP `o=` address.
    pub fn primary(&self) -> Ipv4Addr {
        // ---
        self.local_ips.first().copied().unwrap_or(Ipv4Addr::LOCALHOST)
    }

    /// Best-effort discovery of the primary interface address.
    ///
    /// Connecting a UDP socket sends nothing; it only makes the kernel pick
    /// the outbound interface.
    pub fn discover() -> Self {
        // ---
        let probe = UdpSocket::bind("0.0.0.0:0").and_then(|s| {
            s.connect((DEFAULT_MULTICAST, DEFAULT_PORT))?;
            s.local_addr()
        });

        match probe {
            Ok(std::net::SocketAddr::V4(addr)) if !addr.ip().is_unspecified() => Self {
                local_ips: vec![*addr.ip()],
            },
            Ok(_) => Self::default(),
            Err(e) => {
                warn!("Local address discovery failed: {}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        // ---
        let cfg = NodeConfig::default();
        cfg.validate().expect("defaults should validate");
        assert_eq!(cfg.port, 4010);
        assert_eq!(cfg.audio_format().chunk_bytes(), 1152);
        assert_eq!(cfg.buffer.max_buffer_size, 24);
    }

    #[test]
    fn test_invalid_values_rejected() {
        // ---
        let mut cfg = NodeConfig::default();
        cfg.port = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidPort(0)));

        let mut cfg = NodeConfig::default();
        cfg.sample_rate = 22_050;
        assert_eq!(cfg.validate(), Err(ConfigError::UnsupportedSampleRate(22_050)));

        let mut cfg = NodeConfig::default();
        cfg.volume = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidVolume(_))));

        let mut cfg = NodeConfig::default();
        cfg.buffer.max_grow_size = 40;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidBuffer(_))));

        assert!(parse_destination("not-an-ip").is_err());
        assert!(parse_destination("0.0.0.0").is_err());
        assert_eq!(
            parse_destination("239.255.77.77"),
            Ok(Ipv4Addr::new(239, 255, 77, 77))
        );
    }

    #[test]
    fn test_rejected_update_keeps_previous() {
        // ---
        let handle = ConfigHandle::new(NodeConfig::default()).expect("handle creation failed");
        let mut rx = handle.subscribe();

        assert!(handle.update(|c| c.port = 0).is_err());
        assert_eq!(handle.current().port, 4010);
        assert!(!rx.has_changed().expect("channel closed"));

        handle.update(|c| c.port = 5004).expect("update failed");
        assert!(rx.has_changed().expect("channel closed"));
        assert_eq!(rx.borrow_and_update().port, 5004);

        // Same value again does not notify.
        handle.update(|c| c.port = 5004).expect("update failed");
        assert!(!rx.has_changed().expect("channel closed"));
    }

    #[test]
    fn test_device_mode_parsing() {
        // ---
        assert_eq!("sender-spdif".parse(), Ok(DeviceMode::SenderSpdif));
        assert!(DeviceMode::ReceiverUsb.is_receiver());
        assert!(DeviceMode::SenderUsb.is_sender());
        assert!("bogus".parse::<DeviceMode>().is_err());
    }

    #[test]
    fn test_network_info_locality() {
        // ---
        let info = NetworkInfo {
            local_ips: vec![Ipv4Addr::new(192, 168, 1, 20)],
        };
        assert!(info.is_ready());
        assert!(info.is_local(Ipv4Addr::new(192, 168, 1, 20)));
        assert!(info.is_local(Ipv4Addr::LOCALHOST));
        assert!(!info.is_local(Ipv4Addr::new(192, 168, 1, 21)));
    }
}
