//! Session control: picks the receive target from SAP announcements.
//!
//! Keeps a small table of recent announcements. When one matches the
//! configured stream name, the ingress is pointed at its multicast group
//! (or left on unicast when the stream is addressed to this host), and a
//! sample rate change is requested if the announced rate differs.

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use scream_rtp_common::net::is_multicast;
use scream_rtp_common::{ConfigHandle, ConfigProvider, EventBus, NetworkInfo, NodeEvent, Shutdown};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::network::StreamTarget;
use crate::sap_listener::SapAnnouncement;

/// How long an announcement stays valid without being repeated.
pub const ANNOUNCEMENT_TTL: Duration = Duration::from_secs(120);

/// Interval of the expiry sweep.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(10);

/// One row of the announcement table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    // ---
    pub name: String,
    pub destination: Ipv4Addr,
    pub source: IpAddr,
    pub port: u16,
    pub sample_rate: u32,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub update_count: u32,
}

impl Announcement {
    // ---
    fn same_stream(&self, a: &SapAnnouncement) -> bool {
        // ---
        self.name == a.description.name && self.destination == a.description.destination && self.port == a.description.port
    }
}

/// What session control did with an announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDecision {
    /// No stream name configured, or a different one.
    NotWanted,

    /// Matched, but neither multicast nor addressed to this host.
    Rejected,

    /// Matched and already applied.
    Unchanged,

    Applied {
        target: StreamTarget,
        rate_change: Option<u32>,
    },
}

/// SSRC preference derived from an announcement origin: the last octet of
/// the source address in bits 16..24 and the port in the low 16 bits.
pub fn derive_ssrc_filter(source: IpAddr, port: u16) -> u32 {
    // ---
    let last_octet = match source {
        IpAddr::V4(ip) => ip.octets()[3],
        IpAddr::V6(ip) => ip.octets()[15],
    };
    (u32::from(last_octet) << 16) | u32::from(port)
}

pub struct SessionControl {
    // ---
    config: ConfigHandle,
    network: watch::Receiver<NetworkInfo>,
    targets: watch::Sender<StreamTarget>,
    events: EventBus,
    announcements: Vec<Announcement>,
    ttl: Duration,
}

impl SessionControl {
    // ---
    pub fn new(
        config: ConfigHandle,
        network: watch::Receiver<NetworkInfo>,
        targets: watch::Sender<StreamTarget>,
        events: EventBus,
    ) -> Self {
        // ---
        Self {
            config,
            network,
            targets,
            events,
            announcements: Vec::new(),
            ttl: ANNOUNCEMENT_TTL,
        }
    }

    /// Announcements that have not expired at `now`.
    pub fn active(&self, now: Instant) -> Vec<&Announcement> {
        // ---
        self.announcements
            .iter()
            .filter(|a| now.saturating_duration_since(a.last_seen) < self.ttl)
            .collect()
    }

    pub fn by_name(&self, name: &str) -> Vec<&Announcement> {
        // ---
        self.announcements.iter().filter(|a| a.name == name).collect()
    }

    pub fn clear(&mut self) {
        // ---
        self.announcements.clear();
    }

    /// Drops expired announcements. Returns how many were removed.
    pub fn purge(&mut self, now: Instant) -> usize {
        // ---
        let ttl = self.ttl;
        let before = self.announcements.len();
        self.announcements
            .retain(|a| now.saturating_duration_since(a.last_seen) < ttl);
        let removed = before - self.announcements.len();
        if removed > 0 {
            debug!("Purged {} expired SAP announcements", removed);
        }
        removed
    }

    /// Records an announcement and acts on it if it matches the wanted stream.
    pub fn on_announcement(&mut self, announcement: &SapAnnouncement, now: Instant) -> SessionDecision {
        // ---
        self.purge(now);
        let desc = &announcement.description;

        match self.announcements.iter_mut().find(|a| a.same_stream(announcement)) {
            Some(entry) => {
                entry.last_seen = now;
                entry.source = announcement.origin;
                entry.sample_rate = desc.sample_rate;
                entry.update_count = entry.update_count.saturating_add(1);
            }
            None => {
                debug!("New SAP stream {:?} at {}:{}", desc.name, desc.destination, desc.port);
                self.announcements.push(Announcement {
                    name: desc.name.clone(),
                    destination: desc.destination,
                    source: announcement.origin,
                    port: desc.port,
                    sample_rate: desc.sample_rate,
                    first_seen: now,
                    last_seen: now,
                    update_count: 1,
                });
            }
        }

        let wanted = self.config.current().sap_stream_name;
        if wanted.is_empty() || wanted != desc.name {
            return SessionDecision::NotWanted;
        }
        self.apply(&desc.name, desc.destination, announcement.origin, desc.port, desc.sample_rate)
    }

    /// Re-evaluates the table after the wanted stream name changed.
    pub fn on_stream_name_changed(&mut self, now: Instant) -> SessionDecision {
        // ---
        self.purge(now);
        let wanted = self.config.current().sap_stream_name;
        let latest = self
            .announcements
            .iter()
            .filter(|a| !wanted.is_empty() && a.name == wanted)
            .max_by_key(|a| a.last_seen)
            .cloned();

        match latest {
            Some(a) => self.apply(&a.name, a.destination, a.source, a.port, a.sample_rate),
            None => {
                if self.targets.send_if_modified(|t| std::mem::replace(t, StreamTarget::Unicast) != StreamTarget::Unicast) {
                    info!("No announcement for {:?}, back to unicast", wanted);
                }
                SessionDecision::NotWanted
            }
        }
    }

    fn apply(&mut self, name: &str, destination: Ipv4Addr, source: IpAddr, port: u16, sample_rate: u32) -> SessionDecision {
        // ---
        let target = if is_multicast(destination) {
            StreamTarget::Multicast {
                group: destination,
                port,
                ssrc_filter: Some(derive_ssrc_filter(source, port)),
            }
        } else if self.network.borrow().is_local(destination) {
            StreamTarget::Unicast
        } else {
            warn!(
                "SAP stream {:?} targets {}, which is neither multicast nor local",
                name, destination
            );
            return SessionDecision::Rejected;
        };

        let current_rate = self.config.current().sample_rate;
        let rate_change = (sample_rate != 0 && sample_rate != current_rate).then_some(sample_rate);
        let target_changed = self.targets.send_if_modified(|t| {
            if *t == target {
                return false;
            }
            *t = target;
            true
        });

        if !target_changed && rate_change.is_none() {
            return SessionDecision::Unchanged;
        }

        if let Some(rate) = rate_change {
            info!("SAP stream {:?} runs at {} Hz, switching from {} Hz", name, rate, current_rate);
            match self.config.update(|cfg| cfg.sample_rate = rate) {
                Ok(()) => self.events.publish(NodeEvent::RateChangeRequested { sample_rate: rate }),
                Err(e) => warn!("Rate change to {} Hz rejected: {}", rate, e),
            }
        }

        info!("Using SAP stream {:?} from {} ({}:{})", name, source, destination, port);
        self.events.publish(NodeEvent::SapStreamFound {
            name: name.to_string(),
            destination,
            port,
            sample_rate,
        });
        SessionDecision::Applied { target, rate_change }
    }

    /// Runs until `shutdown` clears or the announcement channel closes.
    pub async fn run(mut self, mut announcements: mpsc::Receiver<SapAnnouncement>, shutdown: Shutdown) {
        // ---
        let mut config_rx = self.config.subscribe();
        let mut wanted = config_rx.borrow_and_update().sap_stream_name.clone();
        let mut purge = tokio::time::interval(PURGE_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                a = announcements.recv() => match a {
                    Some(a) => {
                        self.on_announcement(&a, Instant::now());
                    }
                    None => break,
                },
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let name = config_rx.borrow_and_update().sap_stream_name.clone();
                    if name != wanted {
                        info!("Wanted SAP stream is now {:?}", name);
                        wanted = name;
                        self.on_stream_name_changed(Instant::now());
                    }
                }
                _ = purge.tick() => {
                    self.purge(Instant::now());
                }
            }
        }
        debug!("Session control stopped");
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use scream_rtp_common::sap::StreamDescription;
    use scream_rtp_common::NodeConfig;

    const GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);
    const SOURCE: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);
    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

    struct Fixture {
        session: SessionControl,
        config: ConfigHandle,
        targets: watch::Receiver<StreamTarget>,
        events: tokio::sync::broadcast::Receiver<NodeEvent>,
        _network: watch::Sender<NetworkInfo>,
    }

    fn fixture(wanted: &str) -> Fixture {
        // ---
        let mut cfg = NodeConfig::default();
        cfg.sap_stream_name = wanted.to_string();
        let config = ConfigHandle::new(cfg).expect("config failed");
        let (network_tx, network_rx) = watch::channel(NetworkInfo {
            local_ips: vec![LOCAL],
        });
        let (target_tx, target_rx) = watch::channel(StreamTarget::Unicast);
        let events = EventBus::default();
        let event_rx = events.subscribe();
        Fixture {
            session: SessionControl::new(config.clone(), network_rx, target_tx, events),
            config,
            targets: target_rx,
            events: event_rx,
            _network: network_tx,
        }
    }

    fn announcement(name: &str, destination: Ipv4Addr, sample_rate: u32) -> SapAnnouncement {
        // ---
        SapAnnouncement {
            description: StreamDescription {
                name: name.to_string(),
                destination,
                port: 4010,
                sample_rate,
                channels: 2,
            },
            origin: IpAddr::V4(SOURCE),
        }
    }

    #[test]
    fn test_ssrc_filter_derivation() {
        // ---
        assert_eq!(derive_ssrc_filter(IpAddr::V4(SOURCE), 4010), (20 << 16) | 4010);
    }

    #[test]
    fn test_matching_multicast_stream_is_joined_once() {
        // ---
        let mut f = fixture("foo");
        let now = Instant::now();
        let a = announcement("foo", GROUP, 48_000);

        let first = f.session.on_announcement(&a, now);
        let expected = StreamTarget::Multicast {
            group: GROUP,
            port: 4010,
            ssrc_filter: Some((20 << 16) | 4010),
        };
        assert_eq!(
            first,
            SessionDecision::Applied {
                target: expected,
                rate_change: None
            }
        );
        assert_eq!(*f.targets.borrow(), expected);
        assert!(matches!(
            f.events.try_recv(),
            Ok(NodeEvent::SapStreamFound { ref name, destination, .. }) if name == "foo" && destination == GROUP
        ));

        let again = f.session.on_announcement(&a, now + Duration::from_secs(30));
        assert_eq!(again, SessionDecision::Unchanged);
        assert!(f.events.try_recv().is_err());
        assert_eq!(f.session.by_name("foo")[0].update_count, 2);
    }

    #[test]
    fn test_unwanted_and_foreign_streams() {
        // ---
        let mut f = fixture("foo");
        let now = Instant::now();

        assert_eq!(
            f.session.on_announcement(&announcement("bar", GROUP, 48_000), now),
            SessionDecision::NotWanted
        );
        assert_eq!(
            f.session
                .on_announcement(&announcement("foo", Ipv4Addr::new(10, 9, 9, 9), 48_000), now),
            SessionDecision::Rejected
        );
        assert_eq!(
            f.session.on_announcement(&announcement("foo", LOCAL, 48_000), now),
            SessionDecision::Unchanged
        );
        assert_eq!(*f.targets.borrow(), StreamTarget::Unicast);
        assert_eq!(f.session.active(now).len(), 3);
    }

    #[test]
    fn test_rate_change_updates_config() {
        // ---
        let mut f = fixture("foo");
        let decision = f
            .session
            .on_announcement(&announcement("foo", GROUP, 96_000), Instant::now());

        assert!(matches!(decision, SessionDecision::Applied { rate_change: Some(96_000), .. }));
        assert_eq!(f.config.current().sample_rate, 96_000);
        assert_eq!(
            f.events.try_recv().expect("event missing"),
            NodeEvent::RateChangeRequested { sample_rate: 96_000 }
        );
    }

    #[test]
    fn test_expired_announcements_purged() {
        // ---
        let mut f = fixture("");
        let now = Instant::now();
        f.session.on_announcement(&announcement("foo", GROUP, 48_000), now);

        assert_eq!(f.session.purge(now + Duration::from_secs(60)), 0);
        assert_eq!(f.session.purge(now + ANNOUNCEMENT_TTL), 1);
        assert!(f.session.active(now).is_empty());
    }

    #[test]
    fn test_stream_name_change_rechecks_table() {
        // ---
        let mut f = fixture("");
        let now = Instant::now();
        assert_eq!(
            f.session.on_announcement(&announcement("foo", GROUP, 48_000), now),
            SessionDecision::NotWanted
        );

        f.config
            .update(|cfg| cfg.sap_stream_name = "foo".into())
            .expect("update failed");
        let decision = f.session.on_stream_name_changed(now + Duration::from_secs(1));
        assert!(matches!(decision, SessionDecision::Applied { .. }));

        f.config
            .update(|cfg| cfg.sap_stream_name.clear())
            .expect("update failed");
        f.session.on_stream_name_changed(now + Duration::from_secs(2));
        assert_eq!(*f.targets.borrow(), StreamTarget::Unicast);
    }
}
