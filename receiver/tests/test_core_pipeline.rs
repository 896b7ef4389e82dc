//! Integration tests for the receive pipeline.
//!
//! Drives datagrams through the dispatcher, the sync engine, the jitter
//! buffer and the playout scheduler on a manual clock, with a recording
//! sink at the end.

use std::net::SocketAddr;
use std::sync::Arc;

use receiver::playout::PollOutcome;
use receiver::{
    JitterBuffer, JitterBufferConfig, MemorySink, PlayoutConfig, PlayoutControl, PlayoutScheduler, RtpDispatcher,
    RtpDisposition, SyncConfig, SyncEngine, SyncError,
};
use scream_rtp_common::rtcp::{encode_bye, NtpTimestamp, SenderReport};
use scream_rtp_common::rtp::{write_l16_packet, RtpHeader};
use scream_rtp_common::{BufferConfig, EventBus, ManualClock, MetricsContext, ReceiverMetrics, WallClock};

const WALL0: i64 = 1_700_000_000_000_000;
const MONO0: u64 = 5_000_000;
const RATE: u32 = 48_000;
const CHUNK: usize = 1152;
const TICKS: u32 = 288;
const PERIOD_US: u64 = 6_000;
const SSRC: u32 = 0x5C8E_A001;

struct Pipeline {
    clock: ManualClock,
    sync: Arc<SyncEngine>,
    dispatcher: RtpDispatcher,
    scheduler: PlayoutScheduler<MemorySink>,
    sink: MemorySink,
    metrics: ReceiverMetrics,
    source: SocketAddr,
}

impl Pipeline {
    fn new() -> Self {
        // ---
        let clock = ManualClock::new(MONO0, WALL0);
        let sync = Arc::new(SyncEngine::new(SyncConfig::default(), RATE, Arc::new(clock.clone())));
        let buffer = JitterBuffer::shared(JitterBufferConfig::from_buffer_config(&BufferConfig::default(), CHUNK));
        let metrics = MetricsContext::new("pipeline-test").expect("metrics failed").rx;
        let events = EventBus::default();
        let sink = MemorySink::new();

        let dispatcher = RtpDispatcher::new(Arc::clone(&sync), Arc::clone(&buffer), metrics.clone(), events.clone());
        let scheduler = PlayoutScheduler::new(
            sink.clone(),
            buffer,
            Arc::clone(&sync),
            Arc::new(PlayoutControl::new(1.0)),
            events,
            metrics.clone(),
            PlayoutConfig::default(),
        );

        Self {
            clock,
            sync,
            dispatcher,
            scheduler,
            sink,
            metrics,
            source: "192.168.1.20:40000".parse().expect("addr parse failed"),
        }
    }

    fn rtp(&mut self, seq: u16, ts: u32) -> RtpDisposition {
        // ---
        let pcm: Vec<u8> = (0..CHUNK).map(|i| (i % 251) as u8).collect();
        let mut datagram = Vec::new();
        write_l16_packet(&RtpHeader::l16(seq, ts, SSRC), &pcm, &mut datagram);
        self.dispatcher.handle_rtp(&datagram, Some(self.source))
    }

    /// SR stamped with the sender's view of "now".
    fn sender_report(&mut self, ssrc: u32, rtp_timestamp: u32) {
        // ---
        let sr = SenderReport {
            ssrc,
            ntp: NtpTimestamp::from_unix_us(self.clock.now_wall_us()),
            rtp_timestamp,
            packet_count: 0,
            octet_count: 0,
            reports: Vec::new(),
        };
        let mut datagram = Vec::new();
        sr.encode(&mut datagram);
        self.dispatcher.handle_rtcp(&datagram, Some(self.source));
    }

    /// Polls until the scheduler has nothing more to do at the current time.
    fn drain_playout(&mut self) {
        // ---
        let now = self.clock.now_monotonic_us();
        loop {
            match self.scheduler.poll(now) {
                PollOutcome::Wrote { .. } | PollOutcome::Dropped(_) => continue,
                _ => break,
            }
        }
    }
}

#[test]
fn test_steady_receive() {
    // ---
    let mut p = Pipeline::new();
    p.sender_report(SSRC, 0);

    let packets = 167u16;
    let mut underruns_while_streaming = 0;
    for t in (0..1_100_000u64).step_by(1_000) {
        if t % PERIOD_US == 0 && t / PERIOD_US < packets as u64 {
            let k = (t / PERIOD_US) as u16;
            let disposition = p.rtp(1000 + k, k as u32 * TICKS);
            assert_eq!(disposition, RtpDisposition::Queued { synchronized: true });
            underruns_while_streaming = p.metrics.buffer_underruns_total.get();
        }
        p.drain_playout();
        p.clock.advance_us(1_000);
    }

    let writes = p.sink.write_count();
    assert!((166..=167).contains(&writes), "expected 166-167 writes, got {}", writes);
    assert_eq!(p.metrics.buffer_overruns_total.get(), 0);
    assert_eq!(underruns_while_streaming, 0);
    assert_eq!(p.metrics.playout_late_drops_total.get(), 0);

    let ppm = p
        .sync
        .with_table(|t| t.get(SSRC).map(|s| s.ppm_deviation()))
        .expect("source missing");
    assert!(ppm.abs() <= 300.0, "ppm deviation {} out of bounds", ppm);
}

#[test]
fn test_playout_follows_sender_clock() {
    // ---
    let mut p = Pipeline::new();
    p.sender_report(SSRC, 0);

    for k in 0..8u16 {
        p.rtp(k, k as u32 * TICKS);
        p.clock.advance_us(PERIOD_US);
    }

    let ts = 4 * TICKS;
    let playout = p.sync.playout_calculate(SSRC, ts).expect("mapping failed");
    let expected = MONO0 + 4 * PERIOD_US + 30_000;
    assert!(playout.abs_diff(expected) <= 1, "playout {} vs {}", playout, expected);
}

#[test]
fn test_single_sr_goes_stale() {
    // ---
    let mut p = Pipeline::new();
    p.sender_report(SSRC, 0);
    p.rtp(0, 0);

    // Sender 100 ppm fast, no further SRs.
    let mut seq = 1u16;
    for second in 1..=20u64 {
        p.clock.advance_us(1_000_000);
        let ts = (second as f64 * RATE as f64 * 1.0001) as u32;
        p.rtp(seq, ts);
        seq += 1;
    }

    let ts = (20.0 * RATE as f64 * 1.0001) as u32;
    assert_eq!(p.sync.playout_calculate(SSRC, ts), Err(SyncError::Stale));
    assert!(p.sync.playout_calculate(SSRC, ts).expect_err("should fail").is_not_found());
}

#[test]
fn test_periodic_sr_keeps_mapping_valid_under_drift() {
    // ---
    const DRIFT_PPM: f64 = 100.0;
    const SR_INTERVAL_US: u64 = 5_000_000;
    const FIRST_SAMPLE_US: u64 = 30_000_000;
    const LAST_SAMPLE_US: u64 = 120_000_000;

    let mut p = Pipeline::new();
    // Sender ticks per receiver microsecond.
    let sender_rate = RATE as f64 * (1.0 + DRIFT_PPM / 1e6) / 1e6;
    let a0 = 1e6 / RATE as f64;

    let mut sent = 0u32;
    let mut samples = Vec::new();
    let mut t = 0u64;
    while t <= LAST_SAMPLE_US {
        if t % SR_INTERVAL_US == 0 {
            p.sender_report(SSRC, (t as f64 * sender_rate) as u32);
        }
        while sent as f64 * TICKS as f64 / sender_rate <= t as f64 {
            let disposition = p.rtp(sent as u16, sent * TICKS);
            assert_eq!(disposition, RtpDisposition::Queued { synchronized: true }, "at t={} us", t);
            sent += 1;
        }
        if t == FIRST_SAMPLE_US || t == LAST_SAMPLE_US {
            let ts = (sent - 1) * TICKS;
            let arrival = MONO0 as f64 + ts as f64 / sender_rate;
            let playout = p.sync.playout_calculate(SSRC, ts).expect("mapping should stay valid");
            samples.push((playout, ts, arrival));
        }
        p.drain_playout();
        p.clock.advance_us(1_000);
        t += 1_000;
    }

    // Rate of the map as the scheduler saw it: playout time per RTP tick
    // across many SR anchors and PLL corrections.
    let (first, last) = (samples[0], samples[1]);
    let realized_ppm = ((last.0 - first.0) as f64 / ((last.1 - first.1) as f64 * a0) - 1.0) * 1e6;
    assert!(
        (realized_ppm + DRIFT_PPM).abs() <= 50.0,
        "map slope {:+.1} ppm, sender drift {:+.1} ppm",
        realized_ppm,
        -DRIFT_PPM
    );

    // Headroom held at the target latency instead of creeping.
    for (playout, _, arrival) in &samples {
        let latency = *playout as f64 - arrival;
        assert!((latency - 30_000.0).abs() < 2_000.0, "latency {:.0} us", latency);
    }

    let (ppm, observations) = p
        .sync
        .with_table(|t| t.get(SSRC).map(|s| (s.ppm_deviation(), s.pll_observations())))
        .expect("source missing");
    assert!(ppm.abs() <= 300.0);
    assert!(observations > 10_000, "PLL saw {} observations", observations);

    assert_eq!(p.metrics.playout_late_drops_total.get(), 0);
    assert_eq!(p.metrics.playout_early_drops_total.get(), 0);
    assert_eq!(p.metrics.buffer_overruns_total.get(), 0);
    let writes = p.sink.write_count() as u64;
    assert!(writes + 10 >= u64::from(sent), "{} writes for {} packets", writes, sent);
    println!("✓ Map slope {:+.1} ppm against a {:+.0} ppm sender", realized_ppm, DRIFT_PPM);
}

#[test]
fn test_bye_resets_source() {
    // ---
    let mut p = Pipeline::new();
    p.sender_report(SSRC, 0);
    p.rtp(0, 0);
    assert!(p.sync.playout_calculate(SSRC, 0).is_ok());

    let mut bye = Vec::new();
    encode_bye(&[SSRC], &mut bye);
    p.dispatcher.handle_rtcp(&bye, Some(p.source));

    let err = p.sync.playout_calculate(SSRC, 0).expect_err("should fail after BYE");
    assert!(err.is_not_found());

    assert_eq!(p.rtp(1, TICKS), RtpDisposition::Queued { synchronized: false });
    assert_eq!(p.sync.tracked(), 1);
    assert_eq!(p.sync.playout_calculate(SSRC, TICKS), Err(SyncError::Unseeded));
}

#[test]
fn test_second_source_is_tracked_not_played() {
    // ---
    let mut p = Pipeline::new();
    p.rtp(0, 0);

    let mut pcm_other = Vec::new();
    write_l16_packet(&RtpHeader::l16(7, 0, 0x0BAD_F00D), &vec![0u8; CHUNK], &mut pcm_other);
    assert_eq!(
        p.dispatcher.handle_rtp(&pcm_other, Some(p.source)),
        RtpDisposition::NonPrimary
    );
    assert_eq!(p.sync.tracked(), 2);
    assert_eq!(p.sync.primary(), Some(SSRC));
    assert_eq!(p.metrics.non_primary_total.get(), 1);
}

#[tokio::test]
async fn test_sap_announcement_joins_multicast_once() {
    // ---
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    use receiver::sap_listener::SapAnnouncement;
    use receiver::session::SessionDecision;
    use receiver::{Ingress, SessionControl, StreamTarget};
    use scream_rtp_common::sap::StreamDescription;
    use scream_rtp_common::{ConfigHandle, NetworkInfo, NodeConfig};
    use tokio::sync::watch;

    const PORT: u16 = 47_420;
    let group = Ipv4Addr::new(239, 255, 77, 78);

    let mut cfg = NodeConfig::default();
    cfg.port = PORT;
    cfg.sap_stream_name = "studio".to_string();
    let config = ConfigHandle::new(cfg).expect("config failed");

    let (_network_tx, network_rx) = watch::channel(NetworkInfo {
        local_ips: vec![Ipv4Addr::new(192, 168, 1, 50)],
    });
    let (target_tx, target_rx) = watch::channel(StreamTarget::Unicast);
    let events = EventBus::default();
    let mut session = SessionControl::new(config.clone(), network_rx, target_tx, events.clone());

    let announcement = SapAnnouncement {
        description: StreamDescription {
            name: "studio".to_string(),
            destination: group,
            port: PORT,
            sample_rate: RATE,
            channels: 2,
        },
        origin: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
    };
    let decision = session.on_announcement(&announcement, Instant::now());
    let SessionDecision::Applied { target, rate_change } = decision else {
        panic!("announcement not applied: {:?}", decision);
    };
    assert_eq!(rate_change, None);
    assert_eq!(*target_rx.borrow(), target);

    let p = Pipeline::new();
    let ingress_metrics = MetricsContext::new("join-test").expect("metrics failed").rx;
    let buffer = JitterBuffer::shared(JitterBufferConfig::from_buffer_config(&BufferConfig::default(), CHUNK));
    let dispatcher = RtpDispatcher::new(Arc::clone(&p.sync), buffer, ingress_metrics.clone(), events);
    let mut ingress = Ingress::bind(dispatcher, config, ingress_metrics.clone()).expect("bind failed");

    ingress.apply_target(target);
    if ingress.membership().is_none() {
        // No multicast route on this host.
        return;
    }
    ingress.apply_target(target);
    assert_eq!(ingress_metrics.multicast_joins_total.get(), 1);

    ingress.apply_target(StreamTarget::Unicast);
    assert!(ingress.membership().is_none());
}
