//! Integration tests for network resilience.
//!
//! Feeds the receive path through a simulated network with packet loss,
//! jitter and reordering, on a manual clock.

mod network_simulator;

use std::sync::Arc;

use network_simulator::{NetworkSimulator, NetworkSimulatorConfig};
use receiver::playout::PollOutcome;
use receiver::{
    JitterBuffer, JitterBufferConfig, MemorySink, PlayoutConfig, PlayoutControl, PlayoutScheduler, RtpDispatcher,
};
use scream_rtp_common::rtcp::{NtpTimestamp, SenderReport};
use scream_rtp_common::rtp::{write_l16_packet, RtpHeader};
use scream_rtp_common::{BufferConfig, EventBus, ManualClock, MetricsContext, WallClock};

const CHUNK: usize = 1152;
const TICKS: u32 = 288;
const PERIOD_US: u64 = 6_000;
const SSRC: u32 = 0x1234_5678;

/// Outcome of one simulated run.
struct RunReport {
    writes: usize,
    max_fill: usize,
    capacity: usize,
    lost: u64,
    reordered: u64,
}

/// Streams `packets` chunks through `network` and plays them out.
fn run(network: NetworkSimulatorConfig, packets: u32) -> RunReport {
    // ---
    let clock = ManualClock::new(1_000_000, 1_700_000_000_000_000);
    let sync = Arc::new(receiver::SyncEngine::new(
        receiver::SyncConfig::default(),
        48_000,
        Arc::new(clock.clone()),
    ));
    let buffer = JitterBuffer::shared(JitterBufferConfig::from_buffer_config(&BufferConfig::default(), CHUNK));
    let metrics = MetricsContext::new("resilience-test").expect("metrics failed").rx;
    let events = EventBus::default();
    let sink = MemorySink::new();

    let mut dispatcher = RtpDispatcher::new(Arc::clone(&sync), Arc::clone(&buffer), metrics.clone(), events.clone());
    let mut scheduler = PlayoutScheduler::new(
        sink.clone(),
        Arc::clone(&buffer),
        sync,
        Arc::new(PlayoutControl::new(1.0)),
        events,
        metrics,
        PlayoutConfig::default(),
    );
    let mut sim = NetworkSimulator::new(network);
    let from = Some("10.0.0.7:40000".parse().expect("addr parse failed"));

    let sr = SenderReport {
        ssrc: SSRC,
        ntp: NtpTimestamp::from_unix_us(clock.now_wall_us()),
        rtp_timestamp: 0,
        packet_count: 0,
        octet_count: 0,
        reports: Vec::new(),
    };
    let mut datagram = Vec::new();
    sr.encode(&mut datagram);
    dispatcher.handle_rtcp(&datagram, from);

    let pcm = vec![0x11u8; CHUNK];
    let start = clock.now_monotonic_us();
    let end = start + packets as u64 * PERIOD_US + 500_000;
    let mut max_fill = 0;

    while clock.now_monotonic_us() < end {
        let now = clock.now_monotonic_us();
        let elapsed = now - start;
        if elapsed % PERIOD_US == 0 && elapsed / PERIOD_US < packets as u64 {
            let k = (elapsed / PERIOD_US) as u32;
            let mut datagram = Vec::new();
            write_l16_packet(&RtpHeader::l16(k as u16, k * TICKS, SSRC), &pcm, &mut datagram);
            sim.send(datagram, now);
        }

        for datagram in sim.receive(now) {
            dispatcher.handle_rtp(&datagram, from);
            max_fill = max_fill.max(buffer.lock().len());
        }

        while matches!(
            scheduler.poll(now),
            PollOutcome::Wrote { .. } | PollOutcome::Dropped(_)
        ) {}
        clock.advance_us(1_000);
    }

    let capacity = buffer.lock().status().capacity;
    RunReport {
        writes: sink.write_count(),
        max_fill,
        capacity,
        lost: dispatcher.stats().packets_lost,
        reordered: dispatcher.stats().packets_reordered,
    }
}

#[test]
fn test_perfect_network() {
    // ---
    let report = run(NetworkSimulatorConfig::default(), 200);

    assert_eq!(report.writes, 200);
    assert_eq!(report.lost, 0);
    assert!(report.max_fill <= report.capacity);
    println!("✓ Perfect network: {} chunks played", report.writes);
}

#[test]
fn test_packet_loss() {
    // ---
    let report = run(
        NetworkSimulatorConfig {
            loss_rate: 0.1,
            seed: 42,
            ..NetworkSimulatorConfig::default()
        },
        500,
    );

    assert!(report.writes > 0);
    assert!(report.writes < 500);
    assert!(report.lost > 0, "losses should be counted");
    assert!(report.max_fill <= report.capacity);
    println!("✓ 10% loss: {} played, {} counted lost", report.writes, report.lost);
}

#[test]
fn test_jitter() {
    // ---
    let report = run(
        NetworkSimulatorConfig {
            jitter_us: 5_000,
            seed: 7,
            ..NetworkSimulatorConfig::default()
        },
        300,
    );

    assert!(report.writes > 250, "only {} chunks played", report.writes);
    assert!(report.max_fill <= report.capacity);
    println!("✓ 5 ms jitter: {} chunks played", report.writes);
}

#[test]
fn test_reordering() {
    // ---
    let report = run(
        NetworkSimulatorConfig {
            jitter_us: 3_000,
            reorder_rate: 0.2,
            seed: 1234,
            ..NetworkSimulatorConfig::default()
        },
        300,
    );

    assert!(report.writes > 0);
    assert!(report.reordered > 0, "reordering should be observed");
    assert!(report.max_fill <= report.capacity);
    println!("✓ Reordering: {} played, {} reordered", report.writes, report.reordered);
}

#[test]
fn test_combined_conditions() {
    // ---
    let report = run(
        NetworkSimulatorConfig {
            loss_rate: 0.05,
            jitter_us: 8_000,
            reorder_rate: 0.1,
            seed: 99,
        },
        1000,
    );

    assert!(report.writes > 0);
    assert!(report.max_fill <= report.capacity);
    println!(
        "✓ Combined: {} played, {} lost, {} reordered",
        report.writes, report.lost, report.reordered
    );
}

#[test]
fn test_simulator_is_deterministic() {
    // ---
    let config = NetworkSimulatorConfig {
        loss_rate: 0.3,
        jitter_us: 2_000,
        reorder_rate: 0.1,
        seed: 5,
    };
    let mut a = NetworkSimulator::new(config.clone());
    let mut b = NetworkSimulator::new(config);

    for i in 0..100u64 {
        a.send(vec![i as u8], i * 1_000);
        b.send(vec![i as u8], i * 1_000);
    }
    assert_eq!(a.receive(200_000), b.receive(200_000));
    assert_eq!(a.stats().packets_lost, b.stats().packets_lost);
    assert_eq!(a.in_flight(), 0);
}
