//! End-to-end timing of the dispatch pipeline over a virtual clock.
//!
//! These scenarios preload traffic on the scheduler, release the virtual
//! clock past the horizon and then check the exact simulated instants at
//! which the channel freed the medium and delivered copies.

mod common;

use bytes::Bytes;
use common::{test_frame, virtual_lan, RecordingFabric, HORIZON};
use tapnet::{frame::EndpointId, simulation::EventKind};
use testresult::TestResult;

#[tokio::test]
async fn uncontended_frame_arrives_after_serialization_and_propagation() -> TestResult {
    let (mut scheduler, fabric, mut io, time) = virtual_lan(4);
    let mut fabric = RecordingFabric::new(fabric);
    scheduler.schedule_at(
        1_000_000_000,
        EventKind::TransmitStart {
            frame: test_frame(0, 1500, 1_000_000_000),
        },
    )?;

    time.advance_to(HORIZON);
    let stats = scheduler.run(HORIZON, &mut fabric).await?;

    // 1500 bytes at 100Mbps serialize in 120us; every other node sees the
    // frame one 6560ns propagation delay later.
    assert_eq!(fabric.dispatches("transmit-end"), [1_000_120_000]);
    assert_eq!(
        fabric.dispatches("deliver"),
        [1_000_126_560, 1_000_126_560, 1_000_126_560]
    );
    assert_eq!(stats.dispatched, 5);
    assert_eq!(fabric.inner.channel().stats().deliveries, 3);
    for node_io in io.iter_mut().skip(1) {
        assert_eq!(node_io.egress.try_recv()?.len(), 1500);
    }
    assert!(io[0].egress.try_recv().is_err(), "sender must not hear its own frame");
    Ok(())
}

#[tokio::test]
async fn simultaneous_transmissions_collide_and_deliver_nothing() -> TestResult {
    let (mut scheduler, fabric, mut io, time) = virtual_lan(4);
    let mut fabric = RecordingFabric::new(fabric);
    for source in 0..2 {
        scheduler.schedule_at(
            2_000_000_000,
            EventKind::TransmitStart {
                frame: test_frame(source, 1500, 2_000_000_000),
            },
        )?;
    }

    time.advance_to(HORIZON);
    let stats = scheduler.run(HORIZON, &mut fabric).await?;

    let channel = fabric.inner.channel().stats();
    assert_eq!(channel.collisions, 1);
    assert_eq!(channel.frames_dropped, 2);
    assert_eq!(channel.deliveries, 0);
    // The medium frees at the shared busy-until instant and stays idle.
    assert_eq!(fabric.dispatches("transmit-end"), [2_000_120_000]);
    assert!(fabric.dispatches("deliver").is_empty());
    assert!(fabric.inner.channel().is_idle());
    assert_eq!(stats.dispatched, 3);
    for node_io in io.iter_mut() {
        assert!(node_io.egress.try_recv().is_err());
    }
    Ok(())
}

#[tokio::test]
async fn zero_length_frame_still_pays_the_propagation_delay() -> TestResult {
    let (mut scheduler, fabric, _io, time) = virtual_lan(2);
    let mut fabric = RecordingFabric::new(fabric);
    scheduler.schedule_at(
        3_000_000_000,
        EventKind::TransmitStart {
            frame: test_frame(0, 0, 3_000_000_000),
        },
    )?;

    time.advance_to(HORIZON);
    scheduler.run(HORIZON, &mut fabric).await?;

    assert_eq!(fabric.dispatches("transmit-end"), [3_000_000_000]);
    assert_eq!(fabric.dispatches("deliver"), [3_000_006_560]);
    Ok(())
}

#[tokio::test]
async fn arrival_at_the_free_instant_transmits_cleanly() -> TestResult {
    let (mut scheduler, fabric, mut io, time) = virtual_lan(3);
    let mut fabric = RecordingFabric::new(fabric);
    scheduler.schedule_at(
        4_000_000_000,
        EventKind::TransmitStart {
            frame: test_frame(0, 1500, 4_000_000_000),
        },
    )?;
    // A raw frame lands on node 1's bridge at the exact busy-until
    // instant; its transmit attempt sorts behind the pending free.
    scheduler.schedule_at(
        4_000_120_000,
        EventKind::FrameArrival {
            endpoint: EndpointId::new(1),
            payload: Bytes::from(vec![0x42; 100]),
        },
    )?;

    time.advance_to(HORIZON);
    scheduler.run(HORIZON, &mut fabric).await?;

    let channel = fabric.inner.channel().stats();
    assert_eq!(channel.collisions, 0);
    assert_eq!(channel.transmissions, 2);
    // 100 bytes serialize in 8us.
    assert_eq!(
        fabric.dispatches("transmit-end"),
        [4_000_120_000, 4_000_128_000]
    );
    assert_eq!(
        fabric.dispatches("deliver"),
        [4_000_126_560, 4_000_126_560, 4_000_134_560, 4_000_134_560]
    );
    assert_eq!(io[1].stats.snapshot().frames_in, 1);
    assert_eq!(io[2].egress.try_recv()?.len(), 1500);
    assert_eq!(io[2].egress.try_recv()?.len(), 100);
    Ok(())
}

#[tokio::test]
async fn dispatch_times_never_decrease() -> TestResult {
    let (mut scheduler, fabric, _io, time) = virtual_lan(4);
    let mut fabric = RecordingFabric::new(fabric);
    for (source, at) in [(0u32, 500_000_000u64), (1, 200_000_000), (2, 500_000_000), (3, 900_000_000)]
    {
        scheduler.schedule_at(
            at,
            EventKind::TransmitStart {
                frame: test_frame(source, 256, at),
            },
        )?;
    }

    time.advance_to(HORIZON);
    scheduler.run(HORIZON, &mut fabric).await?;

    assert!(
        fabric.log.windows(2).all(|w| w[0].0 <= w[1].0),
        "dispatch log out of order: {:?}",
        fabric.log
    );
    Ok(())
}
