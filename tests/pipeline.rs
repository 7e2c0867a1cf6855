use std::sync::Arc;
use std::time::Duration;

use mbt_core::{
    AcquisitionPipeline, ConnectionState, CoverageQuality, DeviceProfile, FrameLayout, PipelineConfig, Session,
    TransportKind,
};

fn single_channel() -> FrameLayout {
    FrameLayout {
        transport: TransportKind::Ble,
        channel_count: 1,
        status_bytes: 0,
        slots_per_frame: 1,
    }
}

fn frame(index: u16, sample: i16) -> Vec<u8> {
    let mut out = index.to_be_bytes().to_vec();
    out.extend_from_slice(&sample.to_be_bytes());
    out
}

#[tokio::test]
async fn lost_frame_becomes_nan_column() {
    let config = PipelineConfig {
        pending_capacity: 5,
        notification_threshold: 5,
    };
    let (pipeline, mut packets) = AcquisitionPipeline::spawn(single_channel(), config, Arc::new(CoverageQuality));

    // Frame 3 never arrives.
    for index in [1u16, 2, 4, 5] {
        pipeline.push_frame(&frame(index, index as i16 * 10)).unwrap();
    }
    assert_eq!(pipeline.stats().lost, 1);
    pipeline.shutdown().await;

    let packet = packets.recv().await.unwrap();
    let unit = TransportKind::Ble.volts_per_count();
    let samples = &packet.channels[0];
    assert_eq!(samples.len(), 5);
    assert_eq!(samples[0], 10.0 * unit);
    assert_eq!(samples[1], 20.0 * unit);
    assert!(samples[2].is_nan());
    assert_eq!(samples[3], 40.0 * unit);
    assert_eq!(samples[4], 50.0 * unit);
    assert_eq!(packet.quality, vec![0.8]);
    assert!(packets.recv().await.is_none());
}

#[tokio::test]
async fn run_that_fills_the_threshold_is_emitted_without_more_data() {
    let config = PipelineConfig {
        pending_capacity: 4,
        notification_threshold: 8,
    };
    let (pipeline, mut packets) = AcquisitionPipeline::spawn(single_channel(), config, Arc::new(CoverageQuality));
    for index in 0..8u16 {
        pipeline.push_frame(&frame(index, 1)).unwrap();
    }
    pipeline.shutdown().await;

    let packet = packets.recv().await.unwrap();
    assert_eq!(packet.len(), 8);
    assert!(packets.recv().await.is_none());
}

#[tokio::test]
async fn full_packet_survives_stream_stop() {
    let profile = DeviceProfile::melomind();
    let config = PipelineConfig {
        pending_capacity: 8,
        notification_threshold: 8,
    };
    let (mut session, mut packets) =
        Session::new(profile, config, Arc::new(CoverageQuality), Box::new(Vec::<u8>::new()));
    session.scan().unwrap();
    session.connect().unwrap();
    session.on_connected().unwrap();
    session.start_stream().unwrap();

    for index in 0..2u16 {
        let mut bytes = index.to_be_bytes().to_vec();
        bytes.push(0x00);
        bytes.extend_from_slice(&[0u8; 16]);
        session.handle_frame(&bytes).unwrap();
    }
    let packet = tokio::time::timeout(Duration::from_secs(5), packets.recv())
        .await
        .unwrap()
        .unwrap();
    session.stop_stream().unwrap();

    assert_eq!(packet.len(), 8);
    assert_eq!(packet.status, vec![0.0; 8]);
    session.close().await;
}

#[tokio::test]
async fn melomind_stream_through_a_session() {
    let profile = DeviceProfile::melomind();
    let config = PipelineConfig {
        pending_capacity: 8,
        notification_threshold: 8,
    };
    let (mut session, mut packets) =
        Session::new(profile.clone(), config, Arc::new(CoverageQuality), Box::new(Vec::<u8>::new()));

    session.scan().unwrap();
    session.connect().unwrap();
    session.on_connected().unwrap();
    session.start_stream().unwrap();
    assert_eq!(session.state(), ConnectionState::Streaming);

    // Four slots per frame, two channels, one status byte with every bit set.
    for index in 0..6u16 {
        let mut bytes = index.to_be_bytes().to_vec();
        bytes.push(0xFF);
        bytes.extend_from_slice(&[0u8; 16]);
        assert_eq!(bytes.len(), profile.frame_size());
        assert!(session.handle_frame(&bytes).unwrap());
    }
    session.close().await;

    let packet = packets.recv().await.unwrap();
    assert_eq!(packet.channels.len(), 2);
    assert_eq!(packet.status, vec![1.0; 8]);
    assert_eq!(packet.quality, vec![1.0, 1.0]);
}
