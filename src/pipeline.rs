//! Frame-to-packet pipeline.
//!
//! The producer calls [`AcquisitionPipeline::push_frame`] for every transport
//! frame. Frame handling (sequence tracking and the pending buffer) runs under a
//! single lock. When the pending buffer fills, its content is moved to a decode
//! task over a channel and the producer returns immediately; the task decodes on
//! the blocking pool, appends to the consolidated buffer and publishes finished
//! packets on an unbounded channel.
//!
//! A reset bumps a generation counter. Decode runs tagged with an older
//! generation are dropped, and packet emission happens under the consolidated
//! buffer lock after the generation check, so nothing from before a reset is
//! delivered once [`AcquisitionPipeline::reset`] has returned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::acquisition::{Acquisition, AcquisitionStats, DcOffsetReading, FrameLayout, SampleRecord};
use crate::buffering::{self, ConsolidatedBuffer, ConsolidatedPacket, PendingBuffer};
use crate::config::PipelineConfig;
use crate::errors::{DecodeError, PipelineError, Result};

// ============================================================================
// Packets and scoring
// ============================================================================

/// A client-visible packet of calibrated signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EegPacket {
    /// Emission order since the pipeline was created; survives resets.
    pub sequence: u64,
    /// Volts, channel × time. NaN where frames were lost.
    pub channels: Vec<Vec<f32>>,
    /// Status bit per time column, NaN when undeterminable.
    pub status: Vec<f32>,
    /// Per-channel signal quality.
    pub quality: Vec<f32>,
    /// Packet-level score from the scorer, if it produced one.
    pub score: Option<f32>,
}

impl EegPacket {
    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }
}

/// Opaque quality and relaxation scoring applied to every emitted packet.
pub trait QualityScorer: Send + Sync {
    fn channel_quality(&self, packet: &ConsolidatedPacket) -> Vec<f32>;
    fn score(&self, packet: &ConsolidatedPacket, quality: &[f32]) -> Option<f32>;
}

/// Quality is the share of samples that are not NaN; no packet score.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoverageQuality;

impl QualityScorer for CoverageQuality {
    fn channel_quality(&self, packet: &ConsolidatedPacket) -> Vec<f32> {
        packet
            .channels
            .iter()
            .map(|channel| {
                if channel.is_empty() {
                    return 0.0;
                }
                let valid = channel.iter().filter(|v| !v.is_nan()).count();
                valid as f32 / channel.len() as f32
            })
            .collect()
    }

    fn score(&self, _packet: &ConsolidatedPacket, _quality: &[f32]) -> Option<f32> {
        None
    }
}

pub type PacketReceiver = mpsc::UnboundedReceiver<EegPacket>;

/// Adapt a packet receiver into a `Stream`.
pub fn packet_stream(rx: PacketReceiver) -> impl Stream<Item = EegPacket> {
    futures::stream::unfold(rx, |mut rx| async move {
        let packet = rx.recv().await?;
        Some((packet, rx))
    })
}

// ============================================================================
// Pipeline
// ============================================================================

struct FrameState {
    acquisition: Acquisition,
    pending: PendingBuffer,
}

struct Shared {
    generation: AtomicU64,
    consolidated: Mutex<ConsolidatedBuffer>,
    next_sequence: AtomicU64,
    dropped_runs: AtomicU64,
}

struct DecodeJob {
    generation: u64,
    records: Vec<SampleRecord>,
}

pub struct AcquisitionPipeline {
    frame_state: Mutex<FrameState>,
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<DecodeJob>,
    worker: JoinHandle<()>,
}

impl AcquisitionPipeline {
    /// Start the pipeline and its decode task. Must be called within a Tokio runtime.
    pub fn spawn(
        layout: FrameLayout,
        config: PipelineConfig,
        scorer: Arc<dyn QualityScorer>,
    ) -> (Self, PacketReceiver) {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (packets_tx, packets_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            generation: AtomicU64::new(0),
            consolidated: Mutex::new(ConsolidatedBuffer::new(
                layout.channel_count,
                config.notification_threshold,
            )),
            next_sequence: AtomicU64::new(0),
            dropped_runs: AtomicU64::new(0),
        });

        let worker = tokio::spawn(decode_worker(
            layout,
            Arc::clone(&shared),
            jobs_rx,
            packets_tx,
            scorer,
        ));

        debug!(
            "pipeline started: channels={}, pending_capacity={}, threshold={}",
            layout.channel_count, config.pending_capacity, config.notification_threshold
        );

        let pipeline = Self {
            frame_state: Mutex::new(FrameState {
                acquisition: Acquisition::new(layout),
                pending: PendingBuffer::new(config.pending_capacity),
            }),
            shared,
            jobs: jobs_tx,
            worker,
        };
        (pipeline, packets_rx)
    }

    /// Handle one transport frame. Malformed frames are dropped with an error.
    pub fn push_frame(&self, frame: &[u8]) -> Result<()> {
        let mut state = lock(&self.frame_state);
        let records = state.acquisition.on_frame(frame)?;

        if let Some(records) = state.pending.push(records) {
            let generation = self.shared.generation.load(Ordering::Acquire);
            self.jobs
                .send(DecodeJob {
                    generation,
                    records,
                })
                .map_err(|_| PipelineError::WorkerClosed)?;
        }
        Ok(())
    }

    pub fn push_dc_offset_frame(&self, frame: &[u8]) -> std::result::Result<DcOffsetReading, DecodeError> {
        lock(&self.frame_state).acquisition.on_dc_offset_frame(frame)
    }

    /// Drop all buffered data and the sequence history.
    pub fn reset(&self) {
        let mut state = lock(&self.frame_state);
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        state.acquisition.reset();
        state.pending.clear();
        lock(&self.shared.consolidated).clear();
        info!("pipeline reset, generation={}", generation);
    }

    pub fn stats(&self) -> AcquisitionStats {
        lock(&self.frame_state).acquisition.stats()
    }

    /// Decode runs the worker had to drop since the pipeline started.
    pub fn dropped_runs(&self) -> u64 {
        self.shared.dropped_runs.load(Ordering::Relaxed)
    }

    /// Records waiting in the pending buffer.
    pub fn pending_len(&self) -> usize {
        lock(&self.frame_state).pending.len()
    }

    /// Stop accepting decode runs and wait for the queued ones to finish.
    pub async fn shutdown(self) {
        let Self { jobs, worker, .. } = self;
        drop(jobs);
        if let Err(e) = worker.await {
            warn!("decode worker ended abnormally: {}", e);
        }
    }
}

async fn decode_worker(
    layout: FrameLayout,
    shared: Arc<Shared>,
    mut jobs: mpsc::UnboundedReceiver<DecodeJob>,
    packets: mpsc::UnboundedSender<EegPacket>,
    scorer: Arc<dyn QualityScorer>,
) {
    while let Some(job) = jobs.recv().await {
        if job.generation != shared.generation.load(Ordering::Acquire) {
            debug!("skipping stale decode run ({} records)", job.records.len());
            continue;
        }

        let DecodeJob {
            generation,
            records,
        } = job;
        let block = match tokio::task::spawn_blocking(move || {
            buffering::decode_records(&records, &layout)
        })
        .await
        {
            Ok(block) => block,
            Err(e) => {
                shared.dropped_runs.fetch_add(1, Ordering::Relaxed);
                error!("decode run failed: {}", e);
                continue;
            }
        };

        let mut consolidated = lock(&shared.consolidated);
        if generation != shared.generation.load(Ordering::Acquire) {
            debug!("discarding decode run finished after reset");
            continue;
        }

        let completed = match consolidated.append(&block) {
            Ok(completed) => completed,
            Err(e) => {
                shared.dropped_runs.fetch_add(1, Ordering::Relaxed);
                error!("dropping decode run of {} slots: {}", block.len(), e);
                continue;
            }
        };

        for packet in completed {
            let quality = scorer.channel_quality(&packet);
            let score = scorer.score(&packet, &quality);
            let ConsolidatedPacket { channels, status } = packet;
            let packet = EegPacket {
                sequence: shared.next_sequence.fetch_add(1, Ordering::Relaxed),
                channels,
                status,
                quality,
                score,
            };
            if packets.send(packet).is_err() {
                debug!("packet receiver dropped, discarding packet");
            }
        }
    }
    debug!("decode worker stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TransportKind;
    use std::time::Duration;

    fn layout() -> FrameLayout {
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

    fn config(pending_capacity: usize, notification_threshold: usize) -> PipelineConfig {
        PipelineConfig {
            pending_capacity,
            notification_threshold,
        }
    }

    #[tokio::test]
    async fn packets_are_emitted_in_order() {
        let (pipeline, mut rx) = AcquisitionPipeline::spawn(layout(), config(2, 3), Arc::new(CoverageQuality));
        for i in 0..8u16 {
            pipeline.push_frame(&frame(i, i as i16)).unwrap();
        }
        pipeline.shutdown().await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        let unit = TransportKind::Ble.volts_per_count();
        assert_eq!(first.channels[0], vec![0.0, unit, 2.0 * unit]);
        assert_eq!(second.channels[0], vec![3.0 * unit, 4.0 * unit, 5.0 * unit]);
        assert_eq!(first.quality, vec![1.0]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn malformed_frame_is_reported() {
        let (pipeline, _rx) = AcquisitionPipeline::spawn(layout(), config(2, 3), Arc::new(CoverageQuality));
        assert!(pipeline.push_frame(&[0x00, 0x01, 0x02]).is_err());
        assert_eq!(pipeline.stats().rejected, 1);
    }

    #[tokio::test]
    async fn reset_discards_buffered_data() {
        let (pipeline, mut rx) = AcquisitionPipeline::spawn(layout(), config(2, 4), Arc::new(CoverageQuality));
        for i in 0..3u16 {
            pipeline.push_frame(&frame(i, 1)).unwrap();
        }
        // Let the first decode run land in the consolidated buffer.
        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.reset();
        assert_eq!(pipeline.pending_len(), 0);

        for i in 100..104u16 {
            pipeline.push_frame(&frame(i, 2)).unwrap();
        }
        pipeline.push_frame(&frame(104, 2)).unwrap();
        pipeline.push_frame(&frame(105, 2)).unwrap();
        pipeline.shutdown().await;

        let packet = rx.recv().await.unwrap();
        let unit = TransportKind::Ble.volts_per_count();
        assert_eq!(packet.channels[0], vec![2.0 * unit; 4]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_adapter_yields_packets() {
        use futures::StreamExt;

        let (pipeline, rx) = AcquisitionPipeline::spawn(layout(), config(1, 1), Arc::new(CoverageQuality));
        for i in 0..3u16 {
            pipeline.push_frame(&frame(i, 0)).unwrap();
        }
        pipeline.shutdown().await;

        let packets: Vec<EegPacket> = packet_stream(rx).collect().await;
        assert_eq!(packets.len(), 3);
    }

    #[test]
    fn coverage_quality_counts_nan() {
        let packet = ConsolidatedPacket {
            channels: vec![vec![1.0, f32::NAN, 2.0, f32::NAN], vec![0.0; 4]],
            status: vec![0.0; 4],
        };
        assert_eq!(CoverageQuality.channel_quality(&packet), vec![0.5, 1.0]);
    }
}
