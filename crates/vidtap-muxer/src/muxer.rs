//! Packet interleaving core
//!
//! One worker thread repeatedly picks the stream with the lowest accumulated
//! presentation time that still has (or may still get) packets, pops its
//! front packet, rescales the timestamps into the container's time-base and
//! writes it. Containers want packets in roughly non-decreasing time order
//! across streams; selecting the minimum-pts stream achieves that without
//! making the producers coordinate.

use crate::error::MuxerResult;
use crate::packet::PacketEnvelope;
use crate::queue::StreamQueue;
use crate::writer::{rescale, ContainerWriter, Rational, StreamParams};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long the worker naps when its chosen queue turns out empty
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// The shutdown contract between the muxer and its encoders
///
/// `finish` asks the encoder to drain what it has and then end its stream;
/// `stop` asks it to abandon pending work and end its stream. Either way the
/// encoder must eventually call [`MuxerCore::end_stream`], or the worker
/// never terminates.
pub trait Encoder: Send {
    fn finish(&self);
    fn stop(&self);
}

#[derive(Default)]
struct SharedStats {
    total_bytes: u64,
    bit_rate: f64,
    previous_pts: Option<f64>,
    previous_bytes: u64,
}

struct WorkerState {
    writer: Mutex<Box<dyn ContainerWriter + Send>>,
    streams: Vec<StreamQueue>,
    codec_time_bases: Vec<Rational>,
    stats: Mutex<SharedStats>,
    error_occurred: AtomicBool,
    is_done: AtomicBool,
}

/// Drives a [`ContainerWriter`] from per-stream packet queues
pub struct MuxerCore {
    /// Present until `start` moves it into the worker state
    writer: Option<Box<dyn ContainerWriter + Send>>,
    codec_time_bases: Vec<Rational>,
    encoders: Vec<Option<Box<dyn Encoder>>>,
    state: Option<Arc<WorkerState>>,
    worker: Option<JoinHandle<()>>,
}

impl MuxerCore {
    /// Resolve `container_name` and open `output_path` for writing
    ///
    /// Fails synchronously on an unknown format or an unopenable path,
    /// leaving nothing behind; no worker is spawned yet.
    pub fn open(
        container_name: &str,
        output_path: impl AsRef<std::path::Path>,
    ) -> MuxerResult<Self> {
        Ok(Self::new(crate::open_container(container_name, output_path)?))
    }

    /// Wrap an opened container writer; no worker is spawned yet
    pub fn new(writer: Box<dyn ContainerWriter + Send>) -> Self {
        Self {
            writer: Some(writer),
            codec_time_bases: Vec::new(),
            encoders: Vec::new(),
            state: None,
            worker: None,
        }
    }

    /// Create a container stream; returns its index. Only before `start`.
    pub fn create_stream(&mut self, params: &StreamParams) -> MuxerResult<usize> {
        assert!(!self.is_started(), "create_stream after start");
        let writer = self.writer.as_mut().expect("writer present before start");
        let index = writer.add_stream(params)?;
        self.codec_time_bases.push(params.codec_time_base);
        self.encoders.push(None);
        Ok(index)
    }

    /// Bind the encoder feeding `stream_index`; used for shutdown signalling
    pub fn register_encoder(&mut self, stream_index: usize, encoder: Box<dyn Encoder>) {
        assert!(!self.is_started(), "register_encoder after start");
        assert!(stream_index < self.encoders.len(), "unknown stream");
        assert!(
            self.encoders[stream_index].is_none(),
            "stream already has an encoder"
        );
        self.encoders[stream_index] = Some(encoder);
    }

    /// Write the container header and spawn the worker
    pub fn start(&mut self) -> MuxerResult<()> {
        assert!(!self.is_started(), "start called twice");
        assert!(
            self.encoders.iter().all(Option::is_some),
            "every stream needs a registered encoder before start"
        );

        let mut writer = self.writer.take().expect("writer present before start");
        writer.write_header()?;

        let stream_count = writer.stream_count();
        let state = Arc::new(WorkerState {
            writer: Mutex::new(writer),
            streams: (0..stream_count).map(|_| StreamQueue::new()).collect(),
            codec_time_bases: self.codec_time_bases.clone(),
            stats: Mutex::new(SharedStats::default()),
            error_occurred: AtomicBool::new(false),
            is_done: AtomicBool::new(false),
        });

        let worker_state = state.clone();
        let worker = std::thread::Builder::new()
            .name("vidtap-muxer".to_string())
            .spawn(move || {
                info!("Muxer thread started");
                match worker_loop(&worker_state) {
                    Ok(()) => {
                        worker_state.is_done.store(true, Ordering::Release);
                        info!("Muxer thread stopped");
                    }
                    Err(e) => {
                        worker_state.error_occurred.store(true, Ordering::Release);
                        error!("Error in muxer thread: {}", e);
                    }
                }
            })?;

        self.state = Some(state);
        self.worker = Some(worker);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.state.is_some()
    }

    /// Whether the worker drained every stream and exited cleanly
    pub fn is_done(&self) -> bool {
        self.state
            .as_ref()
            .map(|s| s.is_done.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Whether the worker hit an irrecoverable write error
    pub fn error_occurred(&self) -> bool {
        self.state
            .as_ref()
            .map(|s| s.error_occurred.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Enqueue one packet for `stream_index`. Only after `start`.
    pub fn add_packet(&self, stream_index: usize, packet: PacketEnvelope) {
        let state = self.state.as_ref().expect("add_packet before start");
        state.streams[stream_index].push(packet);
    }

    /// Mark that no further packet will arrive for `stream_index`
    pub fn end_stream(&self, stream_index: usize) {
        let state = self.state.as_ref().expect("end_stream before start");
        state.streams[stream_index].finish();
    }

    /// Packets currently queued for `stream_index`
    pub fn queued_packet_count(&self, stream_index: usize) -> usize {
        let state = self.state.as_ref().expect("queue query before start");
        state.streams[stream_index].len()
    }

    /// Ask every encoder to drain; the worker exits once all streams end
    pub fn finish(&self) {
        assert!(self.is_started(), "finish before start");
        info!("Finishing encoders ...");
        for encoder in self.encoders.iter().flatten() {
            encoder.finish();
        }
    }

    /// Total bytes produced so far, buffered output included
    pub fn total_bytes(&self) -> u64 {
        self.state
            .as_ref()
            .map(|s| s.stats.lock().unwrap().total_bytes)
            .unwrap_or(0)
    }

    /// Output bit rate measured over roughly the last second of stream time
    pub fn actual_bit_rate(&self) -> f64 {
        self.state
            .as_ref()
            .map(|s| s.stats.lock().unwrap().bit_rate)
            .unwrap_or(0.0)
    }
}

impl Drop for MuxerCore {
    fn drop(&mut self) {
        if self.is_started() {
            // Cancellation requests; each encoder eventually ends its stream
            // and the worker runs out of work. Nothing is locked here, so the
            // encoders are free to call back in.
            info!("Stopping encoders ...");
            for encoder in self.encoders.iter().flatten() {
                encoder.stop();
            }

            if let Some(worker) = self.worker.take() {
                info!("Waiting for muxer thread to stop ...");
                if worker.join().is_err() {
                    error!("Muxer thread panicked");
                }
            }
        }

        // The trailer belongs to any file whose header went out, even after
        // a write error; a trailer failure at this point is only logged.
        if let Some(state) = self.state.take() {
            let mut writer = state.writer.lock().unwrap();
            if let Err(e) = writer.write_trailer() {
                warn!("Can't write trailer, continuing anyway: {}", e);
            }
        }
    }
}

fn worker_loop(state: &WorkerState) -> MuxerResult<()> {
    loop {
        // Scan: the candidate with the lowest accumulated presentation time.
        // One stream lock at a time, never two.
        let mut oldest_stream = None;
        let mut oldest_pts = f64::MAX;
        {
            let writer = state.writer.lock().unwrap();
            for (index, queue) in state.streams.iter().enumerate() {
                if queue.has_work() {
                    let pts =
                        writer.stream_pts(index) as f64 * writer.stream_time_base(index).as_f64();
                    if pts < oldest_pts {
                        oldest_pts = pts;
                        oldest_stream = Some(index);
                    }
                }
            }
        }

        // No stream has packets left or pending: a clean exit
        let Some(index) = oldest_stream else {
            return Ok(());
        };

        // The producer may not have caught up with its own stream yet
        let Some(mut packet) = state.streams[index].pop() else {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        };

        let mut writer = state.writer.lock().unwrap();
        let stream_tb = writer.stream_time_base(index);
        let codec_tb = state.codec_time_bases[index];
        if let Some(pts) = packet.pts {
            packet.pts = Some(rescale(pts, codec_tb, stream_tb));
        }
        if let Some(dts) = packet.dts {
            packet.dts = Some(rescale(dts, codec_tb, stream_tb));
        }
        packet.duration = rescale(packet.duration, codec_tb, stream_tb);
        packet.stream_index = index;
        writer.write_packet(packet)?;
        let total_bytes = writer.bytes_written();
        drop(writer);

        let mut stats = state.stats.lock().unwrap();
        stats.total_bytes = total_bytes;
        if stats.previous_pts.is_none() {
            stats.previous_pts = Some(oldest_pts);
            stats.previous_bytes = total_bytes;
        }
        let timedelta = oldest_pts - stats.previous_pts.unwrap();
        if timedelta > 0.999999 {
            stats.bit_rate = (total_bytes - stats.previous_bytes) as f64 * 8.0 / timedelta;
            stats.previous_pts = Some(oldest_pts);
            stats.previous_bytes = total_bytes;
        }
    }
}
