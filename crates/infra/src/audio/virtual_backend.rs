//! Virtual (software) audio backend.
//!
//! Implements the polling half of the capability interface without any
//! platform API: each output device is a software sink with
//! start/stop/poll/acquire/release primitives, a hardware-ready event, and
//! a scriptable failure model. Used headless (no audio hardware) and by the
//! lifecycle integration tests.
//!
//! Capture is deliberately not implemented on this backend; the probe
//! reports the input direction as unavailable.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use aubade_core::domain::audio::{
    AudioError, ChannelLayout, Formats, Result, SampleFormat,
};
use aubade_core::domain::backend::{
    AudioBackend, ErrorCallback, OpenDesc, OpenedInput, OpenedOutput, PollDevice,
    RawInputCallback, RawOutputCallback, StreamEvents,
};
use aubade_core::domain::device::{AvailableConfigs, BufferSizeRange, Direction};

use super::ring_buffer::FrameRing;

/// Period used when the caller lets the device choose its buffer size.
const DEFAULT_PERIOD_FRAMES: u32 = 512;

/// Captured-audio cap per stream so long tests cannot grow without bound.
const CAPTURE_LIMIT_BYTES: usize = 1 << 20;

/// How a virtual device signals hardware readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    /// Always ready: the stream free-runs as fast as the callback allows.
    /// This is what the deterministic tests want.
    #[default]
    Immediate,
    /// A ticker thread drains one period per period duration, like a real
    /// device clock.
    Realtime,
}

/// Capability description of one virtual output direction.
#[derive(Debug, Clone)]
pub struct VirtualDirectionSpec {
    pub channel_count: u16,
    pub sample_rates: Vec<u32>,
    pub buffer_size: Option<(u32, u32)>,
    pub formats: Vec<SampleFormat>,
    pub layout: ChannelLayout,
    /// Simulate a device whose capability query returns garbage: probing
    /// reports the direction as unavailable instead of failing enumeration.
    pub broken_probe: bool,
    /// Simulate hardware that rejects the negotiated parameters at bind
    /// time.
    pub reject_open: bool,
}

impl Default for VirtualDirectionSpec {
    fn default() -> Self {
        Self {
            channel_count: 2,
            sample_rates: vec![44100, 48000, 96000],
            buffer_size: Some((64, 4096)),
            formats: vec![SampleFormat::F32, SampleFormat::I16],
            layout: ChannelLayout::Interleaved,
            broken_probe: false,
            reject_open: false,
        }
    }
}

/// One scriptable virtual device.
#[derive(Debug, Clone, Default)]
pub struct VirtualDeviceSpec {
    pub name: String,
    pub output: Option<VirtualDirectionSpec>,
    pub default_output: bool,
    pub pacing: Pacing,
}

impl VirtualDeviceSpec {
    /// A plain stereo output device with the default capability set.
    pub fn output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: Some(VirtualDirectionSpec::default()),
            ..Default::default()
        }
    }
}

/// Observability handle for one opened virtual stream: what the "hardware"
/// saw, plus the failure-injection switch.
pub struct StreamProbe {
    started: AtomicBool,
    start_count: AtomicU32,
    stop_count: AtomicU32,
    rendered_frames: AtomicU64,
    inject_failures: AtomicU32,
    captured: Mutex<Vec<u8>>,
}

impl StreamProbe {
    fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            start_count: AtomicU32::new(0),
            stop_count: AtomicU32::new(0),
            rendered_frames: AtomicU64::new(0),
            inject_failures: AtomicU32::new(0),
            captured: Mutex::new(Vec::new()),
        }
    }

    /// Whether the simulated hardware is currently running.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> u32 {
        self.start_count.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> u32 {
        self.stop_count.load(Ordering::SeqCst)
    }

    pub fn rendered_frames(&self) -> u64 {
        self.rendered_frames.load(Ordering::SeqCst)
    }

    /// Raw bytes the stream rendered, in release order (bounded).
    pub fn captured_bytes(&self) -> Vec<u8> {
        self.captured.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Make the next `count` hardware polls fail.
    pub fn inject_failures(&self, count: u32) {
        self.inject_failures.store(count, Ordering::SeqCst);
    }

    /// Injected failures not yet consumed by the stream.
    pub fn pending_failures(&self) -> u32 {
        self.inject_failures.load(Ordering::SeqCst)
    }

    fn record_release(&self, bytes: &[u8], frames: u32) {
        self.rendered_frames
            .fetch_add(u64::from(frames), Ordering::SeqCst);
        let mut captured = self.captured.lock().unwrap_or_else(|e| e.into_inner());
        if captured.len() < CAPTURE_LIMIT_BYTES {
            captured.extend_from_slice(bytes);
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.inject_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Virtual device identity: position in the configured spec list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualDeviceId(usize);

/// Software backend over a configured list of [`VirtualDeviceSpec`]s.
pub struct VirtualBackend {
    specs: Vec<VirtualDeviceSpec>,
    probes: Mutex<Vec<Arc<StreamProbe>>>,
}

impl VirtualBackend {
    pub fn new(specs: Vec<VirtualDeviceSpec>) -> Self {
        Self {
            specs,
            probes: Mutex::new(Vec::new()),
        }
    }

    /// A host-shaped default setup: one default output device plus one
    /// secondary output device.
    pub fn with_default_devices() -> Self {
        let mut main = VirtualDeviceSpec::output("Virtual Output");
        main.default_output = true;
        let secondary = VirtualDeviceSpec::output("Virtual Output 2");
        Self::new(vec![main, secondary])
    }

    /// Probes for every stream opened so far, in open order.
    pub fn stream_probes(&self) -> Vec<Arc<StreamProbe>> {
        self.probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last_stream_probe(&self) -> Option<Arc<StreamProbe>> {
        self.probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }

    fn spec(&self, id: &VirtualDeviceId) -> Result<&VirtualDeviceSpec> {
        self.specs
            .get(id.0)
            .ok_or_else(|| AudioError::DeviceNotFound(format!("virtual device #{}", id.0)))
    }
}

impl AudioBackend for VirtualBackend {
    type DeviceId = VirtualDeviceId;

    fn name(&self) -> &'static str {
        "virtual"
    }

    fn device_ids(&self) -> Result<Vec<VirtualDeviceId>> {
        Ok((0..self.specs.len()).map(VirtualDeviceId).collect())
    }

    fn default_device_id(&self, direction: Direction) -> Option<VirtualDeviceId> {
        match direction {
            Direction::Output => self
                .specs
                .iter()
                .position(|spec| spec.default_output)
                .map(VirtualDeviceId),
            Direction::Input => None,
        }
    }

    fn device_name(&self, id: &VirtualDeviceId) -> Result<String> {
        Ok(self.spec(id)?.name.clone())
    }

    fn probe(&self, id: &VirtualDeviceId, direction: Direction) -> Option<AvailableConfigs> {
        let spec = self.spec(id).ok()?;
        let direction_spec = match direction {
            Direction::Output => spec.output.as_ref()?,
            Direction::Input => return None,
        };
        if direction_spec.broken_probe {
            warn!(
                "virtual device {:?}: capability query returned unusable data, \
                 treating direction as unavailable",
                spec.name
            );
            return None;
        }
        AvailableConfigs::new(
            direction_spec.channel_count,
            direction_spec.sample_rates.clone(),
            direction_spec
                .buffer_size
                .and_then(|(min, max)| BufferSizeRange::new(min, max)),
            direction_spec.formats.iter().copied().collect::<Formats>(),
            direction_spec.layout,
        )
    }

    fn open_output(
        &self,
        id: &VirtualDeviceId,
        desc: &OpenDesc,
        data: RawOutputCallback,
        error: ErrorCallback,
    ) -> Result<OpenedOutput> {
        let spec = self.spec(id)?;
        let direction_spec = spec.output.as_ref().ok_or_else(|| {
            AudioError::DeviceNotFound(format!("{}: no output direction", spec.name))
        })?;
        if direction_spec.reject_open {
            return Err(AudioError::UnsupportedConfig(format!(
                "{}: hardware rejected {:?} @ {} Hz",
                spec.name, desc.format, desc.sample_rate
            )));
        }

        let probe = Arc::new(StreamProbe::new());
        self.probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&probe));

        debug!(
            "virtual device {:?}: bound output stream {:?} @ {} Hz",
            spec.name, desc.format, desc.sample_rate
        );
        let device = VirtualPollDevice::new(desc, spec.pacing, probe);
        Ok(OpenedOutput::Polling {
            device: Box::new(device),
            data,
            error,
        })
    }

    fn open_input(
        &self,
        _id: &VirtualDeviceId,
        _desc: &OpenDesc,
        _data: RawInputCallback,
        _error: ErrorCallback,
    ) -> Result<OpenedInput> {
        Err(AudioError::UnsupportedConfig(
            "virtual backend does not implement capture".into(),
        ))
    }
}

struct TickerHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// The polling primitive set for one virtual output stream. Exclusively
/// owned by the stream's audio thread after open.
struct VirtualPollDevice {
    period_frames: u32,
    frame_bytes: usize,
    sample_rate: u32,
    pacing: Pacing,
    events: Arc<StreamEvents>,
    probe: Arc<StreamProbe>,
    ring: Arc<FrameRing>,
    // u64 backing keeps acquired buffers aligned for any sample type.
    staging: Vec<u64>,
    staging_bytes: usize,
    ticker: Option<TickerHandle>,
}

impl VirtualPollDevice {
    fn new(desc: &OpenDesc, pacing: Pacing, probe: Arc<StreamProbe>) -> Self {
        let period_frames = desc.buffer_size.unwrap_or(DEFAULT_PERIOD_FRAMES);
        let frame_bytes = desc.channel_count as usize * desc.format.byte_size();
        let staging_bytes = period_frames as usize * frame_bytes;
        Self {
            period_frames,
            frame_bytes,
            sample_rate: desc.sample_rate,
            pacing,
            events: Arc::new(StreamEvents::new()),
            probe,
            ring: Arc::new(FrameRing::new(period_frames as usize * 4, frame_bytes)),
            staging: vec![0u64; staging_bytes.div_ceil(8)],
            staging_bytes,
            ticker: None,
        }
    }

    fn staging_bytes(&self) -> &[u8] {
        // SAFETY: the u64 backing is at least `staging_bytes` long.
        unsafe {
            std::slice::from_raw_parts(self.staging.as_ptr().cast::<u8>(), self.staging_bytes)
        }
    }

    fn staging_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.staging_bytes;
        // SAFETY: as above; exclusive through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.staging.as_mut_ptr().cast::<u8>(), len) }
    }

    fn spawn_ticker(&mut self) -> Result<()> {
        if self.ticker.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let period = Duration::from_nanos(
            (u64::from(self.period_frames) * 1_000_000_000) / u64::from(self.sample_rate.max(1)),
        );
        let ring = Arc::clone(&self.ring);
        let events = Arc::clone(&self.events);
        let ticker_stop = Arc::clone(&stop);
        let period_frames = self.period_frames as usize;
        let thread = thread::Builder::new()
            .name("aubade-virtual-clock".into())
            .spawn(move || {
                while !ticker_stop.load(Ordering::SeqCst) {
                    thread::sleep(period);
                    ring.discard_frames(period_frames);
                    events.signal(StreamEvents::READY);
                }
            })
            .map_err(|e| AudioError::OsError(format!("failed to spawn device clock: {e}")))?;
        self.ticker = Some(TickerHandle { stop, thread });
        Ok(())
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop.store(true, Ordering::SeqCst);
            let _ = ticker.thread.join();
        }
    }
}

impl PollDevice for VirtualPollDevice {
    fn start(&mut self) -> Result<()> {
        self.probe.started.store(true, Ordering::SeqCst);
        self.probe.start_count.fetch_add(1, Ordering::SeqCst);
        match self.pacing {
            Pacing::Immediate => self.events.signal(StreamEvents::READY),
            Pacing::Realtime => self.spawn_ticker()?,
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.probe.started.store(false, Ordering::SeqCst);
        self.probe.stop_count.fetch_add(1, Ordering::SeqCst);
        self.stop_ticker();
        Ok(())
    }

    fn available_frames(&mut self) -> Result<u32> {
        if self.probe.take_injected_failure() {
            // Real hardware stays ready after a failed service call; keep
            // the loop live so it can retry or hit the error limit.
            self.events.signal(StreamEvents::READY);
            return Err(AudioError::OsError("injected hardware fault".into()));
        }
        match self.pacing {
            Pacing::Immediate => {
                self.events.signal(StreamEvents::READY);
                Ok(self.period_frames)
            }
            Pacing::Realtime => {
                Ok((self.ring.free_frames() as u32).min(self.period_frames))
            }
        }
    }

    fn acquire_buffer(&mut self, frames: u32) -> Result<&mut [u8]> {
        if frames > self.period_frames {
            return Err(AudioError::OsError(format!(
                "acquire of {frames} frames exceeds the {}-frame period",
                self.period_frames
            )));
        }
        let bytes = frames as usize * self.frame_bytes;
        Ok(&mut self.staging_bytes_mut()[..bytes])
    }

    fn release_buffer(&mut self, frames: u32) -> Result<()> {
        let bytes = frames as usize * self.frame_bytes;
        let staged = &self.staging_bytes()[..bytes];
        self.probe.record_release(staged, frames);
        match self.pacing {
            Pacing::Immediate => self.events.signal(StreamEvents::READY),
            Pacing::Realtime => {
                self.ring.push_frames(staged);
            }
        }
        Ok(())
    }

    fn events(&self) -> Arc<StreamEvents> {
        Arc::clone(&self.events)
    }
}

impl Drop for VirtualPollDevice {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}
