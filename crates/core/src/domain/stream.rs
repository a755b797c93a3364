//! Stream lifecycle and the realtime concurrency core.
//!
//! A [`Stream`] is one open audio session bound to one device and one
//! direction. Behind the facade sit two concurrency models:
//!
//! - **Direct**: the native subsystem owns the realtime thread; play/pause
//!   map to hardware start/stop with immediate effect.
//! - **Polling**: this module owns exactly one realtime thread per stream.
//!   Control calls never touch the hardware; they flip bits in a shared
//!   atomic flag word and signal the command event, and the audio thread
//!   applies every hardware transition itself.
//!
//! Closing a polling stream follows a strict order: set the close bit, wake
//! the thread, join it, and only then release the shared primitives.
//! Releasing earlier would hand the audio thread freed state; skipping the
//! wake could leave it waiting forever.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::audio::{AudioError, ChannelLayout, Result, Sample, SampleFormat};
use super::backend::{
    AudioBackend, DirectStream, ErrorCallback, OpenDesc, OpenedInput, OpenedOutput, PollDevice,
    RawInputCallback, RawOutputCallback, StreamEvents,
};
use super::device::{AvailableConfigs, Device};

/// Caller-supplied concrete parameters for opening a stream. Every field
/// must be a value the target device actually reported as supported; the
/// preference resolver exists to guarantee that before construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub format: SampleFormat,
    pub sample_rate: u32,
    /// Requested period in frames; `None` lets the device choose.
    pub buffer_size: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            format: SampleFormat::F32,
            sample_rate: 48000,
            buffer_size: Some(512),
        }
    }
}

/// Per-invocation metadata handed to data callbacks.
#[derive(Debug, Clone)]
pub struct CallbackInfo {
    timestamp: Duration,
    sample_rate: u32,
    channel_count: u16,
}

impl CallbackInfo {
    pub fn new(timestamp: Duration, sample_rate: u32, channel_count: u16) -> Self {
        Self {
            timestamp,
            sample_rate,
            channel_count,
        }
    }

    /// Stream-relative timestamp, normalized from the hardware timebase.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn timestamp_nanos(&self) -> u64 {
        self.timestamp.as_nanos() as u64
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }
}

/// Writable view of one callback's worth of output samples, shaped by the
/// device's channel layout. Pure reinterpretation of the hardware buffer;
/// no copying.
pub struct SampleBuffer<'a, T: Sample> {
    data: &'a mut [T],
    layout: ChannelLayout,
    channel_count: u16,
    frame_count: u32,
}

impl<'a, T: Sample> SampleBuffer<'a, T> {
    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// The raw sample storage: `frame_count * channel_count` samples,
    /// frame-major when interleaved, channel-major otherwise.
    pub fn samples_mut(&mut self) -> &mut [T] {
        self.data
    }

    /// One channel's contiguous samples. Only meaningful for the
    /// non-interleaved layout; returns `None` otherwise (interleaved
    /// channels are strided through [`SampleBuffer::samples_mut`]).
    pub fn channel_mut(&mut self, channel: u16) -> Option<&mut [T]> {
        if self.layout != ChannelLayout::NonInterleaved || channel >= self.channel_count {
            return None;
        }
        let frames = self.frame_count as usize;
        let start = channel as usize * frames;
        Some(&mut self.data[start..start + frames])
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    pub fn silence(&mut self) {
        self.fill(T::EQUILIBRIUM);
    }
}

/// Read-only twin of [`SampleBuffer`] for capture callbacks.
pub struct SampleBufferRef<'a, T: Sample> {
    data: &'a [T],
    layout: ChannelLayout,
    channel_count: u16,
    frame_count: u32,
}

impl<'a, T: Sample> SampleBufferRef<'a, T> {
    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn samples(&self) -> &[T] {
        self.data
    }

    pub fn channel(&self, channel: u16) -> Option<&[T]> {
        if self.layout != ChannelLayout::NonInterleaved || channel >= self.channel_count {
            return None;
        }
        let frames = self.frame_count as usize;
        let start = channel as usize * frames;
        Some(&self.data[start..start + frames])
    }
}

/// Shape a raw output buffer for a data callback: interleaved layouts get
/// one contiguous `frame_count * channel_count` sequence, non-interleaved
/// layouts `channel_count` channel-major sequences of `frame_count` samples.
pub fn output_callback_data<T: Sample>(
    data: &mut [T],
    layout: ChannelLayout,
    channel_count: u16,
    frame_count: u32,
) -> SampleBuffer<'_, T> {
    debug_assert_eq!(data.len(), channel_count as usize * frame_count as usize);
    SampleBuffer {
        data,
        layout,
        channel_count,
        frame_count,
    }
}

/// Input twin of [`output_callback_data`].
pub fn input_callback_data<T: Sample>(
    data: &[T],
    layout: ChannelLayout,
    channel_count: u16,
    frame_count: u32,
) -> SampleBufferRef<'_, T> {
    debug_assert_eq!(data.len(), channel_count as usize * frame_count as usize);
    SampleBufferRef {
        data,
        layout,
        channel_count,
        frame_count,
    }
}

/// Output data callback bound: invoked on the audio thread, one invocation
/// at a time per stream.
pub trait OutputDataFn<T: Sample>:
    FnMut(SampleBuffer<'_, T>, &CallbackInfo) + Send + 'static
{
}
impl<T: Sample, F> OutputDataFn<T> for F where
    F: FnMut(SampleBuffer<'_, T>, &CallbackInfo) + Send + 'static
{
}

/// Input data callback bound.
pub trait InputDataFn<T: Sample>:
    FnMut(SampleBufferRef<'_, T>, &CallbackInfo) + Send + 'static
{
}
impl<T: Sample, F> InputDataFn<T> for F where
    F: FnMut(SampleBufferRef<'_, T>, &CallbackInfo) + Send + 'static
{
}

// Shared flag word bits. A single atomically-updated word, composed with
// bit set/clear, so the realtime thread never takes a lock.
const FLAG_PLAY: u32 = 1 << 0;
const FLAG_CLOSE: u32 = 1 << 1;

/// The audio thread gives up after this many consecutive failed iterations;
/// a fully successful iteration resets the count.
const CONSECUTIVE_ERROR_LIMIT: u32 = 8;

/// An open audio stream. Created by [`super::device::Host::open_output`] /
/// [`super::device::Host::open_input`]; starts paused.
///
/// Dropping the stream performs the same teardown as [`Stream::close`], so
/// a stream can never outlive its audio thread or native registration.
pub struct Stream {
    inner: StreamInner,
}

enum StreamInner {
    Direct {
        stream: Box<dyn DirectStream>,
        playing: AtomicBool,
    },
    Polling(PollingStream),
}

struct PollingStream {
    flags: Arc<AtomicU32>,
    events: Arc<StreamEvents>,
    thread: Option<JoinHandle<()>>,
}

impl Stream {
    fn direct(stream: Box<dyn DirectStream>) -> Self {
        Self {
            inner: StreamInner::Direct {
                stream,
                playing: AtomicBool::new(false),
            },
        }
    }

    /// Start (or resume) playback. Non-blocking for polling streams: the
    /// transition is applied by the audio thread.
    pub fn play(&self) -> Result<()> {
        match &self.inner {
            StreamInner::Direct { stream, playing } => {
                stream.start()?;
                playing.store(true, Ordering::SeqCst);
                Ok(())
            }
            StreamInner::Polling(polling) => {
                polling.flags.fetch_or(FLAG_PLAY, Ordering::SeqCst);
                polling.events.signal(StreamEvents::COMMAND);
                Ok(())
            }
        }
    }

    /// Pause playback; [`Stream::play`] resumes it.
    pub fn pause(&self) -> Result<()> {
        match &self.inner {
            StreamInner::Direct { stream, playing } => {
                stream.stop()?;
                playing.store(false, Ordering::SeqCst);
                Ok(())
            }
            StreamInner::Polling(polling) => {
                polling.flags.fetch_and(!FLAG_PLAY, Ordering::SeqCst);
                polling.events.signal(StreamEvents::COMMAND);
                Ok(())
            }
        }
    }

    /// Whether playback is currently requested.
    pub fn is_playing(&self) -> bool {
        match &self.inner {
            StreamInner::Direct { playing, .. } => playing.load(Ordering::SeqCst),
            StreamInner::Polling(polling) => {
                polling.flags.load(Ordering::SeqCst) & FLAG_PLAY != 0
            }
        }
    }

    /// Tear the stream down. Consumes the stream, so closing twice is
    /// unrepresentable; dropping an unclosed stream performs the same
    /// teardown.
    ///
    /// For polling streams this blocks until the audio thread has stopped
    /// the hardware and exited; when it returns, nothing is running on the
    /// stream's behalf anymore.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        match &mut self.inner {
            StreamInner::Direct { stream, playing } => {
                if playing.swap(false, Ordering::SeqCst) {
                    stream.stop()?;
                }
                Ok(())
            }
            StreamInner::Polling(polling) => {
                if let Some(handle) = polling.thread.take() {
                    // Order matters: close bit, then wake, then join. The
                    // shared flag word and events outlive the join because
                    // the thread holds its own Arc clones.
                    polling.flags.fetch_or(FLAG_CLOSE, Ordering::SeqCst);
                    polling.events.signal(StreamEvents::COMMAND);
                    if handle.join().is_err() {
                        warn!("audio thread panicked during shutdown");
                    }
                }
                Ok(())
            }
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

pub(crate) fn open_output<B, T, D, E>(
    backend: &B,
    device: &Device<B::DeviceId>,
    config: &StreamConfig,
    data: D,
    error: E,
) -> Result<Stream>
where
    B: AudioBackend,
    T: Sample,
    D: OutputDataFn<T>,
    E: FnMut(AudioError) + Send + 'static,
{
    let configs = device.output_configs().ok_or_else(|| {
        AudioError::DeviceNotFound(format!("{}: device has no output direction", device.name()))
    })?;
    let desc = validate::<T>(config, configs)?;
    info!(
        "opening output stream on {:?}: {:?} @ {} Hz",
        device.name(),
        desc.format,
        desc.sample_rate
    );

    let raw = wrap_output_callback::<T>(Box::new(data), desc.layout, desc.channel_count);
    match backend.open_output(device.backend_id(), &desc, raw, Box::new(error))? {
        OpenedOutput::Direct(stream) => Ok(Stream::direct(stream)),
        OpenedOutput::Polling {
            device,
            data,
            error,
        } => spawn_poll_stream(device, PollCallback::Output(data), error, desc),
    }
}

pub(crate) fn open_input<B, T, D, E>(
    backend: &B,
    device: &Device<B::DeviceId>,
    config: &StreamConfig,
    data: D,
    error: E,
) -> Result<Stream>
where
    B: AudioBackend,
    T: Sample,
    D: InputDataFn<T>,
    E: FnMut(AudioError) + Send + 'static,
{
    let configs = device.input_configs().ok_or_else(|| {
        AudioError::DeviceNotFound(format!("{}: device has no input direction", device.name()))
    })?;
    let desc = validate::<T>(config, configs)?;
    info!(
        "opening input stream on {:?}: {:?} @ {} Hz",
        device.name(),
        desc.format,
        desc.sample_rate
    );

    let raw = wrap_input_callback::<T>(Box::new(data), desc.layout, desc.channel_count);
    match backend.open_input(device.backend_id(), &desc, raw, Box::new(error))? {
        OpenedInput::Direct(stream) => Ok(Stream::direct(stream)),
        OpenedInput::Polling {
            device,
            data,
            error,
        } => spawn_poll_stream(device, PollCallback::Input(data), error, desc),
    }
}

/// Check a caller configuration against the device's recorded capability
/// set. Everything the resolver produces passes by construction.
fn validate<T: Sample>(config: &StreamConfig, configs: &AvailableConfigs) -> Result<OpenDesc> {
    if T::FORMAT != config.format {
        return Err(AudioError::UnsupportedConfig(format!(
            "callback sample type is {:?} but the configured format is {:?}",
            T::FORMAT,
            config.format
        )));
    }
    if !configs.supports_format(config.format) {
        return Err(AudioError::UnsupportedConfig(format!(
            "device does not support format {:?}",
            config.format
        )));
    }
    if !configs.supports_sample_rate(config.sample_rate) {
        return Err(AudioError::UnsupportedConfig(format!(
            "device does not support sample rate {} Hz",
            config.sample_rate
        )));
    }
    if let Some(frames) = config.buffer_size {
        if !configs.supports_buffer_size(frames) {
            return Err(AudioError::UnsupportedConfig(format!(
                "device does not support a buffer size of {frames} frames"
            )));
        }
    }
    Ok(OpenDesc {
        format: config.format,
        sample_rate: config.sample_rate,
        buffer_size: config.buffer_size,
        channel_count: configs.channel_count(),
        layout: configs.layout(),
    })
}

fn wrap_output_callback<T: Sample>(
    mut data: Box<dyn FnMut(SampleBuffer<'_, T>, &CallbackInfo) + Send>,
    layout: ChannelLayout,
    channel_count: u16,
) -> RawOutputCallback {
    Box::new(move |bytes, frames, info| {
        let sample_count = bytes.len() / std::mem::size_of::<T>();
        debug_assert_eq!(sample_count, channel_count as usize * frames as usize);
        debug_assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<T>(), 0);
        // SAFETY: the capability contract guarantees the buffer holds
        // `frames * channel_count` samples of the negotiated format (which
        // `validate` matched against T) and is aligned to the sample size.
        let samples =
            unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<T>(), sample_count) };
        data(
            output_callback_data(samples, layout, channel_count, frames),
            info,
        );
    })
}

fn wrap_input_callback<T: Sample>(
    mut data: Box<dyn FnMut(SampleBufferRef<'_, T>, &CallbackInfo) + Send>,
    layout: ChannelLayout,
    channel_count: u16,
) -> RawInputCallback {
    Box::new(move |bytes, frames, info| {
        let sample_count = bytes.len() / std::mem::size_of::<T>();
        debug_assert_eq!(sample_count, channel_count as usize * frames as usize);
        debug_assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<T>(), 0);
        // SAFETY: as in `wrap_output_callback`, shared access only.
        let samples =
            unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<T>(), sample_count) };
        data(
            input_callback_data(samples, layout, channel_count, frames),
            info,
        );
    })
}

enum PollCallback {
    Output(RawOutputCallback),
    Input(RawInputCallback),
}

fn spawn_poll_stream(
    device: Box<dyn PollDevice>,
    data: PollCallback,
    error: ErrorCallback,
    desc: OpenDesc,
) -> Result<Stream> {
    let flags = Arc::new(AtomicU32::new(0));
    let events = device.events();

    let thread_flags = Arc::clone(&flags);
    let thread_events = Arc::clone(&events);
    let thread = thread::Builder::new()
        .name("aubade-audio".into())
        .spawn(move || run_poll_loop(device, thread_flags, thread_events, data, error, desc))
        .map_err(|e| AudioError::OsError(format!("failed to spawn audio thread: {e}")))?;

    Ok(Stream {
        inner: StreamInner::Polling(PollingStream {
            flags,
            events,
            thread: Some(thread),
        }),
    })
}

/// The polling-model audio thread. Owns the device exclusively; the only
/// state shared with the caller is the flag word and the event pair.
fn run_poll_loop(
    mut device: Box<dyn PollDevice>,
    flags: Arc<AtomicU32>,
    events: Arc<StreamEvents>,
    mut data: PollCallback,
    mut error: ErrorCallback,
    desc: OpenDesc,
) {
    if let Err(e) = audio_thread_priority::promote_current_thread_to_real_time(
        desc.buffer_size.unwrap_or(0),
        desc.sample_rate,
    ) {
        warn!("failed to promote audio thread to realtime priority: {e}");
    }

    let mut hw_playing = false;
    let mut consecutive_errors = 0u32;
    let mut frames_elapsed = 0u64;

    loop {
        let state = flags.load(Ordering::SeqCst);
        if state & FLAG_CLOSE != 0 {
            debug!("audio thread observed close request");
            break;
        }

        match run_iteration(
            device.as_mut(),
            state,
            &mut hw_playing,
            &mut data,
            &mut frames_elapsed,
            &desc,
        ) {
            Ok(()) => consecutive_errors = 0,
            Err(e) => {
                error(e);
                consecutive_errors += 1;
                if consecutive_errors >= CONSECUTIVE_ERROR_LIMIT {
                    warn!("audio thread terminating after {consecutive_errors} consecutive errors");
                    break;
                }
            }
        }

        // Block until either a control change or hardware readiness; close
        // always signals COMMAND, so this wait never strands the thread.
        events.wait_any();
    }

    if hw_playing {
        let _ = device.stop();
    }
}

/// One loop iteration: apply at most one hardware transition, then service
/// the hardware buffer if playing. Any error aborts the iteration.
fn run_iteration(
    device: &mut dyn PollDevice,
    state: u32,
    hw_playing: &mut bool,
    data: &mut PollCallback,
    frames_elapsed: &mut u64,
    desc: &OpenDesc,
) -> Result<()> {
    let want_playing = state & FLAG_PLAY != 0;
    if want_playing != *hw_playing {
        if want_playing {
            device.start()?;
        } else {
            device.stop()?;
        }
        *hw_playing = want_playing;
    }

    if !*hw_playing {
        return Ok(());
    }

    let frames = device.available_frames()?;
    if frames == 0 {
        return Ok(());
    }

    let info = CallbackInfo::new(
        frames_to_duration(*frames_elapsed, desc.sample_rate),
        desc.sample_rate,
        desc.channel_count,
    );
    let bytes = device.acquire_buffer(frames)?;
    match data {
        PollCallback::Output(f) => f(bytes, frames, &info),
        PollCallback::Input(f) => f(bytes, frames, &info),
    }
    *frames_elapsed += u64::from(frames);
    device.release_buffer(frames)?;
    Ok(())
}

fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = (frames as u128 * 1_000_000_000) / sample_rate as u128;
    Duration::from_nanos(nanos as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::BufferSizeRange;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use std::sync::Mutex;
    use std::time::Instant;

    const PERIOD_FRAMES: u32 = 4;
    const CHANNELS: u16 = 2;

    /// Scriptable stand-in for a polling-model hardware device. Always
    /// reports readiness, so the loop free-runs while playing.
    struct FakePollDevice {
        events: Arc<StreamEvents>,
        started: Arc<AtomicBool>,
        start_count: Arc<StdAtomicU32>,
        stop_count: Arc<StdAtomicU32>,
        fail_available: Arc<StdAtomicU32>,
        rendered: Arc<Mutex<Vec<u8>>>,
        // u64 backing keeps acquire_buffer views aligned for any sample.
        staging: Vec<u64>,
        staging_bytes: usize,
    }

    struct FakeHandles {
        started: Arc<AtomicBool>,
        start_count: Arc<StdAtomicU32>,
        stop_count: Arc<StdAtomicU32>,
        fail_available: Arc<StdAtomicU32>,
        rendered: Arc<Mutex<Vec<u8>>>,
    }

    impl FakePollDevice {
        fn new(sample_size: usize) -> (Box<Self>, FakeHandles) {
            let staging_bytes = PERIOD_FRAMES as usize * CHANNELS as usize * sample_size;
            let device = Box::new(Self {
                events: Arc::new(StreamEvents::new()),
                started: Arc::new(AtomicBool::new(false)),
                start_count: Arc::new(StdAtomicU32::new(0)),
                stop_count: Arc::new(StdAtomicU32::new(0)),
                fail_available: Arc::new(StdAtomicU32::new(0)),
                rendered: Arc::new(Mutex::new(Vec::new())),
                staging: vec![0u64; staging_bytes.div_ceil(8)],
                staging_bytes,
            });
            let handles = FakeHandles {
                started: Arc::clone(&device.started),
                start_count: Arc::clone(&device.start_count),
                stop_count: Arc::clone(&device.stop_count),
                fail_available: Arc::clone(&device.fail_available),
                rendered: Arc::clone(&device.rendered),
            };
            (device, handles)
        }

        fn staging_bytes_mut(&mut self) -> &mut [u8] {
            let len = self.staging_bytes;
            // SAFETY: the u64 backing is at least `len` bytes and outlives
            // the borrow.
            unsafe { std::slice::from_raw_parts_mut(self.staging.as_mut_ptr().cast::<u8>(), len) }
        }
    }

    impl PollDevice for FakePollDevice {
        fn start(&mut self) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            self.start_count.fetch_add(1, Ordering::SeqCst);
            self.events.signal(StreamEvents::READY);
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.started.store(false, Ordering::SeqCst);
            self.stop_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn available_frames(&mut self) -> Result<u32> {
            // Keep the loop spinning either way: real hardware stays ready
            // whether or not one service call failed.
            self.events.signal(StreamEvents::READY);
            let pending = self.fail_available.load(Ordering::SeqCst);
            if pending > 0 {
                self.fail_available.store(pending - 1, Ordering::SeqCst);
                return Err(AudioError::OsError("injected fault".into()));
            }
            Ok(PERIOD_FRAMES)
        }

        fn acquire_buffer(&mut self, frames: u32) -> Result<&mut [u8]> {
            assert_eq!(frames, PERIOD_FRAMES);
            Ok(self.staging_bytes_mut())
        }

        fn release_buffer(&mut self, _frames: u32) -> Result<()> {
            let bytes = self.staging_bytes;
            let mut rendered = self.rendered.lock().unwrap();
            if rendered.len() < 1 << 16 {
                let staged =
                    unsafe { std::slice::from_raw_parts(self.staging.as_ptr().cast::<u8>(), bytes) };
                rendered.extend_from_slice(staged);
            }
            Ok(())
        }

        fn events(&self) -> Arc<StreamEvents> {
            Arc::clone(&self.events)
        }
    }

    fn test_desc() -> OpenDesc {
        OpenDesc {
            format: SampleFormat::F32,
            sample_rate: 48000,
            buffer_size: Some(PERIOD_FRAMES),
            channel_count: CHANNELS,
            layout: ChannelLayout::Interleaved,
        }
    }

    fn wait_until(deadline_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    fn spawn_counter_stream(
        device: Box<FakePollDevice>,
    ) -> (Stream, Arc<StdAtomicU32>) {
        let errors = Arc::new(StdAtomicU32::new(0));
        let errors_cb = Arc::clone(&errors);
        let data = wrap_output_callback::<f32>(
            Box::new(move |mut buffer, _info| {
                let mut n = 0.0f32;
                for sample in buffer.samples_mut() {
                    *sample = n;
                    n += 1.0;
                }
            }),
            ChannelLayout::Interleaved,
            CHANNELS,
        );
        let stream = spawn_poll_stream(
            device,
            PollCallback::Output(data),
            Box::new(move |_e| {
                errors_cb.fetch_add(1, Ordering::SeqCst);
            }),
            test_desc(),
        )
        .unwrap();
        (stream, errors)
    }

    #[test]
    fn test_close_without_play_touches_no_hardware() {
        let (device, handles) = FakePollDevice::new(4);
        let (stream, _errors) = spawn_counter_stream(device);
        stream.close().unwrap();
        assert_eq!(handles.start_count.load(Ordering::SeqCst), 0);
        assert_eq!(handles.stop_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_play_renders_and_close_stops_hardware() {
        let (device, handles) = FakePollDevice::new(4);
        let (stream, errors) = spawn_counter_stream(device);

        stream.play().unwrap();
        assert!(stream.is_playing());
        assert!(wait_until(2000, || !handles.rendered.lock().unwrap().is_empty()));
        assert!(handles.started.load(Ordering::SeqCst));

        // Immediately closing after play must stop the hardware before
        // close returns, with the thread fully joined.
        stream.close().unwrap();
        assert!(!handles.started.load(Ordering::SeqCst));
        assert!(handles.stop_count.load(Ordering::SeqCst) >= 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);

        // Rendered data went through the marshalling path untouched.
        let rendered = handles.rendered.lock().unwrap();
        let first: Vec<f32> = rendered[..16]
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(first, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_pause_and_resume_transition_exactly_once() {
        let (device, handles) = FakePollDevice::new(4);
        let (stream, _errors) = spawn_counter_stream(device);

        stream.play().unwrap();
        assert!(wait_until(2000, || handles.start_count.load(Ordering::SeqCst) == 1));

        stream.pause().unwrap();
        assert!(!stream.is_playing());
        assert!(wait_until(2000, || handles.stop_count.load(Ordering::SeqCst) == 1));
        assert!(!handles.started.load(Ordering::SeqCst));
        // Paused: no further transitions happen however long we look.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(handles.start_count.load(Ordering::SeqCst), 1);

        stream.play().unwrap();
        assert!(wait_until(2000, || handles.start_count.load(Ordering::SeqCst) == 2));

        stream.close().unwrap();
        assert!(!handles.started.load(Ordering::SeqCst));
    }

    #[test]
    fn test_nine_failures_report_eight_errors_then_terminate() {
        let (device, handles) = FakePollDevice::new(4);
        handles.fail_available.store(9, Ordering::SeqCst);
        let (stream, errors) = spawn_counter_stream(device);

        stream.play().unwrap();
        assert!(wait_until(2000, || errors.load(Ordering::SeqCst) == 8));
        // The thread terminated at the limit: the ninth injected failure is
        // never consumed and no ninth report arrives.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(errors.load(Ordering::SeqCst), 8);
        assert_eq!(handles.fail_available.load(Ordering::SeqCst), 1);
        assert!(!handles.started.load(Ordering::SeqCst));
        assert!(handles.rendered.lock().unwrap().is_empty());

        // Closing a stream whose thread already exited still succeeds.
        stream.close().unwrap();
    }

    #[test]
    fn test_transient_failures_reset_the_counter() {
        let (device, handles) = FakePollDevice::new(4);
        handles.fail_available.store(7, Ordering::SeqCst);
        let (stream, errors) = spawn_counter_stream(device);

        stream.play().unwrap();
        // Seven failures, then successful iterations resume and reset.
        assert!(wait_until(2000, || !handles.rendered.lock().unwrap().is_empty()));
        assert_eq!(errors.load(Ordering::SeqCst), 7);
        assert!(handles.started.load(Ordering::SeqCst));
        stream.close().unwrap();
    }

    #[test]
    fn test_input_loop_delivers_captured_bytes() {
        let (mut device, handles) = FakePollDevice::new(2);
        // Pre-fill the "hardware" capture buffer with a recognizable ramp.
        let staged = device.staging_bytes_mut();
        for (i, b) in staged.iter_mut().enumerate() {
            *b = i as u8;
        }

        let captured = Arc::new(Mutex::new(Vec::new()));
        let captured_cb = Arc::clone(&captured);
        let data = wrap_input_callback::<i16>(
            Box::new(move |buffer, info| {
                assert_eq!(buffer.frame_count(), PERIOD_FRAMES);
                assert_eq!(info.channel_count(), CHANNELS);
                let mut captured = captured_cb.lock().unwrap();
                if captured.is_empty() {
                    captured.extend_from_slice(buffer.samples());
                }
            }),
            ChannelLayout::Interleaved,
            CHANNELS,
        );
        let stream = spawn_poll_stream(
            device,
            PollCallback::Input(data),
            Box::new(|_e| {}),
            OpenDesc {
                format: SampleFormat::I16,
                ..test_desc()
            },
        )
        .unwrap();

        stream.play().unwrap();
        assert!(wait_until(2000, || !captured.lock().unwrap().is_empty()));
        stream.close().unwrap();
        assert!(!handles.started.load(Ordering::SeqCst));

        let captured = captured.lock().unwrap();
        let expected: Vec<i16> = (0..PERIOD_FRAMES as usize * CHANNELS as usize)
            .map(|i| i16::from_ne_bytes([(2 * i) as u8, (2 * i + 1) as u8]))
            .collect();
        assert_eq!(*captured, expected);
    }

    #[test]
    fn test_validate_rejects_mismatched_sample_type() {
        let configs = AvailableConfigs::new(
            CHANNELS,
            vec![48000],
            None,
            [SampleFormat::F32, SampleFormat::I16].into_iter().collect(),
            ChannelLayout::Interleaved,
        )
        .unwrap();
        let config = StreamConfig {
            format: SampleFormat::I16,
            sample_rate: 48000,
            buffer_size: None,
        };
        assert!(matches!(
            validate::<f32>(&config, &configs),
            Err(AudioError::UnsupportedConfig(_))
        ));
        assert!(validate::<i16>(&config, &configs).is_ok());
    }

    #[test]
    fn test_validate_rejects_unrecorded_values() {
        let configs = AvailableConfigs::new(
            CHANNELS,
            vec![44100, 48000],
            BufferSizeRange::new(64, 4096),
            [SampleFormat::F32].into_iter().collect(),
            ChannelLayout::Interleaved,
        )
        .unwrap();

        let bad_rate = StreamConfig {
            format: SampleFormat::F32,
            sample_rate: 22050,
            buffer_size: None,
        };
        assert!(matches!(
            validate::<f32>(&bad_rate, &configs),
            Err(AudioError::UnsupportedConfig(_))
        ));

        let bad_buffer = StreamConfig {
            format: SampleFormat::F32,
            sample_rate: 48000,
            buffer_size: Some(8192),
        };
        assert!(matches!(
            validate::<f32>(&bad_buffer, &configs),
            Err(AudioError::UnsupportedConfig(_))
        ));

        let resolved = StreamConfig {
            format: SampleFormat::F32,
            sample_rate: 48000,
            buffer_size: Some(256),
        };
        let desc = validate::<f32>(&resolved, &configs).unwrap();
        assert_eq!(desc.channel_count, CHANNELS);
        assert_eq!(desc.layout, ChannelLayout::Interleaved);
    }

    #[test]
    fn test_output_callback_data_shapes() {
        let mut samples = [0.0f32; 8];

        let mut interleaved =
            output_callback_data(&mut samples, ChannelLayout::Interleaved, 2, 4);
        assert_eq!(interleaved.samples_mut().len(), 8);
        assert!(interleaved.channel_mut(0).is_none());

        let mut planar = output_callback_data(&mut samples, ChannelLayout::NonInterleaved, 2, 4);
        planar.channel_mut(0).unwrap().fill(1.0);
        planar.channel_mut(1).unwrap().fill(2.0);
        assert!(planar.channel_mut(2).is_none());
        assert_eq!(samples[..4], [1.0; 4]);
        assert_eq!(samples[4..], [2.0; 4]);
    }

    #[test]
    fn test_silence_uses_equilibrium() {
        let mut samples = [0u16; 4];
        let mut buffer = output_callback_data(&mut samples, ChannelLayout::Interleaved, 2, 2);
        buffer.silence();
        assert_eq!(samples, [32768; 4]);
    }

    #[test]
    fn test_input_callback_data_channels() {
        let samples: Vec<i16> = (0..6).collect();
        let planar = input_callback_data(&samples, ChannelLayout::NonInterleaved, 2, 3);
        assert_eq!(planar.channel(0).unwrap(), &[0, 1, 2]);
        assert_eq!(planar.channel(1).unwrap(), &[3, 4, 5]);

        let interleaved = input_callback_data(&samples, ChannelLayout::Interleaved, 2, 3);
        assert!(interleaved.channel(0).is_none());
        assert_eq!(interleaved.samples().len(), 6);
    }

    #[test]
    fn test_frames_to_duration() {
        assert_eq!(frames_to_duration(48000, 48000), Duration::from_secs(1));
        assert_eq!(frames_to_duration(24000, 48000), Duration::from_millis(500));
        assert_eq!(frames_to_duration(0, 48000), Duration::ZERO);
    }
}
