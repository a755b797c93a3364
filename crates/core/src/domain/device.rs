//! Device capability sets, the preference resolver, and host enumeration.
//!
//! An [`AvailableConfigs`] describes one direction (input or output) of one
//! device as queried at enumeration time. The resolver methods on it pick a
//! concrete format/rate/buffer-size from those ranges; they are deterministic
//! and total, so stream-opening code never needs a "no compatible
//! configuration" error path for format or rate.

use tracing::{debug, info, warn};

use super::audio::{AudioError, ChannelLayout, Formats, Result, Sample, SampleFormat};
use super::backend::AudioBackend;
use super::stream::{InputDataFn, OutputDataFn, Stream, StreamConfig};

/// Stream direction, from the application's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Inclusive range of buffer sizes (in frames) a device accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizeRange {
    min: u32,
    max: u32,
}

impl BufferSizeRange {
    /// Returns `None` when `min > max` (unparsable hardware range).
    pub fn new(min: u32, max: u32) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    pub fn min(self) -> u32 {
        self.min
    }

    pub fn max(self) -> u32 {
        self.max
    }

    pub fn contains(self, frames: u32) -> bool {
        self.min <= frames && frames <= self.max
    }

    pub fn clamp(self, frames: u32) -> u32 {
        frames.clamp(self.min, self.max)
    }
}

/// Capability set for one direction of one device, queried once during
/// enumeration and owned by the [`Device`].
#[derive(Debug, Clone, PartialEq)]
pub struct AvailableConfigs {
    channel_count: u16,
    sample_rates: Vec<u32>,
    buffer_size: Option<BufferSizeRange>,
    formats: Formats,
    layout: ChannelLayout,
}

impl AvailableConfigs {
    /// Build a capability set from queried hardware ranges.
    ///
    /// Returns `None` when the queried data cannot describe a usable
    /// direction (zero channels, no formats, no positive sample rate).
    /// Enumeration treats that as "direction unavailable" rather than an
    /// error, so one misbehaving device never aborts the walk.
    pub fn new(
        channel_count: u16,
        sample_rates: Vec<u32>,
        buffer_size: Option<BufferSizeRange>,
        formats: Formats,
        layout: ChannelLayout,
    ) -> Option<Self> {
        if channel_count == 0 || formats.is_empty() {
            return None;
        }
        if sample_rates.is_empty() || sample_rates.iter().any(|&r| r == 0) {
            return None;
        }
        Some(Self {
            channel_count,
            sample_rates,
            buffer_size,
            formats,
            layout,
        })
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    /// Recorded sample rates, in the order they were recorded. The resolver
    /// scans all entries; ties are broken by this order.
    pub fn sample_rates(&self) -> &[u32] {
        &self.sample_rates
    }

    /// Accepted buffer-size range; `None` means any size is accepted.
    pub fn buffer_size(&self) -> Option<BufferSizeRange> {
        self.buffer_size
    }

    pub fn formats(&self) -> Formats {
        self.formats
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn supports_format(&self, format: SampleFormat) -> bool {
        self.formats.supports(format)
    }

    /// Exact membership test; no tolerance.
    pub fn supports_sample_rate(&self, rate: u32) -> bool {
        self.sample_rates.contains(&rate)
    }

    pub fn supports_buffer_size(&self, frames: u32) -> bool {
        match self.buffer_size {
            None => true,
            Some(range) => range.contains(frames),
        }
    }

    /// The first entry of `preferred` that is supported, falling back to
    /// [`Formats::any`]. Never fails for a constructed capability set (the
    /// format set is guaranteed non-empty).
    pub fn preferred_format(&self, preferred: &[SampleFormat]) -> SampleFormat {
        match preferred.iter().copied().find(|f| self.supports_format(*f)) {
            Some(format) => format,
            // The constructor rejects empty format sets, so `any` holds.
            None => self.formats.any().unwrap_or(SampleFormat::F32),
        }
    }

    /// The supported rate with minimum absolute distance to `target`; ties
    /// go to the first-encountered entry in recorded order.
    ///
    /// Returns 0 for an empty rate set. That is a precondition violation
    /// (constructed sets always record at least one rate), not an error
    /// path.
    pub fn preferred_sample_rate(&self, target: u32) -> u32 {
        let mut best = 0u32;
        let mut best_distance = u32::MAX;
        for &rate in &self.sample_rates {
            let distance = rate.abs_diff(target);
            if distance < best_distance {
                best = rate;
                best_distance = distance;
            }
        }
        best
    }

    /// Clamp `target` into the recorded range; `None` when no range is
    /// recorded, meaning the device picks its own size.
    pub fn preferred_buffer_size(&self, target: u32) -> Option<u32> {
        self.buffer_size.map(|range| range.clamp(target))
    }
}

/// One enumerated hardware endpoint.
///
/// A device with neither input nor output configs is still enumerable but
/// unusable for streaming. The backend identity `Id` is opaque to callers.
#[derive(Debug, Clone)]
pub struct Device<Id> {
    name: String,
    input: Option<AvailableConfigs>,
    output: Option<AvailableConfigs>,
    id: Id,
}

impl<Id> Device<Id> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_configs(&self) -> Option<&AvailableConfigs> {
        self.input.as_ref()
    }

    pub fn output_configs(&self) -> Option<&AvailableConfigs> {
        self.output.as_ref()
    }

    pub fn configs(&self, direction: Direction) -> Option<&AvailableConfigs> {
        match direction {
            Direction::Input => self.input.as_ref(),
            Direction::Output => self.output.as_ref(),
        }
    }

    /// Backend-specific identity for this device.
    pub fn backend_id(&self) -> &Id {
        &self.id
    }
}

/// An enumerated audio host: the device list plus default-device
/// back-references.
///
/// Defaults are stored as indices into the owned device list (never raw
/// references), so the list can be grown freely during construction and
/// teardown is plain drop order.
pub struct Host<B: AudioBackend> {
    backend: B,
    devices: Vec<Device<B::DeviceId>>,
    default_output: Option<usize>,
    default_input: Option<usize>,
}

impl<B: AudioBackend> Host<B> {
    /// Enumerate all currently active devices of `backend`.
    ///
    /// Fails with [`AudioError::OsError`] only when the foundational
    /// device-list query fails. Per-device anomalies (failed name or
    /// capability queries, unparsable ranges) are absorbed as "direction
    /// unavailable" and logged.
    pub fn new(backend: B) -> Result<Self> {
        info!("enumerating audio devices via {}", backend.name());

        let ids = backend.device_ids()?;
        let default_output_id = backend.default_device_id(Direction::Output);
        let default_input_id = backend.default_device_id(Direction::Input);

        let mut devices = Vec::with_capacity(ids.len());
        let mut default_output = None;
        let mut default_input = None;

        for id in ids {
            let name = backend.device_name(&id).unwrap_or_else(|e| {
                warn!("device name query failed: {e}");
                "Unknown Device".to_string()
            });

            let input = backend.probe(&id, Direction::Input);
            let output = backend.probe(&id, Direction::Output);
            if input.is_none() && output.is_none() {
                debug!("device {name:?} has no usable direction");
            }

            // Defaults are matched by backend identity, not display name.
            if default_output_id.as_ref() == Some(&id) {
                default_output = Some(devices.len());
            }
            if default_input_id.as_ref() == Some(&id) {
                default_input = Some(devices.len());
            }

            debug!(
                "found device {name:?} (input: {}, output: {})",
                input.is_some(),
                output.is_some()
            );
            devices.push(Device {
                name,
                input,
                output,
                id,
            });
        }

        info!("found {} audio devices", devices.len());
        Ok(Self {
            backend,
            devices,
            default_output,
            default_input,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn devices(&self) -> &[Device<B::DeviceId>] {
        &self.devices
    }

    pub fn default_output_device(&self) -> Option<&Device<B::DeviceId>> {
        self.default_output.map(|i| &self.devices[i])
    }

    pub fn default_input_device(&self) -> Option<&Device<B::DeviceId>> {
        self.default_input.map(|i| &self.devices[i])
    }

    pub fn find_device(&self, name: &str) -> Option<&Device<B::DeviceId>> {
        self.devices.iter().find(|d| d.name() == name)
    }

    /// Open an output stream on `device` with an already-resolved
    /// configuration. See [`StreamConfig`] for the resolver contract.
    pub fn open_output<T, D, E>(
        &self,
        device: &Device<B::DeviceId>,
        config: &StreamConfig,
        data: D,
        error: E,
    ) -> Result<Stream>
    where
        T: Sample,
        D: OutputDataFn<T>,
        E: FnMut(AudioError) + Send + 'static,
    {
        super::stream::open_output::<B, T, D, E>(&self.backend, device, config, data, error)
    }

    /// Open an input (capture) stream on `device`. Mirrors
    /// [`Host::open_output`]; not every backend supports capture.
    pub fn open_input<T, D, E>(
        &self,
        device: &Device<B::DeviceId>,
        config: &StreamConfig,
        data: D,
        error: E,
    ) -> Result<Stream>
    where
        T: Sample,
        D: InputDataFn<T>,
        E: FnMut(AudioError) + Send + 'static,
    {
        super::stream::open_input::<B, T, D, E>(&self.backend, device, config, data, error)
    }
}
