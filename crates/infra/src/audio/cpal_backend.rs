//! CPAL-based audio backend implementation
//!
//! Provides the direct-callback model over CPAL, which abstracts the
//! platform push-callback APIs:
//! - Windows: WASAPI
//! - Linux: ALSA/PulseAudio
//! - macOS: CoreAudio
//!
//! CPAL reports capability *ranges*; probing converts them into the
//! discrete capability model by walking a standard sample-rate ladder, and
//! advertises only sample formats the typed stream path can actually bind,
//! so resolver output always opens.

use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, info, warn};

use aubade_core::domain::audio::{AudioError, ChannelLayout, Formats, Result, SampleFormat};
use aubade_core::domain::backend::{
    AudioBackend, DirectStream, ErrorCallback, OpenDesc, OpenedInput, OpenedOutput,
    RawInputCallback, RawOutputCallback,
};
use aubade_core::domain::device::{AvailableConfigs, BufferSizeRange, Direction};
use aubade_core::domain::stream::CallbackInfo;

/// Rates probed against each reported range. CPAL (like WASAPI underneath)
/// has no discrete-rate query, so the capability model records the ladder
/// entries each range covers, plus the range endpoints.
const STANDARD_SAMPLE_RATES: [u32; 13] = [
    5512, 8000, 11025, 16000, 22050, 32000, 44100, 48000, 64000, 88200, 96000, 176400, 192000,
];

/// CPAL device identity. CPAL exposes no stabler portable identity than
/// the enumeration name, so defaults are matched on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpalDeviceId {
    name: String,
}

/// CPAL-based backend (direct-callback model)
pub struct CpalBackend {
    host: cpal::Host,
}

impl Default for CpalBackend {
    fn default() -> Self {
        info!("Initializing CPAL backend");
        Self::new()
    }
}

impl CpalBackend {
    pub fn new() -> Self {
        let host = cpal::default_host();
        debug!("Using audio host: {:?}", host.id());
        Self { host }
    }

    fn find_device(&self, id: &CpalDeviceId) -> Result<cpal::Device> {
        let mut devices = self
            .host
            .devices()
            .map_err(|e| AudioError::OsError(e.to_string()))?;
        #[allow(deprecated)]
        let device = devices.find(|d| d.name().ok().as_deref() == Some(id.name.as_str()));
        device.ok_or_else(|| AudioError::DeviceNotFound(id.name.clone()))
    }
}

impl AudioBackend for CpalBackend {
    type DeviceId = CpalDeviceId;

    fn name(&self) -> &'static str {
        "cpal"
    }

    fn device_ids(&self) -> Result<Vec<CpalDeviceId>> {
        let devices = self
            .host
            .devices()
            .map_err(|e| AudioError::OsError(e.to_string()))?;

        #[allow(deprecated)]
        let ids = devices
            .map(|device| CpalDeviceId {
                name: device
                    .name()
                    .unwrap_or_else(|_| "Unknown Device".to_string()),
            })
            .collect();
        Ok(ids)
    }

    fn default_device_id(&self, direction: Direction) -> Option<CpalDeviceId> {
        let device = match direction {
            Direction::Output => self.host.default_output_device(),
            Direction::Input => self.host.default_input_device(),
        }?;
        #[allow(deprecated)]
        let name = device.name().ok()?;
        Some(CpalDeviceId { name })
    }

    fn device_name(&self, id: &CpalDeviceId) -> Result<String> {
        Ok(id.name.clone())
    }

    fn probe(&self, id: &CpalDeviceId, direction: Direction) -> Option<AvailableConfigs> {
        let device = self.find_device(id).ok()?;

        let mut formats = Formats::EMPTY;
        let mut sample_rates = Vec::new();
        let mut max_channels = 0u16;

        let gathered = match direction {
            Direction::Output => device.supported_output_configs().map(|configs| {
                gather_ranges(configs, &mut formats, &mut sample_rates, &mut max_channels)
            }),
            Direction::Input => device.supported_input_configs().map(|configs| {
                gather_ranges(configs, &mut formats, &mut sample_rates, &mut max_channels)
            }),
        };
        if let Err(e) = gathered {
            warn!("skipping {:?} direction of {:?}: {e}", direction, id.name);
            return None;
        }

        sample_rates.sort_unstable();
        sample_rates.dedup();

        // The default config supplies the native channel count and the
        // buffer-size range; without one, fall back to the widest range.
        let default_config = match direction {
            Direction::Output => device.default_output_config(),
            Direction::Input => device.default_input_config(),
        };
        let (channel_count, buffer_size) = match default_config {
            Ok(config) => {
                let buffer_size = match config.buffer_size() {
                    cpal::SupportedBufferSize::Range { min, max } => {
                        BufferSizeRange::new(*min, *max)
                    }
                    cpal::SupportedBufferSize::Unknown => None,
                };
                (config.channels(), buffer_size)
            }
            Err(_) => (max_channels, None),
        };

        // Anything unusable (no channels, no openable format, no rate)
        // collapses to "direction unavailable" here.
        AvailableConfigs::new(
            channel_count,
            sample_rates,
            buffer_size,
            formats,
            ChannelLayout::Interleaved,
        )
    }

    fn open_output(
        &self,
        id: &CpalDeviceId,
        desc: &OpenDesc,
        data: RawOutputCallback,
        error: ErrorCallback,
    ) -> Result<OpenedOutput> {
        let device = self.find_device(id)?;
        let stream = match desc.format {
            SampleFormat::F32 => build_output::<f32>(&device, desc, data, error),
            SampleFormat::F64 => build_output::<f64>(&device, desc, data, error),
            SampleFormat::I8 => build_output::<i8>(&device, desc, data, error),
            SampleFormat::I16 => build_output::<i16>(&device, desc, data, error),
            SampleFormat::I32 => build_output::<i32>(&device, desc, data, error),
            SampleFormat::I64 => build_output::<i64>(&device, desc, data, error),
            SampleFormat::U8 => build_output::<u8>(&device, desc, data, error),
            SampleFormat::U16 => build_output::<u16>(&device, desc, data, error),
            SampleFormat::U32 => build_output::<u32>(&device, desc, data, error),
            SampleFormat::U64 => build_output::<u64>(&device, desc, data, error),
            other => Err(AudioError::UnsupportedConfig(format!(
                "sample format {other:?} has no native stream path"
            ))),
        }?;
        Ok(OpenedOutput::Direct(stream))
    }

    fn open_input(
        &self,
        id: &CpalDeviceId,
        desc: &OpenDesc,
        data: RawInputCallback,
        error: ErrorCallback,
    ) -> Result<OpenedInput> {
        let device = self.find_device(id)?;
        let stream = match desc.format {
            SampleFormat::F32 => build_input::<f32>(&device, desc, data, error),
            SampleFormat::F64 => build_input::<f64>(&device, desc, data, error),
            SampleFormat::I8 => build_input::<i8>(&device, desc, data, error),
            SampleFormat::I16 => build_input::<i16>(&device, desc, data, error),
            SampleFormat::I32 => build_input::<i32>(&device, desc, data, error),
            SampleFormat::I64 => build_input::<i64>(&device, desc, data, error),
            SampleFormat::U8 => build_input::<u8>(&device, desc, data, error),
            SampleFormat::U16 => build_input::<u16>(&device, desc, data, error),
            SampleFormat::U32 => build_input::<u32>(&device, desc, data, error),
            SampleFormat::U64 => build_input::<u64>(&device, desc, data, error),
            other => Err(AudioError::UnsupportedConfig(format!(
                "sample format {other:?} has no native stream path"
            ))),
        }?;
        Ok(OpenedInput::Direct(stream))
    }
}

fn gather_ranges<I>(
    configs: I,
    formats: &mut Formats,
    sample_rates: &mut Vec<u32>,
    max_channels: &mut u16,
) where
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    for config in configs {
        // Ranges in formats the typed stream path cannot bind are skipped
        // entirely; advertising them would break the resolver round-trip.
        let Some(format) = map_sample_format(config.sample_format()) else {
            continue;
        };
        formats.insert(format);
        *max_channels = (*max_channels).max(config.channels());

        let min_rate = config.min_sample_rate();
        let max_rate = config.max_sample_rate();
        for rate in STANDARD_SAMPLE_RATES {
            if rate >= min_rate && rate <= max_rate && !sample_rates.contains(&rate) {
                sample_rates.push(rate);
            }
        }
        for rate in [min_rate, max_rate] {
            if !sample_rates.contains(&rate) {
                sample_rates.push(rate);
            }
        }
    }
}

fn map_sample_format(format: cpal::SampleFormat) -> Option<SampleFormat> {
    match format {
        cpal::SampleFormat::F32 => Some(SampleFormat::F32),
        cpal::SampleFormat::F64 => Some(SampleFormat::F64),
        cpal::SampleFormat::I8 => Some(SampleFormat::I8),
        cpal::SampleFormat::I16 => Some(SampleFormat::I16),
        cpal::SampleFormat::I32 => Some(SampleFormat::I32),
        cpal::SampleFormat::I64 => Some(SampleFormat::I64),
        cpal::SampleFormat::U8 => Some(SampleFormat::U8),
        cpal::SampleFormat::U16 => Some(SampleFormat::U16),
        cpal::SampleFormat::U32 => Some(SampleFormat::U32),
        cpal::SampleFormat::U64 => Some(SampleFormat::U64),
        // 24-bit and other packed layouts have no native stream path.
        _ => None,
    }
}

fn cpal_stream_config(desc: &OpenDesc) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: desc.channel_count,
        sample_rate: desc.sample_rate,
        buffer_size: match desc.buffer_size {
            Some(frames) => cpal::BufferSize::Fixed(frames),
            None => cpal::BufferSize::Default,
        },
    }
}

/// Stream-relative timestamp: hardware instants normalized against the
/// first callback's instant.
fn normalize_timestamp(
    origin: &mut Option<cpal::StreamInstant>,
    now: cpal::StreamInstant,
) -> Duration {
    let origin = origin.get_or_insert_with(|| now.clone());
    now.duration_since(origin).unwrap_or_default()
}

fn build_output<T: cpal::SizedSample>(
    device: &cpal::Device,
    desc: &OpenDesc,
    mut data: RawOutputCallback,
    mut error: ErrorCallback,
) -> Result<Box<dyn DirectStream>> {
    let config = cpal_stream_config(desc);
    let channel_count = desc.channel_count;
    let sample_rate = desc.sample_rate;
    let mut origin = None;

    let stream = device
        .build_output_stream(
            &config,
            move |buffer: &mut [T], callback_info: &cpal::OutputCallbackInfo| {
                let timestamp =
                    normalize_timestamp(&mut origin, callback_info.timestamp().playback);
                let frames = (buffer.len() / channel_count as usize) as u32;
                let info = CallbackInfo::new(timestamp, sample_rate, channel_count);
                // SAFETY: a plain byte view of the sample buffer; the typed
                // layer above casts it back to the same sample type.
                let bytes = unsafe {
                    std::slice::from_raw_parts_mut(
                        buffer.as_mut_ptr().cast::<u8>(),
                        std::mem::size_of_val(buffer),
                    )
                };
                data(bytes, frames, &info);
            },
            move |err| error(map_stream_error(err)),
            None,
        )
        .map_err(map_build_error)?;

    Ok(Box::new(CpalDirectStream { stream }))
}

fn build_input<T: cpal::SizedSample>(
    device: &cpal::Device,
    desc: &OpenDesc,
    mut data: RawInputCallback,
    mut error: ErrorCallback,
) -> Result<Box<dyn DirectStream>> {
    let config = cpal_stream_config(desc);
    let channel_count = desc.channel_count;
    let sample_rate = desc.sample_rate;
    let mut origin = None;

    let stream = device
        .build_input_stream(
            &config,
            move |buffer: &[T], callback_info: &cpal::InputCallbackInfo| {
                let timestamp =
                    normalize_timestamp(&mut origin, callback_info.timestamp().capture);
                let frames = (buffer.len() / channel_count as usize) as u32;
                let info = CallbackInfo::new(timestamp, sample_rate, channel_count);
                // SAFETY: as in `build_output`, shared access only.
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        buffer.as_ptr().cast::<u8>(),
                        std::mem::size_of_val(buffer),
                    )
                };
                data(bytes, frames, &info);
            },
            move |err| error(map_stream_error(err)),
            None,
        )
        .map_err(map_build_error)?;

    Ok(Box::new(CpalDirectStream { stream }))
}

fn map_build_error(error: cpal::BuildStreamError) -> AudioError {
    match error {
        cpal::BuildStreamError::StreamConfigNotSupported => {
            AudioError::UnsupportedConfig("stream config not supported by the device".into())
        }
        cpal::BuildStreamError::InvalidArgument => {
            AudioError::UnsupportedConfig("invalid argument for this device".into())
        }
        cpal::BuildStreamError::DeviceNotAvailable => {
            AudioError::DeviceNotFound("device is no longer available".into())
        }
        other => AudioError::OsError(other.to_string()),
    }
}

fn map_stream_error(error: cpal::StreamError) -> AudioError {
    match error {
        cpal::StreamError::DeviceNotAvailable => {
            AudioError::DeviceNotFound("device is no longer available".into())
        }
        other => AudioError::OsError(other.to_string()),
    }
}

/// Owns the native stream; dropping it unregisters the callback and
/// releases the hardware handle.
struct CpalDirectStream {
    stream: cpal::Stream,
}

impl DirectStream for CpalDirectStream {
    fn start(&self) -> Result<()> {
        self.stream
            .play()
            .map_err(|e| AudioError::OsError(format!("failed to start stream: {e}")))
    }

    fn stop(&self) -> Result<()> {
        self.stream
            .pause()
            .map_err(|e| AudioError::OsError(format!("failed to pause stream: {e}")))
    }
}
