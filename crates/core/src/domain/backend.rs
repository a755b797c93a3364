//! The backend capability interface.
//!
//! The lifecycle core consumes platform audio subsystems exclusively through
//! [`AudioBackend`]: identity enumeration, default-device queries, capability
//! probing, and stream binding. A backend binds a stream in one of two
//! shapes:
//!
//! - **Direct**: the native subsystem owns the realtime thread and pushes
//!   buffers into a registered callback. The backend returns a
//!   [`DirectStream`] whose start/stop map straight onto hardware calls.
//! - **Polling**: the native API only offers blocking/poll primitives. The
//!   backend returns a [`PollDevice`] (start/stop/poll/acquire/release plus
//!   a readiness event) and hands the callbacks back; the core spawns and
//!   owns the one realtime thread that drives them.
//!
//! Callbacks cross this boundary untyped (raw byte buffers); the core wraps
//! the caller's typed closures before handing them down, so backends stay
//! format-driven and object-safe.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use super::audio::{AudioError, ChannelLayout, Result, SampleFormat};
use super::device::{AvailableConfigs, Direction};
use super::stream::CallbackInfo;

/// Concrete parameters pushed down to the hardware at bind time. Produced
/// by the open path after validation against the device's capability set.
#[derive(Debug, Clone)]
pub struct OpenDesc {
    pub format: SampleFormat,
    pub sample_rate: u32,
    /// `None` lets the device choose its own period.
    pub buffer_size: Option<u32>,
    pub channel_count: u16,
    pub layout: ChannelLayout,
}

/// Data callback at the capability boundary: a raw byte buffer holding
/// `frames * channel_count` samples of the negotiated format, shaped per the
/// negotiated layout. Buffers are aligned to the sample size.
pub type RawOutputCallback = Box<dyn FnMut(&mut [u8], u32, &CallbackInfo) + Send + 'static>;

/// Input twin of [`RawOutputCallback`].
pub type RawInputCallback = Box<dyn FnMut(&[u8], u32, &CallbackInfo) + Send + 'static>;

/// Out-of-band error reporting from the audio thread.
pub type ErrorCallback = Box<dyn FnMut(AudioError) + Send + 'static>;

/// A stream bound in the direct model. The native subsystem schedules the
/// callback; these calls take immediate effect on the hardware.
///
/// Dropping the value unregisters the native callback and releases the
/// hardware handle.
pub trait DirectStream {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// A stream bound in the polling model: the primitive set the core's audio
/// thread drives each iteration.
///
/// The audio thread is the only caller of these methods after open; the
/// implementation does not need internal synchronization beyond signalling
/// [`StreamEvents::READY`] when hardware buffer space becomes available.
pub trait PollDevice: Send {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Frames currently writable (output) or readable (input) in the
    /// hardware buffer.
    fn available_frames(&mut self) -> Result<u32>;

    /// Borrow the hardware buffer for `frames` frames. The returned bytes
    /// are `frames * channel_count * format.byte_size()` long and aligned
    /// to at least the sample size.
    fn acquire_buffer(&mut self, frames: u32) -> Result<&mut [u8]>;

    /// Return the buffer acquired by the previous
    /// [`PollDevice::acquire_buffer`] to the hardware.
    fn release_buffer(&mut self, frames: u32) -> Result<()>;

    /// The event pair shared with the controlling stream handle. The device
    /// signals [`StreamEvents::READY`] on it; the stream handle signals
    /// [`StreamEvents::COMMAND`].
    fn events(&self) -> Arc<StreamEvents>;
}

/// Result of binding an output stream to hardware.
pub enum OpenedOutput {
    Direct(Box<dyn DirectStream>),
    Polling {
        device: Box<dyn PollDevice>,
        data: RawOutputCallback,
        error: ErrorCallback,
    },
}

/// Result of binding an input stream to hardware.
pub enum OpenedInput {
    Direct(Box<dyn DirectStream>),
    Polling {
        device: Box<dyn PollDevice>,
        data: RawInputCallback,
        error: ErrorCallback,
    },
}

/// Platform capability layer consumed by enumeration and the stream
/// lifecycle core. One implementation per backend, selected at
/// configuration time.
pub trait AudioBackend {
    /// Stable hardware identity. Defaults are matched by equality on this,
    /// never by display name.
    type DeviceId: Clone + PartialEq + fmt::Debug;

    fn name(&self) -> &'static str;

    /// Identities of all currently active devices. Failing this
    /// foundational query is fatal to enumeration ([`AudioError::OsError`]).
    fn device_ids(&self) -> Result<Vec<Self::DeviceId>>;

    /// Identity of the platform's current default endpoint for `direction`,
    /// if any. Query failures are absorbed to `None` by implementations.
    fn default_device_id(&self, direction: Direction) -> Option<Self::DeviceId>;

    fn device_name(&self, id: &Self::DeviceId) -> Result<String>;

    /// Capability set of `id` for `direction`. Implementations absorb all
    /// per-device anomalies (query failures, unparsable or non-integral
    /// ranges, zero channels, empty format sets) into `None`.
    fn probe(&self, id: &Self::DeviceId, direction: Direction) -> Option<AvailableConfigs>;

    /// Bind an output stream. Rejecting the pushed parameters yields
    /// [`AudioError::UnsupportedConfig`]; any partial native registration
    /// must already be unwound when this returns an error.
    fn open_output(
        &self,
        id: &Self::DeviceId,
        desc: &OpenDesc,
        data: RawOutputCallback,
        error: ErrorCallback,
    ) -> Result<OpenedOutput>;

    /// Bind an input stream; mirrors [`AudioBackend::open_output`].
    fn open_input(
        &self,
        id: &Self::DeviceId,
        desc: &OpenDesc,
        data: RawInputCallback,
        error: ErrorCallback,
    ) -> Result<OpenedInput>;
}

/// The wait-for-any-of-two-events primitive shared between a polling
/// stream's control handle and its audio thread.
///
/// Signals are sticky until consumed by [`StreamEvents::wait_any`], so a
/// signal raised between the thread's flag check and its wait is never
/// lost.
pub struct StreamEvents {
    pending: Mutex<u8>,
    cond: Condvar,
}

impl StreamEvents {
    /// A control command (play/pause/close flag change) is pending.
    pub const COMMAND: u8 = 0b01;
    /// The hardware buffer has frames available.
    pub const READY: u8 = 0b10;

    pub fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self, event: u8) {
        let mut pending = lock_recover(&self.pending);
        *pending |= event;
        self.cond.notify_one();
    }

    /// Block until at least one event is pending, then consume and return
    /// the pending set. No timeout: close always signals [`Self::COMMAND`].
    pub fn wait_any(&self) -> u8 {
        let mut pending = lock_recover(&self.pending);
        while *pending == 0 {
            pending = match self.cond.wait(pending) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        std::mem::take(&mut *pending)
    }
}

impl Default for StreamEvents {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
