//! Core audio value types: errors, sample formats, and the capability
//! format set.
//!
//! Everything here is platform-agnostic. Backend implementations (CPAL,
//! virtual) live in the `infra` crate and translate their native types into
//! these.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Debug, Error)]
pub enum AudioError {
    /// An underlying platform call failed unexpectedly. Fatal to the
    /// operation attempted; already-owned resources are unwound by their
    /// owners, never leaked.
    #[error("OS error: {0}")]
    OsError(String),

    /// Allocation failure. Propagated, never retried.
    #[error("Out of memory")]
    OutOfMemory,

    /// The requested format/rate/buffer-size combination was rejected.
    /// Recoverable: re-run the preference resolver against the device's
    /// reported capability set and try again.
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfig(String),

    /// The device (or the requested direction of it) does not exist or is
    /// not usable for streaming.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Supported audio sample formats.
///
/// Each variant has a fixed wire size in bytes; 24-bit formats are packed
/// (3 bytes per sample).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    F32,
    F64,
    U8,
    U16,
    U24,
    U32,
    U64,
    I8,
    I16,
    I24,
    I32,
    I64,
}

impl SampleFormat {
    /// Size of one sample of this format in bytes.
    pub const fn byte_size(self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::I8 => 1,
            SampleFormat::U16 | SampleFormat::I16 => 2,
            SampleFormat::U24 | SampleFormat::I24 => 3,
            SampleFormat::F32 | SampleFormat::U32 | SampleFormat::I32 => 4,
            SampleFormat::F64 | SampleFormat::U64 | SampleFormat::I64 => 8,
        }
    }

    /// Whether this format is floating point.
    pub const fn is_float(self) -> bool {
        matches!(self, SampleFormat::F32 | SampleFormat::F64)
    }

    const fn bit(self) -> u16 {
        match self {
            SampleFormat::F32 => 1 << 0,
            SampleFormat::F64 => 1 << 1,
            SampleFormat::U8 => 1 << 2,
            SampleFormat::U16 => 1 << 3,
            SampleFormat::U24 => 1 << 4,
            SampleFormat::U32 => 1 << 5,
            SampleFormat::U64 => 1 << 6,
            SampleFormat::I8 => 1 << 7,
            SampleFormat::I16 => 1 << 8,
            SampleFormat::I24 => 1 << 9,
            SampleFormat::I32 => 1 << 10,
            SampleFormat::I64 => 1 << 11,
        }
    }
}

/// Fallback priority used by [`Formats::any`]: f32 first, then the widest
/// practically useful signed formats, then unsigned. Fixed so negotiation is
/// deterministic across runs and platforms.
const ANY_PRIORITY: [SampleFormat; 12] = [
    SampleFormat::F32,
    SampleFormat::F64,
    SampleFormat::I16,
    SampleFormat::I24,
    SampleFormat::I32,
    SampleFormat::I64,
    SampleFormat::I8,
    SampleFormat::U16,
    SampleFormat::U24,
    SampleFormat::U32,
    SampleFormat::U64,
    SampleFormat::U8,
];

/// Set of sample formats a device direction supports.
///
/// Bit-set semantics: presence/absence per variant, no duplicates, no
/// insertion order. Iteration and [`Formats::any`] follow a fixed priority
/// order instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Formats(u16);

impl Formats {
    pub const EMPTY: Formats = Formats(0);

    pub fn insert(&mut self, format: SampleFormat) {
        self.0 |= format.bit();
    }

    pub fn supports(self, format: SampleFormat) -> bool {
        self.0 & format.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Some supported format, in the fixed priority order (f32 first).
    ///
    /// Returns `None` only for the empty set, which is a caller error: a
    /// usable device direction always records at least one format.
    pub fn any(self) -> Option<SampleFormat> {
        self.iter().next()
    }

    /// Iterate supported formats in priority order.
    pub fn iter(self) -> impl Iterator<Item = SampleFormat> {
        ANY_PRIORITY.into_iter().filter(move |f| self.supports(*f))
    }
}

impl FromIterator<SampleFormat> for Formats {
    fn from_iter<I: IntoIterator<Item = SampleFormat>>(iter: I) -> Self {
        let mut formats = Formats::EMPTY;
        for f in iter {
            formats.insert(f);
        }
        formats
    }
}

/// Channel storage layout of a stream buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLayout {
    /// One contiguous buffer, channels adjacent within each frame.
    Interleaved,
    /// One sequence per channel, channel-major.
    NonInterleaved,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
    impl Sealed for i8 {}
    impl Sealed for i16 {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
}

/// Primitive sample types usable with the typed stream API.
///
/// The 24-bit formats exist in the capability model (devices advertise
/// them) but have no native Rust primitive; backends only advertise formats
/// that can actually be bound, which keeps resolver output always openable.
pub trait Sample: sealed::Sealed + Copy + Send + 'static {
    /// The capability-model tag for this sample type.
    const FORMAT: SampleFormat;
    /// The silence value for this sample type (mid-point for unsigned).
    const EQUILIBRIUM: Self;
}

macro_rules! impl_sample {
    ($($ty:ty => $format:expr, $eq:expr;)*) => {
        $(impl Sample for $ty {
            const FORMAT: SampleFormat = $format;
            const EQUILIBRIUM: Self = $eq;
        })*
    };
}

impl_sample! {
    f32 => SampleFormat::F32, 0.0;
    f64 => SampleFormat::F64, 0.0;
    i8 => SampleFormat::I8, 0;
    i16 => SampleFormat::I16, 0;
    i32 => SampleFormat::I32, 0;
    i64 => SampleFormat::I64, 0;
    u8 => SampleFormat::U8, 1 << 7;
    u16 => SampleFormat::U16, 1 << 15;
    u32 => SampleFormat::U32, 1 << 31;
    u64 => SampleFormat::U64, 1 << 63;
}
