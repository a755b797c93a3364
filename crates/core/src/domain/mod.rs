//! Domain entities and business rules

pub mod audio;
pub mod backend;
pub mod config;
pub mod device;
pub mod stream;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{AudioError, ChannelLayout, Formats, Result, Sample, SampleFormat};
pub use backend::{
    AudioBackend, DirectStream, ErrorCallback, OpenDesc, OpenedInput, OpenedOutput, PollDevice,
    RawInputCallback, RawOutputCallback, StreamEvents,
};
pub use config::{AudioPreferences, PrefsError};
pub use device::{AvailableConfigs, BufferSizeRange, Device, Direction, Host};
pub use stream::{
    input_callback_data, output_callback_data, CallbackInfo, SampleBuffer, SampleBufferRef, Stream,
    StreamConfig,
};
