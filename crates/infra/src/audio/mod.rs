//! Audio backend implementations of the capability interface
//!
//! Two backends with fundamentally different native threading models sit
//! behind the same `aubade-core` contract:
//! - [`cpal_backend`]: real hardware through CPAL's push callbacks (the
//!   direct model)
//! - [`virtual_backend`]: a software device driven by the core's polling
//!   thread (the polling model); also the test double for the lifecycle
//!   contract

pub mod cpal_backend;
pub mod ring_buffer;
pub mod virtual_backend;

pub use cpal_backend::*;
pub use virtual_backend::*;

use aubade_core::domain::audio::Result;
use aubade_core::domain::device::Host;

/// The platform host: CPAL over the system's default audio subsystem.
pub fn default_host() -> Result<Host<CpalBackend>> {
    Host::new(CpalBackend::new())
}

/// A host over the given virtual devices; no audio hardware involved.
pub fn virtual_host(specs: Vec<VirtualDeviceSpec>) -> Result<Host<VirtualBackend>> {
    Host::new(VirtualBackend::new(specs))
}
