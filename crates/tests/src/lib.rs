//! Cross-crate integration tests for the aubade workspace.
//!
//! These drive the public API end-to-end over the virtual backend, so they
//! run identically on CI machines without audio hardware.

#[cfg(test)]
mod enumeration_integration;
#[cfg(test)]
mod stream_integration;
