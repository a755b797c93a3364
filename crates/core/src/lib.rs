//! Aubade core: platform-agnostic audio device negotiation and stream
//! lifecycle.
//!
//! This crate holds everything that does not touch a platform API: the
//! device capability model, the preference resolver, host/device
//! enumeration driven through the [`domain::backend::AudioBackend`]
//! capability interface, and the stream lifecycle/concurrency core.
//! Backend implementations live in the `aubade-infra` crate.

pub mod domain;
