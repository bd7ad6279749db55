//! Shared building blocks of the voice/video session stack: domain models,
//! the error type, configuration, logging setup and the traits behind which
//! the membership store, signal relay, presence channel and capture devices
//! live.

pub mod backend;
pub mod config;
pub mod devices;
pub mod error;
pub mod logging;
pub mod models;

pub use config::Config;
pub use devices::{LocalTrack, SyntheticDevices, TrackEndReason};
pub use error::{Error, MediaErrorReason, Result};
