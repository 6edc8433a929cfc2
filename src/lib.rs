//! Tapedeck - HTTP control plane for ffmpeg capture sessions
//!
//! Starts and stops `ffmpeg` recordings of local V4L2 and ALSA devices,
//! with at most one live session per device.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod capture;
pub mod config;
pub mod error;
pub mod library;
pub mod network;
pub mod recording;

pub use error::{Result, TapedeckError};
