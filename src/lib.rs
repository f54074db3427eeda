#![forbid(unsafe_code)]

//! Channel subscription tracking: a local catalogue of video-platform channels
//! and their uploads, each video carrying a small workflow state.

pub mod config;
pub mod error;
pub mod model;
pub mod platform;
pub mod refresh;
pub mod store;

pub use error::{Error, Result};
