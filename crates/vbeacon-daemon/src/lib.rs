//! # vbeacon-daemon
//!
//! Process-level wiring for the vbeacon proximity beacon: logging setup,
//! configuration loading, platform selection and signal handling.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod app;
pub mod logging;
