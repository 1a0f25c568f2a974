//! Ambient noise estimation and adaptive playback volume.
//!
//! Audio blocks become level readings ([`level`]), which feed a rolling percentile
//! ([`tracker`]) and a relative gap detector ([`gap`]). At gaps or song boundaries
//! ([`boundary`]) the [`sampler`] measures the room, and [`volume::decide`] maps the
//! estimate onto an output step. [`monitor::MonitoringSession`] runs it all.

pub mod boundary;
pub mod capture;
pub mod config;
pub mod decode;
pub mod error;
pub mod gap;
pub mod level;
pub mod monitor;
pub mod sampler;
pub mod tracker;
pub mod volume;

pub use config::{ BoundaryStrategy, Settings, SettingsHandle };
pub use error::{ AvcError, Result };
pub use monitor::{ DecisionOutcome, DetectionMode, MonitorSnapshot, MonitoringSession, Trigger };
