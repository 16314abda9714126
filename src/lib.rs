// src/lib.rs

pub mod config;
pub mod display;
pub mod progress;
pub mod publish;
pub mod split;

pub use config::{HecConfig, PublisherConfig, SplitConfig, TimeFormat, TransformerConfig};
pub use progress::{Progress, ProgressSnapshot, SplitStats, SplitStatsSnapshot};
