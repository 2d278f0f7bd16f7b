pub mod charon;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod flowcell;
pub mod fs_util;
pub mod launcher;
pub mod metrics;
pub mod notify;
pub mod organizer;
pub mod output;
pub mod process;
pub mod prompt;
pub mod status;
pub mod sweep;
pub mod tracking;
pub mod workflow;
