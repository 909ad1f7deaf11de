#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod assets;
pub mod builder;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod fleet;
pub mod logging;
pub mod model;
pub mod paths;
pub mod probe;
pub mod progress;
pub mod reconcile;
pub mod report;
pub mod util;
pub mod vm_state;
