//! # Fusion
//!
//! Top-level crate: re-exports the task core and hosts the demo universe
//! driven by the `fusion_headless` binary.
//!
//! ## Modules
//!
//! - `core`: the task manager, scheduler, properties and signaling
//! - `demo`: falling bodies wired through every part of the core

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]

pub mod demo;

pub use fusion_core as core;

pub use demo::{DemoUniverse, Impact};
pub use fusion_core::{CoreConfig, CoreError, TaskScheduler};
