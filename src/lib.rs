//! # CTF
//!
//! A scripted test framework for CCSDS flight software. Test scripts are JSON files of
//! instructions that build, start and command a flight-software target over UDP, then verify
//! the telemetry and event messages it sends back.
//!
//! ## Features
//!
//! - **Data dictionaries**: MID maps, command codes and payload layouts loaded from JSON
//! - **Wire codec**: CCSDS v1/v2 command and telemetry headers, typed payload buffers
//! - **Verification**: polled telemetry/event checks, negative checks and continuous checks
//! - **Control flow**: labels, loops and conditional branches over user variables
//! - **Targets**: local or SSH-hosted flight software processes, one or many per run
//!
//! ## Quick Start
//!
//! ```rust
//! use ctf::config::Config;
//!
//! let config = Config::from_toml(
//!     "[core]\nctf_verification_timeout = 2.0\n\n[cfs]\ncmd_udp_port = 1234\n",
//! )
//! .unwrap();
//! assert_eq!(config.core.ctf_verification_timeout, 2.0);
//! assert!(config.has_section("cfs"));
//! ```
//!
//! ## Architecture
//!
//! - [`ccsds`] - Primary/secondary header codec
//! - [`types`] - Type definitions and typed payload buffers
//! - [`dictionary`] - Data-dictionary loader
//! - [`command`] / [`telemetry`] - UDP command and telemetry channels
//! - [`controller`] - Per-target process control, command encoding and verification
//! - [`script`] - Test script loader with function inlining
//! - [`scheduler`] - Instruction scheduler
//! - [`plugins`] - Instruction handlers
//! - [`suite`] - Runs scripts and writes the results summary

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)]

pub mod ccsds;
pub mod command;
pub mod config;
pub mod context;
pub mod controller;
pub mod dictionary;
pub mod error;
pub mod logging;
pub mod plugins;
pub mod predicate;
pub mod scheduler;
pub mod script;
pub mod status;
pub mod suite;
pub mod telemetry;
pub mod time;
pub mod types;

// Re-export main public types for convenience
pub use config::Config;
pub use context::ExecutionContext;
pub use controller::TargetController;
pub use dictionary::Dictionary;
pub use plugins::PluginRegistry;
pub use scheduler::{ScriptOutcome, TestOutcome, TestRunner};
pub use script::Script;
pub use status::{Status, StatusReporter};
pub use suite::{SuiteRunner, SuiteSummary};
