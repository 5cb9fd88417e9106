//! Stackshot library - point-in-time snapshots of every task and thread.
//!
//! A capture walks all tasks and threads once, with interrupts masked, and
//! writes a self-describing kcdata buffer: tagged, length-prefixed items
//! nested in begin/end containers, optionally zlib-compressed.
//!
//! # Modules
//!
//! - [`service`] - the entry point: locking, sizing, retry and retained buffers
//! - [`capture`] - the single-pass capture routine
//! - [`kcdata`] - buffer writer and reader
//! - [`memory`] - fault-tolerant reads from foreign address spaces
//! - [`intern`] - port label interning table
//! - [`kernel`] - the interface a kernel exposes to the capture
//! - [`sim`] - a deterministic simulated kernel, scenarios and generators
//!
//! # Example
//!
//! ```
//! use stackshot::config::Tunables;
//! use stackshot::kcdata::parse;
//! use stackshot::request::SnapshotRequest;
//! use stackshot::service::StackshotService;
//! use stackshot::sim::{synthetic, SimKernel};
//!
//! let kernel = SimKernel::from_scenario(&synthetic::generate(4, 1))?;
//! let service = StackshotService::new(kernel, Tunables::default());
//! let result = service.stack_snapshot(SnapshotRequest::default());
//! assert!(result.status.is_success());
//!
//! let snapshot = parse(result.buffer.as_deref().unwrap_or_default())?;
//! assert_eq!(snapshot.containers(stackshot::kcdata::types::STACKSHOT_CONTAINER_TASK).len(), 5);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backtrace;
pub mod capture;
pub mod config;
pub mod error;
pub mod flags;
pub mod host;
pub mod intern;
pub mod kcdata;
pub mod kernel;
pub mod memory;
pub mod records;
pub mod request;
pub mod service;
pub mod sim;

pub use config::Tunables;
pub use error::{CaptureError, KcdataError, Status};
pub use flags::StackshotFlags;
pub use request::{Origin, SnapshotRequest, StackshotResult};
pub use service::StackshotService;
