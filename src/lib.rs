//! NebulaStream runtime execution substrate.
//!
//! This crate implements the hard core of a distributed stream processing
//! engine: a pool of worker threads pulling tasks from a bounded queue,
//! driving compiled pipelines over tuple buffers, coordinating time-based
//! windowing across multiple upstream origins, and tearing down pipelines
//! safely under graceful, hard-stop, or reconfiguration conditions.
//!
//! Query parsing, logical planning, placement, and the control plane are
//! out of scope; this crate accepts already-decomposed executable plans
//! as input (see [`plan`]).

pub mod buffer;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod handler;
pub mod network;
pub mod pipeline;
pub mod plan;
pub mod shredder;
pub mod stop_token;
pub mod task_queue;
pub mod watermark;
pub mod window;
pub mod worker;

pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use stop_token::StopToken;
