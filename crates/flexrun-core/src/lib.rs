//! Execution lifecycle coordination for the flexrun broker.
//!
//! A [`ProcessSupervisor`] owns one interpreter subprocess per submitted
//! program. Its stdout runs through the [`SentinelFilter`], lands in the
//! shared [`ExecutionRegistry`] and is pushed to browser clients by the
//! [`ConnectionMultiplexer`]. The [`TimeoutController`] enforces the
//! wall-clock budget and stands still while a program waits for input.

pub mod config;
pub mod errors;
pub mod multiplexer;
pub mod registry;
pub mod sentinel;
pub mod supervisor;
pub mod timeout;
pub mod workspace;

pub use config::{BrokerConfig, ConfigLoader};
pub use errors::{BrokerError, Result};
pub use multiplexer::{ConnectionMultiplexer, ExecutionControl, HeartbeatAction};
pub use registry::{ExecutionRegistry, ExecutionSnapshot};
pub use sentinel::{Classified, SentinelFilter, SentinelStream, Signal};
pub use supervisor::{ExecutionHandle, ExecutionOutcome, OutcomeStatus, ProcessSupervisor};
pub use timeout::{TimeoutClock, TimeoutController};
pub use workspace::SourceWorkspace;
