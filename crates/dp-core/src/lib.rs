//! Core types shared by the dataprep session crates.
//!
//! [`DataFrame`] is the tabular value a session edits, [`SessionConfig`] the
//! per-session tuning knobs, and [`Error`] the error taxonomy every layer
//! reports through.

pub mod config;
pub mod error;
pub mod frame;
pub mod types;

pub use config::{ConfigRecord, SessionConfig};
pub use error::{Error, Result};
pub use frame::{Column, ColumnData, DType, DataFrame};
pub use types::{DatasetId, OperationParams, SessionStatus, Shape, UserId};
