//! Tabula Common Types and Utilities
//!
//! Shared configuration, error handling, request/response values and schema
//! descriptors used by every tabula component.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod request;
pub mod types;

pub use config::TabulaConfig;
pub use error::{Error, Result};
pub use request::{ApiRequest, ApiResponse, Method};
pub use types::{Action, ColumnDescriptor, ColumnInfo, Row, TableDescriptor};
