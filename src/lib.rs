//! tus Server Library
//!
//! Server side of the tus 1.0.0 resumable upload protocol.
//!
//! # Modules
//!
//! - `upload`: Session state machine, storage, integrity checks
//! - `routes`: axum HTTP surface
//! - `config`: Environment configuration

pub mod config;
pub mod error;
pub mod headers;
pub mod routes;
pub mod state;
pub mod upload;

pub use error::{Result, TusError};
