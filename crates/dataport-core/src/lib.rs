//! Core infrastructure for the dataport migration engine.
//!
//! This crate provides the types shared by every other dataport crate:
//! - The error taxonomy ([`MigrationError`], [`ErrorKind`])
//! - The structured progress event stream ([`ProgressEvent`], [`ProgressListeners`])
//! - The record and value data model ([`Record`], [`Value`])
//! - The per-entity identity map ([`IdentityMap`])

pub mod error;
pub mod identity;
pub mod progress;
pub mod record;

pub use error::{ErrorKind, ErrorReport, MigrationError};
pub use identity::IdentityMap;
pub use progress::{
    FnProgressListener, Phase, ProgressEvent, ProgressListener, ProgressListeners,
    ProgressReporter,
};
pub use record::{Association, ChoiceValue, EntityRef, Record, Value};
