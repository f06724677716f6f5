//! Throttle tracking and adaptive rate control.
//!
//! Two cooperating pieces:
//!
//! - [`ThrottleTracker`] remembers, per connection source, the earliest
//!   time new requests are considered safe after a service-protection
//!   response. The pool's throttle-aware selection reads it; the bulk
//!   executor writes it.
//! - [`RateController`] adapts the number of concurrently admitted
//!   batches from observed batch durations and throttle events, between
//!   a floor of 1 and the service's per-user cap. [`AdmissionGate`]
//!   turns the controller's moving cap into an awaitable permit.

pub mod config;
pub mod controller;
pub mod gate;
pub mod tracker;

pub use config::{RateConfig, RateConfigBuilder, RatePreset, SERVICE_USER_CAP};
pub use controller::{ControllerState, RateController, ThrottleVerdict};
pub use gate::{AdmissionGate, AdmissionPermit};
pub use tracker::{ThrottleState, ThrottleTracker};
