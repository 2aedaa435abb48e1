//! # airwatch-core
//!
//! Core air-quality model and update-distribution logic.
//!
//! This crate provides:
//! - Data model types (ObservationEvent, Alert, ConnectionStatus, etc.)
//! - AQI derivation from particulate readings
//! - The update reconciler (dedupe, latest-per-station, bounded history)
//! - The subscription bus used by display surfaces
//! - The alert evaluator
//! - Session settings
//!
//! This crate is intentionally runtime-agnostic and contains no async code
//! or I/O; the tokio-based client builds on top of it.

pub mod alerts;
pub mod aqi;
pub mod bus;
pub mod config;
pub mod model;
pub mod reconciler;

pub use alerts::{AlertEvaluator, EvaluationError, RecentAlerts};
pub use bus::{BusEvent, Category, EventBus, Handler, Subscription, SubscriptionBus};
pub use config::{ConfigError, ConfigStorage, Settings};
pub use model::*;
pub use reconciler::{ReconciledSnapshot, ReconciledUpdate, Reconciler, StaleEventError};
