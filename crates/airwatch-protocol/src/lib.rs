//! # airwatch-protocol
//!
//! Air-quality hub message types, NGSI-LD documents and codec.
//!
//! This crate defines the push channel and REST body formats shared by the
//! client and the mock backend.

pub mod codec;
pub mod messages;
pub mod ngsi;

pub use codec::*;
pub use messages::*;
pub use ngsi::{AirQualityObserved, NgsiError};
