//! Modbus client core for Huawei SUN2000 inverters and their LUNA2000
//! batteries and power meters.
//!
//! [`Device`] is the entry point: it owns a worker task that serializes every
//! request onto a single TCP or RTU link, logs in for privileged writes, and
//! decodes register words into typed [`Value`]s.

pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod modbus;
pub mod registers;
pub mod scheduler;
pub mod session;
pub mod telemetry;

pub use codec::{Decimal, RegisterValue, Structured, Value};
pub use device::Device;
pub use error::{Error, Result};
pub use registers::{PollGroup, RegisterDescriptor};
