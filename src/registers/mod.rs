//! Register catalog: what lives where in the SUN2000 register map.

pub mod catalog;
pub mod flags;

use serde::Deserialize;
use std::time::Duration;
use strum::{Display, EnumIter};

pub use catalog::{all, lookup, names, span_of, HEARTBEAT_REGISTER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

/// One named bit (or group of bits) inside a bitfield register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitFlag {
    pub name: &'static str,
    pub mask: u32,
}

/// Decomposition rule for structured multi-word registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// u32 seconds since the Unix epoch, two words.
    EpochSeconds,
    /// Count word + 14 records of (start, end, flag/day word).
    TimeOfUse,
    /// Count word + 10 records of (start, end, power hi, power lo).
    FixedCharge,
    /// Count word + 14 records of (start, end, power, day word).
    CapacityControl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    UInt,
    Int,
    Bitfield(&'static [BitFlag]),
    Text,
    Structured(Layout),
}

/// Immutable description of one named quantity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDescriptor {
    pub name: &'static str,
    pub address: u16,
    /// Register count.
    pub length: u16,
    pub data_type: DataType,
    /// Raw values are divided by this on decode, multiplied on encode.
    pub scale: u32,
    pub unit: Option<&'static str>,
    pub access: Access,
    /// Writes need the elevated session.
    pub privileged: bool,
}

impl RegisterDescriptor {
    pub const fn new(
        name: &'static str,
        address: u16,
        length: u16,
        data_type: DataType,
        scale: u32,
    ) -> Self {
        Self {
            name,
            address,
            length,
            data_type,
            scale,
            unit: None,
            access: Access::Read,
            privileged: false,
        }
    }

    /// Mark as a writable configuration register (elevated session required).
    pub const fn writable(self) -> Self {
        Self {
            access: Access::ReadWrite,
            privileged: true,
            ..self
        }
    }

    pub const fn unit(self, unit: &'static str) -> Self {
        Self {
            unit: Some(unit),
            ..self
        }
    }

    pub fn is_writable(&self) -> bool {
        self.access == Access::ReadWrite
    }

    /// First address past this register span.
    pub fn end(&self) -> u32 {
        self.address as u32 + self.length as u32
    }
}

/// Quantities the periodic trigger keeps fresh, grouped by refresh rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PollGroup {
    Inverter,
    PowerMeter,
    Battery,
    Optimizers,
    Configuration,
}

impl PollGroup {
    pub fn quantities(self) -> &'static [&'static str] {
        match self {
            PollGroup::Inverter => catalog::INVERTER_GROUP,
            PollGroup::PowerMeter => catalog::POWER_METER_GROUP,
            PollGroup::Battery => catalog::BATTERY_GROUP,
            PollGroup::Optimizers => catalog::OPTIMIZER_GROUP,
            PollGroup::Configuration => catalog::CONFIGURATION_GROUP,
        }
    }

    /// Refresh interval. Configuration only changes through the vendor app,
    /// so it is polled rarely.
    pub fn default_interval(self) -> Duration {
        match self {
            PollGroup::Inverter | PollGroup::PowerMeter | PollGroup::Battery => {
                Duration::from_secs(30)
            }
            PollGroup::Optimizers => Duration::from_secs(5 * 60),
            PollGroup::Configuration => Duration::from_secs(15 * 60),
        }
    }
}
