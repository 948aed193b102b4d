//! Battery and grid-export commands.
//!
//! Each command checks its arguments and encodes every write it is made of
//! before touching the wire (a device limit read included), then runs as one
//! scheduled request: the writes are applied back to back with no poll in
//! between.

use tracing::info;

use super::{encode_step, Device};
use crate::codec::periods;
use crate::codec::{Decimal, Structured, Value};
use crate::error::{Error, Result};
use crate::registers;
use crate::scheduler::WriteStep;

pub const MAX_FORCIBLE_DURATION_MIN: u32 = 1440;
pub const MIN_TARGET_SOC: i64 = 12;
pub const MAX_TARGET_SOC: i64 = 100;
pub const MIN_FEED_GRID_POWER_W: i64 = -1000;

/// Values of `storage_forcible_charge_discharge_write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcibleMode {
    Stop = 0,
    Charge = 1,
    Discharge = 2,
}

/// Values of `storage_forcible_charge_discharge_setting_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcibleTarget {
    Duration = 0,
    StateOfCharge = 1,
}

/// Values of `active_power_control_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivePowerControlMode {
    Unlimited = 0,
    DiActiveScheduling = 1,
    ZeroPowerGridConnection = 5,
    PowerLimitedWatt = 6,
    PowerLimitedPercent = 7,
}

fn step(name: &str, value: impl Into<Value>) -> Result<WriteStep> {
    let desc = registers::lookup(name)?;
    encode_step(desc, &value.into())
}

fn check_duration(duration_min: u32) -> Result<()> {
    if !(1..=MAX_FORCIBLE_DURATION_MIN).contains(&duration_min) {
        return Err(Error::invalid(format!(
            "duration must be between 1 and {MAX_FORCIBLE_DURATION_MIN} minutes, got {duration_min}"
        )));
    }
    Ok(())
}

fn check_target_soc(target_soc: Decimal) -> Result<()> {
    let min = Decimal::from_integer(MIN_TARGET_SOC);
    let max = Decimal::from_integer(MAX_TARGET_SOC);
    if target_soc < min || target_soc > max {
        return Err(Error::invalid(format!(
            "target SOC must be between {MIN_TARGET_SOC} and {MAX_TARGET_SOC} %, got {target_soc}"
        )));
    }
    Ok(())
}

fn check_power_positive(power_w: u32) -> Result<()> {
    if power_w == 0 {
        return Err(Error::invalid("power must be positive"));
    }
    Ok(())
}

impl Device {
    /// Read a power limit the device reports about itself.
    async fn power_limit(&self, name: &str) -> Result<i64> {
        let value = self.read(name).await?;
        value
            .value
            .as_integer()
            .ok_or_else(|| Error::Protocol(format!("{name} is not an integer: {}", value.value)))
    }

    async fn check_power_limit(&self, power_w: i64, limit_name: &str) -> Result<()> {
        let limit = self.power_limit(limit_name).await?;
        if power_w > limit {
            return Err(Error::invalid(format!(
                "power cannot be more than {limit} W ({limit_name})"
            )));
        }
        Ok(())
    }

    async fn forcible(&self, mode: ForcibleMode, power_w: u32, duration_min: u32) -> Result<()> {
        check_duration(duration_min)?;
        check_power_positive(power_w)?;
        let (limit, power_register) = match mode {
            ForcibleMode::Discharge => (
                "storage_maximum_discharge_power",
                "storage_forcible_discharge_power",
            ),
            _ => (
                "storage_maximum_charge_power",
                "storage_forcible_charge_power",
            ),
        };
        let steps = vec![
            step(power_register, power_w as i64)?,
            step(
                "storage_forced_charging_and_discharging_period",
                duration_min as i64,
            )?,
            step(
                "storage_forcible_charge_discharge_setting_mode",
                ForcibleTarget::Duration as i64,
            )?,
            step("storage_forcible_charge_discharge_write", mode as i64)?,
        ];
        self.check_power_limit(power_w as i64, limit).await?;
        self.run_command(steps, true).await?;
        info!(?mode, power_w, duration_min, "forcible battery operation started");
        Ok(())
    }

    async fn forcible_soc(&self, mode: ForcibleMode, power_w: u32, target_soc: Decimal) -> Result<()> {
        check_target_soc(target_soc)?;
        check_power_positive(power_w)?;
        let (limit, power_register) = match mode {
            ForcibleMode::Discharge => (
                "storage_maximum_discharge_power",
                "storage_forcible_discharge_power",
            ),
            _ => (
                "storage_maximum_charge_power",
                "storage_forcible_charge_power",
            ),
        };
        let steps = vec![
            step(power_register, power_w as i64)?,
            step("storage_forcible_charge_discharge_soc", target_soc)?,
            step(
                "storage_forcible_charge_discharge_setting_mode",
                ForcibleTarget::StateOfCharge as i64,
            )?,
            step("storage_forcible_charge_discharge_write", mode as i64)?,
        ];
        self.check_power_limit(power_w as i64, limit).await?;
        self.run_command(steps, true).await?;
        info!(?mode, power_w, %target_soc, "forcible battery operation started");
        Ok(())
    }

    /// Charge the battery at `power_w` for `duration_min` minutes.
    pub async fn forcible_charge(&self, power_w: u32, duration_min: u32) -> Result<()> {
        self.forcible(ForcibleMode::Charge, power_w, duration_min).await
    }

    pub async fn forcible_discharge(&self, power_w: u32, duration_min: u32) -> Result<()> {
        self.forcible(ForcibleMode::Discharge, power_w, duration_min)
            .await
    }

    /// Charge the battery at `power_w` until it reaches `target_soc` percent.
    pub async fn forcible_charge_soc(&self, power_w: u32, target_soc: Decimal) -> Result<()> {
        self.forcible_soc(ForcibleMode::Charge, power_w, target_soc)
            .await
    }

    pub async fn forcible_discharge_soc(&self, power_w: u32, target_soc: Decimal) -> Result<()> {
        self.forcible_soc(ForcibleMode::Discharge, power_w, target_soc)
            .await
    }

    pub async fn stop_forcible_charge(&self) -> Result<()> {
        let steps = vec![
            step(
                "storage_forcible_charge_discharge_write",
                ForcibleMode::Stop as i64,
            )?,
            step("storage_forcible_discharge_power", 0i64)?,
            step("storage_forced_charging_and_discharging_period", 0i64)?,
            step(
                "storage_forcible_charge_discharge_setting_mode",
                ForcibleTarget::Duration as i64,
            )?,
        ];
        self.run_command(steps, true).await?;
        info!("forcible battery operation stopped");
        Ok(())
    }

    async fn set_power_control_mode(&self, mode: ActivePowerControlMode) -> Result<()> {
        let steps = vec![
            step("active_power_control_mode", mode as i64)?,
            step("maximum_feed_grid_power_watt", 0i64)?,
            step("maximum_feed_grid_power_percent", 0i64)?,
        ];
        self.run_command(steps, true).await?;
        info!(?mode, "active power control mode set");
        Ok(())
    }

    /// Lift any export limit.
    pub async fn reset_maximum_feed_grid_power(&self) -> Result<()> {
        self.set_power_control_mode(ActivePowerControlMode::Unlimited)
            .await
    }

    pub async fn set_di_active_power_scheduling(&self) -> Result<()> {
        self.set_power_control_mode(ActivePowerControlMode::DiActiveScheduling)
            .await
    }

    pub async fn set_zero_power_grid_connection(&self) -> Result<()> {
        self.set_power_control_mode(ActivePowerControlMode::ZeroPowerGridConnection)
            .await
    }

    /// Limit grid export to `power_w` watts (negative values force import).
    pub async fn set_maximum_feed_grid_power(&self, power_w: i64) -> Result<()> {
        if power_w < MIN_FEED_GRID_POWER_W {
            return Err(Error::invalid(format!(
                "feed-in limit must be at least {MIN_FEED_GRID_POWER_W} W, got {power_w}"
            )));
        }
        let steps = vec![
            step("maximum_feed_grid_power_watt", power_w)?,
            step(
                "active_power_control_mode",
                ActivePowerControlMode::PowerLimitedWatt as i64,
            )?,
        ];
        self.check_power_limit(power_w, "p_max").await?;
        self.run_command(steps, true).await
    }

    /// Limit grid export to a percentage of the rated power.
    pub async fn set_maximum_feed_grid_power_percent(&self, percent: u8) -> Result<()> {
        if percent > 100 {
            return Err(Error::invalid(format!(
                "percentage must be between 0 and 100, got {percent}"
            )));
        }
        let steps = vec![
            step("maximum_feed_grid_power_percent", percent as i64)?,
            step(
                "active_power_control_mode",
                ActivePowerControlMode::PowerLimitedPercent as i64,
            )?,
        ];
        self.run_command(steps, true).await
    }

    /// Replace the time-of-use program, one `HH:MM-HH:MM/days/+|-` per line.
    pub async fn set_tou_periods(&self, text: &str) -> Result<()> {
        let periods = periods::parse_tou_periods(text)?;
        let count = periods.len();
        let steps = vec![step(
            "storage_time_of_use_charging_and_discharging_periods",
            Value::Structured(Structured::TimeOfUse(periods)),
        )?];
        self.run_command(steps, true).await?;
        info!(periods = count, "time-of-use program written");
        Ok(())
    }

    /// Replace the peak-shaving program, one `HH:MM-HH:MM/days/NNNW` per line.
    pub async fn set_capacity_control_periods(&self, text: &str) -> Result<()> {
        let periods = periods::parse_capacity_control_periods(text)?;
        let steps = vec![step(
            "storage_capacity_control_periods",
            Value::Structured(Structured::CapacityControl(periods)),
        )?];
        self.run_command(steps, true).await
    }

    /// Replace the fixed charge program, one `HH:MM-HH:MM/NNNW` per line.
    pub async fn set_fixed_charge_periods(&self, text: &str) -> Result<()> {
        let periods = periods::parse_fixed_charge_periods(text)?;
        let steps = vec![step(
            "storage_fixed_charging_and_discharging_periods",
            Value::Structured(Structured::FixedCharge(periods)),
        )?];
        self.run_command(steps, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(1440, true)]
    #[case(1441, false)]
    #[case(1500, false)]
    fn test_duration_bounds(#[case] duration: u32, #[case] ok: bool) {
        assert_eq!(check_duration(duration).is_ok(), ok);
    }

    #[rstest]
    #[case(Decimal::from_integer(11), false)]
    #[case(Decimal::from_integer(12), true)]
    #[case(Decimal::new(555, 10), true)]
    #[case(Decimal::from_integer(100), true)]
    #[case(Decimal::new(1001, 10), false)]
    fn test_target_soc_bounds(#[case] soc: Decimal, #[case] ok: bool) {
        assert_eq!(check_target_soc(soc).is_ok(), ok);
    }

    #[test]
    fn test_soc_finer_than_the_register_is_refused() {
        assert!(check_target_soc(Decimal::new(5555, 100)).is_ok());
        assert!(matches!(
            step("storage_forcible_charge_discharge_soc", Decimal::new(5555, 100)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_command_steps_encode() {
        let s = step("storage_forcible_charge_discharge_soc", Decimal::new(555, 10)).unwrap();
        assert_eq!(
            s,
            WriteStep {
                address: 47101,
                words: vec![555]
            }
        );
        let s = step("maximum_feed_grid_power_watt", -1000i64).unwrap();
        assert_eq!(s.words, vec![0xFFFF, 0xFC18]);
    }
}
