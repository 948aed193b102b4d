//! Static SUN2000 register table.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use super::flags;
use super::{DataType, Layout, RegisterDescriptor};
use crate::error::{Error, Result};

const fn uint(name: &'static str, address: u16, length: u16, scale: u32) -> RegisterDescriptor {
    RegisterDescriptor::new(name, address, length, DataType::UInt, scale)
}

const fn int(name: &'static str, address: u16, length: u16, scale: u32) -> RegisterDescriptor {
    RegisterDescriptor::new(name, address, length, DataType::Int, scale)
}

const fn text(name: &'static str, address: u16, length: u16) -> RegisterDescriptor {
    RegisterDescriptor::new(name, address, length, DataType::Text, 1)
}

const fn bits(
    name: &'static str,
    address: u16,
    length: u16,
    table: &'static [super::BitFlag],
) -> RegisterDescriptor {
    RegisterDescriptor::new(name, address, length, DataType::Bitfield(table), 1)
}

const fn structured(name: &'static str, address: u16, length: u16, layout: Layout) -> RegisterDescriptor {
    RegisterDescriptor::new(name, address, length, DataType::Structured(layout), 1)
}

/// Register the device polls to keep an elevated session alive.
pub const HEARTBEAT_REGISTER: u16 = 49999;

static REGISTERS: &[RegisterDescriptor] = &[
    // identity and nameplate
    text("model_name", 30000, 15),
    text("serial_number", 30015, 10),
    text("product_number", 30025, 10),
    uint("model_id", 30070, 1, 1),
    uint("nb_pv_strings", 30071, 1, 1),
    uint("nb_mpp_tracks", 30072, 1, 1),
    uint("rated_power", 30073, 2, 1).unit("W"),
    uint("p_max", 30075, 2, 1).unit("W"),
    uint("s_max", 30077, 2, 1).unit("VA"),
    int("q_max_out", 30079, 2, 1).unit("var"),
    int("q_max_in", 30081, 2, 1).unit("var"),
    // state and alarms
    bits("state_1", 32000, 1, flags::STATE_1),
    bits("state_2", 32002, 1, flags::STATE_2),
    bits("state_3", 32003, 2, flags::STATE_3),
    bits("alarm_1", 32008, 1, flags::ALARM_1),
    bits("alarm_2", 32009, 1, flags::ALARM_2),
    bits("alarm_3", 32010, 1, flags::ALARM_3),
    // PV strings
    int("pv_01_voltage", 32016, 1, 10).unit("V"),
    int("pv_01_current", 32017, 1, 100).unit("A"),
    int("pv_02_voltage", 32018, 1, 10).unit("V"),
    int("pv_02_current", 32019, 1, 100).unit("A"),
    int("pv_03_voltage", 32020, 1, 10).unit("V"),
    int("pv_03_current", 32021, 1, 100).unit("A"),
    int("pv_04_voltage", 32022, 1, 10).unit("V"),
    int("pv_04_current", 32023, 1, 100).unit("A"),
    // AC side
    int("input_power", 32064, 2, 1).unit("W"),
    uint("line_voltage_a_b", 32066, 1, 10).unit("V"),
    uint("line_voltage_b_c", 32067, 1, 10).unit("V"),
    uint("line_voltage_c_a", 32068, 1, 10).unit("V"),
    uint("phase_a_voltage", 32069, 1, 10).unit("V"),
    uint("phase_b_voltage", 32070, 1, 10).unit("V"),
    uint("phase_c_voltage", 32071, 1, 10).unit("V"),
    int("phase_a_current", 32072, 2, 1000).unit("A"),
    int("phase_b_current", 32074, 2, 1000).unit("A"),
    int("phase_c_current", 32076, 2, 1000).unit("A"),
    int("day_active_power_peak", 32078, 2, 1).unit("W"),
    int("active_power", 32080, 2, 1).unit("W"),
    int("reactive_power", 32082, 2, 1).unit("var"),
    int("power_factor", 32084, 1, 1000),
    uint("grid_frequency", 32085, 1, 100).unit("Hz"),
    uint("efficiency", 32086, 1, 100).unit("%"),
    int("internal_temperature", 32087, 1, 10).unit("°C"),
    uint("insulation_resistance", 32088, 1, 1000).unit("MΩ"),
    uint("device_status", 32089, 1, 1),
    uint("fault_code", 32090, 1, 1),
    structured("startup_time", 32091, 2, Layout::EpochSeconds),
    structured("shutdown_time", 32093, 2, Layout::EpochSeconds),
    uint("accumulated_yield_energy", 32106, 2, 100).unit("kWh"),
    uint("daily_yield_energy", 32114, 2, 100).unit("kWh"),
    // LUNA2000 unit 1
    uint("storage_unit_1_running_status", 37000, 1, 1),
    int("storage_unit_1_charge_discharge_power", 37001, 2, 1).unit("W"),
    uint("storage_unit_1_bus_voltage", 37003, 1, 10).unit("V"),
    uint("storage_unit_1_state_of_capacity", 37004, 1, 10).unit("%"),
    uint("storage_unit_1_working_mode_b", 37006, 1, 1),
    uint("storage_unit_1_rated_charge_power", 37007, 2, 1).unit("W"),
    uint("storage_unit_1_rated_discharge_power", 37009, 2, 1).unit("W"),
    uint("storage_unit_1_fault_id", 37014, 1, 1),
    uint("storage_unit_1_current_day_charge_capacity", 37015, 2, 100).unit("kWh"),
    uint("storage_unit_1_current_day_discharge_capacity", 37017, 2, 100).unit("kWh"),
    int("storage_unit_1_bus_current", 37021, 1, 10).unit("A"),
    int("storage_unit_1_battery_temperature", 37022, 1, 10).unit("°C"),
    uint("storage_unit_1_remaining_charge_dis_charge_time", 37025, 1, 1).unit("min"),
    uint("storage_maximum_charge_power", 37046, 2, 1).unit("W"),
    uint("storage_maximum_discharge_power", 37048, 2, 1).unit("W"),
    uint("storage_unit_1_total_charge", 37066, 2, 100).unit("kWh"),
    uint("storage_unit_1_total_discharge", 37068, 2, 100).unit("kWh"),
    // power meter
    uint("meter_status", 37100, 1, 1),
    int("grid_a_voltage", 37101, 2, 10).unit("V"),
    int("grid_b_voltage", 37103, 2, 10).unit("V"),
    int("grid_c_voltage", 37105, 2, 10).unit("V"),
    int("active_grid_a_current", 37107, 2, 100).unit("A"),
    int("active_grid_b_current", 37109, 2, 100).unit("A"),
    int("active_grid_c_current", 37111, 2, 100).unit("A"),
    int("power_meter_active_power", 37113, 2, 1).unit("W"),
    int("power_meter_reactive_power", 37115, 2, 1).unit("var"),
    int("active_grid_power_factor", 37117, 1, 1000),
    int("active_grid_frequency", 37118, 1, 100).unit("Hz"),
    int("grid_exported_energy", 37119, 2, 100).unit("kWh"),
    int("grid_accumulated_energy", 37121, 2, 100).unit("kWh"),
    int("grid_accumulated_reactive_power", 37123, 2, 100).unit("kvarh"),
    uint("meter_type", 37125, 1, 1),
    int("active_grid_a_b_voltage", 37126, 2, 10).unit("V"),
    int("active_grid_b_c_voltage", 37128, 2, 10).unit("V"),
    int("active_grid_c_a_voltage", 37130, 2, 10).unit("V"),
    int("active_grid_a_power", 37132, 2, 1).unit("W"),
    int("active_grid_b_power", 37134, 2, 1).unit("W"),
    int("active_grid_c_power", 37136, 2, 1).unit("W"),
    // optimizers
    uint("nb_optimizers", 37200, 1, 1),
    uint("nb_online_optimizers", 37201, 1, 1),
    // LUNA2000 aggregate
    uint("storage_rated_capacity", 37758, 2, 1).unit("Wh"),
    uint("storage_state_of_capacity", 37760, 1, 10).unit("%"),
    uint("storage_running_status", 37762, 1, 1),
    uint("storage_bus_voltage", 37763, 1, 10).unit("V"),
    int("storage_bus_current", 37764, 1, 10).unit("A"),
    int("storage_charge_discharge_power", 37765, 2, 1).unit("W"),
    uint("storage_total_charge", 37780, 2, 100).unit("kWh"),
    uint("storage_total_discharge", 37782, 2, 100).unit("kWh"),
    uint("storage_current_day_charge_capacity", 37784, 2, 100).unit("kWh"),
    uint("storage_current_day_discharge_capacity", 37786, 2, 100).unit("kWh"),
    // system settings
    structured("system_time", 40000, 2, Layout::EpochSeconds).writable(),
    int("active_power_percentage_derating", 40125, 1, 10).unit("%").writable(),
    uint("active_power_fixed_value_derating", 40126, 2, 1).unit("W").writable(),
    uint("startup", 40200, 1, 1).writable(),
    uint("shutdown", 40201, 1, 1).writable(),
    // battery configuration
    uint("storage_maximum_charging_power", 47075, 2, 1).unit("W").writable(),
    uint("storage_maximum_discharging_power", 47077, 2, 1).unit("W").writable(),
    int("storage_power_limit_grid_tied_point", 47079, 2, 1).unit("W").writable(),
    uint("storage_charging_cutoff_capacity", 47081, 1, 10).unit("%").writable(),
    uint("storage_discharging_cutoff_capacity", 47082, 1, 10).unit("%").writable(),
    uint("storage_forced_charging_and_discharging_period", 47083, 1, 1).unit("min").writable(),
    uint("storage_working_mode_settings", 47086, 1, 1).writable(),
    uint("storage_charge_from_grid_function", 47087, 1, 1).writable(),
    uint("storage_grid_charge_cutoff_state_of_charge", 47088, 1, 10).unit("%").writable(),
    uint("storage_forcible_charge_discharge_write", 47100, 1, 1).writable(),
    uint("storage_forcible_charge_discharge_soc", 47101, 1, 10).unit("%").writable(),
    uint("storage_backup_power_state_of_charge", 47102, 1, 10).unit("%").writable(),
    structured("storage_fixed_charging_and_discharging_periods", 47200, 41, Layout::FixedCharge)
        .writable(),
    uint("storage_power_of_charge_from_grid", 47242, 2, 1).unit("W").writable(),
    uint("storage_maximum_power_of_charge_from_grid", 47244, 2, 1).unit("W").writable(),
    uint("storage_forcible_charge_discharge_setting_mode", 47246, 1, 1).writable(),
    uint("storage_forcible_charge_power", 47247, 2, 1).unit("W").writable(),
    uint("storage_forcible_discharge_power", 47249, 2, 1).unit("W").writable(),
    structured(
        "storage_time_of_use_charging_and_discharging_periods",
        47255,
        43,
        Layout::TimeOfUse,
    )
    .writable(),
    uint("storage_excess_pv_energy_use_in_tou", 47299, 1, 1).writable(),
    uint("active_power_control_mode", 47415, 1, 1).writable(),
    int("maximum_feed_grid_power_watt", 47416, 2, 1).unit("W").writable(),
    int("maximum_feed_grid_power_percent", 47418, 1, 10).unit("%").writable(),
    uint("storage_capacity_control_mode", 47954, 1, 1).writable(),
    uint("storage_capacity_control_soc_peak_shaving", 47955, 1, 10).unit("%").writable(),
    structured("storage_capacity_control_periods", 47956, 57, Layout::CapacityControl).writable(),
    uint("heartbeat", HEARTBEAT_REGISTER, 1, 1).writable(),
];

static INDEX: Lazy<HashMap<&'static str, &'static RegisterDescriptor>> =
    Lazy::new(|| REGISTERS.iter().map(|d| (d.name, d)).collect());

/// Look up a quantity by name.
pub fn lookup(name: &str) -> Result<&'static RegisterDescriptor> {
    INDEX
        .get(name)
        .copied()
        .ok_or_else(|| Error::UnknownQuantity(name.to_string()))
}

pub fn all() -> &'static [RegisterDescriptor] {
    REGISTERS
}

pub fn names() -> impl Iterator<Item = &'static str> {
    REGISTERS.iter().map(|d| d.name)
}

/// Address range `[first, end)` covering all of `descriptors`.
pub fn span_of(descriptors: &[&RegisterDescriptor]) -> Option<(u16, u32)> {
    let first = descriptors.iter().map(|d| d.address).min()?;
    let end = descriptors.iter().map(|d| d.end()).max()?;
    Some((first, end))
}

pub(crate) static INVERTER_GROUP: &[&str] = &[
    "input_power",
    "line_voltage_a_b",
    "line_voltage_b_c",
    "line_voltage_c_a",
    "phase_a_voltage",
    "phase_b_voltage",
    "phase_c_voltage",
    "phase_a_current",
    "phase_b_current",
    "phase_c_current",
    "day_active_power_peak",
    "active_power",
    "reactive_power",
    "power_factor",
    "grid_frequency",
    "efficiency",
    "internal_temperature",
    "insulation_resistance",
    "device_status",
    "fault_code",
    "accumulated_yield_energy",
    "daily_yield_energy",
    "state_1",
    "alarm_1",
    "alarm_2",
    "alarm_3",
];

pub(crate) static POWER_METER_GROUP: &[&str] = &[
    "meter_status",
    "grid_a_voltage",
    "grid_b_voltage",
    "grid_c_voltage",
    "active_grid_a_current",
    "active_grid_b_current",
    "active_grid_c_current",
    "power_meter_active_power",
    "power_meter_reactive_power",
    "active_grid_power_factor",
    "active_grid_frequency",
    "grid_exported_energy",
    "grid_accumulated_energy",
];

pub(crate) static BATTERY_GROUP: &[&str] = &[
    "storage_state_of_capacity",
    "storage_running_status",
    "storage_bus_voltage",
    "storage_bus_current",
    "storage_charge_discharge_power",
    "storage_total_charge",
    "storage_total_discharge",
    "storage_current_day_charge_capacity",
    "storage_current_day_discharge_capacity",
];

pub(crate) static CONFIGURATION_GROUP: &[&str] = &[
    "storage_maximum_charging_power",
    "storage_maximum_discharging_power",
    "storage_charging_cutoff_capacity",
    "storage_discharging_cutoff_capacity",
    "storage_forced_charging_and_discharging_period",
    "storage_working_mode_settings",
    "storage_charge_from_grid_function",
    "storage_grid_charge_cutoff_state_of_charge",
    "storage_forcible_charge_discharge_write",
    "storage_forcible_charge_discharge_soc",
    "storage_backup_power_state_of_charge",
    "storage_forcible_charge_discharge_setting_mode",
    "storage_time_of_use_charging_and_discharging_periods",
    "active_power_control_mode",
    "maximum_feed_grid_power_watt",
    "maximum_feed_grid_power_percent",
];

pub(crate) static OPTIMIZER_GROUP: &[&str] = &["nb_optimizers", "nb_online_optimizers"];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{Access, PollGroup};
    use std::collections::HashSet;
    use strum::IntoEnumIterator;

    #[test]
    fn test_lookup_active_power() {
        let d = lookup("active_power").unwrap();
        assert_eq!(d.address, 32080);
        assert_eq!(d.length, 2);
        assert_eq!(d.data_type, DataType::Int);
        assert_eq!(d.scale, 1);
        assert_eq!(d.access, Access::Read);
    }

    #[test]
    fn test_unknown_quantity() {
        assert_eq!(
            lookup("flux_capacitor").unwrap_err(),
            Error::UnknownQuantity("flux_capacitor".into())
        );
    }

    #[test]
    fn test_names_are_unique() {
        let unique: HashSet<&str> = names().collect();
        assert_eq!(unique.len(), all().len());
    }

    #[test]
    fn test_no_overlapping_spans() {
        let mut sorted: Vec<&RegisterDescriptor> = all().iter().collect();
        sorted.sort_by_key(|d| d.address);
        for pair in sorted.windows(2) {
            assert!(
                pair[0].end() <= pair[1].address as u32,
                "{} overlaps {}",
                pair[0].name,
                pair[1].name
            );
        }
    }

    #[test]
    fn test_structured_lengths_match_layouts() {
        for d in all() {
            if let DataType::Structured(layout) = d.data_type {
                let expected = match layout {
                    Layout::EpochSeconds => 2,
                    Layout::TimeOfUse => 43,
                    Layout::FixedCharge => 41,
                    Layout::CapacityControl => 57,
                };
                assert_eq!(d.length, expected, "{}", d.name);
            }
        }
    }

    #[test]
    fn test_integer_registers_span_one_to_four_words() {
        for d in all() {
            if matches!(d.data_type, DataType::UInt | DataType::Int) {
                assert!((1..=4).contains(&d.length), "{} spans {}", d.name, d.length);
            }
        }
    }

    #[test]
    fn test_writable_registers_are_privileged() {
        for d in all() {
            assert_eq!(d.is_writable(), d.privileged, "{}", d.name);
        }
    }

    #[test]
    fn test_span_of() {
        let a = lookup("active_power").unwrap();
        let b = lookup("power_factor").unwrap();
        assert_eq!(span_of(&[b, a]), Some((32080, 32085)));
        assert_eq!(span_of(&[]), None);
    }

    #[test]
    fn test_poll_groups_resolve() {
        for group in PollGroup::iter() {
            for name in group.quantities() {
                assert!(lookup(name).is_ok(), "{group}: {name}");
            }
        }
    }

    #[test]
    fn test_optimizer_counters_poll_on_their_own() {
        assert_eq!(
            PollGroup::Optimizers.quantities(),
            &["nb_optimizers", "nb_online_optimizers"]
        );
        assert_eq!(
            PollGroup::Optimizers.default_interval(),
            std::time::Duration::from_secs(5 * 60)
        );
        assert!(PollGroup::Inverter
            .quantities()
            .iter()
            .all(|name| !name.contains("optimizers")));
    }
}
