//! Bit-mask tables for the state and alarm bitfield registers.

use super::BitFlag;

const fn flag(name: &'static str, bit: u32) -> BitFlag {
    BitFlag {
        name,
        mask: 1 << bit,
    }
}

pub static STATE_1: &[BitFlag] = &[
    flag("standby", 0),
    flag("grid_connected", 1),
    flag("grid_connected_normally", 2),
    flag("derating_power_rationing", 3),
    flag("derating_internal_causes", 4),
    flag("normal_stop", 5),
    flag("stop_due_to_faults", 6),
    flag("stop_due_to_power_rationing", 7),
    flag("shutdown", 8),
    flag("spot_check", 9),
];

pub static STATE_2: &[BitFlag] = &[
    flag("unlocked", 0),
    flag("pv_connected", 1),
    flag("dsp_data_collection", 2),
];

pub static STATE_3: &[BitFlag] = &[flag("off_grid", 0), flag("off_grid_switch_enabled", 1)];

pub static ALARM_1: &[BitFlag] = &[
    flag("high_string_input_voltage", 0),
    flag("dc_arc_fault", 1),
    flag("string_reverse_connection", 2),
    flag("string_current_backfeed", 3),
    flag("abnormal_string_power", 4),
    flag("afci_self_check_fail", 5),
    flag("phase_wire_short_circuited_to_pe", 6),
    flag("grid_loss", 7),
    flag("grid_undervoltage", 8),
    flag("grid_overvoltage", 9),
    flag("grid_voltage_imbalance", 10),
    flag("grid_overfrequency", 11),
    flag("grid_underfrequency", 12),
    flag("unstable_grid_frequency", 13),
    flag("output_overcurrent", 14),
    flag("output_dc_component_overhigh", 15),
];

pub static ALARM_2: &[BitFlag] = &[
    flag("abnormal_residual_current", 0),
    flag("abnormal_grounding", 1),
    flag("low_insulation_resistance", 2),
    flag("overtemperature", 3),
    flag("device_fault", 4),
    flag("upgrade_failed_or_version_mismatch", 5),
    flag("license_expired", 6),
    flag("faulty_monitoring_unit", 7),
    flag("faulty_power_collector", 8),
    flag("battery_abnormal", 9),
    flag("active_islanding", 10),
    flag("passive_islanding", 11),
    flag("transient_ac_overvoltage", 12),
    flag("peripheral_port_short_circuit", 13),
    flag("churn_output_overload", 14),
    flag("abnormal_pv_module_configuration", 15),
];

pub static ALARM_3: &[BitFlag] = &[
    flag("optimizer_fault", 0),
    flag("built_in_pid_operation_abnormal", 1),
    flag("high_input_string_voltage_to_ground", 2),
    flag("external_fan_abnormal", 3),
    flag("battery_reverse_connection", 4),
    flag("on_off_grid_controller_abnormal", 5),
    flag("pv_string_loss", 6),
    flag("internal_fan_abnormal", 7),
    flag("dc_protection_unit_abnormal", 8),
];
