//! SCPI command dialect tables for [`super::scpi_generic::ScpiGenericDriver`].
//!
//! A `DeviceProfile` is the only thing that differs between "a Rigol
//! DL3021" and "a generic bench PSU" as far as this crate is concerned: the
//! exact `*IDN?` substrings to match, the measurement CSV query and its
//! field order, and the setpoint command templates. Everything else
//! (polling cadence, debounce, reconciliation) lives above it in
//! [`crate::session`].

use super::{Capabilities, InstrumentKind, ValueDescriptor};

/// A `{value}`-templated SCPI command, e.g. `":SOUR:VOLT:LEV {value:.3}"`.
///
/// `format_value` fills in the template; profiles keep this as plain data
/// (a format string) rather than a closure so profiles stay `'static` and
/// trivially shareable across driver instances.
#[derive(Debug, Clone, Copy)]
pub struct SetpointTemplate {
    /// Setpoint name, matching a [`ValueDescriptor::name`] in the profile's `outputs`.
    pub name: &'static str,
    /// Query command, e.g. `":SOUR:VOLT:LEV?"`.
    pub query_cmd: &'static str,
    /// Set command template; `{value}` is replaced with the value formatted to `decimals` places.
    pub set_cmd_template: &'static str,
}

impl SetpointTemplate {
    /// Renders `set_cmd_template` with `value` formatted to `decimals` places.
    pub fn render_set_cmd(&self, value: f64, decimals: u8) -> String {
        let formatted = format!("{value:.*}", decimals as usize);
        self.set_cmd_template.replace("{value}", &formatted)
    }
}

/// The complete SCPI dialect for one vendor/model family of PSU or load.
pub struct DeviceProfile {
    /// Capability payload this profile declares, e.g. `"electronic_load"`.
    pub device_class: &'static str,
    /// Device family this profile probes for.
    pub kind: InstrumentKind,
    /// Case-insensitive substring `*IDN?`'s manufacturer field must contain.
    pub manufacturer_substr: &'static str,
    /// Case-insensitive substring `*IDN?`'s model field must contain.
    pub model_substr: &'static str,
    /// Builds the declared [`Capabilities`] for this profile.
    pub capabilities: fn() -> Capabilities,
    /// Command to query the current operating mode.
    pub mode_query_cmd: &'static str,
    /// Command template to set mode; `{mode}` is replaced with the chosen wire spelling.
    pub mode_set_cmd_template: &'static str,
    /// Command to query output-enabled state.
    pub output_query_cmd: &'static str,
    /// Command to enable the output.
    pub output_on_cmd: &'static str,
    /// Command to disable the output.
    pub output_off_cmd: &'static str,
    /// CSV query returning every measurement field declared by `measurement_order`, in order.
    pub measurement_query_cmd: &'static str,
    /// Measurement field names, in the order `measurement_query_cmd`'s CSV response returns them.
    pub measurement_order: &'static [&'static str],
    /// If true and `power` is not in `measurement_order`, compute it as `voltage * current`
    ///.
    pub compute_power_from_vi: bool,
    /// Per-setpoint query/set command templates.
    pub setpoints: &'static [SetpointTemplate],
}

impl DeviceProfile {
    /// Whether a parsed `*IDN?` response matches this profile's manufacturer/model substrings.
    pub fn matches(&self, manufacturer: &str, model: &str) -> bool {
        manufacturer
            .to_ascii_uppercase()
            .contains(&self.manufacturer_substr.to_ascii_uppercase())
            && model
                .to_ascii_uppercase()
                .contains(&self.model_substr.to_ascii_uppercase())
    }

    /// Looks up the setpoint template for `name`.
    pub fn setpoint(&self, name: &str) -> Option<&SetpointTemplate> {
        self.setpoints.iter().find(|s| s.name == name)
    }
}

fn rigol_dl3021_capabilities() -> Capabilities {
    Capabilities {
        device_class: "electronic_load".to_string(),
        list_mode: true,
        remote_sensing: false,
        modes: vec!["CC".into(), "CV".into(), "CR".into(), "CP".into()],
        modes_settable: true,
        outputs: vec![
            ValueDescriptor {
                name: "voltage".into(),
                unit: "V".into(),
                decimals: 3,
                min: Some(0.0),
                max: Some(150.0),
                applicable_modes: Some(vec!["CV".into()]),
            },
            ValueDescriptor {
                name: "current".into(),
                unit: "A".into(),
                decimals: 3,
                min: Some(0.0),
                max: Some(40.0),
                applicable_modes: Some(vec!["CC".into()]),
            },
            ValueDescriptor {
                name: "resistance".into(),
                unit: "Ω".into(),
                decimals: 3,
                min: Some(0.05),
                max: Some(10_000.0),
                applicable_modes: Some(vec!["CR".into()]),
            },
            ValueDescriptor {
                name: "power".into(),
                unit: "W".into(),
                decimals: 3,
                min: Some(0.0),
                max: Some(200.0),
                applicable_modes: Some(vec!["CP".into()]),
            },
        ],
        measurements: vec![
            ValueDescriptor {
                name: "voltage".into(),
                unit: "V".into(),
                decimals: 3,
                min: None,
                max: None,
                applicable_modes: None,
            },
            ValueDescriptor {
                name: "current".into(),
                unit: "A".into(),
                decimals: 3,
                min: None,
                max: None,
                applicable_modes: None,
            },
            ValueDescriptor {
                name: "power".into(),
                unit: "W".into(),
                decimals: 3,
                min: None,
                max: None,
                applicable_modes: None,
            },
        ],
    }
}

/// Rigol DL3xxx-family electronic load dialect.
pub static RIGOL_DL3021: DeviceProfile = DeviceProfile {
    device_class: "electronic_load",
    kind: InstrumentKind::Load,
    manufacturer_substr: "RIGOL",
    model_substr: "DL3",
    capabilities: rigol_dl3021_capabilities,
    mode_query_cmd: ":SOUR:FUNC?",
    mode_set_cmd_template: ":SOUR:FUNC {mode}",
    output_query_cmd: ":SOUR:INP:STAT?",
    output_on_cmd: ":SOUR:INP:STAT ON",
    output_off_cmd: ":SOUR:INP:STAT OFF",
    measurement_query_cmd: ":MEAS:VOLT?;:MEAS:CURR?",
    measurement_order: &["voltage", "current"],
    compute_power_from_vi: true,
    setpoints: &[
        SetpointTemplate {
            name: "voltage",
            query_cmd: ":SOUR:VOLT:LEV?",
            set_cmd_template: ":SOUR:VOLT:LEV {value}",
        },
        SetpointTemplate {
            name: "current",
            query_cmd: ":SOUR:CURR:LEV?",
            set_cmd_template: ":SOUR:CURR:LEV {value}",
        },
        SetpointTemplate {
            name: "resistance",
            query_cmd: ":SOUR:RES:LEV?",
            set_cmd_template: ":SOUR:RES:LEV {value}",
        },
        SetpointTemplate {
            name: "power",
            query_cmd: ":SOUR:POW:LEV?",
            set_cmd_template: ":SOUR:POW:LEV {value}",
        },
    ],
};

fn generic_psu_capabilities() -> Capabilities {
    Capabilities {
        device_class: "power_supply".to_string(),
        list_mode: false,
        remote_sensing: false,
        modes: vec!["CV".into(), "CC".into()],
        modes_settable: false,
        outputs: vec![
            ValueDescriptor {
                name: "voltage".into(),
                unit: "V".into(),
                decimals: 3,
                min: Some(0.0),
                max: Some(60.0),
                applicable_modes: None,
            },
            ValueDescriptor {
                name: "current".into(),
                unit: "A".into(),
                decimals: 3,
                min: Some(0.0),
                max: Some(10.0),
                applicable_modes: None,
            },
        ],
        measurements: vec![
            ValueDescriptor {
                name: "voltage".into(),
                unit: "V".into(),
                decimals: 3,
                min: None,
                max: None,
                applicable_modes: None,
            },
            ValueDescriptor {
                name: "current".into(),
                unit: "A".into(),
                decimals: 3,
                min: None,
                max: None,
                applicable_modes: None,
            },
            ValueDescriptor {
                name: "power".into(),
                unit: "W".into(),
                decimals: 3,
                min: None,
                max: None,
                applicable_modes: None,
            },
        ],
    }
}

/// Fallback dialect for bench PSUs that don't need a vendor-specific profile:
/// mode is read-only (the device reports whether it's in CV or CC compliance,
/// but the client doesn't command it directly).
pub static GENERIC_PSU: DeviceProfile = DeviceProfile {
    device_class: "power_supply",
    kind: InstrumentKind::Psu,
    manufacturer_substr: "",
    model_substr: "",
    capabilities: generic_psu_capabilities,
    mode_query_cmd: ":OUTP:MODE?",
    mode_set_cmd_template: ":OUTP:MODE {mode}",
    output_query_cmd: ":OUTP?",
    output_on_cmd: ":OUTP ON",
    output_off_cmd: ":OUTP OFF",
    measurement_query_cmd: ":MEAS:VOLT?;:MEAS:CURR?",
    measurement_order: &["voltage", "current"],
    compute_power_from_vi: true,
    setpoints: &[
        SetpointTemplate {
            name: "voltage",
            query_cmd: ":SOUR:VOLT?",
            set_cmd_template: ":SOUR:VOLT {value}",
        },
        SetpointTemplate {
            name: "current",
            query_cmd: ":SOUR:CURR?",
            set_cmd_template: ":SOUR:CURR {value}",
        },
    ],
};

/// Ordered profile list tried by the registry for a newly enumerated
/// candidate interface, most-specific first.
pub fn ordered_profiles_for(kind: InstrumentKind) -> Vec<&'static DeviceProfile> {
    match kind {
        InstrumentKind::Load => vec![&RIGOL_DL3021],
        InstrumentKind::Psu => vec![&GENERIC_PSU],
        InstrumentKind::Oscilloscope => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dl3021_matches_its_worked_idn_example() {
        assert!(RIGOL_DL3021.matches("RIGOL TECHNOLOGIES", "DL3021"));
        assert!(!RIGOL_DL3021.matches("KEYSIGHT", "DL3021"));
        assert!(!RIGOL_DL3021.matches("RIGOL TECHNOLOGIES", "DS1054Z"));
    }

    #[test]
    fn setpoint_template_renders_declared_decimals() {
        let tmpl = RIGOL_DL3021.setpoint("voltage").unwrap();
        assert_eq!(tmpl.render_set_cmd(2.0, 3), ":SOUR:VOLT:LEV 2.000");
    }
}
