//! The profile-driven [`Driver`] implementation shared by every PSU/load
//! family: all vendor-specific detail lives in the
//! [`super::profile::DeviceProfile`] it's constructed with.

use super::profile::DeviceProfile;
use super::{Capabilities, Driver, DriverError, InstrumentInfo, ProbeError, StatusSample};
use crate::scpi::{self, Measurement, MODE_ENUM};
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::HashMap;

/// A PSU/load driver whose entire command dialect comes from a static
/// [`DeviceProfile`] — the Rigol DL3021 electronic load and the generic bench
/// PSU driver are both instances of this type, parameterized differently.
pub struct ScpiGenericDriver<T: Transport> {
    transport: T,
    profile: &'static DeviceProfile,
    info: Option<InstrumentInfo>,
    capabilities: Capabilities,
    /// Last-reported mode spelling style: index into the matched canonical's
    /// spellings list.
    last_mode_style: usize,
    /// Last known-good setpoints, used as the monotonic fallback on parse failure.
    last_setpoints: HashMap<String, f64>,
    /// Last known-good output-enabled state, used as the fallback on query/parse failure.
    last_output_enabled: bool,
}

impl<T: Transport> ScpiGenericDriver<T> {
    /// Builds a driver around `transport` using `profile`'s command dialect. Not yet probed.
    pub fn new(transport: T, profile: &'static DeviceProfile) -> Self {
        Self {
            transport,
            profile,
            info: None,
            capabilities: (profile.capabilities)(),
            last_mode_style: 0,
            last_setpoints: HashMap::new(),
            last_output_enabled: false,
        }
    }

    fn resolve_mode_spelling(&self, canonical: &str) -> &'static str {
        crate::scpi::TieBreakEnum::new(MODE_ENUM)
            .spellings_for(canonical)
            .and_then(|spellings| spellings.get(self.last_mode_style).copied())
            .unwrap_or(canonical)
    }

    async fn read_measurements(&mut self) -> Result<HashMap<String, Measurement>, DriverError> {
        let response = self.transport.query(self.profile.measurement_query_cmd).await?;
        let mut table = scpi::parse_measurement_csv(&response, self.profile.measurement_order);
        if self.profile.compute_power_from_vi && !table.contains_key("power") {
            let power = match (table.get("voltage"), table.get("current")) {
                (Some(Measurement::Value(v)), Some(Measurement::Value(i))) => {
                    Measurement::Value(v * i)
                }
                _ => Measurement::NotAMeasurement,
            };
            table.insert("power".to_string(), power);
        }
        Ok(table)
    }
}

#[async_trait]
impl<T: Transport> Driver for ScpiGenericDriver<T> {
    fn info(&self) -> &InstrumentInfo {
        self.info.as_ref().expect("driver used before a successful probe")
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn probe(&mut self) -> Result<(), ProbeError> {
        let response = self
            .transport
            .query("*IDN?")
            .await
            .map_err(|_| ProbeError::Timeout)?;
        let idn = scpi::Idn::parse(&response).map_err(|_| ProbeError::MalformedIdn)?;
        if !self.profile.matches(&idn.manufacturer, &idn.model) {
            return Err(ProbeError::WrongDevice);
        }
        self.info = Some(InstrumentInfo {
            id: idn.canonical_id(),
            kind: self.profile.kind,
            manufacturer: idn.manufacturer,
            model: idn.model,
            serial: idn.serial,
        });
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), DriverError> {
        self.transport.open().await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DriverError> {
        self.transport.close().await?;
        Ok(())
    }

    async fn get_status(&mut self) -> Result<StatusSample, DriverError> {
        let mode = match self.transport.query(self.profile.mode_query_cmd).await {
            Ok(raw) => match scpi::parse_enum(&raw, MODE_ENUM) {
                Ok(canonical) => {
                    let spellings = crate::scpi::TieBreakEnum::new(MODE_ENUM)
                        .spellings_for(canonical)
                        .unwrap_or(&[]);
                    if let Some(style) = spellings.iter().position(|s| s.eq_ignore_ascii_case(raw.trim())) {
                        self.last_mode_style = style;
                    }
                    Some(canonical.to_string())
                }
                Err(_) => None,
            },
            Err(_) => None,
        };

        let output_enabled = match self.transport.query(self.profile.output_query_cmd).await {
            Ok(raw) => scpi::parse_bool(&raw).unwrap_or(self.last_output_enabled),
            Err(_) => self.last_output_enabled,
        };
        self.last_output_enabled = output_enabled;

        let mut setpoints = self.last_setpoints.clone();
        for tmpl in self.profile.setpoints {
            if let Ok(raw) = self.transport.query(tmpl.query_cmd).await {
                if let Ok(value) = scpi::parse_number(&raw) {
                    setpoints.insert(tmpl.name.to_string(), value);
                }
            }
        }
        self.last_setpoints = setpoints.clone();

        let measurements = self.read_measurements().await.unwrap_or_default();

        Ok(StatusSample {
            mode,
            output_enabled,
            setpoints,
            measurements,
        })
    }

    async fn set_mode(&mut self, mode: &str) -> Result<(), DriverError> {
        if !self.capabilities.modes_settable {
            return Err(DriverError::NotSupported("set_mode".to_string()));
        }
        let spelling = self.resolve_mode_spelling(mode);
        let cmd = self.profile.mode_set_cmd_template.replace("{mode}", spelling);
        self.transport.write(&cmd).await?;
        Ok(())
    }

    async fn set_output(&mut self, enabled: bool) -> Result<(), DriverError> {
        let cmd = if enabled {
            self.profile.output_on_cmd
        } else {
            self.profile.output_off_cmd
        };
        self.transport.write(cmd).await?;
        Ok(())
    }

    async fn set_value(&mut self, name: &str, value: f64) -> Result<(), DriverError> {
        let tmpl = self
            .profile
            .setpoint(name)
            .ok_or_else(|| DriverError::UnknownField(name.to_string()))?;
        let decimals = self
            .capabilities
            .outputs
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.decimals)
            .unwrap_or(3);
        let cmd = tmpl.render_set_cmd(value, decimals);
        self.transport.write(&cmd).await?;
        self.last_setpoints.insert(name.to_string(), value);
        Ok(())
    }

    async fn get_value(&mut self, name: &str) -> Result<f64, DriverError> {
        let tmpl = self
            .profile
            .setpoint(name)
            .ok_or_else(|| DriverError::UnknownField(name.to_string()))?;
        let raw = self.transport.query(tmpl.query_cmd).await?;
        Ok(scpi::parse_number(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::profile::RIGOL_DL3021;
    use super::*;
    use crate::transport::mock::MockTransport;

    fn dl3021_transport() -> MockTransport {
        let mut t = MockTransport::new();
        t.set_response("*IDN?", "RIGOL TECHNOLOGIES,DL3021,DL3A123456789,00.01.02");
        t.set_response(":SOUR:FUNC?", "CV");
        t.set_response(":SOUR:INP:STAT?", "ON");
        t.set_response(":MEAS:VOLT?;:MEAS:CURR?", "12.000,1.500");
        t.set_response(":SOUR:VOLT:LEV?", "12.000");
        t.set_response(":SOUR:CURR:LEV?", "1.500");
        t.set_response(":SOUR:RES:LEV?", "1.000");
        t.set_response(":SOUR:POW:LEV?", "18.000");
        t
    }

    #[tokio::test]
    async fn probe_and_status_match_worked_example() {
        let mut driver = ScpiGenericDriver::new(dl3021_transport(), &RIGOL_DL3021);
        driver.probe().await.unwrap();
        assert_eq!(driver.info().id, "rigol technologies-dl3021-dl3a123456789");

        let status = driver.get_status().await.unwrap();
        assert_eq!(status.mode.as_deref(), Some("CV"));
        assert!(status.output_enabled);
        assert_eq!(status.measurements["voltage"], Measurement::Value(12.0));
        assert_eq!(status.measurements["current"], Measurement::Value(1.5));
        assert_eq!(status.measurements["power"], Measurement::Value(18.0));
    }

    #[tokio::test]
    async fn probe_rejects_wrong_device_class() {
        let mut t = MockTransport::new();
        t.set_response("*IDN?", "RIGOL TECHNOLOGIES,DS1054Z,DS1ZA000001,00.01.02");
        let mut driver = ScpiGenericDriver::new(t, &RIGOL_DL3021);
        assert_eq!(driver.probe().await, Err(ProbeError::WrongDevice));
    }

    #[tokio::test]
    async fn set_value_renders_declared_decimals_and_updates_fallback() {
        let mut driver = ScpiGenericDriver::new(dl3021_transport(), &RIGOL_DL3021);
        driver.probe().await.unwrap();
        driver.set_value("voltage", 2.0).await.unwrap();
        assert_eq!(driver.last_setpoints["voltage"], 2.0);
    }

    #[tokio::test]
    async fn unknown_field_is_rejected_before_any_transport_call() {
        let mut driver = ScpiGenericDriver::new(dl3021_transport(), &RIGOL_DL3021);
        driver.probe().await.unwrap();
        assert!(matches!(
            driver.set_value("bogus", 1.0).await,
            Err(DriverError::UnknownField(_))
        ));
    }
}
