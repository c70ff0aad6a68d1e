//! Registry/Scanner: enumerates candidate interfaces and
//! attempts driver probes in priority order.
//!
//! Probing is a linear search over an ordered profile list, most-specific
//! profile first, falling back to a catch-all. Unlike a registry dispatching
//! on a caller-supplied instrument-type string, this scanner identifies
//! devices purely from what they answer to `*IDN?`.

use super::profile::{DeviceProfile, GENERIC_PSU, RIGOL_DL3021};
use super::scpi_generic::ScpiGenericDriver;
use super::scope::{GenericScpiScope, ScopeCapabilities, ScopeDriver};
use super::{Driver, ProbeError};
use crate::scpi;
use crate::transport::Transport;
use tracing::{info, warn};

/// Ordered PSU/load profile list, most-specific first. `GENERIC_PSU`'s empty
/// match substrings make it accept anything, so it must stay last.
fn ordered_psu_load_profiles() -> &'static [&'static DeviceProfile] {
    static PROFILES: [&DeviceProfile; 2] = [&RIGOL_DL3021, &GENERIC_PSU];
    &PROFILES
}

/// Tries candidate interfaces against the known PSU/load and oscilloscope
/// profiles in priority order, treating `WrongDevice`/`Timeout`/`MalformedIdn`
/// as "try the next profile" rather than a scan-ending failure.
pub struct Scanner {
    psu_load_profiles: Vec<&'static DeviceProfile>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            psu_load_profiles: ordered_psu_load_profiles().to_vec(),
        }
    }
}

impl Scanner {
    /// Builds a scanner with the default profile priority order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes `transport` as a PSU or electronic load: opens it, reads
    /// `*IDN?` once, then matches the parsed identity against each profile
    /// in priority order. Returns the first match, constructed into a driver
    /// and fully probed.
    pub async fn probe_psu_or_load<T: Transport + 'static>(
        &self,
        mut transport: T,
    ) -> Result<Box<dyn Driver>, ProbeError> {
        transport.open().await.map_err(|_| ProbeError::Timeout)?;
        let response = transport.query("*IDN?").await.map_err(|_| ProbeError::Timeout)?;
        let idn = scpi::Idn::parse(&response).map_err(|_| ProbeError::MalformedIdn)?;

        let profile = self
            .psu_load_profiles
            .iter()
            .find(|p| p.matches(&idn.manufacturer, &idn.model))
            .ok_or(ProbeError::WrongDevice)?;

        let mut driver = ScpiGenericDriver::new(transport, profile);
        driver.probe().await?;
        info!(id = %driver.info().id, class = profile.device_class, "probed device");
        Ok(Box::new(driver))
    }

    /// Probes `transport` as an oscilloscope, no profile matching needed
    /// beyond a successful `*IDN?` (scope dialect is declared by the caller
    /// via `capabilities`, since unlike PSU/load there's no competing family
    /// to disambiguate against in this crate's scope coverage).
    pub async fn probe_scope<T: Transport + 'static>(
        &self,
        mut transport: T,
        capabilities: ScopeCapabilities,
    ) -> Result<Box<dyn ScopeDriver>, ProbeError> {
        transport.open().await.map_err(|_| ProbeError::Timeout)?;
        let mut driver = GenericScpiScope::new(transport, capabilities);
        driver.probe().await?;
        info!(id = %driver.info().id, "probed scope");
        Ok(Box::new(driver))
    }
}

/// Attempts every candidate in `transports`, collecting successful probes
/// and logging (not failing the whole scan on) each rejection: a scan
/// result is partial by nature.
pub async fn scan_psu_load_candidates<T, I>(scanner: &Scanner, transports: I) -> Vec<Box<dyn Driver>>
where
    T: Transport + 'static,
    I: IntoIterator<Item = T>,
{
    let mut drivers = Vec::new();
    for transport in transports {
        match scanner.probe_psu_or_load(transport).await {
            Ok(driver) => drivers.push(driver),
            Err(e) => warn!(error = %e, "candidate interface rejected during scan"),
        }
    }
    drivers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn mock_with_idn(idn: &str) -> MockTransport {
        let mut t = MockTransport::new();
        t.set_response("*IDN?", idn);
        t
    }

    #[tokio::test]
    async fn scanner_prefers_specific_profile_over_catch_all() {
        let scanner = Scanner::new();
        let driver = scanner
            .probe_psu_or_load(mock_with_idn("RIGOL TECHNOLOGIES,DL3021,DL3A123456789,00.01.02"))
            .await
            .unwrap();
        assert_eq!(driver.capabilities().device_class, "electronic_load");
    }

    #[tokio::test]
    async fn scanner_falls_back_to_generic_psu() {
        let scanner = Scanner::new();
        let driver = scanner
            .probe_psu_or_load(mock_with_idn("ACME,BenchPSU-30,SN0001,1.0"))
            .await
            .unwrap();
        assert_eq!(driver.capabilities().device_class, "power_supply");
    }

    #[tokio::test]
    async fn scan_candidates_skips_rejected_interfaces_without_failing_whole_scan() {
        let scanner = Scanner::new();
        let good = mock_with_idn("RIGOL TECHNOLOGIES,DL3021,DL3A1,00.01");
        let mut bad = MockTransport::new();
        bad.set_response("*IDN?", "");
        let drivers = scan_psu_load_candidates(&scanner, vec![good, bad]).await;
        assert_eq!(drivers.len(), 1);
    }
}
