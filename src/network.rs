use std::process::Command;

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::{NetworkManagerConfig, ProbeKind};

// Internet connectivity as reported by the network manager
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectivity {
    Unknown,         // Status could not be determined
    ConnectedGlobal, // Full external connectivity
    Other(u32),      // Any other state (local only, connecting, asleep...)
}

impl Connectivity {
    pub fn is_connected_global(self) -> bool {
        self == Connectivity::ConnectedGlobal
    }

    // Maps a raw NetworkManager `State` value
    pub fn from_nm_state(state: u32, connected_global: u32) -> Self {
        if state == connected_global {
            Connectivity::ConnectedGlobal
        } else if state == 0 {
            Connectivity::Unknown
        } else {
            Connectivity::Other(state)
        }
    }
}

/// Answers "are we online yet?". Implementations may block; they are only
/// ever called from the resolver's background thread.
pub trait ConnectivityProbe: Send {
    fn connectivity(&mut self) -> Result<Connectivity>;
}

// Always reports the same state
#[derive(Clone, Copy, Debug)]
pub struct StaticProbe(pub Connectivity);

impl ConnectivityProbe for StaticProbe {
    fn connectivity(&mut self) -> Result<Connectivity> {
        Ok(self.0)
    }
}

/// Reads the NetworkManager state property over the system bus.
///
/// The proxy is built lazily, kept between polls, and dropped again after a
/// failed query so a NetworkManager that starts late is picked up on a later
/// poll.
pub struct NetworkManagerProbe {
    config: NetworkManagerConfig,
    proxy: Option<zbus::blocking::Proxy<'static>>,
}

impl NetworkManagerProbe {
    pub fn new(config: NetworkManagerConfig) -> Self {
        Self {
            config,
            proxy: None,
        }
    }

    fn connect(&self) -> Result<zbus::blocking::Proxy<'static>> {
        let connection = zbus::blocking::Connection::system().context("connect to system bus")?;
        zbus::blocking::Proxy::new_owned(
            connection,
            self.config.service.clone(),
            self.config.path.clone(),
            self.config.interface.clone(),
        )
        .with_context(|| format!("create proxy for {}", self.config.service))
    }

    fn read_state(&mut self) -> Result<u32> {
        if self.proxy.is_none() {
            self.proxy = Some(self.connect()?);
        }
        let Some(proxy) = self.proxy.as_ref() else {
            anyhow::bail!("system bus unavailable");
        };
        let state: u32 = proxy.get_property(&self.config.property).with_context(|| {
            format!(
                "read {}.{}",
                self.config.interface, self.config.property
            )
        })?;
        Ok(state)
    }
}

impl ConnectivityProbe for NetworkManagerProbe {
    fn connectivity(&mut self) -> Result<Connectivity> {
        match self.read_state() {
            Ok(state) => Ok(Connectivity::from_nm_state(
                state,
                self.config.connected_global,
            )),
            Err(err) => {
                self.proxy = None;
                Err(err)
            }
        }
    }
}

// Queries `nmcli` for the overall connectivity status
#[derive(Clone, Copy, Debug, Default)]
pub struct NmcliProbe;

impl ConnectivityProbe for NmcliProbe {
    fn connectivity(&mut self) -> Result<Connectivity> {
        let output = run_nmcli(&["-t", "-f", "CONNECTIVITY", "networking", "connectivity"])?;
        Ok(parse_nmcli_connectivity(&output))
    }
}

// `nmcli` reports words rather than the numeric NM_CONNECTIVITY_* values
fn parse_nmcli_connectivity(output: &str) -> Connectivity {
    match output.trim() {
        "full" => Connectivity::ConnectedGlobal,
        "none" => Connectivity::Other(1),
        "portal" => Connectivity::Other(2),
        "limited" => Connectivity::Other(3),
        _ => Connectivity::Unknown,
    }
}

// The probe named by `network_manager.probe`
pub enum SystemProbe {
    Dbus(NetworkManagerProbe),
    Nmcli(NmcliProbe),
    Online(StaticProbe),
}

impl ConnectivityProbe for SystemProbe {
    fn connectivity(&mut self) -> Result<Connectivity> {
        match self {
            SystemProbe::Dbus(probe) => probe.connectivity(),
            SystemProbe::Nmcli(probe) => probe.connectivity(),
            SystemProbe::Online(probe) => probe.connectivity(),
        }
    }
}

/// Builds the probe selected in the configuration.
pub fn probe_from_config(config: &NetworkManagerConfig) -> SystemProbe {
    debug!(probe = ?config.probe, "selecting connectivity probe");
    match config.probe {
        ProbeKind::Dbus => SystemProbe::Dbus(NetworkManagerProbe::new(config.clone())),
        ProbeKind::Nmcli => SystemProbe::Nmcli(NmcliProbe),
        ProbeKind::Online => SystemProbe::Online(StaticProbe(Connectivity::ConnectedGlobal)),
    }
}

// Run `nmcli` commands and return the standard output as a string
fn run_nmcli(args: &[&str]) -> Result<String> {
    let output = Command::new("nmcli")
        .args(args)
        .output()
        .with_context(|| format!("run nmcli {}", args.join(" ")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let message = if !stderr.is_empty() { stderr } else { stdout };
        anyhow::bail!("nmcli failed: {}", message);
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nm_state_70_is_connected_global() {
        assert_eq!(
            Connectivity::from_nm_state(70, 70),
            Connectivity::ConnectedGlobal
        );
        assert_eq!(Connectivity::from_nm_state(60, 70), Connectivity::Other(60));
        assert_eq!(Connectivity::from_nm_state(0, 70), Connectivity::Unknown);
    }

    #[test]
    fn only_full_nmcli_connectivity_counts() {
        assert!(parse_nmcli_connectivity("full\n").is_connected_global());
        assert!(!parse_nmcli_connectivity("limited").is_connected_global());
        assert!(!parse_nmcli_connectivity("portal").is_connected_global());
        assert_eq!(parse_nmcli_connectivity("???"), Connectivity::Unknown);
    }

    fn nm_config(kind: ProbeKind) -> NetworkManagerConfig {
        let mut config = crate::config::Config::embedded().unwrap().network_manager;
        config.probe = kind;
        config
    }

    #[test]
    fn connectivity_backend_follows_config() {
        assert!(matches!(
            probe_from_config(&nm_config(ProbeKind::Dbus)),
            SystemProbe::Dbus(_)
        ));
        assert!(matches!(
            probe_from_config(&nm_config(ProbeKind::Nmcli)),
            SystemProbe::Nmcli(_)
        ));
        let mut online = probe_from_config(&nm_config(ProbeKind::Online));
        assert!(matches!(online, SystemProbe::Online(_)));
        assert!(online.connectivity().unwrap().is_connected_global());
    }

    // Fails whether or not a system bus is reachable from the test
    #[test]
    fn failed_query_drops_the_proxy() {
        let mut config = nm_config(ProbeKind::Dbus);
        config.service = "org.nebula.NoSuchService".to_string();
        config.property = "NoSuchProperty".to_string();
        let mut nm = NetworkManagerProbe::new(config);
        for _ in 0..2 {
            assert!(nm.connectivity().is_err());
            assert!(nm.proxy.is_none());
        }
    }

    #[test]
    fn static_probe_reports_its_state() {
        let mut probe = StaticProbe(Connectivity::Other(20));
        assert_eq!(probe.connectivity().unwrap(), Connectivity::Other(20));
    }
}
