//! Where absolute interface counters come from.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use compact_str::CompactString;
use parking_lot::Mutex;
use sysinfo::Networks;

use crate::config::{SamplerConfig, SamplerSourceKind};
use crate::error::{SamplerError, SamplerResult};

/// ARPHRD_LOOPBACK
const ARPHRD_LOOPBACK: u32 = 772;

/// Static facts about one interface, as seen at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: CompactString,
    pub description: Option<String>,
    pub is_up: bool,
    pub is_loopback: bool,
}

/// Absolute byte counters since the interface came up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub sent_bytes: u64,
    pub received_bytes: u64,
}

/// Enumerates interfaces and reads their counters.
///
/// Counters are read one interface at a time so a single failure only costs
/// that interface its sample.
pub trait InterfaceSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn list_interfaces(&self) -> SamplerResult<Vec<InterfaceInfo>>;

    fn read_counters(&self, interface: &str) -> SamplerResult<Counters>;
}

/// Build the source selected in configuration.
pub fn from_config(config: &SamplerConfig) -> Box<dyn InterfaceSource> {
    match config.source {
        SamplerSourceKind::Sysfs => Box::new(SysfsInterfaceSource::new(&config.sysfs_root)),
        SamplerSourceKind::Sysinfo => Box::new(SysinfoInterfaceSource::new()),
    }
}

// ----------------------------------------------------------------------------
// sysfs
// ----------------------------------------------------------------------------

/// Reads `/sys/class/net/<iface>/{operstate,type,ifalias,statistics/*}`.
pub struct SysfsInterfaceSource {
    root: PathBuf,
}

impl SysfsInterfaceSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_trimmed(path: &Path) -> Option<String> {
        fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn read_counter(&self, interface: &str, counter: &str) -> SamplerResult<u64> {
        let path = self.root.join(interface).join("statistics").join(counter);
        let raw = fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound if !self.root.join(interface).exists() => SamplerError::Vanished {
                interface: interface.to_string(),
            },
            _ => SamplerError::read_failed(interface, format!("{}: {}", path.display(), e)),
        })?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| SamplerError::read_failed(interface, format!("{counter}: {e}")))
    }
}

impl InterfaceSource for SysfsInterfaceSource {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn list_interfaces(&self) -> SamplerResult<Vec<InterfaceInfo>> {
        let entries = fs::read_dir(&self.root).map_err(|e| SamplerError::EnumerationFailed {
            source_name: self.root.display().to_string(),
            message: e.to_string(),
        })?;

        let mut interfaces = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let dir = entry.path();

            let operstate = Self::read_trimmed(&dir.join("operstate")).unwrap_or_default();
            let is_loopback = Self::read_trimmed(&dir.join("type"))
                .and_then(|t| t.parse::<u32>().ok())
                .map(|t| t == ARPHRD_LOOPBACK)
                .unwrap_or(false);

            interfaces.push(InterfaceInfo {
                name: CompactString::from(name),
                description: Self::read_trimmed(&dir.join("ifalias")),
                // Links without carrier detection (tun, wireguard) report "unknown"
                is_up: operstate == "up" || operstate == "unknown",
                is_loopback,
            });
        }

        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(interfaces)
    }

    fn read_counters(&self, interface: &str) -> SamplerResult<Counters> {
        Ok(Counters {
            sent_bytes: self.read_counter(interface, "tx_bytes")?,
            received_bytes: self.read_counter(interface, "rx_bytes")?,
        })
    }
}

// ----------------------------------------------------------------------------
// sysinfo
// ----------------------------------------------------------------------------

/// Portable fallback. Has no operational state or description, so every
/// listed interface counts as up and only `lo` as loopback.
pub struct SysinfoInterfaceSource {
    networks: Mutex<Networks>,
}

impl SysinfoInterfaceSource {
    pub fn new() -> Self {
        Self {
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }
}

impl Default for SysinfoInterfaceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceSource for SysinfoInterfaceSource {
    fn name(&self) -> &'static str {
        "sysinfo"
    }

    fn list_interfaces(&self) -> SamplerResult<Vec<InterfaceInfo>> {
        let mut networks = self.networks.lock();
        networks.refresh_list();

        let mut interfaces: Vec<InterfaceInfo> = networks
            .iter()
            .map(|(name, _)| InterfaceInfo {
                name: CompactString::from(name.as_str()),
                description: None,
                is_up: true,
                is_loopback: name == "lo",
            })
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(interfaces)
    }

    fn read_counters(&self, interface: &str) -> SamplerResult<Counters> {
        let networks = self.networks.lock();
        networks
            .iter()
            .find(|(name, _)| name.as_str() == interface)
            .map(|(_, data)| Counters {
                sent_bytes: data.total_transmitted(),
                received_bytes: data.total_received(),
            })
            .ok_or_else(|| SamplerError::Vanished {
                interface: interface.to_string(),
            })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Lay out a fake `/sys/class/net` entry.
    pub fn write_iface(root: &Path, name: &str, operstate: &str, kind: u32, tx: u64, rx: u64) {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("statistics")).unwrap();
        fs::write(dir.join("operstate"), format!("{operstate}\n")).unwrap();
        fs::write(dir.join("type"), format!("{kind}\n")).unwrap();
        set_counters(root, name, tx, rx);
    }

    pub fn set_counters(root: &Path, name: &str, tx: u64, rx: u64) {
        let stats = root.join(name).join("statistics");
        fs::write(stats.join("tx_bytes"), format!("{tx}\n")).unwrap();
        fs::write(stats.join("rx_bytes"), format!("{rx}\n")).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sysfs_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        write_iface(dir.path(), "eth0", "up", 1, 1_000, 2_000);
        write_iface(dir.path(), "lo", "unknown", ARPHRD_LOOPBACK, 5, 5);
        write_iface(dir.path(), "wlan0", "down", 1, 0, 0);
        fs::write(dir.path().join("eth0").join("ifalias"), "uplink\n").unwrap();

        let source = SysfsInterfaceSource::new(dir.path());
        let interfaces = source.list_interfaces().unwrap();

        let names: Vec<_> = interfaces.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["eth0", "lo", "wlan0"]);
        assert_eq!(interfaces[0].description.as_deref(), Some("uplink"));
        assert!(interfaces[1].is_loopback);
        assert!(!interfaces[2].is_up);
    }

    #[test]
    fn test_sysfs_counters() {
        let dir = tempfile::tempdir().unwrap();
        write_iface(dir.path(), "eth0", "up", 1, 1_000, 2_000);

        let source = SysfsInterfaceSource::new(dir.path());
        assert_eq!(
            source.read_counters("eth0").unwrap(),
            Counters { sent_bytes: 1_000, received_bytes: 2_000 }
        );
    }

    #[test]
    fn test_sysfs_missing_interface_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let source = SysfsInterfaceSource::new(dir.path());

        let err = source.read_counters("eth9").unwrap_err();
        assert!(matches!(err, SamplerError::Vanished { .. }));
    }

    #[test]
    fn test_sysfs_garbage_counter() {
        let dir = tempfile::tempdir().unwrap();
        write_iface(dir.path(), "eth0", "up", 1, 0, 0);
        fs::write(dir.path().join("eth0/statistics/tx_bytes"), "n/a").unwrap();

        let source = SysfsInterfaceSource::new(dir.path());
        let err = source.read_counters("eth0").unwrap_err();
        assert!(matches!(err, SamplerError::ReadFailed { .. }));
    }

    #[test]
    fn test_sysfs_missing_root() {
        let source = SysfsInterfaceSource::new("/definitely/not/sysfs");
        assert!(matches!(
            source.list_interfaces(),
            Err(SamplerError::EnumerationFailed { .. })
        ));
    }
}
