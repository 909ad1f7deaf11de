//! Desired-state vocabulary: attributes, hypervisors and declared VMs.
//!
//! Every attribute carries a three-way [`Setting`]. An explicit empty value
//! is a request to clear or disable the attribute; an absent value inherits
//! from the layer below and never produces work on its own.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ── Setting ──────────────────────────────────────────────

/// A single attribute value as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Setting {
    /// Not specified at this layer; inherit.
    #[default]
    Absent,
    /// Specified as `""`: remove or disable.
    Empty,
    /// Specified with a value.
    Value(String),
}

impl Setting {
    /// Map a parsed config field onto the three-way representation.
    pub fn from_option(value: Option<&str>) -> Self {
        match value {
            None => Setting::Absent,
            Some("") => Setting::Empty,
            Some(v) => Setting::Value(v.to_string()),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Setting::Absent)
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Setting::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The value this setting asks the hypervisor to hold; `None` for
    /// absent settings, `Some("")` for explicit removal.
    pub fn target(&self) -> Option<&str> {
        match self {
            Setting::Absent => None,
            Setting::Empty => Some(""),
            Setting::Value(v) => Some(v),
        }
    }
}

// ── Attribute keys ───────────────────────────────────────

/// When a changed attribute can take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyClass {
    /// Can be changed on a running VM.
    Live,
    /// Staged and picked up on the next power-cycle.
    RebootRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttrKey {
    Memory,
    Cpus,
    Network,
    Ip,
    Netmask,
    Gateway,
    Dns,
    Autostart,
    BootMedia,
    Disk,
}

impl AttrKey {
    pub const ALL: [AttrKey; 10] = [
        AttrKey::Memory,
        AttrKey::Cpus,
        AttrKey::Network,
        AttrKey::Ip,
        AttrKey::Netmask,
        AttrKey::Gateway,
        AttrKey::Dns,
        AttrKey::Autostart,
        AttrKey::BootMedia,
        AttrKey::Disk,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AttrKey::Memory => "memory",
            AttrKey::Cpus => "cpus",
            AttrKey::Network => "network",
            AttrKey::Ip => "ip",
            AttrKey::Netmask => "netmask",
            AttrKey::Gateway => "gateway",
            AttrKey::Dns => "dns",
            AttrKey::Autostart => "autostart",
            AttrKey::BootMedia => "boot_media",
            AttrKey::Disk => "disk",
        }
    }

    pub fn apply_class(self) -> ApplyClass {
        match self {
            AttrKey::Network | AttrKey::Autostart | AttrKey::BootMedia => ApplyClass::Live,
            AttrKey::Memory
            | AttrKey::Cpus
            | AttrKey::Ip
            | AttrKey::Netmask
            | AttrKey::Gateway
            | AttrKey::Dns
            | AttrKey::Disk => ApplyClass::RebootRequired,
        }
    }
}

impl fmt::Display for AttrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttrKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AttrKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown attribute '{s}'"))
    }
}

// ── Attributes ───────────────────────────────────────────

/// One override layer, or the merged result of several.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attributes {
    settings: BTreeMap<AttrKey, Setting>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: AttrKey) -> &Setting {
        static ABSENT: Setting = Setting::Absent;
        self.settings.get(&key).unwrap_or(&ABSENT)
    }

    pub fn set(&mut self, key: AttrKey, setting: Setting) {
        if setting.is_absent() {
            self.settings.remove(&key);
        } else {
            self.settings.insert(key, setting);
        }
    }

    pub fn with(mut self, key: AttrKey, setting: Setting) -> Self {
        self.set(key, setting);
        self
    }

    /// Lay `higher` over `self`: absent settings in `higher` keep ours,
    /// everything else (including explicit empties) replaces ours.
    pub fn layered(&self, higher: &Attributes) -> Attributes {
        let mut merged = self.clone();
        for (key, setting) in &higher.settings {
            merged.settings.insert(*key, setting.clone());
        }
        merged
    }

    /// Non-absent settings in key order.
    pub fn iter(&self) -> impl Iterator<Item = (AttrKey, &Setting)> {
        self.settings.iter().map(|(k, v)| (*k, v))
    }

    /// Concrete key/value pairs to hand to `create`; explicit empties are
    /// simply not set on a fresh VM.
    pub fn values(&self) -> BTreeMap<AttrKey, String> {
        self.settings
            .iter()
            .filter_map(|(k, v)| v.value().map(|v| (*k, v.to_string())))
            .collect()
    }
}

// ── Hypervisors and VMs ──────────────────────────────────

/// How to reach a hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub identity: Option<PathBuf>,
    /// Remote helper that implements the hypervisor verbs.
    pub remote_command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorRecord {
    pub name: String,
    pub address: String,
    pub credentials: Credentials,
    pub defaults: Attributes,
}

/// A VM as the configuration wants it, overrides already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredVm {
    pub name: String,
    pub host: String,
    pub attributes: Attributes,
}

impl DesiredVm {
    pub fn boot_media(&self) -> &Setting {
        self.attributes.get(AttrKey::BootMedia)
    }
}

/// `host/vm` as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmPath {
    pub host: String,
    pub vm: String,
}

impl FromStr for VmPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((host, vm)) if !host.is_empty() && !vm.is_empty() && !vm.contains('/') => {
                Ok(VmPath {
                    host: host.to_string(),
                    vm: vm.to_string(),
                })
            }
            _ => Err(format!("expected <host>/<vm>, got '{s}'")),
        }
    }
}

impl fmt::Display for VmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.vm)
    }
}

/// Everything the configuration declares, plus the local asset catalog.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    pub hypervisors: Vec<HypervisorRecord>,
    pub vms: Vec<DesiredVm>,
    /// Local boot/disk asset name → sha256 of the file in the asset dir.
    pub assets: BTreeMap<String, String>,
}

impl DesiredState {
    pub fn hypervisor(&self, name: &str) -> Option<&HypervisorRecord> {
        self.hypervisors.iter().find(|h| h.name == name)
    }

    pub fn vm(&self, name: &str) -> Option<&DesiredVm> {
        self.vms.iter().find(|v| v.name == name)
    }

    pub fn asset_checksum(&self, name: &str) -> Option<&str> {
        self.assets.get(name).map(String::as_str)
    }
}
