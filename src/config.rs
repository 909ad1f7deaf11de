use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::cache::CacheValidity;
use crate::error::FleetError;
use crate::model::{
    AttrKey, Attributes, Credentials, DesiredState, DesiredVm, HypervisorRecord, Setting,
};
use crate::util::parse_memory_mb;

// ── File format ───────────────────────────────────────────

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct Settings {
    /// Duration string or `"bypass"`.
    #[facet(default = "5m")]
    pub cache_validity: String,
    #[facet(default = 8)]
    pub concurrency: u32,
    #[facet(default = 30)]
    pub timeout_s: u64,
    #[facet(default = 2)]
    pub retries: u32,
    /// Local boot/disk assets, relative to the config file.
    #[facet(default = "assets")]
    pub asset_dir: String,
    #[facet(default = "vmctl-remote")]
    pub remote_command: String,
    #[facet(default = "root")]
    pub user: String,
    pub identity: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_validity: "5m".into(),
            concurrency: 8,
            timeout_s: 30,
            retries: 2,
            asset_dir: "assets".into(),
            remote_command: "vmctl-remote".into(),
            user: "root".into(),
            identity: None,
        }
    }
}

/// One attribute layer. `None` inherits, `Some("")` clears.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct AttrConfig {
    pub memory: Option<String>,
    pub cpus: Option<String>,
    pub network: Option<String>,
    pub ip: Option<String>,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
    pub dns: Option<String>,
    pub autostart: Option<String>,
    pub boot_media: Option<String>,
    pub disk: Option<String>,
}

impl AttrConfig {
    fn fields(&self) -> [(AttrKey, Option<&str>); 10] {
        [
            (AttrKey::Memory, self.memory.as_deref()),
            (AttrKey::Cpus, self.cpus.as_deref()),
            (AttrKey::Network, self.network.as_deref()),
            (AttrKey::Ip, self.ip.as_deref()),
            (AttrKey::Netmask, self.netmask.as_deref()),
            (AttrKey::Gateway, self.gateway.as_deref()),
            (AttrKey::Dns, self.dns.as_deref()),
            (AttrKey::Autostart, self.autostart.as_deref()),
            (AttrKey::BootMedia, self.boot_media.as_deref()),
            (AttrKey::Disk, self.disk.as_deref()),
        ]
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct HypervisorConfig {
    pub address: String,
    pub user: Option<String>,
    pub identity: Option<String>,
    pub remote_command: Option<String>,
    #[facet(default)]
    pub defaults: AttrConfig,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct VmConfig {
    pub host: String,
    pub memory: Option<String>,
    pub cpus: Option<String>,
    pub network: Option<String>,
    pub ip: Option<String>,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
    pub dns: Option<String>,
    pub autostart: Option<String>,
    pub boot_media: Option<String>,
    pub disk: Option<String>,
}

impl VmConfig {
    fn attrs(&self) -> AttrConfig {
        AttrConfig {
            memory: self.memory.clone(),
            cpus: self.cpus.clone(),
            network: self.network.clone(),
            ip: self.ip.clone(),
            netmask: self.netmask.clone(),
            gateway: self.gateway.clone(),
            dns: self.dns.clone(),
            autostart: self.autostart.clone(),
            boot_media: self.boot_media.clone(),
            disk: self.disk.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
pub struct Config {
    #[facet(default)]
    pub settings: Settings,
    #[facet(default)]
    pub defaults: AttrConfig,
    #[facet(default)]
    pub hypervisors: BTreeMap<String, HypervisorConfig>,
    #[facet(default)]
    pub vms: BTreeMap<String, VmConfig>,
}

// ── FleetConfig ───────────────────────────────────────────

/// Knobs resolved from `[settings]`.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub cache_validity: CacheValidity,
    pub concurrency: usize,
    pub timeout: Duration,
    pub retries: u32,
    pub asset_dir: PathBuf,
}

/// Resolved runtime config: desired state plus path-derived identity.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// 8-hex-char hash of the canonicalized config path.
    pub id: String,
    /// Canonicalized path to the config file.
    pub config_path: PathBuf,
    pub settings: RuntimeSettings,
    /// Asset checksums are filled in separately; see [`crate::assets`].
    pub desired: DesiredState,
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), FleetError> {
    if config.hypervisors.is_empty() && config.vms.is_empty() {
        return Err(FleetError::EmptyConfig {
            what: "hypervisors or VMs",
        });
    }
    if config.hypervisors.is_empty() {
        return Err(FleetError::EmptyConfig {
            what: "hypervisors",
        });
    }
    if config.settings.concurrency < 1 {
        return Err(FleetError::Validation {
            message: "settings.concurrency must be at least 1".into(),
        });
    }
    if config.settings.timeout_s < 1 {
        return Err(FleetError::Validation {
            message: "settings.timeout_s must be at least 1".into(),
        });
    }

    for (name, hv) in &config.hypervisors {
        validate_name("hypervisor", name)?;
        if hv.address.trim().is_empty() {
            return Err(FleetError::Validation {
                message: format!("hypervisors.{name}: address is required"),
            });
        }
    }

    for (name, vm) in &config.vms {
        validate_name("VM", name)?;
        if vm.host.is_empty() {
            return Err(FleetError::Validation {
                message: format!("vms.{name}: host is required"),
            });
        }
        if !config.hypervisors.contains_key(&vm.host) {
            return Err(FleetError::Validation {
                message: format!("vms.{name}: unknown hypervisor '{}'", vm.host),
            });
        }
    }
    Ok(())
}

fn validate_name(what: &str, name: &str) -> Result<(), FleetError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(FleetError::Validation {
            message: format!("{what} name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

/// Turn one config layer into [`Attributes`], normalizing values that have
/// a canonical form.
fn layer(label: &str, attrs: &AttrConfig) -> Result<Attributes, FleetError> {
    let mut out = Attributes::new();
    for (key, raw) in attrs.fields() {
        let setting = match Setting::from_option(raw) {
            Setting::Value(v) => Setting::Value(normalize(label, key, &v)?),
            other => other,
        };
        out.set(key, setting);
    }
    Ok(out)
}

fn normalize(label: &str, key: AttrKey, value: &str) -> Result<String, FleetError> {
    let invalid = |what: &str| FleetError::Validation {
        message: format!("{label}.{key}: {what} (got '{value}')"),
    };
    match key {
        AttrKey::Memory => parse_memory_mb(value)
            .map(|mb| mb.to_string())
            .map_err(|_| invalid("expected a size such as 2048 or 4G")),
        AttrKey::Cpus => match value.trim().parse::<u32>() {
            Ok(n) if n >= 1 => Ok(n.to_string()),
            _ => Err(invalid("expected a positive number")),
        },
        AttrKey::Autostart => match value.trim() {
            "true" | "yes" | "on" => Ok("true".into()),
            "false" | "no" | "off" => Ok("false".into()),
            _ => Err(invalid("expected true or false")),
        },
        _ => Ok(value.to_string()),
    }
}

// ── helpers ───────────────────────────────────────────────

/// Compute an 8-hex-char ID from the canonicalized config path.
fn config_id(canonical_path: &Path) -> String {
    let mut hash: u64 = 0xcbf29ce484222325; // FNV-1a offset basis
    for b in canonical_path.to_string_lossy().bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:08x}", hash as u32)
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(rest),
        None => PathBuf::from(path),
    }
}

/// Resolve the parsed file into desired state. `config_dir` anchors
/// relative paths.
pub fn resolve(config: &Config, config_dir: &Path) -> Result<(RuntimeSettings, DesiredState), FleetError> {
    validate_config(config)?;
    let s = &config.settings;

    let settings = RuntimeSettings {
        cache_validity: CacheValidity::parse(&s.cache_validity)?,
        concurrency: s.concurrency as usize,
        timeout: Duration::from_secs(s.timeout_s),
        retries: s.retries,
        asset_dir: config_dir.join(expand_home(&s.asset_dir)),
    };

    let global = layer("defaults", &config.defaults)?;

    let mut hypervisors = Vec::with_capacity(config.hypervisors.len());
    let mut host_layers = BTreeMap::new();
    for (name, hv) in &config.hypervisors {
        let defaults = layer(&format!("hypervisors.{name}.defaults"), &hv.defaults)?;
        host_layers.insert(name.as_str(), global.layered(&defaults));
        hypervisors.push(HypervisorRecord {
            name: name.clone(),
            address: hv.address.trim().to_string(),
            credentials: Credentials {
                user: hv.user.clone().unwrap_or_else(|| s.user.clone()),
                identity: hv
                    .identity
                    .as_deref()
                    .or(s.identity.as_deref())
                    .map(expand_home),
                remote_command: hv
                    .remote_command
                    .clone()
                    .unwrap_or_else(|| s.remote_command.clone()),
            },
            defaults,
        });
    }

    let mut vms = Vec::with_capacity(config.vms.len());
    for (name, vm) in &config.vms {
        let own = layer(&format!("vms.{name}"), &vm.attrs())?;
        let base = host_layers.get(vm.host.as_str()).cloned().unwrap_or_default();
        vms.push(DesiredVm {
            name: name.clone(),
            host: vm.host.clone(),
            attributes: base.layered(&own),
        });
    }

    Ok((
        settings,
        DesiredState {
            hypervisors,
            vms,
            assets: BTreeMap::new(),
        },
    ))
}

// ── public API ────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<FleetConfig, FleetError> {
    let contents = std::fs::read_to_string(path).map_err(|source| FleetError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = facet_toml::from_str(&contents).map_err(|e| FleetError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let canonical = path.canonicalize().map_err(|source| FleetError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    let config_dir = canonical.parent().unwrap_or(Path::new("/")).to_path_buf();

    let (settings, desired) = resolve(&config, &config_dir)?;
    let id = config_id(&canonical);
    tracing::debug!(
        id,
        hypervisors = desired.hypervisors.len(),
        vms = desired.vms.len(),
        "config loaded"
    );

    Ok(FleetConfig {
        id,
        config_path: canonical,
        settings,
        desired,
    })
}
