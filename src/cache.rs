//! Persisted fleet map, one JSON record per configuration.
//!
//! The cache only saves a probe pass. A loaded map is handed to the
//! reconciler exactly like a freshly built one. Writes go through a temp
//! file and a rename, so a concurrent reader sees either the old record or
//! the new one; anything it cannot parse is a miss.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use facet::Facet;

use crate::error::FleetError;
use crate::fleet::{ActualVm, AttachedAsset, FleetMap, HostInventory, PowerState};
use crate::model::AttrKey;
use crate::util::parse_duration;

const FORMAT_VERSION: u32 = 1;

// ── Validity ─────────────────────────────────────────────

/// How old a cached map may be before it is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheValidity {
    /// Never use the cache.
    Bypass,
    Window(Duration),
}

impl CacheValidity {
    pub const BYPASS: &'static str = "bypass";

    /// `"bypass"` or a duration (`"300"`, `"5m"`, `"1h"`).
    pub fn parse(s: &str) -> Result<Self, FleetError> {
        if s.trim().eq_ignore_ascii_case(Self::BYPASS) {
            return Ok(CacheValidity::Bypass);
        }
        parse_duration(s).map(CacheValidity::Window)
    }
}

impl Default for CacheValidity {
    fn default() -> Self {
        CacheValidity::Window(Duration::from_secs(300))
    }
}

impl fmt::Display for CacheValidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheValidity::Bypass => f.write_str(Self::BYPASS),
            CacheValidity::Window(d) => write!(f, "{}s", d.as_secs()),
        }
    }
}

// ── On-disk record ───────────────────────────────────────

#[derive(Debug, Facet)]
struct CacheRecord {
    version: u32,
    captured_at_ms: u64,
    hosts: Vec<CachedHost>,
    unreachable: Vec<String>,
}

#[derive(Debug, Facet)]
struct CachedHost {
    name: String,
    vms: Vec<CachedVm>,
    assets: BTreeMap<String, String>,
}

#[derive(Debug, Facet)]
struct CachedVm {
    name: String,
    power: String,
    attributes: BTreeMap<String, String>,
    pending: BTreeMap<String, String>,
    attached: Vec<CachedAttachment>,
}

#[derive(Debug, Facet)]
struct CachedAttachment {
    name: String,
    checksum: Option<String>,
}

fn keyed(values: &BTreeMap<AttrKey, String>) -> BTreeMap<String, String> {
    values
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.clone()))
        .collect()
}

fn unkeyed(values: BTreeMap<String, String>) -> Result<BTreeMap<AttrKey, String>, String> {
    values
        .into_iter()
        .map(|(k, v)| Ok((k.parse::<AttrKey>()?, v)))
        .collect()
}

impl CacheRecord {
    fn from_map(map: &FleetMap) -> Self {
        let captured_at_ms = map
            .captured_at()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let hosts = map
            .inventories()
            .map(|inv| CachedHost {
                name: inv.host.clone(),
                vms: inv
                    .vms
                    .iter()
                    .map(|vm| CachedVm {
                        name: vm.name.clone(),
                        power: vm.power.as_str().to_string(),
                        attributes: keyed(&vm.attributes),
                        pending: keyed(&vm.pending),
                        attached: vm
                            .attached
                            .iter()
                            .map(|a| CachedAttachment {
                                name: a.name.clone(),
                                checksum: a.checksum.clone(),
                            })
                            .collect(),
                    })
                    .collect(),
                assets: inv.assets.clone(),
            })
            .collect();
        Self {
            version: FORMAT_VERSION,
            captured_at_ms,
            hosts,
            unreachable: map.unreachable_hosts().map(String::from).collect(),
        }
    }

    fn into_map(self) -> Result<FleetMap, String> {
        if self.version != FORMAT_VERSION {
            return Err(format!("unsupported cache version {}", self.version));
        }
        let mut inventories = Vec::with_capacity(self.hosts.len());
        for host in self.hosts {
            let mut inv = HostInventory::new(&host.name);
            inv.assets = host.assets;
            for cached in host.vms {
                let mut vm = ActualVm::new(cached.name, &host.name);
                vm.power = PowerState::parse(&cached.power);
                vm.attributes = unkeyed(cached.attributes)?;
                vm.pending = unkeyed(cached.pending)?;
                vm.attached = cached
                    .attached
                    .into_iter()
                    .map(|a| AttachedAsset {
                        name: a.name,
                        checksum: a.checksum,
                    })
                    .collect();
                inv.vms.push(vm);
            }
            inventories.push(inv);
        }
        let captured_at = SystemTime::UNIX_EPOCH + Duration::from_millis(self.captured_at_ms);
        Ok(FleetMap::assemble(inventories, self.unreachable, false).with_captured_at(captured_at))
    }
}

// ── StateCache ───────────────────────────────────────────

pub struct StateCache {
    path: PathBuf,
}

impl StateCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The cache record for configuration `id` under the user cache dir.
    pub fn for_config(id: &str) -> Self {
        Self::new(crate::paths::cache_file(id))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The cached map, if there is one younger than `validity` allows.
    pub fn load(&self, validity: CacheValidity) -> Option<FleetMap> {
        let CacheValidity::Window(max_age) = validity else {
            tracing::debug!("cache bypassed");
            return None;
        };

        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "unreadable fleet cache, ignoring");
                return None;
            }
        };

        let map = match facet_json::from_str::<CacheRecord>(&contents)
            .map_err(|e| e.to_string())
            .and_then(CacheRecord::into_map)
        {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "corrupt fleet cache, ignoring");
                return None;
            }
        };

        let age = map.age();
        if age > max_age {
            tracing::debug!(age_s = age.as_secs(), max_s = max_age.as_secs(), "fleet cache expired");
            return None;
        }
        tracing::debug!(age_s = age.as_secs(), "using cached fleet map");
        Some(map)
    }

    /// Persist `map`. Partial maps are not stored.
    pub fn store(&self, map: &FleetMap) -> Result<(), FleetError> {
        if map.is_partial() {
            tracing::debug!("not caching partial fleet map");
            return Ok(());
        }

        let json = facet_json::to_string(&CacheRecord::from_map(map)).map_err(|e| {
            FleetError::Validation {
                message: format!("serializing fleet cache: {e:?}"),
            }
        })?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FleetError::Io {
                context: format!("creating {}", parent.display()),
                source: e,
            })?;
        }

        let tmp = self
            .path
            .with_extension(format!("json.tmp.{}", std::process::id()));
        std::fs::write(&tmp, json).map_err(|e| FleetError::Io {
            context: format!("writing {}", tmp.display()),
            source: e,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| FleetError::Io {
            context: format!("replacing {}", self.path.display()),
            source: e,
        })?;
        tracing::debug!(path = %self.path.display(), "fleet cache stored");
        Ok(())
    }

    pub fn invalidate(&self) -> Result<(), FleetError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FleetError::Io {
                context: format!("removing {}", self.path.display()),
                source: e,
            }),
        }
    }
}
