use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::model::AttrKey;

/// Flags in force for one invocation, carried on every planned action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Policy {
    /// Escalate soft failures to hard power operations.
    pub force: bool,
    /// Keep boot/disk assets that a destroy or media change leaves unused.
    pub skip_removal: bool,
    /// Allow destroying a stray instance so the VM can be recreated on its
    /// declared host.
    pub relocate: bool,
    /// Compare boot media by reference name instead of checksum.
    pub trust: bool,
    /// The map came from a scoped single-host probe.
    pub no_map: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Create {
        attributes: BTreeMap<AttrKey, String>,
        /// Asset to upload to the host first.
        upload: Option<String>,
    },
    Destroy,
    /// Destroy the instance on this host; the VM belongs on `declared_host`.
    MigrateDestroyOther {
        declared_host: String,
    },
    UpdateAttr {
        key: AttrKey,
        /// Empty clears the attribute.
        value: String,
        upload: Option<String>,
    },
    /// Staged for the VM's next power-cycle.
    DeferUpdateAttr {
        key: AttrKey,
        value: String,
    },
    /// Remove assets no VM on the host uses any more.
    CleanupAssets {
        assets: Vec<String>,
    },
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Create { .. } => "create",
            ActionKind::Destroy => "destroy",
            ActionKind::MigrateDestroyOther { .. } => "migrate-destroy-other",
            ActionKind::UpdateAttr { .. } => "update-attr",
            ActionKind::DeferUpdateAttr { .. } => "defer-update-attr",
            ActionKind::CleanupAssets { .. } => "cleanup-assets",
        }
    }

    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            ActionKind::Destroy
                | ActionKind::MigrateDestroyOther { .. }
                | ActionKind::CleanupAssets { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub vm: String,
    pub host: String,
    pub kind: ActionKind,
    pub policy: Policy,
}

impl Action {
    pub fn new(vm: &str, host: &str, kind: ActionKind, policy: Policy) -> Self {
        Self {
            vm: vm.to_string(),
            host: host.to_string(),
            kind,
            policy,
        }
    }

    /// One-line human summary, without the kind label.
    pub fn detail(&self) -> String {
        match &self.kind {
            ActionKind::Create { attributes, upload } => {
                let mut parts: Vec<String> =
                    attributes.iter().map(|(k, v)| format!("{k}={v}")).collect();
                if let Some(asset) = upload {
                    parts.push(format!("upload {asset}"));
                }
                parts.join(" ")
            }
            ActionKind::Destroy => String::new(),
            ActionKind::MigrateDestroyOther { declared_host } => {
                format!("declared on {declared_host}")
            }
            ActionKind::UpdateAttr { key, value, upload } => {
                let mut s = if value.is_empty() {
                    format!("clear {key}")
                } else {
                    format!("{key}={value}")
                };
                if let Some(asset) = upload {
                    s.push_str(&format!(" (upload {asset})"));
                }
                s
            }
            ActionKind::DeferUpdateAttr { key, value } if value.is_empty() => {
                format!("clear {key} at next boot")
            }
            ActionKind::DeferUpdateAttr { key, value } => format!("{key}={value} at next boot"),
            ActionKind::CleanupAssets { assets } if assets.is_empty() => "nothing to remove".into(),
            ActionKind::CleanupAssets { assets } => assets.join(", "),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind.label(), self.host, self.vm)?;
        let detail = self.detail();
        if !detail.is_empty() {
            write!(f, " {detail}")?;
        }
        Ok(())
    }
}

/// Ordered actions. Built by the reconciler, consumed by the executor,
/// never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionPlan {
    actions: Vec<Action>,
}

impl ActionPlan {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    /// Hosts the plan mutates.
    pub fn hosts(&self) -> BTreeSet<&str> {
        self.actions.iter().map(|a| a.host.as_str()).collect()
    }

    /// VMs the plan touches, in first-appearance order.
    pub fn vms(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.actions
            .iter()
            .map(|a| a.vm.as_str())
            .filter(|vm| seen.insert(*vm))
            .collect()
    }
}

impl<'a> IntoIterator for &'a ActionPlan {
    type Item = &'a Action;
    type IntoIter = std::slice::Iter<'a, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_host_and_detail() {
        let action = Action::new(
            "web1",
            "esx1",
            ActionKind::UpdateAttr {
                key: AttrKey::BootMedia,
                value: String::new(),
                upload: None,
            },
            Policy::default(),
        );
        assert_eq!(action.to_string(), "update-attr esx1/web1 clear boot_media");

        let destroy = Action::new("vmC", "esx2", ActionKind::Destroy, Policy::default());
        assert_eq!(destroy.to_string(), "destroy esx2/vmC");
    }

    #[test]
    fn plan_lists_vms_once() {
        let p = Policy::default();
        let plan = ActionPlan::new(vec![
            Action::new("a", "esx2", ActionKind::MigrateDestroyOther { declared_host: "esx1".into() }, p),
            Action::new("b", "esx1", ActionKind::Destroy, p),
            Action::new(
                "a",
                "esx1",
                ActionKind::Create { attributes: BTreeMap::new(), upload: None },
                p,
            ),
        ]);
        assert_eq!(plan.vms(), vec!["a", "b"]);
        assert_eq!(plan.hosts().into_iter().collect::<Vec<_>>(), vec!["esx1", "esx2"]);
    }
}
