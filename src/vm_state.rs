//! Per-VM progress through one invocation.
//!
//! `Unknown → Probed → {Unchanged | Planned} → {Applied | Failed}`.
//! `Planned` only exists between diffing and execution; the other three
//! right-hand states are terminal.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPhase {
    /// Declared, not yet seen by a probe.
    Unknown,
    /// Found (or confirmed absent) on a reachable host.
    Probed,
    /// Nothing to do.
    Unchanged,
    /// Has actions in the plan.
    Planned,
    Applied,
    Failed,
}

impl VmPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, VmPhase::Unchanged | VmPhase::Applied | VmPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmPhase::Unknown => "unknown",
            VmPhase::Probed => "probed",
            VmPhase::Unchanged => "unchanged",
            VmPhase::Planned => "planned",
            VmPhase::Applied => "applied",
            VmPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for VmPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// The VM's declared host answered its probe.
    Probed,
    /// The diff finished; `planned` says whether it produced actions.
    Diffed { planned: bool },
    /// Every action for the VM finished; `ok` is false if any failed or
    /// was skipped.
    Executed { ok: bool },
}

/// Next phase for `event`. Events that do not apply leave the phase as is.
pub fn transition(phase: VmPhase, event: PhaseEvent) -> VmPhase {
    match (phase, event) {
        (VmPhase::Unknown, PhaseEvent::Probed) => VmPhase::Probed,
        (VmPhase::Probed, PhaseEvent::Diffed { planned: true }) => VmPhase::Planned,
        (VmPhase::Probed, PhaseEvent::Diffed { planned: false }) => VmPhase::Unchanged,
        (VmPhase::Planned, PhaseEvent::Executed { ok: true }) => VmPhase::Applied,
        (VmPhase::Planned, PhaseEvent::Executed { ok: false }) => VmPhase::Failed,
        (phase, _) => phase,
    }
}

/// Phases of every VM an invocation deals with.
#[derive(Debug, Clone, Default)]
pub struct PhaseTracker {
    phases: BTreeMap<String, VmPhase>,
}

impl PhaseTracker {
    pub fn new<'a>(vms: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            phases: vms
                .into_iter()
                .map(|vm| (vm.to_string(), VmPhase::Unknown))
                .collect(),
        }
    }

    /// Feed `event` to `vm`, starting it at `Unknown` if not yet tracked.
    pub fn observe(&mut self, vm: &str, event: PhaseEvent) -> VmPhase {
        let phase = self
            .phases
            .entry(vm.to_string())
            .or_insert(VmPhase::Unknown);
        let next = transition(*phase, event);
        if next != *phase {
            tracing::trace!(vm, from = %phase, to = %next, "phase");
        }
        *phase = next;
        next
    }

    pub fn phase(&self, vm: &str) -> VmPhase {
        self.phases.get(vm).copied().unwrap_or(VmPhase::Unknown)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, VmPhase)> {
        self.phases.iter().map(|(vm, p)| (vm.as_str(), *p))
    }

    /// How many VMs ended in each phase.
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for phase in self.phases.values() {
            *counts.entry(phase.as_str()).or_insert(0) += 1;
        }
        counts
    }
}
