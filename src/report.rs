//! Rendering of fleet maps, plans and apply results for the terminal and
//! for `--output json`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use console::style;
use facet::Facet;

use crate::builder::HostError;
use crate::error::FleetError;
use crate::executor::{ApplyReport, Outcome};
use crate::fleet::{FleetMap, Reachability};
use crate::model::HypervisorRecord;
use crate::reconcile::{ActionPlan, DiffWarning};

// ── JSON shapes ───────────────────────────────────────────

#[derive(Facet)]
struct StatusJson {
    age_s: u64,
    partial: bool,
    hosts: Vec<HostJson>,
    collisions: Vec<CollisionJson>,
}

#[derive(Facet)]
struct HostJson {
    name: String,
    reachability: String,
    error: Option<String>,
    vms: Vec<VmJson>,
    assets: BTreeMap<String, String>,
}

#[derive(Facet)]
struct VmJson {
    name: String,
    power: String,
    attributes: BTreeMap<String, String>,
    pending: BTreeMap<String, String>,
}

#[derive(Facet)]
struct CollisionJson {
    name: String,
    hosts: Vec<String>,
}

#[derive(Facet)]
struct PlanJson {
    actions: Vec<ActionJson>,
    warnings: Vec<String>,
}

#[derive(Facet)]
struct ActionJson {
    kind: String,
    host: String,
    vm: String,
    detail: String,
}

#[derive(Facet)]
struct ResultsJson {
    results: Vec<ResultJson>,
    failed: usize,
}

#[derive(Facet)]
struct ResultJson {
    kind: String,
    host: String,
    vm: String,
    outcome: String,
    message: Option<String>,
    elapsed_ms: u64,
}

fn to_json<'f, T: Facet<'f>>(value: &T) -> Result<String, FleetError> {
    facet_json::to_string(value).map_err(|e| FleetError::Validation {
        message: format!("JSON serialization failed: {e:?}"),
    })
}

// ── Status ────────────────────────────────────────────────

fn host_error<'a>(errors: &'a [HostError], host: &str) -> Option<&'a HostError> {
    errors.iter().find(|e| e.host == host)
}

pub fn status_text(hosts: &[HypervisorRecord], map: &FleetMap, errors: &[HostError]) -> String {
    let mut out = String::new();
    for host in hosts {
        let reach = map.reachability(&host.name);
        let label = match reach {
            Reachability::Reachable => style(reach.as_str()).green(),
            Reachability::Unreachable => style(reach.as_str()).red(),
            Reachability::Unknown => style(reach.as_str()).yellow(),
        };
        let _ = writeln!(out, "{} ({label})", style(&host.name).bold());
        if let Some(err) = host_error(errors, &host.name) {
            let _ = writeln!(out, "  {}", style(&err.error).red());
        }
        let Some(inv) = map.inventory(&host.name) else {
            continue;
        };
        if inv.vms.is_empty() {
            let _ = writeln!(out, "  {}", style("no VMs").dim());
        }
        let width = inv.vms.iter().map(|v| v.name.len()).max().unwrap_or(0);
        for vm in &inv.vms {
            let attrs: Vec<String> = vm
                .attributes
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            let _ = write!(out, "  {:width$}  {:<9} {}", vm.name, vm.power.as_str(), attrs.join(" "));
            if !vm.pending.is_empty() {
                let pending: Vec<String> =
                    vm.pending.iter().map(|(k, v)| format!("{k}={v}")).collect();
                let _ = write!(out, " {}", style(format!("(next boot: {})", pending.join(" "))).cyan());
            }
            out.push('\n');
        }
    }
    if !map.collisions().is_empty() {
        let _ = writeln!(out, "{}", style("collisions:").yellow().bold());
        for c in map.collisions() {
            let _ = writeln!(out, "  {} on {}", c.name, c.hosts.join(", "));
        }
    }
    let age = map.age().as_secs();
    if age > 0 {
        let _ = writeln!(out, "{}", style(format!("(fleet map captured {age}s ago)")).dim());
    }
    out
}

pub fn status_json(
    hosts: &[HypervisorRecord],
    map: &FleetMap,
    errors: &[HostError],
) -> Result<String, FleetError> {
    let keyed = |m: &BTreeMap<crate::model::AttrKey, String>| {
        m.iter()
            .map(|(k, v)| (k.as_str().to_string(), v.clone()))
            .collect::<BTreeMap<_, _>>()
    };
    let json = StatusJson {
        age_s: map.age().as_secs(),
        partial: map.is_partial(),
        hosts: hosts
            .iter()
            .map(|host| {
                let inv = map.inventory(&host.name);
                HostJson {
                    name: host.name.clone(),
                    reachability: map.reachability(&host.name).as_str().to_string(),
                    error: host_error(errors, &host.name).map(|e| e.error.to_string()),
                    vms: inv
                        .map(|inv| {
                            inv.vms
                                .iter()
                                .map(|vm| VmJson {
                                    name: vm.name.clone(),
                                    power: vm.power.as_str().to_string(),
                                    attributes: keyed(&vm.attributes),
                                    pending: keyed(&vm.pending),
                                })
                                .collect()
                        })
                        .unwrap_or_default(),
                    assets: inv.map(|inv| inv.assets.clone()).unwrap_or_default(),
                }
            })
            .collect(),
        collisions: map
            .collisions()
            .iter()
            .map(|c| CollisionJson {
                name: c.name.clone(),
                hosts: c.hosts.clone(),
            })
            .collect(),
    };
    to_json(&json)
}

// ── Plan ──────────────────────────────────────────────────

pub fn plan_text(plan: &ActionPlan, warnings: &[DiffWarning]) -> String {
    let mut out = String::new();
    for warning in warnings {
        let _ = writeln!(out, "{} {warning}", style("warning:").yellow().bold());
    }
    if plan.is_empty() {
        let _ = writeln!(out, "{}", style("Nothing to do.").green());
        return out;
    }
    for action in plan {
        let kind = action.kind.label();
        let kind = if action.kind.is_destructive() {
            style(kind).red()
        } else {
            style(kind).cyan()
        };
        let _ = write!(out, "  {kind:<22} {}/{}", action.host, action.vm);
        let detail = action.detail();
        if !detail.is_empty() {
            let _ = write!(out, "  {}", style(detail).dim());
        }
        out.push('\n');
    }
    let _ = writeln!(out, "{} action(s) planned", plan.len());
    out
}

pub fn plan_json(plan: &ActionPlan, warnings: &[DiffWarning]) -> Result<String, FleetError> {
    to_json(&PlanJson {
        actions: plan
            .iter()
            .map(|a| ActionJson {
                kind: a.kind.label().to_string(),
                host: a.host.clone(),
                vm: a.vm.clone(),
                detail: a.detail(),
            })
            .collect(),
        warnings: warnings.iter().map(ToString::to_string).collect(),
    })
}

// ── Results ───────────────────────────────────────────────

fn outcome_message(outcome: &Outcome) -> Option<String> {
    match outcome {
        Outcome::Skipped { reason } => Some(reason.clone()),
        Outcome::Failed { error } => Some(error.clone()),
        Outcome::Applied | Outcome::AlreadyAbsent => None,
    }
}

pub fn results_text(report: &ApplyReport) -> String {
    let mut out = String::new();
    for r in &report.results {
        let mark = match r.outcome {
            Outcome::Applied | Outcome::AlreadyAbsent => style("\u{2713}").green(),
            Outcome::Skipped { .. } => style("-").yellow(),
            Outcome::Failed { .. } => style("\u{2717}").red(),
        };
        let _ = write!(out, "{mark} {}", r.action);
        if matches!(r.outcome, Outcome::AlreadyAbsent) {
            let _ = write!(out, " {}", style("(already absent)").dim());
        }
        if let Some(msg) = outcome_message(&r.outcome) {
            let _ = write!(out, ": {msg}");
        }
        out.push('\n');
    }
    let failed = report.failures().count();
    if failed > 0 {
        let _ = writeln!(out, "{}", style(format!("{failed} action(s) failed")).red().bold());
    }
    out
}

pub fn results_json(report: &ApplyReport) -> Result<String, FleetError> {
    to_json(&ResultsJson {
        results: report
            .results
            .iter()
            .map(|r| ResultJson {
                kind: r.action.kind.label().to_string(),
                host: r.action.host.clone(),
                vm: r.action.vm.clone(),
                outcome: r.outcome.label().to_string(),
                message: outcome_message(&r.outcome),
                elapsed_ms: r.elapsed.as_millis() as u64,
            })
            .collect(),
        failed: report.failures().count(),
    })
}
