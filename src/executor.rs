//! Plan execution.
//!
//! Actions are grouped into one lane per VM. A lane runs its actions in
//! plan order and stops at the first failure; lanes run concurrently up to
//! the configured limit. Uploads and asset removals take a per-host lock so
//! two lanes never write the same datastore path at once.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::model::{DesiredState, HypervisorRecord};
use crate::probe::{ApplyAt, Control, Mutation, ProbeError};
use crate::reconcile::{Action, ActionKind, ActionPlan};

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub concurrency: usize,
    /// Applied to every hypervisor call.
    pub timeout: Duration,
    /// Where local boot/disk assets live.
    pub asset_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The target was already gone.
    AlreadyAbsent,
    /// Not attempted.
    Skipped { reason: String },
    Failed { error: String },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::AlreadyAbsent => "already-absent",
            Outcome::Skipped { .. } => "skipped",
            Outcome::Failed { .. } => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Applied | Outcome::AlreadyAbsent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub action: Action,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub results: Vec<ActionResult>,
}

impl ApplyReport {
    pub fn failures(&self) -> impl Iterator<Item = &ActionResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed { .. }))
    }

    /// Every action applied or was already satisfied.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_success())
    }

    /// Hosts where at least one action was attempted.
    pub fn touched_hosts(&self) -> BTreeSet<String> {
        self.results
            .iter()
            .filter(|r| !matches!(r.outcome, Outcome::Skipped { .. }))
            .map(|r| r.action.host.clone())
            .collect()
    }

    /// Per-VM verdict: `true` when all of the VM's actions succeeded.
    pub fn vm_outcomes(&self) -> BTreeMap<String, bool> {
        let mut verdicts = BTreeMap::new();
        for r in &self.results {
            let ok = verdicts.entry(r.action.vm.clone()).or_insert(true);
            *ok &= r.outcome.is_success();
        }
        verdicts
    }
}

/// Per-host serialization of datastore writes, remembering what this run
/// already uploaded.
struct HostLocks {
    locks: BTreeMap<String, Mutex<BTreeSet<String>>>,
}

impl HostLocks {
    fn new(plan: &ActionPlan) -> Self {
        Self {
            locks: plan
                .hosts()
                .into_iter()
                .map(|h| (h.to_string(), Mutex::new(BTreeSet::new())))
                .collect(),
        }
    }
}

/// Apply `plan` through `control`.
///
/// Failures are recorded per action and never abort other lanes. Once
/// `cancel` fires, actions not yet started are reported as skipped.
/// Results come back in plan order.
pub async fn apply<C: Control>(
    control: &C,
    desired: &DesiredState,
    plan: &ActionPlan,
    options: &ExecuteOptions,
    cancel: &CancellationToken,
) -> ApplyReport {
    let locks = HostLocks::new(plan);

    let mut lanes: Vec<(&str, Vec<(usize, &Action)>)> = Vec::new();
    for (index, action) in plan.iter().enumerate() {
        match lanes.iter_mut().find(|(vm, _)| *vm == action.vm) {
            Some((_, lane)) => lane.push((index, action)),
            None => lanes.push((&action.vm, vec![(index, action)])),
        }
    }

    let locks = &locks;
    let mut results: Vec<(usize, ActionResult)> = stream::iter(lanes.into_iter().map(
        |(vm, lane)| async move {
            let mut out = Vec::with_capacity(lane.len());
            let mut blocked: Option<String> = None;
            for (index, action) in lane {
                let started = Instant::now();
                let outcome = if let Some(reason) = &blocked {
                    Outcome::Skipped {
                        reason: reason.clone(),
                    }
                } else if cancel.is_cancelled() {
                    Outcome::Skipped {
                        reason: "interrupted".into(),
                    }
                } else {
                    run_action(control, desired, action, options, locks).await
                };
                match &outcome {
                    Outcome::Failed { error } => {
                        tracing::error!(vm, host = %action.host, action = action.kind.label(), %error, "action failed");
                        blocked = Some(format!("earlier {} failed", action.kind.label()));
                    }
                    Outcome::Skipped { reason } => {
                        tracing::info!(vm, action = action.kind.label(), %reason, "action skipped");
                    }
                    _ => {
                        tracing::info!(vm, host = %action.host, action = action.kind.label(), outcome = outcome.label(), "action done");
                    }
                }
                out.push((
                    index,
                    ActionResult {
                        action: action.clone(),
                        outcome,
                        elapsed: started.elapsed(),
                    },
                ));
            }
            out
        },
    ))
    .buffer_unordered(options.concurrency.max(1))
    .flat_map(stream::iter)
    .collect()
    .await;

    results.sort_by_key(|(index, _)| *index);
    ApplyReport {
        results: results.into_iter().map(|(_, r)| r).collect(),
    }
}

async fn run_action<C: Control>(
    control: &C,
    desired: &DesiredState,
    action: &Action,
    options: &ExecuteOptions,
    locks: &HostLocks,
) -> Outcome {
    let Some(host) = desired.hypervisor(&action.host) else {
        return Outcome::Failed {
            error: format!("unknown hypervisor '{}'", action.host),
        };
    };
    match execute(control, host, action, options, locks).await {
        Ok(Mutation::Done) => Outcome::Applied,
        Ok(Mutation::AlreadyAbsent) => Outcome::AlreadyAbsent,
        Err(e) => Outcome::Failed {
            error: e.to_string(),
        },
    }
}

async fn execute<C: Control>(
    control: &C,
    host: &HypervisorRecord,
    action: &Action,
    options: &ExecuteOptions,
    locks: &HostLocks,
) -> Result<Mutation, ProbeError> {
    let force = action.policy.force;
    let vm = action.vm.as_str();
    match &action.kind {
        ActionKind::Create { attributes, upload } => {
            if let Some(asset) = upload {
                upload_once(control, host, asset, options, locks).await?;
            }
            timed(host, options, control.create_vm(host, vm, attributes)).await
        }
        ActionKind::Destroy | ActionKind::MigrateDestroyOther { .. } => {
            timed(host, options, control.destroy_vm(host, vm, force)).await
        }
        ActionKind::UpdateAttr { key, value, upload } => {
            if let Some(asset) = upload {
                upload_once(control, host, asset, options, locks).await?;
            }
            timed(
                host,
                options,
                control.set_attribute(host, vm, *key, value, ApplyAt::Live, force),
            )
            .await
        }
        ActionKind::DeferUpdateAttr { key, value } => {
            // Staged for the next boot, never forced through now.
            timed(
                host,
                options,
                control.set_attribute(host, vm, *key, value, ApplyAt::NextBoot, false),
            )
            .await
        }
        ActionKind::CleanupAssets { assets } => {
            let _guard = match locks.locks.get(&host.name) {
                Some(lock) => Some(lock.lock().await),
                None => None,
            };
            let mut removed_any = assets.is_empty();
            for asset in assets {
                if timed(host, options, control.remove_asset(host, asset)).await? == Mutation::Done
                {
                    removed_any = true;
                }
            }
            Ok(if removed_any {
                Mutation::Done
            } else {
                Mutation::AlreadyAbsent
            })
        }
    }
}

async fn upload_once<C: Control>(
    control: &C,
    host: &HypervisorRecord,
    asset: &str,
    options: &ExecuteOptions,
    locks: &HostLocks,
) -> Result<(), ProbeError> {
    let Some(lock) = locks.locks.get(&host.name) else {
        return Ok(());
    };
    let mut uploaded = lock.lock().await;
    if uploaded.contains(asset) {
        tracing::debug!(host = %host.name, asset, "already uploaded in this run");
        return Ok(());
    }
    let local = options.asset_dir.join(asset);
    tracing::info!(host = %host.name, asset, path = %local.display(), "uploading asset");
    timed(host, options, control.upload_asset(host, asset, &local)).await?;
    uploaded.insert(asset.to_string());
    Ok(())
}

async fn timed<F>(host: &HypervisorRecord, options: &ExecuteOptions, call: F) -> Result<Mutation, ProbeError>
where
    F: Future<Output = Result<Mutation, ProbeError>>,
{
    tokio::time::timeout(options.timeout, call)
        .await
        .unwrap_or_else(|_| Err(ProbeError::timeout(&host.name)))
}
