use std::collections::BTreeSet;
use std::io::IsTerminal;
use std::path::Path;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use esxctl::assets;
use esxctl::builder::{self, BuildOptions, BuildOutcome};
use esxctl::cache::StateCache;
use esxctl::cli::{CacheCommand, Cli, Command, MapArgs, OutputFormat, PlanArgs, PowerArg};
use esxctl::config::{self, FleetConfig};
use esxctl::error::FleetError;
use esxctl::executor::{self, ApplyReport, ExecuteOptions};
use esxctl::logging::{self, RunJournal};
use esxctl::model::{AttrKey, DesiredState, HypervisorRecord, VmPath};
use esxctl::probe::transport::SshTransport;
use esxctl::probe::{Control, Mutation, PowerOp, RemoteHypervisor};
use esxctl::progress::{OutputMode, StepProgress};
use esxctl::reconcile::{self, ActionPlan, DiffRequest, DiffWarning, Policy};
use esxctl::report;
use esxctl::vm_state::{PhaseEvent, PhaseTracker};

/// Run journals kept per command.
const KEEP_JOURNALS: usize = 20;

/// Exit status when the run completed but some host or action failed.
const EXIT_PARTIAL: i32 = 2;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let output_format = resolve_output_format(&cli.output);
    let mode = resolve_output_mode(&output_format, cli.verbose, cli.quiet);
    if output_format != OutputFormat::Interactive {
        console::set_colors_enabled(false);
    }

    // Tracing to stderr would fight indicatif for the terminal in
    // Normal/Quiet mode.
    let terminal_filter = match mode {
        OutputMode::Verbose => EnvFilter::new("debug"),
        OutputMode::Normal | OutputMode::Quiet => EnvFilter::new("off"),
        OutputMode::Plain => EnvFilter::from_default_env()
            .add_directive("esxctl=info".parse().expect("valid log directive")),
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: esxctl=debug, buffered until the command is known
    let (file_writer, file_handle) = logging::DebugLog::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("esxctl=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let fleet = config::load_config(&cli.config)?;

    let logs_dir = esxctl::paths::logs_dir(&fleet.id);
    if matches!(
        cli.command,
        Command::Apply { .. } | Command::Destroy { .. } | Command::Power { .. }
    ) {
        std::fs::create_dir_all(&logs_dir).ok();
        file_handle.record_to(&logs_dir);
        std::fs::write(
            esxctl::paths::config_path_file(&fleet.id),
            fleet.config_path.display().to_string(),
        )
        .ok();
    } else {
        file_handle.discard();
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    let session = Session {
        remote: RemoteHypervisor::new(SshTransport::new(fleet.settings.timeout)),
        cache: StateCache::for_config(&fleet.id),
        fleet: &fleet,
        format: output_format,
        mode,
        cancel,
        logs_dir: &logs_dir,
    };

    let code = match cli.command {
        Command::Status { map, hosts } => run_status(&session, &map, &hosts).await?,
        Command::Plan { args } => run_plan(&session, &args).await?,
        Command::Apply {
            args,
            force,
            no_map,
        } => run_apply(&session, &args, force, no_map).await?,
        Command::Destroy {
            targets,
            force,
            skip_removal,
            no_map,
        } => run_destroy(&session, &targets, force, skip_removal, no_map).await?,
        Command::Power { op, vm, force } => run_power(&session, op, &vm, force).await?,
        Command::Cache {
            action: CacheCommand::Clear,
        } => {
            session.cache.invalidate()?;
            println!("Removed {}", session.cache.path().display());
            0
        }
        Command::Log {
            failed,
            all,
            esxctl,
        } => {
            handle_log_command(&logs_dir, failed, all, esxctl)?;
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

struct Session<'a> {
    fleet: &'a FleetConfig,
    remote: RemoteHypervisor<SshTransport>,
    cache: StateCache,
    format: OutputFormat,
    mode: OutputMode,
    cancel: CancellationToken,
    logs_dir: &'a Path,
}

impl Session<'_> {
    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn build_options(&self, map: &MapArgs, partial: bool) -> BuildOptions {
        let s = &self.fleet.settings;
        BuildOptions {
            ignore_unreachable: map.ignore_unreachable,
            concurrency: s.concurrency,
            timeout: s.timeout,
            retries: s.retries,
            partial,
            ..BuildOptions::default()
        }
    }

    fn records(&self, names: &BTreeSet<&str>) -> Result<Vec<HypervisorRecord>, FleetError> {
        names
            .iter()
            .map(|name| {
                self.fleet
                    .desired
                    .hypervisor(name)
                    .cloned()
                    .ok_or_else(|| FleetError::UnknownHost {
                        name: name.to_string(),
                    })
            })
            .collect()
    }

    /// The fleet map: from cache when fresh enough, otherwise probed and
    /// stored. A `scope` probes only those hosts, bypasses the cache and
    /// marks the map partial.
    async fn fleet_map(
        &self,
        progress: &mut StepProgress,
        map_args: &MapArgs,
        scope: Option<Vec<HypervisorRecord>>,
    ) -> Result<BuildOutcome, FleetError> {
        let scoped = scope.is_some();
        if !scoped && !map_args.refresh {
            if let Some(map) = self.cache.load(self.fleet.settings.cache_validity) {
                progress.skip(&format!(
                    "fleet map from cache ({}s old)",
                    map.age().as_secs()
                ));
                return Ok(BuildOutcome {
                    map,
                    errors: Vec::new(),
                });
            }
        }

        let hosts = scope.unwrap_or_else(|| self.fleet.desired.hypervisors.clone());
        let observer = progress.probe(hosts.len());
        let outcome = builder::build(
            &self.remote,
            &hosts,
            &self.build_options(map_args, scoped),
            &observer,
            &self.cancel,
        )
        .await;
        observer.finish();
        let outcome = outcome?;

        if !outcome.map.is_partial() {
            if let Err(e) = self.cache.store(&outcome.map) {
                tracing::warn!(error = %e, "could not store fleet map");
            }
        }
        Ok(outcome)
    }

    /// Desired state with local asset checksums filled in.
    async fn desired_with_assets(
        &self,
        progress: &mut StepProgress,
    ) -> Result<DesiredState, FleetError> {
        let mut desired = self.fleet.desired.clone();
        let names: BTreeSet<&str> = self
            .fleet
            .desired
            .vms
            .iter()
            .flat_map(|vm| {
                [AttrKey::BootMedia, AttrKey::Disk]
                    .into_iter()
                    .filter_map(|key| vm.attributes.get(key).value())
            })
            .collect();
        desired.assets = progress
            .run(
                "checksumming local assets",
                assets::catalog(&self.fleet.settings.asset_dir, names),
            )
            .await?;
        Ok(desired)
    }

    fn print_host_errors(&self, outcome: &BuildOutcome) {
        if self.json() {
            return;
        }
        for e in &outcome.errors {
            eprintln!("warning: {} excluded: {}", e.host, e.error);
        }
    }

    fn print_plan(&self, plan: &ActionPlan, warnings: &[DiffWarning]) -> Result<(), FleetError> {
        if self.json() {
            println!("{}", report::plan_json(plan, warnings)?);
        } else {
            print!("{}", report::plan_text(plan, warnings));
        }
        Ok(())
    }

    /// Execute `plan`, journal it, then re-probe the touched hosts and
    /// fold them into `map` for the cache.
    async fn execute(
        &self,
        progress: &mut StepProgress,
        command: &str,
        desired: &DesiredState,
        plan: &ActionPlan,
        map: &esxctl::fleet::FleetMap,
    ) -> Result<ApplyReport, FleetError> {
        let mut journal = RunJournal::new(self.logs_dir, command).map_err(|e| FleetError::Io {
            context: format!("creating run journal in {}", self.logs_dir.display()),
            source: e,
        })?;
        for action in plan {
            journal.write_line(&format!("planned: {action}"));
        }

        let options = ExecuteOptions {
            concurrency: self.fleet.settings.concurrency,
            timeout: self.fleet.settings.timeout,
            asset_dir: self.fleet.settings.asset_dir.clone(),
        };
        let report = progress
            .run(
                &format!("applying {} action(s)", plan.len()),
                executor::apply(&self.remote, desired, plan, &options, &self.cancel),
            )
            .await;

        for r in &report.results {
            journal.write_line(&format!("{}: {}", r.outcome.label(), r.action));
        }
        let path = journal.finish(report.is_success());
        logging::rotate_journals(self.logs_dir, command, KEEP_JOURNALS);
        tracing::info!(journal = %path.display(), "run journal written");

        self.refresh_after(progress, &report, map).await?;
        Ok(report)
    }

    async fn refresh_after(
        &self,
        progress: &mut StepProgress,
        report: &ApplyReport,
        map: &esxctl::fleet::FleetMap,
    ) -> Result<(), FleetError> {
        let touched = report.touched_hosts();
        if touched.is_empty() || self.cancel.is_cancelled() {
            return self.cache.invalidate();
        }
        let names: BTreeSet<&str> = touched.iter().map(String::as_str).collect();
        let hosts = self.records(&names)?;
        let observer = progress.probe(hosts.len());
        let options = BuildOptions {
            ignore_unreachable: true,
            ..self.build_options(&MapArgs::default(), true)
        };
        let fresh = builder::build(&self.remote, &hosts, &options, &observer, &self.cancel).await;
        observer.finish();

        match fresh {
            Ok(fresh) if fresh.errors.is_empty() => {
                let updated = map.overlay(fresh.map);
                if updated.is_partial() {
                    self.cache.invalidate()
                } else {
                    self.cache.store(&updated)
                }
            }
            Ok(_) | Err(_) => {
                tracing::warn!("re-probe after apply incomplete, dropping cached map");
                self.cache.invalidate()
            }
        }
    }

    fn print_report(&self, report: &ApplyReport) -> Result<(), FleetError> {
        if self.json() {
            println!("{}", report::results_json(report)?);
        } else {
            print!("{}", report::results_text(report));
        }
        Ok(())
    }
}

// ── Commands ──────────────────────────────────────────────

async fn run_status(
    session: &Session<'_>,
    map_args: &MapArgs,
    hosts: &[String],
) -> miette::Result<i32> {
    let mut progress = StepProgress::new(1, session.mode);
    let (records, scope) = if hosts.is_empty() {
        (session.fleet.desired.hypervisors.clone(), None)
    } else {
        let names: BTreeSet<&str> = hosts.iter().map(String::as_str).collect();
        let records = session.records(&names)?;
        (records.clone(), Some(records))
    };

    let outcome = session.fleet_map(&mut progress, map_args, scope).await?;
    if session.json() {
        println!(
            "{}",
            report::status_json(&records, &outcome.map, &outcome.errors)?
        );
    } else {
        print!(
            "{}",
            report::status_text(&records, &outcome.map, &outcome.errors)
        );
    }
    Ok(if outcome.errors.is_empty() { 0 } else { EXIT_PARTIAL })
}

fn plan_policy(args: &PlanArgs) -> Policy {
    Policy {
        relocate: args.relocate,
        trust: args.trust,
        skip_removal: args.skip_removal,
        ..Policy::default()
    }
}

fn parse_paths(paths: &[String]) -> Result<Vec<VmPath>, FleetError> {
    paths
        .iter()
        .map(|p| {
            p.parse::<VmPath>()
                .map_err(|message| FleetError::Validation { message })
        })
        .collect()
}

fn only_vms(desired: &DesiredState, vms: &[String]) -> Result<Option<BTreeSet<String>>, FleetError> {
    if vms.is_empty() {
        return Ok(None);
    }
    for name in vms {
        if desired.vm(name).is_none() {
            return Err(FleetError::UnknownVm { name: name.clone() });
        }
    }
    Ok(Some(vms.iter().cloned().collect()))
}

async fn run_plan(session: &Session<'_>, args: &PlanArgs) -> miette::Result<i32> {
    let mut progress = StepProgress::new(3, session.mode);
    let only = only_vms(&session.fleet.desired, &args.vms)?;
    let prefer = parse_paths(&args.prefer)?;
    let mut outcome = session.fleet_map(&mut progress, &args.map, None).await?;
    outcome.map = outcome.map.resolve_preferred(&prefer)?;
    session.print_host_errors(&outcome);
    let desired = session.desired_with_assets(&mut progress).await?;

    let request = DiffRequest {
        only,
        ..DiffRequest::new(plan_policy(args))
    };
    let (plan, warnings) = progress
        .run("planning", async {
            reconcile::diff(&desired, &outcome.map, &request)
        })
        .await;
    session.print_plan(&plan, &warnings)?;
    Ok(if outcome.errors.is_empty() { 0 } else { EXIT_PARTIAL })
}

async fn run_apply(
    session: &Session<'_>,
    args: &PlanArgs,
    force: bool,
    no_map: bool,
) -> miette::Result<i32> {
    let mut progress = StepProgress::new(5, session.mode);
    let desired_vms = &session.fleet.desired;
    let only = only_vms(desired_vms, &args.vms)?;
    let prefer = parse_paths(&args.prefer)?;

    let scope = if no_map {
        let names: BTreeSet<&str> = args
            .vms
            .iter()
            .filter_map(|vm| desired_vms.vm(vm).map(|vm| vm.host.as_str()))
            .collect();
        Some(session.records(&names)?)
    } else {
        None
    };
    let mut outcome = session.fleet_map(&mut progress, &args.map, scope).await?;
    outcome.map = outcome.map.resolve_preferred(&prefer)?;
    session.print_host_errors(&outcome);
    let desired = session.desired_with_assets(&mut progress).await?;

    let policy = Policy {
        force,
        no_map,
        ..plan_policy(args)
    };
    let request = DiffRequest {
        only: only.clone(),
        ..DiffRequest::new(policy)
    };
    let (plan, warnings) = progress
        .run("planning", async {
            reconcile::diff(&desired, &outcome.map, &request)
        })
        .await;

    let in_scope: Vec<_> = desired
        .vms
        .iter()
        .filter(|vm| only.as_ref().is_none_or(|o| o.contains(&vm.name)))
        .collect();
    let mut tracker = PhaseTracker::new(in_scope.iter().map(|vm| vm.name.as_str()));
    let planned: BTreeSet<&str> = plan.vms().into_iter().collect();
    for vm in &in_scope {
        if outcome.map.inventory(&vm.host).is_some() {
            tracker.observe(&vm.name, PhaseEvent::Probed);
            tracker.observe(
                &vm.name,
                PhaseEvent::Diffed {
                    planned: planned.contains(vm.name.as_str()),
                },
            );
        }
    }

    if !session.json() {
        print!("{}", report::plan_text(&plan, &warnings));
    }
    if plan.is_empty() {
        if session.json() {
            println!("{}", report::results_json(&ApplyReport::default())?);
        }
        return Ok(if outcome.errors.is_empty() { 0 } else { EXIT_PARTIAL });
    }

    let report = session
        .execute(&mut progress, "apply", &desired, &plan, &outcome.map)
        .await?;
    for (vm, ok) in report.vm_outcomes() {
        tracker.observe(&vm, PhaseEvent::Executed { ok });
    }
    session.print_report(&report)?;

    let summary: Vec<String> = tracker
        .counts()
        .into_iter()
        .map(|(phase, n)| format!("{n} {phase}"))
        .collect();
    progress.println(&format!("VMs: {}", summary.join(", ")));

    if session.cancel.is_cancelled() {
        return Err(FleetError::Cancelled.into());
    }
    Ok(if report.is_success() && outcome.errors.is_empty() {
        0
    } else {
        EXIT_PARTIAL
    })
}

async fn run_destroy(
    session: &Session<'_>,
    targets: &[String],
    force: bool,
    skip_removal: bool,
    no_map: bool,
) -> miette::Result<i32> {
    let mut progress = StepProgress::new(3, session.mode);
    let targets = parse_paths(targets)?;
    let names: BTreeSet<&str> = targets.iter().map(|t| t.host.as_str()).collect();
    let records = session.records(&names)?;

    let outcome = session
        .fleet_map(&mut progress, &MapArgs::default(), no_map.then_some(records))
        .await?;
    session.print_host_errors(&outcome);

    let policy = Policy {
        force,
        skip_removal,
        no_map,
        ..Policy::default()
    };
    let request = DiffRequest {
        destroy_targets: targets,
        only: Some(BTreeSet::new()),
        ..DiffRequest::new(policy)
    };
    let desired = &session.fleet.desired;
    let (plan, warnings) = reconcile::diff(desired, &outcome.map, &request);
    if !session.json() {
        print!("{}", report::plan_text(&plan, &warnings));
    }
    if plan.is_empty() {
        if session.json() {
            println!("{}", report::results_json(&ApplyReport::default())?);
        }
        // Every target was refused.
        return Ok(EXIT_PARTIAL);
    }

    let report = session
        .execute(&mut progress, "destroy", desired, &plan, &outcome.map)
        .await?;
    session.print_report(&report)?;

    if session.cancel.is_cancelled() {
        return Err(FleetError::Cancelled.into());
    }
    Ok(if report.is_success() && warnings.is_empty() {
        0
    } else {
        EXIT_PARTIAL
    })
}

async fn run_power(
    session: &Session<'_>,
    op: PowerArg,
    vm: &str,
    force: bool,
) -> miette::Result<i32> {
    let mut progress = StepProgress::new(2, session.mode);
    let outcome = session
        .fleet_map(&mut progress, &MapArgs::default(), None)
        .await?;
    if let Some(collision) = outcome.map.collision(vm) {
        return Err(FleetError::Collision {
            name: vm.to_string(),
            hosts: collision.hosts.join(", "),
        }
        .into());
    }
    let found = outcome
        .map
        .get(vm)
        .ok_or_else(|| FleetError::UnknownVm { name: vm.to_string() })?;
    let host = session
        .fleet
        .desired
        .hypervisor(&found.host)
        .ok_or_else(|| FleetError::UnknownHost {
            name: found.host.clone(),
        })?;

    let op = match op {
        PowerArg::On => PowerOp::On,
        PowerArg::Off => PowerOp::Off,
        PowerArg::Reboot => PowerOp::Reboot,
    };
    let mut journal = RunJournal::new(session.logs_dir, "power").map_err(|e| FleetError::Io {
        context: format!("creating run journal in {}", session.logs_dir.display()),
        source: e,
    })?;
    let result = progress
        .run(&format!("power {op} {}/{vm}", host.name), async {
            tokio::select! {
                _ = session.cancel.cancelled() => Err(FleetError::Cancelled),
                r = tokio::time::timeout(
                    session.fleet.settings.timeout,
                    session.remote.power(host, vm, op, force),
                ) => Ok(r),
            }
        })
        .await?;
    session.cache.invalidate()?;

    let code = match result {
        Ok(Ok(Mutation::Done)) => {
            journal.write_line(&format!("power {op} {}/{vm}: applied", host.name));
            println!("{}/{vm}: power {op}", host.name);
            0
        }
        Ok(Ok(Mutation::AlreadyAbsent)) => {
            journal.write_line(&format!("power {op} {}/{vm}: absent", host.name));
            println!("{}/{vm}: not found on {}", host.name, host.name);
            EXIT_PARTIAL
        }
        Ok(Err(e)) => {
            journal.write_line(&format!("power {op} {}/{vm}: {e}", host.name));
            eprintln!("error: {e}");
            EXIT_PARTIAL
        }
        Err(_) => {
            journal.write_line(&format!("power {op} {}/{vm}: timed out", host.name));
            eprintln!("error: {}: timed out", host.name);
            EXIT_PARTIAL
        }
    };
    journal.finish(code == 0);
    logging::rotate_journals(session.logs_dir, "power", KEEP_JOURNALS);
    Ok(code)
}

fn handle_log_command(
    logs_dir: &Path,
    failed: bool,
    all: bool,
    esxctl_log: bool,
) -> miette::Result<()> {
    if esxctl_log {
        let log_path = logs_dir.join(logging::DEBUG_LOG);
        if log_path.exists() {
            let contents = std::fs::read_to_string(&log_path).map_err(|e| FleetError::Io {
                context: format!("reading {}", log_path.display()),
                source: e,
            })?;
            print!("{contents}");
        } else {
            println!("No esxctl.log found. Run `esxctl apply` first.");
        }
        return Ok(());
    }

    if all {
        let journals = logging::list_journals(logs_dir);
        if journals.is_empty() {
            println!("No run journals found.");
        } else {
            for entry in &journals {
                let status_indicator = if entry.status == "failed" {
                    "FAIL"
                } else {
                    " OK "
                };
                println!(
                    "[{status_indicator}] {} {} ({})",
                    entry.timestamp,
                    entry.command,
                    entry.path.display()
                );
            }
        }
        return Ok(());
    }

    match logging::latest_journal(logs_dir, failed) {
        Some(path) => {
            let contents = std::fs::read_to_string(&path).map_err(|e| FleetError::Io {
                context: format!("reading {}", path.display()),
                source: e,
            })?;
            let fname = path.file_name().and_then(|f| f.to_str()).unwrap_or("?");
            println!("--- {fname} ---");
            print!("{contents}");
        }
        None => {
            if failed {
                println!("No failed runs found.");
            } else {
                println!("No run journals found. Run `esxctl apply` first.");
            }
        }
    }

    Ok(())
}

/// Resolve `Auto` to a concrete format based on terminal detection.
fn resolve_output_format(format: &OutputFormat) -> OutputFormat {
    match format {
        OutputFormat::Auto => {
            if !std::io::stdout().is_terminal() || !std::io::stderr().is_terminal() {
                OutputFormat::Plain
            } else {
                OutputFormat::Interactive
            }
        }
        other => other.clone(),
    }
}

/// Map the resolved output format (plus `--verbose`/`--quiet` modifiers)
/// into the `OutputMode` used by `StepProgress`.
fn resolve_output_mode(format: &OutputFormat, verbose: bool, quiet: bool) -> OutputMode {
    match format {
        OutputFormat::Json => {
            if verbose || quiet {
                eprintln!("warning: --verbose/--quiet ignored in JSON output mode");
            }
            OutputMode::Plain
        }
        OutputFormat::Plain => {
            if quiet {
                OutputMode::Quiet
            } else if verbose {
                OutputMode::Verbose
            } else {
                OutputMode::Plain
            }
        }
        OutputFormat::Interactive | OutputFormat::Auto => {
            if quiet {
                OutputMode::Quiet
            } else if verbose {
                OutputMode::Verbose
            } else {
                OutputMode::Normal
            }
        }
    }
}
