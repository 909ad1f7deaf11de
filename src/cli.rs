use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "esxctl", about = "Declarative VM reconciliation for ESXi hypervisor fleets")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "esxctl.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only print final results
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Auto, global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    /// Interactive on a terminal, plain otherwise
    Auto,
    Plain,
    Interactive,
    Json,
}

/// How the fleet map is obtained.
#[derive(Args, Debug, Clone, Default)]
pub struct MapArgs {
    /// Ignore the cached fleet map and probe every hypervisor
    #[arg(long)]
    pub refresh: bool,

    /// Continue without hypervisors that cannot be reached
    #[arg(long)]
    pub ignore_unreachable: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct PlanArgs {
    /// Destroy instances found on the wrong hypervisor and recreate them
    /// on the declared one
    #[arg(long)]
    pub relocate: bool,

    /// Compare boot media by name only, skipping checksum verification
    #[arg(long)]
    pub trust: bool,

    /// Leave unused boot and disk assets on the hypervisor
    #[arg(long)]
    pub skip_removal: bool,

    /// Take HOST/VM as the authoritative instance of a name several
    /// hypervisors report
    #[arg(long, value_name = "HOST/VM")]
    pub prefer: Vec<String>,

    #[command(flatten)]
    pub map: MapArgs,

    /// Limit the plan to these VMs
    pub vms: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show where every VM runs and in what state
    Status {
        #[command(flatten)]
        map: MapArgs,

        /// Only show these hypervisors
        hosts: Vec<String>,
    },

    /// Show the actions needed to reach the declared state
    Plan {
        #[command(flatten)]
        args: PlanArgs,
    },

    /// Compute and execute the plan
    Apply {
        #[command(flatten)]
        args: PlanArgs,

        /// Escalate soft failures to hard power operations
        #[arg(long)]
        force: bool,

        /// Probe only the declared hypervisor of each named VM, without cache
        #[arg(long, requires = "vms")]
        no_map: bool,
    },

    /// Destroy VMs that are no longer declared
    Destroy {
        /// Targets as HOST/VM
        #[arg(required = true)]
        targets: Vec<String>,

        /// Escalate soft failures to hard power operations
        #[arg(long)]
        force: bool,

        /// Leave unused boot and disk assets on the hypervisor
        #[arg(long)]
        skip_removal: bool,

        /// Probe only the target hypervisors, without cache
        #[arg(long)]
        no_map: bool,
    },

    /// Power a VM on, off, or reboot it
    Power {
        #[arg(value_enum)]
        op: PowerArg,

        vm: String,

        /// Hard power-off or reset if the guest does not respond
        #[arg(long)]
        force: bool,
    },

    /// Manage the cached fleet map
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Show run journals of previous apply and destroy runs
    Log {
        /// Show the most recent failed run
        #[arg(long)]
        failed: bool,

        /// List all runs
        #[arg(long, conflicts_with = "failed")]
        all: bool,

        /// Show the debug log instead of run journals
        #[arg(long, conflicts_with_all = ["failed", "all"])]
        esxctl: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerArg {
    On,
    Off,
    Reboot,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Delete the cached fleet map for this config
    Clear,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_flags_parse() {
        let cli = Cli::try_parse_from([
            "esxctl", "-c", "fleet.toml", "apply", "--relocate", "--force", "--refresh", "web1",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("fleet.toml"));
        let Command::Apply { args, force, no_map } = cli.command else {
            panic!("expected apply");
        };
        assert!(args.relocate && force && args.map.refresh);
        assert!(!no_map && !args.trust);
        assert_eq!(args.vms, vec!["web1".to_string()]);
    }

    #[test]
    fn no_map_needs_a_vm() {
        assert!(Cli::try_parse_from(["esxctl", "apply", "--no-map"]).is_err());
        assert!(Cli::try_parse_from(["esxctl", "apply", "--no-map", "web1"]).is_ok());
    }

    #[test]
    fn prefer_repeats() {
        let cli = Cli::try_parse_from([
            "esxctl", "plan", "--prefer", "esx1/web1", "--prefer", "esx2/db1",
        ])
        .unwrap();
        let Command::Plan { args } = cli.command else {
            panic!("expected plan");
        };
        assert_eq!(args.prefer, ["esx1/web1", "esx2/db1"]);
    }

    #[test]
    fn destroy_needs_targets() {
        assert!(Cli::try_parse_from(["esxctl", "destroy"]).is_err());
    }

    #[test]
    fn output_flag_is_global() {
        let cli = Cli::try_parse_from(["esxctl", "status", "--output", "json"]).unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
    }
}
