use std::path::PathBuf;

use clap::{Parser, ValueHint};

use crate::common::config::{DEFAULT_SCRIPTS_DIR, InstanceRole};

pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_SCRIPTS_DIR).join("config.yaml")
}

#[derive(Parser)]
pub struct CommonOpts {
    /// Path to the cluster configuration
    #[arg(
        long,
        global = true,
        env = "SLURM_CONFIG_YAML",
        default_value_os_t = default_config_path(),
        value_hint = ValueHint::FilePath,
        help_heading("GLOBAL OPTIONS")
    )]
    pub config: PathBuf,

    /// Enables more detailed log output
    #[arg(
        long,
        global = true,
        env = "SLURMGCP_DEBUG",
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,

    /// Logs every request sent to the cloud API
    #[arg(
        long,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub trace_api: bool,

    /// Overrides the role of this instance set in the configuration
    #[arg(
        long,
        global = true,
        env = "SLURMGCP_INSTANCE_ROLE",
        value_enum,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub role: Option<InstanceRole>,
}

// Root CLI options
#[derive(Parser)]
#[command(author, about, version)]
#[command(name = "slurmgcp")]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Creates instances for powered up nodes (Slurm ResumeProgram)
    Resume(NodelistOpts),
    /// Deletes instances of powered down nodes (Slurm SuspendProgram)
    Suspend(NodelistOpts),
    /// Reconciles Slurm nodes with their instances
    Sync,
    /// Prints the reconciliation status of nodes without changing anything
    Classify(NodelistOpts),
    /// Works with hostlist expressions
    Hostlist(HostlistOpts),
}

#[derive(Parser)]
pub struct NodelistOpts {
    /// Hostlist expression, e.g. `cluster-nodeset-[0-3,7]`
    pub nodelist: String,
}

#[derive(Parser)]
pub struct HostlistOpts {
    #[clap(subcommand)]
    pub subcmd: HostlistCommand,
}

#[derive(Parser)]
pub enum HostlistCommand {
    /// Prints every node name of the expressions, one per line
    Expand {
        #[arg(required = true)]
        hostlists: Vec<String>,
    },
    /// Prints the shortest expression covering the given node names
    Compress {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

impl SubCommand {
    /// Name of the lock file guarding concurrent runs of the command.
    pub fn lock_name(&self) -> Option<&'static str> {
        match self {
            SubCommand::Resume(_) => Some("slurmresume"),
            SubCommand::Suspend(_) => Some("slurmsuspend"),
            SubCommand::Sync => Some("slurmsync"),
            SubCommand::Classify(_) | SubCommand::Hostlist(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_global_options_after_subcommand() {
        let opts = RootOptions::try_parse_from([
            "slurmgcp",
            "resume",
            "hpc-n-[0-3]",
            "--config",
            "/tmp/config.yaml",
            "--role",
            "compute",
            "--debug",
        ])
        .unwrap();
        assert_eq!(opts.common.config, PathBuf::from("/tmp/config.yaml"));
        assert_eq!(opts.common.role, Some(InstanceRole::Compute));
        assert!(opts.common.debug);
        assert!(!opts.common.trace_api);
        match opts.subcmd {
            SubCommand::Resume(NodelistOpts { nodelist }) => assert_eq!(nodelist, "hpc-n-[0-3]"),
            _ => panic!("expected resume"),
        }
    }

    #[test]
    fn lock_per_command() {
        let opts = RootOptions::try_parse_from(["slurmgcp", "sync"]).unwrap();
        assert_eq!(opts.subcmd.lock_name(), Some("slurmsync"));
        let opts =
            RootOptions::try_parse_from(["slurmgcp", "hostlist", "compress", "a-1", "a-2"])
                .unwrap();
        assert_eq!(opts.subcmd.lock_name(), None);
        assert!(RootOptions::try_parse_from(["slurmgcp", "hostlist", "expand"]).is_err());
    }
}
