use std::rc::Rc;

use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use itertools::Itertools;

use gce::rest::{RestTransport, TokenSource};
use slurmgcp::common::cli::{
    CommonOpts, HostlistCommand, HostlistOpts, NodelistOpts, RootOptions, SubCommand,
};
use slurmgcp::common::config::ClusterConfig;
use slurmgcp::common::env::Tunables;
use slurmgcp::common::hostlist::{compress_hostlist, expand_hostlist, expand_hostlists};
use slurmgcp::common::lock::{lock_path, try_lock};
use slurmgcp::common::setup::{LogOptions, setup_logging};
use slurmgcp::context::Context;
use slurmgcp::scheduler::ScontrolCli;
use slurmgcp::sync::{NodeStatus, node_status, run_sync};
use slurmgcp::{resume, suspend};

fn make_context(config: ClusterConfig) -> anyhow::Result<Context> {
    let mut transport = RestTransport::new(TokenSource::Metadata)?.with_trace(config.trace_api());
    if let Some(version) = &config.endpoint_versions.compute {
        transport = transport.with_compute_root(&format!(
            "https://compute.googleapis.com/compute/{version}/"
        ));
    }
    if let Some(version) = &config.endpoint_versions.tpu {
        transport = transport.with_tpu_root(&format!("https://tpu.googleapis.com/{version}/"));
    }
    let control = ScontrolCli::new(config.scontrol());
    Ok(Context::new(
        config,
        Rc::new(transport),
        Rc::new(control),
        Tunables::from_env(),
    ))
}

fn load_config(opts: &CommonOpts) -> anyhow::Result<ClusterConfig> {
    let mut config = ClusterConfig::load(&opts.config)?;
    if let Some(role) = opts.role {
        config.instance_role = Some(role);
    }
    if opts.trace_api {
        config
            .extra_logging_flags
            .insert("trace_api".to_string(), true);
    }
    Ok(config)
}

async fn command_resume(config: ClusterConfig, opts: NodelistOpts) -> anyhow::Result<()> {
    let ctx = make_context(config)?;
    resume::resume(&ctx, &opts.nodelist).await?;
    Ok(())
}

async fn command_suspend(config: ClusterConfig, opts: NodelistOpts) -> anyhow::Result<()> {
    let ctx = make_context(config)?;
    suspend::suspend(&ctx, &opts.nodelist).await?;
    Ok(())
}

async fn command_sync(config: ClusterConfig, common: &CommonOpts) -> anyhow::Result<()> {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let ctx = make_context(config)?;
    run_sync(&ctx, &common.config, &hostname).await?;
    Ok(())
}

fn status_color(status: &NodeStatus) -> colored::Color {
    match status {
        NodeStatus::Unchanged => colored::Color::Green,
        NodeStatus::Unknown { .. } | NodeStatus::Down { .. } => colored::Color::Red,
        _ => colored::Color::Yellow,
    }
}

async fn command_classify(config: ClusterConfig, opts: NodelistOpts) -> anyhow::Result<()> {
    let ctx = make_context(config)?;
    let mut statuses = Vec::new();
    for node in expand_hostlist(&opts.nodelist)? {
        let status = node_status(&ctx, &node).await?;
        statuses.push((status, node));
    }
    for (status, nodes) in statuses.into_iter().into_group_map().into_iter().sorted() {
        println!(
            "{}: {}",
            status.to_string().color(status_color(&status)),
            compress_hostlist(&nodes)
        );
    }
    Ok(())
}

fn command_hostlist(opts: HostlistOpts) -> anyhow::Result<()> {
    match opts.subcmd {
        HostlistCommand::Expand { hostlists } => {
            for name in expand_hostlists(&hostlists)? {
                println!("{name}");
            }
        }
        HostlistCommand::Compress { names } => println!("{}", compress_hostlist(&names)),
    }
    Ok(())
}

async fn run(top_opts: RootOptions) -> anyhow::Result<()> {
    let RootOptions { common, subcmd } = top_opts;
    if let SubCommand::Hostlist(opts) = subcmd {
        return command_hostlist(opts);
    }

    let _lock = match subcmd.lock_name() {
        Some(name) => {
            let path = lock_path(name);
            match try_lock(&path)? {
                Some(lock) => Some(lock),
                None => {
                    log::info!("{} is already running, exiting", path.display());
                    return Ok(());
                }
            }
        }
        None => None,
    };

    let config = load_config(&common)?;
    match subcmd {
        SubCommand::Resume(opts) => command_resume(config, opts).await,
        SubCommand::Suspend(opts) => command_suspend(config, opts).await,
        SubCommand::Sync => command_sync(config, &common).await,
        SubCommand::Classify(opts) => command_classify(config, opts).await,
        SubCommand::Hostlist(_) => Ok(()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    let config = ClusterConfig::load(&top_opts.common.config).ok();
    setup_logging(LogOptions {
        debug: top_opts.common.debug
            || config.as_ref().is_some_and(|c| c.enable_debug_logging),
        trace_api: top_opts.common.trace_api || config.as_ref().is_some_and(|c| c.trace_api()),
    });

    if let Err(error) = run(top_opts).await {
        log::error!("{error:?}");
        std::process::exit(1);
    }
}
