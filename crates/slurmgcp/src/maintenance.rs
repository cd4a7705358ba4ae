//! Slurm reservations and jobs around scheduled host maintenance of instances.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::common::config::NodesetConfig;
use crate::context::Context;

/// Script submitted by opportunistic maintenance jobs, from the custom scripts directory.
pub const MAINTENANCE_SCRIPT: &str = "perform_maintenance.sh";

/// Name of the reservation and of the job covering maintenance of `node`.
pub fn maintenance_name(node: &str) -> String {
    format!("{node}_maintenance")
}

/// `<node>_maintenance -> (node, window start)` of compute instances with scheduled maintenance.
async fn upcoming_maintenance(
    ctx: &Context,
) -> crate::Result<BTreeMap<String, (String, DateTime<Utc>)>> {
    Ok(ctx
        .inventory()
        .instances()
        .await?
        .values()
        .filter(|instance| instance.role == "compute")
        .filter_map(|instance| {
            let start = instance.upcoming_maintenance?.with_timezone(&Utc);
            Some((
                maintenance_name(&instance.name),
                (instance.name.clone(), start),
            ))
        })
        .collect())
}

fn nodeset_flag(ctx: &Context, node: &str, flag: impl Fn(&NodesetConfig) -> bool) -> bool {
    match ctx.inventory().node_nodeset(node) {
        Ok(nodeset) => flag(nodeset),
        Err(error) => {
            log::debug!("No maintenance settings for {node}: {error}");
            false
        }
    }
}

fn same_start(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_milliseconds().abs() <= 1000
}

/// Keeps a maintenance reservation for each node with scheduled maintenance
/// in nodesets that enable it, and removes the rest.
pub async fn sync_maintenance_reservations(ctx: &Context) -> crate::Result<()> {
    let upcoming = upcoming_maintenance(ctx).await?;
    let scheduler = ctx.scheduler();
    let current: BTreeMap<String, DateTime<Utc>> = scheduler
        .show_reservations()
        .await?
        .into_iter()
        .filter(|r| r.node_count == 1 && r.name == maintenance_name(&r.node_list))
        .map(|r| (r.name, r.start_time))
        .collect();

    let delete = |name: String| async move {
        if let Err(error) = scheduler.delete_reservation(&name).await {
            log::error!("Cannot delete reservation {name}: {error:?}");
        }
    };

    for name in current.keys().filter(|name| !upcoming.contains_key(*name)) {
        delete(name.clone()).await;
    }

    for (name, (node, start)) in &upcoming {
        let existing = current.get(name);
        if !nodeset_flag(ctx, node, |nodeset| nodeset.enable_maintenance_reservation) {
            if existing.is_some() {
                delete(name.clone()).await;
            }
            continue;
        }
        match existing {
            Some(existing) if same_start(*existing, *start) => continue,
            Some(_) => {
                log::info!("Maintenance window of {node} moved to {start}");
                delete(name.clone()).await;
            }
            None => {}
        }
        if let Err(error) = scheduler
            .create_maintenance_reservation(name, node, *start)
            .await
        {
            log::error!("Cannot create reservation {name}: {error:?}");
        }
    }
    Ok(())
}

/// Submits a pending maintenance job for each node with scheduled maintenance
/// in nodesets that enable it, so that maintenance runs once the node is free.
pub async fn sync_opportunistic_maintenance(ctx: &Context) -> crate::Result<()> {
    let upcoming = upcoming_maintenance(ctx).await?;
    let scheduler = ctx.scheduler();
    let current: BTreeMap<&str, &str> = ctx
        .inventory()
        .jobs()
        .await?
        .iter()
        .filter(|job| job.job_state == "PENDING")
        .filter_map(|job| {
            let name = job.name.as_deref()?;
            let node = job.required_nodes.as_deref()?;
            (name == maintenance_name(node)).then_some((name, node))
        })
        .collect();

    let cancel = |name: &str| {
        let name = name.to_string();
        async move {
            if let Err(error) = scheduler.cancel_jobs_named(&name).await {
                log::error!("Cannot cancel job {name}: {error:?}");
            }
        }
    };

    for name in current.keys().filter(|name| !upcoming.contains_key(**name)) {
        cancel(*name).await;
    }

    let script = ctx.config().custom_scripts_dir.join(MAINTENANCE_SCRIPT);
    for (name, (node, _)) in &upcoming {
        let exists = current.contains_key(name.as_str());
        if !nodeset_flag(ctx, node, |nodeset| nodeset.enable_opportunistic_maintenance) {
            if exists {
                cancel(name.as_str()).await;
            }
            continue;
        }
        if exists {
            continue;
        }
        if let Err(error) = scheduler.submit_node_job(name, node, &script).await {
            log::error!("Cannot submit maintenance job {name}: {error:?}");
        }
    }
    Ok(())
}
