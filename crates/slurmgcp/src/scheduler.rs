//! Access to the Slurm controller through `scontrol`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use futures::future::LocalBoxFuture;
use serde::Deserialize;
use serde_json::Value;

use crate::common::hostlist::{compress_hostlist, expand_hostlist};
use crate::common::utils::run_command;

const SCONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(120);
const MAINTENANCE_RESERVATION_MINUTES: u32 = 180;

/// Flags that mean that Slurm manages the power state of the node.
pub const POWER_FLAGS: [&str; 4] = [
    "POWER_DOWN",
    "POWERING_UP",
    "POWERING_DOWN",
    "POWERED_DOWN",
];

/// Node state as printed by `scontrol`, e.g. `IDLE+CLOUD+POWERED_DOWN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub base: String,
    pub flags: BTreeSet<String>,
}

impl NodeState {
    pub fn parse(state: &str) -> Self {
        let mut parts = state.split('+');
        let base = parts.next().unwrap_or_default().to_string();
        NodeState {
            base,
            flags: parts.map(|flag| flag.to_string()).collect(),
        }
    }

    pub fn has(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_down(&self) -> bool {
        self.base == "DOWN"
    }

    pub fn has_power_flags(&self) -> bool {
        POWER_FLAGS.iter().any(|flag| self.has(flag))
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)?;
        for flag in &self.flags {
            write!(f, "+{flag}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobInfo {
    pub job_id: u64,
    pub name: Option<String>,
    pub job_state: String,
    pub partition: Option<String>,
    pub nodes: Vec<String>,
    /// `ReqNodeList` as written by the submitter.
    pub required_nodes: Option<String>,
    pub time_limit: Option<Duration>,
}

/// Reservation from `scontrol show reservation --json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub name: String,
    pub node_list: String,
    pub node_count: u64,
    pub start_time: DateTime<Utc>,
}

/// Executes Slurm and service management commands, returns their stdout.
pub trait SlurmControl {
    fn scontrol<'a>(&'a self, args: Vec<String>) -> LocalBoxFuture<'a, anyhow::Result<String>>;
    fn systemctl<'a>(&'a self, args: Vec<String>) -> LocalBoxFuture<'a, anyhow::Result<String>>;
    /// Other Slurm client commands, e.g. `sbatch` or `scancel`.
    fn slurm_tool<'a>(
        &'a self,
        tool: &'a str,
        args: Vec<String>,
    ) -> LocalBoxFuture<'a, anyhow::Result<String>>;
}

/// Runs the real binaries.
pub struct ScontrolCli {
    scontrol: PathBuf,
}

impl ScontrolCli {
    pub fn new(scontrol: PathBuf) -> Self {
        Self { scontrol }
    }
}

impl SlurmControl for ScontrolCli {
    fn scontrol<'a>(&'a self, args: Vec<String>) -> LocalBoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move { run_command(&self.scontrol, &args, SCONTROL_TIMEOUT).await })
    }

    fn systemctl<'a>(&'a self, args: Vec<String>) -> LocalBoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            run_command(&PathBuf::from("systemctl"), &args, SYSTEMCTL_TIMEOUT).await
        })
    }

    fn slurm_tool<'a>(
        &'a self,
        tool: &'a str,
        args: Vec<String>,
    ) -> LocalBoxFuture<'a, anyhow::Result<String>> {
        // Client tools are installed next to scontrol
        let program = self.scontrol.with_file_name(tool);
        Box::pin(async move { run_command(&program, &args, SCONTROL_TIMEOUT).await })
    }
}

/// Typed operations over [`SlurmControl`].
#[derive(Clone)]
pub struct Scheduler {
    control: Rc<dyn SlurmControl>,
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

impl Scheduler {
    pub fn new(control: Rc<dyn SlurmControl>) -> Self {
        Self { control }
    }

    /// Cloud and dynamic nodes known to Slurm.
    pub async fn show_nodes(&self) -> anyhow::Result<BTreeMap<String, NodeState>> {
        let output = self.control.scontrol(args(["show", "nodes"])).await?;
        Ok(parse_nodes(&output)
            .into_iter()
            .filter(|(_, state)| state.has("CLOUD") || state.has("DYNAMIC_NORM"))
            .collect())
    }

    pub async fn show_jobs(&self) -> anyhow::Result<Vec<JobInfo>> {
        let output = self
            .control
            .scontrol(args(["show", "jobs", "--oneliner"]))
            .await?;
        Ok(parse_jobs(&output))
    }

    pub async fn show_job(&self, job_id: u64) -> anyhow::Result<Option<JobInfo>> {
        let output = self
            .control
            .scontrol(vec![
                "show".to_string(),
                "job".to_string(),
                job_id.to_string(),
                "--oneliner".to_string(),
            ])
            .await?;
        Ok(parse_jobs(&output).into_iter().next())
    }

    /// `scontrol update nodename=<hostlist> state=<state> [reason=<reason>]`
    pub async fn update_nodes(
        &self,
        nodes: &[String],
        state: &str,
        reason: Option<&str>,
    ) -> anyhow::Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let mut command = vec![
            "update".to_string(),
            format!("nodename={}", compress_hostlist(nodes)),
            format!("state={state}"),
        ];
        if let Some(reason) = reason {
            command.push(format!("reason={reason}"));
        }
        self.control.scontrol(command).await?;
        Ok(())
    }

    pub async fn update_node_addr(&self, node: &str, addr: &str) -> anyhow::Result<()> {
        self.control
            .scontrol(vec![
                "update".to_string(),
                format!("nodename={node}"),
                format!("nodeaddr={addr}"),
                format!("nodehostname={node}"),
            ])
            .await?;
        Ok(())
    }

    /// Puts nodes down and tells every job allocated on them why.
    pub async fn down_nodes_notify_jobs(
        &self,
        nodes: &[String],
        reason: &str,
    ) -> anyhow::Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let jobs = match self.show_jobs().await {
            Ok(jobs) => jobs,
            Err(error) => {
                log::error!("Cannot list jobs to notify: {error:?}");
                Vec::new()
            }
        };
        self.down_nodes_notify(nodes, reason, &jobs).await
    }

    /// Same as [`Scheduler::down_nodes_notify_jobs`] with an already known job list.
    pub async fn down_nodes_notify(
        &self,
        nodes: &[String],
        reason: &str,
        jobs: &[JobInfo],
    ) -> anyhow::Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let node_set: BTreeSet<&str> = nodes.iter().map(|n| n.as_str()).collect();
        for job in jobs
            .iter()
            .filter(|job| job.nodes.iter().any(|node| node_set.contains(node.as_str())))
        {
            let job_id = job.job_id.to_string();
            log::info!("Notifying job {job_id}: {reason}");
            if let Err(error) = self
                .control
                .scontrol(vec![
                    "update".to_string(),
                    format!("jobid={job_id}"),
                    format!("admincomment={reason}"),
                ])
                .await
            {
                log::error!("Cannot update comment of job {job_id}: {error:?}");
            }
            if let Err(error) = self
                .control
                .scontrol(vec!["notify".to_string(), job_id.clone(), reason.to_string()])
                .await
            {
                log::error!("Cannot notify job {job_id}: {error:?}");
            }
        }
        log::info!("Marking nodes {} down: {reason}", compress_hostlist(nodes));
        self.update_nodes(nodes, "down", Some(reason)).await
    }

    pub async fn reconfigure(&self) -> anyhow::Result<()> {
        log::info!("Running scontrol reconfigure");
        self.control.scontrol(args(["reconfigure"])).await?;
        Ok(())
    }

    /// Nodes sharing the lowest level switch with `node`.
    pub async fn topology_group(&self, node: &str) -> anyhow::Result<Vec<String>> {
        let output = self
            .control
            .scontrol(vec!["show".to_string(), "topo".to_string(), node.to_string()])
            .await?;
        for line in output.lines().filter(|line| line.contains("Level=0")) {
            if let Some(nodes) = line
                .split_whitespace()
                .find_map(|token| token.strip_prefix("Nodes="))
            {
                return expand_hostlist(nodes);
            }
        }
        Ok(Vec::new())
    }

    pub async fn show_reservations(&self) -> anyhow::Result<Vec<ReservationInfo>> {
        let output = self
            .control
            .scontrol(args(["show", "reservation", "--json"]))
            .await?;
        parse_reservations(&output)
    }

    /// Maintenance reservation of a single node, running jobs are ignored.
    pub async fn create_maintenance_reservation(
        &self,
        name: &str,
        node: &str,
        start_time: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        log::info!("Creating reservation {name} for {node} starting at {start_time}");
        let start = start_time.with_timezone(&Local).format("%Y-%m-%dT%H:%M:%S");
        self.control
            .scontrol(vec![
                "create".to_string(),
                "reservation".to_string(),
                "user=slurm".to_string(),
                format!("starttime={start}"),
                format!("duration={MAINTENANCE_RESERVATION_MINUTES}"),
                format!("nodes={node}"),
                format!("reservationname={name}"),
                "flags=maint,ignore_jobs".to_string(),
            ])
            .await?;
        Ok(())
    }

    pub async fn delete_reservation(&self, name: &str) -> anyhow::Result<()> {
        log::info!("Deleting reservation {name}");
        self.control
            .scontrol(vec![
                "delete".to_string(),
                "reservation".to_string(),
                name.to_string(),
            ])
            .await?;
        Ok(())
    }

    /// Submits `script` as a job named `name` that runs on `node`.
    pub async fn submit_node_job(&self, name: &str, node: &str, script: &Path) -> anyhow::Result<()> {
        log::info!("Submitting job {name} to {node}");
        self.control
            .slurm_tool(
                "sbatch",
                vec![
                    format!("--job-name={name}"),
                    format!("--nodelist={node}"),
                    script.display().to_string(),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn cancel_jobs_named(&self, name: &str) -> anyhow::Result<()> {
        log::info!("Cancelling jobs named {name}");
        self.control
            .slurm_tool("scancel", vec![format!("--name={name}")])
            .await?;
        Ok(())
    }

    pub async fn restart_service(&self, service: &str) -> anyhow::Result<()> {
        log::info!("Restarting {service}");
        self.control
            .systemctl(vec!["restart".to_string(), service.to_string()])
            .await?;
        Ok(())
    }
}

fn key_values(record: &str) -> impl Iterator<Item = (&str, &str)> {
    record
        .split_whitespace()
        .filter_map(|token| token.split_once('='))
}

/// Parses `scontrol show nodes`, records start with `NodeName=`.
pub fn parse_nodes(output: &str) -> BTreeMap<String, NodeState> {
    let mut nodes = BTreeMap::new();
    let mut current: Option<String> = None;
    for (key, value) in key_values(output) {
        match key {
            "NodeName" => current = Some(value.to_string()),
            "State" => {
                if let Some(name) = current.take() {
                    nodes.insert(name, NodeState::parse(value));
                }
            }
            _ => {}
        }
    }
    nodes
}

/// Parses `scontrol show jobs --oneliner`, one job per line.
pub fn parse_jobs(output: &str) -> Vec<JobInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut job_id = None;
            let mut job = JobInfo::default();
            for (key, value) in key_values(line) {
                match key {
                    "JobId" => job_id = value.parse::<u64>().ok(),
                    "JobName" => job.name = Some(value.to_string()),
                    "JobState" => job.job_state = value.to_string(),
                    "ReqNodeList" if value != "(null)" => {
                        job.required_nodes = Some(value.to_string())
                    }
                    "Partition" => job.partition = Some(value.to_string()),
                    "NodeList" if value != "(null)" => {
                        job.nodes = expand_hostlist(value).unwrap_or_else(|error| {
                            log::warn!("Invalid node list {value}: {error}");
                            Vec::new()
                        })
                    }
                    "TimeLimit" => job.time_limit = parse_time_limit(value),
                    _ => {}
                }
            }
            job.job_id = job_id?;
            Some(job)
        })
        .collect()
}

#[derive(Deserialize)]
struct ReservationList {
    #[serde(default)]
    reservations: Vec<Value>,
}

/// `{"number": 5}` in newer Slurm versions, a plain number in older ones.
fn slurm_number(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value["number"].as_i64())
}

/// Parses `scontrol show reservation --json`, incomplete records are skipped.
pub fn parse_reservations(output: &str) -> anyhow::Result<Vec<ReservationInfo>> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    let list: ReservationList =
        serde_json::from_str(output).context("Invalid reservation list")?;
    Ok(list
        .reservations
        .iter()
        .filter_map(|reservation| {
            Some(ReservationInfo {
                name: reservation["name"].as_str()?.to_string(),
                node_list: reservation["node_list"].as_str()?.to_string(),
                node_count: slurm_number(&reservation["node_count"])?.try_into().ok()?,
                start_time: DateTime::from_timestamp(
                    slurm_number(&reservation["start_time"])?,
                    0,
                )?,
            })
        })
        .collect())
}

/// `[days-]hours:minutes:seconds`, `minutes:seconds` or `minutes`; `UNLIMITED` is `None`.
pub fn parse_time_limit(value: &str) -> Option<Duration> {
    let (days, rest) = match value.split_once('-') {
        Some((days, rest)) => (days.parse::<u64>().ok()?, rest),
        None => (0, value),
    };
    let parts = rest
        .split(':')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    let seconds = match (days > 0, parts.as_slice()) {
        (_, [h, m, s]) => h * 3600 + m * 60 + s,
        (true, [h, m]) => h * 3600 + m * 60,
        (true, [h]) => h * 3600,
        (false, [m, s]) => m * 60 + s,
        (false, [m]) => m * 60,
        _ => return None,
    };
    Some(Duration::from_secs(days * 24 * 3600 + seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::FakeSlurm;

    const NODES: &str = "NodeName=hpc-n-0 Arch=x86_64 CoresPerSocket=1
   CPUAlloc=0 CPUEfctv=4 CPUTot=4 CPULoad=0.00
   State=IDLE+CLOUD+POWERED_DOWN ThreadsPerCore=1 TmpDisk=0 Weight=1
   Reason=Unbacked instance [slurm@2024-01-01]

NodeName=hpc-n-1 CoresPerSocket=1
   State=DOWN+CLOUD ThreadsPerCore=1

NodeName=login0 CoresPerSocket=1
   State=IDLE ThreadsPerCore=1
";

    #[test]
    fn parse_node_states() {
        let nodes = parse_nodes(NODES);
        assert_eq!(nodes.len(), 3);
        let state = &nodes["hpc-n-0"];
        assert_eq!(state.base, "IDLE");
        assert!(state.has("POWERED_DOWN"));
        assert!(state.has_power_flags());
        assert_eq!(state.to_string(), "IDLE+CLOUD+POWERED_DOWN");
        assert!(nodes["hpc-n-1"].is_down());
    }

    #[tokio::test]
    async fn show_nodes_keeps_cloud_nodes() {
        let slurm = FakeSlurm::new().with_output("show nodes", NODES);
        let nodes = Scheduler::new(slurm.clone()).show_nodes().await.unwrap();
        assert_eq!(nodes.keys().collect::<Vec<_>>(), vec!["hpc-n-0", "hpc-n-1"]);
    }

    #[test]
    fn parse_job_lines() {
        let jobs = parse_jobs(
            "JobId=12 JobName=x JobState=RUNNING Partition=debug TimeLimit=1-02:00:00 NodeList=hpc-n-[0-1] ReqNodeList=(null)\n\
             JobId=13 JobName=y JobState=PENDING TimeLimit=UNLIMITED NodeList=(null) ReqNodeList=hpc-n-4\n",
        );
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, 12);
        assert_eq!(jobs[0].nodes, vec!["hpc-n-0", "hpc-n-1"]);
        assert_eq!(jobs[0].time_limit, Some(Duration::from_secs(26 * 3600)));
        assert_eq!(jobs[0].partition.as_deref(), Some("debug"));
        assert_eq!(jobs[1].job_state, "PENDING");
        assert!(jobs[1].nodes.is_empty());
        assert_eq!(jobs[1].time_limit, None);
        assert_eq!(jobs[0].name.as_deref(), Some("x"));
        assert_eq!(jobs[0].required_nodes, None);
        assert_eq!(jobs[1].required_nodes.as_deref(), Some("hpc-n-4"));
    }

    #[test]
    fn reservation_formats() {
        let reservations = parse_reservations(
            r#"{"reservations": [
                {"name": "a", "node_list": "hpc-n-0", "node_count": 1, "start_time": 1893492000},
                {"name": "b", "node_list": "hpc-n-[1-2]",
                 "node_count": {"set": true, "number": 2}, "start_time": {"set": true, "number": 0}},
                {"name": "c", "node_list": "hpc-n-3"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(reservations.len(), 2);
        assert_eq!(reservations[0].node_count, 1);
        assert_eq!(reservations[0].start_time.timestamp(), 1893492000);
        assert_eq!(reservations[1].node_list, "hpc-n-[1-2]");
        assert_eq!(reservations[1].node_count, 2);
        assert!(parse_reservations("").unwrap().is_empty());
        assert!(parse_reservations("{").is_err());
    }

    #[test]
    fn time_limits() {
        assert_eq!(parse_time_limit("30"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_time_limit("10:30"), Some(Duration::from_secs(630)));
        assert_eq!(parse_time_limit("01:00:00"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_time_limit("2-00"), Some(Duration::from_secs(2 * 86400)));
        assert_eq!(parse_time_limit("UNLIMITED"), None);
    }

    #[tokio::test]
    async fn down_and_notify() {
        let slurm = FakeSlurm::new().with_output(
            "show jobs --oneliner",
            "JobId=7 JobState=CONFIGURING NodeList=hpc-n-[1-2]\nJobId=8 JobState=RUNNING NodeList=hpc-n-5\n",
        );
        let scheduler = Scheduler::new(slurm.clone());
        scheduler
            .down_nodes_notify_jobs(
                &["hpc-n-2".to_string(), "hpc-n-3".to_string()],
                "GCP Error: no capacity",
            )
            .await
            .unwrap();
        insta::assert_snapshot!(slurm.commands().join("\n"), @r###"
        show jobs --oneliner
        update jobid=7 admincomment=GCP Error: no capacity
        notify 7 GCP Error: no capacity
        update nodename=hpc-n-[2-3] state=down reason=GCP Error: no capacity
        "###);
    }

    #[tokio::test]
    async fn topology_group_of_node() {
        let slurm = FakeSlurm::new().with_output(
            "show topo hpc-tpu-1",
            "SwitchName=s0 Level=0 LinkSpeed=1 Nodes=hpc-tpu-[0-3]\nSwitchName=root Level=1 LinkSpeed=1 Switches=s0\n",
        );
        let nodes = Scheduler::new(slurm)
            .topology_group("hpc-tpu-1")
            .await
            .unwrap();
        assert_eq!(nodes.len(), 4);
    }
}
