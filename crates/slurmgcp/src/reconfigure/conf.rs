//! Generation of `cloud.conf`, the Slurm configuration of cloud nodes and partitions.

use std::path::Path;

use crate::common::config::{ClusterConfig, NodesetConfig, PartitionConfig};
use crate::common::hostlist::compress_hostlist;
use crate::context::Context;
use crate::inventory::TemplateInfo;

pub const CLOUD_CONF: &str = "cloud.conf";

pub const FILE_PREAMBLE: &str =
    "# Warning:\n# This file is managed by a script. Manual modifications will be overwritten.";

const MIN_MEM_PER_CPU: u64 = 100;
const DEFAULT_SCHEDULER_PARAMETERS: [&str; 3] =
    ["bf_continue", "salloc_wait_nodes", "ignore_prefer_validation"];

type ConfPairs = Vec<(String, Option<String>)>;

/// `Key=value` pairs joined by `delimiter`, empty values are skipped.
fn to_conf(pairs: ConfPairs, delimiter: &str) -> String {
    pairs
        .into_iter()
        .filter_map(|(key, value)| match value {
            Some(value) if !value.is_empty() => Some(format!("{key}={value}")),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(delimiter)
}

fn pair(key: &str, value: impl ToString) -> (String, Option<String>) {
    (key.to_string(), Some(value.to_string()))
}

fn optional(key: &str, value: Option<impl ToString>) -> (String, Option<String>) {
    (key.to_string(), value.map(|value| value.to_string()))
}

fn list<S: AsRef<str>>(key: &str, values: impl IntoIterator<Item = S>) -> (String, Option<String>) {
    let values: Vec<String> = values
        .into_iter()
        .map(|value| value.as_ref().to_string())
        .collect();
    (key.to_string(), Some(values.join(",")))
}

fn yaml_value(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Null => None,
        serde_yaml::Value::Bool(value) => Some(value.to_string()),
        serde_yaml::Value::Number(value) => Some(value.to_string()),
        serde_yaml::Value::String(value) => Some(value.clone()),
        serde_yaml::Value::Sequence(values) => Some(
            values
                .iter()
                .filter_map(yaml_value)
                .collect::<Vec<_>>()
                .join(","),
        ),
        _ => None,
    }
}

/// Extra parameters override generated ones with the same key.
fn extend_conf<'a>(
    pairs: &mut ConfPairs,
    extra: impl IntoIterator<Item = (&'a String, &'a serde_yaml::Value)>,
) {
    for (key, value) in extra {
        let value = yaml_value(value);
        match pairs.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value,
            None => pairs.push((key.clone(), value)),
        }
    }
}

fn nodelist(config: &ClusterConfig, nodeset: &str, start: u32, end: u32) -> String {
    let prefix = config.nodeset_prefix(nodeset);
    compress_hostlist((start..end).map(|index| format!("{prefix}-{index}")))
}

/// Hardware description of a node, the memory is reduced by what the guest kernel takes.
struct MachineConf {
    cpus: u32,
    memory: u64,
}

impl MachineConf {
    fn new(template: &TemplateInfo) -> Self {
        let guest_cpus = template.machine.guest_cpus;
        let cpus = if template.threads_per_core == Some(1) && guest_cpus > 1 {
            guest_cpus / 2
        } else {
            guest_cpus
        };
        let memory_mb = template.machine.memory_mb;
        let gb = memory_mb / 1024;
        MachineConf {
            cpus,
            memory: memory_mb.saturating_sub(400 + 30 * gb),
        }
    }

    fn mem_per_cpu(&self, nodeset: &NodesetConfig) -> u64 {
        let spec_limit = nodeset
            .node_conf
            .get("MemSpecLimit")
            .and_then(yaml_value)
            .and_then(|limit| limit.parse::<u64>().ok())
            .unwrap_or(0);
        MIN_MEM_PER_CPU.max(self.memory.saturating_sub(spec_limit) / u64::from(self.cpus.max(1)))
    }
}

fn conf_lines(config: &ClusterConfig, any_gpus: bool) -> String {
    let params = &config.cloud_parameters;
    let any_tpu = config
        .partitions
        .values()
        .any(|partition| partition.is_tpu());
    let any_dynamic = config
        .partitions
        .values()
        .any(|partition| partition.partition_feature.is_some());
    let scripts = config.scripts_dir.display();
    let scheduler_parameters: Vec<&str> = if params.scheduler_parameters.is_empty() {
        DEFAULT_SCHEDULER_PARAMETERS.to_vec()
    } else {
        params.scheduler_parameters.iter().map(|p| p.as_str()).collect()
    };

    let mut slurmctld = Vec::new();
    if !(any_dynamic || any_tpu) {
        slurmctld.push("cloud_dns");
    }
    slurmctld.extend(["enable_configless", "idle_on_node_suspend"]);

    to_conf(
        vec![
            list("LaunchParameters", ["enable_nss_slurm", "use_interactive_step"]),
            list("SlurmctldParameters", slurmctld),
            optional("GresTypes", any_gpus.then_some("gpu")),
            list("SchedulerParameters", scheduler_parameters),
            pair("ResumeProgram", format!("{scripts}/resume_wrapper.sh")),
            pair("ResumeFailProgram", format!("{scripts}/suspend_wrapper.sh")),
            pair("ResumeRate", params.resume_rate.unwrap_or(0)),
            pair("ResumeTimeout", params.resume_timeout.unwrap_or(300)),
            pair("SuspendProgram", format!("{scripts}/suspend_wrapper.sh")),
            pair("SuspendRate", params.suspend_rate.unwrap_or(0)),
            pair("SuspendTimeout", params.suspend_timeout.unwrap_or(300)),
            pair("SlurmdTimeout", 300),
            pair("UnkillableStepTimeout", 300),
            pair(
                "TreeWidth",
                params
                    .tree_width
                    .unwrap_or(if any_dynamic { 65533 } else { 128 }),
            ),
            optional("JobSubmitPlugins", any_tpu.then_some("lua")),
            optional(
                "TopologyPlugin",
                (!config.nodeset.is_empty()).then_some(&params.topology_plugin),
            ),
            pair(
                "TopologyParam",
                params.topology_param.as_deref().unwrap_or("SwitchAsNodeRank"),
            ),
        ],
        "\n",
    )
}

fn nodeset_lines(config: &ClusterConfig, nodeset: &NodesetConfig, template: &TemplateInfo) -> String {
    let machine = MachineConf::new(template);
    let nodes = nodelist(config, &nodeset.nodeset_name, 0, nodeset.node_count());
    let mut node = vec![
        pair("NodeName", &nodes),
        pair("State", "CLOUD"),
        pair("RealMemory", machine.memory),
        pair("Boards", 1),
        pair("SocketsPerBoard", 1),
        pair("CoresPerSocket", machine.cpus),
        pair("ThreadsPerCore", 1),
        pair("CPUs", machine.cpus),
        optional(
            "Gres",
            (template.gpu_count > 0).then(|| format!("gpu:{}", template.gpu_count)),
        ),
    ];
    extend_conf(&mut node, &nodeset.node_conf);
    [
        to_conf(node, " "),
        to_conf(
            vec![pair("NodeSet", &nodeset.nodeset_name), pair("Nodes", nodes)],
            " ",
        ),
    ]
    .join("\n")
}

fn partition_line(
    partition: &PartitionConfig,
    machines: &[(&NodesetConfig, MachineConf)],
) -> String {
    let def_mem = machines
        .iter()
        .filter(|(nodeset, _)| partition.partition_nodeset.contains(&nodeset.nodeset_name))
        .map(|(nodeset, machine)| machine.mem_per_cpu(nodeset))
        .min()
        .unwrap_or(MIN_MEM_PER_CPU);
    let nodesets = partition
        .partition_nodeset
        .iter()
        .chain(&partition.partition_nodeset_dyn)
        .chain(&partition.partition_nodeset_tpu);
    let is_dyn = !partition.partition_nodeset_dyn.is_empty();
    let exclusive = partition.enable_job_exclusive || partition.is_tpu();
    let mut line = vec![
        pair("PartitionName", &partition.partition_name),
        list("Nodes", nodesets),
        pair("State", "UP"),
        pair("DefMemPerCPU", def_mem),
        pair("SuspendTime", 300),
        optional("Oversubscribe", exclusive.then_some("Exclusive")),
        optional(
            "PowerDownOnIdle",
            (partition.enable_job_exclusive && !is_dyn).then_some("YES"),
        ),
    ];
    extend_conf(&mut line, &partition.partition_conf);
    to_conf(line, " ")
}

fn suspend_exclusion_lines(config: &ClusterConfig) -> Vec<String> {
    let static_nodes: Vec<String> = config
        .nodeset
        .values()
        .map(|ns| (&ns.nodeset_name, ns.node_count_static))
        .chain(
            config
                .nodeset_tpu
                .values()
                .map(|ns| (&ns.nodeset_name, ns.node_count_static)),
        )
        .filter(|(_, count)| *count > 0)
        .map(|(name, count)| nodelist(config, name, 0, count))
        .collect();
    let dynamic_partitions = config
        .partitions
        .values()
        .filter(|partition| !partition.partition_nodeset_dyn.is_empty())
        .map(|partition| &partition.partition_name);
    [
        to_conf(vec![list("SuspendExcNodes", static_nodes)], " "),
        to_conf(vec![list("SuspendExcParts", dynamic_partitions)], " "),
    ]
    .into_iter()
    .filter(|line| !line.is_empty())
    .collect()
}

/// Renders `cloud.conf` for `config`, instance templates are resolved through the inventory.
pub async fn make_cloud_conf(ctx: &Context, config: &ClusterConfig) -> crate::Result<String> {
    let mut templates = Vec::new();
    for nodeset in config.nodeset.values() {
        let template = ctx
            .inventory()
            .template_info(&nodeset.instance_template)
            .await?;
        templates.push((nodeset, template));
    }
    let any_gpus = templates.iter().any(|(_, template)| template.gpu_count > 0);
    let machines: Vec<(&NodesetConfig, MachineConf)> = templates
        .iter()
        .map(|(nodeset, template)| (*nodeset, MachineConf::new(template)))
        .collect();

    let mut sections = vec![FILE_PREAMBLE.to_string(), conf_lines(config, any_gpus)];
    sections.extend(
        templates
            .iter()
            .map(|(nodeset, template)| nodeset_lines(config, nodeset, template)),
    );
    sections.extend(config.nodeset_dyn.values().map(|nodeset| {
        to_conf(
            vec![
                pair("NodeSet", &nodeset.nodeset_name),
                pair("Feature", &nodeset.nodeset_feature),
            ],
            " ",
        )
    }));
    sections.extend(config.nodeset_tpu.values().map(|nodeset| {
        let nodes = nodelist(config, &nodeset.nodeset_name, 0, nodeset.node_count());
        let mut node = vec![pair("NodeName", &nodes), pair("State", "CLOUD")];
        extend_conf(&mut node, &nodeset.node_conf);
        [
            to_conf(node, " "),
            to_conf(
                vec![pair("NodeSet", &nodeset.nodeset_name), pair("Nodes", nodes)],
                " ",
            ),
        ]
        .join("\n")
    }));
    sections.extend(
        config
            .partitions
            .values()
            .map(|partition| partition_line(partition, &machines)),
    );
    sections.extend(suspend_exclusion_lines(config));

    let mut content = sections
        .into_iter()
        .filter(|section| !section.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    content.push('\n');
    Ok(content)
}

pub async fn write_cloud_conf(
    ctx: &Context,
    config: &ClusterConfig,
    output_dir: &Path,
) -> crate::Result<()> {
    let content = make_cloud_conf(ctx, config).await?;
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join(CLOUD_CONF);
    std::fs::write(&path, content)?;
    log::debug!("Written {}", path.display());
    Ok(())
}
