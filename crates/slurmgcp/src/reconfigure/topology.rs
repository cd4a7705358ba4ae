//! Tree network topology of cloud nodes (`cloud_topology.yaml`).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::config::{NodesetConfig, TOPOLOGY_PLUGIN_TREE, TpuNodesetConfig};
use crate::common::hostlist::compress_hostlist;
use crate::common::utils::chunked;
use crate::context::Context;
use crate::inventory::parse_node_name;
use crate::reconfigure::conf::FILE_PREAMBLE;

pub const TOPOLOGY_YAML: &str = "cloud_topology.yaml";
pub const TOPOLOGY_SUMMARY: &str = "cloud_topology.summary.json";

const SLURM_ROOT: &str = "slurm-root";
const TPU_ROOT: &str = "tpu-root";

#[derive(Debug, Default)]
struct Switch {
    name: String,
    nodes: Vec<String>,
    switches: BTreeMap<String, Switch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchLine {
    pub switch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<String>,
}

impl Switch {
    fn new(name: &str) -> Self {
        Switch {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn render(&self, lines: &mut Vec<SwitchLine>) {
        let (children, nodes) = if self.nodes.is_empty() {
            (Some(compress_hostlist(self.switches.keys())), None)
        } else {
            (None, Some(compress_hostlist(&self.nodes)))
        };
        lines.push(SwitchLine {
            switch: self.name.clone(),
            children,
            nodes,
        });
        for switch in self.switches.values() {
            switch.render(lines);
        }
    }
}

/// Nodes known to the topology, used to decide whether Slurm has to reload it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologySummary {
    #[serde(default)]
    pub physical_host: BTreeMap<String, String>,
    #[serde(default)]
    pub down_nodes: BTreeSet<String>,
    #[serde(default)]
    pub tpu_nodes: BTreeSet<String>,
}

impl TopologySummary {
    pub fn path(output_dir: &Path) -> PathBuf {
        output_dir.join(TOPOLOGY_SUMMARY)
    }

    /// A missing or unreadable summary is treated as empty.
    pub fn load(output_dir: &Path) -> Self {
        let path = Self::path(output_dir);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        serde_json::from_str(&content).unwrap_or_else(|error| {
            log::warn!("Ignoring invalid topology summary {}: {error}", path.display());
            Self::default()
        })
    }

    pub fn dump(&self, output_dir: &Path) -> crate::Result<()> {
        std::fs::write(Self::path(output_dir), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn nodenames(&self) -> BTreeSet<&String> {
        self.physical_host
            .keys()
            .chain(&self.down_nodes)
            .chain(&self.tpu_nodes)
            .collect()
    }

    /// A node was added, or a node got a new non-empty physical host.
    pub fn requires_reconfigure(&self, previous: &TopologySummary) -> bool {
        let known = previous.nodenames();
        if self.nodenames().iter().any(|node| !known.contains(node)) {
            return true;
        }
        self.physical_host.iter().any(|(node, host)| {
            !host.is_empty() && previous.physical_host.get(node) != Some(host)
        })
    }
}

#[derive(Debug, Default)]
pub struct TopologyBuilder {
    root: Switch,
    pub summary: TopologySummary,
}

impl TopologyBuilder {
    pub fn add<S: AsRef<str>>(&mut self, path: &[S], nodes: impl IntoIterator<Item = String>) {
        let mut switch = &mut self.root;
        for name in path {
            let name = name.as_ref();
            switch = switch
                .switches
                .entry(name.to_string())
                .or_insert_with(|| Switch::new(name));
        }
        switch.nodes.extend(nodes);
    }

    /// Renames switches to short unique names, `s0`, `s0_1`, ...
    pub fn compress(self) -> TopologyBuilder {
        fn walk(source: Switch, target: &mut Switch, prefix: &str) {
            for (index, child) in source.switches.into_values().enumerate() {
                let mut compressed = Switch::new(&format!("{prefix}{index}"));
                compressed.nodes = child.nodes.clone();
                let child_prefix = format!("{}_", compressed.name);
                walk(child, &mut compressed, &child_prefix);
                target
                    .switches
                    .insert(compressed.name.clone(), compressed);
            }
        }
        let mut root = Switch::default();
        walk(self.root, &mut root, "s");
        TopologyBuilder {
            root,
            summary: self.summary,
        }
    }

    pub fn switch_lines(&self) -> Vec<SwitchLine> {
        let mut lines = Vec::new();
        for switch in self.root.switches.values() {
            switch.render(&mut lines);
        }
        lines
    }

    pub fn render_yaml(&self) -> crate::Result<String> {
        #[derive(Serialize)]
        struct Tree {
            switches: Vec<SwitchLine>,
        }
        #[derive(Serialize)]
        struct Section {
            topology: &'static str,
            cluster_default: bool,
            tree: Tree,
        }
        let sections = [Section {
            topology: TOPOLOGY_PLUGIN_TREE,
            cluster_default: true,
            tree: Tree {
                switches: self.switch_lines(),
            },
        }];
        Ok(format!(
            "{FILE_PREAMBLE}\n---\n\n{}",
            serde_yaml::to_string(&sections)?
        ))
    }
}

fn add_tpu_nodeset(ctx: &Context, nodeset: &TpuNodesetConfig, builder: &mut TopologyBuilder) {
    let (static_nodes, dynamic_nodes) = ctx.inventory().nodenames(
        &nodeset.nodeset_name,
        nodeset.node_count_static,
        nodeset.node_count_dynamic_max,
    );
    let prefix = [TPU_ROOT.to_string(), format!("ns_{}", nodeset.nodeset_name)];
    let vmcount = nodeset.vmcount() as usize;
    if vmcount == 1 {
        let nodes: Vec<String> = static_nodes.into_iter().chain(dynamic_nodes).collect();
        builder.summary.tpu_nodes.extend(nodes.iter().cloned());
        builder.add(&prefix, nodes);
        return;
    }
    let chunks = chunked(&static_nodes, vmcount)
        .into_iter()
        .chain(chunked(&dynamic_nodes, vmcount));
    for (index, chunk) in chunks.enumerate() {
        let path = [
            prefix[0].clone(),
            prefix[1].clone(),
            format!("{}-{index}", nodeset.nodeset_name),
        ];
        builder.summary.tpu_nodes.extend(chunk.iter().cloned());
        builder.add(&path, chunk);
    }
}

/// `/cluster/rack/host` -> `[slurm-root, cluster, rack]`
fn physical_path(physical_host: &str) -> Option<Vec<String>> {
    let parts = physical_host.strip_prefix('/')?;
    Some(
        std::iter::once(SLURM_ROOT)
            .chain(parts.split('/').take(2))
            .map(|part| part.to_string())
            .collect(),
    )
}

async fn add_nodeset(
    ctx: &Context,
    nodeset: &NodesetConfig,
    builder: &mut TopologyBuilder,
) -> crate::Result<()> {
    let default_path = [SLURM_ROOT.to_string(), format!("ns_{}", nodeset.nodeset_name)];
    let mut up_nodes = BTreeSet::new();
    for instance in ctx.inventory().instances().await?.values() {
        match parse_node_name(&instance.name) {
            Ok(desc) if desc.nodeset == nodeset.nodeset_name => {}
            _ => continue,
        }
        let physical_host = instance.physical_host.clone().unwrap_or_default();
        builder
            .summary
            .physical_host
            .insert(instance.name.clone(), physical_host.clone());
        up_nodes.insert(instance.name.clone());

        let path = match physical_path(&physical_host) {
            Some(path) => path,
            None => {
                if !physical_host.is_empty() {
                    log::warn!(
                        "Unexpected physical host '{physical_host}' of {}",
                        instance.name
                    );
                }
                default_path.to_vec()
            }
        };
        builder.add(&path, [instance.name.clone()]);
    }

    let (static_nodes, dynamic_nodes) = ctx.inventory().nodenames(
        &nodeset.nodeset_name,
        nodeset.node_count_static,
        nodeset.node_count_dynamic_max,
    );
    let down_nodes: Vec<String> = static_nodes
        .into_iter()
        .chain(dynamic_nodes)
        .filter(|node| !up_nodes.contains(node))
        .collect();
    if !down_nodes.is_empty() {
        builder.summary.down_nodes.extend(down_nodes.iter().cloned());
        builder.add(&default_path, down_nodes);
    }
    Ok(())
}

pub async fn gen_topology(ctx: &Context) -> crate::Result<TopologyBuilder> {
    let mut builder = TopologyBuilder::default();
    for nodeset in ctx.config().nodeset_tpu.values() {
        add_tpu_nodeset(ctx, nodeset, &mut builder);
    }
    for nodeset in ctx.config().nodeset.values() {
        add_nodeset(ctx, nodeset, &mut builder).await?;
    }
    Ok(builder)
}

/// Writes the topology into `output_dir`, returns whether Slurm should reload it.
pub async fn write_topology(
    ctx: &Context,
    output_dir: &Path,
) -> crate::Result<(bool, TopologySummary)> {
    let topology = gen_topology(ctx).await?.compress();
    std::fs::create_dir_all(output_dir)?;
    std::fs::write(output_dir.join(TOPOLOGY_YAML), topology.render_yaml()?)?;
    let previous = TopologySummary::load(output_dir);
    Ok((
        topology.summary.requires_reconfigure(&previous),
        topology.summary,
    ))
}

/// Regenerates the topology and reconfigures Slurm when nodes moved.
pub async fn update_topology(ctx: &Context) -> crate::Result<()> {
    if !ctx.config().uses_tree_topology() {
        return Ok(());
    }
    let output_dir = &ctx.config().output_dir;
    let (updated, summary) = write_topology(ctx, output_dir).await?;
    if updated {
        log::info!("Topology configuration updated. Reconfiguring Slurm.");
        ctx.scheduler().reconfigure().await?;
        // Stored only once Slurm knows about the new topology.
        summary.dump(output_dir)?;
    }
    Ok(())
}
