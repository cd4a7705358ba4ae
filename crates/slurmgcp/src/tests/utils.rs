use std::cell::RefCell;
use std::rc::Rc;

use derive_builder::Builder;
use futures::future::LocalBoxFuture;
use gce::testing::FakeTransport;
use gce::{ApiResult, ComputeRequest};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::common::config::{ClusterConfig, InstanceRole};
use crate::common::env::Tunables;
use crate::common::parser::{CharParser, format_errors_cli};
use crate::context::Context;
use crate::scheduler::SlurmControl;

pub fn expect_parser_error<T>(parser: impl CharParser<T>, input: &str) -> String {
    match parser.parse(input) {
        Ok(_) => panic!("The parser should have failed on `{input}`"),
        Err(errors) => format_errors_cli(input, errors),
    }
}

/// Records `scontrol`/`systemctl` invocations and answers them with canned outputs.
#[derive(Default)]
pub struct FakeSlurm {
    outputs: RefCell<Vec<(String, String)>>,
    failures: RefCell<Vec<String>>,
    commands: RefCell<Vec<String>>,
}

impl FakeSlurm {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Commands starting with `prefix` return `output`, the longest matching prefix wins.
    pub fn with_output(self: Rc<Self>, prefix: &str, output: &str) -> Rc<Self> {
        self.set_output(prefix, output);
        self
    }

    pub fn set_output(&self, prefix: &str, output: &str) {
        let mut outputs = self.outputs.borrow_mut();
        outputs.retain(|(p, _)| p != prefix);
        outputs.push((prefix.to_string(), output.to_string()));
    }

    pub fn fail_on(self: Rc<Self>, prefix: &str) -> Rc<Self> {
        self.failures.borrow_mut().push(prefix.to_string());
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    /// Commands other than read-only `show` queries.
    pub fn updates(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| !c.starts_with("show "))
            .collect()
    }

    pub fn clear(&self) {
        self.commands.borrow_mut().clear();
    }

    fn answer(&self, command: String) -> anyhow::Result<String> {
        self.commands.borrow_mut().push(command.clone());
        if self
            .failures
            .borrow()
            .iter()
            .any(|prefix| command.starts_with(prefix.as_str()))
        {
            anyhow::bail!("Exit code: 1\nStderr: {command} failed\nStdout: ");
        }
        Ok(self
            .outputs
            .borrow()
            .iter()
            .filter(|(prefix, _)| command.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

impl SlurmControl for FakeSlurm {
    fn scontrol<'a>(&'a self, args: Vec<String>) -> LocalBoxFuture<'a, anyhow::Result<String>> {
        let result = self.answer(args.join(" "));
        Box::pin(async move { result })
    }

    fn systemctl<'a>(&'a self, args: Vec<String>) -> LocalBoxFuture<'a, anyhow::Result<String>> {
        let result = self.answer(format!("systemctl {}", args.join(" ")));
        Box::pin(async move { result })
    }

    fn slurm_tool<'a>(
        &'a self,
        tool: &'a str,
        args: Vec<String>,
    ) -> LocalBoxFuture<'a, anyhow::Result<String>> {
        let result = self.answer(format!("{tool} {}", args.join(" ")));
        Box::pin(async move { result })
    }
}

/// Compute instance as returned by `instances.aggregatedList`, created long ago.
pub fn instance_json(name: &str, status: &str) -> Value {
    json!({
        "name": name,
        "status": status,
        "zone": "https://www.googleapis.com/compute/v1/projects/proj/zones/us-central1-a",
        "machineType": "https://www.googleapis.com/compute/v1/projects/proj/zones/us-central1-a/machineTypes/n1-standard-4",
        "creationTimestamp": "2024-01-01T00:00:00.000-07:00",
        "labels": {"slurm_cluster_name": "hpc"},
        "metadata": {"items": [{"key": "slurm_instance_role", "value": "compute"}]},
        "scheduling": {"preemptible": false},
    })
}

pub const TEMPLATE: &str = "projects/proj/global/instanceTemplates/tpl";

/// Cluster `hpc` with nodeset `n`, dynamic nodeset `dyn` and TPU nodeset `tpu`.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct TestConfig {
    #[builder(default = "2")]
    static_nodes: u32,
    #[builder(default = "4")]
    dynamic_nodes: u32,
    #[builder(default = "vec![\"us-central1-a\".to_string()]")]
    zones: Vec<String>,
    #[builder(default)]
    exclusive: bool,
    #[builder(default = "true")]
    placement: bool,
    #[builder(default, setter(strip_option))]
    placement_max_distance: Option<u32>,
    #[builder(default)]
    flex: bool,
    #[builder(default)]
    flex_bulk_insert: bool,
    #[builder(default)]
    mig_slices: bool,
    #[builder(default, setter(strip_option, into))]
    accelerator_topology: Option<String>,
    #[builder(default, setter(strip_option, into))]
    reservation: Option<String>,
    #[builder(default, setter(strip_option, into))]
    future_reservation: Option<String>,
    #[builder(default)]
    spot: bool,
    #[builder(default)]
    maintenance_reservation: bool,
    #[builder(default)]
    opportunistic_maintenance: bool,
    #[builder(default, setter(strip_option))]
    instance_properties: Option<Value>,
    #[builder(default = "\"v2-8\".to_string()", setter(into))]
    tpu_node_type: String,
    #[builder(default)]
    tpu_preserve: bool,
    #[builder(default)]
    hybrid: bool,
    #[builder(default, setter(strip_option))]
    role: Option<InstanceRole>,
}

impl TestConfigBuilder {
    pub fn build(self) -> ClusterConfig {
        let config = self.finish().unwrap();
        let mut nodeset = json!({
            "node_count_static": config.static_nodes,
            "node_count_dynamic_max": config.dynamic_nodes,
            "instance_template": TEMPLATE,
            "subnetwork": "projects/proj/regions/us-central1/subnetworks/default",
            "enable_placement": config.placement,
            "zone_policy_allow": config.zones,
            "dws_flex": {
                "enabled": config.flex,
                "use_bulk_insert": config.flex_bulk_insert,
                "use_job_duration": true,
            },
            "enable_mig_slices": config.mig_slices,
            "enable_spot_vm": config.spot,
            "enable_maintenance_reservation": config.maintenance_reservation,
            "enable_opportunistic_maintenance": config.opportunistic_maintenance,
            "labels": {"team": "hpc"},
        });
        let optional = [
            (
                "placement_max_distance",
                config.placement_max_distance.map(|d| json!(d)),
            ),
            (
                "accelerator_topology",
                config.accelerator_topology.map(Value::from),
            ),
            ("reservation_name", config.reservation.map(Value::from)),
            (
                "future_reservation",
                config.future_reservation.map(Value::from),
            ),
            ("instance_properties", config.instance_properties),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                nodeset[key] = value;
            }
        }
        let mut value = json!({
            "slurm_cluster_name": "hpc",
            "project": "proj",
            "zone": "us-central1-a",
            "hybrid": config.hybrid,
            "nodeset": {"n": nodeset},
            "nodeset_dyn": {"dyn": {"nodeset_feature": "dyn"}},
            "nodeset_tpu": {"tpu": {
                "node_count_static": 0,
                "node_count_dynamic_max": 4,
                "node_type": config.tpu_node_type,
                "tf_version": "2.14.0",
                "zone": "us-central1-b",
                "preserve_tpu": config.tpu_preserve,
            }},
            "partitions": {
                "debug": {"partition_nodeset": ["n"], "enable_job_exclusive": config.exclusive},
                "tpu": {"partition_nodeset_tpu": ["tpu"]},
                "dynp": {"partition_nodeset_dyn": ["dyn"]},
            },
        });
        if let Some(role) = config.role {
            value["instance_role"] = json!(role.as_str());
        }
        ClusterConfig::from_yaml(&value.to_string()).unwrap()
    }
}

pub fn test_config() -> ClusterConfig {
    TestConfigBuilder::default().build()
}

/// A context backed by fake Slurm and Compute API, with state kept in a temporary directory.
pub struct TestEnv {
    pub ctx: Context,
    pub transport: Rc<FakeTransport>,
    pub slurm: Rc<FakeSlurm>,
    pub dir: Rc<TempDir>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::create(test_config(), FakeTransport::accept_all())
    }

    pub fn with_handler(handler: impl Fn(&ComputeRequest) -> ApiResult + 'static) -> Self {
        Self::create(test_config(), FakeTransport::new(handler))
    }

    pub fn create(config: ClusterConfig, transport: FakeTransport) -> Self {
        let dir = Rc::new(TempDir::with_prefix("slurmgcp").unwrap());
        Self::assemble(config, Rc::new(transport), FakeSlurm::new(), dir)
    }

    fn assemble(
        mut config: ClusterConfig,
        transport: Rc<FakeTransport>,
        slurm: Rc<FakeSlurm>,
        dir: Rc<TempDir>,
    ) -> Self {
        config.state_dir = dir.path().join("state");
        config.cache_dir = dir.path().join("cache");
        config.output_dir = dir.path().join("etc");
        config.scripts_dir = dir.path().join("scripts");
        config.custom_scripts_dir = dir.path().join("custom_scripts");
        let tunables = Tunables {
            operation_poll: std::time::Duration::from_millis(1),
            ..Default::default()
        };
        let ctx = Context::new(config, transport.clone(), slurm.clone(), tunables);
        TestEnv {
            ctx,
            transport,
            slurm,
            dir,
        }
    }

    /// Context of a next invocation sharing the fakes and directories.
    pub fn reopen(&self) -> TestEnv {
        Self::assemble(
            self.ctx.config().clone(),
            self.transport.clone(),
            self.slurm.clone(),
            self.dir.clone(),
        )
    }
}
