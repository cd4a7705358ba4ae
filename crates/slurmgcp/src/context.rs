use std::rc::Rc;
use std::time::Duration;

use futures::future::join_all;
use gce::backoff::Backoff;
use gce::executor::Done;
use gce::{ApiError, BatchExecutor, ExecutorLimits, Operation, Transport};

use crate::common::cache::open_cache;
use crate::common::config::ClusterConfig;
use crate::common::env::Tunables;
use crate::inventory::Inventory;
use crate::pubsub::Topic;
use crate::scheduler::{Scheduler, SlurmControl};

const TEMPLATE_CACHE: &str = "template_info";
const MAX_OPERATION_POLL: Duration = Duration::from_secs(30);

/// Everything a single invocation works with.
pub struct Context {
    config: Rc<ClusterConfig>,
    executor: BatchExecutor,
    scheduler: Scheduler,
    inventory: Inventory,
    tunables: Tunables,
}

impl Context {
    pub fn new(
        config: ClusterConfig,
        transport: Rc<dyn Transport>,
        control: Rc<dyn SlurmControl>,
        tunables: Tunables,
    ) -> Self {
        let config = Rc::new(config);
        let limits = ExecutorLimits {
            poll: Backoff::new(
                tunables.operation_poll,
                MAX_OPERATION_POLL.max(tunables.operation_poll),
                u32::MAX,
            ),
            ..Default::default()
        };
        let executor = BatchExecutor::with_limits(transport, config.project.clone(), limits);
        let scheduler = Scheduler::new(control);
        let cache = open_cache(&config.cache_dir, TEMPLATE_CACHE);
        let inventory = Inventory::new(
            config.clone(),
            executor.clone(),
            scheduler.clone(),
            cache,
        );
        Context {
            config,
            executor,
            scheduler,
            inventory,
            tunables,
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn project(&self) -> &str {
        &self.config.project
    }

    pub fn executor(&self) -> &BatchExecutor {
        &self.executor
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn topic(&self, name: &str) -> Topic {
        Topic::new(&self.config.pubsub_dir(), name)
    }

    /// Waits for the operations returned by a batch, results keep the batch ids.
    pub async fn wait_for_done(&self, done: Done) -> Vec<(String, Result<Operation, ApiError>)> {
        join_all(done.into_iter().map(|(id, value)| async move {
            let result = match Operation::from_value(value) {
                Ok(operation) => self.executor.wait_for_operation(&operation).await,
                Err(error) => Err(error),
            };
            (id, result)
        }))
        .await
    }
}
