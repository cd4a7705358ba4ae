//! Watching of VM delete operations started by suspend.
//!
//! Suspend publishes every delete operation into a durable topic and the
//! reconciliation loop later checks how they ended.

use gce::ComputeRequest;
use gce::Operation;
use gce::selflink::trim_self_link;
use serde::{Deserialize, Serialize};

use crate::common::error::error;
use crate::context::Context;
use crate::inventory::InstanceStatus;
use crate::pubsub::{Message, Subscription, Topic};

pub const WATCH_DELETE_VM_OP: &str = "watch_delete_vm_op";

/// Messages processed by a single reconciliation pass.
const MAX_MESSAGES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteVmOp {
    pub op_name: String,
    pub zone: String,
    pub node: String,
}

pub struct DeleteOpTopic {
    topic: Topic,
}

impl DeleteOpTopic {
    pub fn new(ctx: &Context) -> Self {
        DeleteOpTopic {
            topic: ctx.topic(WATCH_DELETE_VM_OP),
        }
    }

    pub fn publish(&self, operation: &Operation, node: &str) -> crate::Result<()> {
        if operation.operation_type.as_deref() != Some("delete") {
            return error(format!(
                "Operation {} is not a delete operation",
                operation.name
            ));
        }
        let Some(zone) = operation.zone.as_deref() else {
            return error(format!("Operation {} has no zone", operation.name));
        };
        if node.is_empty() {
            return error(format!("Operation {} has no node", operation.name));
        }
        self.topic.publish(&DeleteVmOp {
            op_name: operation.name.clone(),
            zone: zone.to_string(),
            node: node.to_string(),
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Ack,
    Nack,
}

/// Instance state comes from the inventory snapshot, the operation itself is
/// only queried while the instance still exists.
async fn watch_op(ctx: &Context, message: &DeleteVmOp) -> crate::Result<Verdict> {
    let op = &message.op_name;
    let node = &message.node;
    let Some(instance) = ctx.inventory().instance(node).await? else {
        log::debug!("Stop watching op {op}, VM {node} appears to be deleted");
        return Ok(Verdict::Ack);
    };
    match instance.status {
        InstanceStatus::Terminated => {
            log::debug!("Stop watching op {op}, VM {node} is TERMINATED");
            return Ok(Verdict::Ack);
        }
        InstanceStatus::Stopping => {
            log::debug!("Skipping op {op}, VM {node} is STOPPING");
            return Ok(Verdict::Nack);
        }
        _ => {}
    }

    let request =
        ComputeRequest::zone_operation_get(ctx.project(), trim_self_link(&message.zone), op);
    let operation = match ctx.executor().ensure_execute(&request).await {
        Ok(value) => Operation::from_value(value)?,
        Err(error) => {
            log::error!("Failed to get operation {op}, will not retry: {error}");
            return Ok(Verdict::Ack);
        }
    };
    if !operation.is_done() {
        log::debug!("Watching op {op} is still not done ({})", operation.status);
        return Ok(Verdict::Nack);
    }
    if operation.has_error() {
        log::error!(
            "Operation {op} to delete {node} finished with error: {}",
            operation.error_message()
        );
    } else {
        log::debug!("Operation {op} to delete {node} successfully finished");
    }
    Ok(Verdict::Ack)
}

async fn process_message(ctx: &Context, message: &Message) -> Verdict {
    let result = match serde_json::from_value::<DeleteVmOp>(message.data.clone()) {
        Ok(data) => watch_op(ctx, &data).await,
        Err(error) => Err(error.into()),
    };
    result.unwrap_or_else(|error| {
        log::error!("Failed to process the message {}, removing: {error}", message.id);
        Verdict::Ack
    })
}

/// Pulls once, messages NACKed in this pass would be judged by the same
/// inventory snapshot again.
pub async fn watch_delete_vm_ops(ctx: &Context) -> crate::Result<()> {
    let mut subscription = Subscription::new(&ctx.config().pubsub_dir(), WATCH_DELETE_VM_OP);
    let messages = subscription.pull(MAX_MESSAGES)?;
    log::debug!("Processing {} delete VM operations", messages.len());
    for message in messages {
        let ids = [message.id.clone()];
        match process_message(ctx, &message).await {
            Verdict::Ack => subscription.ack(&ids),
            Verdict::Nack => subscription.modify_ack_deadline(&ids, 0)?,
        }
    }
    Ok(())
}
