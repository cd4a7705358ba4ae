//! Durable local message queue with a subset of the Pub/Sub semantics.
//!
//! Layout of the queue directory:
//! ```text
//! <dir>/<topic>/<message id>
//! <dir>/.staging/<topic>/<message id>
//! ```
//! A message is one immutable JSON file. It is written into the staging area
//! first and then renamed into the topic, so readers never see partial writes.
//! Both directories have to be on the same filesystem.
//!
//! Messages are delivered in the order of their ids (creation time). A
//! subscription delivers every message at most once during its lifetime, a
//! NACKed message is redelivered by the next subscription. Only one
//! subscription may exist at a time, which is guaranteed by the sync lock.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::error::error;
use crate::common::utils::now;

const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub created: DateTime<Utc>,
    pub data: Value,
}

fn generate_id(created: DateTime<Utc>) -> String {
    let suffix: u32 = rand::rng().random();
    format!("{}-{suffix:08x}", created.format("%Y_%m_%d-%H_%M_%S"))
}

pub struct Topic {
    path: PathBuf,
    staging: PathBuf,
}

impl Topic {
    pub fn new(root: &Path, name: &str) -> Self {
        Topic {
            path: root.join(name),
            staging: root.join(STAGING_DIR).join(name),
        }
    }

    pub fn publish<T: Serialize>(&self, data: &T) -> crate::Result<String> {
        std::fs::create_dir_all(&self.path)?;
        std::fs::create_dir_all(&self.staging)?;

        let created = now();
        let message = Message {
            id: generate_id(created),
            created,
            data: serde_json::to_value(data)?,
        };
        let staged = self.staging.join(&message.id);
        std::fs::write(&staged, serde_json::to_vec(&message)?)?;
        std::fs::rename(&staged, self.path.join(&message.id))?;
        log::debug!("Published message {} to {:?}", message.id, self.path);
        Ok(message.id)
    }
}

pub struct Subscription {
    path: PathBuf,
    pulled: BTreeSet<String>,
}

impl Subscription {
    pub fn new(root: &Path, name: &str) -> Self {
        Subscription {
            path: root.join(name),
            pulled: Default::default(),
        }
    }

    fn delete(&self, id: &str) {
        log::debug!("Removing message {id}");
        if let Err(error) = std::fs::remove_file(self.path.join(id)) {
            log::error!("Failed to remove message {id}: {error}");
        }
    }

    fn read_message(&self, id: &str) -> Option<Message> {
        let result = std::fs::read(self.path.join(id))
            .map_err(|e| e.to_string())
            .and_then(|data| serde_json::from_slice::<Message>(&data).map_err(|e| e.to_string()));
        match result {
            Ok(message) => Some(message),
            Err(error) => {
                log::error!("Failed to read message {id}: {error}");
                self.delete(id);
                None
            }
        }
    }

    /// Returns at most `max_messages` messages not yet delivered by this subscription.
    pub fn pull(&mut self, max_messages: usize) -> crate::Result<Vec<Message>> {
        if !self.path.is_dir() {
            log::debug!("Topic {:?} does not exist", self.path);
            return Ok(Vec::new());
        }
        let mut names = std::fs::read_dir(&self.path)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect::<Vec<_>>();
        names.sort();

        let mut messages = Vec::new();
        for name in names {
            if messages.len() >= max_messages {
                break;
            }
            if self.pulled.contains(&name) {
                continue;
            }
            if let Some(message) = self.read_message(&name) {
                if self.pulled.insert(message.id.clone()) {
                    self.pulled.insert(name);
                    messages.push(message);
                }
            }
        }
        Ok(messages)
    }

    pub fn ack(&self, ids: &[String]) {
        for id in ids {
            self.delete(id);
        }
    }

    /// Only a deadline of zero (NACK) is supported, the message is left for the next subscription.
    pub fn modify_ack_deadline(&self, ids: &[String], deadline: u32) -> crate::Result<()> {
        if deadline != 0 {
            return error(format!(
                "Unsupported ack deadline {deadline} for messages {}",
                ids.join(",")
            ));
        }
        Ok(())
    }
}
