//! Applies a changed cluster configuration to the local instance.

pub mod conf;
pub mod scripts;
pub mod topology;

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::common::config::{ClusterConfig, InstanceRole};
use crate::common::error::SyncError;
use crate::common::utils::hash_file;
use crate::context::Context;

/// Replaces the file so that readers never see a partial content.
fn write_atomically(path: &Path, content: &[u8]) -> crate::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(content)?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}

/// Installs the published configuration when it differs from the one at `config_path`.
///
/// The controller regenerates `cloud.conf` and reconfigures Slurm, other instances restart
/// their Slurm daemon. Returns whether the configuration changed.
pub async fn reconfigure_slurm(ctx: &Context, config_path: &Path) -> crate::Result<bool> {
    let Some(source) = &ctx.config().config_source else {
        log::debug!("No configuration source, skipping reconfiguration");
        return Ok(false);
    };
    let new_hash = hash_file(source)?;
    if hash_file(config_path).ok().as_ref() == Some(&new_hash) {
        log::debug!("Configuration did not change");
        return Ok(false);
    }

    let content = std::fs::read(source)?;
    let text = String::from_utf8(content.clone()).map_err(|error| {
        SyncError::ConfigError(format!("Configuration {source:?} is not UTF-8: {error}"))
    })?;
    let new_config = ClusterConfig::from_yaml(&text)?;
    log::info!("Configuration changed ({new_hash}), reconfiguring Slurm");

    match ctx.config().role() {
        InstanceRole::Controller => {
            conf::write_cloud_conf(ctx, &new_config, &ctx.config().output_dir).await?;
            write_atomically(config_path, &content)?;
            ctx.scheduler().restart_service("slurmctld").await?;
            ctx.scheduler().reconfigure().await?;
        }
        InstanceRole::Compute => {
            write_atomically(config_path, &content)?;
            ctx.scheduler().restart_service("slurmd").await?;
        }
        InstanceRole::Login => {
            write_atomically(config_path, &content)?;
            ctx.scheduler().restart_service("sackd").await?;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::{TestConfigBuilder, TestEnv};
    use gce::ApiError;
    use gce::testing::FakeTransport;
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Setup {
        env: TestEnv,
        source: PathBuf,
        live: PathBuf,
        _dir: TempDir,
    }

    fn setup(role: InstanceRole) -> Setup {
        let dir = TempDir::with_prefix("slurmgcp").unwrap();
        let source = dir.path().join("published.yaml");
        let live = dir.path().join("config.yaml");
        let mut config = TestConfigBuilder::default().role(role).build();
        config.config_source = Some(source.clone());
        std::fs::write(&source, config.to_yaml().unwrap()).unwrap();

        let transport = FakeTransport::new(|request| match request.method_id {
            "compute.instanceTemplates.get" => {
                Ok(json!({"properties": {"machineType": "c2-standard-60"}}))
            }
            "compute.machineTypes.aggregatedList" => Ok(json!({"items": {"zones/z": {"machineTypes": [
                {"name": "c2-standard-60", "guestCpus": 60, "memoryMb": 245760}
            ]}}})),
            _ => Err(ApiError::not_found("unexpected")),
        });
        Setup {
            env: TestEnv::create(config, transport),
            source,
            live,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn controller_applies_changed_config() {
        let Setup {
            env, source, live, _dir
        } = setup(InstanceRole::Controller);
        assert!(reconfigure_slurm(&env.ctx, &live).await.unwrap());
        assert_eq!(
            std::fs::read(&live).unwrap(),
            std::fs::read(&source).unwrap()
        );
        let cloud_conf =
            std::fs::read_to_string(env.ctx.config().output_dir.join(conf::CLOUD_CONF)).unwrap();
        assert!(cloud_conf.contains("NodeSet=n Nodes=hpc-n-[0-5]"));
        assert_eq!(
            env.slurm.updates(),
            vec!["systemctl restart slurmctld", "reconfigure"]
        );

        env.slurm.clear();
        assert!(!reconfigure_slurm(&env.ctx, &live).await.unwrap());
        assert!(env.slurm.updates().is_empty());
    }

    #[tokio::test]
    async fn compute_restarts_slurmd() {
        let Setup { env, live, _dir, .. } = setup(InstanceRole::Compute);
        assert!(reconfigure_slurm(&env.ctx, &live).await.unwrap());
        assert_eq!(env.slurm.updates(), vec!["systemctl restart slurmd"]);
        assert!(env.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn invalid_config_is_not_installed() {
        let Setup {
            env, source, live, _dir
        } = setup(InstanceRole::Login);
        std::fs::write(&source, "slurm_cluster_name: bad-name\nproject: p\n").unwrap();
        std::fs::write(&live, "previous").unwrap();
        assert!(matches!(
            reconfigure_slurm(&env.ctx, &live).await,
            Err(SyncError::ConfigError(_))
        ));
        assert_eq!(std::fs::read_to_string(&live).unwrap(), "previous");
        assert!(env.slurm.updates().is_empty());
    }

    #[tokio::test]
    async fn without_source_nothing_happens() {
        let env = TestEnv::new();
        let dir = TempDir::with_prefix("slurmgcp").unwrap();
        assert!(
            !reconfigure_slurm(&env.ctx, &dir.path().join("config.yaml"))
                .await
                .unwrap()
        );
    }
}
