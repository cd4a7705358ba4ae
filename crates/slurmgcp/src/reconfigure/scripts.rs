use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::common::config::{ClusterConfig, InstanceRole};
use crate::common::utils::hash_file;
use crate::inventory::parse_node_name;

static SCRIPT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^slurm-(?P<path>\S+)-script-(?P<name>\S+)$").expect("Invalid script regex")
});

const SCRIPT_MODE: u32 = 0o755;

/// Script path prefixes installed on an instance of `role`.
fn role_tokens(role: InstanceRole, hostname: &str) -> Vec<String> {
    match role {
        InstanceRole::Controller => vec!["controller".into(), "prolog".into(), "epilog".into()],
        InstanceRole::Compute => {
            let mut tokens = vec!["prolog".to_string(), "epilog".to_string()];
            if let Ok(desc) = parse_node_name(hostname) {
                tokens.push(format!("nodeset-{}", desc.nodeset));
            }
            tokens
        }
        InstanceRole::Login => vec!["login".into()],
    }
}

/// `slurm-nodeset-gpu-script-setup_sh` -> `nodeset.d/gpu/setup.sh`
fn install_path(file_name: &str, tokens: &[String]) -> Option<PathBuf> {
    let captures = SCRIPT_REGEX.captures(file_name)?;
    let path = &captures["path"];
    if !tokens
        .iter()
        .any(|token| path == token || path.starts_with(&format!("{token}-")))
    {
        return None;
    }
    let name = &captures["name"];
    let file_name = match name.rsplit_once('_') {
        Some((stem, ext)) => format!("{stem}.{ext}"),
        None => name.to_string(),
    };
    let mut parts = path.split('-');
    let mut target = PathBuf::from(format!("{}.d", parts.next()?));
    target.extend(parts);
    target.push(file_name);
    Some(target)
}

fn install_script(source: &Path, target: &Path) -> crate::Result<bool> {
    if target.exists() && hash_file(source)? == hash_file(target)? {
        return Ok(false);
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, target)?;
    std::fs::set_permissions(target, std::fs::Permissions::from_mode(SCRIPT_MODE))?;
    Ok(true)
}

/// Copies changed custom scripts for the role of this instance, returns the installed paths.
pub fn install_custom_scripts(config: &ClusterConfig, hostname: &str) -> crate::Result<Vec<PathBuf>> {
    let Some(source_dir) = &config.custom_scripts_source else {
        return Ok(Vec::new());
    };
    let tokens = role_tokens(config.role(), hostname);
    let mut entries: Vec<_> = std::fs::read_dir(source_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .collect();
    entries.sort_by_key(|entry| entry.file_name());

    let mut installed = Vec::new();
    for entry in entries {
        let file_name = entry.file_name();
        let Some(relative) = file_name.to_str().and_then(|name| install_path(name, &tokens))
        else {
            continue;
        };
        let target = config.custom_scripts_dir.join(relative);
        if install_script(&entry.path(), &target)? {
            log::info!("installing custom script: {}", target.display());
            installed.push(target);
        }
    }
    Ok(installed)
}
