use std::time::Duration;

macro_rules! create_slurmgcp_env {
    ($name: literal) => {
        concat!("SLURMGCP_", $name)
    };
}

/// Known environment variables
pub const SLURMGCP_ORPHAN_GRACE: &str = create_slurmgcp_env!("ORPHAN_GRACE");
pub const SLURMGCP_OPERATION_POLL: &str = create_slurmgcp_env!("OPERATION_POLL");
pub const SLURMGCP_INSTANCE_ROLE: &str = create_slurmgcp_env!("INSTANCE_ROLE");

/// Set by Slurm for the ResumeProgram.
pub const SLURM_RESUME_FILE: &str = "SLURM_RESUME_FILE";

pub const DEFAULT_ORPHAN_GRACE: Duration = Duration::from_secs(90);
pub const DEFAULT_OPERATION_POLL: Duration = Duration::from_secs(1);

/// Knobs that are not part of the cluster configuration.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Running instances younger than this are never treated as orphans.
    pub orphan_grace: Duration,
    /// Initial delay between polls of an unfinished operation.
    pub operation_poll: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            orphan_grace: DEFAULT_ORPHAN_GRACE,
            operation_poll: DEFAULT_OPERATION_POLL,
        }
    }
}

impl Tunables {
    pub fn from_env() -> Self {
        Tunables {
            orphan_grace: duration_from_env(SLURMGCP_ORPHAN_GRACE, DEFAULT_ORPHAN_GRACE),
            operation_poll: duration_from_env(SLURMGCP_OPERATION_POLL, DEFAULT_OPERATION_POLL),
        }
    }
}

/// Reads a duration like `90s` or `1m 30s`, invalid values fall back to `default`.
fn duration_from_env(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(value) => parse_duration(&value).unwrap_or_else(|| {
            log::warn!("Ignoring invalid value of {name}: {value}");
            default
        }),
        Err(_) => default,
    }
}

fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).ok()
}

#[cfg(test)]
mod tests {
    use super::parse_duration;
    use std::time::Duration;

    #[test]
    fn parse_env_durations() {
        assert_eq!(parse_duration("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1m 30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("soon"), None);
    }
}
