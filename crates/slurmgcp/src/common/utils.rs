use std::ffi::OsStr;
use std::path::Path;
use std::process::Output;
use std::time::Duration;

use anyhow::Context;
use bstr::ByteSlice;
use chrono::{DateTime, Utc};
use tokio::process::Command;

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Splits items into those that satisfy `predicate` and the rest.
pub fn separate<T>(
    items: impl IntoIterator<Item = T>,
    predicate: impl Fn(&T) -> bool,
) -> (Vec<T>, Vec<T>) {
    items.into_iter().partition(|item| predicate(item))
}

/// Consecutive chunks of at most `size` items, the last one may be shorter.
pub fn chunked<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(|chunk| chunk.to_vec()).collect()
}

pub fn check_command_output(output: Output) -> anyhow::Result<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

/// Runs a program to completion and returns its stdout.
pub async fn run_command<S: AsRef<OsStr>>(
    program: &Path,
    args: &[S],
    timeout: Duration,
) -> anyhow::Result<String> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    log::debug!(
        "Running {} {}",
        program.display(),
        args.iter()
            .map(|arg| arg.as_ref().to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    );
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| anyhow::anyhow!("{} timed out after {timeout:?}", program.display()))?
        .with_context(|| format!("Cannot execute {}", program.display()))?;
    let output = check_command_output(output)
        .with_context(|| format!("{} execution failed", program.display()))?;
    Ok(output.stdout.to_str_lossy().into_owned())
}

/// Hex encoded BLAKE2b-256 digest.
pub fn hash_bytes(data: &[u8]) -> anyhow::Result<String> {
    let digest =
        orion::hash::digest(data).map_err(|e| anyhow::anyhow!("Cannot hash data: {e}"))?;
    Ok(hex::encode(digest.as_ref()))
}

pub fn hash_file(path: &Path) -> anyhow::Result<String> {
    let data = std::fs::read(path).with_context(|| format!("Cannot read {path:?}"))?;
    hash_bytes(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_items() {
        let items: Vec<u32> = (0..7).collect();
        assert_eq!(chunked(&items, 3), vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert_eq!(chunked(&items, 0).len(), 7);
        assert!(chunked::<u32>(&[], 3).is_empty());
    }

    #[test]
    fn separate_items() {
        let (even, odd) = separate(1..=5, |x| x % 2 == 0);
        assert_eq!(even, vec![2, 4]);
        assert_eq!(odd, vec![1, 3, 5]);
    }

    #[test]
    fn hash_is_stable() {
        let a = hash_bytes(b"config").unwrap();
        assert_eq!(a, hash_bytes(b"config").unwrap());
        assert_ne!(a, hash_bytes(b"config2").unwrap());
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn failed_command_reports_output() {
        let error = run_command(
            Path::new("sh"),
            &["-c", "echo out; echo err >&2; exit 3"],
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        let message = format!("{error:?}");
        assert!(message.contains("Exit code: 3"));
        assert!(message.contains("Stderr: err"));
        assert!(message.contains("Stdout: out"));
    }
}
