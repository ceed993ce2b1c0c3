// Host sampling primitives
//
// Thin wrappers over /proc, /sys and the external tools the parsers
// understand. Subprocess output is captured with a hard timeout and the
// child is killed on cancellation; stderr is discarded apart from a
// debug log line.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::parsers;
use crate::error::{Error, Result};

/// Hard ceiling on any external command.
pub const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(10);

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Run a command, returning captured stdout. Times out hard; the child
/// does not outlive the caller.
pub async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::TransientNetwork(format!("spawn {program}: {e}")))?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let collected = tokio::time::timeout(timeout, async {
        let mut out = String::new();
        let mut err = String::new();
        let _ = stdout.read_to_string(&mut out).await;
        let _ = stderr.read_to_string(&mut err).await;
        let status = child.wait().await;
        (out, err, status)
    })
    .await;

    match collected {
        Ok((out, err, status)) => {
            if !err.is_empty() {
                tracing::debug!("{program} stderr: {}", err.trim());
            }
            match status {
                Ok(status) if status.success() => Ok(out),
                Ok(status) => Err(Error::TransientNetwork(format!(
                    "{program} exited with {status}"
                ))),
                Err(e) => Err(Error::TransientNetwork(format!("{program} wait: {e}"))),
            }
        }
        Err(_) => Err(Error::TransientNetwork(format!(
            "{program} timed out after {timeout:?}"
        ))),
    }
}

/// CPU temperature: thermal zone sysfs first, vcgencmd as fallback.
pub async fn read_cpu_temp() -> Option<f64> {
    if let Ok(contents) = tokio::fs::read_to_string(THERMAL_ZONE).await {
        if let Some(temp) = parsers::parse_thermal_zone(&contents) {
            return Some(temp);
        }
    }
    match run_command("vcgencmd", &["measure_temp"], SUBPROCESS_TIMEOUT).await {
        Ok(output) => parsers::parse_vcgencmd_temp(&output),
        Err(e) => {
            tracing::debug!("cpu temperature unavailable: {e}");
            None
        }
    }
}

/// Instantaneous CPU jiffies; callers diff two samples for a percent.
pub async fn read_cpu_times() -> Option<parsers::CpuTimes> {
    let contents = tokio::fs::read_to_string("/proc/stat").await.ok()?;
    parsers::parse_proc_stat_cpu(&contents)
}

pub async fn read_mem_percent() -> Option<f64> {
    let contents = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
    parsers::parse_meminfo_percent(&contents)
}

/// Disk usage percent of the filesystem holding `path`.
pub async fn read_disk_percent(path: &Path) -> Option<f64> {
    let path = path.to_string_lossy().to_string();
    match run_command("df", &["-P", &path], SUBPROCESS_TIMEOUT).await {
        Ok(output) => parsers::parse_df_percent(&output),
        Err(e) => {
            tracing::debug!("disk usage unavailable: {e}");
            None
        }
    }
}

/// Raw (rx, tx) byte counters for an interface.
pub async fn read_net_counters(iface: &str) -> Option<(u64, u64)> {
    let contents = tokio::fs::read_to_string("/proc/net/dev").await.ok()?;
    parsers::parse_net_dev(&contents, iface)
}

/// Probe a service unit. Errors feed the per-service circuit breaker.
pub async fn service_active(unit: &str) -> Result<bool> {
    let output = run_command("systemctl", &["is-active", unit], SUBPROCESS_TIMEOUT).await;
    match output {
        Ok(out) => Ok(parsers::parse_systemctl_active(&out)),
        // is-active exits non-zero for inactive units; that is an
        // answer, not a probe failure
        Err(Error::TransientNetwork(msg)) if msg.contains("exited with") => Ok(false),
        Err(e) => Err(e),
    }
}

/// Control a service unit through the host service manager.
pub async fn service_control(unit: &str, action: &str) -> Result<()> {
    run_command("systemctl", &[action, unit], SUBPROCESS_TIMEOUT).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_output_is_captured() {
        let out = run_command("echo", &["hello"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn command_timeout_is_enforced() {
        let err = run_command("sleep", &["5"], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TransientNetworkError");
    }

    #[tokio::test]
    async fn missing_binary_is_transient() {
        let err = run_command("definitely-not-a-binary", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TransientNetworkError");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let err = run_command("false", &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }
}
