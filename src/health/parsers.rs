// Per-tool output grammars
//
// External tools are parsed line-by-line with anchored expressions; a
// line that does not match its grammar yields None rather than a guess.

use std::sync::OnceLock;

use regex::Regex;

fn vcgencmd_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^temp=(\d+(?:\.\d+)?)'C$").expect("vcgencmd grammar"))
}

/// `vcgencmd measure_temp` -> `temp=48.3'C`
pub fn parse_vcgencmd_temp(output: &str) -> Option<f64> {
    let caps = vcgencmd_re().captures(output.trim())?;
    caps.get(1)?.as_str().parse().ok()
}

/// `/sys/class/thermal/.../temp` reports millidegrees.
pub fn parse_thermal_zone(output: &str) -> Option<f64> {
    let millidegrees: f64 = output.trim().parse().ok()?;
    Some(millidegrees / 1000.0)
}

/// `systemctl is-active <unit>` prints a single state word.
pub fn parse_systemctl_active(output: &str) -> bool {
    output.trim() == "active"
}

fn df_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Filesystem 1024-blocks Used Available Capacity Mounted-on
    RE.get_or_init(|| {
        Regex::new(r"^\S+\s+\d+\s+\d+\s+\d+\s+(\d+)%\s+\S+$").expect("df grammar")
    })
}

/// POSIX `df -P <path>`: capacity percent from the data line.
pub fn parse_df_percent(output: &str) -> Option<f64> {
    output
        .lines()
        .skip(1)
        .find_map(|line| df_re().captures(line.trim()))
        .and_then(|caps| caps.get(1)?.as_str().parse().ok())
}

/// Aggregate jiffies from the `cpu` line of /proc/stat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

fn proc_stat_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^cpu\s+(.+)$").expect("proc stat grammar"))
}

pub fn parse_proc_stat_cpu(contents: &str) -> Option<CpuTimes> {
    let line = contents.lines().next()?;
    let caps = proc_stat_re().captures(line)?;
    let fields: Vec<u64> = caps
        .get(1)?
        .as_str()
        .split_whitespace()
        .filter_map(|f| f.parse().ok())
        .collect();
    // user nice system idle iowait irq softirq steal ...
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        total: fields.iter().sum(),
        idle,
    })
}

/// CPU busy percent across two /proc/stat samples.
pub fn cpu_percent_between(prior: CpuTimes, current: CpuTimes) -> Option<f64> {
    let total = current.total.checked_sub(prior.total)?;
    let idle = current.idle.checked_sub(prior.idle)?;
    if total == 0 {
        return None;
    }
    Some(((total - idle.min(total)) as f64 / total as f64) * 100.0)
}

fn meminfo_value(contents: &str, key: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        rest.trim().split_whitespace().next()?.parse().ok()
    })
}

/// Used-memory percent from /proc/meminfo (MemTotal vs MemAvailable).
pub fn parse_meminfo_percent(contents: &str) -> Option<f64> {
    let total = meminfo_value(contents, "MemTotal")?;
    let available = meminfo_value(contents, "MemAvailable")?;
    if total == 0 {
        return None;
    }
    Some(((total - available.min(total)) as f64 / total as f64) * 100.0)
}

fn net_dev_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // iface: rx_bytes packets errs drop fifo frame compressed multicast tx_bytes ...
    RE.get_or_init(|| {
        Regex::new(r"^\s*([^:\s]+):\s*(\d+)(?:\s+\d+){7}\s+(\d+)").expect("net dev grammar")
    })
}

/// (rx_bytes, tx_bytes) for `iface` from /proc/net/dev.
pub fn parse_net_dev(contents: &str, iface: &str) -> Option<(u64, u64)> {
    contents.lines().find_map(|line| {
        let caps = net_dev_re().captures(line)?;
        if caps.get(1)?.as_str() != iface {
            return None;
        }
        let rx = caps.get(2)?.as_str().parse().ok()?;
        let tx = caps.get(3)?.as_str().parse().ok()?;
        Some((rx, tx))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vcgencmd_grammar() {
        assert_eq!(parse_vcgencmd_temp("temp=48.3'C\n"), Some(48.3));
        assert_eq!(parse_vcgencmd_temp("temp=50'C"), Some(50.0));
        assert_eq!(parse_vcgencmd_temp("error: command failed"), None);
        assert_eq!(parse_vcgencmd_temp(""), None);
    }

    #[test]
    fn thermal_zone_millidegrees() {
        assert_eq!(parse_thermal_zone("48234\n"), Some(48.234));
        assert_eq!(parse_thermal_zone("garbage"), None);
    }

    #[test]
    fn systemctl_state_word() {
        assert!(parse_systemctl_active("active\n"));
        assert!(!parse_systemctl_active("inactive\n"));
        assert!(!parse_systemctl_active("failed"));
        assert!(!parse_systemctl_active(""));
    }

    #[test]
    fn df_capacity_column() {
        let output = "\
Filesystem     1024-blocks     Used Available Capacity Mounted on
/dev/root         30471512 18654321  10543210      64% /
";
        assert_eq!(parse_df_percent(output), Some(64.0));
        assert_eq!(parse_df_percent("Filesystem\n"), None);
    }

    #[test]
    fn proc_stat_delta() {
        let before = parse_proc_stat_cpu("cpu  100 0 50 800 50 0 0 0 0 0\n").unwrap();
        let after = parse_proc_stat_cpu("cpu  200 0 100 1500 100 0 0 0 0 0\n").unwrap();
        let percent = cpu_percent_between(before, after).unwrap();
        // 150 busy jiffies out of 900 total
        assert!((percent - 16.666).abs() < 0.1);
    }

    #[test]
    fn proc_stat_rejects_short_lines() {
        assert_eq!(parse_proc_stat_cpu("cpu 1 2\n"), None);
        assert_eq!(parse_proc_stat_cpu("intr 12345\n"), None);
    }

    #[test]
    fn meminfo_percent() {
        let contents = "\
MemTotal:        3882924 kB
MemFree:          200000 kB
MemAvailable:    1941462 kB
";
        let percent = parse_meminfo_percent(contents).unwrap();
        assert!((percent - 50.0).abs() < 0.01);
        assert_eq!(parse_meminfo_percent("MemTotal: 100 kB\n"), None);
    }

    #[test]
    fn net_dev_named_interface() {
        let contents = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
  wlan0: 1234567    9876    0    0    0     0          0         0  7654321    5432    0    0    0     0       0          0
    lo:     500       5    0    0    0     0          0         0      500       5    0    0    0     0       0          0
";
        assert_eq!(parse_net_dev(contents, "wlan0"), Some((1_234_567, 7_654_321)));
        assert_eq!(parse_net_dev(contents, "lo"), Some((500, 500)));
        assert_eq!(parse_net_dev(contents, "eth0"), None);
    }
}
