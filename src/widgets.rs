// Dashboard widget registry
//
// Widgets are a closed, compile-time registry indexed by name; the UI
// discovers them through /api/widgets and individual entries are
// switched off with the widget_* config flags. Extending the set means
// linking another entry here, not loading code at runtime.

use serde_json::{json, Value};

use crate::config::Config;
use crate::store::HealthRecord;

/// A named dashboard metric source.
pub struct Widget {
    name: &'static str,
    snapshot: fn(&HealthRecord) -> Value,
}

impl Widget {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Metrics payload derived from the newest health sample.
    pub fn snapshot(&self, record: &HealthRecord) -> Value {
        (self.snapshot)(record)
    }
}

static REGISTRY: &[Widget] = &[
    Widget {
        name: "cpu_temp",
        snapshot: |r| json!({ "celsius": r.cpu_temp_celsius }),
    },
    Widget {
        name: "cpu_usage",
        snapshot: |r| json!({ "percent": r.cpu_percent }),
    },
    Widget {
        name: "mem_usage",
        snapshot: |r| json!({ "percent": r.mem_percent }),
    },
    Widget {
        name: "disk_usage",
        snapshot: |r| json!({ "percent": r.disk_percent }),
    },
    Widget {
        name: "health_summary",
        snapshot: |r| {
            json!({
                "timestamp": r.timestamp,
                "cpu_temp_celsius": r.cpu_temp_celsius,
                "cpu_percent": r.cpu_percent,
                "mem_percent": r.mem_percent,
                "disk_percent": r.disk_percent,
            })
        },
    },
];

pub fn registry() -> &'static [Widget] {
    REGISTRY
}

pub fn find(name: &str) -> Option<&'static Widget> {
    REGISTRY.iter().find(|w| w.name == name)
}

/// Widget names currently enabled by configuration.
pub fn enabled_names(config: &Config) -> Vec<&'static str> {
    REGISTRY
        .iter()
        .filter(|w| config.widget_enabled(w.name))
        .map(|w| w.name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record() -> HealthRecord {
        HealthRecord {
            timestamp: Utc::now(),
            cpu_temp_celsius: Some(55.0),
            cpu_percent: Some(20.0),
            mem_percent: Some(30.0),
            disk_percent: Some(40.0),
        }
    }

    #[test]
    fn registry_names_are_unique() {
        let mut names: Vec<_> = registry().iter().map(|w| w.name()).collect();
        let before = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), before);
    }

    #[test]
    fn lookup_by_name() {
        assert!(find("cpu_temp").is_some());
        assert!(find("plugin_from_disk").is_none());
    }

    #[test]
    fn snapshots_expose_metrics() {
        let record = record();
        assert_eq!(find("cpu_temp").unwrap().snapshot(&record)["celsius"], 55.0);
        assert_eq!(find("mem_usage").unwrap().snapshot(&record)["percent"], 30.0);
    }

    #[test]
    fn config_flags_filter_names() {
        let mut config = Config::default();
        assert!(enabled_names(&config).contains(&"disk_usage"));
        config.widgets.insert("disk_usage".to_string(), false);
        assert!(!enabled_names(&config).contains(&"disk_usage"));
    }
}
