//! Connection statistics.
//!
//! Transports and filters each report an ordered key/value map. The
//! collected [`ConnectionStats`] render through a [`StatsFormat`].

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Ordered key/value statistics of one component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatsReport {
    entries: BTreeMap<String, String>,
}

impl StatsReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl std::fmt::Display) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl std::fmt::Display) {
        self.entries.insert(key.into(), value.to_string());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Statistics of a connection's transports and filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub transports: BTreeMap<String, StatsReport>,
    pub filters: BTreeMap<String, StatsReport>,
}

impl ConnectionStats {
    #[must_use]
    pub fn render(&self, format: &dyn StatsFormat) -> String {
        format.render(self)
    }
}

impl std::fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&PlainText.render(self))
    }
}

pub trait StatsFormat {
    fn render(&self, stats: &ConnectionStats) -> String;
}

/// Human readable report with one headed section per component.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainText;

impl StatsFormat for PlainText {
    fn render(&self, stats: &ConnectionStats) -> String {
        let mut out = String::new();
        section(&mut out, "Transports", &stats.transports);
        section(&mut out, "Filters", &stats.filters);
        out
    }
}

fn section(out: &mut String, title: &str, reports: &BTreeMap<String, StatsReport>) {
    let _ = writeln!(out, "{title}");
    let _ = writeln!(out, "{}", "#".repeat(title.len()));
    if reports.is_empty() {
        out.push_str("(none)\n");
    }
    for (name, report) in reports {
        let _ = writeln!(out, "{name}");
        for (key, value) in report.iter() {
            let _ = writeln!(out, "  {key}: {value}");
        }
    }
    out.push('\n');
}

/// TOML document with `[transports.<name>]` and `[filters.<name>]` tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct Toml;

impl StatsFormat for Toml {
    fn render(&self, stats: &ConnectionStats) -> String {
        toml::to_string_pretty(stats).unwrap_or_else(|e| format!("# failed to render stats: {e}\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConnectionStats {
        let mut stats = ConnectionStats::default();
        stats.transports.insert(
            "tcp".to_owned(),
            StatsReport::new().with("bytes_written", 512).with("elements_sent", 4),
        );
        stats.filters.insert(
            "zlib".to_owned(),
            StatsReport::new().with("ratio", "0.42"),
        );
        stats
    }

    #[test]
    fn plain_text_sections() {
        let text = sample().to_string();
        assert!(text.starts_with("Transports\n##########\ntcp\n"));
        assert!(text.contains("  bytes_written: 512\n"));
        assert!(text.contains("Filters\n#######\nzlib\n  ratio: 0.42\n"));
    }

    #[test]
    fn plain_text_empty_sections() {
        let text = ConnectionStats::default().render(&PlainText);
        assert!(text.contains("Filters\n#######\n(none)\n"));
    }

    #[test]
    fn toml_round_trips() {
        let stats = sample();
        let rendered = stats.render(&Toml);
        assert!(rendered.contains("[transports.tcp]"));
        let parsed: ConnectionStats = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, stats);
    }
}
