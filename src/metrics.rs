use regex::Regex;
use serde::Serialize;
use std::{collections::BTreeMap, sync::LazyLock};

/// `family{labels} value` on a single line. Samples without a label block are not counters we track.
static SAMPLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_:][A-Za-z0-9_:]*)\{([^}]*)\}\s+([0-9.eE+-]+)$").expect("sample pattern")
});

/// How one metric family maps onto a counter key.
struct Family {
    name: &'static str,
    prefix: &'static str,
    /// (label, default) pairs; the default also replaces an empty value.
    labels: &'static [(&'static str, &'static str)],
}

const FAMILIES: &[Family] = &[
    Family { name: "http_requests_total", prefix: "http", labels: &[("status", "code"), ("handler", "")] },
    Family { name: "groq_requests_total", prefix: "groq:req", labels: &[("agent", "all")] },
    Family { name: "groq_tokens_total", prefix: "groq", labels: &[("type", "tok"), ("agent", "all")] },
    Family { name: "groq_errors_total", prefix: "groq:err", labels: &[("agent", "all")] },
    Family { name: "webhook_requests_total", prefix: "webhook:req", labels: &[("service", "")] },
    Family { name: "webhook_errors_total", prefix: "webhook:err", labels: &[("service", "")] },
];

impl Family {
    fn lookup(name: &str) -> Option<&'static Family> {
        FAMILIES.iter().find(|f| f.name == name)
    }

    fn key(&self, labels: &BTreeMap<&str, &str>) -> String {
        let mut key = self.prefix.to_string();
        for (label, default) in self.labels {
            let value = labels.get(label).copied().filter(|v| !v.is_empty()).unwrap_or(default);
            key.push(':');
            key.push_str(value);
        }
        key
    }
}

/// Simplified label parser: no commas or escaped quotes inside values.
fn parse_labels(block: &str) -> BTreeMap<&str, &str> {
    block
        .split(',')
        .filter_map(|piece| piece.split_once('='))
        .map(|(k, v)| {
            let v = v.strip_prefix('"').unwrap_or(v);
            let v = v.strip_suffix('"').unwrap_or(v);
            (k.trim(), v)
        })
        .collect()
}

/// Summed counters keyed by family plus selected labels, e.g. `http:200:/runs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetricTable(BTreeMap<String, f64>);

impl MetricTable {
    /// Re-derives the whole table from one exposition blob.
    pub fn parse(text: &str) -> Self {
        let mut out = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            let Some(caps) = SAMPLE.captures(line) else { continue };
            let Some(family) = Family::lookup(&caps[1]) else { continue };
            let Ok(value) = caps[3].parse::<f64>() else {
                tracing::trace!(line, "metric value is not a number");
                continue;
            };
            let key = family.key(&parse_labels(&caps[2]));
            *out.entry(key).or_insert(0.0) += value;
        }
        Self(out)
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries under `prefix` in key order, with the prefix stripped.
    pub fn section<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, f64)> + 'a {
        self.0
            .iter()
            .filter_map(move |(k, v)| k.strip_prefix(prefix).map(|rest| (rest, *v)))
    }
}
