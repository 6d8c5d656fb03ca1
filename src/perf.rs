use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{Map, Value, json};

/// Span timings and counters, with a ranked `<stem>_hot.log` written when the last handle drops.
#[derive(Clone)]
pub(crate) struct PerfLogger {
    inner: Arc<Mutex<PerfState>>,
}

struct PerfState {
    writer: BufWriter<File>,
    path: PathBuf,
    span_totals: HashMap<String, f64>,
    span_counts: HashMap<String, u64>,
    count_totals: HashMap<String, u64>,
}

impl PerfLogger {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(PerfState {
                writer: BufWriter::new(file),
                path,
                span_totals: HashMap::new(),
                span_counts: HashMap::new(),
                count_totals: HashMap::new(),
            })),
        })
    }

    pub fn log_span_ms(&self, name: &str, doc_id: Option<usize>, ms: f64) {
        let line = json!({
            "type": "perf.span",
            "name": name,
            "doc_id": doc_id,
            "unit": "ms",
            "ms": (ms * 1000.0).round() / 1000.0,
        });
        if let Ok(mut state) = self.inner.lock() {
            *state.span_totals.entry(name.to_string()).or_insert(0.0) += ms;
            let entry = state.span_counts.entry(name.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            let _ = writeln!(state.writer, "{line}");
        }
    }

    /// Times `f` and logs it as a span.
    pub fn span<T>(&self, name: &str, doc_id: Option<usize>, f: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let out = f();
        self.log_span_ms(name, doc_id, started.elapsed().as_secs_f64() * 1000.0);
        out
    }

    pub fn log_counts(&self, name: &str, doc_id: Option<usize>, counts: &[(&str, u64)]) {
        let map: Map<String, Value> = counts
            .iter()
            .map(|(key, value)| (key.to_string(), Value::from(*value)))
            .collect();
        let line = json!({
            "type": "perf.counts",
            "name": name,
            "doc_id": doc_id,
            "counts": map,
        });
        if let Ok(mut state) = self.inner.lock() {
            for (key, value) in counts {
                let entry = state.count_totals.entry(format!("{name}.{key}")).or_insert(0);
                *entry = entry.saturating_add(*value);
            }
            let _ = writeln!(state.writer, "{line}");
        }
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }
}

impl Drop for PerfState {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        let Ok(file) = File::create(hot_path_for(&self.path)) else {
            return;
        };
        let mut writer = BufWriter::new(file);

        let mut spans: Vec<(&String, &f64)> = self.span_totals.iter().collect();
        spans.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (rank, (name, ms)) in spans.into_iter().take(100).enumerate() {
            let count = *self.span_counts.get(name).unwrap_or(&1);
            let avg = if count == 0 { 0.0 } else { ms / count as f64 };
            let line = json!({
                "type": "perf.hot.span",
                "rank": rank + 1,
                "name": name,
                "unit": "ms",
                "agg": "sum",
                "ms": ms,
                "count": count,
                "avg_ms": avg,
            });
            let _ = writeln!(writer, "{line}");
        }

        let mut counts: Vec<(&String, &u64)> = self.count_totals.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        for (rank, (name, value)) in counts.into_iter().take(100).enumerate() {
            let line = json!({
                "type": "perf.hot.count",
                "rank": rank + 1,
                "name": name,
                "value": value,
            });
            let _ = writeln!(writer, "{line}");
        }
    }
}

fn hot_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("ripple_perf.log");
    let stem = file_name
        .rsplit_once('.')
        .map(|(s, _)| s)
        .unwrap_or(file_name);
    path.with_file_name(format!("{stem}_hot.log"))
}
