use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_frames_total: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    update_outcomes_total: Mutex<HashMap<String, u64>>,
    snapshot_saves_total: Mutex<HashMap<String, u64>>,
    active_sessions: AtomicU64,
}

const UPDATE_OUTCOMES: [&str; 4] = ["applied", "noop", "read_only", "malformed"];
const SNAPSHOT_SAVE_OUTCOMES: [&str; 3] = ["persisted", "rejected_too_small", "failed"];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_frames_total: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            update_outcomes_total: Mutex::new(zeroed(&UPDATE_OUTCOMES)),
            snapshot_saves_total: Mutex::new(zeroed(&SNAPSHOT_SAVE_OUTCOMES)),
            active_sessions: AtomicU64::new(0),
        }
    }
}

fn zeroed(labels: &[&str]) -> HashMap<String, u64> {
    labels.iter().map(|label| (label.to_string(), 0)).collect()
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_ws_frame(kind: &str, is_error: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_frame(kind, is_error);
    }
}

pub fn record_update_outcome(outcome: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_update_outcome(outcome);
    }
}

pub fn record_snapshot_save(outcome: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_snapshot_save(outcome);
    }
}

pub fn set_active_sessions(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_active_sessions(count);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_frame(&self, kind: &str, is_error: bool) {
        let kind = normalize_label(kind);
        increment_label_counter(&self.ws_frames_total, &kind, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &kind, 1);
        }
    }

    pub fn record_update_outcome(&self, outcome: &str) {
        increment_label_counter(
            &self.update_outcomes_total,
            &normalize_known(outcome, &UPDATE_OUTCOMES),
            1,
        );
    }

    pub fn record_snapshot_save(&self, outcome: &str) {
        increment_label_counter(
            &self.snapshot_saves_total,
            &normalize_known(outcome, &SNAPSHOT_SAVE_OUTCOMES),
            1,
        );
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.store(count as u64, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_frames_total Total inbound websocket frames by kind.\n");
        output.push_str("# TYPE relay_ws_frames_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_frames_total", "kind", &self.ws_frames_total);

        output.push_str("# HELP relay_ws_errors_total Total websocket frames answered with an error by kind.\n");
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_errors_total", "kind", &self.ws_errors_total);

        output.push_str("# HELP relay_update_outcomes_total CRDT updates by merge outcome.\n");
        output.push_str("# TYPE relay_update_outcomes_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_update_outcomes_total",
            "outcome",
            &self.update_outcomes_total,
        );

        output.push_str("# HELP relay_snapshot_saves_total Snapshot save attempts by outcome.\n");
        output.push_str("# TYPE relay_snapshot_saves_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_snapshot_saves_total",
            "outcome",
            &self.snapshot_saves_total,
        );

        output.push_str("# HELP relay_active_sessions Documents with at least one connection.\n");
        output.push_str("# TYPE relay_active_sessions gauge\n");
        output.push_str(&format!(
            "relay_active_sessions {}\n",
            self.active_sessions.load(Ordering::SeqCst)
        ));

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn normalize_known(label: &str, known: &[&str]) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if known.contains(&normalized.as_str()) {
        normalized
    } else {
        "unknown".to_string()
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::RelayMetrics;

    #[test]
    fn render_prometheus_includes_red_and_sync_metrics() {
        let metrics = RelayMetrics::default();
        metrics.record_http_request("GET", "/healthz", 200, 3);
        metrics.record_http_request("get", "/v1/unknown/42", 404, 1);
        metrics.record_ws_frame("update", false);
        metrics.record_ws_frame("update", true);
        metrics.record_ws_frame("join", false);
        metrics.record_update_outcome("applied");
        metrics.record_update_outcome("applied");
        metrics.record_update_outcome("read_only");
        metrics.record_update_outcome("something-else");
        metrics.record_snapshot_save("persisted");
        metrics.record_snapshot_save("failed");
        metrics.set_active_sessions(3);

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains("relay_request_rate_total{method=\"GET\",endpoint=\"/healthz\"} 1"));
        assert!(rendered
            .contains("relay_request_errors_total{method=\"GET\",endpoint=\"/v1/unknown/{number}\"} 1"));
        assert!(rendered.contains("relay_ws_frames_total{kind=\"update\"} 2"));
        assert!(rendered.contains("relay_ws_frames_total{kind=\"join\"} 1"));
        assert!(rendered.contains("relay_ws_errors_total{kind=\"update\"} 1"));
        assert!(rendered.contains("relay_update_outcomes_total{outcome=\"applied\"} 2"));
        assert!(rendered.contains("relay_update_outcomes_total{outcome=\"noop\"} 0"));
        assert!(rendered.contains("relay_update_outcomes_total{outcome=\"read_only\"} 1"));
        assert!(rendered.contains("relay_update_outcomes_total{outcome=\"unknown\"} 1"));
        assert!(rendered.contains("relay_snapshot_saves_total{outcome=\"persisted\"} 1"));
        assert!(rendered.contains("relay_snapshot_saves_total{outcome=\"rejected_too_small\"} 0"));
        assert!(rendered.contains("relay_snapshot_saves_total{outcome=\"failed\"} 1"));
        assert!(rendered.contains("relay_active_sessions 3"));
    }

    #[test]
    fn label_values_are_escaped() {
        let metrics = RelayMetrics::default();
        metrics.record_ws_frame("we\"ird", false);

        assert!(metrics.render_prometheus().contains("relay_ws_frames_total{kind=\"we\\\"ird\"} 1"));
    }
}
