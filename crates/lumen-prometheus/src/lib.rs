//! lumen-prometheus：把指标快照渲染为 Prometheus 文本曝光格式。
//!
//! # 教案式导读
//! - **意图（Why）**：核心只产出与格式无关的 [`MetricRecord`]；Prometheus
//!   的命名规则、类型映射与转义都收敛在本 crate，核心不被格式细节污染。
//! - **映射（How）**：
//!   - 计数器 → `counter` 族；
//!   - 双向计数器与观测仪 → `gauge` 族；
//!   - 值记录器 → `summary` 族，输出 `_count` / `_sum` 两条序列；
//!   - 指标名 `{前缀_}{类目}_{名称}`，非 `[A-Za-z0-9_]` 字符一律替换为 `_`。
//! - **契约（What）**：本 crate 不含 HTTP 服务；导出器把最近一次渲染结果
//!   缓存在内存里，由宿主自行对接抓取端点。

use std::fmt::Write as _;

use parking_lot::Mutex;

use lumen_core::metrics::{AggregationSnapshot, InstrumentKind, MetricRecord};
use lumen_core::telemetry::Telemetry;
use lumen_core::{ExportResult, MetricsExporter};

/// 把任意名字折算为合法的 Prometheus 指标/标签名。
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn metric_name(prefix: Option<&str>, record: &MetricRecord) -> String {
    let base = format!("{}_{}", sanitize(&record.category), sanitize(&record.name));
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}_{base}", sanitize(prefix)),
        _ => base,
    }
}

/// 标签值转义：反斜杠、双引号与换行。
fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

fn render_labels(record: &MetricRecord) -> String {
    if record.labels.is_empty() {
        return String::new();
    }
    let inner: Vec<String> = record
        .labels
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"", sanitize(key), escape_label_value(value)))
        .collect();
    format!("{{{}}}", inner.join(","))
}

fn type_of(kind: InstrumentKind) -> &'static str {
    match kind {
        InstrumentKind::Counter => "counter",
        InstrumentKind::UpDownCounter | InstrumentKind::Observer => "gauge",
        InstrumentKind::ValueRecorder => "summary",
    }
}

/// 把一批指标快照渲染为完整的文本曝光页。
///
/// 同名族的 `# HELP` / `# TYPE` 头只出现一次；序列顺序沿用快照顺序
/// （核心已按全限定名排好）。
pub fn render(prefix: Option<&str>, records: &[MetricRecord]) -> String {
    let mut out = String::new();
    let mut last_family: Option<String> = None;
    for record in records {
        let family = metric_name(prefix, record);
        if last_family.as_deref() != Some(family.as_str()) {
            if let Some(description) = &record.description {
                let _ = writeln!(out, "# HELP {family} {}", description.replace('\n', " "));
            }
            let _ = writeln!(out, "# TYPE {family} {}", type_of(record.kind));
            last_family = Some(family.clone());
        }
        let labels = render_labels(record);
        match &record.aggregation {
            AggregationSnapshot::Sum(total) => {
                let _ = writeln!(out, "{family}{labels} {total}");
            }
            AggregationSnapshot::Distribution { sum, count, .. } => {
                let _ = writeln!(out, "{family}_count{labels} {count}");
                let _ = writeln!(out, "{family}_sum{labels} {sum}");
            }
        }
    }
    out
}

/// 缓存最近一次渲染结果的指标导出器。
///
/// 宿主把 [`PrometheusExporter::page`] 的内容接到自己的抓取端点即可。
pub struct PrometheusExporter {
    prefix: Option<String>,
    page: Mutex<String>,
}

impl PrometheusExporter {
    pub fn new(prefix: Option<&str>) -> PrometheusExporter {
        PrometheusExporter {
            prefix: prefix.map(str::to_string),
            page: Mutex::new(String::new()),
        }
    }

    /// 最近一次导出的完整曝光页。
    pub fn page(&self) -> String {
        self.page.lock().clone()
    }
}

impl MetricsExporter for PrometheusExporter {
    fn export(&self, records: &[MetricRecord]) -> ExportResult {
        *self.page.lock() = render(self.prefix.as_deref(), records);
        ExportResult::Success
    }
}

/// 按环境配置装配并挂接 Prometheus 导出器，返回供抓取的句柄。
pub fn install(telemetry: &Telemetry) -> std::sync::Arc<PrometheusExporter> {
    let prefix = telemetry.environment().prometheus_prefix.clone();
    let exporter = std::sync::Arc::new(PrometheusExporter::new(prefix.as_deref()));
    telemetry.add_metrics_exporter(exporter.clone());
    exporter
}

/// 仅当 `METRICS_EXPORTERS` 点名 `prometheus` 时挂接导出器。
///
/// 配套 `Telemetry::initialize()` 使用：核心装配完毕后宿主调用一次，
/// 未点名时不产生任何副作用。
pub fn install_if_requested(telemetry: &Telemetry) -> Option<std::sync::Arc<PrometheusExporter>> {
    if telemetry.environment().wants_exporter("prometheus") {
        Some(install(telemetry))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::metrics::LabelSet;

    fn record(
        category: &str,
        name: &str,
        kind: InstrumentKind,
        labels: &[(&str, &str)],
        aggregation: AggregationSnapshot,
    ) -> MetricRecord {
        MetricRecord {
            category: category.into(),
            name: name.into(),
            kind,
            unit: None,
            description: Some("demo".into()),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<LabelSet>(),
            aggregation,
        }
    }

    #[test]
    fn sanitize_replaces_everything_outside_the_safe_class() {
        assert_eq!(sanitize("trace.duration"), "trace_duration");
        assert_eq!(sanitize("span-status"), "span_status");
        assert_eq!(sanitize("ok_name"), "ok_name");
    }

    #[test]
    fn counter_renders_with_type_header_and_labels() {
        let page = render(
            None,
            &[record(
                "jobs",
                "done",
                InstrumentKind::Counter,
                &[("queue", "a")],
                AggregationSnapshot::Sum(3.0),
            )],
        );
        assert_eq!(
            page,
            "# HELP jobs_done demo\n# TYPE jobs_done counter\njobs_done{queue=\"a\"} 3\n"
        );
    }

    #[test]
    fn recorder_renders_summary_count_and_sum() {
        let page = render(
            Some("svc"),
            &[record(
                "trace",
                "duration",
                InstrumentKind::ValueRecorder,
                &[("span", "store.fetch")],
                AggregationSnapshot::Distribution { min: 1.0, max: 9.0, sum: 12.0, count: 3, last: 9.0 },
            )],
        );
        assert!(page.contains("# TYPE svc_trace_duration summary"));
        assert!(page.contains("svc_trace_duration_count{span=\"store.fetch\"} 3"));
        assert!(page.contains("svc_trace_duration_sum{span=\"store.fetch\"} 12"));
    }

    #[test]
    fn family_header_emitted_once_per_family() {
        let records = vec![
            record("jobs", "done", InstrumentKind::Counter, &[("q", "a")], AggregationSnapshot::Sum(1.0)),
            record("jobs", "done", InstrumentKind::Counter, &[("q", "b")], AggregationSnapshot::Sum(2.0)),
        ];
        let page = render(None, &records);
        assert_eq!(page.matches("# TYPE jobs_done counter").count(), 1);
    }

    /// 环境点名 prometheus 时挂接成功，周期导出后抓取页可见指标。
    #[test]
    fn install_if_requested_honors_environment() {
        use lumen_core::testing::TelemetryFixture;

        let fixture = TelemetryFixture::with_vars(vec![
            ("METRICS_EXPORTERS".to_string(), "prometheus".to_string()),
            ("METRICS_PROMETHEUS_PREFIX".to_string(), "svc".to_string()),
        ]);
        let exporter = install_if_requested(&fixture.telemetry).expect("应挂接导出器");
        fixture.telemetry.counter("jobs", "done", 2.0, LabelSet::new());
        fixture.telemetry.flush_metrics();
        assert!(exporter.page().contains("svc_jobs_done 2"));

        let silent = TelemetryFixture::new();
        assert!(install_if_requested(&silent.telemetry).is_none());
    }

    #[test]
    fn label_values_are_escaped() {
        let page = render(
            None,
            &[record(
                "jobs",
                "done",
                InstrumentKind::Counter,
                &[("path", "a\"b\\c\nd")],
                AggregationSnapshot::Sum(1.0),
            )],
        );
        assert!(page.contains("path=\"a\\\"b\\\\c\\nd\""));
    }
}
