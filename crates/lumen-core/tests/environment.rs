//! 环境变量配置与注入：属性、标签与优先级。

use lumen_core::metrics::LabelSet;
use lumen_core::testing::TelemetryFixture;
use lumen_core::{AttributeValue, MetricsExporter};

fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// 环境属性注入每个 Span，应用身份映射为点分键。
#[test]
fn environment_attributes_are_stamped_on_every_span() {
    let fixture = TelemetryFixture::with_vars(vars(&[
        ("METRICS_APP_NAME", "orders"),
        ("METRICS_APP_VERSION", "2.4.1"),
        ("METRICS_ATTRIBUTE_DEPLOY_RING", "canary"),
    ]));
    {
        let _span = fixture.telemetry.span("store", "fetch").start();
    }
    let spans = fixture.spans_named("store.fetch");
    let attrs = spans[0].attributes();
    assert_eq!(attrs.get("app.name").and_then(AttributeValue::as_text), Some("orders"));
    assert_eq!(attrs.get("app.version").and_then(AttributeValue::as_text), Some("2.4.1"));
    assert_eq!(attrs.get("deploy_ring").and_then(AttributeValue::as_text), Some("canary"));
}

/// 环境属性注入最后执行：同名的调用方属性被环境值覆盖。
#[test]
fn environment_attributes_override_caller_values() {
    let fixture = TelemetryFixture::with_vars(vars(&[("METRICS_ATTRIBUTE_REGION", "eu-1")]));
    {
        let span = fixture
            .telemetry
            .span("store", "fetch")
            .with_attribute("region", "local-guess")
            .start();
        assert_eq!(
            span.attributes().get("region").and_then(AttributeValue::as_text),
            Some("eu-1")
        );
    }
}

/// 环境标签压过调用点与 Span 环境标签。
#[test]
fn environment_labels_win_over_call_and_span_labels() {
    let fixture = TelemetryFixture::with_vars(vars(&[("METRICS_LABEL_REGION", "eu-1")]));
    {
        let span = fixture.telemetry.span("jobs", "run").start();
        span.set_label("region", "span-says");
        fixture.telemetry.counter(
            "jobs",
            "items",
            1.0,
            [("region".to_string(), "call-says".to_string())]
                .into_iter()
                .collect::<LabelSet>(),
        );
    }
    let points = fixture.expect_counter("jobs", "items");
    assert_eq!(
        points[0].0.get("region").map(String::as_str),
        Some("eu-1"),
        "环境标签的优先级最高"
    );
}

/// 环境标签写进 Span 本体：结束后的标签视图直接可见。
#[test]
fn environment_labels_are_stamped_on_span_labels() {
    let fixture = TelemetryFixture::with_vars(vars(&[("METRICS_LABEL_ENV", "staging")]));
    {
        let _span = fixture.telemetry.span("store", "fetch").start();
    }
    let spans = fixture.spans_named("store.fetch");
    assert_eq!(
        spans[0].labels().get("env").map(String::as_str),
        Some("staging"),
        "环境标签必须落在 Span 自身的标签视图上"
    );
}

/// 构造期标签与环境标签同名时，Span 上以环境值为准。
#[test]
fn environment_labels_override_builder_labels_on_span() {
    let fixture = TelemetryFixture::with_vars(vars(&[("METRICS_LABEL_REGION", "eu-1")]));
    {
        let span = fixture
            .telemetry
            .span("store", "fetch")
            .with_label("region", "span-says")
            .start();
        assert_eq!(span.labels().get("region").map(String::as_str), Some("eu-1"));
    }
}

/// 环境标签同样注入 Span 收尾指标。
#[test]
fn environment_labels_reach_span_duration_metrics() {
    let fixture = TelemetryFixture::with_vars(vars(&[("METRICS_LABEL_ENV", "staging")]));
    {
        let _span = fixture.telemetry.span("store", "fetch").start();
    }
    let durations = fixture.get_duration_recorder("store.fetch");
    assert_eq!(durations.len(), 1);
    assert_eq!(durations[0].labels.get("env").map(String::as_str), Some("staging"));
}

/// 周期导出线程把快照送进挂接的导出器。
#[test]
fn interval_flusher_feeds_attached_exporters() {
    let fixture = TelemetryFixture::with_vars(vars(&[("METRICS_INTERVAL", "1")]));
    fixture.telemetry.counter("jobs", "items", 3.0, LabelSet::new());
    fixture.telemetry.flush_metrics();
    let batch = fixture.metrics.last_batch();
    assert!(
        batch.iter().any(|r| r.category == "jobs" && r.name == "items"),
        "导出快照应包含已记录的仪表"
    );
}

/// 停机补一轮导出，之后导出器拒绝新批次。
#[test]
fn shutdown_flushes_once_and_closes_exporters() {
    let fixture = TelemetryFixture::new();
    fixture.telemetry.counter("jobs", "items", 2.0, LabelSet::new());
    fixture.telemetry.shutdown();
    let batch = fixture.metrics.last_batch();
    assert!(batch.iter().any(|r| r.category == "jobs" && r.name == "items"));
    assert_eq!(
        fixture.metrics.export(&[]),
        lumen_core::ExportResult::Failure,
        "关闭后的导出器必须拒绝新批次"
    );
}
