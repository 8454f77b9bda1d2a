//! 测试夹具：内存导出器 + 受控环境 + 断言辅助。
//!
//! 仅在 `test-util` 特性下编译，产物不进入发布面。

use std::sync::Arc;

use crate::environment::EnvironmentConfig;
use crate::export::memory::{InMemoryMetricsExporter, InMemorySpanExporter};
use crate::metrics::{AggregationSnapshot, InstrumentKind, LabelSet, MetricRecord};
use crate::span::Span;
use crate::telemetry::{ScopedTelemetry, Telemetry};
use crate::{keys, logging};

/// 一个值记录器在单个标签集下的分布摘要。
#[derive(Clone, Debug, PartialEq)]
pub struct DistributionInfo {
    pub labels: LabelSet,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
    pub last: f64,
}

/// 测试夹具：装配一棵带内存导出器与日志捕获的遥测树。
pub struct TelemetryFixture {
    pub telemetry: Telemetry,
    pub spans: Arc<InMemorySpanExporter>,
    pub metrics: Arc<InMemoryMetricsExporter>,
    pub logs: logging::JsonLogCapture,
    pub log_layer: Option<logging::JsonLogLayer>,
}

impl TelemetryFixture {
    /// 空环境夹具。
    pub fn new() -> TelemetryFixture {
        TelemetryFixture::with_vars(Vec::<(String, String)>::new())
    }

    /// 以受控的“环境变量”装配夹具，真实进程环境不参与。
    pub fn with_vars(vars: impl IntoIterator<Item = (String, String)>) -> TelemetryFixture {
        let telemetry = Telemetry::new(EnvironmentConfig::from_iter(vars));
        let spans = Arc::new(InMemorySpanExporter::new());
        telemetry.add_span_exporter(spans.clone());
        let metrics = Arc::new(InMemoryMetricsExporter::new());
        telemetry.add_metrics_exporter(metrics.clone());
        let (log_layer, logs) = logging::JsonLogLayer::capturing();
        TelemetryFixture {
            telemetry,
            spans,
            metrics,
            logs,
            log_layer: Some(log_layer),
        }
    }

    /// 安装为全局实例，返回作用域守卫。
    pub fn install(&self) -> ScopedTelemetry {
        self.telemetry.install_scoped()
    }

    /// 当前聚合快照（不经过导出器）。
    pub fn records(&self) -> Vec<MetricRecord> {
        self.telemetry.collect()
    }

    fn records_of(&self, category: &str, name: &str, kind: InstrumentKind) -> Vec<MetricRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.category == category && r.name == name && r.kind == kind)
            .collect()
    }

    /// 某计数器在各标签集下的总和。
    pub fn get_counter(&self, category: &str, name: &str) -> Vec<(LabelSet, f64)> {
        self.records_of(category, name, InstrumentKind::Counter)
            .into_iter()
            .filter_map(|r| match r.aggregation {
                AggregationSnapshot::Sum(total) => Some((r.labels, total)),
                _ => None,
            })
            .collect()
    }

    /// 计数器跨标签集的合计；仪表不存在时返回 `None`。
    pub fn counter_total(&self, category: &str, name: &str) -> Option<f64> {
        let points = self.get_counter(category, name);
        if points.is_empty() {
            None
        } else {
            Some(points.iter().map(|(_, v)| v).sum())
        }
    }

    /// 不存在即 panic 的计数器查询，报错时列出现有仪表名。
    pub fn expect_counter(&self, category: &str, name: &str) -> Vec<(LabelSet, f64)> {
        let points = self.get_counter(category, name);
        if points.is_empty() {
            panic!(
                "没有计数器 {category}.{name}；现有仪表：{:?}",
                self.instrument_names()
            );
        }
        points
    }

    pub fn get_up_down_counter(&self, category: &str, name: &str) -> Vec<(LabelSet, f64)> {
        self.records_of(category, name, InstrumentKind::UpDownCounter)
            .into_iter()
            .filter_map(|r| match r.aggregation {
                AggregationSnapshot::Sum(total) => Some((r.labels, total)),
                _ => None,
            })
            .collect()
    }

    pub fn get_value_recorder(&self, category: &str, name: &str) -> Vec<DistributionInfo> {
        self.records_of(category, name, InstrumentKind::ValueRecorder)
            .into_iter()
            .filter_map(|r| match r.aggregation {
                AggregationSnapshot::Distribution { min, max, sum, count, last } => {
                    Some(DistributionInfo { labels: r.labels, min, max, sum, count, last })
                }
                _ => None,
            })
            .collect()
    }

    /// 某个 Span 全限定名对应的耗时分布（`trace.duration` 按 `span` 标签过滤）。
    pub fn get_duration_recorder(&self, qname: &str) -> Vec<DistributionInfo> {
        self.get_value_recorder(keys::metric::TRACE_CATEGORY, keys::metric::DURATION)
            .into_iter()
            .filter(|info| info.labels.get(keys::label::TRACE_NAME).map(String::as_str) == Some(qname))
            .collect()
    }

    pub fn get_gauge(&self, category: &str, name: &str) -> Vec<(LabelSet, f64)> {
        self.records_of(category, name, InstrumentKind::Observer)
            .into_iter()
            .filter_map(|r| match r.aggregation {
                AggregationSnapshot::Sum(value) => Some((r.labels, value)),
                _ => None,
            })
            .collect()
    }

    fn instrument_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records().iter().map(MetricRecord::qname).collect();
        names.dedup();
        names
    }

    /// 已结束并导出的 Span。
    pub fn finished_spans(&self) -> Vec<Span> {
        self.spans.get_finished_spans()
    }

    /// 按全限定名过滤已结束的 Span。
    pub fn spans_named(&self, qname: &str) -> Vec<Span> {
        self.finished_spans()
            .into_iter()
            .filter(|span| span.qname() == qname)
            .collect()
    }
}

impl Default for TelemetryFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TelemetryFixture {
    fn drop(&mut self) {
        self.telemetry.shutdown();
    }
}
