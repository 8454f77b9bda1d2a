//! 控制台导出器：把 Span 与指标以行文本写入任意 `Write` 汇（缺省标准输出）。
//!
//! # 风险提示（Trade-offs）
//! - 写汇由一把 `Mutex` 串行化，高频导出下存在锁竞争；该导出器面向
//!   调试场景，不做缓冲优化。

use std::io::Write;

use parking_lot::Mutex;
use serde::Serialize;

use crate::export::{ExportResult, MetricsExporter, SpanExporter};
use crate::metrics::{AggregationSnapshot, MetricRecord};
use crate::span::Span;

type Sink = Mutex<Box<dyn Write + Send>>;

fn stdout_sink() -> Sink {
    Mutex::new(Box::new(std::io::stdout()))
}

#[derive(Serialize)]
struct SpanLine<'a> {
    span: String,
    trace_id: String,
    span_id: String,
    kind: &'a str,
    status: &'a str,
    elapsed_ms: Option<u64>,
    attributes: std::collections::BTreeMap<String, crate::attribute::AttributeValue>,
    labels: std::collections::BTreeMap<String, String>,
}

/// 每个结束的 Span 输出一行 JSON。
pub struct ConsoleSpanExporter {
    sink: Sink,
}

impl ConsoleSpanExporter {
    pub fn new() -> ConsoleSpanExporter {
        ConsoleSpanExporter { sink: stdout_sink() }
    }

    /// 注入自定义写汇，测试据此断言输出内容。
    pub fn with_sink(sink: Box<dyn Write + Send>) -> ConsoleSpanExporter {
        ConsoleSpanExporter { sink: Mutex::new(sink) }
    }
}

impl Default for ConsoleSpanExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanExporter for ConsoleSpanExporter {
    fn export(&self, spans: &[Span]) -> ExportResult {
        let mut sink = self.sink.lock();
        for span in spans {
            let line = SpanLine {
                span: span.qname(),
                trace_id: span.context().trace_id.to_string(),
                span_id: span.context().span_id.to_string(),
                kind: span.kind().as_str(),
                status: span.status().as_str(),
                elapsed_ms: span.elapsed_millis(),
                attributes: span.attributes(),
                labels: span.labels(),
            };
            let rendered = match serde_json::to_string(&line) {
                Ok(rendered) => rendered,
                Err(error) => {
                    tracing::warn!(%error, "failed to render span line");
                    return ExportResult::Failure;
                }
            };
            if writeln!(sink, "{rendered}").is_err() {
                return ExportResult::Failure;
            }
        }
        ExportResult::Success
    }
}

/// 每个指标点输出一行 `qname{labels} = value`。
pub struct ConsoleMetricsExporter {
    sink: Sink,
}

impl ConsoleMetricsExporter {
    pub fn new() -> ConsoleMetricsExporter {
        ConsoleMetricsExporter { sink: stdout_sink() }
    }

    pub fn with_sink(sink: Box<dyn Write + Send>) -> ConsoleMetricsExporter {
        ConsoleMetricsExporter { sink: Mutex::new(sink) }
    }
}

impl Default for ConsoleMetricsExporter {
    fn default() -> Self {
        Self::new()
    }
}

fn render_labels(record: &MetricRecord) -> String {
    if record.labels.is_empty() {
        return String::new();
    }
    let inner: Vec<String> = record
        .labels
        .iter()
        .map(|(key, value)| format!("{key}={value:?}"))
        .collect();
    format!("{{{}}}", inner.join(","))
}

impl MetricsExporter for ConsoleMetricsExporter {
    fn export(&self, records: &[MetricRecord]) -> ExportResult {
        let mut sink = self.sink.lock();
        for record in records {
            let rendered = match &record.aggregation {
                AggregationSnapshot::Sum(total) => format!(
                    "{}{} = {total}",
                    record.qname(),
                    render_labels(record)
                ),
                AggregationSnapshot::Distribution { min, max, sum, count, .. } => format!(
                    "{}{} = count={count} sum={sum} min={min} max={max}",
                    record.qname(),
                    render_labels(record)
                ),
            };
            if writeln!(sink, "{rendered}").is_err() {
                return ExportResult::Failure;
            }
        }
        ExportResult::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InstrumentKind;
    use std::sync::Arc;

    /// 线程安全的字符串写汇。
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn metric_lines_render_labels_and_values() {
        let buffer = SharedBuffer::default();
        let exporter = ConsoleMetricsExporter::with_sink(Box::new(buffer.clone()));
        let record = MetricRecord {
            category: "jobs".into(),
            name: "done".into(),
            kind: InstrumentKind::Counter,
            unit: None,
            description: None,
            labels: [("queue".to_string(), "a".to_string())].into_iter().collect(),
            aggregation: AggregationSnapshot::Sum(3.0),
        };
        assert_eq!(exporter.export(&[record]), ExportResult::Success);
        let output = String::from_utf8(buffer.0.lock().clone()).unwrap();
        assert_eq!(output, "jobs.done{queue=\"a\"} = 3\n");
    }
}
