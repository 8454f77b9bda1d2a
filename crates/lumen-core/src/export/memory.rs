//! 内存导出器：测试与调试专用的收集终点。

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::export::{ExportResult, MetricsExporter, SpanExporter};
use crate::metrics::MetricRecord;
use crate::span::Span;

/// 把结束的 Span 追加进内存缓冲。
///
/// # 契约说明（What）
/// - `shutdown` 之后导出返回 [`ExportResult::Failure`]，缓冲保留可读；
/// - `get_finished_spans` 返回克隆快照，调用方可自由断言。
#[derive(Default)]
pub struct InMemorySpanExporter {
    spans: Mutex<Vec<Span>>,
    stopped: AtomicBool,
}

impl InMemorySpanExporter {
    pub fn new() -> InMemorySpanExporter {
        InMemorySpanExporter::default()
    }

    pub fn get_finished_spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }

    pub fn clear(&self) {
        self.spans.lock().clear();
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&self, spans: &[Span]) -> ExportResult {
        if self.stopped.load(Ordering::SeqCst) {
            return ExportResult::Failure;
        }
        self.spans.lock().extend_from_slice(spans);
        ExportResult::Success
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// 保留最近一批指标快照；每次导出整体替换。
#[derive(Default)]
pub struct InMemoryMetricsExporter {
    last_batch: Mutex<Vec<MetricRecord>>,
    stopped: AtomicBool,
}

impl InMemoryMetricsExporter {
    pub fn new() -> InMemoryMetricsExporter {
        InMemoryMetricsExporter::default()
    }

    /// 最近一次导出的完整快照。
    pub fn last_batch(&self) -> Vec<MetricRecord> {
        self.last_batch.lock().clone()
    }

    pub fn clear(&self) {
        self.last_batch.lock().clear();
    }
}

impl MetricsExporter for InMemoryMetricsExporter {
    fn export(&self, records: &[MetricRecord]) -> ExportResult {
        if self.stopped.load(Ordering::SeqCst) {
            return ExportResult::Failure;
        }
        *self.last_batch.lock() = records.to_vec();
        ExportResult::Success
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_exporter_rejects_after_shutdown() {
        let exporter = InMemorySpanExporter::new();
        assert_eq!(exporter.export(&[]), ExportResult::Success);
        exporter.shutdown();
        assert_eq!(exporter.export(&[]), ExportResult::Failure);
    }

    #[test]
    fn metrics_exporter_keeps_only_last_batch() {
        let exporter = InMemoryMetricsExporter::new();
        exporter.export(&[]);
        assert!(exporter.last_batch().is_empty());
    }
}
