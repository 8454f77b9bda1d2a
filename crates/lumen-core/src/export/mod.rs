//! 导出面：Span 与指标离开进程的唯一通道。
//!
//! # 教案式导读
//! - **意图（Why）**：管线与外设解耦。核心只依赖两个窄 trait，具体去向
//!   （控制台、内存、Prometheus 文本）由装配方注入。
//! - **契约（What）**：导出失败以 [`ExportResult::Failure`] 返回并由调用方
//!   记录 WARN，绝不向业务路径抛错；`shutdown` 之后的导出必须失败。

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::metrics::MetricRecord;
use crate::span::Span;

pub mod console;
pub mod memory;

/// 一次导出的结果。失败不重试，由周期调度自然覆盖。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportResult {
    Success,
    Failure,
}

/// Span 导出器。Span 结束时同步收到该 Span 的最终快照。
pub trait SpanExporter: Send + Sync {
    fn export(&self, spans: &[Span]) -> ExportResult;
    fn shutdown(&self) {}
}

/// 指标导出器。每个导出周期收到一次完整采集快照。
pub trait MetricsExporter: Send + Sync {
    fn export(&self, records: &[MetricRecord]) -> ExportResult;
    fn shutdown(&self) {}
}

struct FlusherShared {
    stop: Mutex<bool>,
    signal: Condvar,
}

/// 周期导出调度器：后台线程按固定间隔驱动一次指标采集与导出。
///
/// # 逻辑（How）
/// `Condvar::wait_for` 在间隔与停机信号之间二选一；停机时先唤醒线程，
/// 线程做最后一轮导出后退出，`shutdown` 随后 join。
pub(crate) struct IntervalFlusher {
    shared: Arc<FlusherShared>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl IntervalFlusher {
    pub(crate) fn start(
        interval: std::time::Duration,
        tick: impl Fn() + Send + 'static,
    ) -> IntervalFlusher {
        let shared = Arc::new(FlusherShared {
            stop: Mutex::new(false),
            signal: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("lumen-metrics-flusher".to_string())
            .spawn(move || loop {
                {
                    let mut stop = thread_shared.stop.lock();
                    if !*stop {
                        thread_shared.signal.wait_for(&mut stop, interval);
                    }
                    if *stop {
                        tick();
                        return;
                    }
                }
                tick();
            })
            .ok();
        if handle.is_none() {
            tracing::warn!("failed to spawn metrics flusher thread; periodic export disabled");
        }
        IntervalFlusher {
            shared,
            handle: Mutex::new(handle),
        }
    }

    /// 停止调度并等待最后一轮导出完成。幂等。
    pub(crate) fn stop(&self) {
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
        }
        self.shared.signal.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("metrics flusher thread panicked during shutdown");
            }
        }
    }
}
