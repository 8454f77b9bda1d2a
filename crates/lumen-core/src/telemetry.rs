//! Telemetry：装配根与进程级门面。
//!
//! # 教案式导读
//! - **意图（Why）**：追踪、指标、环境配置与导出调度共用一棵对象树；
//!   依赖自上而下显式注入，全局入口只是对这棵树的一个可替换引用。
//! - **逻辑（How）**：`Telemetry` 是 `Arc` 化的装配体，克隆即共享；
//!   全局槽位用 `ArcSwapOption` 承载，安装/卸载在一把互斥锁下串行，
//!   读取方向无锁。作用域安装返回 RAII 守卫，析构时恢复前任。
//! - **契约（What)**：`install_global` 对已占用的槽位返回
//!   [`ConfigError::AlreadyInstalled`]；`shutdown` 幂等，停掉周期导出、
//!   补一轮采集并逐个关闭导出器。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::{Mutex, RwLock};

use crate::attribute::AttributeValue;
use crate::environment::EnvironmentConfig;
use crate::error::ConfigError;
use crate::export::console::{ConsoleMetricsExporter, ConsoleSpanExporter};
use crate::export::{ExportResult, IntervalFlusher, MetricsExporter, SpanExporter};
use crate::keys;
use crate::listener::SpanListener;
use crate::metrics::{LabelSet, Metrics, Observer};
use crate::span::Span;
use crate::tracer::{self, SpanBuilder, Tracer};
use crate::traced::TracedCall;

struct TelemetryInner {
    environment: Arc<ArcSwap<EnvironmentConfig>>,
    metrics: Arc<Metrics>,
    tracer: Tracer,
    metrics_exporters: RwLock<Vec<Arc<dyn MetricsExporter>>>,
    flusher: Mutex<Option<IntervalFlusher>>,
    shutdown_done: AtomicBool,
}

/// 进程遥测的装配体与门面。
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<TelemetryInner>,
}

impl Telemetry {
    /// 以给定环境快照装配一棵遥测树。众所周知的键在此登记。
    pub fn new(environment: EnvironmentConfig) -> Telemetry {
        let registry = Arc::new(crate::registry::AttributeRegistry::new());
        // 身份键不传播；强制标签键声明为标签。注册表是崭新的，登记不会撞键。
        for name in [
            keys::attribute::TRACE_ID,
            keys::attribute::TRACE_SPAN_ID,
            keys::attribute::TRACE_IS_REMOTE,
        ] {
            if let Err(error) = registry.register_attribute(name, false) {
                tracing::warn!(%error, "well-known key registration failed");
            }
        }
        for name in keys::label::FORCE_LABELS {
            if let Err(error) = registry.register_label(name, false) {
                tracing::warn!(%error, "well-known key registration failed");
            }
        }

        let environment = Arc::new(ArcSwap::from_pointee(environment));
        let metrics = Arc::new(Metrics::new(environment.clone()));
        let tracer = Tracer::new(registry, environment.clone(), metrics.clone());
        Telemetry {
            inner: Arc::new(TelemetryInner {
                environment,
                metrics,
                tracer,
                metrics_exporters: RwLock::new(Vec::new()),
                flusher: Mutex::new(None),
                shutdown_done: AtomicBool::new(false),
            }),
        }
    }

    /// 读取进程环境、装配并安装为全局实例：点名的导出器就地挂接，
    /// 周期导出随即启动。
    ///
    /// 核心内置 `console` 导出器；其余名字（如 `prometheus`）由伴生 crate
    /// 挂接，这里只提醒。全局槽位已被占用时降级为告警，装配体照常返回。
    pub fn initialize() -> Telemetry {
        let telemetry = Telemetry::new(EnvironmentConfig::from_env());
        let env = telemetry.inner.environment.load();
        for name in &env.exporters {
            if name.to_lowercase().contains("console") {
                telemetry.add_span_exporter(Arc::new(ConsoleSpanExporter::new()));
                telemetry.add_metrics_exporter(Arc::new(ConsoleMetricsExporter::new()));
            } else {
                tracing::warn!(exporter = %name, "exporter is not built in; attach it explicitly");
            }
        }
        if let Err(error) = telemetry.install_global() {
            tracing::warn!(%error, "global telemetry slot already occupied; instance not installed");
        }
        telemetry
    }

    pub fn environment(&self) -> Arc<EnvironmentConfig> {
        self.inner.environment.load_full()
    }

    /// 重新读取进程环境并原子替换配置快照。
    pub fn reload_environment(&self) {
        self.inner
            .environment
            .store(Arc::new(EnvironmentConfig::from_env()));
    }

    pub fn tracer(&self) -> &Tracer {
        &self.inner.tracer
    }

    /// 声明一个属性键。键名与传播语义在此集中登记。
    pub fn register_attribute(&self, name: &str, propagate: bool) -> Result<(), ConfigError> {
        self.inner.tracer.shared.registry.register_attribute(name, propagate)
    }

    /// 声明一个标签键。
    pub fn register_label(&self, name: &str, propagate: bool) -> Result<(), ConfigError> {
        self.inner.tracer.shared.registry.register_label(name, propagate)
    }

    pub fn add_listener(&self, listener: Arc<dyn SpanListener>) {
        self.inner.tracer.add_listener(listener);
    }

    pub fn add_span_exporter(&self, exporter: Arc<dyn SpanExporter>) {
        self.inner.tracer.add_span_exporter(exporter);
    }

    /// 挂接一个指标导出器。首个导出器就位时启动周期导出线程。
    pub fn add_metrics_exporter(&self, exporter: Arc<dyn MetricsExporter>) {
        self.inner.metrics_exporters.write().push(exporter);
        let mut flusher = self.inner.flusher.lock();
        if flusher.is_none() {
            let interval = self.inner.environment.load().interval;
            // 弱引用打断 装配体 -> 调度线程 -> 装配体 的引用环。
            let weak = Arc::downgrade(&self.inner);
            *flusher = Some(IntervalFlusher::start(interval, move || {
                if let Some(inner) = weak.upgrade() {
                    Telemetry { inner }.flush_metrics();
                }
            }));
        }
    }

    /// 立即采集一轮指标并交给全部指标导出器。
    pub fn flush_metrics(&self) {
        let records = self.inner.metrics.collect();
        let exporters = self.inner.metrics_exporters.read().clone();
        for exporter in exporters {
            if exporter.export(&records) == ExportResult::Failure {
                tracing::warn!("metrics exporter reported failure");
            }
        }
    }

    // ---- Span 门面 ----

    pub fn span(&self, category: &str, name: &str) -> SpanBuilder {
        self.inner.tracer.span(category, name)
    }

    pub fn in_span<T, E: std::fmt::Display>(
        &self,
        category: &str,
        name: &str,
        f: impl FnOnce(&Span) -> Result<T, E>,
    ) -> Result<T, E> {
        self.inner.tracer.in_span(category, name, f)
    }

    pub fn current_span(&self) -> Option<Span> {
        self.inner.tracer.current_span()
    }

    // ---- 指标门面：自动并入当前 Span 的环境标签 ----

    fn effective_labels(labels: LabelSet) -> LabelSet {
        let mut merged = tracer::ambient_labels();
        for (key, value) in labels {
            merged.insert(key, value);
        }
        merged
    }

    pub fn counter(&self, category: &str, name: &str, value: f64, labels: LabelSet) {
        self.inner
            .metrics
            .add_counter(category, name, value, Self::effective_labels(labels), None, None);
    }

    pub fn up_down_counter(&self, category: &str, name: &str, value: f64, labels: LabelSet) {
        self.inner.metrics.add_up_down_counter(
            category,
            name,
            value,
            Self::effective_labels(labels),
            None,
            None,
        );
    }

    pub fn record_value(&self, category: &str, name: &str, value: f64, labels: LabelSet) {
        self.inner
            .metrics
            .record_value(category, name, value, Self::effective_labels(labels), None, None);
    }

    pub fn gauge(
        &self,
        category: &str,
        name: &str,
        callback: impl Fn(&mut Observer<'_>) + Send + Sync + 'static,
    ) {
        self.inner.metrics.register_gauge(category, name, None, None, callback);
    }

    /// 绑定一个类目，省去调用点重复书写类目名。
    pub fn category(&self, category: &str) -> CategoryHandle {
        CategoryHandle {
            telemetry: self.clone(),
            category: category.to_string(),
        }
    }

    /// 采集一轮当前聚合快照（不触发导出）。
    pub fn collect(&self) -> Vec<crate::metrics::MetricRecord> {
        self.inner.metrics.collect()
    }

    /// 有序停机：停调度线程（内含最后一轮导出），再关闭全部导出器。幂等。
    pub fn shutdown(&self) {
        if self.inner.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(flusher) = self.inner.flusher.lock().take() {
            flusher.stop();
        }
        for exporter in self.inner.metrics_exporters.read().iter() {
            exporter.shutdown();
        }
        for exporter in self.inner.tracer.shared.span_exporters.read().iter() {
            exporter.shutdown();
        }
    }

    // ---- 全局槽位 ----

    /// 安装为全局入口。槽位已被占用时报错，绝不静默顶替。
    pub fn install_global(&self) -> Result<(), ConfigError> {
        let _guard = INSTALL_LOCK.lock();
        if GLOBAL.load().is_some() {
            return Err(ConfigError::AlreadyInstalled);
        }
        GLOBAL.store(Some(self.inner.clone()));
        Ok(())
    }

    /// 作用域安装：替换全局槽位，守卫析构时恢复前任。测试与嵌入场景专用。
    pub fn install_scoped(&self) -> ScopedTelemetry {
        let guard = INSTALL_LOCK.lock();
        let previous = GLOBAL.swap(Some(self.inner.clone()));
        drop(guard);
        ScopedTelemetry { previous }
    }

    /// 当前全局遥测实例。
    pub fn global() -> Option<Telemetry> {
        GLOBAL.load_full().map(|inner| Telemetry { inner })
    }
}

static GLOBAL: ArcSwapOption<TelemetryInner> = ArcSwapOption::const_empty();
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// 作用域安装的恢复守卫。
pub struct ScopedTelemetry {
    previous: Option<Arc<TelemetryInner>>,
}

impl Drop for ScopedTelemetry {
    fn drop(&mut self) {
        let _guard = INSTALL_LOCK.lock();
        GLOBAL.store(self.previous.take());
    }
}

/// 绑定了类目的便捷句柄。
#[derive(Clone)]
pub struct CategoryHandle {
    telemetry: Telemetry,
    category: String,
}

impl CategoryHandle {
    pub fn name(&self) -> &str {
        &self.category
    }

    pub fn span(&self, name: &str) -> SpanBuilder {
        self.telemetry.span(&self.category, name)
    }

    pub fn in_span<T, E: std::fmt::Display>(
        &self,
        name: &str,
        f: impl FnOnce(&Span) -> Result<T, E>,
    ) -> Result<T, E> {
        self.telemetry.in_span(&self.category, name, f)
    }

    pub fn counter(&self, name: &str, value: f64, labels: LabelSet) {
        self.telemetry.counter(&self.category, name, value, labels);
    }

    pub fn up_down_counter(&self, name: &str, value: f64, labels: LabelSet) {
        self.telemetry.up_down_counter(&self.category, name, value, labels);
    }

    pub fn record_value(&self, name: &str, value: f64, labels: LabelSet) {
        self.telemetry.record_value(&self.category, name, value, labels);
    }

    pub fn gauge(&self, name: &str, callback: impl Fn(&mut Observer<'_>) + Send + Sync + 'static) {
        self.telemetry.gauge(&self.category, name, callback);
    }

    /// 以本类目起一个带提取计划的调用包装。
    pub fn traced(&self, name: &str) -> TracedCall {
        TracedCall::new(self.category.clone(), name)
    }
}

/// 便捷入口：给当前全局实例的当前 Span 写属性；无实例或无 Span 时忽略。
pub fn set_attribute(name: &str, value: impl Into<AttributeValue>) {
    if let Some(telemetry) = Telemetry::global() {
        telemetry.tracer().set_attribute(name, value);
    }
}

/// 便捷入口：给当前全局实例的当前 Span 写标签。
pub fn set_label(name: &str, value: impl Into<AttributeValue>) {
    if let Some(telemetry) = Telemetry::global() {
        telemetry.tracer().set_label(name, value);
    }
}
