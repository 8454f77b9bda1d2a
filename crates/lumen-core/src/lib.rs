//! lumen-core：Span 生命周期、属性传播与进程内指标聚合的核心实现。
//!
//! # 教案式导读
//! - **意图（Why）**：一次业务操作同时产出三种遥测信号——Span、指标点、
//!   日志行。本 crate 让三者共享同一套属性裁决：注册表声明键的语义，
//!   活跃栈裁决“当前操作是谁”，导出面把快照送出进程。
//! - **分层（How）**：
//!   - `registry` / `attribute`：键语义与值模型；
//!   - `span` / `tracer`：Span 实体、继承规则与显式线程局部活跃栈；
//!   - `metrics` / `environment`：进程内聚合与环境变量配置；
//!   - `export` / `logging`：导出 trait、周期调度与 JSON 日志层；
//!   - `telemetry`：装配根、全局槽位与类目句柄。
//! - **契约（What）**：遥测路径绝不向业务调用方抛错——一切降级为
//!   `tracing` 告警；属性键名、标签值类型、仪表种别的违例都在边界处
//!   被拦下并丢弃。

pub mod attribute;
pub mod context;
pub mod environment;
pub mod error;
pub mod export;
pub mod keys;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod span;
pub mod telemetry;
pub mod traced;
pub mod tracer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use attribute::AttributeValue;
pub use context::{SpanContext, SpanId, TraceId};
pub use environment::EnvironmentConfig;
pub use error::ConfigError;
pub use export::{ExportResult, MetricsExporter, SpanExporter};
pub use listener::{CategoryScoped, SpanListener};
pub use logging::{install_json_logging, JsonLogCapture, JsonLogLayer};
pub use metrics::{AggregationSnapshot, InstrumentKind, LabelSet, MetricRecord, Observer};
pub use registry::{AttributeKey, AttributeRegistry};
pub use span::{Span, SpanEvent, SpanKind, SpanStatus};
pub use telemetry::{set_attribute, set_label, CategoryHandle, ScopedTelemetry, Telemetry};
pub use traced::{ArgumentSet, AttributeTarget, TracedCall};
pub use tracer::{SpanBuilder, SpanGuard, Tracer};
