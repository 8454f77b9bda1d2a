//! Tracer：Span 的创建、继承、活跃栈与收尾导出。
//!
//! # 教案式导读
//! - **意图（Why）**：把 Span 生命周期的全部隐式约定（继承哪些键、谁注入
//!   身份、指标何时落账）集中在一处，调用方只见 RAII 句柄。
//! - **逻辑（How）**：
//!   1. 活跃栈是**显式的线程局部栈**：`start` 压栈，守卫析构弹栈并校验
//!      守卫与栈顶一致，跨线程乱序结束只告警不破坏不变量；
//!   2. 启动顺序：构造属性 → 祖先继承 → 身份戳记 → 环境注入 → 监听器
//!      `on_start` → 压栈并登记活跃表；
//!   3. 收尾顺序：弹栈 → 封口定状态 → 监听器 `on_end` → 落 `trace.duration`
//!      / `trace.errors` → 注销活跃表 → 同步交给 Span 导出器。
//! - **契约（What）**：继承只发生在启动时刻，沿当时的活跃栈自外向内合并，
//!   内层取值覆盖外层；身份键（trace_id、span_id 等）永不继承；环境属性
//!   最后写入、永远胜出。
//! - **风险（Trade-offs）**：Span 导出是同步调用，慢导出器会拖慢业务
//!   收尾路径；面向批量后台导出的缓冲不在此层。

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::attribute::AttributeValue;
use crate::context::{SpanContext, SpanId};
use crate::environment::EnvironmentConfig;
use crate::export::{ExportResult, SpanExporter};
use crate::keys;
use crate::listener::{guarded, SpanListener};
use crate::metrics::Metrics;
use crate::registry::AttributeRegistry;
use crate::span::{Span, SpanKind, SpanStatus};

thread_local! {
    /// 本线程的活跃 Span 栈，栈顶即“当前 Span”。
    static ACTIVE_STACK: RefCell<Vec<Span>> = const { RefCell::new(Vec::new()) };
}

pub(crate) struct TracerShared {
    pub(crate) registry: Arc<AttributeRegistry>,
    pub(crate) environment: Arc<ArcSwap<EnvironmentConfig>>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) listeners: RwLock<Vec<Arc<dyn SpanListener>>>,
    pub(crate) span_exporters: RwLock<Vec<Arc<dyn SpanExporter>>>,
    /// 进程内仍未结束的 Span，按 SpanId 登记。
    pub(crate) active_table: DashMap<SpanId, Span>,
}

/// Span 工厂与活跃栈的门面，克隆开销为一次 `Arc` 计数。
#[derive(Clone)]
pub struct Tracer {
    pub(crate) shared: Arc<TracerShared>,
}

impl Tracer {
    pub(crate) fn new(
        registry: Arc<AttributeRegistry>,
        environment: Arc<ArcSwap<EnvironmentConfig>>,
        metrics: Arc<Metrics>,
    ) -> Tracer {
        Tracer {
            shared: Arc::new(TracerShared {
                registry,
                environment,
                metrics,
                listeners: RwLock::new(Vec::new()),
                span_exporters: RwLock::new(Vec::new()),
                active_table: DashMap::new(),
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SpanListener>) {
        self.shared.listeners.write().push(listener);
    }

    pub fn add_span_exporter(&self, exporter: Arc<dyn SpanExporter>) {
        self.shared.span_exporters.write().push(exporter);
    }

    /// 开始构造一个 Span。
    pub fn span(&self, category: &str, name: &str) -> SpanBuilder {
        SpanBuilder {
            shared: self.shared.clone(),
            category: category.to_string(),
            name: name.to_string(),
            kind: SpanKind::Internal,
            attributes: Vec::new(),
            labels: Vec::new(),
            remote_parent: None,
        }
    }

    /// 在一个 Span 内运行闭包：`Err` 自动把状态置为 ERROR 并带上错误文本。
    pub fn in_span<T, E: fmt::Display>(
        &self,
        category: &str,
        name: &str,
        f: impl FnOnce(&Span) -> Result<T, E>,
    ) -> Result<T, E> {
        let guard = self.span(category, name).start();
        let outcome = f(guard.span());
        if let Err(error) = &outcome {
            guard.set_status(SpanStatus::Error, Some(&error.to_string()));
        }
        outcome
    }

    /// 本线程当前活跃的 Span（栈顶）。
    pub fn current_span(&self) -> Option<Span> {
        ACTIVE_STACK.with(|stack| stack.borrow().last().cloned())
    }

    pub fn has_active_span(&self) -> bool {
        ACTIVE_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// 给当前 Span 写属性；无活跃 Span 时静默忽略。
    pub fn set_attribute(&self, name: &str, value: impl Into<AttributeValue>) {
        if let Some(span) = self.current_span() {
            span.set_attribute(name, value);
        }
    }

    pub fn set_label(&self, name: &str, value: impl Into<AttributeValue>) {
        if let Some(span) = self.current_span() {
            span.set_label(name, value);
        }
    }

    pub fn add_event(&self, name: &str, attributes: impl IntoIterator<Item = (String, AttributeValue)>) {
        if let Some(span) = self.current_span() {
            span.add_event(name, attributes);
        }
    }

    /// 本线程的活跃 Span，自内向外排列。
    pub fn active_spans(&self) -> Vec<Span> {
        ACTIVE_STACK.with(|stack| stack.borrow().iter().rev().cloned().collect())
    }

    /// 全进程仍未结束的 Span 数，供排障观察。
    pub fn open_span_count(&self) -> usize {
        self.shared.active_table.len()
    }
}

/// 本线程当前活跃的 Span；日志层据此给日志行附上追踪属性。
pub(crate) fn current_active_span() -> Option<Span> {
    ACTIVE_STACK.with(|stack| stack.borrow().last().cloned())
}

/// 指标门面读取的环境标签：当前 Span 的标签去掉身份键。
pub(crate) fn ambient_labels() -> BTreeMap<String, String> {
    ACTIVE_STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .map(|span| {
                span.labels()
                    .into_iter()
                    .filter(|(name, _)| !keys::is_identity_key(name))
                    .collect()
            })
            .unwrap_or_default()
    })
}

/// Span 构造器：收集启动前的属性与标签。
pub struct SpanBuilder {
    shared: Arc<TracerShared>,
    category: String,
    name: String,
    kind: SpanKind,
    attributes: Vec<(String, AttributeValue)>,
    labels: Vec<(String, AttributeValue)>,
    remote_parent: Option<SpanContext>,
}

impl SpanBuilder {
    pub fn with_kind(mut self, kind: SpanKind) -> SpanBuilder {
        self.kind = kind;
        self
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<AttributeValue>) -> SpanBuilder {
        self.attributes.push((name.to_string(), value.into()));
        self
    }

    pub fn with_label(mut self, name: &str, value: impl Into<AttributeValue>) -> SpanBuilder {
        self.labels.push((name.to_string(), value.into()));
        self
    }

    /// 以远端恢复的上下文为父，用于跨进程续接 Trace。
    pub fn with_remote_parent(mut self, context: SpanContext) -> SpanBuilder {
        self.remote_parent = Some(context);
        self
    }

    /// 启动 Span：执行继承、戳记与注入，压入活跃栈并返回 RAII 守卫。
    pub fn start(self) -> SpanGuard {
        let shared = self.shared;
        let active_chain: Vec<Span> = ACTIVE_STACK.with(|stack| stack.borrow().clone());
        let parent = active_chain.last().cloned();

        let context = match (&parent, &self.remote_parent) {
            (Some(local), _) => SpanContext::child_of(local.context()),
            (None, Some(remote)) => SpanContext {
                trace_id: remote.trace_id,
                span_id: crate::context::SpanContext::generate().span_id,
                is_remote: false,
                trace_state: remote.trace_state.clone(),
            },
            (None, None) => SpanContext::generate(),
        };
        let is_remote_trace = parent.is_none() && self.remote_parent.is_some();

        let span = Span::new(
            self.name,
            self.category,
            self.kind,
            context,
            parent.as_ref(),
            shared.registry.clone(),
        );

        // 1. 构造期属性与标签。
        for (name, value) in self.attributes {
            span.set_attribute(&name, value);
        }
        for (name, value) in self.labels {
            span.set_label(&name, value);
        }

        // 2. 祖先继承：沿创建时刻的活跃栈自外向内走，内层取值覆盖外层。
        //    注册为传播的键照单全收；未注册键仅当祖先把它当作标签时随行，
        //    并在子级继续以标签身份记账。身份键永不继承。
        {
            let mut inherited = Vec::new();
            let mut inherited_labels = Vec::new();
            for ancestor in &active_chain {
                let ancestor_labels = ancestor.label_key_set();
                for (name, value) in ancestor.raw_attributes() {
                    if keys::is_identity_key(&name) || name == keys::attribute::LABEL_KEYS {
                        continue;
                    }
                    if shared.registry.is_registered(&name) {
                        if shared.registry.propagates(&name) {
                            inherited.push((name, value));
                        }
                    } else if ancestor_labels.contains(&name) {
                        inherited_labels.push(name.clone());
                        inherited.push((name, value));
                    }
                }
            }
            span.merge_attributes(inherited);
            span.adopt_label_keys(inherited_labels);
        }

        // 3. 身份戳记。
        span.merge_attributes([
            (
                keys::attribute::TRACE_ID.to_string(),
                AttributeValue::Text(span.context().trace_id.to_string()),
            ),
            (
                keys::attribute::TRACE_SPAN_ID.to_string(),
                AttributeValue::Text(span.context().span_id.to_string()),
            ),
            (
                keys::attribute::TRACE_IS_REMOTE.to_string(),
                AttributeValue::Bool(is_remote_trace),
            ),
            (
                keys::label::TRACE_CATEGORY.to_string(),
                AttributeValue::Text(span.category().to_string()),
            ),
            (
                keys::label::TRACE_NAME.to_string(),
                AttributeValue::Text(span.qname()),
            ),
        ]);

        // 4. 环境注入，属性与标签都写，永远胜出。
        let env = shared.environment.load();
        span.merge_attributes(
            env.attributes
                .iter()
                .map(|(name, value)| (name.clone(), AttributeValue::Text(value.clone()))),
        );
        for (name, value) in env.labels.iter() {
            span.set_label(name, value.clone());
        }

        // 5. 监听器 on_start。
        for listener in shared.listeners.read().iter() {
            guarded(&span, "on_start", || listener.on_start(&span));
        }

        // 6. 入栈并登记活跃表。
        ACTIVE_STACK.with(|stack| stack.borrow_mut().push(span.clone()));
        shared
            .active_table
            .insert(span.context().span_id, span.clone());

        SpanGuard {
            span,
            shared,
            finished: false,
        }
    }
}

/// Span 的 RAII 守卫：离开作用域即结束 Span。
///
/// 析构发生在 panic 展开中时，未定论的状态折算为 ERROR。
pub struct SpanGuard {
    span: Span,
    shared: Arc<TracerShared>,
    finished: bool,
}

impl SpanGuard {
    /// 提前显式结束。之后的析构是空操作。
    pub fn end(mut self) {
        self.finish(false);
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    fn finish(&mut self, panicking: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        // 弹栈：守卫必须与栈顶一致，否则说明结束顺序被打乱。
        // 日志层也会借用活跃栈，告警留到借用释放之后。
        let popped = ACTIVE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last() {
                Some(top) if Arc::ptr_eq(&top.inner, &self.span.inner) => {
                    stack.pop();
                    true
                }
                _ => false,
            }
        });
        if !popped {
            tracing::warn!(
                span = %self.span.qname(),
                "span ended out of stack order; active stack left untouched"
            );
        }

        self.span.finish(panicking);

        for listener in self.shared.listeners.read().iter() {
            guarded(&self.span, "on_end", || listener.on_end(&self.span));
        }

        let elapsed = self.span.elapsed_millis().unwrap_or(0);
        let errored = self.span.status() == SpanStatus::Error;
        self.shared
            .metrics
            .record_span_end(self.span.labels(), elapsed, errored);

        if self
            .shared
            .active_table
            .remove(&self.span.context().span_id)
            .is_none()
        {
            tracing::warn!(span = %self.span.qname(), "span missing from active table at end");
        }

        let exporters = self.shared.span_exporters.read().clone();
        for exporter in exporters {
            if exporter.export(std::slice::from_ref(&self.span)) == ExportResult::Failure {
                tracing::warn!(span = %self.span.qname(), "span exporter reported failure");
            }
        }
    }
}

impl std::ops::Deref for SpanGuard {
    type Target = Span;

    fn deref(&self) -> &Span {
        &self.span
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.finish(std::thread::panicking());
    }
}
