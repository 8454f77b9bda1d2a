//! Span：一次有始有终的操作记录。
//!
//! # 教案式导读
//! - **意图（Why）**：Span 同时承担两份职责——为追踪导出记录属性与事件，
//!   为指标管线提供标签集。两份职责共用一套属性表，由注册表与本地标签键
//!   集合裁决哪些键以标签身份对外。
//! - **逻辑（How）**：`Span` 是 `Arc<SpanInner>` 的薄封装，克隆即共享；
//!   可变状态集中在一把 `RwLock<SpanState>` 之下，锁粒度为单个 Span，
//!   跨 Span 无共享锁。
//! - **契约（What）**：属性写入遵循键名模式校验（违例 WARN 并跳过）；
//!   `set_label` 额外要求文本值；下划线开头的键对 `attributes()` 视图不可见。
//! - **风险（Trade-offs）**：父指针使用 `Weak`，父 Span 结束并释放后
//!   子 Span 无法再回溯；继承发生在子 Span 启动时，之后互不影响。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use crate::attribute::{validate_attribute_name, AttributeValue};
use crate::context::SpanContext;
use crate::keys;
use crate::registry::AttributeRegistry;

/// Span 的角色分类，沿用 OpenTelemetry 的五分法。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanKind {
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Internal => "internal",
            SpanKind::Server => "server",
            SpanKind::Client => "client",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
        }
    }
}

/// Span 的结束状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanStatus {
    /// 尚未定论；结束时若仍为 Unset 则折算为 Ok。
    Unset,
    Ok,
    Error,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Unset => "UNSET",
            SpanStatus::Ok => "OK",
            SpanStatus::Error => "ERROR",
        }
    }
}

/// Span 内记录的时点事件。
#[derive(Clone, Debug)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp_nanos: u64,
    pub attributes: BTreeMap<String, AttributeValue>,
}

pub(crate) struct SpanState {
    pub(crate) attributes: BTreeMap<String, AttributeValue>,
    /// 本 Span 本地声明（含继承）的标签键，镜像到 `_label_keys` 属性。
    pub(crate) label_keys: BTreeSet<String>,
    pub(crate) events: Vec<SpanEvent>,
    pub(crate) status: SpanStatus,
    pub(crate) status_message: Option<String>,
    pub(crate) start_nanos: u64,
    pub(crate) end_nanos: Option<u64>,
}

pub(crate) struct SpanInner {
    pub(crate) name: String,
    pub(crate) category: String,
    pub(crate) kind: SpanKind,
    pub(crate) context: SpanContext,
    pub(crate) parent: Option<Weak<SpanInner>>,
    pub(crate) registry: Arc<AttributeRegistry>,
    pub(crate) state: RwLock<SpanState>,
}

/// 对外的 Span 句柄，克隆共享同一实体。
#[derive(Clone)]
pub struct Span {
    pub(crate) inner: Arc<SpanInner>,
}

pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl Span {
    pub(crate) fn new(
        name: String,
        category: String,
        kind: SpanKind,
        context: SpanContext,
        parent: Option<&Span>,
        registry: Arc<AttributeRegistry>,
    ) -> Span {
        Span {
            inner: Arc::new(SpanInner {
                name,
                category,
                kind,
                context,
                parent: parent.map(|p| Arc::downgrade(&p.inner)),
                registry,
                state: RwLock::new(SpanState {
                    attributes: BTreeMap::new(),
                    label_keys: BTreeSet::new(),
                    events: Vec::new(),
                    status: SpanStatus::Unset,
                    status_message: None,
                    start_nanos: now_nanos(),
                    end_nanos: None,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn category(&self) -> &str {
        &self.inner.category
    }

    /// 完整限定名 `category.name`，同时作为强制标签 `span` 的取值。
    pub fn qname(&self) -> String {
        format!("{}.{}", self.inner.category, self.inner.name)
    }

    pub fn kind(&self) -> SpanKind {
        self.inner.kind
    }

    pub fn context(&self) -> &SpanContext {
        &self.inner.context
    }

    pub fn parent(&self) -> Option<Span> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Span { inner })
    }

    pub fn is_recording(&self) -> bool {
        self.inner.state.read().end_nanos.is_none()
    }

    pub fn status(&self) -> SpanStatus {
        self.inner.state.read().status
    }

    pub fn status_message(&self) -> Option<String> {
        self.inner.state.read().status_message.clone()
    }

    /// 写入一个属性。键名违例时 WARN 并放弃本次写入。返回自身以便链式书写。
    pub fn set_attribute(&self, name: &str, value: impl Into<AttributeValue>) -> &Self {
        if !validate_attribute_name(name) {
            return self;
        }
        let mut state = self.inner.state.write();
        state.attributes.insert(name.to_string(), value.into());
        self
    }

    /// `Option` 版写入：`None` 不产生属性，省去调用方的分支。
    pub fn set_attribute_opt(&self, name: &str, value: Option<impl Into<AttributeValue>>) -> &Self {
        if let Some(value) = value {
            self.set_attribute(name, value);
        }
        self
    }

    /// 写入一个临时标签：值必须是文本，且该键在本 Span（及其后代）内
    /// 以标签身份参与指标导出。
    pub fn set_label(&self, name: &str, value: impl Into<AttributeValue>) -> &Self {
        if !validate_attribute_name(name) {
            return self;
        }
        let value = value.into();
        let text = match value {
            AttributeValue::Text(text) => text,
            other => {
                tracing::warn!(name, value = %other, "label values must be text; value skipped");
                return self;
            }
        };
        let mut state = self.inner.state.write();
        state.attributes.insert(name.to_string(), AttributeValue::Text(text));
        state.label_keys.insert(name.to_string());
        sync_label_keys(&mut state);
        self
    }

    /// 记录一个时点事件。
    pub fn add_event(&self, name: &str, attributes: impl IntoIterator<Item = (String, AttributeValue)>) {
        let mut state = self.inner.state.write();
        if state.end_nanos.is_some() {
            // 日志层会回读活跃 Span 的状态，告警必须在锁外发出。
            drop(state);
            tracing::warn!(span = %self.qname(), event = name, "event added after span end; dropped");
            return;
        }
        state.events.push(SpanEvent {
            name: name.to_string(),
            timestamp_nanos: now_nanos(),
            attributes: attributes.into_iter().collect(),
        });
    }

    pub fn set_status(&self, status: SpanStatus, message: Option<&str>) {
        let mut state = self.inner.state.write();
        state.status = status;
        state.status_message = message.map(str::to_string);
    }

    /// 对外属性视图：滤除下划线开头的内部键。
    pub fn attributes(&self) -> BTreeMap<String, AttributeValue> {
        self.inner
            .state
            .read()
            .attributes
            .iter()
            .filter(|(name, _)| !name.starts_with(keys::INTERNAL_PREFIX))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// 含内部键的完整属性快照，仅供导出器与继承逻辑使用。
    pub(crate) fn raw_attributes(&self) -> BTreeMap<String, AttributeValue> {
        self.inner.state.read().attributes.clone()
    }

    pub(crate) fn label_key_set(&self) -> BTreeSet<String> {
        self.inner.state.read().label_keys.clone()
    }

    /// 指标标签视图：本地标签键 ∪ 注册表标签键 ∪ 强制标签，投影到属性表上，
    /// 且只保留文本值。
    pub fn labels(&self) -> BTreeMap<String, String> {
        let state = self.inner.state.read();
        let registry = &self.inner.registry;
        state
            .attributes
            .iter()
            .filter(|(name, _)| {
                state.label_keys.contains(name.as_str())
                    || registry.is_label(name)
                    || keys::label::FORCE_LABELS.contains(&name.as_str())
            })
            .filter_map(|(name, value)| value.as_text().map(|text| (name.clone(), text.to_string())))
            .collect()
    }

    pub fn events(&self) -> Vec<SpanEvent> {
        self.inner.state.read().events.clone()
    }

    pub fn start_nanos(&self) -> u64 {
        self.inner.state.read().start_nanos
    }

    pub fn end_nanos(&self) -> Option<u64> {
        self.inner.state.read().end_nanos
    }

    /// 已结束 Span 的耗时，毫秒向零截断。未结束返回 `None`。
    pub fn elapsed_millis(&self) -> Option<u64> {
        let state = self.inner.state.read();
        state
            .end_nanos
            .map(|end| end.saturating_sub(state.start_nanos) / 1_000_000)
    }

    /// 封口：记录结束时间并裁决最终状态。重复结束仅 WARN，一切字段以
    /// 首次结束为准。
    pub(crate) fn finish(&self, panicking: bool) {
        let mut state = self.inner.state.write();
        if state.end_nanos.is_some() {
            drop(state);
            tracing::warn!(span = %self.qname(), "span ended twice; second end ignored");
            return;
        }
        state.end_nanos = Some(now_nanos());
        if state.status == SpanStatus::Unset {
            state.status = if panicking { SpanStatus::Error } else { SpanStatus::Ok };
        }
        let status = state.status;
        state
            .attributes
            .insert(keys::label::TRACE_STATUS.to_string(), AttributeValue::Text(status.as_str().to_string()));
    }

    /// 批量写入，跳过校验失败的键。供启动期的继承与注入使用。
    pub(crate) fn merge_attributes(&self, entries: impl IntoIterator<Item = (String, AttributeValue)>) {
        let mut state = self.inner.state.write();
        for (name, value) in entries {
            if validate_attribute_name(&name) {
                state.attributes.insert(name, value);
            }
        }
    }

    pub(crate) fn adopt_label_keys(&self, names: impl IntoIterator<Item = String>) {
        let mut state = self.inner.state.write();
        for name in names {
            state.label_keys.insert(name);
        }
        sync_label_keys(&mut state);
    }
}

/// 把本地标签键集合镜像为保留属性 `_label_keys`，供导出与排障时查看。
fn sync_label_keys(state: &mut SpanState) {
    let keys: Vec<String> = state.label_keys.iter().cloned().collect();
    state
        .attributes
        .insert(keys::attribute::LABEL_KEYS.to_string(), AttributeValue::TextSeq(keys));
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Span")
            .field("qname", &self.qname())
            .field("trace_id", &self.inner.context.trace_id)
            .field("span_id", &self.inner.context.span_id)
            .field("status", &self.status())
            .finish()
    }
}
