//! Span 生命周期监听器。
//!
//! # 契约说明（What）
//! - `on_start` 在身份戳记与环境注入之后、Span 入栈之前调用，可继续写属性；
//! - `on_end` 在状态定论之后、导出之前调用，看到的是最终快照；
//! - 监听器回调内的 panic 会被捕获并 WARN，不得影响业务调用方。

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::span::Span;

pub trait SpanListener: Send + Sync {
    fn on_start(&self, span: &Span);
    fn on_end(&self, span: &Span);
}

/// 按类目过滤的监听器包装：只对命中的类目转发回调。
///
/// 匹配规则：类目与目标名完全相等，或类目是目标名加 `.` 的前缀
/// （`store` 命中 `store.cache`）。
pub struct CategoryScoped<L> {
    category: String,
    inner: L,
}

impl<L: SpanListener> CategoryScoped<L> {
    pub fn new(category: impl Into<String>, inner: L) -> CategoryScoped<L> {
        CategoryScoped {
            category: category.into(),
            inner,
        }
    }

    fn matches(&self, span: &Span) -> bool {
        let category = span.category();
        category == self.category
            || (category.len() > self.category.len()
                && category.starts_with(&self.category)
                && category.as_bytes()[self.category.len()] == b'.')
    }
}

impl<L: SpanListener> SpanListener for CategoryScoped<L> {
    fn on_start(&self, span: &Span) {
        if self.matches(span) {
            self.inner.on_start(span);
        }
    }

    fn on_end(&self, span: &Span) {
        if self.matches(span) {
            self.inner.on_end(span);
        }
    }
}

/// 隔离调用一个监听器回调，panic 不外溢。
pub(crate) fn guarded<F: FnOnce()>(span: &Span, phase: &str, call: F) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        tracing::warn!(span = %span.qname(), phase, "span listener panicked; ignored");
    }
}
