//! 属性键注册表：集中声明“哪些键是标签、哪些键跨 Span 传播”。
//!
//! # 设计背景（Why）
//! - 把标签/传播语义从调用点挪到注册表，Span 逻辑据此统一裁决，
//!   避免散落在各处的布尔参数；
//! - 注册表在进程生命周期内只增不减，读多写少，用 `RwLock<HashMap>` 足够。

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::error::ConfigError;

/// 一个已注册的属性键及其语义。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeKey {
    /// 键名，须满足属性名模式。
    pub name: String,
    /// 是否在指标导出中作为标签呈现。
    pub is_label: bool,
    /// 是否由父 Span 自动传播到子 Span。
    pub propagate: bool,
}

/// 线程安全的键注册表。
///
/// # 契约说明（What）
/// - `register` 对重复键名返回 [`ConfigError::DuplicateKey`]，已有语义不被覆盖；
/// - 未注册键的 `is_label`/`propagates` 查询一律返回 `false`（临时标签由
///   Span 本地的标签键集合另行记账）。
#[derive(Debug, Default)]
pub struct AttributeRegistry {
    keys: RwLock<HashMap<String, AttributeKey>>,
    label_names: RwLock<HashSet<String>>,
}

impl AttributeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个属性键。重复注册是配置错误，返回 `Err` 而不是静默覆盖。
    pub fn register(&self, key: AttributeKey) -> Result<(), ConfigError> {
        let mut keys = self.keys.write();
        if keys.contains_key(&key.name) {
            return Err(ConfigError::DuplicateKey { name: key.name });
        }
        if key.is_label {
            self.label_names.write().insert(key.name.clone());
        }
        keys.insert(key.name.clone(), key);
        Ok(())
    }

    /// 声明一个普通属性键（非标签）。
    pub fn register_attribute(&self, name: &str, propagate: bool) -> Result<(), ConfigError> {
        self.register(AttributeKey {
            name: name.to_string(),
            is_label: false,
            propagate,
        })
    }

    /// 声明一个标签键（值会进入指标标签集）。
    pub fn register_label(&self, name: &str, propagate: bool) -> Result<(), ConfigError> {
        self.register(AttributeKey {
            name: name.to_string(),
            is_label: true,
            propagate,
        })
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.keys.read().contains_key(name)
    }

    /// 该键是否声明为标签。未注册键返回 `false`。
    pub fn is_label(&self, name: &str) -> bool {
        self.label_names.read().contains(name)
    }

    /// 该键是否声明为自动传播。未注册键返回 `false`。
    pub fn propagates(&self, name: &str) -> bool {
        self.keys
            .read()
            .get(name)
            .map(|key| key.propagate)
            .unwrap_or(false)
    }

    /// 当前注册为标签的键名快照。
    pub fn label_names(&self) -> HashSet<String> {
        self.label_names.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = AttributeRegistry::new();
        registry.register_label("tenant", true).expect("首次注册应成功");
        let err = registry.register_attribute("tenant", false).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateKey { ref name } if name == "tenant"));
        // 原有语义不被覆盖。
        assert!(registry.is_label("tenant"));
        assert!(registry.propagates("tenant"));
    }

    #[test]
    fn unknown_keys_default_to_plain_attributes() {
        let registry = AttributeRegistry::new();
        assert!(!registry.is_label("nobody"));
        assert!(!registry.propagates("nobody"));
        assert!(!registry.is_registered("nobody"));
    }
}
