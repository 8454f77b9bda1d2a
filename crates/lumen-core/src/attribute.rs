//! 属性值模型与属性名校验。
//!
//! # 设计背景（Why）
//! - 参考 OpenTelemetry 的属性类型集合，提供文本、布尔、整数、浮点四种标量及其
//!   同构序列，避免把数值强行转成字符串造成信息损失；
//! - 属性名校验采用“首次付费”策略：同名键的校验结果在进程内缓存，热路径上
//!   后续写入直接信任缓存，保证校验成本有界。
//!
//! # 契约说明（What）
//! - 属性名必须匹配模式 `_*[A-Za-z0-9_.-]+`；违例时记录 WARN 并跳过该次写入，
//!   绝不向调用方抛错；
//! - 标签值必须为文本（[`AttributeValue::Text`]），其余类型在 `set_label` 处降级。
//!
//! # 风险提示（Trade-offs）
//! - 校验缓存无逐出策略；超过 1000 个不同键名时记录一次告警，提示基数失控。

use std::borrow::Cow;
use std::fmt;

use dashmap::DashMap;
use serde::Serialize;

/// Span 属性与指标标签共用的值类型。
///
/// # 契约说明（What）
/// - 序列变体要求元素同构；异构序列应在调用方拆分为多个属性；
/// - 实现 `Serialize`（untagged），导出端以 JSON 原生类型呈现。
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    Bool(bool),
    I64(i64),
    F64(f64),
    TextSeq(Vec<String>),
    BoolSeq(Vec<bool>),
    I64Seq(Vec<i64>),
    F64Seq(Vec<f64>),
}

impl AttributeValue {
    /// 若为文本值则返回其内容。标签路径用它甄别“值必须是字符串”的契约。
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// 将枚举类取值折算为符号名。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：标签值必须是文本，而枚举不可跨导出格式携带；参数提取
    ///   需要一个统一的“取变体名”途径。
    /// - **实现 (How)**：利用 `Debug` 输出，截断首个 `(`/`{`/空白之前的部分；
    ///   对无字段枚举恰好得到变体名，对带字段变体也能得到稳定前缀。
    pub fn symbol<T: fmt::Debug>(value: &T) -> AttributeValue {
        let rendered = format!("{value:?}");
        let cut = rendered
            .find(|c: char| c == '(' || c == '{' || c.is_whitespace())
            .unwrap_or(rendered.len());
        AttributeValue::Text(rendered[..cut].to_string())
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Text(v) => f.write_str(v),
            AttributeValue::Bool(v) => write!(f, "{v}"),
            AttributeValue::I64(v) => write!(f, "{v}"),
            AttributeValue::F64(v) => write!(f, "{v}"),
            AttributeValue::TextSeq(v) => write!(f, "{v:?}"),
            AttributeValue::BoolSeq(v) => write!(f, "{v:?}"),
            AttributeValue::I64Seq(v) => write!(f, "{v:?}"),
            AttributeValue::F64Seq(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<Cow<'_, str>> for AttributeValue {
    fn from(value: Cow<'_, str>) -> Self {
        AttributeValue::Text(value.into_owned())
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::I64(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::I64(value.into())
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::I64(value.into())
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        // 超出 i64 表示范围时执行饱和转换，可能损失信息。
        AttributeValue::I64(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::F64(value)
    }
}

impl From<f32> for AttributeValue {
    fn from(value: f32) -> Self {
        AttributeValue::F64(value.into())
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        AttributeValue::TextSeq(value)
    }
}

impl From<Vec<&str>> for AttributeValue {
    fn from(value: Vec<&str>) -> Self {
        AttributeValue::TextSeq(value.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<bool>> for AttributeValue {
    fn from(value: Vec<bool>) -> Self {
        AttributeValue::BoolSeq(value)
    }
}

impl From<Vec<i64>> for AttributeValue {
    fn from(value: Vec<i64>) -> Self {
        AttributeValue::I64Seq(value)
    }
}

impl From<Vec<f64>> for AttributeValue {
    fn from(value: Vec<f64>) -> Self {
        AttributeValue::F64Seq(value)
    }
}

/// 属性名校验缓存的告警阈值。
const NAME_CACHE_WARN_THRESHOLD: usize = 1000;

/// 进程级属性名校验缓存：键名 -> 是否合法。
///
/// 首次遇到某个键名时完成一次完整校验（非法名同时记录一条 WARN），
/// 之后的写入直接复用缓存结论。
static NAME_CACHE: std::sync::OnceLock<DashMap<String, bool>> = std::sync::OnceLock::new();

/// 基数告警只发一次。
static CACHE_WARNED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

fn name_cache() -> &'static DashMap<String, bool> {
    NAME_CACHE.get_or_init(DashMap::new)
}

fn matches_name_pattern(name: &str) -> bool {
    // 模式 `_*[A-Za-z0-9_.-]+` 等价于：非空，且所有字符落在类内。
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// 校验属性/标签名，结果在进程内记忆。
///
/// # 契约说明
/// - **输入参数**：`name` 为待校验键名；
/// - **返回值**：合法返回 `true`；非法返回 `false`，并且仅在首次遇到该名字时
///   输出一条 WARN；
/// - **后置条件**：无论结论如何，键名都会进入缓存，保证每个名字只付一次校验成本。
pub(crate) fn validate_attribute_name(name: &str) -> bool {
    let cache = name_cache();
    if let Some(known) = cache.get(name) {
        return *known;
    }

    let valid = matches_name_pattern(name);
    if !valid {
        tracing::warn!(
            name,
            "attribute/label name must match the pattern `_*[A-Za-z0-9_.-]+`; value skipped"
        );
    }
    if cache.len() >= NAME_CACHE_WARN_THRESHOLD
        && !CACHE_WARNED.swap(true, std::sync::atomic::Ordering::Relaxed)
    {
        tracing::warn!(
            threshold = NAME_CACHE_WARN_THRESHOLD,
            "over {} attribute names cached; investigate attribute-name cardinality",
            NAME_CACHE_WARN_THRESHOLD
        );
    }
    cache.insert(name.to_string(), valid);
    valid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_conversions_preserve_type() {
        assert_eq!(AttributeValue::from("x"), AttributeValue::Text("x".into()));
        assert_eq!(AttributeValue::from(true), AttributeValue::Bool(true));
        assert_eq!(AttributeValue::from(7_i64), AttributeValue::I64(7));
        assert_eq!(AttributeValue::from(1.5_f64), AttributeValue::F64(1.5));
    }

    #[test]
    fn u64_conversion_saturates() {
        assert_eq!(AttributeValue::from(u64::MAX), AttributeValue::I64(i64::MAX));
    }

    #[test]
    fn symbol_extracts_enum_variant_name() {
        #[derive(Debug)]
        #[allow(dead_code)]
        enum Mode {
            Fast,
            Careful(u8),
        }
        assert_eq!(
            AttributeValue::symbol(&Mode::Fast),
            AttributeValue::Text("Fast".into())
        );
        assert_eq!(
            AttributeValue::symbol(&Mode::Careful(3)),
            AttributeValue::Text("Careful".into())
        );
    }

    #[test]
    fn name_pattern_accepts_reserved_prefix() {
        assert!(matches_name_pattern("_label_keys"));
        assert!(matches_name_pattern("http.status-code"));
        assert!(!matches_name_pattern(""));
        assert!(!matches_name_pattern("bad name"));
        assert!(!matches_name_pattern("å"));
    }
}
