//! 声明式调用包装：在函数入口按计划提取参数为属性/标签。
//!
//! # 教案式导读
//! - **意图（Why）**：调用方在一处声明“哪个参数进 Span、以什么身份进”，
//!   调用点不再手写逐个 `set_attribute`。提取计划是显式类型化的数据，
//!   不依赖任何运行期反射。
//! - **契约（What）**：计划引用的参数缺席时，对每次调用各记一条 WARN
//!   （指名参数与目标 Span），该条提取跳过，调用照常进行；自定义提取器
//!   抛错同样只降级为 WARN。

use std::collections::BTreeMap;
use std::fmt;

use crate::attribute::AttributeValue;
use crate::span::Span;
use crate::telemetry::Telemetry;

/// 提取结果的落点。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeTarget {
    /// 作为普通属性写入。
    Attribute(String),
    /// 作为标签写入（值必须是文本）。
    Label(String),
}

/// 一条提取规则：参数名 -> 落点。
#[derive(Clone, Debug)]
struct Extraction {
    parameter: String,
    target: AttributeTarget,
}

/// 一次调用的具名参数集。
///
/// `None` 表示参数在本次调用中显式缺值（区别于计划引用了不存在的参数）。
#[derive(Clone, Debug, Default)]
pub struct ArgumentSet {
    values: BTreeMap<String, Option<AttributeValue>>,
}

impl ArgumentSet {
    pub fn new() -> ArgumentSet {
        ArgumentSet::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<AttributeValue>) -> &mut Self {
        self.values.insert(name.to_string(), Some(value.into()));
        self
    }

    /// 显式记录一个缺值参数。
    pub fn set_none(&mut self, name: &str) -> &mut Self {
        self.values.insert(name.to_string(), None);
        self
    }

    /// 以 `Debug` 变体名的形式记录枚举参数。
    pub fn set_symbol<T: fmt::Debug>(&mut self, name: &str, value: &T) -> &mut Self {
        self.values
            .insert(name.to_string(), Some(AttributeValue::symbol(value)));
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.values.get(name).and_then(Option::as_ref)
    }

    fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

type CustomExtractor =
    Box<dyn Fn(&ArgumentSet) -> Result<Vec<(String, AttributeValue)>, String> + Send + Sync>;

/// 一个可反复执行的带追踪调用计划。
///
/// 构造一次，之后每次业务调用复用同一计划。
pub struct TracedCall {
    category: String,
    name: String,
    fixed_attributes: Vec<(String, AttributeValue)>,
    extractions: Vec<Extraction>,
    custom_extractors: Vec<CustomExtractor>,
}

impl TracedCall {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> TracedCall {
        TracedCall {
            category: category.into(),
            name: name.into(),
            fixed_attributes: Vec::new(),
            extractions: Vec::new(),
            custom_extractors: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> TracedCall {
        self.category = category.into();
        self
    }

    /// 每次调用都写入的固定属性。
    pub fn with_attribute(mut self, name: &str, value: impl Into<AttributeValue>) -> TracedCall {
        self.fixed_attributes.push((name.to_string(), value.into()));
        self
    }

    /// 把参数 `parameter` 提取为属性 `attribute`。
    pub fn extract_attribute(mut self, parameter: &str, attribute: &str) -> TracedCall {
        self.extractions.push(Extraction {
            parameter: parameter.to_string(),
            target: AttributeTarget::Attribute(attribute.to_string()),
        });
        self
    }

    /// 把参数 `parameter` 提取为标签 `label`。
    pub fn extract_label(mut self, parameter: &str, label: &str) -> TracedCall {
        self.extractions.push(Extraction {
            parameter: parameter.to_string(),
            target: AttributeTarget::Label(label.to_string()),
        });
        self
    }

    /// 追加自定义提取器：拿到整个参数集，产出额外属性。
    pub fn extract_with(
        mut self,
        extractor: impl Fn(&ArgumentSet) -> Result<Vec<(String, AttributeValue)>, String>
            + Send
            + Sync
            + 'static,
    ) -> TracedCall {
        self.custom_extractors.push(Box::new(extractor));
        self
    }

    pub fn qname(&self) -> String {
        format!("{}.{}", self.category, self.name)
    }

    /// 在计划对应的 Span 内执行 `f`，入口处完成参数提取。
    pub fn invoke<T, E: fmt::Display>(
        &self,
        telemetry: &Telemetry,
        arguments: &ArgumentSet,
        f: impl FnOnce(&Span) -> Result<T, E>,
    ) -> Result<T, E> {
        telemetry.tracer().in_span(&self.category, &self.name, |span| {
            self.apply(span, arguments);
            f(span)
        })
    }

    fn apply(&self, span: &Span, arguments: &ArgumentSet) {
        for (name, value) in &self.fixed_attributes {
            span.set_attribute(name, value.clone());
        }
        for extraction in &self.extractions {
            if !arguments.contains(&extraction.parameter) {
                tracing::warn!(
                    span = %self.qname(),
                    parameter = %extraction.parameter,
                    target = ?extraction.target,
                    "extraction references a parameter absent from this call; skipped"
                );
                continue;
            }
            let Some(value) = arguments.get(&extraction.parameter) else {
                // 参数显式缺值：静默跳过。
                continue;
            };
            match &extraction.target {
                AttributeTarget::Attribute(name) => {
                    span.set_attribute(name, value.clone());
                }
                AttributeTarget::Label(name) => {
                    span.set_label(name, value.clone());
                }
            }
        }
        for extractor in &self.custom_extractors {
            match extractor(arguments) {
                Ok(extra) => {
                    for (name, value) in extra {
                        span.set_attribute(&name, value);
                    }
                }
                Err(error) => {
                    tracing::warn!(span = %self.qname(), %error, "custom extractor failed; skipped");
                }
            }
        }
    }
}
