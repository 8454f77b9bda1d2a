//! 保留属性键与固定指标名的契约命名空间。
//!
//! # 设计动机（Why）
//! - 将身份属性、强制标签与内部簿记键集中声明，避免散落各处导致命名漂移；
//! - 统一采用 `attribute` / `label` / `propagate` 三个术语，不再引入 `tag` 等
//!   历史别名。
//!
//! # 使用方式（How）
//! - 生命周期监听链在 Span 启动时引用这些常量完成身份盖章；
//! - 指标导出与测试夹具通过 [`metric`] 子命名空间定位固定指标。

/// 标签类保留键：会被强制提升为指标维度。
pub mod label {
    /// 部署环境标签（来自环境注入，如 `env=staging`）。
    pub const ENV: &str = "env";
    /// Span 的限定名 `{category}.{name}`，指标/日志/追踪三方的关联键。
    pub const TRACE_NAME: &str = "span";
    /// Span 所属分类。
    pub const TRACE_CATEGORY: &str = "category";
    /// Span 结束状态（`OK` / `ERROR`），仅在结束后出现。
    pub const TRACE_STATUS: &str = "span_status";

    /// 无论以 `set_attribute` 还是 `set_label` 写入，这些键都会被视为标签。
    pub const FORCE_LABELS: [&str; 4] = [ENV, TRACE_NAME, TRACE_CATEGORY, TRACE_STATUS];
}

/// 属性类保留键：描述性元数据，不参与指标聚合。
pub mod attribute {
    /// 内部簿记键：记录本 Span 的本地标签键集合，随属性一起到达导出端。
    pub const LABEL_KEYS: &str = "_label_keys";
    /// 追踪标识（128 bit，十六进制文本）。
    pub const TRACE_ID: &str = "trace_id";
    /// Span 标识（64 bit，十六进制文本）。
    pub const TRACE_SPAN_ID: &str = "span_id";
    /// 是否来自远端传播的上下文。
    pub const TRACE_IS_REMOTE: &str = "trace_is_remote";
}

/// 固定指标名。
pub mod metric {
    /// Span 时长 value-recorder 的分类/名称。
    pub const TRACE_CATEGORY: &str = "trace";
    /// 时长指标短名，导出为 `trace.duration`（单位 ms）。
    pub const DURATION: &str = "duration";
    /// 错误计数器短名，导出为 `trace.errors`。
    pub const ERRORS: &str = "errors";
}

/// 身份属性集合：每个 Span 拥有独立取值，永不向子 Span 传播，
/// 也不会被指标门面的环境标签合并视为“环境信息”。
pub const IDENTITY_KEYS: [&str; 6] = [
    label::TRACE_CATEGORY,
    label::TRACE_NAME,
    label::TRACE_STATUS,
    attribute::TRACE_ID,
    attribute::TRACE_SPAN_ID,
    attribute::TRACE_IS_REMOTE,
];

/// 判断给定键是否属于身份属性。
pub fn is_identity_key(name: &str) -> bool {
    IDENTITY_KEYS.contains(&name)
}

/// 内部簿记键的保留前缀；以该前缀开头的属性不出现在公开视图中。
pub const INTERNAL_PREFIX: char = '_';
