//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义遥测层“配置期致命错误”的语义：重复注册属性键、全局实例安装冲突等
//!   均属编程错误，应在启动阶段立即暴露，而非运行期静默降级；
//! - 与运行期的校验告警（无效属性名、非法标签值等）严格区分——后者只会触发
//!   `tracing::warn!` 并跳过该次写入，绝不向业务调用方抛错。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，可直接交由 `anyhow`/`eyre` 等上层框架处理；
//! - 错误文案需携带足够上下文（键名、类别），便于在 CI 或启动日志中直接定位。

use thiserror::Error;

/// 遥测层配置阶段的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：遥测层的指导原则是“遥测永远不能成为业务崩溃的原因”，因此
///   唯一允许致命化的是配置期误用——它们暴露的是代码缺陷而非运行时状态。
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`，可安全跨线程传播；
///   - 运行期路径（Span 写属性、记指标）不会返回本类型。
/// - **权衡 (Trade-offs)**：变体携带 `String` 上下文，牺牲少量堆分配换取可读性。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// 同名属性键被重复注册。
    ///
    /// 注册表要求键名全局唯一；重复注册几乎总是模块加载顺序或拷贝粘贴错误。
    #[error("attribute key `{name}` is already registered")]
    DuplicateKey { name: String },

    /// 在已完成初始化的进程中再次安装全局 Telemetry 实例。
    ///
    /// 测试场景应改用 [`crate::telemetry::Telemetry::install_scoped`]，
    /// 其守卫会在作用域结束时恢复原实例。
    #[error("a global telemetry instance is already installed; use a scoped guard for tests")]
    AlreadyInstalled,
}
