//! 环境变量配置层。
//!
//! # 契约说明（What）
//! 识别的变量（均以 `METRICS_` 为前缀）：
//! - `METRICS_EXPORTERS`：逗号分隔的导出器名单；
//! - `METRICS_INTERVAL`：导出周期（秒），缺省 10；
//! - `METRICS_PROMETHEUS_BIND_ADDRESS`：缺省 `0.0.0.0:9102`，缺端口时补默认端口;
//! - `METRICS_PROMETHEUS_PREFIX`：指标名前缀；
//! - `METRICS_LABEL_<X>`：注入为全局标签 `<x>`（键名转小写）；
//! - `METRICS_ATTRIBUTE_<X>`：注入为全局属性 `<x>`（键名转小写）；
//! - `METRICS_APP_NAME` / `METRICS_APP_VERSION`：映射为属性 `app.name` / `app.version`。
//!
//! # 风险提示（Trade-offs）
//! - 配置在初始化时一次性解析为不可变快照，之后经 `ArcSwap` 原子替换；
//!   运行中修改进程环境变量不会生效，需要 `reload`。

use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_PROMETHEUS_PORT: u16 = 9102;
pub const DEFAULT_PROMETHEUS_BIND: &str = "0.0.0.0:9102";

const VAR_EXPORTERS: &str = "METRICS_EXPORTERS";
const VAR_INTERVAL: &str = "METRICS_INTERVAL";
const VAR_PROMETHEUS_BIND: &str = "METRICS_PROMETHEUS_BIND_ADDRESS";
const VAR_PROMETHEUS_PREFIX: &str = "METRICS_PROMETHEUS_PREFIX";
const VAR_APP_NAME: &str = "METRICS_APP_NAME";
const VAR_APP_VERSION: &str = "METRICS_APP_VERSION";
const PREFIX_LABEL: &str = "METRICS_LABEL_";
const PREFIX_ATTRIBUTE: &str = "METRICS_ATTRIBUTE_";

/// 解析后的环境配置快照。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvironmentConfig {
    /// 请求启用的导出器名字（原样保留大小写，匹配时不区分）。
    pub exporters: Vec<String>,
    pub interval: Duration,
    pub prometheus_bind_address: String,
    pub prometheus_prefix: Option<String>,
    /// 注入每个指标点的全局标签。
    pub labels: BTreeMap<String, String>,
    /// 注入每个 Span 的全局属性。
    pub attributes: BTreeMap<String, String>,
}

impl EnvironmentConfig {
    /// 从进程环境读取配置。
    pub fn from_env() -> EnvironmentConfig {
        Self::from_iter(std::env::vars())
    }

    /// 从任意键值流解析配置；测试据此注入受控环境。
    pub fn from_iter(vars: impl IntoIterator<Item = (String, String)>) -> EnvironmentConfig {
        let mut config = EnvironmentConfig {
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            prometheus_bind_address: DEFAULT_PROMETHEUS_BIND.to_string(),
            ..EnvironmentConfig::default()
        };

        for (key, value) in vars {
            match key.as_str() {
                VAR_EXPORTERS => {
                    config.exporters = value
                        .split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                VAR_INTERVAL => match value.trim().parse::<u64>() {
                    Ok(secs) if secs > 0 => config.interval = Duration::from_secs(secs),
                    _ => {
                        tracing::warn!(%value, "invalid METRICS_INTERVAL; keeping default of {DEFAULT_INTERVAL_SECS}s");
                    }
                },
                VAR_PROMETHEUS_BIND => {
                    config.prometheus_bind_address = normalize_bind_address(value.trim());
                }
                VAR_PROMETHEUS_PREFIX => {
                    let trimmed = value.trim();
                    if !trimmed.is_empty() {
                        config.prometheus_prefix = Some(trimmed.to_string());
                    }
                }
                VAR_APP_NAME => {
                    config.attributes.insert("app.name".to_string(), value);
                }
                VAR_APP_VERSION => {
                    config.attributes.insert("app.version".to_string(), value);
                }
                _ => {
                    if let Some(rest) = key.strip_prefix(PREFIX_LABEL) {
                        if !rest.is_empty() {
                            config.labels.insert(rest.to_lowercase(), value);
                        }
                    } else if let Some(rest) = key.strip_prefix(PREFIX_ATTRIBUTE) {
                        if !rest.is_empty() {
                            config.attributes.insert(rest.to_lowercase(), value);
                        }
                    }
                }
            }
        }
        config
    }

    /// 判断某个导出器是否被点名（子串匹配，忽略大小写）。
    pub fn wants_exporter(&self, name: &str) -> bool {
        let needle = name.to_lowercase();
        self.exporters
            .iter()
            .any(|entry| entry.to_lowercase().contains(&needle))
    }
}

/// 绑定地址缺少端口时补上默认端口。
fn normalize_bind_address(address: &str) -> String {
    if address.is_empty() {
        return DEFAULT_PROMETHEUS_BIND.to_string();
    }
    // IPv6 字面量形如 `[::1]:9102`；无括号且无冒号视为纯主机名。
    let has_port = if let Some(close) = address.rfind(']') {
        address[close..].contains(':')
    } else {
        address.contains(':')
    };
    if has_port {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_PROMETHEUS_PORT}")
    }
}
