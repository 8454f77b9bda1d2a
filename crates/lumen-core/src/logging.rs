//! 结构化日志层：把 `tracing` 事件渲染为 JSON 行，并附上当前 Span 的属性。
//!
//! # 教案式导读
//! - **意图（Why）**：日志与追踪同源。一条日志行落在哪个 Span 里，
//!   由活跃栈在事件发生时刻裁决，业务代码零改动。
//! - **逻辑（How）**：实现 `tracing_subscriber::Layer`，`on_event` 时取
//!   栈顶 Span 的公开属性快照合并进日志行；时间戳用 UTC RFC3339，
//!   日期换算采用 Howard Hinnant 的 days-from-civil 逆算法，不引日期库。
//! - **契约（What）**：无活跃 Span 时 `attributes` 为空对象；渲染失败
//!   只丢弃该行，绝不 panic。

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::tracer;

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// JSON 行日志层。
pub struct JsonLogLayer {
    sink: Sink,
}

impl JsonLogLayer {
    /// 写到标准错误的缺省装配。
    pub fn stderr() -> JsonLogLayer {
        JsonLogLayer {
            sink: Arc::new(Mutex::new(Box::new(std::io::stderr()))),
        }
    }

    pub fn with_sink(sink: Box<dyn Write + Send>) -> JsonLogLayer {
        JsonLogLayer {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// 成对构造：日志层 + 可断言的捕获器。测试专用装配。
    pub fn capturing() -> (JsonLogLayer, JsonLogCapture) {
        let capture = JsonLogCapture::default();
        let layer = JsonLogLayer::with_sink(Box::new(capture.clone()));
        (layer, capture)
    }
}

/// 事件字段收集器：`message` 单独提取，其余字段平铺。
#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), json!(value));
    }
}

impl<S: Subscriber> Layer<S> for JsonLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        let metadata = event.metadata();
        let attributes: BTreeMap<String, Value> = tracer::current_active_span()
            .map(|span| {
                span.attributes()
                    .into_iter()
                    .filter_map(|(name, value)| serde_json::to_value(&value).ok().map(|v| (name, v)))
                    .collect()
            })
            .unwrap_or_default();

        let mut line = Map::new();
        line.insert("@timestamp".to_string(), Value::String(rfc3339_now()));
        line.insert(
            "level".to_string(),
            Value::String(metadata.level().to_string()),
        );
        line.insert(
            "logger".to_string(),
            Value::String(metadata.target().to_string()),
        );
        line.insert(
            "message".to_string(),
            Value::String(collector.message.unwrap_or_default()),
        );
        if let Some(file) = metadata.file() {
            line.insert("file".to_string(), Value::String(file.to_string()));
        }
        if let Some(line_no) = metadata.line() {
            line.insert("line".to_string(), json!(line_no));
        }
        for (name, value) in collector.fields {
            line.insert(name, value);
        }
        line.insert(
            "attributes".to_string(),
            Value::Object(attributes.into_iter().collect()),
        );

        if let Ok(rendered) = serde_json::to_string(&Value::Object(line)) {
            let mut sink = self.sink.lock();
            let _ = writeln!(sink, "{rendered}");
        }
    }
}

/// 装配进程级 JSON 日志订阅器：`RUST_LOG` 过滤 + 标准错误 JSON 行。
///
/// 返回是否安装成功；进程已有全局订阅器时降级为 `false`，不覆盖。
pub fn install_json_logging() -> bool {
    use tracing_subscriber::layer::SubscriberExt as _;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(JsonLogLayer::stderr());
    tracing::subscriber::set_global_default(subscriber).is_ok()
}

/// 捕获 JSON 日志行的内存汇，测试断言专用。
#[derive(Clone, Default)]
pub struct JsonLogCapture {
    lines: Arc<Mutex<Vec<Value>>>,
}

impl JsonLogCapture {
    pub fn lines(&self) -> Vec<Value> {
        self.lines.lock().clone()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    /// 找到 message 含给定子串的第一行。
    pub fn find_message(&self, needle: &str) -> Option<Value> {
        self.lines
            .lock()
            .iter()
            .find(|line| {
                line.get("message")
                    .and_then(Value::as_str)
                    .is_some_and(|message| message.contains(needle))
            })
            .cloned()
    }
}

impl Write for JsonLogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(value) = serde_json::from_slice::<Value>(buf) {
            self.lines.lock().push(value);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// 当前时刻的 UTC RFC3339 文本，毫秒精度。
fn rfc3339_now() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs() as i64;
    let millis = now.subsec_millis();

    let days = secs.div_euclid(86_400);
    let secs_of_day = secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    let hour = secs_of_day / 3600;
    let minute = (secs_of_day % 3600) / 60;
    let second = secs_of_day % 60;

    let mut out = String::with_capacity(24);
    let _ = write!(
        out,
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z"
    );
    out
}

/// days-from-civil 的逆：1970-01-01 起的天数 -> (年, 月, 日)。
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if month <= 2 { year + 1 } else { year };
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_conversion_matches_known_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1)); // 闰年元旦
        assert_eq!(civil_from_days(19_782), (2024, 2, 29));
        assert_eq!(civil_from_days(-1), (1969, 12, 31));
    }

    #[test]
    fn timestamp_shape_is_rfc3339_utc() {
        let stamp = rfc3339_now();
        assert_eq!(stamp.len(), 24);
        assert!(stamp.ends_with('Z'));
        assert_eq!(&stamp[4..5], "-");
        assert_eq!(&stamp[10..11], "T");
    }
}
