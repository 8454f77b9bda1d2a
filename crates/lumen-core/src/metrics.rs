//! 指标管线：仪表注册、聚合与采集快照。
//!
//! # 教案式导读
//! - **意图（Why）**：调用方按 `(类目, 名称)` 随用随取仪表，首次使用即注册；
//!   聚合内置在进程内（计数器求和、记录器做分布摘要），导出器只消费快照。
//! - **逻辑（How）**：仪表表用 `DashMap` 做分片并发索引；单个仪表内部的
//!   标签集 -> 聚合状态映射由一把 `Mutex` 保护，锁粒度为仪表。
//! - **契约（What）**：同一 `(类目, 名称)` 的仪表种别以首次注册为准，
//!   后续以不同种别访问时 WARN 并丢弃本次记录；累计型聚合跨采集保留。
//! - **风险（Trade-offs）**：标签集基数不做限制，基数失控的防线在
//!   属性名校验与调用方纪律。

use std::collections::{BTreeMap, HashMap};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::environment::EnvironmentConfig;
use crate::keys;

/// 仪表种别。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstrumentKind {
    /// 单调计数器，只增。
    Counter,
    /// 可增可减的计数器。
    UpDownCounter,
    /// 数值记录器，聚合为分布摘要。
    ValueRecorder,
    /// 回调观测仪，采集时拉取当前值。
    Observer,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Counter => "counter",
            InstrumentKind::UpDownCounter => "up_down_counter",
            InstrumentKind::ValueRecorder => "value_recorder",
            InstrumentKind::Observer => "observer",
        }
    }
}

/// 指标点的标签集：键值均为文本，按键有序以便做哈希键。
pub type LabelSet = BTreeMap<String, String>;

/// 单个标签集下的聚合状态。
#[derive(Clone, Debug, PartialEq)]
enum Aggregation {
    Sum(f64),
    Distribution {
        min: f64,
        max: f64,
        sum: f64,
        count: u64,
        last: f64,
    },
}

impl Aggregation {
    fn record(&mut self, value: f64) {
        match self {
            Aggregation::Sum(total) => *total += value,
            Aggregation::Distribution { min, max, sum, count, last } => {
                if value < *min {
                    *min = value;
                }
                if value > *max {
                    *max = value;
                }
                *sum += value;
                *count += 1;
                *last = value;
            }
        }
    }

    fn snapshot(&self) -> AggregationSnapshot {
        match self {
            Aggregation::Sum(total) => AggregationSnapshot::Sum(*total),
            Aggregation::Distribution { min, max, sum, count, last } => AggregationSnapshot::Distribution {
                min: *min,
                max: *max,
                sum: *sum,
                count: *count,
                last: *last,
            },
        }
    }
}

/// 聚合状态的只读快照，随 [`MetricRecord`] 交给导出器。
#[derive(Clone, Debug, PartialEq)]
pub enum AggregationSnapshot {
    Sum(f64),
    Distribution {
        min: f64,
        max: f64,
        sum: f64,
        count: u64,
        last: f64,
    },
}

/// 采集产物：一个仪表在一个标签集下的聚合结果。
#[derive(Clone, Debug)]
pub struct MetricRecord {
    pub category: String,
    pub name: String,
    pub kind: InstrumentKind,
    pub unit: Option<String>,
    pub description: Option<String>,
    pub labels: LabelSet,
    pub aggregation: AggregationSnapshot,
}

impl MetricRecord {
    /// 完整限定名 `category.name`。
    pub fn qname(&self) -> String {
        format!("{}.{}", self.category, self.name)
    }
}

struct Instrument {
    kind: InstrumentKind,
    unit: Option<String>,
    description: Option<String>,
    points: Mutex<HashMap<LabelSet, Aggregation>>,
}

impl Instrument {
    fn new(kind: InstrumentKind, unit: Option<String>, description: Option<String>) -> Instrument {
        Instrument {
            kind,
            unit,
            description,
            points: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, labels: LabelSet, value: f64) {
        let mut points = self.points.lock();
        points
            .entry(labels)
            .or_insert_with(|| match self.kind {
                InstrumentKind::ValueRecorder => Aggregation::Distribution {
                    min: f64::INFINITY,
                    max: f64::NEG_INFINITY,
                    sum: 0.0,
                    count: 0,
                    last: 0.0,
                },
                _ => Aggregation::Sum(0.0),
            })
            .record(value);
    }
}

/// 观测仪回调拿到的写入面。值按标签集做“末次写入胜出”合并。
pub struct Observer<'a> {
    pending: &'a mut HashMap<LabelSet, f64>,
    env_labels: &'a BTreeMap<String, String>,
}

impl Observer<'_> {
    pub fn observe(&mut self, value: f64, labels: impl IntoIterator<Item = (String, String)>) {
        let mut set: LabelSet = labels.into_iter().collect();
        for (key, val) in self.env_labels {
            set.insert(key.clone(), val.clone());
        }
        self.pending.insert(set, value);
    }
}

type GaugeCallback = Box<dyn Fn(&mut Observer<'_>) + Send + Sync>;

struct GaugeEntry {
    unit: Option<String>,
    description: Option<String>,
    callback: GaugeCallback,
    /// 历史上观测过的标签集及其最新值；回调遗漏的标签集沿用旧值。
    seen: Mutex<HashMap<LabelSet, f64>>,
}

/// 指标管线入口。
pub struct Metrics {
    instruments: DashMap<(String, String), Arc<Instrument>>,
    gauges: DashMap<(String, String), Arc<GaugeEntry>>,
    environment: Arc<ArcSwap<EnvironmentConfig>>,
}

impl Metrics {
    pub(crate) fn new(environment: Arc<ArcSwap<EnvironmentConfig>>) -> Metrics {
        Metrics {
            instruments: DashMap::new(),
            gauges: DashMap::new(),
            environment,
        }
    }

    /// 取出或创建仪表；种别冲突时返回 `None` 并 WARN。
    fn instrument(
        &self,
        category: &str,
        name: &str,
        kind: InstrumentKind,
        unit: Option<&str>,
        description: Option<&str>,
    ) -> Option<Arc<Instrument>> {
        let key = (category.to_string(), name.to_string());
        let entry = self
            .instruments
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Instrument::new(
                    kind,
                    unit.map(str::to_string),
                    description.map(str::to_string),
                ))
            })
            .clone();
        if entry.kind != kind {
            tracing::warn!(
                category,
                name,
                requested = kind.as_str(),
                registered = entry.kind.as_str(),
                "instrument kind conflict; measurement dropped"
            );
            return None;
        }
        Some(entry)
    }

    /// 合成最终标签集：环境标签优先级最高。
    fn finalize_labels(&self, labels: LabelSet) -> LabelSet {
        let mut merged = labels;
        for (key, value) in &self.environment.load().labels {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// 单调计数器加值。负增量是调用错误，WARN 并丢弃。
    pub fn add_counter(
        &self,
        category: &str,
        name: &str,
        value: f64,
        labels: LabelSet,
        unit: Option<&str>,
        description: Option<&str>,
    ) {
        if value < 0.0 {
            tracing::warn!(category, name, value, "counter increments must be non-negative; dropped");
            return;
        }
        if let Some(instrument) =
            self.instrument(category, name, InstrumentKind::Counter, unit, description)
        {
            instrument.record(self.finalize_labels(labels), value);
        }
    }

    pub fn add_up_down_counter(
        &self,
        category: &str,
        name: &str,
        value: f64,
        labels: LabelSet,
        unit: Option<&str>,
        description: Option<&str>,
    ) {
        if let Some(instrument) =
            self.instrument(category, name, InstrumentKind::UpDownCounter, unit, description)
        {
            instrument.record(self.finalize_labels(labels), value);
        }
    }

    pub fn record_value(
        &self,
        category: &str,
        name: &str,
        value: f64,
        labels: LabelSet,
        unit: Option<&str>,
        description: Option<&str>,
    ) {
        if let Some(instrument) =
            self.instrument(category, name, InstrumentKind::ValueRecorder, unit, description)
        {
            instrument.record(self.finalize_labels(labels), value);
        }
    }

    /// 注册观测仪回调。同名重复注册以首个为准，后续 WARN 并忽略。
    pub fn register_gauge(
        &self,
        category: &str,
        name: &str,
        unit: Option<&str>,
        description: Option<&str>,
        callback: impl Fn(&mut Observer<'_>) + Send + Sync + 'static,
    ) {
        let key = (category.to_string(), name.to_string());
        if self.gauges.contains_key(&key) {
            tracing::warn!(category, name, "gauge already registered; new callback ignored");
            return;
        }
        if self.instruments.contains_key(&key) {
            tracing::warn!(category, name, "instrument name already in use; gauge ignored");
            return;
        }
        self.gauges.insert(
            key,
            Arc::new(GaugeEntry {
                unit: unit.map(str::to_string),
                description: description.map(str::to_string),
                callback: Box::new(callback),
                seen: Mutex::new(HashMap::new()),
            }),
        );
    }

    /// 采集当前全部仪表的聚合快照。观测仪回调在此刻执行。
    pub fn collect(&self) -> Vec<MetricRecord> {
        let mut records = Vec::new();
        for entry in self.instruments.iter() {
            let (category, name) = entry.key().clone();
            let instrument = entry.value();
            let points = instrument.points.lock();
            for (labels, aggregation) in points.iter() {
                records.push(MetricRecord {
                    category: category.clone(),
                    name: name.clone(),
                    kind: instrument.kind,
                    unit: instrument.unit.clone(),
                    description: instrument.description.clone(),
                    labels: labels.clone(),
                    aggregation: aggregation.snapshot(),
                });
            }
        }
        let env = self.environment.load();
        for entry in self.gauges.iter() {
            let (category, name) = entry.key().clone();
            let gauge = entry.value();
            let mut pending = HashMap::new();
            {
                let mut observer = Observer {
                    pending: &mut pending,
                    env_labels: &env.labels,
                };
                (gauge.callback)(&mut observer);
            }
            let mut seen = gauge.seen.lock();
            for (labels, value) in pending {
                seen.insert(labels, value);
            }
            for (labels, value) in seen.iter() {
                records.push(MetricRecord {
                    category: category.clone(),
                    name: name.clone(),
                    kind: InstrumentKind::Observer,
                    unit: gauge.unit.clone(),
                    description: gauge.description.clone(),
                    labels: labels.clone(),
                    aggregation: AggregationSnapshot::Sum(*value),
                });
            }
        }
        records.sort_by(|a, b| a.qname().cmp(&b.qname()).then_with(|| a.labels.cmp(&b.labels)));
        records
    }

    /// 记录一个 Span 的收尾指标：耗时记录器恒记，错误计数仅在出错时加一。
    pub(crate) fn record_span_end(&self, labels: LabelSet, elapsed_millis: u64, errored: bool) {
        self.record_value(
            keys::metric::TRACE_CATEGORY,
            keys::metric::DURATION,
            elapsed_millis as f64,
            labels.clone(),
            Some("ms"),
            Some("span duration in milliseconds"),
        );
        if errored {
            self.add_counter(
                keys::metric::TRACE_CATEGORY,
                keys::metric::ERRORS,
                1.0,
                labels,
                None,
                Some("spans that ended in error"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Metrics {
        Metrics::new(Arc::new(ArcSwap::from_pointee(EnvironmentConfig::default())))
    }

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn counter_sums_per_label_set() {
        let metrics = metrics();
        metrics.add_counter("jobs", "done", 1.0, labels(&[("queue", "a")]), None, None);
        metrics.add_counter("jobs", "done", 2.0, labels(&[("queue", "a")]), None, None);
        metrics.add_counter("jobs", "done", 5.0, labels(&[("queue", "b")]), None, None);
        let records = metrics.collect();
        assert_eq!(records.len(), 2);
        let a = records.iter().find(|r| r.labels == labels(&[("queue", "a")])).unwrap();
        assert_eq!(a.aggregation, AggregationSnapshot::Sum(3.0));
    }

    #[test]
    fn kind_conflict_keeps_first_registration() {
        let metrics = metrics();
        metrics.add_counter("jobs", "size", 1.0, LabelSet::new(), None, None);
        metrics.record_value("jobs", "size", 9.0, LabelSet::new(), None, None);
        let records = metrics.collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, InstrumentKind::Counter);
        assert_eq!(records[0].aggregation, AggregationSnapshot::Sum(1.0), "冲突的记录应被丢弃");
    }

    #[test]
    fn negative_counter_increment_is_dropped() {
        let metrics = metrics();
        metrics.add_counter("jobs", "done", -1.0, LabelSet::new(), None, None);
        assert!(metrics.collect().is_empty());
        metrics.add_up_down_counter("jobs", "inflight", -2.0, LabelSet::new(), None, None);
        let records = metrics.collect();
        assert_eq!(records[0].aggregation, AggregationSnapshot::Sum(-2.0));
    }

    #[test]
    fn recorder_tracks_distribution_summary() {
        let metrics = metrics();
        for value in [4.0, 1.0, 7.0] {
            metrics.record_value("io", "latency", value, LabelSet::new(), Some("ms"), None);
        }
        let records = metrics.collect();
        match &records[0].aggregation {
            AggregationSnapshot::Distribution { min, max, sum, count, last } => {
                assert_eq!(*min, 1.0);
                assert_eq!(*max, 7.0);
                assert_eq!(*sum, 12.0);
                assert_eq!(*count, 3);
                assert_eq!(*last, 7.0);
            }
            other => panic!("记录器应输出分布摘要，实际是 {other:?}"),
        }
    }

    #[test]
    fn environment_labels_override_call_labels() {
        let env = EnvironmentConfig::from_iter(vec![(
            "METRICS_LABEL_REGION".to_string(),
            "eu-1".to_string(),
        )]);
        let metrics = Metrics::new(Arc::new(ArcSwap::from_pointee(env)));
        metrics.add_counter("jobs", "done", 1.0, labels(&[("region", "local")]), None, None);
        let records = metrics.collect();
        assert_eq!(records[0].labels.get("region").map(String::as_str), Some("eu-1"));
    }

    #[test]
    fn gauge_values_are_last_write_wins_and_sticky() {
        let metrics = metrics();
        let level = Arc::new(parking_lot::Mutex::new(Some(42.0_f64)));
        let probe = level.clone();
        metrics.register_gauge("pool", "free", None, None, move |observer| {
            if let Some(value) = *probe.lock() {
                observer.observe(value, LabelSet::new());
            }
        });
        let records = metrics.collect();
        assert_eq!(records[0].aggregation, AggregationSnapshot::Sum(42.0));
        // 回调沉默时沿用上次观测值。
        *level.lock() = None;
        let records = metrics.collect();
        assert_eq!(records[0].aggregation, AggregationSnapshot::Sum(42.0));
    }
}
