//! 追踪上下文：TraceId / SpanId 及其生成器。
//!
//! # 设计背景（Why）
//! - 标识符只需进程内唯一加上足够的随机性，不需要密码学强度；
//!   用 SplitMix64 叠加单调计数器即可，避免引入随机数依赖。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 128 位追踪标识。同一棵 Span 树共享一个 TraceId。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(pub [u8; 16]);

/// 64 位 Span 标识，在所属 Trace 内唯一。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(pub [u8; 8]);

impl TraceId {
    pub const INVALID: TraceId = TraceId([0; 16]);

    pub fn is_valid(&self) -> bool {
        self.0 != [0; 16]
    }
}

impl SpanId {
    pub const INVALID: SpanId = SpanId([0; 8]);

    pub fn is_valid(&self) -> bool {
        self.0 != [0; 8]
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// 一个 Span 的传播上下文。
///
/// # 契约说明（What）
/// - `trace_state` 预留给跨进程透传的键值对；本进程内创建的 Span 为空表；
/// - 远端恢复的上下文通过 [`SpanContext::remote`] 构造，`is_remote` 为真。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub is_remote: bool,
    pub trace_state: BTreeMap<String, String>,
}

impl SpanContext {
    /// 为根 Span 生成全新的上下文。
    pub fn generate() -> Self {
        SpanContext {
            trace_id: TraceId(generate_bytes()),
            span_id: SpanId(generate_span_bytes()),
            is_remote: false,
            trace_state: BTreeMap::new(),
        }
    }

    /// 在既有 Trace 内派生子 Span 上下文。
    pub fn child_of(parent: &SpanContext) -> Self {
        SpanContext {
            trace_id: parent.trace_id,
            span_id: SpanId(generate_span_bytes()),
            is_remote: false,
            trace_state: parent.trace_state.clone(),
        }
    }

    /// 从远端恢复的上下文。
    pub fn remote(trace_id: TraceId, span_id: SpanId) -> Self {
        SpanContext {
            trace_id,
            span_id,
            is_remote: true,
            trace_state: BTreeMap::new(),
        }
    }
}

/// 进程级计数器，保证同一纳秒内生成的标识互不相同。
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ SEQUENCE.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// SplitMix64 单步：雪崩混合，把相邻种子打散成独立取值。
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn generate_bytes() -> [u8; 16] {
    let mut state = seed();
    let hi = splitmix64(&mut state);
    let lo = splitmix64(&mut state);
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&hi.to_be_bytes());
    out[8..].copy_from_slice(&lo.to_be_bytes());
    if out == [0; 16] {
        out[15] = 1;
    }
    out
}

fn generate_span_bytes() -> [u8; 8] {
    let mut state = seed();
    let word = splitmix64(&mut state);
    let mut out = word.to_be_bytes();
    if out == [0; 8] {
        out[7] = 1;
    }
    out
}
