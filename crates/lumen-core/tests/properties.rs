//! 随机化性质检验：键名校验、标签视图与聚合恒等式。

use proptest::prelude::*;

use lumen_core::metrics::LabelSet;
use lumen_core::testing::TelemetryFixture;
use lumen_core::AttributeValue;

/// 合法键名：非空，字符全部落在 `[A-Za-z0-9_.-]`。
/// 下划线前缀是内部保留位，公开视图不可见，这里避开。
fn valid_name() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[A-Za-z0-9][A-Za-z0-9_.-]{0,23}").unwrap()
}

fn label_value() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z0-9 ./:-]{0,32}").unwrap()
}

/// 同构序列经 JSON 序列化后落成对应元素类型的数组。
#[test]
fn sequence_values_serialize_to_native_json_arrays() {
    let cases = vec![
        (
            AttributeValue::TextSeq(vec!["a".into(), "b".into()]),
            serde_json::json!(["a", "b"]),
        ),
        (
            AttributeValue::BoolSeq(vec![true, false]),
            serde_json::json!([true, false]),
        ),
        (AttributeValue::I64Seq(vec![1, -2]), serde_json::json!([1, -2])),
        (AttributeValue::F64Seq(vec![0.5, 2.0]), serde_json::json!([0.5, 2.0])),
    ];
    for (value, expected) in cases {
        assert_eq!(serde_json::to_value(&value).unwrap(), expected);
    }
}

proptest! {
    /// 标签视图永远是属性视图键集的子集，且值与属性文本一致。
    #[test]
    fn labels_are_a_projection_of_attributes(
        entries in proptest::collection::btree_map(valid_name(), label_value(), 0..8)
    ) {
        let fixture = TelemetryFixture::new();
        let span = fixture.telemetry.span("prop", "case").start();
        for (name, value) in &entries {
            span.set_label(name, value.as_str());
        }
        let attributes = span.attributes();
        for (name, value) in span.labels() {
            let attribute = attributes.get(&name).and_then(AttributeValue::as_text);
            prop_assert_eq!(attribute, Some(value.as_str()), "标签 {} 必须投影自同名属性", name);
        }
    }

    /// 合法键名的写入总是可见；含类外字符的键名总是被拒。
    #[test]
    fn name_validation_is_exact(
        good in valid_name(),
        bad_char in proptest::char::range(' ', '~').prop_filter(
            "字符必须在类外",
            |c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '.' || *c == '-'),
        ),
        stem in valid_name(),
    ) {
        let fixture = TelemetryFixture::new();
        let span = fixture.telemetry.span("prop", "case").start();
        span.set_attribute(&good, "v");
        prop_assert!(span.attributes().contains_key(&good));

        let bad = format!("{stem}{bad_char}");
        span.set_attribute(&bad, "v");
        prop_assert!(!span.attributes().contains_key(&bad), "非法键名 {:?} 不应写入", bad);
    }

    /// 标量属性值经 JSON 序列化后落成对应的原生类型。
    #[test]
    fn scalar_values_serialize_to_native_json(text in label_value(), flag in any::<bool>(), number in any::<i64>(), real in -1.0e12f64..1.0e12) {
        let cases = vec![
            (AttributeValue::Text(text.clone()), serde_json::json!(text)),
            (AttributeValue::Bool(flag), serde_json::json!(flag)),
            (AttributeValue::I64(number), serde_json::json!(number)),
            (AttributeValue::F64(real), serde_json::json!(real)),
        ];
        for (value, expected) in cases {
            prop_assert_eq!(serde_json::to_value(&value).unwrap(), expected);
        }
    }

    /// 仪表以 `(类目, 名称)` 为唯一身份：同身份跨标签集求和不串台。
    #[test]
    fn instrument_identity_is_category_and_name(
        increments in proptest::collection::vec((0u8..3, 0.0f64..100.0), 1..20)
    ) {
        let fixture = TelemetryFixture::new();
        let mut expected = [0.0f64; 3];
        for (slot, value) in &increments {
            let labels: LabelSet =
                [("slot".to_string(), slot.to_string())].into_iter().collect();
            fixture.telemetry.counter("prop", "hits", *value, labels);
            expected[*slot as usize] += value;
        }
        for (slot, total) in expected.iter().enumerate() {
            let observed = fixture
                .get_counter("prop", "hits")
                .into_iter()
                .find(|(labels, _)| labels.get("slot").map(String::as_str) == Some(slot.to_string().as_str()))
                .map(|(_, v)| v)
                .unwrap_or(0.0);
            prop_assert!((observed - total).abs() < 1e-9, "slot {} 的合计不一致", slot);
        }
    }
}
