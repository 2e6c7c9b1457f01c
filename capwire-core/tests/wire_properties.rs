// Property checks for the universal invariants: ID monotonicity, the
// serialize/parse round-trip law, and the PARAMS deep-copy law.

use proptest::prelude::*;
use serde_json::Number;

use capwire_core::protocol::{Expression, IdAllocator, Payload, Value};

fn arb_expression() -> impl Strategy<Value = Expression> {
    let leaf = prop_oneof![
        Just(Expression::Null),
        any::<bool>().prop_map(Expression::Bool),
        any::<i64>().prop_map(|n| Expression::Number(Number::from(n))),
        "[a-zA-Z0-9 _.-]{0,12}".prop_map(Expression::String),
        (0i64..4_102_444_800_000).prop_map(|ms| Expression::Date(ms as f64)),
    ];
    leaf.prop_recursive(4, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Expression::Array),
            prop::collection::vec(("[a-z]{1,8}", inner), 0..6).prop_map(|fields| {
                let mut map = indexmap::IndexMap::new();
                for (key, value) in fields {
                    map.insert(key, value);
                }
                Expression::Object(map)
            }),
        ]
    })
}

fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 _.-]{0,12}".prop_map(|s| Value::String(s)),
    ];
    leaf.prop_recursive(4, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,8}", inner), 0..6).prop_map(|fields| {
                let mut map = indexmap::IndexMap::new();
                for (key, value) in fields {
                    map.insert(key, value);
                }
                Value::Object(map)
            }),
        ]
    })
}

proptest! {
    // Positive IDs are strictly monotone from 1, negative from -1, and no
    // ID is ever handed out twice.
    #[test]
    fn id_allocation_is_monotone_and_unique(imports in 1usize..64, exports in 1usize..64) {
        let allocator = IdAllocator::new();
        let mut seen = std::collections::HashSet::new();

        let mut last = 0i64;
        for _ in 0..imports {
            let id = allocator.allocate_import().0;
            prop_assert!(id > last, "import IDs must increase");
            prop_assert!(seen.insert(id));
            last = id;
        }

        let mut last = 0i64;
        for _ in 0..exports {
            let id = allocator.allocate_export().0;
            prop_assert!(id < last, "export IDs must decrease");
            prop_assert!(seen.insert(id));
            last = id;
        }
    }

    // serialize(parse(V)) == V modulo the literal-array escape: the JSON
    // projection of an expression parses back to the same expression, and
    // re-serializing yields the same JSON.
    #[test]
    fn expression_round_trip(expr in arb_expression()) {
        let json = expr.to_json();
        let parsed = Expression::from_json(&json).expect("serializer output must parse");
        prop_assert_eq!(&parsed, &expr);
        prop_assert_eq!(parsed.to_json(), json);
    }

    // A PARAMS payload is detached from the application's value by
    // ensure_owned: mutating the owned copy, at any depth, leaves the
    // original alone.
    #[test]
    fn params_deep_copy_detaches(original in arb_value()) {
        fn scribble(value: &mut Value) {
            match value {
                Value::Array(items) => {
                    for item in items.iter_mut() {
                        scribble(item);
                    }
                    items.push(Value::from("scribbled"));
                }
                Value::Object(map) => {
                    for item in map.values_mut() {
                        scribble(item);
                    }
                    map.insert("scribbled".to_string(), Value::Null);
                }
                other => *other = Value::from(-1),
            }
        }

        let before = original.clone();
        let mut payload = Payload::from_params(original.clone());
        payload.ensure_owned();

        scribble(&mut payload.value);
        prop_assert_eq!(&original, &before);
    }
}
