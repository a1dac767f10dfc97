use chatwire_ai::{
    extract_as, extract_structured, extract_structured_with_keys, extract_structured_with_schema,
};
use serde::Deserialize;
use serde_json::json;

#[test]
fn well_formed_objects_round_trip() {
    let samples = [
        json!({}),
        json!({ "a": 1 }),
        json!({ "nested": { "list": [1, 2.5, "x", null, true] }, "empty": [] }),
        json!({ "text": "braces { } and \"quotes\" inside", "unicode": "héllo ✓" }),
    ];

    for sample in samples {
        let text = serde_json::to_string(&sample).expect("serialize");
        assert_eq!(extract_structured(&text), Some(sample.clone()));

        let pretty = serde_json::to_string_pretty(&sample).expect("serialize");
        assert_eq!(extract_structured(&pretty), Some(sample));
    }
}

#[test]
fn loose_object_with_bare_keys_single_quotes_and_bare_array() {
    let recovered = extract_structured("{name: 'Bob', active: true, tags: [foo, bar]}");

    assert_eq!(
        recovered,
        Some(json!({ "name": "Bob", "active": true, "tags": ["foo", "bar"] }))
    );
}

#[test]
fn repairs_leave_string_contents_untouched() {
    assert_eq!(
        extract_structured("{msg: 'hello, world: ok', n: 1}"),
        Some(json!({ "msg": "hello, world: ok", "n": 1 }))
    );
    assert_eq!(
        extract_structured("{note: \"steps: fetch, parse\", state: done}"),
        Some(json!({ "note": "steps: fetch, parse", "state": "done" }))
    );
}

#[test]
fn leading_zero_numbers_stay_strings() {
    assert_eq!(
        extract_structured("{id: \"0042\", name: 'x'}"),
        Some(json!({ "id": "0042", "name": "x" }))
    );
    assert_eq!(
        extract_structured("{zip: \"02139\", count: \"12\"}"),
        Some(json!({ "zip": "02139", "count": 12 }))
    );
}

#[test]
fn fenced_json_inside_prose() {
    let text = "Sure! Here is the data you asked for:\n\n```json\n{\"a\": 1, \"b\": [1, 2, 3]}\n```\n\nLet me know if you need anything else.";

    assert_eq!(extract_structured(text), Some(json!({ "a": 1, "b": [1, 2, 3] })));
}

#[test]
fn unlabeled_fence_with_trailing_commas() {
    let text = "Result:\n```\n{\n  \"score\": \"8\",\n  \"tags\": [\"a\", \"b\",],\n}\n```";

    assert_eq!(
        extract_structured(text),
        Some(json!({ "score": 8, "tags": ["a", "b"] }))
    );
}

#[test]
fn deeply_nested_object_in_prose_needs_expected_keys() {
    let text = "The analysis: {\"outer\": {\"inner\": {\"deep\": 1}}, \"ok\": true} -- end";

    // The flat-object pattern only spans one nesting level, so it finds the
    // inner object first.
    assert_eq!(
        extract_structured(text),
        Some(json!({ "inner": { "deep": 1 } }))
    );
    assert_eq!(
        extract_structured_with_keys(text, &["outer"]),
        Some(json!({ "outer": { "inner": { "deep": 1 } }, "ok": true }))
    );
}

#[test]
fn truncated_output_yields_none() {
    assert_eq!(extract_structured("{\"name\": \"Bob\", \"tags\": [\"a\", \"b\""), None);
    assert_eq!(extract_structured("Here is the result: {\"summary\": \"ok\""), None);
    assert_eq!(extract_structured(""), None);
    assert_eq!(extract_structured("no structure at all"), None);
}

#[test]
fn expected_keys_skip_unrelated_objects() {
    let text = "First a note {\"noise\": 1}, then the answer {\"score\": 9, \"reason\": \"clear\"}.";

    assert_eq!(extract_structured(text), Some(json!({ "noise": 1 })));
    assert_eq!(
        extract_structured_with_keys(text, &["score", "verdict"]),
        Some(json!({ "score": 9, "reason": "clear" }))
    );
    assert_eq!(extract_structured_with_keys(text, &["missing"]), None);
}

#[test]
fn schema_validation_filters_candidates() {
    let schema = json!({
        "type": "object",
        "required": ["title", "rating"],
        "properties": {
            "title": { "type": "string" },
            "rating": { "type": "integer", "minimum": 1, "maximum": 5 }
        }
    });

    let good = "Review: {title: 'Dune', rating: '5'}";
    assert_eq!(
        extract_structured_with_schema(good, &schema),
        Some(json!({ "title": "Dune", "rating": 5 }))
    );

    let out_of_range = "Review: {\"title\": \"Dune\", \"rating\": 11}";
    assert_eq!(extract_structured_with_schema(out_of_range, &schema), None);

    let invalid_schema = json!({ "type": 12 });
    assert_eq!(extract_structured_with_schema(good, &invalid_schema), None);
}

#[test]
fn extract_as_deserializes_into_caller_type() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Suggestion {
        title: String,
        priority: u8,
        tags: Vec<String>,
    }

    let text = "```json\n{title: 'Refactor parser', priority: '2', tags: [parser, cleanup]}\n```";
    assert_eq!(
        extract_as::<Suggestion>(text),
        Some(Suggestion {
            title: "Refactor parser".to_string(),
            priority: 2,
            tags: vec!["parser".to_string(), "cleanup".to_string()],
        })
    );

    assert_eq!(extract_as::<Suggestion>("{\"title\": \"only title\"}"), None);
}

#[test]
fn hostile_inputs_never_panic() {
    let inputs = [
        "{{{{{{{{",
        "}}}}]]]]",
        "```",
        "```json",
        "{'unterminated: \"",
        "{a: [b, [c, {d: e}]]}",
        "\\\\\\'\"\"'",
        "{\"a\": \"\u{0}\u{ffff}\"}",
    ];
    for input in inputs {
        let _ = extract_structured(input);
        let _ = extract_structured_with_keys(input, &["a"]);
    }
}
