//! Best-effort recovery of a JSON object from free-form model output.
//!
//! The whole text is parsed first. Failing that, candidate spans are pulled
//! out by a fixed list of extractors (flat object, outermost braces, ```json
//! fence, any fence); each span is parsed as-is and then after a chain of
//! string-level repairs. The first object that passes the caller's shape check
//! wins. There is no partial result: callers get `None` and use their own
//! default.

use std::sync::OnceLock;

use jsonschema::JSONSchema;
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

type CandidateExtractor = fn(&str) -> Vec<String>;
type Sanitizer = fn(&str) -> String;

const CANDIDATE_EXTRACTORS: [(&str, CandidateExtractor); 4] = [
    ("flat_object", flat_object_candidates),
    ("brace_span", brace_span_candidates),
    ("json_fence", json_fence_candidates),
    ("any_fence", any_fence_candidates),
];

const SANITIZERS: [Sanitizer; 6] = [
    quote_bare_keys,
    single_to_double_quotes,
    strip_trailing_commas,
    quote_bare_values,
    unquote_numeric_values,
    normalize_arrays,
];

const PREVIEW_CHARS: usize = 160;

enum Expectation<'a> {
    Any,
    Keys(&'a [&'a str]),
    Schema(&'a JSONSchema),
}

impl Expectation<'_> {
    fn accepts(&self, value: &Value) -> bool {
        let Some(object) = value.as_object() else {
            return false;
        };
        match self {
            Self::Any => true,
            Self::Keys(keys) => keys.is_empty() || keys.iter().any(|key| object.contains_key(*key)),
            Self::Schema(schema) => schema.is_valid(value),
        }
    }
}

pub fn extract_structured(text: &str) -> Option<Value> {
    extract_with(text, &Expectation::Any)
}

/// Like [`extract_structured`], but a candidate is only accepted when it has
/// at least one of `expected_keys` at the top level.
pub fn extract_structured_with_keys(text: &str, expected_keys: &[&str]) -> Option<Value> {
    extract_with(text, &Expectation::Keys(expected_keys))
}

/// Like [`extract_structured`], but a candidate must validate against
/// `schema`. An uncompilable schema yields `None`.
pub fn extract_structured_with_schema(text: &str, schema: &Value) -> Option<Value> {
    let compiled = match JSONSchema::compile(schema) {
        Ok(compiled) => compiled,
        Err(error) => {
            warn!(%error, "invalid JSON schema for structured extraction");
            return None;
        }
    };
    extract_with(text, &Expectation::Schema(&compiled))
}

pub fn extract_as<T: DeserializeOwned>(text: &str) -> Option<T> {
    let value = extract_structured(text)?;
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            debug!(%error, "recovered object does not match the requested type");
            None
        }
    }
}

fn extract_with(text: &str, expectation: &Expectation<'_>) -> Option<Value> {
    if let Some(value) = parse_accepted(text.trim(), expectation) {
        return Some(value);
    }

    for (name, extractor) in CANDIDATE_EXTRACTORS {
        for candidate in extractor(text) {
            if let Some(value) = parse_accepted(&candidate, expectation) {
                debug!(extractor = name, "recovered object from raw candidate");
                return Some(value);
            }
            let sanitized = sanitize(&candidate);
            if let Some(value) = parse_accepted(&sanitized, expectation) {
                debug!(extractor = name, "recovered object from sanitized candidate");
                return Some(value);
            }
        }
    }

    warn!(
        preview = %text.chars().take(PREVIEW_CHARS).collect::<String>(),
        "no structured data could be recovered"
    );
    None
}

fn parse_accepted(text: &str, expectation: &Expectation<'_>) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(|value| expectation.accepts(value))
}

/// Applies every repair in order.
pub fn sanitize(candidate: &str) -> String {
    SANITIZERS
        .iter()
        .fold(candidate.trim().to_string(), |text, sanitizer| sanitizer(&text))
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap_or_else(|error| panic!("invalid pattern {pattern}: {error}")))
}

fn flat_object_candidates(text: &str) -> Vec<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    regex(&PATTERN, r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}")
        .find_iter(text)
        .map(|found| found.as_str().to_string())
        .collect()
}

fn brace_span_candidates(text: &str) -> Vec<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    regex(&PATTERN, r"(?s)\{.*\}")
        .find(text)
        .map(|found| vec![found.as_str().to_string()])
        .unwrap_or_default()
}

fn json_fence_candidates(text: &str) -> Vec<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    fenced(regex(&PATTERN, r"(?is)```json[ \t]*\r?\n?(.*?)```"), text)
}

fn any_fence_candidates(text: &str) -> Vec<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    fenced(regex(&PATTERN, r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n?(.*?)```"), text)
}

fn fenced(pattern: &Regex, text: &str) -> Vec<String> {
    pattern
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .map(|body| body.as_str().trim().to_string())
        .filter(|body| !body.is_empty())
        .collect()
}

/// `{name: 1}` -> `{"name": 1}`
pub fn quote_bare_keys(text: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = regex(&PATTERN, r"([{,]\s*)([A-Za-z_$][A-Za-z0-9_$]*)(\s*:)");
    rewrite_outside_strings(text, |segment| {
        pattern
            .replace_all(segment, r#"${1}"${2}"${3}"#)
            .into_owned()
    })
}

/// Applies `rewrite` to the text between string literals only. Both quote
/// styles open a literal; an unterminated literal runs to the end of `text`
/// and is copied unchanged.
fn rewrite_outside_strings(text: &str, rewrite: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut segment_start = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (index, c) in text.char_indices() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(open) if c == open => {
                out.push_str(&text[segment_start..=index]);
                segment_start = index + 1;
                quote = None;
            }
            Some(_) => {}
            None if c == '"' || c == '\'' => {
                out.push_str(&rewrite(&text[segment_start..index]));
                segment_start = index;
                quote = Some(c);
            }
            None => {}
        }
    }

    let rest = &text[segment_start..];
    if quote.is_some() {
        out.push_str(rest);
    } else {
        out.push_str(&rewrite(rest));
    }
    out
}

/// Rewrites single-quoted strings as double-quoted ones. Apostrophes inside
/// double-quoted strings are left alone; double quotes inside single-quoted
/// strings are escaped.
pub fn single_to_double_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_double = false;
    let mut in_single = false;
    let mut escaped = false;

    for c in text.chars() {
        if escaped {
            if in_single && c == '\'' {
                out.push('\'');
            } else {
                out.push('\\');
                out.push(c);
            }
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_double || in_single => escaped = true,
            '"' if in_single => out.push_str("\\\""),
            '"' => {
                in_double = !in_double;
                out.push('"');
            }
            '\'' if in_double => out.push('\''),
            '\'' => {
                in_single = !in_single;
                out.push('"');
            }
            _ => out.push(c),
        }
    }
    if escaped {
        out.push('\\');
    }
    out
}

pub fn strip_trailing_commas(text: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    regex(&PATTERN, r",(\s*[}\]])")
        .replace_all(text, "${1}")
        .into_owned()
}

/// `{"status": active}` -> `{"status": "active"}`; `true`, `false` and `null`
/// are kept bare.
pub fn quote_bare_values(text: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = regex(&PATTERN, r"(:\s*)([A-Za-z_][A-Za-z0-9_ .\-]*?)(\s*[,}\]])");
    rewrite_outside_strings(text, |segment| {
        pattern
            .replace_all(segment, |captures: &Captures<'_>| {
                let word = &captures[2];
                if matches!(word, "true" | "false" | "null") {
                    captures[0].to_string()
                } else {
                    format!("{}\"{}\"{}", &captures[1], word, &captures[3])
                }
            })
            .into_owned()
    })
}

/// `{"count": "3"}` -> `{"count": 3}`
pub fn unquote_numeric_values(text: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    regex(
        &PATTERN,
        r#"(:\s*)"(-?(?:0|[1-9]\d*)(?:\.\d+)?(?:[eE][+-]?\d+)?)"(\s*[,}\]])"#,
    )
    .replace_all(text, "${1}${2}${3}")
    .into_owned()
}

/// Re-emits the contents of every flat array element by element: elements
/// are split on commas outside quotes, already-valid literals are kept and
/// everything else is quoted.
pub fn normalize_arrays(text: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    regex(&PATTERN, r"\[([^\[\]{}]*)\]")
        .replace_all(text, |captures: &Captures<'_>| {
            let elements = split_top_level(&captures[1])
                .into_iter()
                .map(|element| normalize_array_element(&element))
                .collect::<Vec<_>>();
            format!("[{}]", elements.join(","))
        })
        .into_owned()
}

fn split_top_level(content: &str) -> Vec<String> {
    let mut elements = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in content.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_string = !in_string;
                current.push(c);
            }
            ',' if !in_string => elements.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    elements.push(current);

    elements
        .into_iter()
        .map(|element| element.trim().to_string())
        .filter(|element| !element.is_empty())
        .collect()
}

fn normalize_array_element(element: &str) -> String {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let is_quoted = element.len() >= 2 && element.starts_with('"') && element.ends_with('"');
    let is_literal = matches!(element, "true" | "false" | "null")
        || regex(&NUMBER, r"^-?(?:0|[1-9]\d*)(?:\.\d+)?(?:[eE][+-]?\d+)?$").is_match(element);
    if is_quoted || is_literal {
        return element.to_string();
    }
    let unquoted = element.trim_matches('"');
    Value::String(unquoted.to_string()).to_string()
}
