//! Partial JSON snapshots from streamed model text.
//!
//! Providers that stream raw text deltas use [`snapshot_stream`] to turn them into the
//! growing partial objects the extractor consumes.

use futures::{stream, Stream, StreamExt};
use serde_json::Value;
use tracing::trace;

use crate::{error::Result, provider::SnapshotStream};

#[derive(Debug, Clone, Copy)]
enum Frame {
    Object { expect_key: bool },
    Array,
}

fn closers(stack: &[Frame]) -> String {
    stack
        .iter()
        .rev()
        .map(|frame| match frame {
            Frame::Object { .. } => '}',
            Frame::Array => ']',
        })
        .collect()
}

/// Parse the largest valid interpretation of an incomplete JSON document.
///
/// Open strings and containers are closed. Dangling keys, separators and scalars that
/// may still grow (`12`, `tru`) are dropped. Text before the first `{` or `[` (such
/// as an opening Markdown fence) is ignored. Returns `None` if nothing usable has
/// arrived yet.
pub fn parse_partial_json(text: &str) -> Option<Value> {
    let start = text.find(['{', '['])?;
    let body = &text[start..];

    let mut stack: Vec<Frame> = Vec::new();
    // Prefix length plus the suffix that closes it validly.
    let mut safe: Option<(usize, String)> = None;
    let mut in_string = false;
    let mut string_is_key = false;
    let mut escaped = false;
    let mut in_scalar = false;

    for (i, c) in body.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                if !string_is_key {
                    safe = Some((i + 1, closers(&stack)));
                }
            }
            continue;
        }

        if in_scalar {
            if c.is_whitespace() || matches!(c, ',' | '}' | ']') {
                in_scalar = false;
                safe = Some((i, closers(&stack)));
            } else {
                continue;
            }
        }

        match c {
            '{' => {
                stack.push(Frame::Object { expect_key: true });
                safe = Some((i + 1, closers(&stack)));
            }
            '[' => {
                stack.push(Frame::Array);
                safe = Some((i + 1, closers(&stack)));
            }
            '}' | ']' => {
                stack.pop();
                safe = Some((i + 1, closers(&stack)));
                if stack.is_empty() {
                    break;
                }
            }
            '"' => {
                in_string = true;
                string_is_key = matches!(stack.last(), Some(Frame::Object { expect_key: true }));
                if let Some(Frame::Object { expect_key }) = stack.last_mut() {
                    *expect_key = false;
                }
            }
            ',' => {
                if let Some(Frame::Object { expect_key }) = stack.last_mut() {
                    *expect_key = true;
                }
            }
            ':' => {}
            c if c.is_whitespace() => {}
            _ => in_scalar = true,
        }
    }

    if in_string && !string_is_key {
        let mut open = body.to_string();
        if escaped {
            open.pop();
        }
        trim_partial_unicode_escape(&mut open);
        open.push('"');
        open.push_str(&closers(&stack));
        if let Ok(value) = serde_json::from_str(&open) {
            return Some(value);
        }
    }

    let (len, suffix) = safe?;
    let candidate = format!("{}{}", &body[..len], suffix);
    serde_json::from_str(&candidate).ok()
}

/// Drop a trailing `\u` escape that has fewer than four hex digits.
fn trim_partial_unicode_escape(open: &mut String) {
    if let Some(pos) = open.rfind("\\u") {
        let digits = &open[pos + 2..];
        if digits.len() < 4 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
            open.truncate(pos);
        }
    }
}

/// Turn a stream of text deltas into a stream of partial snapshots.
///
/// A snapshot is emitted only when the parsed value differs from the previous one.
/// Errors from the delta stream are forwarded and end the stream.
pub fn snapshot_stream<S>(deltas: S) -> SnapshotStream
where
    S: Stream<Item = Result<String>> + Send + 'static,
{
    struct State<S> {
        deltas: std::pin::Pin<Box<S>>,
        buffer: String,
        last: Option<Value>,
        done: bool,
    }

    let state = State {
        deltas: Box::pin(deltas),
        buffer: String::new(),
        last: None,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        while let Some(delta) = state.deltas.next().await {
            let delta = match delta {
                Ok(d) => d,
                Err(e) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
            };
            state.buffer.push_str(&delta);
            trace!(buffered = state.buffer.len(), "Partial JSON delta");

            if let Some(snapshot) = parse_partial_json(&state.buffer) {
                if state.last.as_ref() != Some(&snapshot) {
                    state.last = Some(snapshot.clone());
                    return Some((Ok(snapshot), state));
                }
            }
        }
        None
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn closes_open_containers_and_strings() {
        assert_eq!(parse_partial_json("{"), Some(json!({})));
        assert_eq!(
            parse_partial_json(r#"{"items": ["alpha", "be"#),
            Some(json!({"items": ["alpha", "be"]}))
        );
        assert_eq!(
            parse_partial_json(r#"{"items": [{"title": "A"}, {"ti"#),
            Some(json!({"items": [{"title": "A"}, {}]}))
        );
    }

    #[test]
    fn drops_dangling_keys_and_scalars() {
        assert_eq!(
            parse_partial_json(r#"{"a": 1, "b":"#),
            Some(json!({"a": 1}))
        );
        assert_eq!(parse_partial_json(r#"{"a": 12"#), Some(json!({})));
        assert_eq!(
            parse_partial_json(r#"{"ok": tru"#),
            Some(json!({}))
        );
        assert_eq!(
            parse_partial_json(r#"{"n": [1, 2, 3"#),
            Some(json!({"n": [1, 2]}))
        );
    }

    #[test]
    fn handles_escapes_and_fences() {
        assert_eq!(
            parse_partial_json("```json\n{\"q\": \"say \\\"hi"),
            Some(json!({"q": "say \"hi"}))
        );
        assert_eq!(
            parse_partial_json(r#"{"q": "x\"#),
            Some(json!({"q": "x"}))
        );
        assert_eq!(
            parse_partial_json(r#"{"q": "caf\u00"#),
            Some(json!({"q": "caf"}))
        );
        assert_eq!(parse_partial_json("Thinking..."), None);
    }

    #[test]
    fn complete_document_ignores_trailing_text() {
        assert_eq!(
            parse_partial_json("{\"a\": [1]}\n```"),
            Some(json!({"a": [1]}))
        );
    }

    #[tokio::test]
    async fn snapshot_stream_emits_only_changes() {
        let deltas = stream::iter(
            ["{\"arr\": [", "\"a\"", ", ", "\"b\"", "]}"]
                .into_iter()
                .map(|s| Ok(s.to_string())),
        );
        let snapshots: Vec<Value> = snapshot_stream(deltas)
            .map(|s| s.unwrap())
            .collect()
            .await;

        assert_eq!(
            snapshots,
            vec![
                json!({"arr": []}),
                json!({"arr": ["a"]}),
                json!({"arr": ["a", "b"]}),
            ]
        );
    }
}
