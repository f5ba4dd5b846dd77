use futures::{stream, StreamExt};
use serde_json::{json, Value};
use structured_delivery::{extract_items, select_array, Result};

/// Small deterministic generator so failures are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

/// Emulate a model writing `words` token by token: the tail string grows one
/// character at a time and snapshots are sometimes repeated.
fn growing_snapshots(words: &[String], rng: &mut Lcg) -> Vec<Value> {
    let mut snapshots = vec![json!({"items": []})];
    for (i, word) in words.iter().enumerate() {
        for end in 1..=word.len() {
            let mut items: Vec<Value> = words[..i].iter().map(|w| json!(w)).collect();
            items.push(json!(&word[..end]));
            let snapshot = json!({ "items": items });
            if rng.next(4) == 0 {
                snapshots.push(snapshot.clone());
            }
            snapshots.push(snapshot);
        }
    }
    snapshots
}

async fn run(snapshots: Vec<Value>) -> Vec<Value> {
    let source = stream::iter(snapshots.into_iter().map(Ok::<_, structured_delivery::PipelineError>));
    extract_items(source, select_array("/items"))
        .map(|item: Result<Value>| item.unwrap())
        .collect()
        .await
}

#[tokio::test]
async fn every_final_item_is_released_exactly_once_in_order() {
    let mut rng = Lcg(7);
    for case in 0..50 {
        let count = rng.next(8) as usize;
        let words: Vec<String> = (0..count)
            .map(|i| format!("w{case}-{i}-{}", "x".repeat(rng.next(5) as usize)))
            .collect();

        let released = run(growing_snapshots(&words, &mut rng)).await;
        let expected: Vec<Value> = words.iter().map(|w| json!(w)).collect();
        assert_eq!(released, expected, "case {case}");
    }
}

#[tokio::test]
async fn released_items_never_include_a_partial_tail() {
    let words = vec!["Fractions".to_string(), "Decimals".to_string()];
    let snapshots = growing_snapshots(&words, &mut Lcg(1));

    // Cut the stream while "Decimals" is still being written.
    let cut = snapshots
        .iter()
        .position(|s| s["items"].as_array().map_or(0, Vec::len) == 2)
        .unwrap();
    let mut truncated = snapshots[..=cut].to_vec();
    truncated.push(json!({"items": ["Fractions", "Dec"]}));

    let mut source: Vec<Result<Value>> = truncated.into_iter().map(Ok).collect();
    source.push(Err(structured_delivery::PipelineError::Stream("closed".into())));

    let results: Vec<Result<Value>> = extract_items(stream::iter(source), select_array("/items"))
        .collect()
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap(), &json!("Fractions"));
    assert!(results[1].is_err());
}
