use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use steward_kernel::{IntentRow, Kernel};

use crate::autopilot::{HandlerOutcome, IntentHandler};

pub(crate) const INTENT_TYPE: &str = "analysis";

/// Computes observational content signals for an intent's payload and
/// stores them once per intent id. Strictly read-only with respect to the
/// analysed entity; re-running the same intent is a silent success.
pub(crate) struct AnalysisHandler {
    kernel: Kernel,
}

impl AnalysisHandler {
    pub fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }
}

#[async_trait]
impl IntentHandler for AnalysisHandler {
    async fn execute(&self, intent: &IntentRow) -> Result<HandlerOutcome> {
        let content = intent
            .payload
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let signals = compute_signals(content);
        let stored = self
            .kernel
            .insert_analysis_signals_async(&intent.id, &signals)
            .await?;
        let message = if stored {
            "signals stored"
        } else {
            "signals already recorded"
        };
        Ok(HandlerOutcome::ok_with(message, signals))
    }
}

fn compute_signals(content: &str) -> Value {
    let word_count = content.split_whitespace().count();
    let heading_count = content
        .lines()
        .filter(|l| l.trim_start().starts_with('#'))
        .count();
    // markdown links; "](http" marks the external subset
    let link_count = content.matches("](").count();
    let external_links = content.matches("](http").count();
    let internal_links = link_count.saturating_sub(external_links);
    let link_density = if word_count == 0 {
        0.0
    } else {
        link_count as f64 * 100.0 / word_count as f64
    };
    json!({
        "word_count": word_count,
        "heading_count": heading_count,
        "link_count": link_count,
        "internal_links": internal_links,
        "external_links": external_links,
        "links_per_100_words": link_density,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# Title\n\nSome intro text with a [guide](/docs/guide) link.\n\n## Section\n\nMore words and an [external](https://example.com) reference.\n";

    #[test]
    fn signals_count_words_headings_and_links() {
        let signals = compute_signals(SAMPLE);
        assert_eq!(signals["heading_count"], 2);
        assert_eq!(signals["link_count"], 2);
        assert_eq!(signals["internal_links"], 1);
        assert_eq!(signals["external_links"], 1);
        assert!(signals["word_count"].as_u64().unwrap() > 10);
    }

    #[test]
    fn empty_content_yields_zeroes() {
        let signals = compute_signals("");
        assert_eq!(signals["word_count"], 0);
        assert_eq!(signals["links_per_100_words"], 0.0);
    }

    #[tokio::test]
    async fn rerunning_the_same_intent_is_a_silent_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        let handler = AnalysisHandler::new(kernel.clone());

        let id = kernel
            .insert_intent("dec-1", INTENT_TYPE, &json!({"content": SAMPLE}))
            .unwrap();
        let intent = kernel.claim_next_intent(INTENT_TYPE, "w-test").unwrap().unwrap();
        assert_eq!(intent.id, id);

        let first = handler.execute(&intent).await.unwrap();
        assert!(first.success);
        assert_eq!(first.message, "signals stored");

        let second = handler.execute(&intent).await.unwrap();
        assert!(second.success);
        assert_eq!(second.message, "signals already recorded");

        // The original signals survived the rerun.
        let stored = kernel.get_analysis_signals(&id).unwrap().unwrap();
        assert_eq!(stored["heading_count"], 2);
    }
}
