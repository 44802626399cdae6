//! Optional LLM rewrite of a message body.
//!
//! Never blocks forwarding: with no provider configured, or on any
//! failure, the message passes through unchanged.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channels::email_types::{ParsedMessage, escape_html, strip_html};
use crate::error::TransformError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};

const TEMPERATURE: f32 = 0.3;

pub struct ContentTransformer {
    provider: Option<Arc<dyn LlmProvider>>,
    prompt: String,
    timeout: Duration,
}

impl ContentTransformer {
    pub fn new(provider: Option<Arc<dyn LlmProvider>>, prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            provider,
            prompt: prompt.into(),
            timeout,
        }
    }

    /// A transformer that never calls out.
    pub fn passthrough() -> Self {
        Self::new(None, String::new(), Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Replace the body with the model's rewrite, or return `message` as is.
    pub async fn transform(&self, mut message: ParsedMessage) -> ParsedMessage {
        let Some(provider) = &self.provider else {
            return message;
        };

        let input = if message.body_text.trim().is_empty() {
            strip_html(&message.body_html)
        } else {
            message.body_text.clone()
        };
        if input.trim().is_empty() {
            debug!(uid = ?message.uid, "Empty body, skipping rewrite");
            return message;
        }

        match self.rewrite(provider.as_ref(), &input).await {
            Ok(output) => {
                info!(uid = ?message.uid, model = provider.model_name(), "Body rewritten");
                message.body_html = format!("<pre>{}</pre>", escape_html(&output));
                message.body_text = output;
            }
            Err(e) => {
                warn!(uid = ?message.uid, stage = "transform", "Rewrite failed, forwarding original body: {e}");
            }
        }
        message
    }

    async fn rewrite(&self, provider: &dyn LlmProvider, input: &str) -> Result<String, TransformError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.prompt.clone()),
            ChatMessage::user(input),
        ])
        .with_temperature(TEMPERATURE);

        let response = tokio::time::timeout(self.timeout, provider.complete(request))
            .await
            .map_err(|_| TransformError::Timeout(self.timeout))??;

        let output = response.content.trim();
        if output.is_empty() {
            return Err(TransformError::EmptyResponse);
        }
        Ok(output.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, FinishReason};

    enum Reply {
        Text(&'static str),
        Fail,
        Hang,
    }

    struct ScriptedLlm {
        reply: Reply,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let user = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            self.seen.lock().unwrap().push(user);
            match self.reply {
                Reply::Text(text) => Ok(CompletionResponse {
                    content: text.to_string(),
                    input_tokens: 1,
                    output_tokens: 1,
                    finish_reason: FinishReason::Stop,
                }),
                Reply::Fail => Err(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason: "boom".into(),
                }),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
            }
        }
    }

    fn message(text: &str, html: &str) -> ParsedMessage {
        ParsedMessage {
            subject: "Weekly report".into(),
            body_text: text.into(),
            body_html: html.into(),
            ..Default::default()
        }
    }

    fn transformer(llm: Arc<ScriptedLlm>, timeout: Duration) -> ContentTransformer {
        ContentTransformer::new(Some(llm as Arc<dyn LlmProvider>), "summarize", timeout)
    }

    #[tokio::test]
    async fn passthrough_without_provider() {
        let t = ContentTransformer::passthrough();
        assert!(!t.is_enabled());
        let out = t.transform(message("hello", "<p>hello</p>")).await;
        assert_eq!(out.body_text, "hello");
        assert_eq!(out.body_html, "<p>hello</p>");
    }

    #[tokio::test]
    async fn success_replaces_both_bodies() {
        let llm = ScriptedLlm::new(Reply::Text("  summary <text>  "));
        let out = transformer(llm, Duration::from_secs(5))
            .transform(message("long body", "<p>long body</p>"))
            .await;
        assert_eq!(out.body_text, "summary <text>");
        assert_eq!(out.body_html, "<pre>summary &lt;text&gt;</pre>");
        assert_eq!(out.subject, "Weekly report");
    }

    #[tokio::test]
    async fn html_only_is_stripped_for_input() {
        let llm = ScriptedLlm::new(Reply::Text("ok"));
        transformer(Arc::clone(&llm), Duration::from_secs(5))
            .transform(message("", "<div><b>Bold</b> news</div>"))
            .await;
        assert_eq!(llm.seen.lock().unwrap().as_slice(), ["Bold news"]);
    }

    #[tokio::test]
    async fn empty_body_skips_call() {
        let llm = ScriptedLlm::new(Reply::Text("never"));
        let out = transformer(Arc::clone(&llm), Duration::from_secs(5))
            .transform(message("", ""))
            .await;
        assert!(llm.seen.lock().unwrap().is_empty());
        assert_eq!(out.body_text, "");
    }

    #[tokio::test]
    async fn failure_passes_through() {
        let llm = ScriptedLlm::new(Reply::Fail);
        let out = transformer(llm, Duration::from_secs(5))
            .transform(message("original", ""))
            .await;
        assert_eq!(out.body_text, "original");
        assert_eq!(out.body_html, "");
    }

    #[tokio::test]
    async fn empty_output_passes_through() {
        let llm = ScriptedLlm::new(Reply::Text("   "));
        let out = transformer(llm, Duration::from_secs(5))
            .transform(message("original", ""))
            .await;
        assert_eq!(out.body_text, "original");
    }

    #[tokio::test]
    async fn timeout_passes_through() {
        let llm = ScriptedLlm::new(Reply::Hang);
        let out = transformer(llm, Duration::from_millis(50))
            .transform(message("original", "<p>original</p>"))
            .await;
        assert_eq!(out.body_text, "original");
        assert_eq!(out.body_html, "<p>original</p>");
    }
}
