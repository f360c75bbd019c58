use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::router::Completion;

/// Direct call to an OpenAI-compatible completion API, used while the agent
/// backend is unreachable.
#[derive(Clone)]
pub struct CompletionClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl CompletionClient {
    pub fn new(
        client: reqwest::Client,
        api_url: &str,
        api_key: Option<String>,
        model: String,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            api_url: api_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            model,
            system_prompt,
            client,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn build_messages(&self, text: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if let Some(prompt) = self.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            messages.push(Message {
                role: "system".to_string(),
                content: prompt.to_string(),
            });
        }
        messages.push(Message {
            role: "user".to_string(),
            content: text.to_string(),
        });
        messages
    }
}

#[async_trait]
impl Completion for CompletionClient {
    async fn complete(&self, text: &str) -> Result<String, BridgeError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(BridgeError::fallback_not_configured());
        };

        let url = format!("{}/chat/completions", self.api_url);
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: self.build_messages(text),
            max_tokens: Some(2000),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        // Include the body so operators can see why the provider refused.
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(BridgeError::Backend(format!(
                "completion API returned {}: {}",
                status,
                body.chars().take(300).collect::<String>()
            )));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Backend(format!("unreadable completion response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| BridgeError::Backend("completion API returned no choices".to_string()))
    }
}
