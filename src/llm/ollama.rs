use crate::llm::client::{split_host_port, LLMChunk, LLMClient, LLMResponse, LLMStream};
use crate::types::{AppError, Result, TokenUsage};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use ollama_rs::{
    generation::chat::{request::ChatMessageRequest, ChatMessage, ChatMessageResponse},
    Ollama,
};

const DEFAULT_PORT: u16 = 11434;

pub struct OllamaClient {
    client: Ollama,
    model: String,
}

impl OllamaClient {
    pub async fn new(base_url: String, model: String) -> Result<Self> {
        let (host, port) = split_host_port(&base_url, DEFAULT_PORT);
        tracing::debug!(%host, port, %model, "creating Ollama client");
        let client = Ollama::new(host, port);

        Ok(Self { client, model })
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<LLMResponse> {
        let request = ChatMessageRequest::new(self.model.clone(), messages);

        let response = self
            .client
            .send_chat_messages(request)
            .await
            .map_err(|e| AppError::LLM(format!("Ollama error: {}", e)))?;

        let usage = usage_of(&response);
        Ok(LLMResponse::new(response.message.content, usage))
    }
}

fn to_chat_messages(messages: &[(String, String)]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|(role, content)| match role.as_str() {
            "system" => ChatMessage::system(content.clone()),
            "assistant" => ChatMessage::assistant(content.clone()),
            _ => ChatMessage::user(content.clone()),
        })
        .collect()
}

/// Token counts are only present on the final response of a chat.
fn usage_of(response: &ChatMessageResponse) -> TokenUsage {
    response
        .final_data
        .as_ref()
        .map(|data| TokenUsage::new(data.prompt_eval_count as u64, data.eval_count as u64))
        .unwrap_or_default()
}

#[async_trait]
impl LLMClient for OllamaClient {
    async fn generate_with_system(&self, system: &str, prompt: &str) -> Result<LLMResponse> {
        self.chat(vec![
            ChatMessage::system(system.to_string()),
            ChatMessage::user(prompt.to_string()),
        ])
        .await
    }

    async fn generate_with_history(&self, messages: &[(String, String)]) -> Result<LLMResponse> {
        self.chat(to_chat_messages(messages)).await
    }

    async fn stream_with_history(&self, messages: &[(String, String)]) -> Result<LLMStream> {
        let request = ChatMessageRequest::new(self.model.clone(), to_chat_messages(messages));

        let mut stream_response = self
            .client
            .send_chat_messages_stream(request)
            .await
            .map_err(|e| AppError::LLM(format!("Ollama stream error: {}", e)))?;

        let output_stream = stream! {
            while let Some(chunk_result) = stream_response.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        let usage = usage_of(&chunk);
                        let content = chunk.message.content;
                        if !content.is_empty() {
                            yield Ok(LLMChunk::Text(content));
                        }
                        if !usage.is_zero() {
                            yield Ok(LLMChunk::Usage(usage));
                        }
                    }
                    Err(_) => {
                        yield Err(AppError::LLM("Stream chunk error".to_string()));
                        break;
                    }
                }
            }
        };

        Ok(output_stream.boxed())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_map_to_chat_messages() {
        let messages = to_chat_messages(&[
            ("system".to_string(), "be brief".to_string()),
            ("user".to_string(), "hi".to_string()),
            ("assistant".to_string(), "hello".to_string()),
            ("tool".to_string(), "ignored role".to_string()),
        ]);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content, "be brief");
        assert_eq!(messages[3].content, "ignored role");
    }

    #[tokio::test]
    async fn test_client_keeps_model_name() {
        let client = OllamaClient::new("http://localhost:11434".to_string(), "llama3.2".to_string())
            .await
            .unwrap();
        assert_eq!(client.model_name(), "llama3.2");
    }
}
