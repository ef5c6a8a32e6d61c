//! OpenAI-compatible agent backend.
//!
//! One [`OpenAiAgent`] serves any backend speaking the OpenAI chat
//! completions protocol via a configurable base URL. Uses [`async_openai`]
//! for type-safe request/response handling and built-in SSE streaming.

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, ChatCompletionStreamOptions,
    CreateChatCompletionRequest,
};
use async_openai::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing_futures::Instrument;

use parley_observe::genai_attrs;

use parley_core::agent::{AgentEventStream, AgentPort};
use parley_types::agent::{AgentEvent, AgentInvocation, AgentReply};
use parley_types::conversation::MessageRole;
use parley_types::error::AgentError;
use parley_types::turn::TokenUsage;

/// Configuration for an OpenAI-compatible agent backend.
pub struct OpenAiAgentConfig {
    /// Human-readable backend name (e.g., "openai").
    pub provider_name: String,
    /// Base URL for the API (e.g., "https://api.openai.com/v1").
    pub base_url: String,
    pub api_key: SecretString,
    /// Model used when the invocation does not name one.
    pub default_model: String,
}

impl OpenAiAgentConfig {
    /// OpenAI defaults: `https://api.openai.com/v1`.
    pub fn openai(api_key: &str, default_model: &str) -> Self {
        Self {
            provider_name: "openai".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: SecretString::from(api_key),
            default_model: default_model.to_string(),
        }
    }
}

/// `AgentPort` over any OpenAI-compatible API.
///
/// # API Key Security
///
/// Does NOT derive Debug to prevent accidental exposure of the API key
/// stored inside the `async_openai::Client`.
pub struct OpenAiAgent {
    client: Client<OpenAIConfig>,
    provider_name: String,
    default_model: String,
}

impl OpenAiAgent {
    pub fn new(config: OpenAiAgentConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.api_key.expose_secret())
            .with_api_base(&config.base_url);

        Self {
            client: Client::with_config(openai_config),
            provider_name: config.provider_name,
            default_model: config.default_model,
        }
    }

    /// Build a [`CreateChatCompletionRequest`] from an [`AgentInvocation`].
    ///
    /// History messages come first in stored order, then the current user
    /// message.
    fn build_request(
        &self,
        invocation: &AgentInvocation,
        stream: bool,
    ) -> CreateChatCompletionRequest {
        let mut messages: Vec<ChatCompletionRequestMessage> =
            Vec::with_capacity(invocation.history.len() + 1);

        for msg in &invocation.history {
            messages.push(to_openai_message(msg.role, &msg.content));
        }
        messages.push(to_openai_message(MessageRole::User, &invocation.message));

        let model = if invocation.model.is_empty() {
            self.default_model.clone()
        } else {
            invocation.model.clone()
        };

        let mut req = CreateChatCompletionRequest {
            model,
            messages,
            max_completion_tokens: Some(invocation.max_output_tokens),
            temperature: Some(invocation.temperature as f32),
            ..Default::default()
        };

        if stream {
            req.stream = Some(true);
            req.stream_options = Some(ChatCompletionStreamOptions {
                include_usage: Some(true),
                include_obfuscation: None,
            });
        }

        req
    }

    /// Span with OTel GenAI semantic convention attributes for one call.
    fn invocation_span(&self, invocation: &AgentInvocation, model: &str) -> tracing::Span {
        tracing::info_span!(
            "chat",
            { genai_attrs::GEN_AI_OPERATION_NAME } = genai_attrs::OP_CHAT,
            { genai_attrs::GEN_AI_PROVIDER_NAME } = %self.provider_name,
            { genai_attrs::GEN_AI_REQUEST_MODEL } = %model,
            { genai_attrs::GEN_AI_REQUEST_TEMPERATURE } = invocation.temperature,
            { genai_attrs::GEN_AI_REQUEST_MAX_TOKENS } = invocation.max_output_tokens,
            { genai_attrs::GEN_AI_CONVERSATION_ID } = %invocation.conversation_id,
        )
    }
}

fn to_openai_message(role: MessageRole, content: &str) -> ChatCompletionRequestMessage {
    match role {
        MessageRole::System => {
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                content: ChatCompletionRequestSystemMessageContent::Text(content.to_string()),
                name: None,
            })
        }
        MessageRole::User => {
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(content.to_string()),
                name: None,
            })
        }
        MessageRole::Assistant => {
            #[allow(deprecated)]
            ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                content: Some(ChatCompletionRequestAssistantMessageContent::Text(
                    content.to_string(),
                )),
                refusal: None,
                name: None,
                audio: None,
                tool_calls: None,
                function_call: None,
            })
        }
    }
}

impl AgentPort for OpenAiAgent {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn invoke(&self, invocation: &AgentInvocation) -> Result<AgentReply, AgentError> {
        let request = self.build_request(invocation, false);
        let span = self.invocation_span(invocation, &request.model);

        async {
            let response = self
                .client
                .chat()
                .create(request)
                .await
                .map_err(map_openai_error)?;

            let content = response
                .choices
                .first()
                .and_then(|c| c.message.content.clone())
                .unwrap_or_default();

            let usage = response
                .usage
                .map(|u| TokenUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default();

            tracing::debug!(
                { genai_attrs::GEN_AI_USAGE_INPUT_TOKENS } = usage.input_tokens,
                { genai_attrs::GEN_AI_USAGE_OUTPUT_TOKENS } = usage.output_tokens,
                "agent reply received"
            );

            Ok(AgentReply {
                content,
                usage,
                model: response.model,
            })
        }
        .instrument(span)
        .await
    }

    fn invoke_streaming(&self, invocation: AgentInvocation) -> AgentEventStream {
        let request = self.build_request(&invocation, true);
        let span = self.invocation_span(&invocation, &request.model);

        // Clone the client for the 'static stream closure
        let client = self.client.clone();

        let events = async_stream::try_stream! {
            let mut stream = client
                .chat()
                .create_stream(request)
                .await
                .map_err(map_openai_error)?;

            use futures_util::StreamExt;
            while let Some(result) = stream.next().await {
                let chunk = result.map_err(|e| AgentError::Stream(e.to_string()))?;

                // The final chunk carries usage with an empty choices array
                // (requires stream_options.include_usage = true).
                if let Some(usage) = chunk.usage.as_ref() {
                    yield AgentEvent::Usage(TokenUsage {
                        input_tokens: usage.prompt_tokens,
                        output_tokens: usage.completion_tokens,
                    });
                }

                for choice in &chunk.choices {
                    if let Some(text) = choice.delta.content.clone() {
                        if !text.is_empty() {
                            yield AgentEvent::TextDelta { text };
                        }
                    }
                }
            }

            yield AgentEvent::Done;
        };

        Box::pin(events.instrument(span))
    }
}

/// Map an `async_openai::error::OpenAIError` to an [`AgentError`].
fn map_openai_error(err: async_openai::error::OpenAIError) -> AgentError {
    use async_openai::error::OpenAIError;

    match &err {
        OpenAIError::ApiError(api_err) => {
            let code = api_err.code.as_deref().unwrap_or("");
            let error_type = api_err.r#type.as_deref().unwrap_or("");

            if code == "authentication_error"
                || error_type == "authentication_error"
                || api_err.message.contains("Incorrect API key")
                || api_err.message.contains("Invalid API key")
            {
                AgentError::AuthenticationFailed
            } else if code == "rate_limit_exceeded" || error_type == "rate_limit_error" {
                AgentError::RateLimited { retry_after_ms: None }
            } else {
                AgentError::Provider { message: err.to_string() }
            }
        }
        OpenAIError::Reqwest(reqwest_err) => {
            if let Some(status) = reqwest_err.status() {
                match status.as_u16() {
                    401 => AgentError::AuthenticationFailed,
                    429 => AgentError::RateLimited { retry_after_ms: None },
                    _ => AgentError::Provider { message: err.to_string() },
                }
            } else {
                AgentError::Provider { message: err.to_string() }
            }
        }
        OpenAIError::JSONDeserialize(_, content) => {
            AgentError::Deserialization(format!("failed to parse response: {content}"))
        }
        OpenAIError::StreamError(stream_err) => AgentError::Stream(stream_err.to_string()),
        OpenAIError::InvalidArgument(msg) => AgentError::InvalidRequest(msg.clone()),
        _ => AgentError::Provider { message: err.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::agent::HistoryMessage;
    use parley_types::turn::AgentKind;
    use uuid::Uuid;

    fn invocation(history: Vec<HistoryMessage>, model: &str) -> AgentInvocation {
        AgentInvocation {
            conversation_id: Uuid::now_v7(),
            message: "current question".to_string(),
            history,
            kind: AgentKind::Master,
            model: model.to_string(),
            temperature: 0.4,
            max_output_tokens: 1024,
            context: serde_json::json!({}),
        }
    }

    #[test]
    fn test_build_request_places_history_before_message() {
        let agent = OpenAiAgent::new(OpenAiAgentConfig::openai("sk-test", "gpt-4o"));
        let history = vec![
            HistoryMessage { role: MessageRole::User, content: "earlier".to_string() },
            HistoryMessage { role: MessageRole::Assistant, content: "reply".to_string() },
        ];

        let req = agent.build_request(&invocation(history, "gpt-4o-mini"), false);
        assert_eq!(req.model, "gpt-4o-mini");
        assert_eq!(req.messages.len(), 3);
        assert!(matches!(req.messages[0], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(req.messages[1], ChatCompletionRequestMessage::Assistant(_)));
        assert!(matches!(req.messages[2], ChatCompletionRequestMessage::User(_)));
        assert_eq!(req.max_completion_tokens, Some(1024));
        assert!(req.stream.is_none());
    }

    #[test]
    fn test_build_request_falls_back_to_default_model() {
        let agent = OpenAiAgent::new(OpenAiAgentConfig::openai("sk-test", "gpt-4o"));
        let req = agent.build_request(&invocation(Vec::new(), ""), true);
        assert_eq!(req.model, "gpt-4o");
        assert_eq!(req.stream, Some(true));
        assert!(req.stream_options.is_some());
    }

    #[test]
    fn test_agent_name_from_config() {
        let agent = OpenAiAgent::new(OpenAiAgentConfig {
            provider_name: "local-proxy".to_string(),
            base_url: "http://localhost:8080/v1".to_string(),
            api_key: SecretString::from("unused"),
            default_model: "llama".to_string(),
        });
        assert_eq!(agent.name(), "local-proxy");
    }
}
