use std::{sync::Arc, time::Duration};

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
        ResponseFormat, ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::AppError;

/// A single-turn chat prompt, optionally constrained to a JSON schema.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub schema: Option<JsonSchemaSpec>,
}

#[derive(Debug, Clone)]
pub struct JsonSchemaSpec {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            schema: None,
        }
    }

    pub fn with_schema(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
    ) -> Self {
        self.schema = Some(JsonSchemaSpec {
            name: name.into(),
            description: description.into(),
            schema,
        });
        self
    }
}

/// Text completion used for entity extraction, query generation and reranking.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AppError>;
}

/// Runs `complete` under a deadline, mapping expiry to [`AppError::Timeout`].
pub async fn complete_with_timeout(
    model: &dyn LanguageModel,
    request: &CompletionRequest,
    timeout: Duration,
) -> Result<String, AppError> {
    tokio::time::timeout(timeout, model.complete(request))
        .await
        .map_err(|_| AppError::Timeout(format!("llm call exceeded {}ms", timeout.as_millis())))?
}

pub struct OpenAiLanguageModel {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAiLanguageModel {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn build_request(
        &self,
        request: &CompletionRequest,
    ) -> Result<CreateChatCompletionRequest, OpenAIError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).temperature(0.0).messages([
            ChatCompletionRequestSystemMessage::from(request.system.clone()).into(),
            ChatCompletionRequestUserMessage::from(request.user.clone()).into(),
        ]);

        if let Some(spec) = &request.schema {
            args.response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: Some(spec.description.clone()),
                    name: spec.name.clone(),
                    schema: Some(spec.schema.clone()),
                    strict: Some(true),
                },
            });
        }

        args.build()
    }
}

#[async_trait]
impl LanguageModel for OpenAiLanguageModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AppError> {
        let chat_request = self.build_request(request)?;
        let response = self.client.chat().create(chat_request).await?;
        debug!(model = %self.model, "Chat completion received");
        first_choice_content(response)
    }
}

fn first_choice_content(response: CreateChatCompletionResponse) -> Result<String, AppError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| AppError::LLMParsing("No content found in LLM response".into()))
}

/// Builds the OpenAI client shared by embeddings and chat completions.
pub fn openai_client(api_key: &str, base_url: &str) -> Arc<Client<OpenAIConfig>> {
    Arc::new(Client::with_config(
        OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url),
    ))
}
