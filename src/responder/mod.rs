//! Reply generation boundary.
//!
//! The pipeline hands over the extracted message plus the thread history and
//! gets back reply text. [`LlmResponder`] drives an Anthropic model through
//! rig-core; tests substitute their own [`Responder`].

use std::sync::Arc;

use async_trait::async_trait;
use rig::agent::Agent;
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, Prompt};
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ConfigError, ResponderError};
use crate::ingest::ExtractedEmail;

/// Sender recorded on replies stored in a conversation.
pub const REPLY_SENDER: &str = "assistant@inbound.local";

const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

const DEFAULT_SYSTEM_PROMPT: &str = "You answer inbound email on behalf of the mailbox owner. \
Reply in plain text, in the language of the sender, without a subject line or signature block. \
Be brief and address only what the latest message asks.";

/// Composes replies to inbound email.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Reply text for `email`, given the earlier messages of its thread
    /// (oldest first, `email` itself excluded).
    async fn generate_reply(
        &self,
        email: &ExtractedEmail,
        history: &[ExtractedEmail],
    ) -> Result<String, ResponderError>;
}

/// LLM responder settings.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub api_key: SecretString,
    pub model: String,
    pub system_prompt: String,
}

impl ResponderConfig {
    /// Read `ANTHROPIC_API_KEY`, `INBOUND_MODEL`, `INBOUND_SYSTEM_PROMPT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()))?;

        Ok(Self {
            api_key: SecretString::from(api_key),
            model: std::env::var("INBOUND_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            system_prompt: std::env::var("INBOUND_SYSTEM_PROMPT")
                .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string()),
        })
    }
}

/// Create the Anthropic-backed responder.
pub fn create_responder(config: &ResponderConfig) -> Result<Arc<dyn Responder>, ResponderError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            ResponderError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {e}"),
            }
        })?;

    let agent = client
        .agent(&config.model)
        .preamble(&config.system_prompt)
        .max_tokens(1024)
        .build();

    tracing::info!("Using Anthropic responder (model: {})", config.model);
    Ok(Arc::new(LlmResponder::new(agent, &config.model)))
}

/// Responder backed by a rig agent.
pub struct LlmResponder<M: CompletionModel> {
    agent: Agent<M>,
    model: String,
}

impl<M: CompletionModel> LlmResponder<M> {
    pub fn new(agent: Agent<M>, model: &str) -> Self {
        Self {
            agent,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl<M> Responder for LlmResponder<M>
where
    M: CompletionModel + 'static,
{
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate_reply(
        &self,
        email: &ExtractedEmail,
        history: &[ExtractedEmail],
    ) -> Result<String, ResponderError> {
        let prompt = build_prompt(email, history);
        let reply = self
            .agent
            .prompt(prompt)
            .await
            .map_err(|e| ResponderError::RequestFailed {
                provider: self.model.clone(),
                reason: e.to_string(),
            })?;

        let reply = reply.trim();
        if reply.is_empty() {
            return Err(ResponderError::EmptyReply {
                provider: self.model.clone(),
            });
        }
        Ok(reply.to_string())
    }
}

/// Render the thread and the new message into a single prompt.
pub fn build_prompt(email: &ExtractedEmail, history: &[ExtractedEmail]) -> String {
    let mut prompt = String::new();

    if !history.is_empty() {
        prompt.push_str("Earlier messages in this conversation, oldest first:\n\n");
        for (i, earlier) in history.iter().enumerate() {
            prompt.push_str(&format!("[{}] ", i + 1));
            render(&mut prompt, earlier);
            prompt.push_str("\n---\n\n");
        }
    }

    prompt.push_str("New message:\n\n");
    render(&mut prompt, email);
    prompt.push_str("\nWrite the reply to the new message.");
    prompt
}

fn render(out: &mut String, email: &ExtractedEmail) {
    out.push_str(&format!("From: {}\nSubject: {}\n\n", email.sender, email.subject));
    if email.body.is_empty() {
        out.push_str("(empty body)\n");
    } else {
        out.push_str(&email.body);
        out.push('\n');
    }
}

/// `Re:`-prefixed subject for a stored reply.
pub fn reply_subject(subject: &str) -> String {
    if subject.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}
