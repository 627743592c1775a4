//! Text-completion collaborator.
//!
//! Code generation and model-assisted test cases only need "prompt in, text
//! out", so the seam is a single-method trait. [`ChatCompletionsClient`]
//! implements it against any OpenAI-compatible chat completions endpoint.

mod chat;
mod error;

pub use chat::ChatCompletionsClient;
pub use error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};

use async_trait::async_trait;

/// Something that turns a prompt into free text.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Complete `prompt` under the given system instructions.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replays canned responses in order, recording every prompt it saw.
    #[derive(Default)]
    pub struct ScriptedClient {
        responses: Mutex<VecDeque<Result<String, LlmError>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        pub fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(&self, _system: &str, prompt: &str) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::empty_completion("script exhausted".to_string())))
        }
    }
}
