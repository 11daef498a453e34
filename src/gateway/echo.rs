//! Echo backend for demos and smoke tests.
//!
//! Answers every prompt with `"[model] <prompt>"` after a simulated delay,
//! so the whole engine runs without network access or keys.

use async_trait::async_trait;
use std::time::Duration;

use super::{estimate_tokens, BackendError, BackendRequest, Generation, ProviderBackend};

/// Backend that echoes the prompt back, tagged with the model id.
#[derive(Debug, Clone)]
pub struct EchoBackend {
    /// Simulated generation delay.
    pub delay: Duration,
}

impl EchoBackend {
    /// Echo with a 10 ms delay.
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(10),
        }
    }

    /// Echo with a custom delay.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderBackend for EchoBackend {
    async fn generate(&self, request: &BackendRequest) -> Result<Generation, BackendError> {
        tokio::time::sleep(self.delay).await;
        let text = format!("[{}] {}", request.model_id, request.prompt);
        let tokens = estimate_tokens(&request.prompt, &text);
        Ok(Generation { text, tokens })
    }
}
