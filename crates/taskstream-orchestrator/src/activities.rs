use std::sync::Arc;
use std::time::Duration;

use taskstream_core::{
    Agent, AgentError, AgentOutput, AgentRequest, BroadcastReport, Normalizer, NormalizedUpdate,
    PublishError, ServerConfig, UpdatePublisher,
};
use taskstream_types::Update;
use taskstream_wire::Envelope;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Side effects a workflow performs: live publishing and agent calls.
pub struct Activities {
    publisher: Arc<dyn UpdatePublisher>,
    agent: Arc<dyn Agent>,
    normalizer: Normalizer,
    retry: RetryPolicy,
    agent_timeout: Duration,
}

impl Activities {
    pub fn new(publisher: Arc<dyn UpdatePublisher>, agent: Arc<dyn Agent>) -> Self {
        Self {
            publisher,
            agent,
            normalizer: Normalizer::new(),
            retry: RetryPolicy::default(),
            agent_timeout: Duration::from_secs(600),
        }
    }

    pub fn from_config(
        publisher: Arc<dyn UpdatePublisher>,
        agent: Arc<dyn Agent>,
        config: &ServerConfig,
    ) -> Self {
        Self::new(publisher, agent)
            .with_retry(RetryPolicy {
                max_attempts: config.publish_max_attempts,
                backoff: config.publish_backoff(),
            })
            .with_agent_timeout(config.agent_timeout())
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            backoff: retry.backoff,
        };
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// One delivery attempt of a logged update.
    pub async fn publish(&self, update: &Update) -> Result<BroadcastReport, PublishError> {
        self.publisher.publish(&Envelope::from_update(update)).await
    }

    pub fn normalize(&self, raw: &str) -> Vec<NormalizedUpdate> {
        self.normalizer.normalize(raw)
    }

    /// Starts the agent call bounded by the turn timeout. Raw messages arrive
    /// on the returned receiver while the returned future is polled.
    pub fn generate_code(
        &self,
        request: AgentRequest,
    ) -> (
        impl std::future::Future<Output = Result<AgentOutput, AgentError>> + Send + 'static,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = self.agent.clone();
        let timeout = self.agent_timeout;
        let call = async move {
            match tokio::time::timeout(timeout, agent.generate_code(request, tx)).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::Timeout),
            }
        };
        (call, rx)
    }
}
