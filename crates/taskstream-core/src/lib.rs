pub mod agent;
pub mod config;
pub mod hub;
pub mod normalizer;
pub mod transport;

pub use agent::{
    Agent, AgentError, AgentOutput, AgentRequest, CommandAgent, Credentials, HistoryEntry,
    ScriptedAgent, UpdateSink,
};
pub use config::{default_state_dir, AgentConfig, ConfigError, ConflictPolicy, ServerConfig};
pub use hub::{BroadcastHub, BroadcastReport, OutputSink, PublishError, SinkError, UpdatePublisher};
pub use normalizer::{NormalizedUpdate, Normalizer, UpdateCategory};
pub use transport::{Subscription, Transport, TransportFrame};
