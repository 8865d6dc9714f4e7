use tracing::{Span, info_span};

/// Correlation context attached to every log line of an agent flow.
///
/// Entered as a tracing span around each request handler; the guard
/// restores the previous context on every exit path.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub run_id: String,
    pub agent: &'static str,
    pub flow_id: String,
}

impl AgentContext {
    pub fn new(run_id: impl Into<String>, agent: &'static str, flow_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            agent,
            flow_id: flow_id.into(),
        }
    }

    pub fn span(&self) -> Span {
        info_span!(
            "agent_flow",
            run_id = %self.run_id,
            agent = self.agent,
            flow_id = %self.flow_id,
        )
    }
}
