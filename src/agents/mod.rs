use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use uuid::Uuid;

pub mod error;

mod backtest;
mod context;
mod evaluator;
mod message;
mod optimizer;
mod orchestrator;
mod registry;
mod scheduler;
mod simulator;

pub use backtest::BacktestAgent;
pub use context::AgentContext;
pub use evaluator::{DEFAULT_KPIS, EvaluatorAgent};
pub use message::{
    AgentMessage, BacktestResultsResponse, BacktestStatus, BacktestStatusUpdate, ErrorResponse,
    EvaluationRequest, EvaluationResponse, OptimizationRequest, OptimizationResult, Payload,
    Recommendation, RetrieveResultsRequest, RetrieveResultsResponse, StartBacktestRequest,
    StoreResultsRequest, StoreResultsResponse,
};
pub use optimizer::OptimizerAgent;
pub use orchestrator::OrchestratorAgent;
pub use registry::RegistryAgent;
pub use scheduler::{
    CycleOutcome, SchedulerAgent, SchedulerConfig, SchedulerEvent, SchedulerState, TimeRange,
};
pub use simulator::SimulatorAgent;

use error::AgentError;

/// Min/max bounds for one named policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Policy {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Policy {
    pub fn min(value: f64) -> Self {
        Self {
            min: Some(value),
            max: None,
        }
    }

    pub fn max(value: f64) -> Self {
        Self {
            min: None,
            max: Some(value),
        }
    }

    pub fn range(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn validate(&self, value: f64) -> bool {
        if let Some(min) = self.min
            && value < min
        {
            return false;
        }
        if let Some(max) = self.max
            && value > max
        {
            return false;
        }
        true
    }
}

pub type PolicyMap = HashMap<&'static str, Policy>;

/// Identity, correlation context, policies, and lifecycle flags shared by
/// every agent.
pub struct AgentCore {
    agent_name: &'static str,
    run_id: String,
    policies: PolicyMap,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl AgentCore {
    pub fn new(agent_name: &'static str, run_id: Option<String>, policies: PolicyMap) -> Self {
        Self {
            agent_name,
            run_id: run_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            policies,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn agent_name(&self) -> &'static str {
        self.agent_name
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn context(&self, flow_id: &str) -> AgentContext {
        AgentContext::new(self.run_id.clone(), self.agent_name, flow_id)
    }

    /// Absent policies allow; present ones enforce their bounds.
    pub fn validate_policy(&self, name: &str, value: f64) -> bool {
        self.policies
            .get(name)
            .is_none_or(|policy| policy.validate(value))
    }

    /// Returns true on the first call only.
    pub fn mark_initialized(&self) -> bool {
        !self.initialized.swap(true, Ordering::SeqCst)
    }

    /// Returns true on the first call only.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn message(&self, to: impl Into<String>, flow_id: impl Into<String>, payload: Payload) -> AgentMessage {
        AgentMessage::new(self.agent_name, to, flow_id, payload)
    }

    /// Standard reply for an unsupported payload kind.
    pub fn unknown_message_reply(&self, message: &AgentMessage) -> AgentMessage {
        let error = AgentError::UnknownMessageType {
            payload_kind: message.payload.kind().to_string(),
        };
        self.message(
            message.from.clone(),
            message.flow_id.clone(),
            Payload::Error(ErrorResponse::from_error(
                &error,
                Some(self.run_id.clone()),
            )),
        )
    }

    /// Standard reply when a handler itself fails.
    pub fn handler_error_reply(&self, message: &AgentMessage, error: &AgentError) -> AgentMessage {
        self.message(
            message.from.clone(),
            message.flow_id.clone(),
            Payload::Error(ErrorResponse::from_error(error, Some(self.run_id.clone()))),
        )
    }
}

/// The agent contract: identity, idempotent lifecycle, and a message
/// handler that never raises.
#[async_trait]
pub trait Agent: Send + Sync {
    fn core(&self) -> &AgentCore;

    /// Idempotent; repeated calls are no-ops.
    async fn initialize(&self) -> error::Result<()>;

    /// Unknown payload kinds return an `UNKNOWN_MESSAGE_TYPE` error
    /// payload; handler failures return `HANDLER_ERROR`. Never panics the
    /// caller.
    async fn handle_message(&self, message: AgentMessage) -> AgentMessage;

    /// Idempotent; releases child resources in reverse creation order.
    async fn close(&self);
}

#[cfg(test)]
mod tests;
