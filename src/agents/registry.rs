use async_trait::async_trait;
use serde_json::json;
use tracing::{Instrument, error, info};

use crate::registry::{ResultType, ResultsRepository};

use super::{
    Agent, AgentCore, AgentMessage, Payload, PolicyMap, RetrieveResultsRequest,
    RetrieveResultsResponse, StoreResultsRequest, StoreResultsResponse,
    error::Result,
};

/// Fabric front for the durable results repository.
pub struct RegistryAgent {
    core: AgentCore,
    repository: ResultsRepository,
}

impl RegistryAgent {
    pub fn new(run_id: Option<String>, repository: ResultsRepository) -> Self {
        Self {
            core: AgentCore::new("registry", run_id, PolicyMap::new()),
            repository,
        }
    }

    /// Stores whichever payload kinds the request carries. Failures are
    /// reported through `success = false`, never raised.
    pub async fn store_results(&self, request: &StoreResultsRequest) -> StoreResultsResponse {
        let ctx = self.core.context("store_results");
        async {
            let mut storage_id = None;

            let stores: [(ResultType, Option<serde_json::Value>); 3] = [
                (
                    ResultType::Backtest,
                    request
                        .backtest_results
                        .as_ref()
                        .and_then(|r| serde_json::to_value(r).ok()),
                ),
                (
                    ResultType::Evaluation,
                    request
                        .evaluation_results
                        .as_ref()
                        .and_then(|r| serde_json::to_value(r).ok()),
                ),
                (
                    ResultType::Optimization,
                    request
                        .optimization_results
                        .as_ref()
                        .and_then(|r| serde_json::to_value(r).ok()),
                ),
            ];

            for (result_type, payload) in stores {
                let Some(mut payload) = payload else {
                    continue;
                };
                payload["strategy_name"] = json!(request.strategy_name);
                payload["symbol"] = json!(request.symbol);
                if let Some(extra) = request.metadata.as_object() {
                    for (key, value) in extra {
                        payload[key.as_str()] = value.clone();
                    }
                }

                match self.repository.store(
                    result_type,
                    &request.run_id,
                    &request.strategy_name,
                    &request.symbol,
                    payload,
                ) {
                    Ok(id) => {
                        if result_type == ResultType::Backtest || storage_id.is_none() {
                            storage_id = Some(id);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "error storing results");
                        return StoreResultsResponse {
                            run_id: request.run_id.clone(),
                            storage_id: format!("error-{}", request.run_id),
                            success: false,
                        };
                    }
                }
            }

            let storage_id = storage_id.unwrap_or_else(|| format!("storage-{}", request.run_id));
            info!(%storage_id, "results stored");

            StoreResultsResponse {
                run_id: request.run_id.clone(),
                storage_id,
                success: true,
            }
        }
        .instrument(ctx.span())
        .await
    }

    /// Retrieval by run id, strategy, or symbol, in that precedence.
    pub async fn retrieve_results(
        &self,
        request: &RetrieveResultsRequest,
    ) -> RetrieveResultsResponse {
        let ctx = self.core.context("retrieve_results");
        async {
            let results = if let Some(run_id) = &request.run_id {
                match self.repository.retrieve_by_run_id(run_id) {
                    Ok(Some(record)) => vec![record],
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        error!(error = %e, "error retrieving results");
                        Vec::new()
                    }
                }
            } else if let Some(strategy_name) = &request.strategy_name {
                self.repository
                    .retrieve_by_strategy(strategy_name, request.limit, request.offset)
                    .unwrap_or_else(|e| {
                        error!(error = %e, "error retrieving results");
                        Vec::new()
                    })
            } else if let Some(symbol) = &request.symbol {
                self.repository
                    .retrieve_by_symbol(symbol, request.limit, request.offset)
                    .unwrap_or_else(|e| {
                        error!(error = %e, "error retrieving results");
                        Vec::new()
                    })
            } else {
                Vec::new()
            };

            let total_count = self
                .repository
                .total_count(
                    request.strategy_name.as_deref(),
                    request.symbol.as_deref(),
                )
                .unwrap_or(0);

            info!(count = results.len(), total_count, "results retrieved");

            RetrieveResultsResponse {
                results,
                total_count,
                limit: request.limit,
                offset: request.offset,
            }
        }
        .instrument(ctx.span())
        .await
    }
}

#[async_trait]
impl Agent for RegistryAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn initialize(&self) -> Result<()> {
        if self.core.mark_initialized() {
            let ctx = self.core.context("init");
            let _guard = ctx.span().entered();
            info!("RegistryAgent initialized");
        }
        Ok(())
    }

    async fn handle_message(&self, message: AgentMessage) -> AgentMessage {
        let ctx = self.core.context(&message.flow_id);
        async {
            match message.payload.clone() {
                Payload::StoreResultsRequest(request) => {
                    let response = self.store_results(&request).await;
                    self.core.message(
                        message.from.clone(),
                        message.flow_id.clone(),
                        Payload::StoreResultsResponse(response),
                    )
                }
                Payload::RetrieveResultsRequest(request) => {
                    let response = self.retrieve_results(&request).await;
                    self.core.message(
                        message.from.clone(),
                        message.flow_id.clone(),
                        Payload::RetrieveResultsResponse(response),
                    )
                }
                _ => self.core.unknown_message_reply(&message),
            }
        }
        .instrument(ctx.span())
        .await
    }

    async fn close(&self) {
        if self.core.mark_closed() {
            let ctx = self.core.context("cleanup");
            let _guard = ctx.span().entered();
            info!("RegistryAgent closed");
        }
    }
}
