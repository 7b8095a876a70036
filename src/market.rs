//! Market insights: one search-grounded query at a time, with the citations
//! the provider attached to its answer.

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::constants::{DEFAULT_MARKET_QUERY, MARKET_FAILED_NOTICE};
use crate::error::GatewayError;
use crate::gemini::AiGateway;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub uri: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketInsight {
    pub content: String,
    /// In the order the provider returned them.
    pub sources: Vec<GroundingSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketPhase {
    Idle,
    Pending,
    Complete,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub phase: MarketPhase,
    pub query: String,
    pub insight: Option<MarketInsight>,
}

#[derive(Debug)]
pub struct MarketDesk {
    query: String,
    insight: Option<MarketInsight>,
    pending: bool,
    notice: Option<String>,
}

impl Default for MarketDesk {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketDesk {
    pub fn new() -> Self {
        Self {
            query: DEFAULT_MARKET_QUERY.to_string(),
            insight: None,
            pending: false,
            notice: None,
        }
    }

    pub fn phase(&self) -> MarketPhase {
        if self.pending {
            MarketPhase::Pending
        } else if self.insight.is_some() {
            MarketPhase::Complete
        } else {
            MarketPhase::Idle
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn insight(&self) -> Option<&MarketInsight> {
        self.insight.as_ref()
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        MarketSnapshot {
            phase: self.phase(),
            query: self.query.clone(),
            insight: self.insight.clone(),
        }
    }

    /// Starts a query, dropping the previous insight. Returns the text to
    /// send, or `None` for a blank query or while one is already running.
    pub fn begin_query(&mut self, text: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() || self.pending {
            return None;
        }
        self.query = text.to_string();
        self.insight = None;
        self.pending = true;
        Some(self.query.clone())
    }

    pub fn complete(&mut self, insight: MarketInsight) {
        self.pending = false;
        self.insight = Some(insight);
    }

    /// Back to idle with nothing displayed; the operator gets a notice.
    pub fn fail(&mut self) {
        self.pending = false;
        self.insight = None;
        self.notice = Some(MARKET_FAILED_NOTICE.to_string());
    }

    pub fn take_notice(&mut self) -> Option<String> {
        self.notice.take()
    }

    pub async fn run_query<G>(&mut self, gateway: &G, text: &str) -> Option<MarketPhase>
    where
        G: AiGateway + ?Sized,
    {
        let query = self.begin_query(text)?;
        let outcome = gateway.query_market(&query).await;
        Some(self.settle(outcome))
    }

    /// Applies the outcome of the query started with [`Self::begin_query`].
    pub fn settle(&mut self, outcome: Result<MarketInsight, GatewayError>) -> MarketPhase {
        match outcome {
            Ok(insight) => {
                info!(query = %self.query, sources = insight.sources.len(), "Market insight received");
                self.complete(insight);
            }
            Err(e) => {
                error!(query = %self.query, error = %e, "Market query failed");
                self.fail();
            }
        }
        self.phase()
    }
}
