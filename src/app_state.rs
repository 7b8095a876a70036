use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::chat::{Conversation, ConversationStatus, Exchange, SubmitOutcome, TranscriptEntry};
use crate::diagnosis::{DiagnosisDesk, DiagnosisPhase, DiagnosisSnapshot, SelectedImage};
use crate::error::GatewayError;
use crate::gemini::AiGateway;
use crate::market::{MarketDesk, MarketPhase, MarketSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum View {
    #[default]
    Overview,
    PlantDiagnosis,
    Advisor,
    Market,
}

impl View {
    pub const ALL: [View; 4] = [View::Overview, View::PlantDiagnosis, View::Advisor, View::Market];

    pub fn label(self) -> &'static str {
        match self {
            View::Overview => "Dashboard",
            View::PlantDiagnosis => "Plant Doctor",
            View::Advisor => "Advisor",
            View::Market => "Market",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            View::Overview => "overview",
            View::PlantDiagnosis => "plant-diagnosis",
            View::Advisor => "advisor",
            View::Market => "market",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppSnapshot {
    pub view: View,
    pub chat_status: ConversationStatus,
    pub transcript: Vec<TranscriptEntry>,
    pub diagnosis: DiagnosisSnapshot,
    pub market: MarketSnapshot,
}

/// Pushed to every connected browser as JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum UiEvent {
    Snapshot { state: AppSnapshot },
    ViewChanged { view: View },
    ChatEntryAdded { entry: TranscriptEntry },
    /// `text` is the whole reply so far, so a replayed event is harmless.
    ChatFragment { id: Uuid, fragment: String, text: String },
    ChatSettled { entry: TranscriptEntry },
    ChatCleared { transcript: Vec<TranscriptEntry> },
    DiagnosisUpdated { diagnosis: DiagnosisSnapshot },
    MarketUpdated { market: MarketSnapshot },
    Notice { message: String },
}

/// Where a single-shot request ended up, with the notice shown to the
/// operator if it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReport<P> {
    pub phase: P,
    pub notice: Option<String>,
}

/// Root controller. Owns every piece of UI state; handlers receive a clone.
///
/// Locks are never held across a call to the model service, so a request
/// arriving while another is in flight sees the busy state and is turned
/// away instead of queueing.
#[derive(Clone)]
pub struct AppState {
    gateway: Arc<dyn AiGateway>,
    view: Arc<Mutex<View>>,
    conversation: Arc<Mutex<Conversation>>,
    diagnosis: Arc<Mutex<DiagnosisDesk>>,
    market: Arc<Mutex<MarketDesk>>,
    events: broadcast::Sender<UiEvent>,
}

impl AppState {
    pub fn new(gateway: Arc<dyn AiGateway>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            gateway,
            view: Arc::new(Mutex::new(View::default())),
            conversation: Arc::new(Mutex::new(Conversation::new())),
            diagnosis: Arc::new(Mutex::new(DiagnosisDesk::new())),
            market: Arc::new(Mutex::new(MarketDesk::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: UiEvent) {
        // No receivers just means no browser is connected.
        let _ = self.events.send(event);
    }

    pub async fn snapshot(&self) -> AppSnapshot {
        let view = *self.view.lock().await;
        let (chat_status, transcript) = {
            let conversation = self.conversation.lock().await;
            (conversation.status(), conversation.entries().to_vec())
        };
        let diagnosis = self.diagnosis.lock().await.snapshot();
        let market = self.market.lock().await.snapshot();
        AppSnapshot {
            view,
            chat_status,
            transcript,
            diagnosis,
            market,
        }
    }

    pub async fn view(&self) -> View {
        *self.view.lock().await
    }

    pub async fn select_view(&self, view: View) {
        *self.view.lock().await = view;
        debug!(?view, "View selected");
        self.publish(UiEvent::ViewChanged { view });
    }

    /// Accepts an operator message and appends the operator and placeholder
    /// entries. `None` when the input is blank or a reply is streaming.
    pub async fn begin_chat(&self, input: &str) -> Option<Exchange> {
        let mut conversation = self.conversation.lock().await;
        let exchange = conversation.begin_exchange(input)?;
        for entry in &conversation.entries()[conversation.entries().len() - 2..] {
            self.publish(UiEvent::ChatEntryAdded {
                entry: entry.clone(),
            });
        }
        Some(exchange)
    }

    /// Streams the reply for an accepted exchange into the transcript.
    pub async fn run_chat(&self, exchange: Exchange) -> SubmitOutcome {
        let reply_id = exchange.reply_id;
        let result = self.stream_reply(&exchange).await;

        let mut conversation = self.conversation.lock().await;
        let outcome = conversation.settle(reply_id, result);
        if let Some(entry) = conversation.entry(reply_id) {
            self.publish(UiEvent::ChatSettled {
                entry: entry.clone(),
            });
        }
        outcome
    }

    async fn stream_reply(&self, exchange: &Exchange) -> Result<(), GatewayError> {
        let mut fragments = self
            .gateway
            .stream_chat(&exchange.history, &exchange.message)
            .await?;
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            // Published under the lock so snapshots and fragment events agree.
            let mut conversation = self.conversation.lock().await;
            conversation.append_fragment(exchange.reply_id, &fragment);
            let text = conversation
                .entry(exchange.reply_id)
                .map(|entry| entry.text.clone())
                .unwrap_or_default();
            self.publish(UiEvent::ChatFragment {
                id: exchange.reply_id,
                fragment,
                text,
            });
        }
        Ok(())
    }

    pub async fn submit_chat(&self, input: &str) -> SubmitOutcome {
        match self.begin_chat(input).await {
            Some(exchange) => self.run_chat(exchange).await,
            None => SubmitOutcome::Rejected,
        }
    }

    pub async fn clear_chat(&self) -> bool {
        let mut conversation = self.conversation.lock().await;
        if !conversation.clear() {
            return false;
        }
        self.publish(UiEvent::ChatCleared {
            transcript: conversation.entries().to_vec(),
        });
        true
    }

    pub async fn select_image(&self, image: SelectedImage) -> bool {
        let mut desk = self.diagnosis.lock().await;
        if !desk.select_image(image) {
            return false;
        }
        self.publish(UiEvent::DiagnosisUpdated {
            diagnosis: desk.snapshot(),
        });
        true
    }

    /// Classifies the selected image. `None` when there is no image or an
    /// analysis is already running.
    pub async fn analyze_image(&self) -> Option<RequestReport<DiagnosisPhase>> {
        let image = {
            let mut desk = self.diagnosis.lock().await;
            let image = desk.begin_analysis()?;
            self.publish(UiEvent::DiagnosisUpdated {
                diagnosis: desk.snapshot(),
            });
            image
        };

        let outcome = self
            .gateway
            .classify_image(image.bytes(), image.mime_type())
            .await;

        let mut desk = self.diagnosis.lock().await;
        let phase = desk.settle(outcome);
        let notice = desk.take_notice();
        if let Some(message) = &notice {
            self.publish(UiEvent::Notice {
                message: message.clone(),
            });
        }
        self.publish(UiEvent::DiagnosisUpdated {
            diagnosis: desk.snapshot(),
        });
        Some(RequestReport { phase, notice })
    }

    pub async fn reset_diagnosis(&self) -> bool {
        let mut desk = self.diagnosis.lock().await;
        if !desk.reset() {
            return false;
        }
        self.publish(UiEvent::DiagnosisUpdated {
            diagnosis: desk.snapshot(),
        });
        true
    }

    /// Runs a market query. `None` for a blank query or while one is running.
    pub async fn query_market(&self, text: &str) -> Option<RequestReport<MarketPhase>> {
        let query = {
            let mut desk = self.market.lock().await;
            let query = desk.begin_query(text)?;
            self.publish(UiEvent::MarketUpdated {
                market: desk.snapshot(),
            });
            query
        };

        let outcome = self.gateway.query_market(&query).await;

        let mut desk = self.market.lock().await;
        let phase = desk.settle(outcome);
        let notice = desk.take_notice();
        if let Some(message) = &notice {
            self.publish(UiEvent::Notice {
                message: message.clone(),
            });
        }
        self.publish(UiEvent::MarketUpdated {
            market: desk.snapshot(),
        });
        Some(RequestReport { phase, notice })
    }
}
