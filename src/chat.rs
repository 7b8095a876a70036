// Advisor conversation: an ordered transcript whose last assistant entry is
// filled in place as a streamed reply arrives.

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{ADVISOR_APOLOGY, ADVISOR_GREETING};
use crate::error::GatewayError;
use crate::gemini::{stream_chat_with, AiGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Operator,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub id: Uuid,
    pub origin: Origin,
    pub text: String,
    pub failed: bool,
    pub timestamp: String,
}

impl TranscriptEntry {
    fn new(origin: Origin, text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            text,
            failed: false,
            timestamp: Local::now().format("%H:%M:%S").to_string(),
        }
    }

    pub fn operator(text: impl Into<String>) -> Self {
        Self::new(Origin::Operator, text.into())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Origin::Assistant, text.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationStatus {
    Idle,
    AwaitingResponse,
}

/// An accepted submission: what to send, and which entry receives the reply.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub reply_id: Uuid,
    /// Transcript as it was before the operator's message was appended.
    pub history: Vec<TranscriptEntry>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitOutcome {
    Completed,
    Failed,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    entries: Vec<TranscriptEntry>,
    in_progress: Option<Uuid>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            entries: vec![TranscriptEntry::assistant(ADVISOR_GREETING)],
            in_progress: None,
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn entry(&self, id: Uuid) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn status(&self) -> ConversationStatus {
        if self.in_progress.is_some() {
            ConversationStatus::AwaitingResponse
        } else {
            ConversationStatus::Idle
        }
    }

    pub fn in_progress(&self) -> Option<Uuid> {
        self.in_progress
    }

    /// Accepts an operator message. Returns `None`, changing nothing, when the
    /// input is blank or a reply is still being streamed.
    pub fn begin_exchange(&mut self, input: &str) -> Option<Exchange> {
        if input.trim().is_empty() || self.in_progress.is_some() {
            return None;
        }

        let history = self.entries.clone();
        self.entries.push(TranscriptEntry::operator(input));
        let reply = TranscriptEntry::assistant("");
        let reply_id = reply.id;
        self.entries.push(reply);
        self.in_progress = Some(reply_id);
        debug!(%reply_id, "Exchange started");

        Some(Exchange {
            reply_id,
            history,
            message: input.to_string(),
        })
    }

    /// Appends a streamed fragment to the entry with the given identity.
    pub fn append_fragment(&mut self, id: Uuid, fragment: &str) -> bool {
        match self.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.text.push_str(fragment);
                true
            }
            None => false,
        }
    }

    pub fn finish_exchange(&mut self, id: Uuid) -> bool {
        if self.in_progress != Some(id) {
            return false;
        }
        self.in_progress = None;
        true
    }

    /// Replaces the in-progress reply with the apology and flags it as failed.
    pub fn fail_exchange(&mut self, id: Uuid) -> bool {
        if self.in_progress != Some(id) {
            return false;
        }
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) {
            entry.text = ADVISOR_APOLOGY.to_string();
            entry.failed = true;
        }
        self.in_progress = None;
        true
    }

    /// Resets to the greeting. Refused while a reply is streaming.
    pub fn clear(&mut self) -> bool {
        if self.in_progress.is_some() {
            return false;
        }
        *self = Self::new();
        true
    }

    /// Runs a whole exchange against `gateway`, calling `on_fragment` after
    /// each fragment has been applied to the transcript.
    pub async fn submit<G, F>(&mut self, gateway: &G, input: &str, mut on_fragment: F) -> SubmitOutcome
    where
        G: AiGateway + ?Sized,
        F: FnMut(&str),
    {
        let Some(exchange) = self.begin_exchange(input) else {
            return SubmitOutcome::Rejected;
        };
        let reply_id = exchange.reply_id;

        let result = stream_chat_with(gateway, &exchange.history, &exchange.message, |fragment| {
            self.append_fragment(reply_id, fragment);
            on_fragment(fragment);
        })
        .await;

        self.settle(reply_id, result)
    }

    /// Finishes or fails the exchange depending on how its stream ended.
    pub fn settle(&mut self, reply_id: Uuid, result: Result<(), GatewayError>) -> SubmitOutcome {
        match result {
            Ok(()) => {
                self.finish_exchange(reply_id);
                info!(%reply_id, "Advisor reply complete");
                SubmitOutcome::Completed
            }
            Err(e) => {
                warn!(%reply_id, error = %e, "Advisor exchange failed");
                self.fail_exchange(reply_id);
                SubmitOutcome::Failed
            }
        }
    }
}
