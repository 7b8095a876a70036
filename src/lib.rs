//! AgriSmart: a farm assistant backed by a generative model service.
//!
//! Controllers ([`chat::Conversation`], [`diagnosis::DiagnosisDesk`],
//! [`market::MarketDesk`]) are plain state machines driven through the
//! [`gemini::AiGateway`] trait. [`app_state::AppState`] ties them together
//! for the web front end served by [`web_server`].

pub mod app_state;
pub mod chat;
pub mod constants;
pub mod dashboard;
pub mod diagnosis;
pub mod error;
pub mod gemini;
pub mod market;
pub mod web_server;
