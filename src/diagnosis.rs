//! Plant doctor: the uploaded image, the classification result and the
//! single-shot request cycle between them.

use std::fmt;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::constants::DIAGNOSIS_FAILED_NOTICE;
use crate::error::{GatewayError, ImageError};
use crate::gemini::AiGateway;

pub const DEFAULT_DIAGNOSIS: &str = "Unknown";
pub const DEFAULT_CONFIDENCE: &str = "Low";
pub const DEFAULT_TREATMENT: &str = "No treatment recommended.";
pub const DEFAULT_OBSERVATION: &str = "Could not analyze the image.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub diagnosis: String,
    pub confidence: String,
    pub treatment: String,
    pub observation: String,
    pub plant_name: Option<String>,
}

impl Default for AnalysisResult {
    fn default() -> Self {
        Self {
            diagnosis: DEFAULT_DIAGNOSIS.to_string(),
            confidence: DEFAULT_CONFIDENCE.to_string(),
            treatment: DEFAULT_TREATMENT.to_string(),
            observation: DEFAULT_OBSERVATION.to_string(),
            plant_name: None,
        }
    }
}

impl AnalysisResult {
    /// Builds a result from the model's reply, field by field. Anything
    /// missing, blank or unparseable falls back to its default; this never
    /// fails.
    pub fn from_reply(reply: &str) -> Self {
        let fields = reply_fields(reply);
        let defaults = Self::default();
        Self {
            diagnosis: text_field(&fields, "diagnosis").unwrap_or(defaults.diagnosis),
            confidence: text_field(&fields, "confidence").unwrap_or(defaults.confidence),
            treatment: text_field(&fields, "treatment").unwrap_or(defaults.treatment),
            observation: text_field(&fields, "description").unwrap_or(defaults.observation),
            plant_name: text_field(&fields, "plantName"),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.diagnosis.to_lowercase().contains("healthy")
    }

    pub fn is_high_confidence(&self) -> bool {
        self.confidence.to_lowercase().contains("high")
    }
}

fn reply_fields(reply: &str) -> Map<String, Value> {
    let body = strip_code_fence(reply.trim());
    if body.is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(fields)) => fields,
        // Some replies wrap the object in a one-element array.
        Ok(Value::Array(items)) => match items.into_iter().next() {
            Some(Value::Object(fields)) => fields,
            _ => Map::new(),
        },
        Ok(_) => Map::new(),
        Err(e) => {
            warn!(error = %e, "Classification reply is not JSON, using defaults");
            Map::new()
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn text_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// An uploaded image held in memory until replaced or reset.
#[derive(Clone, PartialEq)]
pub struct SelectedImage {
    bytes: Vec<u8>,
    mime_type: String,
}

impl fmt::Debug for SelectedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedImage")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl SelectedImage {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Result<Self, ImageError> {
        let mime_type = mime_type.into();
        if !mime_type.starts_with("image/") {
            return Err(ImageError::UnsupportedType(mime_type));
        }
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        Ok(Self { bytes, mime_type })
    }

    /// Decodes a browser data URL (`data:image/png;base64,....`).
    pub fn from_data_url(url: &str) -> Result<Self, ImageError> {
        let rest = url.trim().strip_prefix("data:").ok_or(ImageError::NotDataUrl)?;
        let (header, payload) = rest.split_once(',').ok_or(ImageError::NotDataUrl)?;
        let mime_type = header
            .strip_suffix(";base64")
            .ok_or(ImageError::NotDataUrl)?;
        let bytes = STANDARD.decode(payload.trim())?;
        Self::new(bytes, mime_type)
    }

    /// Reads an image file, inferring its type from the extension.
    pub fn from_path(path: &Path) -> Result<Self, ImageError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .unwrap_or_default();
        let mime_type = match extension.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "webp" => "image/webp",
            "gif" => "image/gif",
            "heic" => "image/heic",
            "heif" => "image/heif",
            other => return Err(ImageError::UnsupportedType(other.to_string())),
        };
        let bytes = std::fs::read(path)?;
        Self::new(bytes, mime_type)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosisPhase {
    Empty,
    ImageSelected,
    Pending,
    Complete,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisSnapshot {
    pub phase: DiagnosisPhase,
    pub image: Option<String>,
    pub result: Option<AnalysisResult>,
    /// Set only alongside `result`.
    pub healthy: Option<bool>,
    pub high_confidence: Option<bool>,
}

#[derive(Debug, Default)]
pub struct DiagnosisDesk {
    image: Option<SelectedImage>,
    result: Option<AnalysisResult>,
    pending: bool,
    notice: Option<String>,
}

impl DiagnosisDesk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> DiagnosisPhase {
        if self.pending {
            DiagnosisPhase::Pending
        } else if self.result.is_some() {
            DiagnosisPhase::Complete
        } else if self.image.is_some() {
            DiagnosisPhase::ImageSelected
        } else {
            DiagnosisPhase::Empty
        }
    }

    pub fn image(&self) -> Option<&SelectedImage> {
        self.image.as_ref()
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        self.result.as_ref()
    }

    pub fn snapshot(&self) -> DiagnosisSnapshot {
        DiagnosisSnapshot {
            phase: self.phase(),
            image: self.image.as_ref().map(SelectedImage::to_data_url),
            result: self.result.clone(),
            healthy: self.result.as_ref().map(AnalysisResult::is_healthy),
            high_confidence: self.result.as_ref().map(AnalysisResult::is_high_confidence),
        }
    }

    /// Holds a new image, discarding any previous result. Ignored while an
    /// analysis is in flight.
    pub fn select_image(&mut self, image: SelectedImage) -> bool {
        if self.pending {
            return false;
        }
        self.image = Some(image);
        self.result = None;
        true
    }

    /// Moves to pending and hands out the image to classify, or `None` when
    /// there is no image or an analysis is already running.
    pub fn begin_analysis(&mut self) -> Option<SelectedImage> {
        if self.pending {
            return None;
        }
        let image = self.image.clone()?;
        self.pending = true;
        Some(image)
    }

    pub fn complete(&mut self, result: AnalysisResult) {
        self.pending = false;
        self.result = Some(result);
    }

    /// Returns to image-selected, keeping the image, with a notice for the
    /// operator.
    pub fn fail(&mut self) {
        self.pending = false;
        self.notice = Some(DIAGNOSIS_FAILED_NOTICE.to_string());
    }

    pub fn take_notice(&mut self) -> Option<String> {
        self.notice.take()
    }

    pub fn reset(&mut self) -> bool {
        if self.pending {
            return false;
        }
        *self = Self::default();
        true
    }

    /// Runs one classification of the held image. Returns the phase reached,
    /// or `None` if the analysis could not start.
    pub async fn analyze<G>(&mut self, gateway: &G) -> Option<DiagnosisPhase>
    where
        G: AiGateway + ?Sized,
    {
        let image = self.begin_analysis()?;
        let outcome = gateway.classify_image(image.bytes(), image.mime_type()).await;
        Some(self.settle(outcome))
    }

    /// Applies the outcome of a classification started with
    /// [`Self::begin_analysis`] and returns the phase reached.
    pub fn settle(&mut self, outcome: Result<AnalysisResult, GatewayError>) -> DiagnosisPhase {
        match outcome {
            Ok(result) => {
                info!(diagnosis = %result.diagnosis, confidence = %result.confidence, "Image analyzed");
                self.complete(result);
            }
            Err(e) => {
                warn!(error = %e, "Image analysis failed");
                self.fail();
            }
        }
        self.phase()
    }
}
