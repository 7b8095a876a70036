// Runtime configuration defaults, loaded from the environment (a `.env` file
// is read by main before any of these are touched).

use std::env;

// Use lazy_static to initialize static variables safely.
lazy_static::lazy_static! {
    /// API key for the Gemini REST API. `API_KEY` is accepted as a fallback.
    pub static ref GEMINI_API_KEY: String = env::var("GEMINI_API_KEY")
        .or_else(|_| env::var("API_KEY"))
        .unwrap_or_default();
    pub static ref GEMINI_API_BASE: String = env::var("GEMINI_API_BASE").unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string());
    pub static ref AGRISMART_MODEL: String = env::var("AGRISMART_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string());
}

pub const DEFAULT_PORT: u16 = 9900;

/// First (and, after a clear, only) entry of every advisor transcript.
pub const ADVISOR_GREETING: &str = "Hello! I am your AI agricultural advisor. Ask me anything about crop cycles, pest control, soil health, or sustainable farming practices.";

/// Replaces the text of an assistant entry whose stream failed.
pub const ADVISOR_APOLOGY: &str = "I'm having trouble connecting to the network. Please try again.";

pub const ADVISOR_SYSTEM_INSTRUCTION: &str = "You are AgriSmart, a helpful and knowledgeable agricultural consultant. You help farmers and gardeners with planting schedules, soil health, pest control, and general farming advice. Keep answers concise and practical.";

pub const DIAGNOSIS_PROMPT: &str = r#"You are an expert plant pathologist. Analyze this image of a plant.
Identify the plant species.
Diagnose any diseases, pests, or nutrient deficiencies visible.
If healthy, state that it is healthy.
Provide a confidence level (High/Medium/Low).
Recommend organic and chemical treatments if applicable.

Format the response as JSON with the following keys:
- plantName: string
- diagnosis: string (the name of the disease/issue)
- confidence: string
- description: string (detailed observation)
- treatment: string (step-by-step advice)

Do not wrap the JSON in markdown code blocks, return the raw JSON string only."#;

pub const DIAGNOSIS_FAILED_NOTICE: &str = "Failed to analyze image. Please try again.";

pub const MARKET_FAILED_NOTICE: &str = "Failed to fetch market insights.";

pub const DEFAULT_MARKET_QUERY: &str = "corn and wheat prices";

pub fn market_prompt(query: &str) -> String {
    format!(
        "Provide a summary of the latest agricultural market trends, specifically regarding: {}. \
        Focus on prices, supply chain issues, and forecasts.",
        query
    )
}
