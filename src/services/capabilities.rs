//! Contracts for the AI capabilities the pipeline consumes.
//!
//! Each stage talks to an opaque external service through one of these traits,
//! so implementations can be swapped (or scripted in tests) without touching
//! the pipeline.

use async_trait::async_trait;
use std::time::Duration;

use crate::models::job::{NarrationMode, PageLayout};
use crate::services::storage::AudioClip;

/// Text pulled out of a comic page by an extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub text: String,
    pub mode: NarrationMode,
    pub confidence: f64,
    pub tokens_used: Option<u32>,
    /// Only extractors that see the page structure report one.
    pub layout: Option<PageLayout>,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Which narration mode this extractor produces.
    fn mode(&self) -> NarrationMode;

    async fn extract(&self, image: &[u8]) -> Result<Extraction, ExtractError>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, TranslateError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        language: &str,
    ) -> Result<AudioClip, SynthesisError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Extractor not available: {0}")]
    Unavailable(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse extractor response: {0}")]
    Parse(String),

    #[error("Extractor returned no text")]
    NoText,

    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    /// The model or service is not loaded/configured.
    #[error("Translation unavailable: {0}")]
    Unavailable(String),

    #[error("Translation failed: {0}")]
    Translation(String),

    #[error("Translation timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid synthesis input: {0}")]
    InvalidInput(String),

    #[error("Failed to decode synthesized audio: {0}")]
    Decode(String),

    #[error("Synthesis timed out after {0:?}")]
    Timeout(Duration),
}
