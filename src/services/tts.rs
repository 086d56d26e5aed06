use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;

use crate::services::capabilities::{SynthesisError, Synthesizer};
use crate::services::storage::AudioClip;

const TTS_URL: &str = "https://texttospeech.googleapis.com/v1/text:synthesize";

/// Google Cloud Text-to-Speech accepts at most 5000 bytes of input text.
const MAX_INPUT_BYTES: usize = 5000;

/// Synthesizer backed by Google Cloud Text-to-Speech (MP3 output).
pub struct GoogleTts {
    http: Client,
    url: String,
    api_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio_content: Option<String>,
}

impl GoogleTts {
    pub fn new(api_key: &str) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: Client::builder().build()?,
            url: TTS_URL.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl Synthesizer for GoogleTts {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        language: &str,
    ) -> Result<AudioClip, SynthesisError> {
        if text.len() > MAX_INPUT_BYTES {
            return Err(SynthesisError::InvalidInput(format!(
                "text is {} bytes, limit is {MAX_INPUT_BYTES}",
                text.len()
            )));
        }

        let body = serde_json::json!({
            "input": { "text": text },
            "voice": { "languageCode": language, "name": voice },
            "audioConfig": { "audioEncoding": "MP3", "speakingRate": 1.0, "pitch": 0.0 },
        });

        let response = self
            .http
            .post(&self.url)
            .query(&[("key", &self.api_key)])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SynthesisError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: SynthesizeResponse = response.json().await?;
        let encoded = parsed
            .audio_content
            .ok_or_else(|| SynthesisError::Decode("response has no audioContent".to_string()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| SynthesisError::Decode(e.to_string()))?;

        Ok(AudioClip {
            bytes,
            content_type: "audio/mpeg".to_string(),
            extension: "mp3".to_string(),
        })
    }
}
