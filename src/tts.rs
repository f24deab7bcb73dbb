//! Speech synthesis capability: trait and ElevenLabs implementation.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::DocChatError;

/// The synthesize capability: narration text in, encoded audio out.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, DocChatError>;
}

/// Synthesizer backed by the ElevenLabs text-to-speech API. Returns
/// `mp3_44100_128` audio bytes.
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    voice_id: String,
}

impl ElevenLabsSynthesizer {
    pub fn new(voice_id: &str) -> Result<Self, DocChatError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| DocChatError::ServiceUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            voice_id: voice_id.to_string(),
        })
    }
}

#[async_trait]
impl Synthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, DocChatError> {
        // Missing credential is a structured error, not a crash; checked at
        // call time so the rest of the API works without it.
        let api_key = std::env::var("ELEVENLABS_API_KEY").map_err(|_| {
            DocChatError::ServiceUnavailable("ELEVENLABS_API_KEY not set".to_string())
        })?;

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}?output_format=mp3_44100_128",
            self.voice_id
        );
        let body = serde_json::json!({
            "text": text,
            "model_id": "eleven_multilingual_v2",
        });

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| DocChatError::ServiceUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DocChatError::ServiceUnavailable(format!(
                "TTS API error {}: {}",
                status, body
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DocChatError::ServiceUnavailable(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
