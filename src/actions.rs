//! Single-shot document action pipelines: summarize, compare, mind-map,
//! audio overview.
//!
//! Each action retrieves a fixed-size context set scoped by a [`DocFilter`],
//! applies its own system instruction template, and invokes the generation
//! capability once (no streaming). The audio overview additionally runs the
//! speech synthesis capability and raises the temperature floor to 0.5 for
//! narrative variety.

use std::sync::Arc;

use crate::error::DocChatError;
use crate::index::DocFilter;
use crate::pipeline::AnswerPipeline;
use crate::tts::Synthesizer;

const SUMMARIZE_PROMPT: &str = "You are an expert document summarizer. \
    Provide a comprehensive yet concise summary of the following document content. \
    Highlight key points, main arguments, and important details.";

const COMPARE_PROMPT: &str = "You are an expert document analyst. \
    Compare and contrast the following documents. \
    For each point, cite which document the information comes from. \
    Highlight similarities, differences, and unique aspects of each document.";

const MINDMAP_PROMPT: &str = "You are an expert at creating mind maps from document content. \
    Given the following document content, generate a hierarchical mind map \
    in Markdown format using headings (#, ##, ###) and bullet points (- ). \
    The mind map should capture the key topics, subtopics, and important details. \
    Use a clear hierarchy: # for the main topic, ## for major themes, \
    ### for subtopics, and - for leaf details. \
    Output ONLY the markdown mind map, no other text.";

const AUDIO_PROMPT: &str = "You are an expert narrator. Given the following document content, \
    write a clear, engaging two-minute audio overview script. \
    Use a single narrator voice. Cover the key points, main arguments, \
    and important takeaways. Write in a natural speaking style — \
    conversational but informative. Aim for roughly 300 words \
    (about two minutes when read aloud). \
    Output ONLY the narration text, no stage directions or labels.";

pub struct ActionPipelines {
    pipeline: Arc<AnswerPipeline>,
    synthesizer: Arc<dyn Synthesizer>,
}

impl ActionPipelines {
    pub fn new(pipeline: Arc<AnswerPipeline>, synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self {
            pipeline,
            synthesizer,
        }
    }

    async fn run(
        &self,
        filter: DocFilter,
        retrieval_query: &str,
        system_template: &str,
        user: &str,
        temperature_floor: Option<f64>,
    ) -> Result<String, DocChatError> {
        let retrieved = self.pipeline.retrieve(retrieval_query, &filter).await?;
        let context = retrieved
            .iter()
            .map(|(c, _)| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let system = format!("{}\n\n{}", system_template, context);
        self.pipeline
            .complete(&system, user, temperature_floor)
            .await
    }

    pub async fn summarize(&self, doc_id: &str) -> Result<String, DocChatError> {
        self.run(
            DocFilter::documents([doc_id]),
            "summarize this document",
            SUMMARIZE_PROMPT,
            "Please summarize this document.",
            None,
        )
        .await
    }

    pub async fn compare(&self, doc_ids: &[String]) -> Result<String, DocChatError> {
        self.run(
            DocFilter::documents(doc_ids.iter().cloned()),
            "Compare and contrast these documents in detail.",
            COMPARE_PROMPT,
            "Compare and contrast these documents in detail.",
            None,
        )
        .await
    }

    pub async fn mindmap(&self, doc_id: &str) -> Result<String, DocChatError> {
        self.run(
            DocFilter::documents([doc_id]),
            "all topics and key points in this document",
            MINDMAP_PROMPT,
            "Generate a mind map for this document.",
            None,
        )
        .await
    }

    /// Generate the narration script, then synthesize it; returns
    /// `(script, mp3 bytes)`. No partial audio on synthesis failure.
    pub async fn audio_overview(&self, doc_id: &str) -> Result<(String, Vec<u8>), DocChatError> {
        let script = self
            .run(
                DocFilter::documents([doc_id]),
                "all content and key topics in this document",
                AUDIO_PROMPT,
                "Write a two-minute audio overview of this document.",
                Some(0.5),
            )
            .await?;

        let script = script.trim().to_string();
        if script.is_empty() {
            return Err(DocChatError::Generation(
                "Failed to generate overview script".to_string(),
            ));
        }

        let audio = self.synthesizer.synthesize(&script).await?;
        Ok((script, audio))
    }
}
