use std::path::Path;

use anyhow::{Context, Result};

use crate::llm::CompletionRequest;
use crate::record::{
    Record, ARTIFACT_TYPE, COLLECTION_LEVEL_1, COLLECTION_LEVEL_2, COLLECTION_LEVEL_3,
    EXTRA_FIELD_1, EXTRA_FIELD_2,
};

pub const SYSTEM_PROMPT: &str = r#"Generate a description that roughly follows this 1 sentence structure depending on collection level 1:
For Community Narratives:
This $(image/audio/video/etc)$ that is a $(type of artifact)$, the source being practitioner $(Collection level 3)$ about $(topic inferred from filename if the file name is descriptive and not encoded)$, part of the Collection under Community Narratives from the $(collection level 2)$ community - it was/has/is $(any additional information inferred from filename)$

For Urdu Journalism:
This $(image/audio/video/etc)$ that is a $(type of artifact)$, the source being $(collection level 2)$ about $(topic inferred from filename if the file name is descriptive and not encoded)$, part of the Collection under Urdu Journalism - it was/has/is $(any additional information inferred from filename)$

For Police History:
This $(image/audio/video/etc)$ that is a $(type of artifact)$, the source being $(collection level 2)$ about $(topic inferred from filename if the file name is descriptive and not encoded)$, part of the Collection under Police History - it was/has/is $(any additional information inferred from filename)$

For Maps&HistoricDocuments:
This $(image/audio/video/etc)$ that is a $(type of artifact)$, part of the Collection under Maps & Historic Documents, about $(topic inferred from filename if the file name is descriptive and not encoded)$ - it was/has/is $(any additional information inferred from filename)$

For Collectors:
This $(image/audio/video/etc)$ that is a $(type of artifact)$, the source being Collector $(collection level 2)$ about $(topic inferred from filename if the file name is descriptive and not encoded)$, part of the Collection under Collectors from Bidar - it was/has/is $(any additional information inferred from filename)$

You will be penalised
- for not removing/replacing the $()$ which are meant to be placeholders
- not following the 1 sentence structure
- not removing portions of the 1 sentence structure that are not populated enough for the $(placeholders)$ to be replaced"#;

/// Expand the archive's artifact type codes. Unknown codes pass through untouched.
pub fn artifact_type_name(code: &str) -> &str {
    match code {
        "AF" => "Artifact",
        "AU" => "Audio",
        "AI" => "Audio Interview",
        "D" => "Document",
        "NAC" => "Non Archive Content",
        "OM" => "Other Material",
        "PN" => "Photo Narrative",
        "V" => "Video",
        other => other,
    }
}

/// Everything about a request that does not vary per record.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub system: String,
    pub model: String,
    pub max_tokens: u32,
}

impl PromptTemplate {
    pub fn new(model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            system: SYSTEM_PROMPT.to_string(),
            model: model.into(),
            max_tokens,
        }
    }

    /// Replace the built-in system instruction with a file's contents.
    pub fn with_system_file(mut self, path: &Path) -> Result<Self> {
        self.system = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read system prompt {}", path.display()))?;
        Ok(self)
    }

    pub fn build(&self, record: &Record) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            system: self.system.clone(),
            user: user_message(record),
            max_tokens: self.max_tokens,
        }
    }
}

fn user_message(record: &Record) -> String {
    format!(
        "Given a file with the following information:\n\
         Collection Level 1: {}\n\
         Collection Level 2: {}\n\
         Collection Level 3: {}\n\
         Type: {}\n\
         Additional Context: {}, {}\n\
         Filename: {}\n\
         \n\
         Generate a single sentence description following the template above.",
        record.get(COLLECTION_LEVEL_1),
        record.get(COLLECTION_LEVEL_2),
        record.get(COLLECTION_LEVEL_3),
        artifact_type_name(record.get(ARTIFACT_TYPE)),
        record.get(EXTRA_FIELD_1),
        record.get(EXTRA_FIELD_2),
        record.filename(),
    )
}
