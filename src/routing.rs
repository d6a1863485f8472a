//! Per-document choice between Markdown and mind-map conversion.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ArtifactFormat, ConversionResult};
use crate::traits::{Classifier, Converter};

/// Sends each document to one of two converters.
///
/// A title carrying one of `hashtags` (`#mm`, `#mindmap`, ...) always goes
/// to the mind-map converter. Otherwise the classifier decides; without one,
/// or when it fails, the document becomes Markdown.
pub struct RoutingConverter {
    markdown: Box<dyn Converter>,
    mind_map: Box<dyn Converter>,
    hashtags: Vec<String>,
    classifier: Option<Box<dyn Classifier>>,
}

impl RoutingConverter {
    pub fn new(
        markdown: Box<dyn Converter>,
        mind_map: Box<dyn Converter>,
        hashtags: Vec<String>,
        classifier: Option<Box<dyn Classifier>>,
    ) -> Self {
        Self {
            markdown,
            mind_map,
            hashtags,
            classifier,
        }
    }

    async fn route(&self, bytes: &[u8], filename: &str) -> ArtifactFormat {
        if has_hashtag(filename, &self.hashtags) {
            tracing::debug!(file = filename, "mind-map hashtag in title");
            return ArtifactFormat::MindMap;
        }
        let Some(classifier) = &self.classifier else {
            return ArtifactFormat::Markdown;
        };
        match classifier.classify(bytes, filename).await {
            Ok(format) => format,
            Err(e) => {
                tracing::warn!(
                    file = filename,
                    classifier = classifier.name(),
                    error = %format!("{:#}", e),
                    "classification failed; converting to markdown"
                );
                ArtifactFormat::Markdown
            }
        }
    }
}

#[async_trait]
impl Converter for RoutingConverter {
    fn name(&self) -> &str {
        "routed"
    }

    async fn convert(&self, bytes: &[u8], filename: &str) -> Result<ConversionResult> {
        let target = match self.route(bytes, filename).await {
            ArtifactFormat::Markdown => &self.markdown,
            ArtifactFormat::MindMap => &self.mind_map,
        };
        tracing::info!(file = filename, converter = target.name(), "routing document");
        target.convert(bytes, filename).await
    }
}

/// True when `text` contains `#<tag>` for any tag, case-insensitively, as a
/// whole word: `#mm` matches `Trip #mm.pdf` but not `#mmx`.
pub fn has_hashtag(text: &str, hashtags: &[String]) -> bool {
    let lowered = text.to_lowercase();
    hashtags.iter().any(|tag| {
        let tag = tag.trim().trim_start_matches('#').to_lowercase();
        if tag.is_empty() {
            return false;
        }
        let needle = format!("#{}", tag);
        lowered.match_indices(&needle).any(|(at, _)| {
            lowered[at + needle.len()..]
                .chars()
                .next()
                .map_or(true, |c| !(c.is_alphanumeric() || c == '_'))
        })
    })
}
