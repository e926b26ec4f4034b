//! Prompt writing for the two generation kinds.
//!
//! A model-backed writer lives outside this crate; [`TemplatePrompter`]
//! is the offline fallback used by the binary.

use async_trait::async_trait;

use crate::error::GenerationError;

/// Turns user input into the text fields a workflow expects.
#[async_trait]
pub trait PromptWriter: Send + Sync {
    /// Prompt for the mesh generator from a sketch and an optional hint.
    async fn describe(&self, image: &[u8], hint: Option<&str>) -> Result<String, GenerationError>;

    /// Split a scene description into `(t5, clip)` text: natural prose and
    /// a comma-separated tag list.
    async fn expand(&self, text: &str) -> Result<(String, String), GenerationError>;
}

/// Deterministic writer that ignores the image.
#[derive(Debug, Clone)]
pub struct TemplatePrompter {
    /// Product-render template; `{description}` is replaced by the hint.
    pub object_template: String,
    /// Used when no hint is given.
    pub default_subject: String,
}

impl Default for TemplatePrompter {
    fn default() -> Self {
        Self {
            object_template: "3D product render, futuristic {description}, finely detailed, purism, \
                              ue 5, a computer rendering, minimalism, octane render, 4k"
                .to_string(),
            default_subject: "object".to_string(),
        }
    }
}

#[async_trait]
impl PromptWriter for TemplatePrompter {
    async fn describe(&self, _image: &[u8], hint: Option<&str>) -> Result<String, GenerationError> {
        let subject = hint
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or(&self.default_subject);
        Ok(self.object_template.replace("{description}", subject))
    }

    async fn expand(&self, text: &str) -> Result<(String, String), GenerationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(GenerationError::Template("scene description is empty".into()));
        }

        let clip = text
            .split(|c: char| c == ',' || c == '.' || c == ';' || c == '\n')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ");

        Ok((text.to_string(), clip))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn describe_uses_hint_in_template() {
        let prompt = TemplatePrompter::default()
            .describe(&[], Some(" ceramic kettle "))
            .await
            .unwrap();
        assert!(prompt.starts_with("3D product render, futuristic ceramic kettle, finely detailed"));
        assert!(prompt.ends_with("octane render, 4k"));
    }

    #[tokio::test]
    async fn describe_without_hint_uses_default_subject() {
        let prompt = TemplatePrompter::default().describe(&[], Some("  ")).await.unwrap();
        assert!(prompt.contains("futuristic object,"));
    }

    #[tokio::test]
    async fn expand_keeps_prose_and_builds_tag_list() {
        let (t5, clip) = TemplatePrompter::default()
            .expand("A misty forest at dawn. Tall pines, soft light")
            .await
            .unwrap();
        assert_eq!(t5, "A misty forest at dawn. Tall pines, soft light");
        assert_eq!(clip, "A misty forest at dawn, Tall pines, soft light");
    }

    #[tokio::test]
    async fn expand_rejects_empty_text() {
        assert_matches!(
            TemplatePrompter::default().expand(" ").await,
            Err(GenerationError::Template(_))
        );
    }
}
