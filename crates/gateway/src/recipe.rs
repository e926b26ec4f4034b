//! Job recipes: how a kind of generation fills its workflow template and
//! where it finds its output afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use sds_comfyui::api::{HistoryEntry, OutputFile};
use sds_comfyui::backend::JobBackend;
use sds_comfyui::workflow::{Slot, WorkflowTemplate};
use serde_json::Value;

use crate::error::GenerationError;

/// One kind of generation job.
#[async_trait]
pub trait JobRecipe: Send + Sync {
    /// Short name used in logs and snapshots, e.g. `obj`.
    fn kind(&self) -> &'static str;

    /// Produce the filled workflow to submit. May upload inputs first.
    async fn build(&self, backend: &dyn JobBackend) -> Result<Value, GenerationError>;

    /// Find the artifact in the job's recorded outputs.
    ///
    /// Returns [`GenerationError::ResultUnavailable`] while the output has
    /// not been written yet; callers poll on that.
    fn locate_output(&self, history: &HistoryEntry) -> Result<OutputFile, GenerationError>;
}

fn missing_output(node: &str) -> GenerationError {
    GenerationError::ResultUnavailable(format!("no output recorded for node {node}"))
}

/// Image to 3D mesh.
pub struct ObjRecipe {
    template: Arc<WorkflowTemplate>,
    image: Vec<u8>,
    extension: String,
    mime: String,
    description: String,
    pub image_slot: Slot,
    pub text_slot: Slot,
    pub output_node: String,
    pub output_subfolder: String,
}

impl ObjRecipe {
    /// * `image` - encoded sketch bytes, uploaded before submission.
    /// * `extension` / `mime` - format of `image`, e.g. `png` / `image/png`.
    /// * `description` - prompt text for the mesh generator.
    pub fn new(
        template: Arc<WorkflowTemplate>,
        image: Vec<u8>,
        extension: impl Into<String>,
        mime: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            template,
            image,
            extension: extension.into(),
            mime: mime.into(),
            description: description.into(),
            image_slot: Slot::new("196", "image"),
            text_slot: Slot::new("192", "text"),
            output_node: "154".to_string(),
            output_subfolder: "3D".to_string(),
        }
    }
}

#[async_trait]
impl JobRecipe for ObjRecipe {
    fn kind(&self) -> &'static str {
        "obj"
    }

    async fn build(&self, backend: &dyn JobBackend) -> Result<Value, GenerationError> {
        let uploaded = backend
            .upload_image(self.image.clone(), &self.extension, &self.mime)
            .await
            .map_err(|e| GenerationError::Upload(e.to_string()))?;

        let reference = if uploaded.subfolder.is_empty() {
            uploaded.name
        } else {
            format!("{}/{}", uploaded.subfolder, uploaded.name)
        };
        tracing::debug!(image = %reference, "Sketch uploaded");

        Ok(self.template.fill(&[
            (self.image_slot.clone(), Value::String(reference)),
            (self.text_slot.clone(), Value::String(self.description.clone())),
        ])?)
    }

    fn locate_output(&self, history: &HistoryEntry) -> Result<OutputFile, GenerationError> {
        let filename = history
            .output(&self.output_node)
            .and_then(|out| out.get("result"))
            .and_then(|result| result.get(0))
            .and_then(Value::as_str)
            .ok_or_else(|| missing_output(&self.output_node))?;

        Ok(OutputFile {
            filename: filename.to_string(),
            subfolder: self.output_subfolder.clone(),
            kind: "output".to_string(),
        })
    }
}

/// Text to equirectangular HDRI panorama.
pub struct HdriRecipe {
    template: Arc<WorkflowTemplate>,
    t5_text: String,
    clip_text: String,
    pub t5_slot: Slot,
    pub clip_slot: Slot,
    pub output_node: String,
}

impl HdriRecipe {
    /// `t5_text` is natural prose; `clip_text` is a comma-separated tag list.
    pub fn new(
        template: Arc<WorkflowTemplate>,
        t5_text: impl Into<String>,
        clip_text: impl Into<String>,
    ) -> Self {
        Self {
            template,
            t5_text: t5_text.into(),
            clip_text: clip_text.into(),
            t5_slot: Slot::new("27", "t5xxl"),
            clip_slot: Slot::new("27", "clip_l"),
            output_node: "173".to_string(),
        }
    }
}

#[async_trait]
impl JobRecipe for HdriRecipe {
    fn kind(&self) -> &'static str {
        "hdri"
    }

    async fn build(&self, _backend: &dyn JobBackend) -> Result<Value, GenerationError> {
        Ok(self.template.fill(&[
            (self.clip_slot.clone(), Value::String(self.clip_text.clone())),
            (self.t5_slot.clone(), Value::String(self.t5_text.clone())),
        ])?)
    }

    fn locate_output(&self, history: &HistoryEntry) -> Result<OutputFile, GenerationError> {
        let image = history
            .output(&self.output_node)
            .and_then(|out| out.get("images"))
            .and_then(|images| images.get(0))
            .ok_or_else(|| missing_output(&self.output_node))?;

        serde_json::from_value(image.clone()).map_err(|e| {
            GenerationError::ResultFetch(format!("bad image entry on node {}: {e}", self.output_node))
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn hdri_template() -> Arc<WorkflowTemplate> {
        Arc::new(
            WorkflowTemplate::from_value(json!({
                "27": {"inputs": {"clip_l": "", "t5xxl": ""}},
                "173": {"inputs": {}}
            }))
            .unwrap(),
        )
    }

    fn history(outputs: Value) -> HistoryEntry {
        serde_json::from_value(json!({ "outputs": outputs })).unwrap()
    }

    #[test]
    fn obj_output_is_first_result_in_3d_folder() {
        let recipe = ObjRecipe::new(hdri_template(), vec![1], "png", "image/png", "a chair");
        let file = recipe
            .locate_output(&history(json!({"154": {"result": ["mesh_00001_.glb"]}})))
            .unwrap();

        assert_eq!(
            file,
            OutputFile {
                filename: "mesh_00001_.glb".into(),
                subfolder: "3D".into(),
                kind: "output".into(),
            }
        );
    }

    #[test]
    fn obj_output_missing_is_unavailable() {
        let recipe = ObjRecipe::new(hdri_template(), vec![1], "png", "image/png", "a chair");
        assert_matches!(
            recipe.locate_output(&history(json!({"154": {"result": []}}))),
            Err(GenerationError::ResultUnavailable(_))
        );
        assert_matches!(
            recipe.locate_output(&HistoryEntry::default()),
            Err(GenerationError::ResultUnavailable(_))
        );
    }

    #[test]
    fn hdri_output_is_first_image() {
        let recipe = HdriRecipe::new(hdri_template(), "A bright sky.", "sky, clouds");
        let file = recipe
            .locate_output(&history(json!({
                "173": {"images": [{"filename": "hdri_00002_.png", "subfolder": "", "type": "output"}]}
            })))
            .unwrap();

        assert_eq!(file.filename, "hdri_00002_.png");
        assert_eq!(file.kind, "output");
    }
}
