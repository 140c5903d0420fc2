use serde::{Deserialize, Serialize};

use crate::models::{AspectRatio, ModelRegistry, ModelVariant};

pub const MIN_IMAGE_COUNT: u32 = 1;
pub const MAX_IMAGE_COUNT: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("image count {0} outside {}..={}", MIN_IMAGE_COUNT, MAX_IMAGE_COUNT)]
    CountOutOfRange(u32),
    #[error("unknown model variant '{0}'")]
    UnknownModel(String),
    #[error("model variant '{model}' does not support aspect ratio {ratio}")]
    UnsupportedAspectRatio { model: String, ratio: AspectRatio },
}

/// One prompt plus the generation parameters it is sent with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: AspectRatio,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub seed: Option<i64>,
    /// Project the prompt belongs to when one batch carries several; names
    /// its images in the archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            aspect_ratio: default_aspect_ratio(),
            count: default_count(),
            model: default_model(),
            seed: None,
            project: None,
        }
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: AspectRatio) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_seed(mut self, seed: Option<i64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        let project = project.into();
        self.project = (!project.trim().is_empty()).then_some(project);
        self
    }

    /// Checks the request against the known variant table and returns the
    /// variant it resolves to. Runs before any network I/O.
    pub fn validate<'r>(
        &self,
        registry: &'r ModelRegistry,
    ) -> Result<&'r ModelVariant, RequestError> {
        if self.prompt.trim().is_empty() {
            return Err(RequestError::EmptyPrompt);
        }
        if !(MIN_IMAGE_COUNT..=MAX_IMAGE_COUNT).contains(&self.count) {
            return Err(RequestError::CountOutOfRange(self.count));
        }
        let variant = registry
            .get(&self.model)
            .ok_or_else(|| RequestError::UnknownModel(self.model.clone()))?;
        if !variant.supports(self.aspect_ratio) {
            return Err(RequestError::UnsupportedAspectRatio {
                model: variant.name.clone(),
                ratio: self.aspect_ratio,
            });
        }
        Ok(variant)
    }
}

fn default_aspect_ratio() -> AspectRatio {
    AspectRatio::Landscape
}

fn default_count() -> u32 {
    4
}

fn default_model() -> String {
    "IMAGEN_4".to_string()
}

#[cfg(test)]
mod tests {
    use super::{GenerationRequest, RequestError};
    use crate::models::{AspectRatio, ModelRegistry};

    #[test]
    fn defaults_follow_the_service_defaults() {
        let request = GenerationRequest::new("a cat");
        assert_eq!(request.aspect_ratio, AspectRatio::Landscape);
        assert_eq!(request.count, 4);
        assert_eq!(request.model, "IMAGEN_4");
        assert!(request.validate(&ModelRegistry::default()).is_ok());
    }

    #[test]
    fn rejects_blank_prompts() {
        let registry = ModelRegistry::default();
        assert_eq!(
            GenerationRequest::new("   ").validate(&registry).err(),
            Some(RequestError::EmptyPrompt)
        );
    }

    #[test]
    fn rejects_counts_outside_service_bounds() {
        let registry = ModelRegistry::default();
        for count in [0, 9] {
            assert_eq!(
                GenerationRequest::new("a cat")
                    .with_count(count)
                    .validate(&registry)
                    .err(),
                Some(RequestError::CountOutOfRange(count))
            );
        }
        assert!(GenerationRequest::new("a cat")
            .with_count(8)
            .validate(&registry)
            .is_ok());
    }

    #[test]
    fn rejects_unknown_models_and_mismatched_ratios() {
        let registry = ModelRegistry::default();
        assert_eq!(
            GenerationRequest::new("a cat")
                .with_model("IMAGEN_9")
                .validate(&registry)
                .err(),
            Some(RequestError::UnknownModel("IMAGEN_9".to_string()))
        );
        assert_eq!(
            GenerationRequest::new("a cat")
                .with_model("IMAGEN_3_PORTRAIT")
                .with_aspect_ratio(AspectRatio::Square)
                .validate(&registry)
                .err(),
            Some(RequestError::UnsupportedAspectRatio {
                model: "IMAGEN_3_PORTRAIT".to_string(),
                ratio: AspectRatio::Square,
            })
        );
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() -> anyhow::Result<()> {
        let request: GenerationRequest = serde_json::from_str(r#"{"prompt":"a cat"}"#)?;
        assert_eq!(request, GenerationRequest::new("a cat"));
        Ok(())
    }

    #[test]
    fn project_is_optional_and_blank_means_none() -> anyhow::Result<()> {
        assert_eq!(GenerationRequest::new("a").with_project("  ").project, None);

        let request = GenerationRequest::new("a cat").with_project("Cats");
        let value = serde_json::to_value(&request)?;
        assert_eq!(value["project"], serde_json::json!("Cats"));
        assert!(serde_json::to_value(GenerationRequest::new("a"))?
            .get("project")
            .is_none());
        Ok(())
    }
}
