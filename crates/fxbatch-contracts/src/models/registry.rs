use indexmap::IndexMap;

use super::AspectRatio;

/// One model variant the generation endpoint accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelVariant {
    pub name: String,
    /// Value sent as `modelInput.modelNameType`.
    pub wire_model: String,
    pub aspect_ratios: Vec<AspectRatio>,
    /// Set for variants whose shape is baked into the model name. The wire
    /// aspect ratio is then always `Unspecified`.
    pub fixed_ratio: Option<AspectRatio>,
}

impl ModelVariant {
    pub fn supports(&self, ratio: AspectRatio) -> bool {
        self.aspect_ratios.contains(&ratio)
    }

    pub fn wire_aspect_ratio(&self, requested: AspectRatio) -> AspectRatio {
        if self.fixed_ratio.is_some() {
            return AspectRatio::Unspecified;
        }
        requested
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    variants: IndexMap<String, ModelVariant>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(variants: Option<IndexMap<String, ModelVariant>>) -> Self {
        Self {
            variants: variants.unwrap_or_else(default_variants),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelVariant> {
        self.variants.get(name.trim())
    }

    pub fn default_variant(&self) -> Option<&ModelVariant> {
        self.variants.values().next()
    }

    pub fn names(&self) -> Vec<String> {
        self.variants.keys().cloned().collect()
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelVariant> {
        self.variants.values()
    }
}

fn default_variants() -> IndexMap<String, ModelVariant> {
    use AspectRatio::*;

    let mut map = IndexMap::new();
    let mut insert = |name: &str, wire_model: &str, ratios: &[AspectRatio], fixed: Option<AspectRatio>| {
        map.insert(
            name.to_string(),
            ModelVariant {
                name: name.to_string(),
                wire_model: wire_model.to_string(),
                aspect_ratios: ratios.to_vec(),
                fixed_ratio: fixed,
            },
        );
    };

    let standard = [
        Landscape,
        Square,
        Portrait,
        LandscapeFourThree,
        PortraitThreeFour,
        Unspecified,
    ];
    // IMAGEN_4 is served by the IMAGEN_3_5 backend.
    insert("IMAGEN_4", "IMAGEN_3_5", &standard, None);
    insert("IMAGEN_3_5", "IMAGEN_3_5", &standard, None);
    insert("IMAGEN_3_1", "IMAGEN_3_1", &standard, None);
    insert(
        "IMAGEN_2",
        "IMAGEN_2",
        &[Landscape, Square, Portrait, Unspecified],
        None,
    );
    insert(
        "IMAGEN_3_LANDSCAPE",
        "IMAGEN_3_LANDSCAPE",
        &[Landscape, Unspecified],
        Some(Landscape),
    );
    insert(
        "IMAGEN_3_PORTRAIT",
        "IMAGEN_3_PORTRAIT",
        &[Portrait, Unspecified],
        Some(Portrait),
    );
    insert(
        "IMAGEN_3_PORTRAIT_THREE_FOUR",
        "IMAGEN_3_PORTRAIT_THREE_FOUR",
        &[PortraitThreeFour, Unspecified],
        Some(PortraitThreeFour),
    );
    insert(
        "IMAGEN_3_LANDSCAPE_FOUR_THREE",
        "IMAGEN_3_LANDSCAPE_FOUR_THREE",
        &[LandscapeFourThree, Unspecified],
        Some(LandscapeFourThree),
    );

    map
}
