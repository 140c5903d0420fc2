use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Output shapes accepted by the generation endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AspectRatio {
    Square,
    Portrait,
    Landscape,
    PortraitThreeFour,
    LandscapeFourThree,
    Unspecified,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown aspect ratio '{0}'")]
pub struct UnknownAspectRatio(pub String);

impl AspectRatio {
    pub const ALL: [AspectRatio; 6] = [
        AspectRatio::Square,
        AspectRatio::Portrait,
        AspectRatio::Landscape,
        AspectRatio::PortraitThreeFour,
        AspectRatio::LandscapeFourThree,
        AspectRatio::Unspecified,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            AspectRatio::Square => "IMAGE_ASPECT_RATIO_SQUARE",
            AspectRatio::Portrait => "IMAGE_ASPECT_RATIO_PORTRAIT",
            AspectRatio::Landscape => "IMAGE_ASPECT_RATIO_LANDSCAPE",
            AspectRatio::PortraitThreeFour => "IMAGE_ASPECT_RATIO_PORTRAIT_THREE_FOUR",
            AspectRatio::LandscapeFourThree => "IMAGE_ASPECT_RATIO_LANDSCAPE_FOUR_THREE",
            AspectRatio::Unspecified => "IMAGE_ASPECT_RATIO_UNSPECIFIED",
        }
    }

    pub fn from_wire(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|ratio| ratio.wire_name() == raw.trim())
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for AspectRatio {
    type Err = UnknownAspectRatio;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if let Some(ratio) = Self::from_wire(raw) {
            return Ok(ratio);
        }
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let ratio = match normalized.as_str() {
            "square" | "1:1" => AspectRatio::Square,
            "portrait" | "tall" | "9:16" => AspectRatio::Portrait,
            "landscape" | "wide" | "16:9" => AspectRatio::Landscape,
            "portrait_three_four" | "3:4" => AspectRatio::PortraitThreeFour,
            "landscape_four_three" | "4:3" => AspectRatio::LandscapeFourThree,
            "unspecified" | "auto" => AspectRatio::Unspecified,
            _ => return Err(UnknownAspectRatio(raw.to_string())),
        };
        Ok(ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::AspectRatio;

    #[test]
    fn parses_wire_names_and_aliases() {
        assert_eq!(
            "IMAGE_ASPECT_RATIO_LANDSCAPE".parse::<AspectRatio>(),
            Ok(AspectRatio::Landscape)
        );
        assert_eq!("square".parse::<AspectRatio>(), Ok(AspectRatio::Square));
        assert_eq!("3:4".parse::<AspectRatio>(), Ok(AspectRatio::PortraitThreeFour));
        assert_eq!(
            "Landscape-Four-Three".parse::<AspectRatio>(),
            Ok(AspectRatio::LandscapeFourThree)
        );
    }

    #[test]
    fn rejects_unknown_values() {
        let err = "panorama".parse::<AspectRatio>().unwrap_err();
        assert_eq!(err.to_string(), "unknown aspect ratio 'panorama'");
    }
}
