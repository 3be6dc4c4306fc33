use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Delimiter between the style snippet, the user preset, and the free text.
pub const PROMPT_DELIMITER: &str = " :: ";

/// Combines the three prompt fragments into the outbound prompt.
///
/// Each part is trimmed, empty parts are dropped, and the survivors are
/// joined in a fixed order: style, then user preset, then free text. An
/// all-empty result is returned as `""`; rejecting it is the caller's job.
pub fn compose(style: &str, preset: &str, free: &str) -> String {
    let parts: Vec<&str> = [style, preset, free]
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect();
    parts.join(PROMPT_DELIMITER)
}

/// Output dimensions shared by the generate and edit calls.
///
/// `Auto` is accepted for generation only and is omitted from the outbound
/// payload rather than sent literally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSize {
    #[serde(rename = "1024x1024")]
    Square,
    #[serde(rename = "1024x1536")]
    Portrait,
    #[serde(rename = "1536x1024")]
    Landscape,
    #[serde(rename = "auto")]
    Auto,
}

/// The constrained size forced whenever the fallback model is used.
pub const FALLBACK_SIZE: ImageSize = ImageSize::Square;

impl ImageSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSize::Square => "1024x1024",
            ImageSize::Portrait => "1024x1536",
            ImageSize::Landscape => "1536x1024",
            ImageSize::Auto => "auto",
        }
    }

    /// Value to place in an outbound request, `None` for the auto sentinel.
    pub fn api_value(&self) -> Option<&'static str> {
        match self {
            ImageSize::Auto => None,
            other => Some(other.as_str()),
        }
    }

    /// Sizes a user may pick for an edit call (no auto sentinel).
    pub fn edit_choices() -> &'static [ImageSize] {
        &[ImageSize::Square, ImageSize::Portrait, ImageSize::Landscape]
    }

    pub fn generate_choices() -> &'static [ImageSize] {
        &[
            ImageSize::Square,
            ImageSize::Portrait,
            ImageSize::Landscape,
            ImageSize::Auto,
        ]
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageSize {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "1024x1024" => Ok(ImageSize::Square),
            "1024x1536" => Ok(ImageSize::Portrait),
            "1536x1024" => Ok(ImageSize::Landscape),
            "auto" => Ok(ImageSize::Auto),
            other => bail!(
                "unsupported size '{other}' (expected 1024x1024, 1024x1536, 1536x1024, or auto)"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_joins_non_empty_parts_in_order() {
        assert_eq!(compose("", "", ""), "");
        assert_eq!(compose("A", "", ""), "A");
        assert_eq!(compose("A", "B", ""), "A :: B");
        assert_eq!(compose(" A ", "B", "C"), "A :: B :: C");
        assert_eq!(compose("", "B", "C"), "B :: C");
        assert_eq!(compose("", "", " C "), "C");
        assert_eq!(compose("A", "", "C"), "A :: C");
    }

    #[test]
    fn compose_treats_whitespace_only_parts_as_empty() {
        assert_eq!(compose("  ", "\t", "\n"), "");
        assert_eq!(compose("  ", "b", "  "), "b");
    }

    #[test]
    fn size_round_trips_through_str() -> anyhow::Result<()> {
        for size in ImageSize::generate_choices() {
            assert_eq!(&ImageSize::from_str(size.as_str())?, size);
        }
        assert!(ImageSize::from_str("512x512").is_err());
        Ok(())
    }

    #[test]
    fn auto_is_omitted_from_api_payloads() {
        assert_eq!(ImageSize::Auto.api_value(), None);
        assert_eq!(ImageSize::Square.api_value(), Some("1024x1024"));
        assert!(!ImageSize::edit_choices().contains(&ImageSize::Auto));
    }

    #[test]
    fn size_serializes_as_dimension_string() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&ImageSize::Portrait)?, "\"1024x1536\"");
        let parsed: ImageSize = serde_json::from_str("\"1536x1024\"")?;
        assert_eq!(parsed, ImageSize::Landscape);
        Ok(())
    }
}
