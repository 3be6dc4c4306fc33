use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;

/// Fixed style snippets, in display order. The first entry is the explicit
/// "no style" choice with an empty snippet.
pub fn builtin_styles() -> IndexMap<&'static str, &'static str> {
    IndexMap::from([
        ("(none)", ""),
        (
            "photo",
            "a stunning photograph, as if taken by a professional photographer on a DSLR",
        ),
        (
            "watercolor",
            "a beautiful watercolor painting by a professional artist, soft brush strokes, gentle tone",
        ),
        (
            "oil-painting",
            "a beautiful oil painting by a professional artist",
        ),
        (
            "anime",
            "an illustration in the style of a Japanese anime artist",
        ),
        (
            "cinematic",
            "cinematic composition and dramatic lighting, depth of field, film grain, 35mm lens",
        ),
        (
            "sunset-city",
            "sunset cityscape, warm colors, glowing windows, atmospheric light",
        ),
        (
            "future-city",
            "futuristic city, neon lights, cyberpunk style, ultra-detailed",
        ),
        (
            "nature",
            "lush forest, sunlight filtering through trees, vivid colors, realistic lighting",
        ),
        (
            "portrait-illustration",
            "anime style portrait, highly detailed, soft light, digital art, pastel colors",
        ),
    ])
}

pub fn builtin_style(name: &str) -> Option<&'static str> {
    builtin_styles().get(name).copied()
}

/// User-defined prompt presets, persisted as a pretty-printed JSON object so
/// the file stays hand-editable.
#[derive(Debug, Clone)]
pub struct PresetStore {
    path: PathBuf,
}

impl PresetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable files read as an empty map; presets are not
    /// critical enough to abort a session over.
    pub fn load(&self) -> BTreeMap<String, String> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return BTreeMap::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    /// Whole-map replace via a temp file and rename, so a failed write never
    /// leaves a truncated preset file behind.
    pub fn save(&self, presets: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(presets)?)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn add(&self, name: &str, text: &str) -> Result<()> {
        let name = name.trim();
        let text = text.trim();
        if name.is_empty() || text.is_empty() {
            bail!("preset name and text must both be non-empty");
        }
        let mut presets = self.load();
        if presets.contains_key(name) {
            bail!("a preset named '{name}' already exists");
        }
        presets.insert(name.to_string(), text.to_string());
        self.save(&presets)
    }

    /// Returns whether anything was removed; absence is a no-op, not an error.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut presets = self.load();
        if presets.remove(name).is_none() {
            return Ok(false);
        }
        self.save(&presets)?;
        Ok(true)
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.load().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_styles_start_with_the_empty_choice() {
        let styles = builtin_styles();
        let (first_name, first_snippet) = styles.first().unwrap();
        assert_eq!(*first_name, "(none)");
        assert!(first_snippet.is_empty());
        assert!(styles.len() > 1);
    }

    #[test]
    fn load_missing_file_yields_empty_map() {
        let store = PresetStore::new("/nonexistent/presets_user.json");
        assert!(store.load().is_empty());
    }

    #[test]
    fn load_unreadable_file_yields_empty_map() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("presets_user.json");
        std::fs::write(&path, "{not json")?;
        assert!(PresetStore::new(path).load().is_empty());
        Ok(())
    }

    #[test]
    fn add_and_reload_round_trips() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = PresetStore::new(temp.path().join("presets_user.json"));
        store.add("tokyo-dusk", "neon alleys at dusk, light rain")?;
        assert_eq!(
            store.get("tokyo-dusk").as_deref(),
            Some("neon alleys at dusk, light rain")
        );
        Ok(())
    }

    #[test]
    fn add_rejects_duplicates_and_leaves_the_map_unchanged() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = PresetStore::new(temp.path().join("presets_user.json"));
        store.add("a", "first text")?;
        assert!(store.add("a", "second text").is_err());
        assert_eq!(store.get("a").as_deref(), Some("first text"));
        assert_eq!(store.load().len(), 1);
        Ok(())
    }

    #[test]
    fn add_rejects_empty_name_or_text() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = PresetStore::new(temp.path().join("presets_user.json"));
        assert!(store.add("  ", "text").is_err());
        assert!(store.add("name", " \t").is_err());
        assert!(store.load().is_empty());
        Ok(())
    }

    #[test]
    fn remove_is_a_noop_when_absent() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = PresetStore::new(temp.path().join("presets_user.json"));
        store.add("keep", "kept text")?;
        assert!(!store.remove("missing")?);
        assert!(store.remove("keep")?);
        assert!(store.load().is_empty());
        Ok(())
    }

    #[test]
    fn saved_file_is_pretty_printed_json() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("presets_user.json");
        let store = PresetStore::new(&path);
        store.add("a", "text")?;
        let raw = std::fs::read_to_string(&path)?;
        assert!(raw.contains('\n'));
        let parsed: BTreeMap<String, String> = serde_json::from_str(&raw)?;
        assert_eq!(parsed.get("a").map(String::as_str), Some("text"));
        Ok(())
    }
}
