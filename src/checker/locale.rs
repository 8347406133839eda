//! Per-bundle translation catalogs.
//!
//! A bundle may ship `conf/locale/<lang>.json`, a flat msgid-to-msgstr map.
//! Lookups fall back to the untranslated msgid on any miss, so an absent or
//! malformed catalog degrades to English rather than failing the grade.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

/// Default language tag when the payload does not name one.
pub const DEFAULT_LANG: &str = "en";

/// A loaded translation catalog.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: HashMap<String, String>,
}

impl Catalog {
    /// An empty catalog; every lookup falls through to the msgid.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads `<locale_dir>/<lang>.json`. Missing or unparseable files yield
    /// an empty catalog.
    pub fn load(locale_dir: &Path, lang: &str) -> Self {
        let path = locale_dir.join(format!("{lang}.json"));
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return Self::empty(),
        };
        match serde_json::from_str::<HashMap<String, String>>(&content) {
            Ok(entries) => Self { entries },
            Err(err) => {
                debug!(path = %path.display(), error = %err, "Ignoring malformed locale catalog");
                Self::empty()
            }
        }
    }

    /// Loads the catalog shipped with a problem bundle, if any.
    pub fn for_bundle(bundle: &Path, lang: &str) -> Self {
        Self::load(&bundle.join("conf").join("locale"), lang)
    }

    /// Translates `msgid`, falling back to it verbatim.
    pub fn gettext<'a>(&'a self, msgid: &'a str) -> &'a str {
        self.entries.get(msgid).map(String::as_str).unwrap_or(msgid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_catalog_falls_back() {
        let catalog = Catalog::load(Path::new("/nonexistent"), "eo");
        assert_eq!(catalog.gettext("hello"), "hello");
    }

    #[test]
    fn test_loads_and_translates() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("eo.json"), r#"{"hello": "saluton"}"#).unwrap();

        let catalog = Catalog::load(dir.path(), "eo");
        assert_eq!(catalog.gettext("hello"), "saluton");
        assert_eq!(catalog.gettext("untranslated"), "untranslated");
    }

    #[test]
    fn test_malformed_catalog_is_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("en.json"), "not json").unwrap();

        let catalog = Catalog::load(dir.path(), "en");
        assert_eq!(catalog.gettext("hello"), "hello");
    }
}
