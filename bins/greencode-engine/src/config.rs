// Sandbox image registry: per-language images and the files staged into a sandbox
use crate::error::EngineError;
use anyhow::{bail, Context, Result};
use greencode_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

fn default_entry_script() -> String {
    "run.sh".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub name: Language,
    pub image: String,
    /// Docker build context holding a Dockerfile for `image`.
    /// When absent the image is pulled from a registry instead.
    #[serde(default)]
    pub dockerfile_dir: Option<PathBuf>,
    pub file_extension: String,
    /// Serialization glue and program entry point, shared by every problem
    #[serde(default)]
    pub framework_files: Vec<String>,
    /// Problem specific adapter sources, delivered with the problem bundle
    #[serde(default)]
    pub wrapper_files: Vec<String>,
    /// Build scripts and the like
    #[serde(default)]
    pub extra_files: Vec<String>,
    #[serde(default = "default_entry_script")]
    pub entry_script: String,
}

impl LanguageProfile {
    pub fn submission_file(&self) -> String {
        format!("submission.{}", self.file_extension)
    }

    /// Every file that must be present in a prepared sandbox
    pub fn required_files(&self) -> impl Iterator<Item = &str> {
        self.framework_files
            .iter()
            .chain(&self.wrapper_files)
            .chain(&self.extra_files)
            .map(String::as_str)
            .chain(std::iter::once(self.entry_script.as_str()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageProfile>,
}

/// Read-only registry of language profiles, loaded once at startup
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, Arc<LanguageProfile>>,
}

impl LanguageRegistry {
    /// Load language profiles from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Load from `config_path` if it exists, otherwise fall back to the built-in profiles
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            info!(
                path = %config_path.display(),
                "Language config not found, using built-in profiles"
            );
            Ok(Self::builtin())
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson = serde_json::from_str(content)?;
        Self::from_profiles(languages_json.languages)
    }

    fn from_profiles(profiles: Vec<LanguageProfile>) -> Result<Self> {
        let mut map = HashMap::new();
        for profile in profiles {
            if profile.image.trim().is_empty() {
                bail!("Language '{}' has no image", profile.name);
            }
            if map.contains_key(&profile.name) {
                bail!("Language '{}' is configured twice", profile.name);
            }
            map.insert(profile.name, Arc::new(profile));
        }
        Ok(Self { profiles: map })
    }

    pub fn builtin() -> Self {
        let c = LanguageProfile {
            name: Language::C,
            image: "runner_c".to_string(),
            dockerfile_dir: None,
            file_extension: "c".to_string(),
            framework_files: [
                "main.c",
                "datastructs.c",
                "datastructs.h",
                "deserialiser.c",
                "deserialiser.h",
                "serialiser.c",
                "serialiser.h",
            ]
            .map(String::from)
            .to_vec(),
            wrapper_files: ["submission.h", "wrapper.c", "wrapper.h"]
                .map(String::from)
                .to_vec(),
            extra_files: vec!["Makefile".to_string()],
            entry_script: default_entry_script(),
        };
        let python = LanguageProfile {
            name: Language::Python,
            image: "runner_python".to_string(),
            dockerfile_dir: None,
            file_extension: "py".to_string(),
            framework_files: Vec::new(),
            wrapper_files: Vec::new(),
            extra_files: Vec::new(),
            entry_script: default_entry_script(),
        };

        let mut profiles = HashMap::new();
        profiles.insert(Language::C, Arc::new(c));
        profiles.insert(Language::Python, Arc::new(python));
        Self { profiles }
    }

    /// Profile for `language`, or `UnsupportedLanguage`
    pub fn resolve(&self, language: Language) -> crate::error::Result<Arc<LanguageProfile>> {
        self.profiles
            .get(&language)
            .cloned()
            .ok_or(EngineError::UnsupportedLanguage(language))
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Arc<LanguageProfile>> {
        self.profiles.values()
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().map(|l| l.to_string()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "languages": [
            {
                "name": "c",
                "image": "runner_c",
                "dockerfile_dir": "dockerfiles/c",
                "file_extension": "c",
                "framework_files": ["main.c"],
                "wrapper_files": ["wrapper.c"],
                "extra_files": ["Makefile"]
            }
        ]
    }"#;

    #[test]
    fn test_load_from_json() {
        let registry = LanguageRegistry::from_json(SAMPLE).unwrap();
        let profile = registry.resolve(Language::C).unwrap();

        assert_eq!(profile.image, "runner_c");
        assert_eq!(profile.entry_script, "run.sh");
        assert_eq!(profile.submission_file(), "submission.c");
        assert_eq!(profile.dockerfile_dir, Some(PathBuf::from("dockerfiles/c")));
        assert_eq!(
            profile.required_files().collect::<Vec<_>>(),
            vec!["main.c", "wrapper.c", "Makefile", "run.sh"]
        );
    }

    #[test]
    fn test_unregistered_language_is_rejected() {
        let registry = LanguageRegistry::from_json(SAMPLE).unwrap();
        let err = registry.resolve(Language::Python).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedLanguage(Language::Python)));
    }

    #[test]
    fn test_duplicate_language_is_rejected() {
        let json = r#"{"languages": [
            {"name": "c", "image": "a", "file_extension": "c"},
            {"name": "c", "image": "b", "file_extension": "c"}
        ]}"#;
        assert!(LanguageRegistry::from_json(json).is_err());
    }

    #[test]
    fn test_builtin_covers_every_language() {
        let registry = LanguageRegistry::builtin();
        for language in Language::ALL {
            assert!(registry.resolve(language).is_ok(), "{} missing", language);
        }
        assert_eq!(registry.list_languages(), vec!["c", "python"]);
    }

    #[test]
    fn test_missing_file_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LanguageRegistry::load_or_builtin(&dir.path().join("nope.json")).unwrap();
        assert_eq!(registry.list_languages().len(), Language::ALL.len());

        assert!(LanguageRegistry::load(&dir.path().join("nope.json")).is_err());
    }

    #[test]
    fn test_shipped_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/languages.json");
        let registry = LanguageRegistry::load(&path).unwrap();
        assert!(registry.resolve(Language::C).is_ok());
    }
}
