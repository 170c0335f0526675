use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::references::{
    DEFAULT_MANIFEST, DirectoryReferenceSource, HttpReferenceSource, ReferenceSource,
    StaticReferenceSource,
};

/// Overrides `references.base_url` when set.
pub const REFERENCES_URL_ENV: &str = "RUNPAD_REFERENCES_URL";

#[derive(Debug, Default, Deserialize)]
pub struct RunpadConfig {
    #[serde(default)]
    pub references: ReferencesConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize)]
pub struct ReferencesConfig {
    #[serde(default = "default_provider")]
    pub provider: ReferenceProvider,
    pub base_url: Option<String>,
    #[serde(default = "default_manifest")]
    pub manifest: String,
    pub directory: Option<PathBuf>,
}

impl Default for ReferencesConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            manifest: default_manifest(),
            directory: None,
        }
    }
}

fn default_provider() -> ReferenceProvider {
    ReferenceProvider::None
}
fn default_manifest() -> String {
    DEFAULT_MANIFEST.into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceProvider {
    Http,
    Directory,
    /// Empty reference set.
    None,
}

#[derive(Debug, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_warm_up")]
    pub warm_up: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            warm_up: default_warm_up(),
        }
    }
}

fn default_warm_up() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Upper bound on bytes captured from one run's stdout.
    #[serde(default = "default_stdout_capacity")]
    pub stdout_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stdout_capacity: default_stdout_capacity(),
        }
    }
}

fn default_stdout_capacity() -> usize {
    1024 * 1024
}

impl RunpadConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// `~/.runpad/runpad.toml`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".runpad").join("runpad.toml"))
    }

    /// Load the default config file, falling back to defaults when it does
    /// not exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn build_reference_source(&self) -> Result<Arc<dyn ReferenceSource>, ConfigError> {
        self.reference_source_with(std::env::var(REFERENCES_URL_ENV).ok())
    }

    fn reference_source_with(
        &self,
        url_override: Option<String>,
    ) -> Result<Arc<dyn ReferenceSource>, ConfigError> {
        let refs = &self.references;
        match refs.provider {
            ReferenceProvider::Http => {
                let base_url = url_override
                    .or_else(|| refs.base_url.clone())
                    .ok_or_else(|| ConfigError::Missing("references.base_url".into()))?;
                tracing::debug!(%base_url, manifest = %refs.manifest, "Using HTTP reference source");
                Ok(Arc::new(
                    HttpReferenceSource::new(base_url).with_manifest(refs.manifest.clone()),
                ))
            }
            ReferenceProvider::Directory => {
                let dir = refs
                    .directory
                    .clone()
                    .ok_or_else(|| ConfigError::Missing("references.directory".into()))?;
                tracing::debug!(dir = %dir.display(), "Using directory reference source");
                Ok(Arc::new(
                    DirectoryReferenceSource::new(dir).with_manifest(refs.manifest.clone()),
                ))
            }
            ReferenceProvider::None => Ok(Arc::new(StaticReferenceSource::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config = RunpadConfig::from_toml("").unwrap();
        assert_eq!(config.references.provider, ReferenceProvider::None);
        assert_eq!(config.references.manifest, "manifest.json");
        assert!(config.build.warm_up);
        assert_eq!(config.runtime.stdout_capacity, 1024 * 1024);
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
[references]
provider = "http"
base_url = "https://cdn.example.com/_framework"
manifest = "blazor.boot.json"

[build]
warm_up = false

[runtime]
stdout_capacity = 4096
"#;
        let config = RunpadConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.references.provider, ReferenceProvider::Http);
        assert_eq!(
            config.references.base_url.as_deref(),
            Some("https://cdn.example.com/_framework")
        );
        assert_eq!(config.references.manifest, "blazor.boot.json");
        assert!(!config.build.warm_up);
        assert_eq!(config.runtime.stdout_capacity, 4096);
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = RunpadConfig::from_toml("[references]\nprovider = \"ftp\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn http_provider_needs_a_url() {
        let config = RunpadConfig::from_toml("[references]\nprovider = \"http\"\n").unwrap();
        let err = config.reference_source_with(None).err().unwrap();
        assert!(matches!(err, ConfigError::Missing(ref key) if key == "references.base_url"));

        assert!(
            config
                .reference_source_with(Some("http://localhost:9000".into()))
                .is_ok()
        );
    }

    #[test]
    fn directory_provider_needs_a_directory() {
        let config =
            RunpadConfig::from_toml("[references]\nprovider = \"directory\"\n").unwrap();
        assert!(matches!(
            config.reference_source_with(None),
            Err(ConfigError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn directory_provider_reads_configured_manifest() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("refs.json"),
            r#"{"modules": {"core.txt": {}}}"#,
        )
        .unwrap();
        let toml_str = format!(
            "[references]\nprovider = \"directory\"\ndirectory = {:?}\nmanifest = \"refs.json\"\n",
            tmp.path().display().to_string()
        );
        let config = RunpadConfig::from_toml(&toml_str).unwrap();

        let source = config.reference_source_with(None).unwrap();
        let manifest = source.fetch_manifest().await.unwrap();
        assert_eq!(manifest.module_ids(), vec!["core.txt"]);
    }

    #[test]
    fn from_file_reads_toml() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("runpad.toml");
        std::fs::write(&path, "[build]\nwarm_up = false\n").unwrap();

        let config = RunpadConfig::from_file(&path).unwrap();
        assert!(!config.build.warm_up);
        assert!(matches!(
            RunpadConfig::from_file(&tmp.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
