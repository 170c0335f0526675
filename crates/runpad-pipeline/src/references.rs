use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};

use crate::error::FetchError;

/// File name used by the HTTP and directory sources when none is configured.
pub const DEFAULT_MANIFEST: &str = "manifest.json";

/// One compiled library module the compiler can resolve symbols against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    id: String,
    module_name: String,
    exports: Vec<String>,
}

impl Reference {
    pub fn new(id: impl Into<String>, exports: Vec<String>) -> Self {
        let id = id.into();
        let module_name = Path::new(&id)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&id)
            .to_string();
        Self {
            id,
            module_name,
            exports,
        }
    }

    /// Manifest identifier, e.g. `mathlib.wasm`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name source code uses to import the module, e.g. `mathlib`.
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn exports_symbol(&self, name: &str) -> bool {
        self.exports.iter().any(|e| e == name)
    }
}

/// Append-only, ordered collection of references shared by every build.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    references: Vec<Reference>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reference: Reference) {
        self.references.push(reference);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.references.iter().any(|r| r.id == id)
    }

    /// Look up a reference by the name imports use.
    pub fn by_module_name(&self, module_name: &str) -> Option<&Reference> {
        self.references
            .iter()
            .find(|r| r.module_name == module_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reference> {
        self.references.iter()
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }
}

/// Manifest entry for one module. Entries keep the order they were listed in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModuleEntry {
    #[serde(skip)]
    pub id: String,
    /// Hex SHA-256 of the module bytes; verified when present.
    pub sha256: Option<String>,
    pub size: Option<u64>,
}

/// The set of library modules required for compilation.
///
/// ```json
/// { "modules": { "core.wasm": { "sha256": "..." }, "text.wasm": {} } }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReferenceManifest {
    #[serde(deserialize_with = "ordered_modules")]
    pub modules: Vec<ModuleEntry>,
}

impl ReferenceManifest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, FetchError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn module_ids(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.id.clone()).collect()
    }

    pub fn entry(&self, id: &str) -> Option<&ModuleEntry> {
        self.modules.iter().find(|m| m.id == id)
    }
}

fn ordered_modules<'de, D>(deserializer: D) -> Result<Vec<ModuleEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let map = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
    map.into_iter()
        .map(|(id, value)| {
            let value = if value.is_null() {
                serde_json::json!({})
            } else {
                value
            };
            let mut entry: ModuleEntry = serde_json::from_value(value)
                .map_err(|e| D::Error::custom(format!("module '{id}': {e}")))?;
            entry.id = id;
            Ok(entry)
        })
        .collect()
}

/// Check `bytes` against the manifest checksum, if one was published.
pub fn verify_integrity(entry: &ModuleEntry, bytes: &[u8]) -> Result<(), FetchError> {
    let Some(expected) = &entry.sha256 else {
        return Ok(());
    };
    let actual = hex::encode(Sha256::digest(bytes));
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(FetchError::Integrity {
            id: entry.id.clone(),
            expected: expected.clone(),
            actual,
        })
    }
}

/// A module that could not be added to the reference set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceFailure {
    pub id: String,
    pub reason: String,
}

/// What `initialize` managed to load. Missing references are tolerated and
/// listed here rather than aborting initialization.
#[derive(Debug, Clone, Default)]
pub struct InitializeReport {
    pub loaded: Vec<String>,
    pub failures: Vec<ReferenceFailure>,
}

impl InitializeReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Where the manifest and module bytes come from.
pub trait ReferenceSource: Send + Sync {
    fn fetch_manifest<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<ReferenceManifest, FetchError>> + Send + 'a>>;

    fn fetch_module<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, FetchError>> + Send + 'a>>;
}

/// Fetches `<base_url>/<manifest>` and `<base_url>/<id>` over HTTP.
pub struct HttpReferenceSource {
    http: reqwest::Client,
    base_url: String,
    manifest: String,
}

impl HttpReferenceSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            manifest: DEFAULT_MANIFEST.into(),
        }
    }

    pub fn with_manifest(mut self, manifest: impl Into<String>) -> Self {
        self.manifest = manifest.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get(&self, url: String) -> Result<Vec<u8>, FetchError> {
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status {
                url,
                status: resp.status().as_u16(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

impl ReferenceSource for HttpReferenceSource {
    fn fetch_manifest<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<ReferenceManifest, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            let bytes = self.get(self.url(&self.manifest)).await?;
            ReferenceManifest::from_slice(&bytes)
        })
    }

    fn fetch_module<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, FetchError>> + Send + 'a>> {
        Box::pin(async move { self.get(self.url(id)).await })
    }
}

/// Reads the manifest and modules from a local directory.
pub struct DirectoryReferenceSource {
    dir: PathBuf,
    manifest: String,
}

impl DirectoryReferenceSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            manifest: DEFAULT_MANIFEST.into(),
        }
    }

    pub fn with_manifest(mut self, manifest: impl Into<String>) -> Self {
        self.manifest = manifest.into();
        self
    }
}

impl ReferenceSource for DirectoryReferenceSource {
    fn fetch_manifest<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<ReferenceManifest, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(self.dir.join(&self.manifest)).await?;
            ReferenceManifest::from_slice(&bytes)
        })
    }

    fn fetch_module<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            // Identifiers are flat file names; never leave the directory.
            if id.contains("..") || Path::new(id).is_absolute() {
                return Err(FetchError::Module {
                    id: id.to_string(),
                    reason: "identifier escapes the reference directory".into(),
                });
            }
            Ok(tokio::fs::read(self.dir.join(id)).await?)
        })
    }
}

/// In-memory source for tests and embedders that bundle their references.
#[derive(Debug, Clone, Default)]
pub struct StaticReferenceSource {
    order: Vec<String>,
    modules: HashMap<String, Vec<u8>>,
    manifest_error: Option<String>,
}

impl StaticReferenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, id: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let id = id.into();
        self.order.push(id.clone());
        self.modules.insert(id, bytes.into());
        self
    }

    /// List `id` in the manifest without being able to serve it.
    pub fn with_unavailable(mut self, id: impl Into<String>) -> Self {
        self.order.push(id.into());
        self
    }

    /// Make the manifest itself unavailable.
    pub fn failing_manifest(reason: impl Into<String>) -> Self {
        Self {
            manifest_error: Some(reason.into()),
            ..Self::default()
        }
    }
}

impl ReferenceSource for StaticReferenceSource {
    fn fetch_manifest<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<ReferenceManifest, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(reason) = &self.manifest_error {
                return Err(FetchError::Manifest(reason.clone()));
            }
            Ok(ReferenceManifest {
                modules: self
                    .order
                    .iter()
                    .map(|id| ModuleEntry {
                        id: id.clone(),
                        sha256: None,
                        size: self.modules.get(id).map(|b| b.len() as u64),
                    })
                    .collect(),
            })
        })
    }

    fn fetch_module<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            self.modules
                .get(id)
                .cloned()
                .ok_or_else(|| FetchError::Module {
                    id: id.to_string(),
                    reason: "not found".into(),
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MANIFEST: &str = r#"{
        "modules": {
            "zeta.wasm": { "size": 12 },
            "alpha.wasm": {},
            "mid.wasm": null
        }
    }"#;

    #[test]
    fn manifest_keeps_listing_order() {
        let manifest = ReferenceManifest::from_slice(MANIFEST.as_bytes()).unwrap();
        assert_eq!(
            manifest.module_ids(),
            vec!["zeta.wasm", "alpha.wasm", "mid.wasm"]
        );
        assert_eq!(manifest.entry("zeta.wasm").unwrap().size, Some(12));
    }

    #[test]
    fn malformed_manifest_is_rejected() {
        let err = ReferenceManifest::from_slice(b"{\"modules\": [1, 2]}").unwrap_err();
        assert!(matches!(err, FetchError::Json(_)));
    }

    #[test]
    fn reference_module_name_strips_extension() {
        let r = Reference::new("mathlib.wasm", vec!["double".into()]);
        assert_eq!(r.id(), "mathlib.wasm");
        assert_eq!(r.module_name(), "mathlib");
        assert!(r.exports_symbol("double"));
        assert!(!r.exports_symbol("triple"));
    }

    #[test]
    fn reference_set_lookups() {
        let mut set = ReferenceSet::new();
        assert!(set.is_empty());
        set.push(Reference::new("a.wasm", vec![]));
        set.push(Reference::new("b", vec![]));
        assert_eq!(set.len(), 2);
        assert!(set.contains("a.wasm"));
        assert!(set.by_module_name("a").is_some());
        assert!(set.by_module_name("b").is_some());
        assert!(set.by_module_name("c").is_none());
    }

    #[test]
    fn integrity_check() {
        let entry = ModuleEntry {
            id: "hello".into(),
            // SHA-256 of "hello world"
            sha256: Some(
                "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9".into(),
            ),
            size: None,
        };
        assert!(verify_integrity(&entry, b"hello world").is_ok());
        assert!(matches!(
            verify_integrity(&entry, b"tampered"),
            Err(FetchError::Integrity { .. })
        ));

        let unchecked = ModuleEntry {
            sha256: None,
            ..entry
        };
        assert!(verify_integrity(&unchecked, b"anything").is_ok());
    }

    #[tokio::test]
    async fn static_source_serves_listed_modules() {
        let source = StaticReferenceSource::new()
            .with_module("a", b"exports".to_vec())
            .with_unavailable("b");
        let manifest = source.fetch_manifest().await.unwrap();
        assert_eq!(manifest.module_ids(), vec!["a", "b"]);
        assert_eq!(source.fetch_module("a").await.unwrap(), b"exports");
        assert!(source.fetch_module("b").await.is_err());
    }

    #[tokio::test]
    async fn directory_source_reads_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("manifest.json"), MANIFEST).unwrap();
        std::fs::write(tmp.path().join("alpha.wasm"), b"alpha").unwrap();

        let source = DirectoryReferenceSource::new(tmp.path());
        let manifest = source.fetch_manifest().await.unwrap();
        assert_eq!(manifest.modules.len(), 3);
        assert_eq!(source.fetch_module("alpha.wasm").await.unwrap(), b"alpha");
        assert!(matches!(
            source.fetch_module("zeta.wasm").await,
            Err(FetchError::Io(_))
        ));
        assert!(matches!(
            source.fetch_module("../etc/passwd").await,
            Err(FetchError::Module { .. })
        ));
    }

    #[tokio::test]
    async fn http_source_fetches_manifest_and_modules() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_framework/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(MANIFEST))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_framework/alpha.wasm"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"alpha".to_vec()))
            .mount(&server)
            .await;

        let source = HttpReferenceSource::new(format!("{}/_framework/", server.uri()));
        let manifest = source.fetch_manifest().await.unwrap();
        assert_eq!(manifest.module_ids()[1], "alpha.wasm");
        assert_eq!(source.fetch_module("alpha.wasm").await.unwrap(), b"alpha");

        let err = source.fetch_module("zeta.wasm").await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }
}
