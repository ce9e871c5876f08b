//! Metadata manifests for sharing stage directories.
//!
//! `metadata.yaml` lists every tracked file of a directory with its SHA-1.
//! `stagehand metadata` writes it, `stagehand get` downloads a published
//! directory by reading the remote manifest and fetching each listed file.
//!
//! Re-fetching into a directory is refused when the local copy came from a
//! different source or when a tracked file was edited locally, so local work
//! is never silently overwritten.

use crate::error::{Result, StagehandError};
use crate::handlers::HandlerRegistry;
use crate::stage::list_stage_files;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info};
use url::Url;

/// Manifest file name
pub const METADATA_FILE: &str = "metadata.yaml";

const DEFAULT_DESCRIPTION: &str = "edit me";

/// Contents of `metadata.yaml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    /// URL the directory was fetched from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stagehand_version: String,
    /// Relative path (always `/`-separated) → hashes
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub sha1: String,
}

impl Metadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            description: DEFAULT_DESCRIPTION.to_string(),
            stagehand_version: env!("CARGO_PKG_VERSION").to_string(),
            files: BTreeMap::new(),
        }
    }

    /// Load `dir/metadata.yaml` if it exists
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let metadata = serde_yaml::from_str(&content).map_err(|e| {
            StagehandError::manifest(format!("malformed {}: {}", path.display(), e))
        })?;
        debug!("metadata loaded: {}", path.display());
        Ok(Some(metadata))
    }

    /// Write to `dir/metadata.yaml`, returning the path
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(METADATA_FILE);
        fs::write(&path, serde_yaml::to_string(self)?)?;
        Ok(path)
    }
}

/// SHA-1 of a file's content as lowercase hex
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha1::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-1 of in-memory content as lowercase hex
pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Build the manifest for `dir`: every file some handler would process,
/// plus the explicitly included extras.
pub fn collect_metadata(
    dir: &Path,
    registry: &HandlerRegistry,
    skip_dir: &str,
    includes: &[String],
) -> Result<Metadata> {
    if !dir.is_dir() {
        return Err(StagehandError::config(format!(
            "no such directory: {}",
            dir.display()
        )));
    }

    let name = fs::canonicalize(dir)?
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut metadata = Metadata::new(name);

    for file in list_stage_files(dir, skip_dir)? {
        let Ok(relative) = file.strip_prefix(dir) else {
            continue;
        };
        if relative == Path::new(METADATA_FILE) || registry.resolve(&file).is_none() {
            continue;
        }
        metadata
            .files
            .insert(manifest_key(relative), FileEntry { sha1: hash_file(&file)? });
    }

    for include in includes {
        let path = dir.join(include);
        if !path.is_file() {
            return Err(StagehandError::config(format!(
                "requested include {} not found",
                path.display()
            )));
        }
        metadata.files.insert(
            manifest_key(Path::new(include)),
            FileEntry {
                sha1: hash_file(&path)?,
            },
        );
    }

    Ok(metadata)
}

/// Collect and save the manifest, keeping a description already written there
pub fn write_metadata(
    dir: &Path,
    registry: &HandlerRegistry,
    skip_dir: &str,
    includes: &[String],
) -> Result<PathBuf> {
    info!(
        "collecting metadata for {} (includes: {:?})",
        dir.display(),
        includes
    );
    let mut metadata = collect_metadata(dir, registry, skip_dir, includes)?;
    if let Some(existing) = Metadata::load(dir)? {
        metadata.description = existing.description;
        metadata.source = existing.source;
    }
    let path = metadata.save(dir)?;
    info!("wrote {} ({} file(s))", path.display(), metadata.files.len());
    Ok(path)
}

fn manifest_key(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// True when fetching `url` into `dir` cannot clobber local work.
///
/// A directory without a manifest is always safe. Otherwise the manifest's
/// source must equal `url` and no tracked file may differ from its hash.
/// Tracked files that were deleted locally do not block the update.
pub fn check_ok_to_update(dir: &Path, url: &str) -> Result<bool> {
    let Some(local) = Metadata::load(dir)? else {
        return Ok(true);
    };

    if local.source.as_deref() != Some(url) {
        error!(
            "{} source {:?} does not match requested {} - try another directory",
            dir.join(METADATA_FILE).display(),
            local.source,
            url
        );
        return Ok(false);
    }

    let mut safe = true;
    for (name, entry) in &local.files {
        let path = dir.join(name);
        if path.exists() && hash_file(&path)? != entry.sha1 {
            error!("{} MODIFIED - delete it and retry to overwrite", path.display());
            safe = false;
        }
    }
    Ok(safe)
}

/// URL of `filename` inside the remote directory `base`.
///
/// `base` may point at the directory itself or at its `metadata.yaml`.
pub fn file_url(base: &str, filename: &str) -> Result<String> {
    let mut url =
        Url::parse(base).map_err(|e| StagehandError::fetch(format!("invalid URL {}: {}", base, e)))?;

    let mut path = url.path().trim_end_matches('/').to_string();
    if let Some(dir) = path.strip_suffix(&format!("/{}", METADATA_FILE)) {
        path = dir.to_string();
    }
    path.push('/');
    path.push_str(filename);
    url.set_path(&path);
    Ok(url.to_string())
}

/// URL of the manifest for a remote directory
pub fn metadata_url(url: &str) -> Result<String> {
    file_url(url, METADATA_FILE)
}

/// Where remote files come from
pub trait RemoteSource {
    fn get(&self, url: &str) -> Result<Vec<u8>>;
}

/// Plain HTTP(S) downloads
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpSource;

impl RemoteSource for HttpSource {
    fn get(&self, url: &str) -> Result<Vec<u8>> {
        debug!("GET {}", url);
        let mut response = ureq::get(url)
            .call()
            .map_err(|e| StagehandError::fetch(format!("{}: {}", url, e)))?;
        response
            .body_mut()
            .read_to_vec()
            .map_err(|e| StagehandError::fetch(format!("{}: {}", url, e)))
    }
}

fn validate_remote_path(name: &str) -> Result<()> {
    let path = Path::new(name);
    let plain = !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(())
    } else {
        Err(StagehandError::manifest(format!(
            "refusing to write outside the target directory: {}",
            name
        )))
    }
}

/// Download the directory published at `url` into `dir`.
///
/// Every file is verified against the remote manifest before any is written.
/// The manifest is saved last with `source` set to `url`.
pub fn fetch(dir: &Path, url: &str, source: &dyn RemoteSource) -> Result<Metadata> {
    fs::create_dir_all(dir)?;

    if !check_ok_to_update(dir, url)? {
        return Err(StagehandError::manifest(format!(
            "{} has local changes or a different source, not updating",
            dir.display()
        )));
    }

    let manifest = source.get(&metadata_url(url)?)?;
    let mut metadata: Metadata = serde_yaml::from_slice(&manifest)
        .map_err(|e| StagehandError::fetch(format!("malformed remote manifest: {}", e)))?;

    // Nothing is written until every file has been downloaded and verified
    let mut downloads = Vec::with_capacity(metadata.files.len());
    for (name, entry) in &metadata.files {
        validate_remote_path(name)?;
        let remote = file_url(url, name)?;
        info!("downloading {}", remote);

        let content = source.get(&remote)?;
        let actual = hash_bytes(&content);
        if actual != entry.sha1 {
            return Err(StagehandError::manifest(format!(
                "hash mismatch for {}: expected {}, got {}",
                name, entry.sha1, actual
            )));
        }
        downloads.push((dir.join(name), content));
    }

    for (local, content) in downloads {
        debug!("writing {}", local.display());
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&local, content)?;
    }

    metadata.source = Some(url.to_string());
    metadata.save(dir)?;
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::ScriptHandler;
    use std::collections::HashMap;

    const REMOTE_DIR: &str = "https://stacks.internal.test/aws/eks-cluster";

    struct FakeRemote(HashMap<String, Vec<u8>>);

    impl RemoteSource for FakeRemote {
        fn get(&self, url: &str) -> Result<Vec<u8>> {
            self.0
                .get(url)
                .cloned()
                .ok_or_else(|| StagehandError::fetch(format!("404: {}", url)))
        }
    }

    fn sh_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(".sh", Box::new(ScriptHandler));
        registry
    }

    fn remote_with(files: &[(&str, &str)]) -> FakeRemote {
        let mut metadata = Metadata::new("eks-cluster");
        let mut content = HashMap::new();
        for (name, body) in files {
            metadata.files.insert(
                name.to_string(),
                FileEntry {
                    sha1: hash_bytes(body.as_bytes()),
                },
            );
            content.insert(file_url(REMOTE_DIR, name).unwrap(), body.as_bytes().to_vec());
        }
        content.insert(
            metadata_url(REMOTE_DIR).unwrap(),
            serde_yaml::to_string(&metadata).unwrap().into_bytes(),
        );
        FakeRemote(content)
    }

    #[test]
    fn test_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "abc").unwrap();
        assert_eq!(
            hash_file(&file).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(hash_bytes(b"abc"), hash_file(&file).unwrap());
    }

    #[test]
    fn test_metadata_url() {
        assert_eq!(
            metadata_url(REMOTE_DIR).unwrap(),
            format!("{}/metadata.yaml", REMOTE_DIR)
        );
        assert_eq!(
            metadata_url(&format!("{}/metadata.yaml", REMOTE_DIR)).unwrap(),
            format!("{}/metadata.yaml", REMOTE_DIR)
        );
        assert_eq!(
            file_url(&format!("{}/", REMOTE_DIR), "0010/vpc.sh").unwrap(),
            format!("{}/0010/vpc.sh", REMOTE_DIR)
        );
        assert!(metadata_url("not a url").is_err());
    }

    #[test]
    fn test_collect_tracks_handled_files_and_includes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("0010/download")).unwrap();
        fs::write(dir.path().join("0010/vpc.sh"), "echo vpc").unwrap();
        fs::write(dir.path().join("0010/notes.txt"), "notes").unwrap();
        fs::write(dir.path().join("0010/download/big.sh"), "x").unwrap();
        fs::write(dir.path().join("README.md"), "readme").unwrap();

        let includes = vec!["README.md".to_string()];
        let metadata = collect_metadata(dir.path(), &sh_registry(), "download", &includes).unwrap();

        let tracked: Vec<&str> = metadata.files.keys().map(String::as_str).collect();
        assert_eq!(tracked, vec!["0010/vpc.sh", "README.md"]);
        assert_eq!(metadata.files["0010/vpc.sh"].sha1, hash_bytes(b"echo vpc"));
        assert_eq!(metadata.description, "edit me");
    }

    #[test]
    fn test_collect_missing_include() {
        let dir = tempfile::tempdir().unwrap();
        let includes = vec!["missing.txt".to_string()];
        let err = collect_metadata(dir.path(), &sh_registry(), "download", &includes).unwrap_err();
        assert!(matches!(err, StagehandError::Config(_)));
    }

    #[test]
    fn test_write_keeps_description() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.sh"), "true").unwrap();
        let mut existing = Metadata::new("x");
        existing.description = "network stack".to_string();
        existing.save(dir.path()).unwrap();

        write_metadata(dir.path(), &sh_registry(), "download", &[]).unwrap();
        let saved = Metadata::load(dir.path()).unwrap().unwrap();
        assert_eq!(saved.description, "network stack");
        assert!(saved.files.contains_key("a.sh"));
    }

    #[test]
    fn test_ok_to_update() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_ok_to_update(dir.path(), REMOTE_DIR).unwrap());

        fs::write(dir.path().join("a.sh"), "original").unwrap();
        let mut metadata = Metadata::new("x");
        metadata.source = Some(REMOTE_DIR.to_string());
        metadata.files.insert(
            "a.sh".to_string(),
            FileEntry {
                sha1: hash_bytes(b"original"),
            },
        );
        metadata.files.insert(
            "deleted.sh".to_string(),
            FileEntry {
                sha1: hash_bytes(b"gone"),
            },
        );
        metadata.save(dir.path()).unwrap();

        assert!(check_ok_to_update(dir.path(), REMOTE_DIR).unwrap());
        assert!(!check_ok_to_update(dir.path(), "https://example.com/other").unwrap());

        fs::write(dir.path().join("a.sh"), "edited").unwrap();
        assert!(!check_ok_to_update(dir.path(), REMOTE_DIR).unwrap());
    }

    #[test]
    fn test_fetch_downloads_and_records_source() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("eks");
        let remote = remote_with(&[("0010/vpc.sh", "echo vpc\n"), ("README.md", "hi")]);

        let metadata = fetch(&target, REMOTE_DIR, &remote).unwrap();
        assert_eq!(metadata.source.as_deref(), Some(REMOTE_DIR));
        assert_eq!(fs::read_to_string(target.join("0010/vpc.sh")).unwrap(), "echo vpc\n");

        let saved = Metadata::load(&target).unwrap().unwrap();
        assert_eq!(saved.source.as_deref(), Some(REMOTE_DIR));

        // Unchanged local copy from the same source may be refreshed
        fetch(&target, REMOTE_DIR, &remote).unwrap();

        fs::write(target.join("README.md"), "local edit").unwrap();
        let err = fetch(&target, REMOTE_DIR, &remote).unwrap_err();
        assert!(matches!(err, StagehandError::Manifest(_)));
        assert_eq!(fs::read_to_string(target.join("README.md")).unwrap(), "local edit");
    }

    #[test]
    fn test_fetch_rejects_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = remote_with(&[("a.sh", "good")]);
        remote
            .0
            .insert(file_url(REMOTE_DIR, "a.sh").unwrap(), b"tampered".to_vec());

        let err = fetch(dir.path(), REMOTE_DIR, &remote).unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
        assert!(!dir.path().join("a.sh").exists());
    }

    #[test]
    fn test_fetch_retry_after_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("eks");
        fetch(&target, REMOTE_DIR, &remote_with(&[("a.sh", "v1"), ("b.sh", "v1")])).unwrap();

        let mut corrupted = remote_with(&[("a.sh", "v2"), ("b.sh", "v2")]);
        corrupted
            .0
            .insert(file_url(REMOTE_DIR, "b.sh").unwrap(), b"garbage".to_vec());
        let err = fetch(&target, REMOTE_DIR, &corrupted).unwrap_err();
        assert!(err.to_string().contains("hash mismatch for b.sh"));

        // The earlier file was not touched, so the copy still matches its manifest
        assert_eq!(fs::read_to_string(target.join("a.sh")).unwrap(), "v1");
        assert!(check_ok_to_update(&target, REMOTE_DIR).unwrap());

        fetch(&target, REMOTE_DIR, &remote_with(&[("a.sh", "v2"), ("b.sh", "v2")])).unwrap();
        assert_eq!(fs::read_to_string(target.join("a.sh")).unwrap(), "v2");
        assert_eq!(fs::read_to_string(target.join("b.sh")).unwrap(), "v2");
    }

    #[test]
    fn test_fetch_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let remote = remote_with(&[("../evil.sh", "x")]);
        let err = fetch(&dir.path().join("t"), REMOTE_DIR, &remote).unwrap_err();
        assert!(matches!(err, StagehandError::Manifest(_)));
        assert!(!dir.path().join("evil.sh").exists());
    }
}
