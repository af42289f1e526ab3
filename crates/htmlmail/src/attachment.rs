//! Normalization of heterogeneous attachment inputs.
//!
//! Every input is turned into zero or more [`AttachmentItem`]s. Resolution never fails:
//! inputs that can't be read are dropped and counted in [`ResolveReport::skipped`].

use std::{
    env, fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::utils::{base_name, guess_content_type, resolve_local_path};

/// Upload error code signalling a successful upload.
pub const UPLOAD_OK: i64 = 0;
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentOrigin {
    FilePath,
    UploadedTemp,
    InlineData,
    Remote,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentItem {
    display_name: String,
    content_type: String,
    content: Vec<u8>,
    origin: AttachmentOrigin,
}

impl AttachmentItem {
    /// Create new [`AttachmentItem`]; content type is guessed from `display_name`.
    #[must_use]
    pub fn new<S>(display_name: S, content: Vec<u8>, origin: AttachmentOrigin) -> Self
    where
        S: Into<String>,
    {
        let display_name = display_name.into();
        Self {
            content_type: guess_content_type(&display_name),
            display_name,
            content,
            origin,
        }
    }

    #[must_use]
    pub fn with_content_type<S>(mut self, content_type: S) -> Self
    where
        S: Into<String>,
    {
        self.content_type = content_type.into();
        self
    }

    /// Getter for `display_name`.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Getter for `content_type`.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Getter for `content`.
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Getter for `origin`.
    #[must_use]
    pub fn origin(&self) -> AttachmentOrigin {
        self.origin
    }

    pub(crate) fn into_parts(self) -> (String, String, Vec<u8>) {
        (self.display_name, self.content_type, self.content)
    }
}

/// A form field value that is either scalar or an array of parallel values.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

/// Uploaded-file descriptor as handed over by a web framework.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct UploadedFiles {
    pub tmp_name: OneOrMany<String>,
    pub name: OneOrMany<String>,
    pub error: OneOrMany<i64>,
}

impl UploadedFiles {
    #[must_use]
    pub fn single<T, N>(tmp_name: T, name: N, error: i64) -> Self
    where
        T: Into<String>,
        N: Into<String>,
    {
        Self {
            tmp_name: OneOrMany::One(tmp_name.into()),
            name: OneOrMany::One(name.into()),
            error: OneOrMany::One(error),
        }
    }

    /// Flatten into `(tmp_name, name, error)` triples. Surplus values of longer arrays
    /// are ignored.
    fn into_entries(self) -> Vec<(String, String, i64)> {
        let tmp_names = self.tmp_name.into_vec();
        let names = self.name.into_vec();
        let errors = self.error.into_vec();
        if tmp_names.len() != names.len() || names.len() != errors.len() {
            warn!(
                "Uploaded file descriptor has mismatched lengths: {} tmp_name, {} name, {} error",
                tmp_names.len(),
                names.len(),
                errors.len()
            );
        }
        tmp_names
            .into_iter()
            .zip(names)
            .zip(errors)
            .map(|((tmp_name, name), error)| (tmp_name, name, error))
            .collect()
    }

    fn len(&self) -> usize {
        match &self.tmp_name {
            OneOrMany::One(_) => 1,
            OneOrMany::Many(values) => values.len(),
        }
    }
}

/// Supported attachment inputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachmentInput {
    /// File on the local filesystem.
    File { path: PathBuf, name: Option<String> },
    /// One or more uploaded temp files.
    Uploaded(UploadedFiles),
    /// Data URL, bare base64 with a header, local path or remote URL.
    Source { source: String, name: Option<String> },
}

impl AttachmentInput {
    #[must_use]
    pub fn file<P>(path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self::File {
            path: path.into(),
            name: None,
        }
    }

    #[must_use]
    pub fn source<S>(source: S) -> Self
    where
        S: Into<String>,
    {
        Self::Source {
            source: source.into(),
            name: None,
        }
    }

    /// Set an explicit display name. Has no effect on uploaded files, which carry their own.
    #[must_use]
    pub fn named<S>(self, display_name: S) -> Self
    where
        S: Into<String>,
    {
        match self {
            Self::File { path, .. } => Self::File {
                path,
                name: Some(display_name.into()),
            },
            Self::Source { source, .. } => Self::Source {
                source,
                name: Some(display_name.into()),
            },
            uploaded @ Self::Uploaded(_) => uploaded,
        }
    }
}

impl From<UploadedFiles> for AttachmentInput {
    fn from(files: UploadedFiles) -> Self {
        Self::Uploaded(files)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    IoError(#[from] io::Error),

    #[error(transparent)]
    HttpError(#[from] reqwest::Error),

    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),
}

/// Reads content referenced by a string that is neither a local file nor inline data.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError>;
}

/// Fetches `http(s)://` and `file://` URLs, reading anything else from the filesystem.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(FETCH_TIMEOUT)
    }
}

impl HttpFetcher {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: OnceLock::new(),
        }
    }

    /// HTTP client shared by every fetch, built on first use.
    fn client(&self) -> Result<&reqwest::blocking::Client, FetchError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError> {
        let Ok(url) = Url::parse(reference) else {
            return Ok(fs::read(reference)?);
        };
        match url.scheme() {
            "http" | "https" => {
                let response = self.client()?.get(url).send()?.error_for_status()?;
                Ok(response.bytes()?.to_vec())
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|()| FetchError::UnsupportedUrl(reference.to_string()))?;
                Ok(fs::read(path)?)
            }
            // Windows drive letters parse as one-letter schemes.
            scheme if scheme.len() == 1 => Ok(fs::read(reference)?),
            _ => Err(FetchError::UnsupportedUrl(reference.to_string())),
        }
    }
}

/// Items resolved from a batch of inputs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolveReport {
    pub items: Vec<AttachmentItem>,
    /// Inputs (or uploaded entries) that were dropped.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct AttachmentResolver {
    upload_dir: PathBuf,
    fetcher: Arc<dyn Fetcher>,
}

impl fmt::Debug for AttachmentResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentResolver")
            .field("upload_dir", &self.upload_dir)
            .finish_non_exhaustive()
    }
}

impl Default for AttachmentResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl AttachmentResolver {
    /// Resolver accepting uploads from the system temp directory and fetching over HTTP.
    #[must_use]
    pub fn new() -> Self {
        Self {
            upload_dir: env::temp_dir(),
            fetcher: Arc::new(HttpFetcher::default()),
        }
    }

    /// Directory uploaded temp files must live in to be accepted.
    #[must_use]
    pub fn with_upload_dir<P>(mut self, upload_dir: P) -> Self
    where
        P: Into<PathBuf>,
    {
        self.upload_dir = upload_dir.into();
        self
    }

    #[must_use]
    pub fn with_fetcher<F>(mut self, fetcher: F) -> Self
    where
        F: Fetcher + 'static,
    {
        self.fetcher = Arc::new(fetcher);
        self
    }

    /// Resolve a single input. Unreadable inputs yield no items.
    #[must_use]
    pub fn resolve(&self, input: AttachmentInput) -> Vec<AttachmentItem> {
        self.resolve_counted(input).0
    }

    /// Resolve many inputs in order, counting what was dropped.
    pub fn resolve_all<I>(&self, inputs: I) -> ResolveReport
    where
        I: IntoIterator<Item = AttachmentInput>,
    {
        let mut report = ResolveReport::default();
        for input in inputs {
            let (items, skipped) = self.resolve_counted(input);
            report.items.extend(items);
            report.skipped += skipped;
        }
        report
    }

    fn resolve_counted(&self, input: AttachmentInput) -> (Vec<AttachmentItem>, usize) {
        match input {
            AttachmentInput::File { path, name } => {
                let items: Vec<_> = self.resolve_file(&path, name).into_iter().collect();
                let skipped = 1 - items.len();
                (items, skipped)
            }
            AttachmentInput::Uploaded(files) => {
                let total = files.len();
                let items = self.resolve_uploaded(files);
                let skipped = total.saturating_sub(items.len());
                (items, skipped)
            }
            AttachmentInput::Source { source, name } => {
                let items: Vec<_> = self.resolve_source(&source, name).into_iter().collect();
                let skipped = 1 - items.len();
                (items, skipped)
            }
        }
    }

    fn resolve_file(&self, path: &Path, name: Option<String>) -> Option<AttachmentItem> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(err) => {
                warn!("Skipping attachment {}: {err}", path.display());
                return None;
            }
        };
        let name = name
            .or_else(|| base_name(path))
            .unwrap_or_else(timestamp_name);
        debug!("Attaching file {} as {name}", path.display());
        Some(AttachmentItem::new(name, content, AttachmentOrigin::FilePath))
    }

    fn resolve_uploaded(&self, files: UploadedFiles) -> Vec<AttachmentItem> {
        files
            .into_entries()
            .into_iter()
            .filter_map(|(tmp_name, name, error)| {
                if error != UPLOAD_OK {
                    warn!("Skipping upload {name}: error code {error}");
                    return None;
                }
                let tmp_path = Path::new(&tmp_name);
                if !self.is_upload(tmp_path) {
                    warn!("Skipping upload {name}: {tmp_name} is not an uploaded file");
                    return None;
                }
                let content = match fs::read(tmp_path) {
                    Ok(content) => content,
                    Err(err) => {
                        warn!("Skipping upload {name}: {err}");
                        return None;
                    }
                };
                let name = if name.is_empty() {
                    base_name(tmp_path).unwrap_or_else(timestamp_name)
                } else {
                    name
                };
                debug!("Attaching upload {tmp_name} as {name}");
                Some(AttachmentItem::new(
                    name,
                    content,
                    AttachmentOrigin::UploadedTemp,
                ))
            })
            .collect()
    }

    /// Whether `path` is a regular file inside the upload directory.
    fn is_upload(&self, path: &Path) -> bool {
        let (Ok(path), Ok(upload_dir)) = (path.canonicalize(), self.upload_dir.canonicalize())
        else {
            return false;
        };
        path.starts_with(upload_dir) && path.is_file()
    }

    /// An existing local file wins over inline data, which wins over fetching.
    fn resolve_source(&self, source: &str, name: Option<String>) -> Option<AttachmentItem> {
        let inline = source.split_once(',');

        if let Some(path) = resolve_local_path(source, None) {
            return self.resolve_file(&path, name);
        }

        if let Some((header, payload)) = inline {
            return decode_inline(header, payload, name);
        }

        match self.fetcher.fetch(source) {
            Ok(content) => {
                let name = name
                    .or_else(|| remote_name(source))
                    .unwrap_or_else(timestamp_name);
                debug!("Attaching fetched {source} as {name}");
                Some(AttachmentItem::new(name, content, AttachmentOrigin::Remote))
            }
            Err(err) => {
                warn!("Skipping attachment {source}: {err}");
                None
            }
        }
    }
}

/// Decode the part after the first comma of a data URL (or `base64,<data>` string).
fn decode_inline(header: &str, payload: &str, name: Option<String>) -> Option<AttachmentItem> {
    let header = header.trim();
    let mut params = header
        .strip_prefix("data:")
        .unwrap_or(header)
        .split(';')
        .map(str::trim);
    let media_type = params
        .next()
        .filter(|media_type| media_type.contains('/'))
        .map(str::to_ascii_lowercase);
    let is_base64 = header
        .split(';')
        .any(|param| param.trim().eq_ignore_ascii_case("base64"));

    let content = if is_base64 {
        let payload: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        match STANDARD.decode(payload) {
            Ok(content) => content,
            Err(err) => {
                warn!("Skipping inline attachment with invalid base64: {err}");
                return None;
            }
        }
    } else {
        payload.as_bytes().to_vec()
    };

    let item = AttachmentItem::new(
        name.unwrap_or_else(timestamp_name),
        content,
        AttachmentOrigin::InlineData,
    );
    debug!("Attaching inline data as {}", item.display_name());
    Some(match media_type {
        Some(media_type) => item.with_content_type(media_type),
        None => item,
    })
}

/// Last non-empty path segment of a URL or path.
fn remote_name(source: &str) -> Option<String> {
    match Url::parse(source) {
        Ok(url) if url.scheme().len() > 1 => url
            .path_segments()?
            .filter(|segment| !segment.is_empty())
            .last()
            .map(str::to_string),
        _ => base_name(Path::new(source)),
    }
}

// Millisecond resolution; names generated within the same millisecond collide.
fn timestamp_name() -> String {
    Utc::now().format("%Y%m%d%H%M%S%3f").to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;

    struct StubFetcher(HashMap<String, Vec<u8>>);

    impl Fetcher for StubFetcher {
        fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError> {
            self.0
                .get(reference)
                .cloned()
                .ok_or_else(|| FetchError::UnsupportedUrl(reference.to_string()))
        }
    }

    fn resolver(upload_dir: &Path) -> AttachmentResolver {
        let remote = HashMap::from([(
            "https://example.com/files/report.pdf".to_string(),
            b"%PDF".to_vec(),
        )]);
        AttachmentResolver::new()
            .with_upload_dir(upload_dir)
            .with_fetcher(StubFetcher(remote))
    }

    #[test]
    fn test_file_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "notes").unwrap();
        let resolver = resolver(dir.path());

        let items = resolver.resolve(AttachmentInput::file(&path));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].display_name(), "notes.txt");
        assert_eq!(items[0].content(), b"notes");
        assert_eq!(items[0].content_type(), "text/plain");
        assert_eq!(items[0].origin(), AttachmentOrigin::FilePath);

        let items = resolver.resolve(AttachmentInput::file(&path).named("renamed.md"));
        assert_eq!(items[0].display_name(), "renamed.md");
    }

    #[test]
    fn test_missing_file_is_dropped() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(dir.path());
        let report = resolver.resolve_all([
            AttachmentInput::file(dir.path().join("missing.txt")),
            AttachmentInput::file(dir.path()),
        ]);
        assert!(report.items.is_empty());
        assert_eq!(report.skipped, 2);
    }

    #[test]
    fn test_uploaded_files_keep_successful_entries() {
        let dir = TempDir::new().unwrap();
        let ok = dir.path().join("php1234");
        let failed = dir.path().join("php5678");
        fs::write(&ok, "uploaded").unwrap();
        fs::write(&failed, "partial").unwrap();

        let descriptor: UploadedFiles = serde_json::from_value(serde_json::json!({
            "tmp_name": [ok.to_string_lossy(), failed.to_string_lossy()],
            "name": ["invoice.pdf", "broken.pdf"],
            "error": [0, 3],
            "size": [8, 7],
        }))
        .unwrap();

        let report = resolver(dir.path()).resolve_all([descriptor.into()]);
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.skipped, 1);
        let item = &report.items[0];
        assert_eq!(item.display_name(), "invoice.pdf");
        assert_eq!(item.content(), b"uploaded");
        assert_eq!(item.content_type(), "application/pdf");
        assert_eq!(item.origin(), AttachmentOrigin::UploadedTemp);
    }

    #[test]
    fn test_uploaded_file_outside_upload_dir_is_rejected() {
        let uploads = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let path = elsewhere.path().join("passwd");
        fs::write(&path, "root:x:0:0").unwrap();

        let descriptor = UploadedFiles::single(path.to_string_lossy(), "passwd", UPLOAD_OK);
        assert!(resolver(uploads.path()).resolve(descriptor.into()).is_empty());
    }

    #[test]
    fn test_scalar_upload_descriptor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tmp_upload");
        fs::write(&path, "data").unwrap();

        let descriptor: UploadedFiles = serde_json::from_value(serde_json::json!({
            "tmp_name": path.to_string_lossy(),
            "name": "photo.png",
            "error": 0,
        }))
        .unwrap();
        let items = resolver(dir.path()).resolve(descriptor.into());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].display_name(), "photo.png");
        assert_eq!(items[0].content_type(), "image/png");
    }

    #[test]
    fn test_base64_data_url() {
        let dir = TempDir::new().unwrap();
        let input = AttachmentInput::source("data:text/plain;base64,SGVsbG8=");
        let items = resolver(dir.path()).resolve(input);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content(), b"Hello");
        assert_eq!(items[0].content_type(), "text/plain");
        assert_eq!(items[0].origin(), AttachmentOrigin::InlineData);
        // Timestamp name: digits only.
        assert!(items[0].display_name().chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_raw_and_invalid_inline_data() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(dir.path());

        let input = AttachmentInput::source("data:text/csv,a,b\n1,2").named("t.csv");
        let items = resolver.resolve(input);
        assert_eq!(items[0].content(), b"a,b\n1,2");
        assert_eq!(items[0].display_name(), "t.csv");
        assert_eq!(items[0].content_type(), "text/csv");

        let items = resolver.resolve(AttachmentInput::source("base64,SGk=").named("hi.txt"));
        assert_eq!(items[0].content(), b"Hi");
        assert_eq!(items[0].content_type(), "text/plain");

        let report = resolver.resolve_all([AttachmentInput::source("data:;base64,***")]);
        assert!(report.items.is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_local_file_wins_over_inline_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a,b.txt");
        fs::write(&path, "file contents").unwrap();

        let items = resolver(dir.path()).resolve(AttachmentInput::source(path.to_string_lossy()));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content(), b"file contents");
        assert_eq!(items[0].display_name(), "a,b.txt");
        assert_eq!(items[0].origin(), AttachmentOrigin::FilePath);
    }

    #[test]
    fn test_remote_source_is_fetched() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(dir.path());

        let input = AttachmentInput::source("https://example.com/files/report.pdf");
        let items = resolver.resolve(input);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].display_name(), "report.pdf");
        assert_eq!(items[0].content(), b"%PDF");
        assert_eq!(items[0].origin(), AttachmentOrigin::Remote);

        let report = resolver.resolve_all([AttachmentInput::source("https://example.com/404")]);
        assert!(report.items.is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_http_fetcher_reads_local_references() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("local.bin");
        fs::write(&path, [1u8, 2, 3]).unwrap();

        let fetcher = HttpFetcher::default();
        assert_eq!(fetcher.fetch(&path.to_string_lossy()).unwrap(), vec![1, 2, 3]);
        let url = Url::from_file_path(&path).unwrap();
        assert_eq!(fetcher.fetch(url.as_str()).unwrap(), vec![1, 2, 3]);
        assert!(fetcher.fetch("ftp://example.com/file").is_err());
        assert!(fetcher.client.get().is_none());
    }

    #[test]
    fn test_http_fetcher_reuses_client() {
        let fetcher = HttpFetcher::new(Duration::from_secs(1));
        let first: *const reqwest::blocking::Client = fetcher.client().unwrap();
        let second: *const reqwest::blocking::Client = fetcher.client().unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_remote_name() {
        assert_eq!(
            remote_name("https://example.com/a/b/c.zip?x=1").as_deref(),
            Some("c.zip")
        );
        assert_eq!(remote_name("https://example.com/"), None);
        assert_eq!(remote_name("dir/file.txt").as_deref(), Some("file.txt"));
    }
}
