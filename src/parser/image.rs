use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{FetchError, ResolveError};
use crate::fetch::Fetch;

/// Which content block of a problem an asset belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Condition,
    Solution,
}

impl BlockType {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockType::Condition => "condition",
            BlockType::Solution => "solution",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format detected from the payload's leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Svg,
    Xml,
    Unknown,
}

impl ImageFormat {
    /// Sniff the payload. URL suffixes and declared content types are
    /// never consulted.
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(b"\x89PNG") {
            ImageFormat::Png
        } else if bytes.starts_with(b"\xFF\xD8\xFF") {
            ImageFormat::Jpeg
        } else if bytes.starts_with(b"GIF8") {
            ImageFormat::Gif
        } else if trim_ascii_start(bytes).starts_with(b"<svg") {
            ImageFormat::Svg
        } else if bytes.starts_with(b"<?xml") {
            ImageFormat::Xml
        } else {
            ImageFormat::Unknown
        }
    }

    /// Stored extension. XML and unclassified payloads are kept as `.svg`:
    /// at this source they are almost always vector diagrams.
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Gif => "gif",
            ImageFormat::Svg | ImageFormat::Xml | ImageFormat::Unknown => "svg",
        }
    }
}

fn trim_ascii_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// One downloaded asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub source_url: String,
    pub block_type: BlockType,
    pub ordinal: usize,
    pub storage_key: String,
    pub format: ImageFormat,
}

/// `{subject}/{problem_id}/{block_type}_{ordinal}.{ext}`
pub fn storage_key(
    subject_code: &str,
    problem_id: &str,
    block_type: BlockType,
    ordinal: usize,
    format: ImageFormat,
) -> String {
    format!(
        "{}/{}/{}_{}.{}",
        subject_code,
        problem_id,
        block_type,
        ordinal,
        format.extension()
    )
}

/// Turns storage keys into the reference embedded in `![img](...)` tokens.
#[derive(Debug, Clone)]
pub struct ReferenceTemplate {
    base: String,
}

impl ReferenceTemplate {
    pub fn new(base: impl Into<String>) -> Self {
        ReferenceTemplate { base: base.into() }
    }

    pub fn reference(&self, storage_key: &str) -> String {
        if self.base.is_empty() || self.base.ends_with('/') {
            format!("{}{}", self.base, storage_key)
        } else {
            format!("{}/{}", self.base, storage_key)
        }
    }

    pub fn token(&self, storage_key: &str) -> String {
        format!("![img]({})", self.reference(storage_key))
    }
}

const PART_SUFFIX: &str = ".part";

/// Bytes are written to `{path}.part` and renamed into place on commit.
/// Dropping the guard uncommitted removes the `.part` file, so the final
/// path only ever holds a complete asset.
struct PendingFile {
    part: PathBuf,
    committed: bool,
}

impl PendingFile {
    fn new(path: &Path) -> Self {
        let mut part = path.as_os_str().to_owned();
        part.push(PART_SUFFIX);
        PendingFile {
            part: PathBuf::from(part),
            committed: false,
        }
    }

    async fn commit(mut self, path: &Path) -> io::Result<()> {
        tokio::fs::rename(&self.part, path).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.part);
        }
    }
}

/// Downloads images and stores them under `{root}/{subject}/{problem_id}/`.
pub struct ImageResolver<F> {
    fetcher: F,
    root: PathBuf,
    deadline: Duration,
}

impl<F: Fetch> ImageResolver<F> {
    pub fn new(fetcher: F, root: impl Into<PathBuf>, deadline: Duration) -> Self {
        ImageResolver {
            fetcher,
            root: root.into(),
            deadline,
        }
    }

    /// Fetch `url`, sniff it and persist it under its storage key.
    /// `url` must already be absolute. The deadline bounds the download;
    /// the local write is not cut short by it.
    pub async fn resolve(
        &self,
        url: &str,
        subject_code: &str,
        problem_id: &str,
        block_type: BlockType,
        ordinal: usize,
    ) -> Result<ImageRef, ResolveError> {
        let bytes = match tokio::time::timeout(self.deadline, self.fetcher.get(url)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(FetchError::new(
                    url,
                    format!("deadline of {:.1}s exceeded", self.deadline.as_secs_f64()),
                )
                .into())
            }
        };
        self.store(url, &bytes, subject_code, problem_id, block_type, ordinal)
            .await
    }

    async fn store(
        &self,
        url: &str,
        bytes: &[u8],
        subject_code: &str,
        problem_id: &str,
        block_type: BlockType,
        ordinal: usize,
    ) -> Result<ImageRef, ResolveError> {
        let format = ImageFormat::sniff(bytes);
        let key = storage_key(subject_code, problem_id, block_type, ordinal, format);

        let dir = self.problem_dir(subject_code, problem_id);
        // create_dir_all treats an existing directory as success, so
        // concurrent workers may race on it.
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let stem = format!("{}_{}", block_type, ordinal);
        remove_stale_variants(&dir, &stem, format.extension()).await;

        let path = self.root.join(&key);
        let pending = PendingFile::new(&path);
        tokio::fs::write(&pending.part, bytes)
            .await
            .map_err(|e| io_error(&pending.part, e))?;

        let written = tokio::fs::metadata(&pending.part)
            .await
            .map_err(|e| io_error(&pending.part, e))?
            .len();
        if written == 0 {
            // `pending` drops here and removes the empty file.
            return Err(ResolveError::EmptyAsset {
                url: url.to_string(),
            });
        }
        pending.commit(&path).await.map_err(|e| io_error(&path, e))?;

        let image = ImageRef {
            source_url: url.to_string(),
            block_type,
            ordinal,
            storage_key: key,
            format,
        };
        debug!(
            url = %image.source_url,
            key = %image.storage_key,
            block = %image.block_type,
            ordinal = image.ordinal,
            format = ?image.format,
            bytes = written,
            "stored image"
        );
        Ok(image)
    }

    /// Remove `{block_type}_{k}.*` for every `k >= keep`, along with any
    /// unfinished `.part` file of the block. Run after a block is extracted
    /// so a re-run that stores fewer images leaves nothing behind.
    pub async fn prune_block(
        &self,
        subject_code: &str,
        problem_id: &str,
        block_type: BlockType,
        keep: usize,
    ) {
        let dir = self.problem_dir(subject_code, problem_id);
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return;
        };
        let prefix = format!("{}_", block_type);
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let digits = rest.split('.').next().unwrap_or_default();
            let Ok(ordinal) = digits.parse::<usize>() else {
                continue;
            };
            if ordinal >= keep || name.ends_with(PART_SUFFIX) {
                debug!(path = %entry.path().display(), "removing leftover image");
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }

    fn problem_dir(&self, subject_code: &str, problem_id: &str) -> PathBuf {
        self.root.join(subject_code).join(problem_id)
    }
}

fn io_error(path: &Path, source: io::Error) -> ResolveError {
    ResolveError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Delete `{stem}.*` files other than `{stem}.{keep_ext}` left by an
/// earlier run whose payload sniffed differently.
async fn remove_stale_variants(dir: &Path, stem: &str, keep_ext: &str) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let same_stem = path.file_stem().and_then(|s| s.to_str()) == Some(stem);
        let ext = path.extension().and_then(|e| e.to_str());
        if same_stem && ext != Some(keep_ext) {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}
