use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::http::{FetchError, HttpFetch};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("extracting {archive}: {reason}")]
    Extraction { archive: String, reason: String },
    #[error("no JSON payload in {archive}; extracted files kept at {}", .retained_dir.display())]
    NoPayloadFound {
        archive: String,
        retained_dir: PathBuf,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn io_error(context: impl Into<String>) -> impl FnOnce(io::Error) -> ArchiveError {
    let context = context.into();
    move |source| ArchiveError::Io { context, source }
}

/// Extraction directory owned by one cycle. Removed on drop unless retained.
#[derive(Debug)]
pub struct TransientDir {
    path: PathBuf,
    retained: bool,
}

impl TransientDir {
    pub fn create_in(parent: &Path) -> io::Result<Self> {
        let path = parent.join(format!("compatdb-extract-{}", Uuid::new_v4()));
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            retained: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the directory on disk for inspection and hand back its path.
    pub fn retain(mut self) -> PathBuf {
        self.retained = true;
        self.path.clone()
    }

    /// Remove the directory now, reporting the failure instead of logging it.
    pub fn purge(mut self) -> io::Result<()> {
        self.retained = true;
        fs::remove_dir_all(&self.path)
    }
}

impl Drop for TransientDir {
    fn drop(&mut self) {
        if self.retained {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "removing transient directory");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub files: usize,
    pub directories: usize,
    pub skipped: usize,
}

#[derive(Debug)]
pub struct FetchedArchive {
    pub archive: String,
    pub url: String,
    pub archive_sha256: String,
    pub payload: Vec<u8>,
    pub payload_path: PathBuf,
    pub stats: ExtractStats,
    pub extracted: TransientDir,
}

/// Downloads report archives and unpacks the JSON payload inside them.
pub struct ArchiveFetcher {
    http: Arc<dyn HttpFetch>,
    raw_base_url: String,
    work_dir: PathBuf,
}

impl ArchiveFetcher {
    pub fn new(
        http: Arc<dyn HttpFetch>,
        raw_base_url: impl Into<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            http,
            raw_base_url: raw_base_url.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn download_url(&self, archive: &str) -> String {
        format!(
            "{}/{}",
            self.raw_base_url.trim_end_matches('/'),
            archive.trim_start_matches('/')
        )
    }

    pub async fn fetch(&self, archive: &str) -> Result<FetchedArchive, ArchiveError> {
        let url = self.download_url(archive);
        info!(archive, %url, "downloading archive");
        let response = self
            .http
            .get_bytes(&url)
            .await
            .map_err(|source| ArchiveError::Fetch {
                url: url.clone(),
                source,
            })?;
        let archive_sha256 = sha256_hex(&response.body);

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(io_error(format!("creating {}", self.work_dir.display())))?;

        let work_dir = self.work_dir.clone();
        let label = archive.to_string();
        let body = response.body;
        let (extracted, stats, found) = tokio::task::spawn_blocking(move || {
            unpack_download(&work_dir, &label, &body)
        })
        .await
        .map_err(|err| ArchiveError::Extraction {
            archive: archive.to_string(),
            reason: format!("extraction task failed: {err}"),
        })??;

        let Some(payload_path) = found else {
            let retained_dir = extracted.retain();
            warn!(archive, dir = %retained_dir.display(), "no JSON payload found; keeping extracted files");
            return Err(ArchiveError::NoPayloadFound {
                archive: archive.to_string(),
                retained_dir,
            });
        };

        let payload = tokio::fs::read(&payload_path)
            .await
            .map_err(io_error(format!("reading {}", payload_path.display())))?;
        info!(
            archive,
            payload = %payload_path.display(),
            bytes = payload.len(),
            files = stats.files,
            skipped = stats.skipped,
            "extracted archive payload"
        );

        Ok(FetchedArchive {
            archive: archive.to_string(),
            url,
            archive_sha256,
            payload,
            payload_path,
            stats,
            extracted,
        })
    }
}

fn unpack_download(
    work_dir: &Path,
    label: &str,
    body: &[u8],
) -> Result<(TransientDir, ExtractStats, Option<PathBuf>), ArchiveError> {
    let mut download = tempfile::Builder::new()
        .prefix("report")
        .suffix(".tar.gz")
        .tempfile_in(work_dir)
        .map_err(io_error("creating temporary archive file"))?;
    download
        .write_all(body)
        .and_then(|()| download.flush())
        .map_err(io_error("writing temporary archive file"))?;

    let extracted = TransientDir::create_in(work_dir)
        .map_err(io_error(format!("creating extraction dir in {}", work_dir.display())))?;
    let result = extract_tar_gz(download.path(), extracted.path(), label);

    if let Err(err) = download.close() {
        warn!(error = %err, "removing temporary archive file");
    }
    let stats = result?;

    let found = find_json_file(extracted.path())
        .map_err(io_error(format!("walking {}", extracted.path().display())))?;
    Ok((extracted, stats, found))
}

/// Unpack a gzip-compressed tar into `dest`.
///
/// Entries escaping `dest` and directories that cannot be created are logged
/// and skipped. A corrupt or truncated stream, or a file that cannot be
/// written, fails the whole extraction after removing the partial file.
pub fn extract_tar_gz(
    archive_path: &Path,
    dest: &Path,
    label: &str,
) -> Result<ExtractStats, ArchiveError> {
    let extraction = |reason: String| ArchiveError::Extraction {
        archive: label.to_string(),
        reason,
    };

    let mut file = File::open(archive_path)
        .map_err(|err| extraction(format!("opening {}: {err}", archive_path.display())))?;
    let mut magic = [0u8; 2];
    file.read_exact(&mut magic)
        .map_err(|err| extraction(format!("reading gzip header: {err}")))?;
    if magic != GZIP_MAGIC {
        return Err(extraction("not a gzip stream".to_string()));
    }
    file.seek(SeekFrom::Start(0))
        .map_err(|err| extraction(format!("rewinding archive: {err}")))?;

    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let entries = archive
        .entries()
        .map_err(|err| extraction(format!("reading tar stream: {err}")))?;

    let mut stats = ExtractStats::default();
    for entry in entries {
        let mut entry = entry.map_err(|err| extraction(format!("reading tar entry: {err}")))?;
        let relative = match entry.path() {
            Ok(path) => path.into_owned(),
            Err(err) => {
                warn!(archive = label, error = %err, "skipping tar entry with invalid path");
                stats.skipped += 1;
                continue;
            }
        };
        let Some(target) = safe_join(dest, &relative) else {
            warn!(archive = label, entry = %relative.display(), "skipping tar entry outside extraction dir");
            stats.skipped += 1;
            continue;
        };

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            match fs::create_dir_all(&target) {
                Ok(()) => stats.directories += 1,
                Err(err) => {
                    warn!(dir = %target.display(), error = %err, "creating directory");
                    stats.skipped += 1;
                }
            }
            continue;
        }
        if !kind.is_file() {
            debug!(entry = %relative.display(), ?kind, "ignoring non-regular tar entry");
            stats.skipped += 1;
            continue;
        }

        if let Some(parent) = target.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!(dir = %parent.display(), error = %err, "creating directory");
                stats.skipped += 1;
                continue;
            }
        }
        let mut out = File::create(&target)
            .map_err(|err| extraction(format!("creating {}: {err}", target.display())))?;
        if let Err(err) = io::copy(&mut entry, &mut out) {
            drop(out);
            if let Err(remove_err) = fs::remove_file(&target) {
                warn!(file = %target.display(), error = %remove_err, "removing partial file");
            }
            return Err(extraction(format!(
                "writing {}: {err}",
                relative.display()
            )));
        }
        stats.files += 1;
    }

    Ok(stats)
}

fn safe_join(dest: &Path, relative: &Path) -> Option<PathBuf> {
    let mut target = dest.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(target)
}

/// First `.json` file in a depth-first, name-ordered walk of `dir`.
pub fn find_json_file(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if let Some(found) = find_json_file(&path)? {
                return Ok(Some(found));
            }
        } else if file_type.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            return Ok(Some(path));
        }
    }
    Ok(None)
}
