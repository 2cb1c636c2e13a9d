//! File system API consumed by the script engine.
//!
//! All paths go through the path mapper and must land under the app's
//! install root or one of the shared stores (models, cache, the app's
//! venv). Writes are atomic (tmp + rename), archive extraction checks
//! every member for traversal, downloads resume partial files and coalesce
//! concurrent fetches of the same target.

use crate::cancel::CancelToken;
use crate::events::EventBus;
use crate::paths::PathMapper;
use futures::StreamExt;
use parking_lot::Mutex;
use pinokiod_core::{DownloadParams, EventKind, HostError, HostResult};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

const PROGRESS_CADENCE: Duration = Duration::from_millis(500);

pub struct FsApi {
    mapper: PathMapper,
    models_root: PathBuf,
    cache_root: PathBuf,
    venvs_root: PathBuf,
    client: reqwest::Client,
    events: EventBus,
    download_timeout: Duration,
    /// Concurrent downloads of one target coalesce on a per-path lock.
    download_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl FsApi {
    pub fn new(
        mapper: PathMapper,
        models_root: PathBuf,
        cache_root: PathBuf,
        venvs_root: PathBuf,
        events: EventBus,
        download_timeout: Duration,
    ) -> HostResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| HostError::internal(err))?;
        Ok(Self {
            mapper,
            models_root,
            cache_root,
            venvs_root,
            client,
            events,
            download_timeout,
            download_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn models_root(&self) -> &Path {
        &self.models_root
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Scope the API to one app's permitted roots.
    pub fn for_app(self: &Arc<Self>, app_id: &str, install_root: PathBuf) -> AppFs {
        AppFs {
            api: Arc::clone(self),
            app_id: app_id.to_string(),
            install_root,
        }
    }
}

#[derive(Clone)]
pub struct AppFs {
    api: Arc<FsApi>,
    app_id: String,
    install_root: PathBuf,
}

impl AppFs {
    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Resolve a script-supplied path against the frame cwd, confined to
    /// the install root and the app's shared stores.
    pub fn resolve(&self, cwd: &Path, raw: &str) -> HostResult<PathBuf> {
        let api = &self.api;
        let venv_root = api.venvs_root.join(&self.app_id);
        let roots = [
            self.install_root.as_path(),
            api.models_root.as_path(),
            api.cache_root.as_path(),
            venv_root.as_path(),
        ];
        api.mapper.resolve_under(cwd, raw, &roots)
    }

    pub async fn write(&self, path: &Path, text: &str) -> HostResult<()> {
        atomic_write(path, text.as_bytes()).await
    }

    pub async fn read(&self, path: &Path) -> HostResult<String> {
        tokio::fs::read_to_string(path).await.map_err(HostError::io)
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn mkdir(&self, path: &Path) -> HostResult<()> {
        tokio::fs::create_dir_all(path).await.map_err(HostError::io)
    }

    pub async fn readdir(&self, path: &Path) -> HostResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path).await.map_err(HostError::io)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(HostError::io)? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Remove a file, a symlink, or a directory tree.
    pub async fn remove(&self, path: &Path) -> HostResult<()> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(HostError::io(err)),
        };
        if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await.map_err(HostError::io)
        } else {
            tokio::fs::remove_file(path).await.map_err(HostError::io)
        }
    }

    /// Remove an empty directory.
    pub async fn rmdir(&self, path: &Path) -> HostResult<()> {
        tokio::fs::remove_dir(path).await.map_err(HostError::io)
    }

    pub async fn copy(&self, src: &Path, dst: &Path) -> HostResult<()> {
        let src = src.to_path_buf();
        let dst = dst.to_path_buf();
        tokio::task::spawn_blocking(move || copy_recursive(&src, &dst))
            .await
            .map_err(|err| HostError::internal(err))?
    }

    pub async fn rename(&self, src: &Path, dst: &Path) -> HostResult<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(HostError::io)?;
        }
        tokio::fs::rename(src, dst).await.map_err(HostError::io)
    }

    /// Symlink `src` (typically a shared model file) to `dst` inside the
    /// app tree, replacing an existing link.
    pub async fn link(&self, src: &Path, dst: &Path) -> HostResult<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(HostError::io)?;
        }
        match tokio::fs::symlink_metadata(dst).await {
            Ok(meta) if meta.is_symlink() => {
                tokio::fs::remove_file(dst).await.map_err(HostError::io)?;
            }
            Ok(_) => {
                return Err(HostError::internal(format!(
                    "link destination {} already exists",
                    dst.display()
                )));
            }
            Err(_) => {}
        }
        #[cfg(unix)]
        {
            tokio::fs::symlink(src, dst).await.map_err(HostError::io)
        }
        #[cfg(not(unix))]
        {
            let _ = src;
            Err(HostError::internal("symlinks unsupported on this host"))
        }
    }

    /// Download `uri` to `dest`, resuming a smaller partial file and
    /// skipping entirely when a complete file is already present.
    pub async fn download(
        &self,
        params: &DownloadParams,
        dest: &Path,
        cancel: &CancelToken,
    ) -> HostResult<()> {
        let lock = self.api.target_lock(dest);
        let _guard = lock.lock().await;
        cancel.check()?;

        if self.download_is_complete(params, dest).await? {
            tracing::debug!(dest = %dest.display(), "download already complete");
            return Ok(());
        }

        let result = tokio::time::timeout(
            self.api.download_timeout,
            self.download_inner(params, dest, cancel),
        )
        .await;
        match result {
            Ok(inner) => inner?,
            Err(_) => {
                return Err(HostError::Timeout {
                    secs: self.api.download_timeout.as_secs(),
                });
            }
        }

        if let Some(expected) = params.sha256.as_deref() {
            let actual = sha256_file(dest).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                tokio::fs::remove_file(dest).await.ok();
                return Err(HostError::DownloadFailed {
                    reason: format!("checksum mismatch for {}", dest.display()),
                });
            }
        }
        if params.extract {
            self.extract(dest, dest.parent().unwrap_or(Path::new("."))).await?;
        }
        Ok(())
    }

    async fn download_is_complete(
        &self,
        params: &DownloadParams,
        dest: &Path,
    ) -> HostResult<bool> {
        let Ok(meta) = tokio::fs::metadata(dest).await else {
            return Ok(false);
        };
        if !meta.is_file() {
            return Ok(false);
        }
        match (params.size, params.sha256.as_deref()) {
            (Some(size), Some(expected)) => Ok(meta.len() == size
                && sha256_file(dest).await?.eq_ignore_ascii_case(expected)),
            (Some(size), None) => Ok(meta.len() == size),
            (None, Some(expected)) => {
                Ok(sha256_file(dest).await?.eq_ignore_ascii_case(expected))
            }
            // Without size or checksum hints an existing non-empty file is
            // trusted; resumable installs depend on this being a no-op.
            (None, None) => Ok(meta.len() > 0),
        }
    }

    async fn download_inner(
        &self,
        params: &DownloadParams,
        dest: &Path,
        cancel: &CancelToken,
    ) -> HostResult<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(HostError::io)?;
        }
        let partial = dest.with_extension(partial_extension(dest));
        let mut offset = match tokio::fs::metadata(&partial).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        };

        let mut request = self.api.client.get(&params.uri);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await.map_err(|err| HostError::DownloadFailed {
            reason: err.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(HostError::DownloadFailed {
                reason: format!("{} for {}", status, params.uri),
            });
        }
        // Server ignored the range request; start over.
        if offset > 0 && status != reqwest::StatusCode::PARTIAL_CONTENT {
            offset = 0;
        }

        let total = response
            .content_length()
            .map(|len| len + offset)
            .or(params.size);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(offset > 0)
            .write(true)
            .truncate(offset == 0)
            .open(&partial)
            .await
            .map_err(HostError::io)?;

        let mut stream = response.bytes_stream();
        let mut written = offset;
        let mut last_progress = Instant::now();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => {
                    // Keep the partial file so a retry can resume.
                    file.flush().await.ok();
                    return Err(HostError::Cancelled);
                }
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk.map_err(|err| HostError::DownloadFailed {
                reason: err.to_string(),
            })?;
            file.write_all(&bytes).await.map_err(HostError::io)?;
            written += bytes.len() as u64;
            if last_progress.elapsed() >= PROGRESS_CADENCE {
                last_progress = Instant::now();
                self.api.events.emit(
                    EventKind::LogLine {
                        app_id: self.app_id.clone(),
                        stream: "download".into(),
                        line: progress_line(dest, written, total),
                    },
                    None,
                );
            }
        }
        file.flush().await.map_err(HostError::io)?;
        drop(file);
        tokio::fs::rename(&partial, dest).await.map_err(HostError::io)?;
        Ok(())
    }

    /// Extract `.zip`, `.tar`, `.tar.gz`, `.tgz` into `dest` with member
    /// traversal checks.
    pub async fn extract(&self, archive: &Path, dest: &Path) -> HostResult<()> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
            .await
            .map_err(|err| HostError::internal(err))?
    }
}

impl FsApi {
    fn target_lock(&self, dest: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.download_locks.lock();
        Arc::clone(
            locks
                .entry(dest.to_path_buf())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

pub async fn atomic_write(path: &Path, bytes: &[u8]) -> HostResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(HostError::io)?;
    }
    let tmp = path.with_extension(partial_extension(path));
    tokio::fs::write(&tmp, bytes).await.map_err(HostError::io)?;
    tokio::fs::rename(&tmp, path).await.map_err(HostError::io)
}

fn partial_extension(path: &Path) -> String {
    match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    }
}

fn progress_line(dest: &Path, written: u64, total: Option<u64>) -> String {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match total {
        Some(total) if total > 0 => format!(
            "{name}: {:.1}/{:.1} MiB ({}%)",
            written as f64 / (1024.0 * 1024.0),
            total as f64 / (1024.0 * 1024.0),
            written * 100 / total
        ),
        _ => format!("{name}: {:.1} MiB", written as f64 / (1024.0 * 1024.0)),
    }
}

pub async fn sha256_file(path: &Path) -> HostResult<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> HostResult<String> {
        let mut file = std::fs::File::open(&path).map_err(HostError::io)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).map_err(HostError::io)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|err| HostError::internal(err))?
}

fn copy_recursive(src: &Path, dst: &Path) -> HostResult<()> {
    let meta = std::fs::metadata(src).map_err(HostError::io)?;
    if meta.is_file() {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(HostError::io)?;
        }
        std::fs::copy(src, dst).map_err(HostError::io)?;
        return Ok(());
    }
    std::fs::create_dir_all(dst).map_err(HostError::io)?;
    for entry in std::fs::read_dir(src).map_err(HostError::io)? {
        let entry = entry.map_err(HostError::io)?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(HostError::io)?;
        if file_type.is_dir() {
            copy_recursive(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                let link = std::fs::read_link(entry.path()).map_err(HostError::io)?;
                std::os::unix::fs::symlink(link, &target).map_err(HostError::io)?;
            }
        } else {
            std::fs::copy(entry.path(), &target).map_err(HostError::io)?;
        }
    }
    Ok(())
}

fn extract_blocking(archive: &Path, dest: &Path) -> HostResult<()> {
    std::fs::create_dir_all(dest).map_err(HostError::io)?;
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.ends_with(".zip") {
        return extract_zip(archive, dest);
    }
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let file = std::fs::File::open(archive).map_err(HostError::io)?;
        let decoder = flate2::read::GzDecoder::new(file);
        return extract_tar(tar::Archive::new(decoder), dest);
    }
    if name.ends_with(".tar") {
        let file = std::fs::File::open(archive).map_err(HostError::io)?;
        return extract_tar(tar::Archive::new(file), dest);
    }
    Err(HostError::ArchiveInvalid {
        reason: format!("unsupported archive '{name}'"),
    })
}

fn extract_zip(archive: &Path, dest: &Path) -> HostResult<()> {
    let file = std::fs::File::open(archive).map_err(HostError::io)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|err| HostError::ArchiveInvalid {
        reason: err.to_string(),
    })?;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|err| HostError::ArchiveInvalid {
                reason: err.to_string(),
            })?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(HostError::PathEscape {
                path: entry.name().to_string(),
            });
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(HostError::io)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(HostError::io)?;
        }
        let mut out = std::fs::File::create(&target).map_err(HostError::io)?;
        std::io::copy(&mut entry, &mut out).map_err(HostError::io)?;
    }
    Ok(())
}

fn extract_tar<R: std::io::Read>(mut archive: tar::Archive<R>, dest: &Path) -> HostResult<()> {
    let entries = archive.entries().map_err(|err| HostError::ArchiveInvalid {
        reason: err.to_string(),
    })?;
    for entry in entries {
        let mut entry = entry.map_err(|err| HostError::ArchiveInvalid {
            reason: err.to_string(),
        })?;
        let path = entry
            .path()
            .map_err(|err| HostError::ArchiveInvalid {
                reason: err.to_string(),
            })?
            .into_owned();
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(HostError::PathEscape {
                path: path.display().to_string(),
            });
        }
        entry
            .unpack(dest.join(&path))
            .map_err(|err| HostError::ArchiveInvalid {
                reason: err.to_string(),
            })?;
    }
    Ok(())
}
