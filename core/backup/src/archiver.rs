//! Consistent, reproducible archives of a live directory tree.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use worldback_common::{Error, Result};

type Blake2b256 = Blake2b<U32>;

const SNAPSHOTS_DIRNAME: &str = "snapshots";
const CAPTURE_DIRNAME: &str = "capture";

/// Copies one file and returns the number of bytes written.
type CopyFn = Arc<dyn Fn(&Path, &Path) -> io::Result<u64> + Send + Sync>;

/// A completely written archive of one source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Local staging location.
    pub path: PathBuf,
    /// Object name used on the remote.
    pub name: String,
    /// Archive size in bytes.
    pub size_bytes: u64,
    /// BLAKE2b-256 of the archive bytes, hex encoded.
    pub checksum: String,
    /// Version tag (`YYYYMMDD-HHMMSS`, UTC).
    pub source_version: String,
    /// When the capture started.
    pub created_at: DateTime<Utc>,
    /// Number of files in the archive.
    pub file_count: usize,
}

impl Snapshot {
    /// Whether the staged file is still present with the recorded size.
    pub fn is_staged(&self) -> bool {
        fs::metadata(&self.path)
            .map(|m| m.is_file() && m.len() == self.size_bytes)
            .unwrap_or(false)
    }

    /// Remove the staged file.
    pub fn discard(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Releases a host write pause when dropped.
pub struct QuiescenceGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl QuiescenceGuard {
    /// Guard that runs `release` when dropped.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for QuiescenceGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Host hook for pausing writes to a source tree.
///
/// Called from a blocking worker. Returns `None` when the host cannot
/// pause; archiving then relies on per-file verification alone.
pub trait Quiescence: Send + Sync {
    /// Pause writes to `source` for at most `timeout`.
    fn acquire(&self, source: &Path, timeout: Duration) -> Option<QuiescenceGuard>;
}

/// Host that never pauses writes.
pub struct NoQuiescence;

impl Quiescence for NoQuiescence {
    fn acquire(&self, _source: &Path, _timeout: Duration) -> Option<QuiescenceGuard> {
        None
    }
}

/// Archiver tuning.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Re-reads of a file that changed while it was copied.
    pub max_read_retries: u32,
    /// Longest time a host write pause is held.
    pub quiescence_timeout: Duration,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            max_read_retries: 3,
            quiescence_timeout: Duration::from_secs(10),
        }
    }
}

/// Produces [`Snapshot`]s under a staging directory.
#[derive(Clone)]
pub struct Archiver {
    staging_dir: PathBuf,
    options: ArchiveOptions,
    quiescence: Arc<dyn Quiescence>,
    copy: CopyFn,
}

impl Archiver {
    /// Create an archiver staging into `staging_dir`.
    pub fn new(
        staging_dir: impl Into<PathBuf>,
        options: ArchiveOptions,
        quiescence: Arc<dyn Quiescence>,
    ) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            options,
            quiescence,
            copy: Arc::new(|from: &Path, to: &Path| fs::copy(from, to)),
        }
    }

    /// Replace the per-file copy, e.g. with one that races a writer.
    #[cfg(test)]
    fn with_copy(
        mut self,
        copy: impl Fn(&Path, &Path) -> io::Result<u64> + Send + Sync + 'static,
    ) -> Self {
        self.copy = Arc::new(copy);
        self
    }

    /// Remove staging leftovers of interrupted runs on a blocking worker.
    ///
    /// Capture directories and partial archives are always removed;
    /// finished snapshots survive only if their file name is in `keep`.
    /// Must not run while an archive is being written.
    pub async fn sweep_staging(&self, keep: Vec<PathBuf>) -> Result<usize> {
        let archiver = self.clone();
        tokio::task::spawn_blocking(move || archiver.sweep_staging_blocking(&keep))
            .await
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    /// Synchronous form of [`sweep_staging`](Self::sweep_staging).
    pub fn sweep_staging_blocking(&self, keep: &[PathBuf]) -> Result<usize> {
        let mut removed = 0;

        for entry in staged_entries(&self.staging_dir.join(CAPTURE_DIRNAME))? {
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove capture leftover {:?}: {}", path, e),
            }
        }

        let kept: HashSet<_> = keep.iter().filter_map(|p| p.file_name()).collect();
        for entry in staged_entries(&self.staging_dir.join(SNAPSHOTS_DIRNAME))? {
            let path = entry.path();
            if !path.is_file() || kept.contains(entry.file_name().as_os_str()) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove orphaned snapshot {:?}: {}", path, e),
            }
        }

        if removed > 0 {
            info!("Removed {} staging leftovers", removed);
        }
        Ok(removed)
    }

    /// Archive `source` on a blocking worker.
    ///
    /// # Postconditions
    /// - The returned snapshot is fully written and fsynced
    /// - No temp file or capture directory is left behind on failure
    ///
    /// # Errors
    /// - `SourceUnavailable`, `Io`, `InconsistentRead`, `Cancelled`
    pub async fn archive(
        &self,
        source: &Path,
        exclude_patterns: &[String],
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        let archiver = self.clone();
        let source = source.to_path_buf();
        let exclude = exclude_patterns.to_vec();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || archiver.archive_blocking(&source, &exclude, &cancel))
            .await
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    /// Archive `source` on the current thread.
    pub fn archive_blocking(
        &self,
        source: &Path,
        exclude_patterns: &[String],
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        check_source(source)?;

        let created_at = Utc::now();
        let source_version = created_at.format("%Y%m%d-%H%M%S").to_string();
        let stem = source_stem(source);
        let name = format!("{}-{}.zip", stem, source_version);
        let unique = Uuid::new_v4().simple().to_string();

        let snapshots_dir = self.staging_dir.join(SNAPSHOTS_DIRNAME);
        let capture_dir = self.staging_dir.join(CAPTURE_DIRNAME).join(&unique);
        fs::create_dir_all(&snapshots_dir)?;
        fs::create_dir_all(&capture_dir)?;

        let final_path = snapshots_dir.join(format!("{}-{}-{}.zip", stem, source_version, &unique[..8]));
        let tmp_path = final_path.with_extension("zip.tmp");

        let result = self
            .capture(source, &capture_dir, exclude_patterns, cancel)
            .and_then(|files| {
                let (size_bytes, checksum) = pack(&capture_dir, &files, &tmp_path, cancel)?;
                fs::rename(&tmp_path, &final_path)?;
                Ok(Snapshot {
                    path: final_path.clone(),
                    name,
                    size_bytes,
                    checksum,
                    source_version,
                    created_at,
                    file_count: files.iter().filter(|f| !f.is_dir).count(),
                })
            });

        if let Err(e) = fs::remove_dir_all(&capture_dir) {
            warn!("Failed to remove capture directory {:?}: {}", capture_dir, e);
        }
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }

        if let Ok(snapshot) = &result {
            info!(
                "Archived {:?}: {} files, {} bytes, checksum {}",
                source, snapshot.file_count, snapshot.size_bytes, snapshot.checksum
            );
        }
        result
    }

    /// Copy the tree into `capture_dir` inside a quiescence window.
    fn capture(
        &self,
        source: &Path,
        capture_dir: &Path,
        exclude_patterns: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<CapturedEntry>> {
        let started = Instant::now();
        let mut guard = self
            .quiescence
            .acquire(source, self.options.quiescence_timeout);
        if guard.is_none() {
            debug!("Host cannot pause writes; relying on per-file verification");
        }

        let mut entries = Vec::new();
        let walker = WalkDir::new(source)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_excluded(e.path(), source, exclude_patterns));

        for entry in walker {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if guard.is_some() && started.elapsed() > self.options.quiescence_timeout {
                warn!("Quiescence window exceeded; releasing host writes early");
                guard = None;
            }

            let entry = entry.map_err(|e| Error::Io(io::Error::from(e)))?;
            let relative = relative_name(entry.path(), source)?;
            let target = capture_dir.join(entry.path().strip_prefix(source).unwrap_or(entry.path()));

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
                entries.push(CapturedEntry {
                    relative,
                    is_dir: true,
                });
            } else if entry.file_type().is_file() {
                if capture_file(
                    entry.path(),
                    &target,
                    self.options.max_read_retries,
                    self.copy.as_ref(),
                )? {
                    entries.push(CapturedEntry {
                        relative,
                        is_dir: false,
                    });
                }
            }
        }

        drop(guard);
        debug!("Captured {} entries in {:?}", entries.len(), started.elapsed());
        Ok(entries)
    }
}

/// One captured tree entry, in archive order.
#[derive(Debug, Clone)]
struct CapturedEntry {
    relative: String,
    is_dir: bool,
}

/// Size and modification time of a file at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

/// A copy is consistent when the file did not change while it was read.
fn read_was_consistent(before: FileStamp, after: FileStamp, copied: u64) -> bool {
    before == after && copied == after.len
}

/// Copy one file, retrying while it changes underneath us.
///
/// Returns `false` if the file disappeared before it could be read.
fn capture_file(
    source: &Path,
    target: &Path,
    max_retries: u32,
    copy: &(dyn Fn(&Path, &Path) -> io::Result<u64> + Send + Sync),
) -> Result<bool> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    for attempt in 0..=max_retries {
        let before = match FileStamp::of(source) {
            Ok(stamp) => stamp,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{:?} vanished before capture, skipping", source);
                return Ok(false);
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let copied = copy(source, target)?;
        let after = FileStamp::of(source)?;

        if read_was_consistent(before, after, copied) {
            return Ok(true);
        }
        debug!(
            "{:?} changed while being read (attempt {}), retrying",
            source,
            attempt + 1
        );
    }

    Err(Error::InconsistentRead(format!(
        "{} kept changing after {} retries",
        source.display(),
        max_retries
    )))
}

/// Write the captured tree as a deterministic zip and hash it.
fn pack(
    capture_dir: &Path,
    entries: &[CapturedEntry],
    tmp_path: &Path,
    cancel: &CancellationToken,
) -> Result<(u64, String)> {
    let file = File::create(tmp_path)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));

    let file_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);
    let dir_options = file_options.unix_permissions(0o755);

    for entry in entries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if entry.is_dir {
            zip.add_directory(format!("{}/", entry.relative), dir_options)
                .map_err(zip_error)?;
        } else {
            zip.start_file(entry.relative.as_str(), file_options)
                .map_err(zip_error)?;
            let mut input = File::open(capture_dir.join(&entry.relative))?;
            io::copy(&mut input, &mut zip)?;
        }
    }

    let mut writer = zip.finish().map_err(zip_error)?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
    file.sync_all()?;
    drop(file);

    checksum_file(tmp_path)
}

/// Size and BLAKE2b-256 hex digest of a file.
pub fn checksum_file(path: &Path) -> Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Blake2b256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((total, hex::encode(hasher.finalize())))
}

/// Entries of `dir`, or none if it does not exist yet.
fn staged_entries(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(entries.collect::<io::Result<Vec<_>>>()?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::Io(e)),
    }
}

fn zip_error(e: zip::result::ZipError) -> Error {
    match e {
        zip::result::ZipError::Io(io) => Error::Io(io),
        other => Error::Io(io::Error::new(io::ErrorKind::Other, other)),
    }
}

fn check_source(source: &Path) -> Result<()> {
    match fs::metadata(source) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(Error::SourceUnavailable(format!(
                "{} is not a directory",
                source.display()
            )))
        }
        Err(e) => {
            return Err(Error::SourceUnavailable(format!(
                "{}: {}",
                source.display(),
                e
            )))
        }
    }
    fs::read_dir(source)
        .map(|_| ())
        .map_err(|e| Error::SourceUnavailable(format!("{}: {}", source.display(), e)))
}

fn source_stem(source: &Path) -> String {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "world".to_string());
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// `/`-separated path of `path` relative to `root`.
fn relative_name(path: &Path, root: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| Error::InvalidInput(format!("{} escapes source", path.display())))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn is_excluded(path: &Path, root: &Path, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let relative = relative_name(path, root).unwrap_or_default();

    patterns
        .iter()
        .any(|p| wildcard_match(p, &file_name) || wildcard_match(p, &relative))
}

/// Match `text` against a pattern where `*` is any run and `?` one char.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn world(temp: &TempDir) -> PathBuf {
        let root = temp.path().join("My World");
        fs::create_dir_all(root.join("region")).unwrap();
        fs::write(root.join("level.dat"), b"level data").unwrap();
        fs::write(root.join("session.lock"), b"lock").unwrap();
        fs::write(root.join("region").join("r.0.0.mca"), vec![7u8; 4096]).unwrap();
        fs::write(root.join("region").join("r.0.1.mca.tmp"), b"partial").unwrap();
        root
    }

    fn archiver(staging: &Path) -> Archiver {
        Archiver::new(staging, ArchiveOptions::default(), Arc::new(NoQuiescence))
    }

    fn defaults() -> Vec<String> {
        vec!["session.lock".to_string(), "*.tmp".to_string()]
    }

    fn zip_names(path: &Path) -> Vec<String> {
        let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*.tmp", "r.0.1.mca.tmp"));
        assert!(wildcard_match("session.lock", "session.lock"));
        assert!(wildcard_match("r.?.0.mca", "r.1.0.mca"));
        assert!(wildcard_match("region/*", "region/r.0.0.mca"));
        assert!(wildcard_match("*", ""));
        assert!(!wildcard_match("*.tmp", "level.dat"));
        assert!(!wildcard_match("?", ""));
    }

    #[test]
    fn test_read_consistency_check() {
        let stamp = FileStamp {
            len: 10,
            modified: Some(SystemTime::UNIX_EPOCH),
        };
        let grown = FileStamp { len: 12, ..stamp };
        let touched = FileStamp {
            modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1)),
            ..stamp
        };

        assert!(read_was_consistent(stamp, stamp, 10));
        assert!(!read_was_consistent(stamp, grown, 12));
        assert!(!read_was_consistent(stamp, touched, 10));
        assert!(!read_was_consistent(stamp, stamp, 8));
    }

    #[test]
    fn test_archive_excludes_and_orders_entries() {
        let temp = TempDir::new().unwrap();
        let source = world(&temp);

        let snapshot = archiver(&temp.path().join("staging"))
            .archive_blocking(&source, &defaults(), &CancellationToken::new())
            .unwrap();

        assert!(snapshot.is_staged());
        assert_eq!(snapshot.file_count, 2);
        assert!(snapshot.name.starts_with("My_World-"));
        assert_eq!(snapshot.checksum.len(), 64);
        assert_eq!(
            zip_names(&snapshot.path),
            vec!["level.dat", "region/", "region/r.0.0.mca"]
        );
    }

    #[test]
    fn test_archive_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let source = world(&temp);
        let archiver = archiver(&temp.path().join("staging"));
        let cancel = CancellationToken::new();

        let first = archiver.archive_blocking(&source, &defaults(), &cancel).unwrap();
        let second = archiver.archive_blocking(&source, &defaults(), &cancel).unwrap();

        assert_ne!(first.path, second.path);
        assert_eq!(first.checksum, second.checksum);
        assert_eq!(first.size_bytes, second.size_bytes);
    }

    #[test]
    fn test_missing_source_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let result = archiver(temp.path()).archive_blocking(
            &temp.path().join("absent"),
            &[],
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::SourceUnavailable(_))));
    }

    #[test]
    fn test_cancelled_archive_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let source = world(&temp);
        let staging = temp.path().join("staging");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = archiver(&staging).archive_blocking(&source, &defaults(), &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));

        let leftovers: Vec<_> = fs::read_dir(staging.join(SNAPSHOTS_DIRNAME))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
        let captures: Vec<_> = fs::read_dir(staging.join(CAPTURE_DIRNAME)).unwrap().collect();
        assert!(captures.is_empty());
    }

    #[test]
    fn test_quiescence_window_is_released() {
        struct CountingHost {
            acquired: Arc<AtomicU32>,
            released: Arc<AtomicU32>,
        }

        impl Quiescence for CountingHost {
            fn acquire(&self, _source: &Path, _timeout: Duration) -> Option<QuiescenceGuard> {
                self.acquired.fetch_add(1, Ordering::SeqCst);
                let released = self.released.clone();
                Some(QuiescenceGuard::new(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                }))
            }
        }

        let temp = TempDir::new().unwrap();
        let source = world(&temp);
        let acquired = Arc::new(AtomicU32::new(0));
        let released = Arc::new(AtomicU32::new(0));
        let host = CountingHost {
            acquired: acquired.clone(),
            released: released.clone(),
        };

        let archiver = Archiver::new(
            temp.path().join("staging"),
            ArchiveOptions::default(),
            Arc::new(host),
        );
        archiver
            .archive_blocking(&source, &defaults(), &CancellationToken::new())
            .unwrap();

        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_archive_and_discard() {
        let temp = TempDir::new().unwrap();
        let source = world(&temp);

        let snapshot = archiver(&temp.path().join("staging"))
            .archive(&source, &defaults(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(snapshot.is_staged());

        snapshot.discard().unwrap();
        assert!(!snapshot.is_staged());
        snapshot.discard().unwrap();
    }

    /// Copies `path`, then appends to it for the first `times` copies of
    /// `level.dat`, as a host writing during capture would.
    fn racing_copy(times: u32) -> impl Fn(&Path, &Path) -> io::Result<u64> + Send + Sync {
        let raced = AtomicU32::new(0);
        move |from: &Path, to: &Path| {
            let copied = fs::copy(from, to)?;
            if from.file_name().is_some_and(|n| n == "level.dat")
                && raced.fetch_add(1, Ordering::SeqCst) < times
            {
                let mut file = fs::OpenOptions::new().append(true).open(from)?;
                file.write_all(b"+")?;
            }
            Ok(copied)
        }
    }

    #[test]
    fn test_file_changing_during_copy_is_read_again() {
        let temp = TempDir::new().unwrap();
        let source = world(&temp);
        let staging = temp.path().join("staging");

        let snapshot = archiver(&staging)
            .with_copy(racing_copy(2))
            .archive_blocking(&source, &defaults(), &CancellationToken::new())
            .unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&snapshot.path).unwrap()).unwrap();
        let mut level = String::new();
        archive
            .by_name("level.dat")
            .unwrap()
            .read_to_string(&mut level)
            .unwrap();
        assert_eq!(level, "level data++");
    }

    #[test]
    fn test_file_that_keeps_changing_fails_archive() {
        let temp = TempDir::new().unwrap();
        let source = world(&temp);
        let staging = temp.path().join("staging");

        let result = archiver(&staging)
            .with_copy(racing_copy(u32::MAX))
            .archive_blocking(&source, &defaults(), &CancellationToken::new());

        match result {
            Err(Error::InconsistentRead(msg)) => assert!(msg.contains("level.dat")),
            other => panic!("expected InconsistentRead, got {:?}", other),
        }
        let leftovers: Vec<_> = fs::read_dir(staging.join(SNAPSHOTS_DIRNAME))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
        let captures: Vec<_> = fs::read_dir(staging.join(CAPTURE_DIRNAME)).unwrap().collect();
        assert!(captures.is_empty());
    }

    #[test]
    fn test_sweep_removes_leftovers_but_keeps_named_snapshots() {
        let temp = TempDir::new().unwrap();
        let source = world(&temp);
        let staging = temp.path().join("staging");
        let archiver = archiver(&staging);
        let cancel = CancellationToken::new();

        let kept = archiver.archive_blocking(&source, &defaults(), &cancel).unwrap();
        let orphan = archiver.archive_blocking(&source, &defaults(), &cancel).unwrap();
        let partial = staging.join(SNAPSHOTS_DIRNAME).join("My_World-x.zip.tmp");
        fs::write(&partial, b"half an archive").unwrap();
        let capture = staging.join(CAPTURE_DIRNAME).join("crashed");
        fs::create_dir_all(capture.join("region")).unwrap();
        fs::write(capture.join("level.dat"), b"level data").unwrap();

        let removed = archiver
            .sweep_staging_blocking(&[kept.path.clone()])
            .unwrap();

        assert_eq!(removed, 3);
        assert!(kept.is_staged());
        assert!(!orphan.is_staged());
        assert!(!partial.exists());
        assert!(!capture.exists());
    }

    #[test]
    fn test_sweep_of_empty_staging_is_noop() {
        let temp = TempDir::new().unwrap();
        let removed = archiver(&temp.path().join("never-used"))
            .sweep_staging_blocking(&[])
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_checksum_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data");
        fs::write(&path, b"abc").unwrap();

        let (size, checksum) = checksum_file(&path).unwrap();
        assert_eq!(size, 3);
        assert_eq!(
            checksum,
            "bddd813c634239723171ef3fee98579b94964e3bb1cb3e427262c8c068d52319"
        );
    }
}
