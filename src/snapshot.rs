//! Heap snapshot files and their retention.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::alloc::AllocatorStats;
use crate::error::{HeapwatchError, Result};
use crate::sample::MemorySample;
use crate::symbols::SiteStats;

/// Extension of snapshot files; cleanup only ever touches files with this extension.
pub const SNAPSHOT_EXTENSION: &str = "heapsnapshot";

/// Reason used for snapshots requested by hand.
pub const MANUAL_REASON: &str = "manual";

/// Reason used for snapshots triggered by sustained growth.
pub const LEAK_REASON: &str = "leak-detected";

/// Numbered names tried when a snapshot file name is already taken.
const MAX_NAME_SUFFIX: u32 = 1000;

/// Content of a `.heapsnapshot` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapSnapshot {
    pub reason: String,
    pub taken_at: DateTime<Utc>,
    pub memory: MemorySample,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocator: Option<AllocatorStats>,
    /// Live allocation sites, largest first.
    #[serde(default)]
    pub sites: Vec<SiteStats>,
    /// Samples leading up to the snapshot, oldest first.
    #[serde(default)]
    pub history: Vec<MemorySample>,
}

/// A snapshot file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Outcome of a retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Snapshot files not removed, including those whose removal failed.
    pub kept: usize,
    pub removed: Vec<PathBuf>,
    /// Files that should have been removed but could not be.
    pub failed: usize,
}

/// Directory of snapshot files capped at `max_files`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    max_files: usize,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, max_files: usize) -> Self {
        Self {
            dir: dir.into(),
            max_files,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_files(&self) -> usize {
        self.max_files
    }

    /// File name for a snapshot: `heapdump-{reason}-{timestamp}.heapsnapshot`.
    ///
    /// The timestamp is RFC 3339 UTC with milliseconds, with `:` and `.` replaced by `-`.
    ///
    /// ```
    /// # use heapwatch::SnapshotStore;
    /// # use chrono::{TimeZone, Utc};
    /// let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    /// assert_eq!(
    ///     SnapshotStore::file_name("manual", &at),
    ///     "heapdump-manual-2024-01-02T03-04-05-000Z.heapsnapshot"
    /// );
    /// ```
    pub fn file_name(reason: &str, at: &DateTime<Utc>) -> String {
        let timestamp = at
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .replace([':', '.'], "-");
        format!(
            "heapdump-{}-{timestamp}.{SNAPSHOT_EXTENSION}",
            sanitize_reason(reason)
        )
    }

    /// Writes `snapshot` into the directory, creating it if needed, and returns the file path.
    ///
    /// Existing files are never overwritten: if the name is taken, `-1`, `-2`, ... is appended to it.
    ///
    /// # Errors
    ///
    /// Returns error if the directory or file cannot be written or serialization fails.
    pub fn write(&self, snapshot: &HeapSnapshot) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| HeapwatchError::io(&self.dir, e))?;

        let (path, file) =
            self.create_new(&Self::file_name(&snapshot.reason, &snapshot.taken_at))?;

        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, snapshot)?;
        writer.flush().map_err(|e| HeapwatchError::io(&path, e))?;

        Ok(path)
    }

    fn create_new(&self, file_name: &str) -> Result<(PathBuf, File)> {
        let extension = format!(".{SNAPSHOT_EXTENSION}");
        let stem = file_name.strip_suffix(&extension).unwrap_or(file_name);

        for suffix in 0..=MAX_NAME_SUFFIX {
            let path = match suffix {
                0 => self.dir.join(file_name),
                n => self.dir.join(format!("{stem}-{n}{extension}")),
            };
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(HeapwatchError::io(&path, err)),
            }
        }

        Err(HeapwatchError::io(
            self.dir.join(file_name),
            io::Error::from(ErrorKind::AlreadyExists),
        ))
    }

    /// Reads a snapshot file back.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or is not a snapshot.
    pub fn read(path: impl AsRef<Path>) -> Result<HeapSnapshot> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| HeapwatchError::io(path, e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Lists snapshot files, newest first.
    ///
    /// A missing directory is an empty list. Files whose modification time cannot be read sort as oldest.
    ///
    /// # Errors
    ///
    /// Returns error if the directory exists but cannot be read.
    pub fn list(&self) -> Result<Vec<SnapshotFile>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(HeapwatchError::io(&self.dir, err)),
        };

        let mut files: Vec<SnapshotFile> = entries
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(dir = %self.dir.display(), error = %err, "skipping unreadable directory entry");
                    None
                }
            })
            .map(|entry| entry.path())
            .filter(|path| is_snapshot(path))
            .map(|path| {
                let modified = fs::metadata(&path)
                    .and_then(|meta| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                SnapshotFile { path, modified }
            })
            .collect();

        files.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.path.cmp(&a.path))
        });
        Ok(files)
    }

    /// Deletes every snapshot file beyond the newest `max_files`.
    ///
    /// Deletion failures are logged and counted; the remaining files are still processed.
    ///
    /// # Errors
    ///
    /// Returns error only if the directory cannot be listed.
    pub fn cleanup(&self) -> Result<RetentionReport> {
        let files = self.list()?;
        Ok(remove_excess(files, self.max_files))
    }
}

/// Deletes every file of `files` (newest first) past the first `max_files`.
fn remove_excess(files: Vec<SnapshotFile>, max_files: usize) -> RetentionReport {
    let total = files.len();
    let mut report = RetentionReport::default();

    for file in files.into_iter().skip(max_files) {
        match fs::remove_file(&file.path) {
            Ok(()) => {
                tracing::debug!(path = %file.path.display(), "removed old heap snapshot");
                report.removed.push(file.path);
            }
            Err(err) => {
                tracing::warn!(path = %file.path.display(), error = %err, "failed to remove old heap snapshot");
                report.failed += 1;
            }
        }
    }

    report.kept = total - report.removed.len();
    report
}

fn is_snapshot(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|extension| extension == SNAPSHOT_EXTENSION)
}

/// Keeps reasons file-name safe: anything but ASCII alphanumerics, `-` and `_` becomes `-`.
fn sanitize_reason(reason: &str) -> String {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return MANUAL_REASON.to_string();
    }
    trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
