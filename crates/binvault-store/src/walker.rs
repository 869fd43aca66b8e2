//! Time-windowed blob discovery over the date-partitioned layout.
//!
//! The walker only descends into hour directories that can hold blobs from
//! the requested window, then keeps files whose blob id parses and whose
//! creation minute falls inside it. Discovery is best-effort: unreadable
//! entries and unparseable names are logged and skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::blob::BlobId;
use crate::layout::{date_dir, is_date_dir, CONTENT_DIR};

fn blob_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(?:^|[/\\])content[/\\](\d{10})[/\\]([^/\\]+)\.(?:bytes|properties)$")
            .expect("static blob path pattern")
    })
}

fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::minutes(1)).unwrap_or(ts)
}

/// Parses a layout path into its blob id and creation minute.
///
/// Accepts both separators and any letter case in the fixed parts.
pub fn parse_blob_path(path: &str) -> Option<(BlobId, DateTime<Utc>)> {
    let captures = blob_file_pattern().captures(path)?;
    let blob_id = BlobId::parse(captures.get(2)?.as_str()).ok()?;
    let created = blob_id.created_at();
    if date_dir(&created) != captures.get(1)?.as_str() {
        return None;
    }
    Some((blob_id, created))
}

/// Finds blobs created inside a time window.
#[derive(Debug, Clone)]
pub struct DateBasedWalker {
    root: PathBuf,
    window_start: DateTime<Utc>,
    window_end: Option<DateTime<Utc>>,
    prefix: Option<String>,
}

impl DateBasedWalker {
    /// Window from `duration` ago through now.
    pub fn since(root: impl Into<PathBuf>, duration: Duration) -> Self {
        Self::since_at(root, duration, Utc::now())
    }

    /// Window from `duration` before `now` through `now`.
    pub fn since_at(root: impl Into<PathBuf>, duration: Duration, now: DateTime<Utc>) -> Self {
        let span = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
        let start = now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            root: root.into(),
            window_start: truncate_to_minute(start),
            window_end: Some(now),
            prefix: None,
        }
    }

    /// Open-ended window starting at `from`, optionally limited to hour
    /// directories starting with `prefix` (e.g. `"2024"` or `"202403"`).
    pub fn from(root: impl Into<PathBuf>, from: DateTime<Utc>, prefix: Option<String>) -> Self {
        Self {
            root: root.into(),
            window_start: truncate_to_minute(from),
            window_end: None,
            prefix: prefix.filter(|p| !p.is_empty()),
        }
    }

    /// Unbounded window covering every hour directory.
    pub fn all(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            window_start: DateTime::<Utc>::MIN_UTC,
            window_end: None,
            prefix: None,
        }
    }

    /// Inclusive lower bound, truncated to the minute.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    /// Directory the walk starts from.
    pub fn content_root(&self) -> PathBuf {
        self.root.join(CONTENT_DIR)
    }

    fn in_window(&self, created: DateTime<Utc>) -> bool {
        let created = truncate_to_minute(created);
        created >= self.window_start && self.window_end.map_or(true, |end| created <= end)
    }

    fn wants_dir(&self, name: &str) -> bool {
        if !is_date_dir(name) {
            debug!("Skipping non-date directory '{}'", name);
            return false;
        }
        if let Some(prefix) = &self.prefix {
            if !name.starts_with(prefix.as_str()) {
                return false;
            }
        }
        // Hour directories sort lexically; anything before the start hour is out.
        name >= date_dir(&self.window_start).as_str()
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    /// Walks the window and returns each blob id with its creation minute.
    pub fn collect(&self) -> HashMap<BlobId, DateTime<Utc>> {
        let content_root = self.content_root();
        let mut found = HashMap::new();
        if !content_root.is_dir() {
            debug!("Content root {} does not exist", content_root.display());
            return found;
        }

        let walk = WalkDir::new(&content_root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 1 && entry.file_type().is_dir() {
                    self.wants_dir(&entry.file_name().to_string_lossy())
                } else {
                    true
                }
            });

        for entry in walk {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Failed to visit entry under {}: {}", content_root.display(), err);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = self.relative(entry.path()).to_string_lossy().into_owned();
            match parse_blob_path(&relative) {
                Some((blob_id, created)) => {
                    if self.in_window(created) {
                        found.insert(blob_id, created);
                    }
                }
                None => {
                    debug!("Skipping unrecognized file {}", entry.path().display());
                }
            }
        }
        debug!(
            "Walker found {} blobs since {} under {}",
            found.len(),
            self.window_start,
            content_root.display()
        );
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{bytes_path, properties_path};
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn blob_at(root: &Path, created: DateTime<Utc>) -> BlobId {
        let id = BlobId::new(created);
        touch(root, &bytes_path(&id));
        touch(root, &properties_path(&id));
        id
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 30).unwrap()
    }

    #[test]
    fn test_two_hour_window() {
        let dir = TempDir::new().unwrap();
        let recent = blob_at(dir.path(), now() - TimeDelta::minutes(90));
        let old = blob_at(dir.path(), now() - TimeDelta::hours(3));

        let found =
            DateBasedWalker::since_at(dir.path(), Duration::from_secs(2 * 3600), now()).collect();
        assert!(found.contains_key(&recent));
        assert!(!found.contains_key(&old));
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_exact_boundary_minute_is_included() {
        let dir = TempDir::new().unwrap();
        let boundary = blob_at(dir.path(), now() - TimeDelta::hours(2));
        let just_before = blob_at(dir.path(), now() - TimeDelta::hours(2) - TimeDelta::minutes(1));

        let walker = DateBasedWalker::since_at(dir.path(), Duration::from_secs(7200), now());
        let found = walker.collect();
        assert!(found.contains_key(&boundary));
        assert!(!found.contains_key(&just_before));
    }

    #[test]
    fn test_bytes_and_properties_yield_one_entry() {
        let dir = TempDir::new().unwrap();
        let id = blob_at(dir.path(), now());
        let found = DateBasedWalker::from(dir.path(), now() - TimeDelta::hours(1), None).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&id], id.created_at());
    }

    #[test]
    fn test_all_covers_every_hour() {
        let dir = TempDir::new().unwrap();
        blob_at(dir.path(), Utc.with_ymd_and_hms(1999, 1, 1, 0, 0, 0).unwrap());
        blob_at(dir.path(), now());
        assert_eq!(DateBasedWalker::all(dir.path()).collect().len(), 2);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let walker = DateBasedWalker::since(dir.path().join("nope"), Duration::from_secs(60));
        assert!(walker.collect().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_hour_does_not_stop_walk() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let before = blob_at(dir.path(), now() - TimeDelta::hours(2));
        let locked = blob_at(dir.path(), now() - TimeDelta::hours(1));
        let after = blob_at(dir.path(), now());
        let locked_dir = dir
            .path()
            .join(CONTENT_DIR)
            .join(date_dir(&locked.created_at()));
        fs::set_permissions(&locked_dir, fs::Permissions::from_mode(0o000)).unwrap();
        // Root ignores the mode, in which case the directory stays readable.
        let unreadable = fs::read_dir(&locked_dir).is_err();

        let found = DateBasedWalker::since_at(dir.path(), Duration::from_secs(3 * 3600), now())
            .collect();
        fs::set_permissions(&locked_dir, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(found.contains_key(&before));
        assert!(found.contains_key(&after));
        assert_eq!(found.contains_key(&locked), !unreadable);
    }

    #[test]
    fn test_garbage_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let id = blob_at(dir.path(), now());
        touch(dir.path(), "content/2024061512/not-a-blob.bytes");
        touch(dir.path(), "content/2024061512/readme.txt");
        touch(dir.path(), "content/tmp/whatever.bytes");
        touch(dir.path(), "content/2024061512/abc@202406151200.bytes.tmp");
        let found = DateBasedWalker::from(dir.path(), now() - TimeDelta::hours(1), None).collect();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&id));
    }

    #[test]
    fn test_prefix_limits_directories() {
        let dir = TempDir::new().unwrap();
        let june = blob_at(dir.path(), now());
        let july = blob_at(dir.path(), now() + TimeDelta::days(30));
        let start = now() - TimeDelta::days(1);
        let found = DateBasedWalker::from(dir.path(), start, Some("202406".into())).collect();
        assert!(found.contains_key(&june));
        assert!(!found.contains_key(&july));

        let all = DateBasedWalker::from(dir.path(), start, None).collect();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_parse_blob_path_accepts_both_separators_and_case() {
        let parsed = parse_blob_path("CONTENT\\2024061512\\abc@202406151230.BYTES").unwrap();
        assert_eq!(parsed.0.as_str(), "abc@202406151230");
        assert!(parse_blob_path("x/content/2024061512/abc@202406151230.properties").is_some());
        assert!(parse_blob_path("content/2024061513/abc@202406151230.bytes").is_none());
        assert!(parse_blob_path("content/202406151/abc@202406151230.bytes").is_none());
    }
}
