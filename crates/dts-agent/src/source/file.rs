use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::ReaderConfig;
use crate::error::SplitError;
use crate::job::JobDescription;
use crate::reader::{FileReader, Reader};
use crate::record::ReaderId;

/// Splits a file pattern into one reader per matching file.
///
/// The pattern is `<directory>/<file name regex>`; the regex must match the
/// whole file name. Only regular files directly inside the directory count.
#[derive(Debug, Default)]
pub struct FileSource;

impl FileSource {
    pub fn new() -> Self {
        Self
    }

    pub(crate) async fn sub_sources(&self, job: &JobDescription) -> Result<Vec<String>, SplitError> {
        let pattern = job
            .hints
            .file_pattern
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| SplitError::invalid(job.job_id, "file jobs need a file_pattern hint"))?;

        let (dir, name_regex) = parse_pattern(pattern)
            .map_err(|reason| SplitError::invalid(job.job_id, reason))?;

        let job_id = job.job_id;
        tokio::task::spawn_blocking(move || matching_files(&dir, &name_regex))
            .await
            .map_err(|e| SplitError::invalid(job_id, format!("directory scan aborted: {}", e)))?
            .map_err(|reason| SplitError::invalid(job_id, reason))
    }

    pub(crate) fn reader(&self, job: &JobDescription, id: ReaderId, config: &ReaderConfig) -> Reader {
        let path = PathBuf::from(&id.sub_source);
        let resume = job.resume_position(&id.sub_source);
        Reader::File(FileReader::new(id, path, resume, job.start_position, config))
    }
}

fn parse_pattern(pattern: &str) -> Result<(PathBuf, Regex), String> {
    let path = Path::new(pattern);
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| format!("file pattern {} has no file name part", pattern))?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let regex = Regex::new(&format!("^(?:{})$", name))
        .map_err(|e| format!("invalid file name pattern {}: {}", name, e))?;

    Ok((dir, regex))
}

fn matching_files(dir: &Path, name_regex: &Regex) -> Result<Vec<String>, String> {
    if !dir.is_dir() {
        return Err(format!("{} is not a readable directory", dir.display()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        // Sub-source ids are strings; a lossy id could name another file
        let Some(path) = entry.path().to_str() else {
            warn!(path = %entry.path().display(), "Skipping file with a non UTF-8 path");
            continue;
        };
        if entry.file_name().to_str().is_some_and(|name| name_regex.is_match(name)) {
            files.push(path.to_string());
        }
    }
    Ok(files)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::connector::Connectors;
    use crate::job::SplitHints;
    use crate::source::Source;
    use dts_common::SourceType;
    use std::fs;

    fn file_job(pattern: String) -> JobDescription {
        JobDescription::new(SourceType::File, "host-a").with_hints(SplitHints {
            file_pattern: Some(pattern),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_matches_whole_file_names_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.log"), "a\n").unwrap();
        fs::write(dir.path().join("app.log.1"), "b\n").unwrap();
        fs::write(dir.path().join("db.log"), "c\n").unwrap();
        fs::create_dir(dir.path().join("nested.log")).unwrap();

        let job = file_job(format!("{}/.*\\.log", dir.path().display()));
        let source = Source::for_job(&job, &Connectors::new(), ReaderConfig::default());
        let readers = source.split(&job).await.unwrap();

        let mut names: Vec<_> = readers
            .iter()
            .map(|r| Path::new(r.sub_source()).file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["app.log", "db.log"]);
    }

    #[tokio::test]
    async fn test_no_matching_files_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "x\n").unwrap();

        let job = file_job(format!("{}/.*\\.log", dir.path().display()));
        let source = Source::for_job(&job, &Connectors::new(), ReaderConfig::default());
        assert!(source.split(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_pattern_or_directory_is_invalid() {
        let dir = tempfile::tempdir().unwrap();

        let job = file_job(format!("{}/([a-z", dir.path().display()));
        let source = Source::for_job(&job, &Connectors::new(), ReaderConfig::default());
        assert!(source.split(&job).await.is_err());

        let job = file_job(format!("{}/missing/.*", dir.path().display()));
        assert!(source.split(&job).await.is_err());

        let job = JobDescription::new(SourceType::File, "host-a");
        assert!(source.split(&job).await.is_err());
        assert_eq!(source.metrics().split_failure(), 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_paths_are_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ok.log"), "a\n").unwrap();
        fs::write(dir.path().join(OsStr::from_bytes(b"bad\xff.log")), "b\n").unwrap();

        let files = matching_files(dir.path(), &Regex::new("^(?:.*)$").unwrap()).unwrap();
        assert_eq!(files, vec![dir.path().join("ok.log").to_str().unwrap().to_string()]);
        assert!(files.iter().all(|f| Path::new(f).is_file()));
    }
}
