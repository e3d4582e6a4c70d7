//! Append-only text log files, one line per record.

use async_trait::async_trait;
use cruiselog_core::mode::FileRotation;
use cruiselog_core::Record;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::{Sink, SinkError};

pub struct FileSink {
    base: PathBuf,
    rotation: FileRotation,
    current: Option<(PathBuf, File)>,
}

impl FileSink {
    pub fn new(base: PathBuf, rotation: FileRotation) -> Self {
        FileSink {
            base,
            rotation,
            current: None,
        }
    }

    /// The file a record is appended to.
    pub fn path_for(&self, record: &Record) -> PathBuf {
        match self.rotation {
            FileRotation::None => self.base.clone(),
            FileRotation::Daily => {
                let date = record.received_at.format("%Y-%m-%d");
                let name = match self.base.file_name() {
                    Some(name) => format!("{}-{}", name.to_string_lossy(), date),
                    None => date.to_string(),
                };
                self.base.with_file_name(name)
            }
        }
    }

    async fn open(path: &Path) -> std::io::Result<File> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        OpenOptions::new().create(true).append(true).open(path).await
    }

    fn error(&self, e: std::io::Error) -> SinkError {
        SinkError::write(format!("file:{}", self.base.display()), e)
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn accept(&mut self, record: &Record) -> Result<(), SinkError> {
        let path = self.path_for(record);
        let stale = !matches!(&self.current, Some((open, _)) if *open == path);
        if stale {
            if let Some((old, mut file)) = self.current.take() {
                match file.flush().await {
                    Ok(()) => debug!("{}: closed {}", record.instrument, old.display()),
                    Err(e) => warn!("{}: closing {}: {}", record.instrument, old.display(), e),
                }
            }
            let file = Self::open(&path).await.map_err(|e| self.error(e))?;
            debug!("{}: appending to {}", record.instrument, path.display());
            self.current = Some((path, file));
        }

        let mut line = record.to_line();
        line.push('\n');
        let result = match self.current.as_mut() {
            Some((_, file)) => match file.write_all(line.as_bytes()).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            },
            None => return Err(SinkError::Closed(self.base.display().to_string())),
        };
        if let Err(e) = result {
            // Reopen on the next record
            self.current = None;
            return Err(self.error(e));
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if let Some((_, file)) = self.current.as_mut() {
            if let Err(e) = file.flush().await {
                return Err(self.error(e));
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        let result = self.flush().await;
        self.current = None;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::tests::record;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nav").join("gyr1");
        let mut sink = FileSink::new(path.clone(), FileRotation::None);

        sink.accept(&record("gyr1", "$HEHDT,1.0,T\r\n")).await.unwrap();
        sink.accept(&record("gyr1", "$HEHDT,2.0,T")).await.unwrap();
        sink.close().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("gyr1 "));
        assert!(lines[0].ends_with(" $HEHDT,1.0,T"));
        assert!(lines[1].ends_with(" $HEHDT,2.0,T"));

        // Appends across sink instances
        let mut sink = FileSink::new(path.clone(), FileRotation::None);
        sink.accept(&record("gyr1", "$HEHDT,3.0,T")).await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
    }

    #[tokio::test]
    async fn test_daily_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("gyr1");
        let mut sink = FileSink::new(base.clone(), FileRotation::Daily);

        let mut first = record("gyr1", "a");
        first.received_at = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 59).unwrap();
        let mut second = record("gyr1", "b");
        second.received_at = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 1).unwrap();

        sink.accept(&first).await.unwrap();
        sink.accept(&second).await.unwrap();
        sink.close().await.unwrap();

        let day1 = std::fs::read_to_string(dir.path().join("gyr1-2024-03-01")).unwrap();
        let day2 = std::fs::read_to_string(dir.path().join("gyr1-2024-03-02")).unwrap();
        assert!(day1.ends_with(" a\n"));
        assert!(day2.ends_with(" b\n"));
        assert!(!base.exists());
    }

    #[tokio::test]
    async fn test_rotation_keeps_closed_files_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("gyr1"), FileRotation::Daily);
        let day = |d: u32, payload: &str| {
            let mut r = record("gyr1", payload);
            r.received_at = Utc.with_ymd_and_hms(2024, 3, d, 12, 0, 0).unwrap();
            r
        };

        // Late records for the previous day reopen its file
        for (d, payload) in [(1, "a"), (2, "b"), (1, "c"), (2, "d")] {
            sink.accept(&day(d, payload)).await.unwrap();
        }
        // Dropped without close: every rotated file was flushed on the way
        drop(sink);

        let day1 = std::fs::read_to_string(dir.path().join("gyr1-2024-03-01")).unwrap();
        let day2 = std::fs::read_to_string(dir.path().join("gyr1-2024-03-02")).unwrap();
        let tail = |text: &str| -> Vec<String> {
            text.lines()
                .map(|l| l.rsplit(' ').next().unwrap().to_string())
                .collect()
        };
        assert_eq!(tail(&day1), vec!["a", "c"]);
        assert_eq!(tail(&day2), vec!["b", "d"]);
    }

    #[tokio::test]
    async fn test_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let mut sink = FileSink::new(blocker.join("gyr1"), FileRotation::None);
        let err = sink.accept(&record("gyr1", "x")).await.unwrap_err();
        assert!(matches!(err, SinkError::Write { .. }));
    }
}
