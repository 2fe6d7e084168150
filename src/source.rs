use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8PathBuf;

use crate::core::Data;
use crate::error::{SourceError, TaskError};
use crate::lineage::ops::Producer;
use crate::stream::{ElementIter, SharedIter};
use crate::worker;

/// Splits `items` into `partitions` contiguous slices of one shared vector.
pub(crate) fn parallelize<T: Data>(items: Vec<T>, partitions: usize) -> Vec<Producer<T>> {
    let partitions = partitions.max(1);
    let data = Arc::new(items);
    let len = data.len();

    (0..partitions)
        .map(|i| {
            let data = data.clone();
            let start = i * len / partitions;
            let end = (i + 1) * len / partitions;
            let producer: Producer<T> = Arc::new(move || -> anyhow::Result<ElementIter<T>> {
                Ok(Box::new(SharedIter::slice(data.clone(), start, end)))
            });
            producer
        })
        .collect()
}

/// `start..end` split into `partitions` contiguous ranges.
pub(crate) fn range(start: i64, end: i64, partitions: usize) -> Vec<Producer<i64>> {
    let partitions = partitions.max(1) as i128;
    let len = (end as i128 - start as i128).max(0);

    (0..partitions)
        .map(|i| {
            let lo = (start as i128 + i * len / partitions) as i64;
            let hi = (start as i128 + (i + 1) * len / partitions) as i64;
            let producer: Producer<i64> =
                Arc::new(move || -> anyhow::Result<ElementIter<i64>> { Ok(Box::new(lo..hi)) });
            producer
        })
        .collect()
}

/// One byte range of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileSplit {
    pub path: Utf8PathBuf,
    pub start: u64,
    pub end: u64,
}

/// Byte ranges covering every file matching `pattern`, aiming for at least
/// `min_partitions` ranges in total. Files are never merged and every file
/// gets at least one range.
pub(crate) fn plan_splits(pattern: &str, min_partitions: usize) -> Result<Vec<FileSplit>, SourceError> {
    let mut files = Vec::new();
    for path in glob::glob(pattern)? {
        let path = Utf8PathBuf::try_from(path?)?;
        let metadata = std::fs::metadata(&path)?;
        if metadata.is_file() {
            files.push((path, metadata.len()));
        }
    }
    files.sort();

    let total: u64 = files.iter().map(|(_, len)| len).sum();
    let goal = (total / min_partitions.max(1) as u64).max(1);

    let mut splits = Vec::new();
    for (path, len) in files {
        let count = len.div_ceil(goal).max(1);
        for i in 0..count {
            splits.push(FileSplit {
                path: path.clone(),
                start: i * len / count,
                end: (i + 1) * len / count,
            });
        }
    }

    Ok(splits)
}

pub(crate) fn text_file(pattern: &str, min_partitions: usize) -> Result<Vec<Producer<String>>, SourceError> {
    let splits = plan_splits(pattern, min_partitions)?;
    tracing::debug!(pattern, splits = splits.len(), "planned text file splits");

    Ok(splits
        .into_iter()
        .map(|split| {
            let producer: Producer<String> =
                Arc::new(move || -> anyhow::Result<ElementIter<String>> {
                    Ok(Box::new(LineSplit::open(&split)?))
                });
            producer
        })
        .collect())
}

/// Lines of one byte range.
///
/// A line belongs to the range it starts in, where a range owns the line
/// starting exactly at its end. Every range but the first therefore skips
/// its first line, which the previous range reads past its end.
struct LineSplit {
    reader: BufReader<File>,
    path: Utf8PathBuf,
    pos: u64,
    end: u64,
}

impl LineSplit {
    fn open(split: &FileSplit) -> anyhow::Result<Self> {
        let mut file = File::open(&split.path)
            .with_context(|| format!("Couldn't open {}", split.path))?;
        file.seek(SeekFrom::Start(split.start))?;

        let mut reader = BufReader::new(file);
        let mut pos = split.start;
        if split.start != 0 {
            let mut skipped = Vec::new();
            pos += reader.read_until(b'\n', &mut skipped)? as u64;
        }

        Ok(Self {
            reader,
            path: split.path.clone(),
            pos,
            end: split.end,
        })
    }
}

impl Iterator for LineSplit {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.pos > self.end {
            return None;
        }

        let mut buf = Vec::new();
        match self.reader.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(n) => {
                self.pos += n as u64;
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Some(String::from_utf8_lossy(&buf).into_owned())
            }
            Err(e) => {
                self.pos = u64::MAX;
                let error = anyhow::Error::new(e).context(format!("Couldn't read {}", self.path));
                worker::raise(TaskError::user(error));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect<T: Data>(producers: &[Producer<T>]) -> Vec<Vec<T>> {
        producers
            .iter()
            .map(|p| p().unwrap().collect())
            .collect()
    }

    #[test]
    fn test_parallelize_slices_evenly() {
        let parts = collect(&parallelize((0..10).collect::<Vec<u32>>(), 3));
        assert_eq!(parts, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8, 9]]);

        let empty = collect(&parallelize(Vec::<u32>::new(), 2));
        assert_eq!(empty, vec![Vec::<u32>::new(), Vec::new()]);
    }

    #[test]
    fn test_range_covers_interval() {
        let parts = collect(&range(-3, 4, 2));
        assert_eq!(parts, vec![vec![-3, -2, -1], vec![0, 1, 2, 3]]);
        assert_eq!(collect(&range(5, 1, 1)), vec![Vec::<i64>::new()]);
    }

    #[test]
    fn test_line_splits_cover_every_line_once() {
        let dir = std::env::temp_dir().join(format!("nagare-source-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("lines.txt");
        let lines: Vec<String> = (0..50).map(|i| format!("line number {i}")).collect();
        std::fs::write(&path, lines.join("\n") + "\r\n").unwrap();

        let pattern = format!("{}/*.txt", dir.display());
        for partitions in [1, 2, 7, 40] {
            let producers = text_file(&pattern, partitions).unwrap();
            assert!(producers.len() >= partitions.min(2));
            let read: Vec<String> = collect(&producers).into_iter().flatten().collect();
            assert_eq!(read, lines, "with {partitions} partitions");
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_bad_pattern() {
        assert!(matches!(
            plan_splits("[", 1),
            Err(SourceError::GlobPattern(_))
        ));
    }
}
