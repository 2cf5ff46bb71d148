//! Concurrent walk over several source trees.
//!
//! A fixed set of workers pulls directories from a shared worklist; listing a
//! directory pushes its subdirectories back onto the list. The walk is over
//! once the list is empty and no worker is still listing.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

use super::MergeError;
use crate::concurrent::ConcurrentMap;
use crate::parexec::{FailurePolicy, ParallelExecutor};

struct Job {
    source_index: usize,
    root: Arc<PathBuf>,
    dir: PathBuf,
}

#[derive(Default)]
struct Worklist {
    queue: Mutex<VecDeque<Job>>,
    /// Jobs queued or being processed.
    pending: AtomicUsize,
    notify: Notify,
}

impl Worklist {
    fn push(&self, job: Job) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(job);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Job> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    async fn next(&self) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.pop() {
                return Some(job);
            }
            if self.pending.load(Ordering::SeqCst) == 0 {
                return None;
            }
            notified.await;
        }
    }

    fn done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// Lists every non-directory entry below `sources`.
///
/// Returns `relative path → absolute source path`. When several sources hold
/// the same relative path, the one listed last in `sources` wins. Symlinks
/// are not followed and appear as entries of their own.
pub async fn walk_sources(
    sources: &[PathBuf],
    workers: usize,
) -> Result<BTreeMap<PathBuf, PathBuf>, MergeError> {
    let worklist = Arc::new(Worklist::default());
    let files: Arc<ConcurrentMap<PathBuf, (usize, PathBuf)>> = Arc::new(ConcurrentMap::new());

    for (source_index, source) in sources.iter().enumerate() {
        let root = std::path::absolute(source).map_err(|e| MergeError::io(source, e))?;
        let meta = tokio::fs::metadata(&root)
            .await
            .map_err(|e| MergeError::io(&root, e))?;
        if !meta.is_dir() {
            return Err(MergeError::NotADirectory(root));
        }
        worklist.push(Job {
            source_index,
            dir: root.clone(),
            root: Arc::new(root),
        });
    }

    let exec: ParallelExecutor<MergeError> =
        ParallelExecutor::new(workers, FailurePolicy::CollectFirst);
    for _ in 0..workers.max(1) {
        let worklist = Arc::clone(&worklist);
        let files = Arc::clone(&files);
        exec.spawn(async move {
            while let Some(job) = worklist.next().await {
                let result = list_dir(&job, &worklist, &files).await;
                worklist.done();
                result?;
            }
            Ok(())
        });
    }
    exec.wait().await?;

    Ok(files
        .snapshot()
        .into_iter()
        .map(|(relative, (_, absolute))| (relative, absolute))
        .collect())
}

async fn list_dir(
    job: &Job,
    worklist: &Worklist,
    files: &ConcurrentMap<PathBuf, (usize, PathBuf)>,
) -> Result<(), MergeError> {
    let mut entries = tokio::fs::read_dir(&job.dir)
        .await
        .map_err(|e| MergeError::io(&job.dir, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| MergeError::io(&job.dir, e))?
    {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| MergeError::io(&path, e))?;

        if file_type.is_dir() {
            worklist.push(Job {
                source_index: job.source_index,
                root: Arc::clone(&job.root),
                dir: path,
            });
            continue;
        }

        let relative = relative_to(&path, &job.root)?;
        files.upsert_if(relative, (job.source_index, path), |current, candidate| {
            candidate.0 >= current.0
        });
    }

    Ok(())
}

fn relative_to(path: &Path, root: &Path) -> Result<PathBuf, MergeError> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| {
            MergeError::io(
                path,
                std::io::Error::other(format!("not below {}", root.display())),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn lists_nested_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "a/b/c/deep.go", "");
        touch(dir.path(), "top.txt", "");
        touch(dir.path(), "a/mid.go", "");

        let files = walk_sources(&[dir.path().to_path_buf()], 3).await.unwrap();
        let keys: Vec<_> = files.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                PathBuf::from("a/b/c/deep.go"),
                PathBuf::from("a/mid.go"),
                PathBuf::from("top.txt")
            ]
        );
        assert_eq!(files[Path::new("top.txt")], dir.path().join("top.txt"));
    }

    #[tokio::test]
    async fn later_source_wins() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        touch(first.path(), "p/q", "first");
        touch(second.path(), "p/q", "second");
        touch(first.path(), "only-first", "");

        for workers in [1, 4] {
            let files = walk_sources(
                &[first.path().to_path_buf(), second.path().to_path_buf()],
                workers,
            )
            .await
            .unwrap();
            assert_eq!(files[Path::new("p/q")], second.path().join("p/q"));
            assert_eq!(files[Path::new("only-first")], first.path().join("only-first"));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn directory_symlinks_are_entries() {
        let target = TempDir::new().unwrap();
        touch(target.path(), "inner.go", "");
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(target.path(), dir.path().join("linked")).unwrap();

        let files = walk_sources(&[dir.path().to_path_buf()], 2).await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key(Path::new("linked")));
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = walk_sources(&[dir.path().join("missing")], 2).await.unwrap_err();
        assert!(matches!(err, MergeError::Io { .. }));
    }

    #[tokio::test]
    async fn file_source_is_rejected() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "file", "");
        let err = walk_sources(&[dir.path().join("file")], 2).await.unwrap_err();
        assert!(matches!(err, MergeError::NotADirectory(_)));
    }
}
