//! Concurrent fixed-point discovery of a module closure.
//!
//! Every module reference found in a manifest is offered to the selection
//! store. A reference wins only when its version is strictly newer than the
//! currently selected one; each win fetches that coordinate exactly once and
//! offers its own requirements in turn. Versions only ever increase, so the
//! process reaches a fixed point, at which point the executor drains.
//!
//! Pinned modules (from checksum data) keep their version no matter which
//! versions other manifests ask for.

use gobuild_schema::coordinate::is_local_path;
use gobuild_schema::{ModFile, ModFileError, ModuleCoordinate, ModuleDownload, ModuleVersion};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::concurrent::ConcurrentMap;
use crate::fetch::{FetchError, ModuleFetcher};
use crate::parexec::{Cancelled, FailurePolicy, ParallelExecutor, TaskError};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("error downloading module {coordinate}: {source}")]
    Fetch {
        coordinate: String,
        #[source]
        source: FetchError,
    },

    #[error("error reading manifest of {coordinate}: {source}")]
    Manifest {
        coordinate: String,
        #[source]
        source: ModFileError,
    },

    #[error("download of {0} did not report a manifest")]
    MissingManifest(String),

    #[error("no download recorded for {0}")]
    Incomplete(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl TaskError for ResolveError {
    fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ResolveError::Cancelled(_)
                | ResolveError::Fetch {
                    source: FetchError::Cancelled(_),
                    ..
                }
        )
    }
}

/// A starting point for resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub coordinate: ModuleCoordinate,
    /// Pinned seeds keep their version for the whole run.
    pub pinned: bool,
}

impl Seed {
    pub fn pinned(path: impl Into<String>, version: impl Into<ModuleVersion>) -> Self {
        Self {
            coordinate: ModuleCoordinate::new(path, version),
            pinned: true,
        }
    }

    pub fn unpinned(path: impl Into<String>, version: impl Into<ModuleVersion>) -> Self {
        Self {
            coordinate: ModuleCoordinate::new(path, version),
            pinned: false,
        }
    }
}

struct State<F> {
    fetcher: Arc<F>,
    pinned: HashMap<String, ModuleVersion>,
    selected: ConcurrentMap<String, ModuleVersion>,
    /// `path@version` → download; `None` while the fetch is in flight.
    claimed: ConcurrentMap<String, Option<ModuleDownload>>,
    exec: ParallelExecutor<ResolveError>,
}

#[derive(Debug)]
pub struct DependencyResolver<F> {
    fetcher: Arc<F>,
    workers: usize,
    token: CancellationToken,
}

impl<F: ModuleFetcher + 'static> DependencyResolver<F> {
    pub fn new(fetcher: F, workers: usize) -> Self {
        Self::from_arc(Arc::new(fetcher), workers)
    }

    pub fn from_arc(fetcher: Arc<F>, workers: usize) -> Self {
        Self {
            fetcher,
            workers,
            token: CancellationToken::new(),
        }
    }

    /// Ties the resolution to an outer cancellation token.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Resolves the closure of `seeds`.
    ///
    /// Returns one download per selected module, sorted by module path.
    pub async fn resolve(&self, seeds: Vec<Seed>) -> Result<Vec<ModuleDownload>, ResolveError> {
        let pinned = seeds
            .iter()
            .filter(|s| s.pinned)
            .map(|s| (s.coordinate.path.clone(), s.coordinate.version.clone()))
            .collect();

        let exec = ParallelExecutor::with_token(
            self.workers,
            FailurePolicy::CancelOnError,
            self.token.child_token(),
        );
        let state = Arc::new(State {
            fetcher: Arc::clone(&self.fetcher),
            pinned,
            selected: ConcurrentMap::new(),
            claimed: ConcurrentMap::new(),
            exec: exec.clone(),
        });

        for seed in seeds {
            State::discover(&state, seed.coordinate);
        }

        exec.wait().await?;

        let claimed = state.claimed.snapshot();
        state
            .selected
            .snapshot()
            .into_iter()
            .map(|(path, version)| {
                let key = ModuleCoordinate::new(path, version).key();
                claimed
                    .get(&key)
                    .cloned()
                    .flatten()
                    .ok_or(ResolveError::Incomplete(key))
            })
            .collect()
    }
}

impl<F: ModuleFetcher + 'static> State<F> {
    fn discover(state: &Arc<Self>, coordinate: ModuleCoordinate) {
        if is_local_path(&coordinate.path) {
            return;
        }

        let version = match state.pinned.get(&coordinate.path) {
            Some(pinned) => {
                if *pinned != coordinate.version {
                    tracing::trace!("Keeping pinned {}@{pinned} over {coordinate}", coordinate.path);
                }
                pinned.clone()
            }
            None => coordinate.version,
        };

        let won = state
            .selected
            .upsert_if(coordinate.path.clone(), version.clone(), |current, candidate| {
                candidate.is_newer_than(current)
            });
        if !won {
            return;
        }

        let coordinate = ModuleCoordinate::new(coordinate.path, version);
        if !state.claimed.claim_if_absent(coordinate.key(), None) {
            return;
        }

        let task_state = Arc::clone(state);
        state
            .exec
            .spawn(async move { task_state.fetch_and_expand(coordinate).await });
    }

    async fn fetch_and_expand(self: Arc<Self>, coordinate: ModuleCoordinate) -> Result<(), ResolveError> {
        self.exec.check()?;

        let download = self
            .fetcher
            .download(&coordinate)
            .await
            .map_err(|source| ResolveError::Fetch {
                coordinate: coordinate.key(),
                source,
            })?;

        // The fetch is not interruptible; its result is dropped if we were
        // cancelled meanwhile.
        self.exec.check()?;

        let manifest_path = download
            .manifest_path
            .as_ref()
            .ok_or_else(|| ResolveError::MissingManifest(coordinate.key()))?;
        let manifest_err = |source| ResolveError::Manifest {
            coordinate: coordinate.key(),
            source,
        };
        let contents = tokio::fs::read_to_string(manifest_path)
            .await
            .map_err(|source| {
                manifest_err(ModFileError::Io {
                    path: manifest_path.clone(),
                    source,
                })
            })?;
        let manifest = ModFile::parse(&manifest_path.display().to_string(), &contents)
            .map_err(manifest_err)?;

        for require in &manifest.requires {
            self.exec.check()?;

            let target = match manifest.replacement_for(require) {
                Some(replacement) => match replacement.coordinate() {
                    Some(target) => target,
                    None => {
                        // Local directory replacements never enter the closure.
                        continue;
                    }
                },
                None => ModuleCoordinate::new(require.path.clone(), require.version.clone()),
            };
            Self::discover(&self, target);
        }

        self.claimed.insert(coordinate.key(), Some(download));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeFetcher;

    async fn resolve(fetcher: &Arc<FakeFetcher>, seeds: Vec<Seed>) -> Result<Vec<String>, ResolveError> {
        let downloads = DependencyResolver::from_arc(Arc::clone(fetcher), 4)
            .resolve(seeds)
            .await?;
        Ok(downloads.iter().map(|d| d.coordinate().key()).collect())
    }

    #[tokio::test]
    async fn resolves_cyclic_closure() {
        let fetcher = Arc::new(FakeFetcher::new(&[
            ("a@v1.0.0", "module a\nrequire b v1.0.0\n"),
            ("b@v1.0.0", "module b\nrequire (\n\ta v1.0.0\n\tc v2.0.0\n)\n"),
            ("c@v2.0.0", "module c\n"),
        ]));
        let closure = resolve(&fetcher, vec![Seed::unpinned("a", "v1.0.0")]).await.unwrap();
        assert_eq!(closure, vec!["a@v1.0.0", "b@v1.0.0", "c@v2.0.0"]);
        assert!(fetcher.fetch_counts().values().all(|n| *n == 1));
    }

    #[tokio::test]
    async fn highest_requested_version_wins() {
        let fetcher = Arc::new(FakeFetcher::new(&[
            ("root@v1.0.0", "module root\nrequire (\n\ta v1.0.0\n\tb v1.0.0\n\tc v1.1.0\n)\n"),
            ("a@v1.0.0", "module a\nrequire c v1.0.0\n"),
            ("b@v1.0.0", "module b\nrequire c v1.3.0\n"),
            ("c@v1.0.0", "module c\n"),
            ("c@v1.1.0", "module c\n"),
            ("c@v1.3.0", "module c\nrequire d v0.1.0\n"),
            ("d@v0.1.0", "module d\n"),
        ]));
        let closure = resolve(&fetcher, vec![Seed::unpinned("root", "v1.0.0")]).await.unwrap();
        assert_eq!(
            closure,
            vec!["a@v1.0.0", "b@v1.0.0", "c@v1.3.0", "d@v0.1.0", "root@v1.0.0"]
        );
        let counts = fetcher.fetch_counts();
        assert_eq!(counts["c@v1.3.0"], 1);
        assert!(counts.values().all(|n| *n == 1));
    }

    #[tokio::test]
    async fn pinned_version_is_never_overridden() {
        let fetcher = Arc::new(FakeFetcher::new(&[
            ("a@v1.0.0", "module a\nrequire c v2.0.0\n"),
            ("c@v1.0.0", "module c\n"),
        ]));
        let closure = resolve(
            &fetcher,
            vec![Seed::unpinned("a", "v1.0.0"), Seed::pinned("c", "v1.0.0")],
        )
        .await
        .unwrap();
        assert_eq!(closure, vec!["a@v1.0.0", "c@v1.0.0"]);
        assert!(!fetcher.fetch_counts().contains_key("c@v2.0.0"));
    }

    #[tokio::test]
    async fn replacements_are_followed_and_local_ones_skipped() {
        let fetcher = Arc::new(FakeFetcher::new(&[
            (
                "a@v1.0.0",
                "module a\nrequire (\n\tx v1.0.0\n\tlocal v0.0.0\n)\nreplace x => y v2.0.0\nreplace local => ../local\n",
            ),
            ("y@v2.0.0", "module y\n"),
        ]));
        let closure = resolve(&fetcher, vec![Seed::unpinned("a", "v1.0.0")]).await.unwrap();
        assert_eq!(closure, vec!["a@v1.0.0", "y@v2.0.0"]);
    }

    #[tokio::test]
    async fn local_seeds_are_ignored() {
        let fetcher = Arc::new(FakeFetcher::new(&[]));
        let closure = resolve(&fetcher, vec![Seed::unpinned("./vendor/x", "v0.0.0")])
            .await
            .unwrap();
        assert!(closure.is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_aborts_with_first_error() {
        let fetcher = Arc::new(FakeFetcher::new(&[("a@v1.0.0", "module a\nrequire gone v1.0.0\n")]));
        let err = resolve(&fetcher, vec![Seed::unpinned("a", "v1.0.0")]).await.unwrap_err();
        assert!(matches!(err, ResolveError::Fetch { ref coordinate, .. } if coordinate == "gone@v1.0.0"));
        assert!(!err.is_cancelled());
    }

    #[tokio::test]
    async fn malformed_manifest_is_fatal() {
        let fetcher = Arc::new(FakeFetcher::new(&[("a@v1.0.0", "module a\nbogus directive\n")]));
        let err = resolve(&fetcher, vec![Seed::unpinned("a", "v1.0.0")]).await.unwrap_err();
        assert!(matches!(err, ResolveError::Manifest { .. }));
    }

    #[tokio::test]
    async fn repeated_runs_are_identical() {
        let fetcher = Arc::new(FakeFetcher::new(&[
            ("a@v1.0.0", "module a\nrequire (\n\tz v1.0.0\n\tm v1.0.0\n)\n"),
            ("z@v1.0.0", "module z\nrequire m v1.1.0\n"),
            ("m@v1.0.0", "module m\n"),
            ("m@v1.1.0", "module m\n"),
        ]));
        let first = resolve(&fetcher, vec![Seed::unpinned("a", "v1.0.0")]).await.unwrap();
        let second = resolve(&fetcher, vec![Seed::unpinned("a", "v1.0.0")]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec!["a@v1.0.0", "m@v1.1.0", "z@v1.0.0"]);
    }

    #[tokio::test]
    async fn cancelled_token_stops_resolution() {
        let fetcher = Arc::new(FakeFetcher::new(&[("a@v1.0.0", "module a\n")]));
        let token = CancellationToken::new();
        token.cancel();
        let err = DependencyResolver::from_arc(Arc::clone(&fetcher), 2)
            .with_token(token)
            .resolve(vec![Seed::unpinned("a", "v1.0.0")])
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(fetcher.fetch_counts().is_empty());
    }
}
