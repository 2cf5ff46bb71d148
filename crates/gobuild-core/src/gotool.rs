//! Wrappers around the Go toolchain used during the build phases.
//!
//! Building is a cache-warming step: a failing batch is split in half and
//! each half retried, on the assumption that smaller batches are more likely
//! to succeed on their own. Packages that still fail alone are reported but
//! never abort the run.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use gobuild_schema::ModFile;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::modcache::MergeError;
use crate::modcache::finder::find_proxy_mods;
use crate::parexec::{FailurePolicy, ParallelExecutor};

const MANIFEST_READS: usize = 8;
const LIST_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("go toolchain not found: {0}")]
    NotFound(#[from] which::Error),

    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' failed ({status})")]
    Failed { command: String, status: ExitStatus },

    #[error("error decoding package list: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("error reading tool output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Found no Go packages while listing")]
    NoPackages,

    #[error("unexpected output from '{command}': {output}")]
    Output { command: String, output: String },

    #[error(transparent)]
    Merge(#[from] MergeError),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedPackage {
    import_path: String,
    #[serde(default)]
    go_files: Option<Vec<String>>,
}

/// Incremental decoder for the concatenated objects of `go list -json`.
///
/// Chunks may split a record anywhere; the unfinished tail is kept until
/// the next chunk completes it.
#[derive(Debug, Default)]
pub struct PackageDecoder {
    pending: Vec<u8>,
    packages: BTreeSet<String>,
}

impl PackageDecoder {
    /// Decodes every complete record buffered so far.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), ToolError> {
        self.pending.extend_from_slice(chunk);

        let mut records =
            serde_json::Deserializer::from_slice(&self.pending).into_iter::<ListedPackage>();
        let mut consumed = 0;
        loop {
            match records.next() {
                Some(Ok(package)) => {
                    consumed = records.byte_offset();
                    if package.go_files.is_some() {
                        self.packages.insert(package.import_path);
                    }
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    consumed = records.byte_offset();
                    break;
                }
            }
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    /// Import paths that have Go files. A truncated last record is an error.
    pub fn finish(self) -> Result<BTreeSet<String>, ToolError> {
        if self.pending.iter().any(|b| !b.is_ascii_whitespace()) {
            serde_json::from_slice::<ListedPackage>(&self.pending)?;
        }
        Ok(self.packages)
    }
}

/// Decodes a complete `go list -json` stream into the import paths that have Go files.
pub fn decode_packages(stream: &[u8]) -> Result<BTreeSet<String>, ToolError> {
    let mut decoder = PackageDecoder::default();
    decoder.push(stream)?;
    decoder.finish()
}

/// Decodes packages from `reader` as output arrives.
///
/// After a decode error the rest of the stream is still drained so the
/// producer never blocks on a full pipe.
async fn read_packages<R>(mut reader: R) -> Result<BTreeSet<String>, ToolError>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = PackageDecoder::default();
    let mut chunk = vec![0u8; LIST_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if let Err(e) = decoder.push(&chunk[..n]) {
            tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
            return Err(e);
        }
    }
    decoder.finish()
}

/// `<module>/...` for every module, plus the local tree.
pub fn default_patterns<'a>(modules: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    modules
        .into_iter()
        .map(|module| format!("{module}/..."))
        .chain(std::iter::once("./...".to_string()))
        .collect()
}

/// Module paths declared by the proxy manifests under `download_dirs`.
pub async fn proxy_module_paths(
    download_dirs: &[PathBuf],
    workers: usize,
) -> Result<BTreeSet<String>, MergeError> {
    let modules = Arc::new(Mutex::new(BTreeSet::new()));
    let exec: ParallelExecutor<MergeError> =
        ParallelExecutor::new(workers, FailurePolicy::CollectFirst);
    for dir in download_dirs {
        let dir = dir.clone();
        let modules = Arc::clone(&modules);
        exec.spawn(async move {
            let scan_dir = dir.clone();
            let manifests = tokio::task::spawn_blocking(move || find_proxy_mods(&scan_dir))
                .await
                .map_err(|e| MergeError::io(&dir, std::io::Error::other(e)))??;
            let mut reads = stream::iter(manifests)
                .map(|path| async move {
                    let contents = tokio::fs::read_to_string(&path)
                        .await
                        .map_err(|e| MergeError::io(&path, e))?;
                    let manifest = ModFile::parse(&path.display().to_string(), &contents)?;
                    Ok::<_, MergeError>(manifest.module_path().map(str::to_string))
                })
                .buffer_unordered(MANIFEST_READS);
            while let Some(module) = reads.next().await {
                if let Some(module) = module? {
                    modules
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(module);
                }
            }
            Ok(())
        });
    }
    exec.wait().await?;
    let modules = std::mem::take(&mut *modules.lock().unwrap_or_else(PoisonError::into_inner));
    Ok(modules)
}

/// One attempt at running a tool over a batch of items.
#[async_trait]
pub trait BatchRunner: Send + Sync {
    async fn run_batch(&self, batch: &[String]) -> Result<(), ToolError>;
}

/// Runs `items` through `runner`, halving failed batches until they pass
/// or fail alone. Returns the items that failed on their own.
pub async fn bisect<R: BatchRunner + ?Sized>(runner: &R, items: &[String]) -> Vec<String> {
    let mut failed = Vec::new();
    if items.is_empty() {
        return failed;
    }

    let mut stack = vec![items];
    while let Some(batch) = stack.pop() {
        let Err(e) = runner.run_batch(batch).await else {
            continue;
        };
        if let [single] = batch {
            tracing::warn!("{single}: {e}");
            failed.push(single.clone());
            continue;
        }
        tracing::debug!("Batch of {} failed, retrying halves", batch.len());
        let (left, right) = batch.split_at(batch.len() / 2);
        stack.push(right);
        stack.push(left);
    }
    failed
}

/// The `go` binary plus the settings shared by every invocation.
#[derive(Debug, Clone)]
pub struct GoTool {
    go: PathBuf,
    workers: usize,
}

impl GoTool {
    pub fn new(go: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            go: go.into(),
            workers,
        }
    }

    /// Finds `go` on `PATH`.
    pub fn locate(workers: usize) -> Result<Self, ToolError> {
        Ok(Self::new(which::which("go")?, workers))
    }

    fn command(&self, dir: &Path, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.go);
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .env("GOMAXPROCS", self.workers.to_string());
        cmd
    }

    fn describe(args: &[String]) -> String {
        let mut command = String::from("go");
        for arg in args {
            command.push(' ');
            command.push_str(arg);
        }
        command
    }

    /// Runs `go args...` in `dir` with output passed through.
    pub async fn run(&self, dir: &Path, args: &[String], env: &[(&str, &Path)]) -> Result<(), ToolError> {
        let command = Self::describe(args);
        tracing::debug!("Running {command}");

        let mut cmd = self.command(dir, args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        let status = cmd.status().await.map_err(|source| ToolError::Spawn {
            command: command.clone(),
            source,
        })?;
        if !status.success() {
            return Err(ToolError::Failed { command, status });
        }
        Ok(())
    }

    /// Lists buildable packages matching `patterns`, merged with `known`.
    pub async fn list_packages(
        &self,
        dir: &Path,
        patterns: &[String],
        known: BTreeSet<String>,
    ) -> Result<Vec<String>, ToolError> {
        let mut args = vec!["list".to_string(), "-e".to_string(), "-json".to_string()];
        args.extend(patterns.iter().cloned());
        let command = Self::describe(&args);

        let mut child = self
            .command(dir, &args)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                command: command.clone(),
                source,
            })?;
        let listed = match child.stdout.take() {
            Some(stdout) => read_packages(stdout).await,
            None => Ok(BTreeSet::new()),
        };
        let status = child.wait().await.map_err(|source| ToolError::Spawn {
            command: command.clone(),
            source,
        })?;
        if !status.success() {
            tracing::warn!("'{command}' exited with {status}");
        }

        let mut packages = known;
        packages.extend(listed?);
        if packages.is_empty() {
            return Err(ToolError::NoPackages);
        }
        Ok(packages.into_iter().collect())
    }

    /// Builds `packages`, bisecting failures. Returns packages that failed alone.
    pub async fn build_packages(&self, dir: &Path, flags: &[String], packages: &[String]) -> Vec<String> {
        let runner = GoBatch {
            tool: self,
            dir,
            args: prefixed(&["build", "-v"], flags),
        };
        bisect(&runner, packages).await
    }

    /// Installs `packages` into `bin_dir`.
    pub async fn install_packages(
        &self,
        dir: &Path,
        flags: &[String],
        packages: &[String],
        bin_dir: &Path,
    ) -> Result<(), ToolError> {
        let mut args = prefixed(&["install", "-v"], flags);
        args.extend(packages.iter().cloned());
        self.run(dir, &args, &[("GOBIN", bin_dir)]).await
    }

    /// Downloads `modules`, bisecting failures. Returns modules that failed alone.
    pub async fn download_modules(&self, dir: &Path, modules: &[String]) -> Vec<String> {
        let runner = GoBatch {
            tool: self,
            dir,
            args: prefixed(&["mod", "download"], &[]),
        };
        bisect(&runner, modules).await
    }

    /// Downloads `modules` in one go, failing on any error.
    pub async fn download_required(&self, dir: &Path, modules: &[String]) -> Result<(), ToolError> {
        let mut args = prefixed(&["mod", "download"], &[]);
        args.extend(modules.iter().cloned());
        self.run(dir, &args, &[]).await
    }

    /// The toolchain's language version, e.g. `1.22.1`.
    pub async fn go_version(&self) -> Result<String, ToolError> {
        let args = prefixed(&["env", "GOVERSION"], &[]);
        let command = Self::describe(&args);
        let output = Command::new(&self.go)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ToolError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ToolError::Failed {
                command,
                status: output.status,
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_go_version(&stdout).ok_or_else(|| ToolError::Output {
            command,
            output: stdout.trim().to_string(),
        })
    }
}

fn prefixed(head: &[&str], rest: &[String]) -> Vec<String> {
    head.iter()
        .map(|s| (*s).to_string())
        .chain(rest.iter().cloned())
        .collect()
}

/// `go1.22.1 X:nocoverageredesign` → `1.22.1`.
pub fn parse_go_version(goversion: &str) -> Option<String> {
    let version = goversion.split_whitespace().next()?.strip_prefix("go")?;
    if version.is_empty() {
        return None;
    }
    Some(version.to_string())
}

struct GoBatch<'a> {
    tool: &'a GoTool,
    dir: &'a Path,
    args: Vec<String>,
}

#[async_trait]
impl BatchRunner for GoBatch<'_> {
    async fn run_batch(&self, batch: &[String]) -> Result<(), ToolError> {
        let mut args = self.args.clone();
        args.extend(batch.iter().cloned());
        self.tool.run(self.dir, &args, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[derive(Default)]
    struct FakeRunner {
        broken: Vec<String>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl BatchRunner for FakeRunner {
        async fn run_batch(&self, batch: &[String]) -> Result<(), ToolError> {
            self.calls.lock().unwrap().push(batch.to_vec());
            if batch.iter().any(|item| self.broken.contains(item)) {
                return Err(ToolError::Failed {
                    command: "fake".to_string(),
                    status: ExitStatus::from_raw(1 << 8),
                });
            }
            Ok(())
        }
    }

    fn items(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn passing_batch_runs_once() {
        let runner = FakeRunner::default();
        let failed = bisect(&runner, &items(&["a", "b", "c"])).await;
        assert!(failed.is_empty());
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let runner = FakeRunner {
            broken: items(&["c"]),
            ..FakeRunner::default()
        };
        let failed = bisect(&runner, &items(&["a", "b", "c", "d"])).await;
        assert_eq!(failed, items(&["c"]));

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0], items(&["a", "b", "c", "d"]));
        assert_eq!(calls[1], items(&["a", "b"]));
        assert_eq!(calls[2], items(&["c", "d"]));
        assert_eq!(calls[3], items(&["c"]));
        assert_eq!(calls[4], items(&["d"]));
    }

    #[tokio::test]
    async fn empty_input_runs_nothing() {
        let runner = FakeRunner::default();
        assert!(bisect(&runner, &[]).await.is_empty());
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn decodes_package_stream() {
        let stream = br#"{"ImportPath": "a.com/x", "GoFiles": ["x.go"]}
{"ImportPath": "a.com/x/testdata", "GoFiles": null}
{"ImportPath": "a.com/x/docs"}
{"ImportPath": "a.com/x/cmd", "GoFiles": ["main.go"], "Name": "main"}"#;
        let packages = decode_packages(stream).unwrap();
        assert_eq!(
            packages.into_iter().collect::<Vec<_>>(),
            items(&["a.com/x", "a.com/x/cmd"])
        );
    }

    const PRETTY_LIST: &str = r#"{
	"Dir": "/src/x",
	"ImportPath": "a.com/x",
	"GoFiles": [
		"x.go"
	]
}
{
	"Dir": "/src/x/docs",
	"ImportPath": "a.com/x/docs"
}
{
	"ImportPath": "a.com/x/cmd",
	"Name": "main",
	"GoFiles": ["main.go"]
}
"#;

    #[test]
    fn decoder_handles_records_split_across_chunks() {
        for size in [1, 3, 17, PRETTY_LIST.len()] {
            let mut decoder = PackageDecoder::default();
            for chunk in PRETTY_LIST.as_bytes().chunks(size) {
                decoder.push(chunk).unwrap();
            }
            assert_eq!(
                decoder.finish().unwrap().into_iter().collect::<Vec<_>>(),
                items(&["a.com/x", "a.com/x/cmd"])
            );
        }
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut decoder = PackageDecoder::default();
        decoder.push(br#"{"ImportPath": "a.com/x", "GoFi"#).unwrap();
        assert!(matches!(decoder.finish(), Err(ToolError::Decode(_))));
    }

    #[tokio::test]
    async fn reads_packages_from_a_pipe() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let producer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in PRETTY_LIST.as_bytes().chunks(10) {
                writer.write_all(chunk).await.unwrap();
            }
        });
        let packages = read_packages(reader).await.unwrap();
        producer.await.unwrap();
        assert_eq!(
            packages.into_iter().collect::<Vec<_>>(),
            items(&["a.com/x", "a.com/x/cmd"])
        );
    }

    #[tokio::test]
    async fn malformed_output_is_drained() {
        let mut stream = b"{\"ImportPath\": 1}\n".to_vec();
        stream.extend(std::iter::repeat_n(b' ', 4 * LIST_CHUNK));
        let (mut writer, reader) = tokio::io::duplex(1024);
        let producer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            writer.write_all(&stream).await.unwrap();
        });
        assert!(matches!(read_packages(reader).await, Err(ToolError::Decode(_))));
        producer.await.unwrap();
    }

    #[test]
    fn patterns_cover_modules_and_local_tree() {
        let modules = items(&["a.com/x", "b.com/y"]);
        assert_eq!(
            default_patterns(&modules),
            items(&["a.com/x/...", "b.com/y/...", "./..."])
        );
    }

    #[test]
    fn parses_goversion() {
        assert_eq!(parse_go_version("go1.22.1\n").as_deref(), Some("1.22.1"));
        assert_eq!(
            parse_go_version("go1.23rc1 X:nocoverageredesign").as_deref(),
            Some("1.23rc1")
        );
        assert_eq!(parse_go_version("devel"), None);
        assert_eq!(parse_go_version(""), None);
    }

    #[tokio::test]
    async fn finds_proxy_module_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("github.com/!burnt!sushi/toml/@v/v1.3.2.mod");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "module github.com/BurntSushi/toml\n").unwrap();

        let modules = proxy_module_paths(&[dir.path().to_path_buf()], 2).await.unwrap();
        assert_eq!(
            modules.into_iter().collect::<Vec<_>>(),
            items(&["github.com/BurntSushi/toml"])
        );
    }
}
