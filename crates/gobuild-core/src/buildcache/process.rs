//! The request loop.
//!
//! Requests are read in order; `get` and `put` are then served concurrently
//! and their responses funnelled through a single writer task. `close` (or the
//! end of input) waits for every in-flight request before answering.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::task::TaskTracker;

use super::CacheError;
use super::disk::{CacheHit, DiskCache, format_time};
use super::protocol::{Request, Response};

/// Request counters, reported when the helper closes.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub gets: AtomicU64,
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,
    pub get_errors: AtomicU64,
    pub puts: AtomicU64,
    pub put_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl CacheStats {
    pub fn summary(&self) -> String {
        format!(
            "{} gets ({} hits, {} misses, {} errors); {} puts ({} errors)",
            self.gets.load(Ordering::Relaxed),
            self.get_hits.load(Ordering::Relaxed),
            self.get_misses.load(Ordering::Relaxed),
            self.get_errors.load(Ordering::Relaxed),
            self.puts.load(Ordering::Relaxed),
            self.put_errors.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug)]
pub struct CacheProcess {
    cache: Arc<DiskCache>,
    stats: Arc<CacheStats>,
    verbose: bool,
}

impl CacheProcess {
    pub fn new(cache: DiskCache, verbose: bool) -> Self {
        Self {
            cache: Arc::new(cache),
            stats: Arc::new(CacheStats::default()),
            verbose,
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Serves requests from `reader` until `close` or the end of input.
    ///
    /// Returns the writer once every response has been flushed to it.
    pub async fn serve<R, W>(&self, mut reader: R, writer: W) -> Result<W, CacheError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = unbounded_channel();
        let writer = tokio::spawn(write_responses(rx, writer));
        send(&tx, Response::hello());

        let handlers = TaskTracker::new();
        let result = self.read_requests(&mut reader, &tx, &handlers).await;

        handlers.close();
        handlers.wait().await;
        tracing::info!("closing; {}", self.stats.summary());
        if let Ok(Some(close_id)) = result {
            send(&tx, Response::ok(close_id));
        }
        drop(tx);

        let writer = writer
            .await
            .map_err(|e| CacheError::Stream(std::io::Error::other(e)))??;
        result?;
        Ok(writer)
    }

    /// Returns the ID of the `close` request, or `None` at end of input.
    async fn read_requests<R>(
        &self,
        reader: &mut R,
        tx: &UnboundedSender<Response>,
        handlers: &TaskTracker,
    ) -> Result<Option<i64>, CacheError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = Vec::new();
        loop {
            if !next_line(reader, &mut line).await? {
                return Ok(None);
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let request: Request = serde_json::from_slice(&line).map_err(CacheError::Request)?;
            match request.command.as_str() {
                "get" => self.spawn_get(handlers, tx, request),
                "put" => {
                    let body = read_body(reader, &mut line, &request).await?;
                    self.spawn_put(handlers, tx, request, body);
                }
                "close" => return Ok(Some(request.id)),
                other => {
                    tracing::warn!("Unknown cache command {other:?}");
                    send(tx, Response::error(request.id, format!("unknown command {other:?}")));
                }
            }
        }
    }

    fn spawn_get(&self, handlers: &TaskTracker, tx: &UnboundedSender<Response>, request: Request) {
        let cache = Arc::clone(&self.cache);
        let stats = Arc::clone(&self.stats);
        let tx = tx.clone();
        let verbose = self.verbose;
        handlers.spawn(async move {
            bump(&stats.gets);
            let id = request.id;
            let response = match lookup(&cache, &request).await {
                Ok(Some(hit)) => {
                    bump(&stats.get_hits);
                    if verbose {
                        tracing::info!("get {id}: hit {}", hit.disk_path.display());
                    }
                    Response {
                        id,
                        output_id: Some(hit.output_id),
                        size: hit.size,
                        time: Some(format_time(hit.time_nanos)),
                        disk_path: Some(hit.disk_path.display().to_string()),
                        ..Response::default()
                    }
                }
                Ok(None) => {
                    bump(&stats.get_misses);
                    if verbose {
                        tracing::info!("get {id}: miss");
                    }
                    Response::miss(id)
                }
                Err(e) => {
                    bump(&stats.get_errors);
                    tracing::warn!("get {id} failed: {e}");
                    Response::error(id, e)
                }
            };
            send(&tx, response);
        });
    }

    fn spawn_put(&self, handlers: &TaskTracker, tx: &UnboundedSender<Response>, request: Request, body: Vec<u8>) {
        let cache = Arc::clone(&self.cache);
        let stats = Arc::clone(&self.stats);
        let tx = tx.clone();
        let verbose = self.verbose;
        handlers.spawn(async move {
            bump(&stats.puts);
            let id = request.id;
            let response = match store(&cache, &request, &body).await {
                Ok(path) => {
                    if verbose {
                        tracing::info!("put {id}: {} bytes to {}", body.len(), path.display());
                    }
                    Response {
                        id,
                        disk_path: Some(path.display().to_string()),
                        ..Response::default()
                    }
                }
                Err(e) => {
                    bump(&stats.put_errors);
                    tracing::warn!("put {id} failed: {e}");
                    Response::error(id, e)
                }
            };
            send(&tx, response);
        });
    }
}

async fn lookup(cache: &DiskCache, request: &Request) -> Result<Option<CacheHit>, CacheError> {
    let action_id = request.action_id.as_deref().ok_or(CacheError::MissingField {
        id: request.id,
        field: "ActionID",
    })?;
    cache.get(action_id).await
}

async fn store(cache: &DiskCache, request: &Request, body: &[u8]) -> Result<std::path::PathBuf, CacheError> {
    let action_id = request.action_id.as_deref().ok_or(CacheError::MissingField {
        id: request.id,
        field: "ActionID",
    })?;
    let output_id = request.output().ok_or(CacheError::MissingField {
        id: request.id,
        field: "OutputID",
    })?;
    cache.put(action_id, output_id, body).await
}

async fn next_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<bool, CacheError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    Ok(reader.read_until(b'\n', line).await? > 0)
}

/// Reads the base64 body line that follows a `put` with a non-zero size.
async fn read_body<R>(reader: &mut R, line: &mut Vec<u8>, request: &Request) -> Result<Vec<u8>, CacheError>
where
    R: AsyncBufRead + Unpin,
{
    if request.body_size == 0 {
        return Ok(Vec::new());
    }
    if !next_line(reader, line).await? {
        return Err(CacheError::Truncated(request.id));
    }

    let encoded: String = serde_json::from_slice(line.as_slice()).map_err(CacheError::Request)?;
    let body = STANDARD.decode(encoded).map_err(|source| CacheError::Body {
        id: request.id,
        source,
    })?;
    if body.len() as u64 != request.body_size {
        return Err(CacheError::BodySize {
            id: request.id,
            expected: request.body_size,
            actual: body.len() as u64,
        });
    }
    Ok(body)
}

fn send(tx: &UnboundedSender<Response>, response: Response) {
    if tx.send(response).is_err() {
        tracing::debug!("Response writer has stopped");
    }
}

async fn write_responses<W>(mut rx: UnboundedReceiver<Response>, mut writer: W) -> std::io::Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(writer)
}
