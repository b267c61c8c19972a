//! HTTP transfer engine.
//!
//! Streams each transfer into a `.part` file next to its destination and
//! renames it into place once the body is exhausted. Suspended or crashed
//! transfers continue with an HTTP `Range` request from the length of the
//! staged `.part` file, so no byte is fetched twice. Servers that ignore
//! the range and answer `200` restart the staging from zero.

use super::{
    EngineError, EngineEvent, EngineEventKind, EngineEventSender, EngineHandle, ResumeToken,
    TransferEngine, TransferRequest,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Marker identifying tokens this engine minted.
const ENGINE_TAG: &str = "http";

/// Bytes of newly written data between progress events.
const PROGRESS_GRANULARITY: u64 = 64 * 1024;

/// One running transfer task, as tracked by the engine.
struct LiveTransfer {
    stop: CancellationToken,
    bytes: Arc<AtomicU64>,
    destination: PathBuf,
    task: Option<tokio::task::JoinHandle<()>>,
}

type LiveMap = Arc<Mutex<HashMap<EngineHandle, LiveTransfer>>>;

/// HTTP engine backed by reqwest.
///
/// Transfers run as tasks on the tokio runtime the engine was created in;
/// the control methods only signal those tasks and never block.
///
/// The cellular-access flag on a [`TransferRequest`] is carried for the
/// engine contract and logged, but has no effect here: a desktop network
/// stack offers no per-request interface selection.
pub struct HttpEngine {
    client: reqwest::Client,
    runtime: tokio::runtime::Handle,
    live: LiveMap,
    next_handle: AtomicU64,
    max_concurrency: usize,
}

impl HttpEngine {
    /// Default bound on concurrent transfers, matching common per-host
    /// connection limits.
    pub const DEFAULT_MAX_CONCURRENCY: usize = 6;

    /// Creates an engine with a default client.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be constructed.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime; transfers spawn there.
    pub fn new() -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self::with_client(client))
    }

    /// Creates an engine around an existing client.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime; transfers spawn there.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            runtime: tokio::runtime::Handle::current(),
            live: Arc::new(Mutex::new(HashMap::new())),
            next_handle: AtomicU64::new(1),
            max_concurrency: Self::DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Overrides the engine's concurrency bound.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    fn spawn_transfer(
        &self,
        request: TransferRequest,
        events: EngineEventSender,
    ) -> Result<EngineHandle, EngineError> {
        reqwest::Url::parse(&request.url).map_err(|e| EngineError::InvalidUrl(e.to_string()))?;

        let handle = EngineHandle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let stop = CancellationToken::new();
        let bytes = Arc::new(AtomicU64::new(0));

        self.live.lock().insert(
            handle,
            LiveTransfer {
                stop: stop.clone(),
                bytes: bytes.clone(),
                destination: request.destination.clone(),
                task: None,
            },
        );

        tracing::debug!(
            handle = %handle,
            url = %request.url,
            allow_cellular = request.allow_cellular,
            "transfer task starting"
        );
        let task = self.runtime.spawn(run_transfer(
            self.client.clone(),
            request,
            handle,
            bytes,
            stop,
            events,
            self.live.clone(),
        ));

        // The task may already have finished and removed itself.
        if let Some(entry) = self.live.lock().get_mut(&handle) {
            entry.task = Some(task);
        }
        Ok(handle)
    }
}

impl TransferEngine for HttpEngine {
    fn begin(
        &self,
        request: TransferRequest,
        events: EngineEventSender,
    ) -> Result<EngineHandle, EngineError> {
        self.spawn_transfer(request, events)
    }

    fn pause(&self, handle: EngineHandle) -> Result<ResumeToken, EngineError> {
        let entry = self
            .live
            .lock()
            .remove(&handle)
            .ok_or(EngineError::UnknownHandle(handle))?;
        entry.stop.cancel();
        let offset = entry.bytes.load(Ordering::Relaxed);
        tracing::debug!(handle = %handle, offset, "transfer paused");
        Ok(ResumeToken::new(json!({
            "engine": ENGINE_TAG,
            "offset": offset,
        })))
    }

    fn resume(
        &self,
        token: Option<ResumeToken>,
        request: TransferRequest,
        events: EngineEventSender,
    ) -> Result<EngineHandle, EngineError> {
        // The staged part file is the source of truth for the offset; the
        // token is checked for provenance.
        if let Some(token) = &token {
            let parsed = decode_token(token)?;
            tracing::debug!(url = %request.url, offset = parsed.offset, "resuming transfer");
        }
        self.spawn_transfer(request, events)
    }

    fn cancel(&self, handle: EngineHandle) {
        let Some(entry) = self.live.lock().remove(&handle) else {
            return;
        };
        entry.stop.cancel();
        tracing::debug!(handle = %handle, "transfer cancelled");

        // Remove staged and final data once the task has let go of them.
        // The final rename may land between the stop signal and the task
        // noticing it, so the destination is swept here too.
        self.runtime.spawn(async move {
            if let Some(task) = entry.task {
                let _ = task.await;
            }
            remove_quietly(&part_path(&entry.destination)).await;
            remove_quietly(&entry.destination).await;
        });
    }

    fn discard(&self, destination: &Path) {
        let staged = part_path(destination);
        match std::fs::remove_file(&staged) {
            Ok(()) => tracing::debug!(path = %staged.display(), "removed staged data"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %staged.display(), error = %e, "failed to remove staged data")
            }
        }
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove file")
        }
    }
}

/// Staging path for a destination: the destination name with `.part`
/// appended (not substituted, so `a.bin` and `a.zip` never collide).
fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

#[derive(Debug, Serialize, Deserialize)]
struct HttpResumeToken {
    engine: String,
    offset: u64,
}

fn decode_token(token: &ResumeToken) -> Result<HttpResumeToken, EngineError> {
    let parsed: HttpResumeToken = serde_json::from_value(token.payload().clone())
        .map_err(|_| EngineError::InvalidResumeToken)?;
    if parsed.engine != ENGINE_TAG {
        return Err(EngineError::InvalidResumeToken);
    }
    Ok(parsed)
}

enum TransferOutcome {
    Completed,
    Stopped,
}

async fn run_transfer(
    client: reqwest::Client,
    request: TransferRequest,
    handle: EngineHandle,
    bytes: Arc<AtomicU64>,
    stop: CancellationToken,
    events: EngineEventSender,
    live: LiveMap,
) {
    let outcome = transfer(&client, &request, handle, &bytes, &stop, &events).await;
    live.lock().remove(&handle);

    match outcome {
        Ok(TransferOutcome::Completed) => {
            let _ = events.send(EngineEvent {
                handle,
                kind: EngineEventKind::Completed,
            });
        }
        Ok(TransferOutcome::Stopped) => {
            tracing::debug!(handle = %handle, "transfer task stopped");
        }
        Err(error) => {
            tracing::warn!(handle = %handle, url = %request.url, error = %error, "transfer failed");
            let _ = events.send(EngineEvent {
                handle,
                kind: EngineEventKind::Failed { error },
            });
        }
    }
}

async fn transfer(
    client: &reqwest::Client,
    request: &TransferRequest,
    handle: EngineHandle,
    bytes: &Arc<AtomicU64>,
    stop: &CancellationToken,
    events: &EngineEventSender,
) -> Result<TransferOutcome, EngineError> {
    // A destination that already exists is a finished transfer from an
    // earlier run; nothing to fetch.
    if tokio::fs::metadata(&request.destination).await.is_ok() {
        tracing::debug!(path = %request.destination.display(), "destination already present");
        return Ok(TransferOutcome::Completed);
    }

    let staging = part_path(&request.destination);
    let offset = match tokio::fs::metadata(&staging).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    bytes.store(offset, Ordering::Relaxed);

    let mut builder = client.get(&request.url);
    if offset > 0 {
        builder = builder.header(RANGE, format!("bytes={}-", offset));
    }

    let response = tokio::select! {
        biased;
        _ = stop.cancelled() => return Ok(TransferOutcome::Stopped),
        sent = builder.send() => sent?.error_for_status()?,
    };

    let resuming = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
    let total_bytes = if resuming {
        response.content_length().map(|remaining| offset + remaining)
    } else {
        response.content_length()
    };

    let (mut file, mut written) = if resuming {
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&staging)
            .await?;
        (file, offset)
    } else {
        let file = tokio::fs::File::create(&staging).await?;
        bytes.store(0, Ordering::Relaxed);
        (file, 0u64)
    };

    let mut stream = response.bytes_stream();
    let mut last_reported = written;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                file.flush().await?;
                return Ok(TransferOutcome::Stopped);
            }
            chunk = stream.next() => match chunk {
                Some(Ok(data)) => {
                    file.write_all(&data).await?;
                    written += data.len() as u64;
                    bytes.store(written, Ordering::Relaxed);
                    if written - last_reported >= PROGRESS_GRANULARITY {
                        last_reported = written;
                        let _ = events.send(EngineEvent {
                            handle,
                            kind: EngineEventKind::Progress {
                                bytes_downloaded: written,
                                total_bytes,
                            },
                        });
                    }
                }
                Some(Err(e)) => {
                    let _ = file.flush().await;
                    return Err(EngineError::Http(e));
                }
                None => break,
            },
        }
    }

    file.flush().await?;
    drop(file);
    tokio::fs::rename(&staging, &request.destination).await?;

    let _ = events.send(EngineEvent {
        handle,
        kind: EngineEventKind::Progress {
            bytes_downloaded: written,
            total_bytes,
        },
    });
    Ok(TransferOutcome::Completed)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: String, destination: PathBuf) -> TransferRequest {
        TransferRequest {
            url,
            destination,
            allow_cellular: true,
        }
    }

    async fn terminal_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEventKind {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for engine event")
                .expect("event channel closed");
            match event.kind {
                EngineEventKind::Progress { .. } => continue,
                terminal => return terminal,
            }
        }
    }

    #[tokio::test]
    async fn test_download_writes_destination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("file.bin");
        let engine = HttpEngine::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        engine
            .begin(request(format!("{}/file.bin", server.uri()), destination.clone()), tx)
            .unwrap();

        assert!(matches!(
            terminal_event(&mut rx).await,
            EngineEventKind::Completed
        ));
        assert_eq!(std::fs::read(&destination).unwrap(), b"hello world");
        assert!(!part_path(&destination).exists());
    }

    #[tokio::test]
    async fn test_resume_appends_to_staged_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("Range", "bytes=6-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 6-10/11")
                    .set_body_bytes(b"world".to_vec()),
            )
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("file.bin");
        std::fs::write(part_path(&destination), b"hello ").unwrap();

        let engine = HttpEngine::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = ResumeToken::new(json!({ "engine": "http", "offset": 6 }));
        engine
            .resume(
                Some(token),
                request(format!("{}/file.bin", server.uri()), destination.clone()),
                tx,
            )
            .unwrap();

        assert!(matches!(
            terminal_event(&mut rx).await,
            EngineEventKind::Completed
        ));
        assert_eq!(std::fs::read(&destination).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_resume_without_token_uses_staged_length() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("Range", "bytes=4-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 4-7/8")
                    .set_body_bytes(b"data".to_vec()),
            )
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("file.bin");
        std::fs::write(part_path(&destination), b"good").unwrap();

        let engine = HttpEngine::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .resume(
                None,
                request(format!("{}/file.bin", server.uri()), destination.clone()),
                tx,
            )
            .unwrap();

        assert!(matches!(
            terminal_event(&mut rx).await,
            EngineEventKind::Completed
        ));
        assert_eq!(std::fs::read(&destination).unwrap(), b"gooddata");
    }

    #[tokio::test]
    async fn test_server_ignoring_range_restarts_from_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("file.bin");
        std::fs::write(part_path(&destination), b"stale-progress").unwrap();

        let engine = HttpEngine::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .resume(
                None,
                request(format!("{}/file.bin", server.uri()), destination.clone()),
                tx,
            )
            .unwrap();

        assert!(matches!(
            terminal_event(&mut rx).await,
            EngineEventKind::Completed
        ));
        assert_eq!(std::fs::read(&destination).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_existing_destination_completes_without_request() {
        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("file.bin");
        std::fs::write(&destination, b"already here").unwrap();

        let engine = HttpEngine::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .begin(
                request("http://localhost:1/never-fetched".to_string(), destination.clone()),
                tx,
            )
            .unwrap();

        assert!(matches!(
            terminal_event(&mut rx).await,
            EngineEventKind::Completed
        ));
        assert_eq!(std::fs::read(&destination).unwrap(), b"already here");
    }

    #[tokio::test]
    async fn test_http_error_reports_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.bin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("missing.bin");
        let engine = HttpEngine::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .begin(request(format!("{}/missing.bin", server.uri()), destination), tx)
            .unwrap();

        assert!(matches!(
            terminal_event(&mut rx).await,
            EngineEventKind::Failed {
                error: EngineError::Http(_)
            }
        ));
    }

    #[tokio::test]
    async fn test_pause_returns_token_and_kills_handle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 1024])
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("slow.bin");
        let engine = HttpEngine::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = engine
            .begin(request(format!("{}/slow.bin", server.uri()), destination), tx)
            .unwrap();

        let token = engine.pause(handle).unwrap();
        assert_eq!(token.payload()["engine"], "http");
        assert_eq!(token.payload()["offset"], 0);

        assert!(matches!(
            engine.pause(handle),
            Err(EngineError::UnknownHandle(_))
        ));
        engine.cancel(handle);
    }

    #[tokio::test]
    async fn test_cancel_removes_staged_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 1024])
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("slow.bin");
        std::fs::write(part_path(&destination), b"staged").unwrap();

        let engine = HttpEngine::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = engine
            .resume(
                None,
                request(format!("{}/slow.bin", server.uri()), destination.clone()),
                tx,
            )
            .unwrap();

        engine.cancel(handle);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while part_path(&destination).exists() {
            assert!(std::time::Instant::now() < deadline, "staged data not removed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_cancel_sweeps_destination_that_landed_concurrently() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 1024])
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("slow.bin");
        let engine = HttpEngine::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = engine
            .begin(
                request(format!("{}/slow.bin", server.uri()), destination.clone()),
                tx,
            )
            .unwrap();

        // Let the task get past its existing-destination check, then plant
        // the file a final rename would have produced mid-cancellation.
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&destination, b"late rename").unwrap();

        engine.cancel(handle);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while destination.exists() {
            assert!(std::time::Instant::now() < deadline, "destination not swept");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_foreign_token_rejected() {
        let temp = TempDir::new().unwrap();
        let engine = HttpEngine::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let token = ResumeToken::new(json!({ "engine": "carrier-pigeon", "offset": 5 }));
        let result = engine.resume(
            Some(token),
            request(
                "https://example.com/a".to_string(),
                temp.path().join("a.bin"),
            ),
            tx,
        );
        assert!(matches!(result, Err(EngineError::InvalidResumeToken)));
    }

    #[tokio::test]
    async fn test_begin_rejects_malformed_url() {
        let temp = TempDir::new().unwrap();
        let engine = HttpEngine::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = engine.begin(
            request("not a url".to_string(), temp.path().join("a.bin")),
            tx,
        );
        assert!(matches!(result, Err(EngineError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_discard_removes_part_file() {
        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("a.bin");
        std::fs::write(part_path(&destination), b"staged").unwrap();

        let engine = HttpEngine::new().unwrap();
        engine.discard(&destination);
        assert!(!part_path(&destination).exists());

        // Nothing staged: still fine.
        engine.discard(&destination);
    }

    #[test]
    fn test_part_path_appends_extension() {
        assert_eq!(
            part_path(Path::new("/dl/archive.tar.gz")),
            PathBuf::from("/dl/archive.tar.gz.part")
        );
        assert_eq!(part_path(Path::new("/dl/raw")), PathBuf::from("/dl/raw.part"));
    }
}
