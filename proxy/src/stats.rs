use async_trait::async_trait;
use bytes::Bytes;
use hyper::body::{Body, Frame};
use parking_lot::Mutex;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(thiserror::Error, Debug)]
pub enum StatError {
    #[error("failed to write rows: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficSource {
    Internal,
    External,
}

impl TrafficSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficSource::Internal => "internal",
            TrafficSource::External => "external",
        }
    }
}

/// One analytics row per completed request.
#[derive(Debug, Clone, Serialize)]
pub struct StatRecord {
    /// Unix seconds.
    pub timestamp: u64,
    pub api_key: String,
    pub client: String,
    pub bytes_written: u64,
    pub ttfb_ms: u64,
    pub duration_ms: u64,
    pub path: String,
    pub infohash: String,
    pub original_path: String,
    pub session_id: String,
    pub domain: String,
    pub status: u16,
    /// Status rounded down to the century, for cardinality control.
    pub grouped_status: u16,
    pub edge: String,
    pub source: TrafficSource,
    pub role: String,
    pub ads: bool,
    pub node: String,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Destination for batches of analytics rows.
#[async_trait]
pub trait RowWriter: Send + Sync + 'static {
    async fn write(&self, rows: Vec<StatRecord>) -> Result<(), StatError>;
}

/// Discards rows; used when no analytics DSN is configured.
pub struct NullRowWriter;

#[async_trait]
impl RowWriter for NullRowWriter {
    async fn write(&self, rows: Vec<StatRecord>) -> Result<(), StatError> {
        tracing::debug!(rows = rows.len(), "discarding stat rows (no sink configured)");
        Ok(())
    }
}

/// Writes batches to a columnar store over its HTTP interface as
/// newline-delimited JSON.
pub struct HttpRowWriter {
    client: reqwest::Client,
    dsn: String,
}

impl HttpRowWriter {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            dsn: dsn.into(),
        }
    }
}

#[async_trait]
impl RowWriter for HttpRowWriter {
    async fn write(&self, rows: Vec<StatRecord>) -> Result<(), StatError> {
        let mut body = String::new();
        for row in &rows {
            let line =
                serde_json::to_string(row).map_err(|e| StatError::Write(e.to_string()))?;
            body.push_str(&line);
            body.push('\n');
        }
        let resp = self
            .client
            .post(&self.dsn)
            .query(&[("query", "INSERT INTO proxy_stat FORMAT JSONEachRow")])
            .body(body)
            .send()
            .await
            .map_err(|e| StatError::Write(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StatError::Write(format!(
                "sink returned status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Batches rows in memory and hands full batches to the writer on a
/// separate task; the critical section never includes I/O.
pub struct StatSink {
    writer: Arc<dyn RowWriter>,
    batch: Mutex<Vec<StatRecord>>,
    batch_size: usize,
}

impl StatSink {
    pub fn new(writer: Arc<dyn RowWriter>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            writer,
            batch: Mutex::new(Vec::with_capacity(batch_size)),
            batch_size,
        }
    }

    pub fn add(&self, record: StatRecord) {
        let full = {
            let mut batch = self.batch.lock();
            batch.push(record);
            if batch.len() >= self.batch_size {
                Some(std::mem::replace(
                    &mut *batch,
                    Vec::with_capacity(self.batch_size),
                ))
            } else {
                None
            }
        };
        if let Some(rows) = full {
            let writer = self.writer.clone();
            tokio::spawn(async move {
                let count = rows.len();
                tracing::info!(rows = count, "storing stat rows");
                if let Err(e) = writer.write(rows).await {
                    tracing::warn!(error = %e, rows = count, "failed to store stat rows");
                }
            });
        }
    }

    /// Write out whatever is buffered; called on shutdown.
    pub async fn flush(&self) {
        let rows = std::mem::take(&mut *self.batch.lock());
        if rows.is_empty() {
            return;
        }
        if let Err(e) = self.writer.write(rows).await {
            tracing::warn!(error = %e, "failed to flush stat rows");
        }
    }
}

/// What a [`MeteredBody`] observed by the time it finished.
#[derive(Debug, Clone, Copy)]
pub struct BodyStats {
    pub bytes_written: u64,
    pub ttfb: Option<Duration>,
    pub duration: Duration,
}

/// Body adapter that measures bytes written and time to first byte, and
/// reports once the stream ends (or the client goes away).
pub struct MeteredBody<B> {
    inner: B,
    started: Instant,
    first_byte: Option<Instant>,
    bytes: u64,
    on_done: Option<Box<dyn FnOnce(BodyStats) + Send + Sync + 'static>>,
}

impl<B> MeteredBody<B> {
    pub fn new(inner: B, on_done: impl FnOnce(BodyStats) + Send + Sync + 'static) -> Self {
        Self {
            inner,
            started: Instant::now(),
            first_byte: None,
            bytes: 0,
            on_done: Some(Box::new(on_done)),
        }
    }

    fn finish(&mut self) {
        if let Some(on_done) = self.on_done.take() {
            on_done(BodyStats {
                bytes_written: self.bytes,
                ttfb: self.first_byte.map(|t| t.duration_since(self.started)),
                duration: self.started.elapsed(),
            });
        }
    }
}

impl<B> Body for MeteredBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, B::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    if !data.is_empty() && this.first_byte.is_none() {
                        this.first_byte = Some(Instant::now());
                    }
                    this.bytes += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for MeteredBody<B> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(n: u64) -> StatRecord {
        StatRecord {
            timestamp: n,
            api_key: "k1".into(),
            client: "player".into(),
            bytes_written: 1024,
            ttfb_ms: 12,
            duration_ms: 345,
            path: "/a.mp4".into(),
            infohash: "935d5".into(),
            original_path: "/935d5/a.mp4".into(),
            session_id: "s1".into(),
            domain: "example.com".into(),
            status: 206,
            grouped_status: 200,
            edge: "torrent-web-seeder".into(),
            source: TrafficSource::External,
            role: "nobody".into(),
            ads: false,
            node: "n1".into(),
        }
    }

    struct RecordingWriter {
        batches: Mutex<Vec<Vec<StatRecord>>>,
        writes: AtomicUsize,
    }

    impl RecordingWriter {
        fn new() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                writes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RowWriter for RecordingWriter {
        async fn write(&self, rows: Vec<StatRecord>) -> Result<(), StatError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().push(rows);
            Ok(())
        }
    }

    #[tokio::test]
    async fn batches_at_threshold() {
        let writer = Arc::new(RecordingWriter::new());
        let sink = StatSink::new(writer.clone(), 3);

        sink.add(record(1));
        sink.add(record(2));
        assert_eq!(writer.writes.load(Ordering::SeqCst), 0);

        sink.add(record(3));
        // the batch write happens on its own task
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(writer.writes.load(Ordering::SeqCst), 1);
        assert_eq!(writer.batches.lock()[0].len(), 3);
    }

    #[tokio::test]
    async fn flush_writes_partial_batch() {
        let writer = Arc::new(RecordingWriter::new());
        let sink = StatSink::new(writer.clone(), 100);

        sink.add(record(1));
        sink.flush().await;
        assert_eq!(writer.writes.load(Ordering::SeqCst), 1);
        assert_eq!(writer.batches.lock()[0].len(), 1);

        // flushing an empty buffer does nothing
        sink.flush().await;
        assert_eq!(writer.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn row_serializes_with_column_names() {
        let json = serde_json::to_value(record(7)).unwrap();
        assert_eq!(json["timestamp"], 7);
        assert_eq!(json["grouped_status"], 200);
        assert_eq!(json["source"], "external");
        assert_eq!(json["ttfb_ms"], 12);
        assert_eq!(json["node"], "n1");
    }

    #[tokio::test]
    async fn metered_body_reports_bytes_and_ttfb() {
        let stats = Arc::new(Mutex::new(None));
        let stats2 = stats.clone();
        let body = MeteredBody::new(
            Full::new(Bytes::from_static(b"hello world")),
            move |s: BodyStats| {
                *stats2.lock() = Some(s);
            },
        );

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), b"hello world");

        let stats = stats.lock().expect("stats reported");
        assert_eq!(stats.bytes_written, 11);
        assert!(stats.ttfb.is_some());
    }

    #[test]
    fn metered_body_reports_on_drop() {
        let stats = Arc::new(Mutex::new(None));
        let stats2 = stats.clone();
        let body = MeteredBody::new(
            Full::new(Bytes::from_static(b"never read")),
            move |s: BodyStats| {
                *stats2.lock() = Some(s);
            },
        );
        drop(body);
        let stats = stats.lock().expect("stats reported");
        assert_eq!(stats.bytes_written, 0);
    }
}
