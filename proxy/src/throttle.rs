use crate::claims::Claims;
use crate::errors::{ProxyError, Result};
use bytes::Bytes;
use hyper::body::{Body, Frame};
use leaky_bucket::{AcquireOwned, RateLimiter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

const BUCKET_TTL: Duration = Duration::from_secs(300);

/// Parse a human byte rate like `10M` or `512K` into bytes (binary units).
pub fn parse_byte_rate(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| ProxyError::Bucket(format!("failed to parse rate {s:?}")))?;
    let multiplier: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return Err(ProxyError::Bucket(format!("failed to parse rate {s:?}"))),
    };
    let bytes = (value * multiplier as f64) as u64;
    if bytes == 0 {
        return Err(ProxyError::Bucket(format!("rate {s:?} is zero")));
    }
    Ok(bytes)
}

fn build_limiter(rate: u64) -> RateLimiter {
    // bucket capacity equals the rate; it refills at an eighth of the rate
    // per second
    RateLimiter::builder()
        .max(rate as usize)
        .initial(rate as usize)
        .refill(((rate / 8).max(1)) as usize)
        .interval(Duration::from_secs(1))
        .build()
}

/// Per-session token buckets derived from the `rate` claim, cached briefly
/// so one streaming session shares a single bucket across requests.
pub struct RateBuckets {
    cache: moka::sync::Cache<String, Arc<RateLimiter>>,
}

impl RateBuckets {
    pub fn new() -> Self {
        Self {
            cache: moka::sync::Cache::builder()
                .time_to_live(BUCKET_TTL)
                .build(),
        }
    }

    /// `None` means unlimited.
    pub fn get(&self, claims: &Claims) -> Result<Option<Arc<RateLimiter>>> {
        let Some(rate) = claims.rate.as_deref() else {
            return Ok(None);
        };
        let bytes = parse_byte_rate(rate)?;
        let key = format!("{}{}", claims.session_id, rate);
        Ok(Some(
            self.cache.get_with(key, || Arc::new(build_limiter(bytes))),
        ))
    }
}

impl Default for RateBuckets {
    fn default() -> Self {
        Self::new()
    }
}

/// Body adapter that acquires `len` tokens from the bucket before yielding
/// each data frame, propagating TCP backpressure to the upstream.
pub struct ThrottledBody<B> {
    inner: B,
    limiter: Arc<RateLimiter>,
    pending: Option<(Pin<Box<AcquireOwned>>, Frame<Bytes>)>,
}

impl<B> ThrottledBody<B> {
    pub fn new(inner: B, limiter: Arc<RateLimiter>) -> Self {
        Self {
            inner,
            limiter,
            pending: None,
        }
    }
}

impl<B> Body for ThrottledBody<B>
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
        loop {
            if let Some((mut acquire, frame)) = this.pending.take() {
                match acquire.as_mut().poll(cx) {
                    Poll::Ready(()) => return Poll::Ready(Some(Ok(frame))),
                    Poll::Pending => {
                        this.pending = Some((acquire, frame));
                        return Poll::Pending;
                    }
                }
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    let len = frame.data_ref().map(Bytes::len).unwrap_or(0);
                    if len == 0 {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                    // frames can never outsize the bucket
                    let permits = len.min(this.limiter.max());
                    let acquire = Box::pin(this.limiter.clone().acquire_owned(permits));
                    this.pending = Some((acquire, frame));
                }
                other => return Poll::Ready(other),
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.pending.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}
