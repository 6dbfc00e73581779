//! Bidirectional byte proxy with idle enforcement

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::trace;

/// Copy buffer size per direction
const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound on closing both write halves after the pair ends
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Proxy bytes between `a` and `b` until either side stops
///
/// Both directions run concurrently. The first direction to end (EOF, error or
/// idle timeout) ends the whole pair and both write halves are shut down.
/// Returns the error that ended the pair, or `Ok` on a clean EOF. An idle pair
/// fails with [`io::ErrorKind::TimedOut`]. A zero `idle_timeout` disables idle
/// enforcement.
///
/// The streams stay owned by the caller, which drops them afterwards.
pub async fn proxy<A, B>(a: &mut A, b: &mut B, idle_timeout: Duration) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let activity = Activity::new();

    let result = tokio::select! {
        r = pump(&mut a_read, &mut b_write, &activity) => r.map(|n| trace!(bytes = n, "a->b finished")),
        r = pump(&mut b_read, &mut a_write, &activity) => r.map(|n| trace!(bytes = n, "b->a finished")),
        e = idle_watchdog(&activity, idle_timeout) => Err(e),
    };

    // The other direction is dropped mid-copy; closing both halves tells each
    // peer the pair is gone
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = a_write.shutdown().await;
        let _ = b_write.shutdown().await;
    })
    .await;

    match result {
        Err(e) if is_closed(&e) => Ok(()),
        other => other,
    }
}

/// Errors meaning the connection was already torn down
fn is_closed(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::NotConnected)
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, activity: &Activity) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        activity.touch();

        writer.write_all(&buf[..n]).await?;
        // TLS buffers records until flushed
        writer.flush().await?;
        activity.touch();

        total += n as u64;
    }
}

/// Resolves once no byte has moved in either direction for `idle_timeout`
async fn idle_watchdog(activity: &Activity, idle_timeout: Duration) -> io::Error {
    if idle_timeout.is_zero() {
        std::future::pending::<()>().await;
    }

    loop {
        let deadline = activity.last() + idle_timeout;
        if Instant::now() >= deadline {
            return io::Error::new(io::ErrorKind::TimedOut, "idle timeout");
        }
        tokio::time::sleep_until(deadline).await;
    }
}

/// Last time a byte moved, as millis since the pair started
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}
