use std::{fmt, future::Future, time::Duration};

use futures_core::Stream;
use tokio::time::interval_at;
use tokio_stream::StreamExt;

#[derive(Debug)]
pub struct TimeElapsed(());

impl fmt::Display for TimeElapsed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Time elapsed")
    }
}

impl std::error::Error for TimeElapsed {}

impl From<TimeElapsed> for std::io::Error {
    fn from(_err: TimeElapsed) -> std::io::Error {
        std::io::ErrorKind::TimedOut.into()
    }
}

pub async fn timeout<T>(
    duration: Duration,
    future: impl Future<Output = T>,
) -> Result<T, TimeElapsed> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeElapsed(()))
}

/// Interleaves a `TimeElapsed` error into the stream whenever `duration`
/// passes without an item.
pub fn timeout_stream<S>(duration: Duration, stream: S) -> impl Stream<Item = Result<S::Item, TimeElapsed>>
where
    S: Stream,
{
    // skip first tick that would otherwise get timeout to trigger
    // immediately during first poll operation
    let timeout_interval_start = tokio::time::Instant::now()
        .checked_add(duration)
        .expect("timeout value too long");
    stream
        .timeout_repeating(interval_at(timeout_interval_start, duration))
        .map(|result| result.map_err(|_| TimeElapsed(())))
}
