//! Cancellation and per-operation deadlines for transport I/O.

use crate::{Error, Result};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs one transport operation for `stream`, racing it against the run's
/// cancellation token and an optional deadline.
pub(crate) async fn guarded<F, T>(
    stream: usize,
    deadline: Option<Duration>,
    cancel: &CancellationToken,
    op: F,
) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    let bounded = async {
        match deadline {
            Some(limit) => tokio::time::timeout(limit, op).await.map_err(|_| Error::Timeout {
                stream,
                millis: limit.as_millis() as u64,
            }),
            None => Ok(op.await),
        }
    };

    tokio::select! {
        res = bounded => res?.map_err(|source| Error::StreamIo { stream, source }),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let cancel = CancellationToken::new();
        let res: Result<()> = guarded(3, Some(Duration::from_millis(50)), &cancel, async {
            std::future::pending::<io::Result<()>>().await
        })
        .await;
        assert!(matches!(res, Err(Error::Timeout { stream: 3, millis: 50 })));
    }

    #[tokio::test]
    async fn test_cancel_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<()> =
            guarded(0, None, &cancel, std::future::pending::<io::Result<()>>()).await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_io_error_is_tagged_with_stream() {
        let cancel = CancellationToken::new();
        let res: Result<()> = guarded(2, None, &cancel, async {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        })
        .await;
        match res {
            Err(Error::StreamIo { stream, source }) => {
                assert_eq!(stream, 2);
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
