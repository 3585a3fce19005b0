use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;

use super::{CallError, ErrorValue, Value};

/// A value that settles later.
///
/// Dropping an unsettled promise that came from a peer releases its channel;
/// the peer stops waiting on the underlying future.
pub struct Promise(BoxFuture<'static, Result<Value, CallError>>);

impl Promise {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, ErrorValue>> + Send + 'static,
    {
        Self(async move { future.await.map_err(CallError::Rejected) }.boxed())
    }

    pub fn resolved(value: Value) -> Self {
        Self(futures::future::ready(Ok(value)).boxed())
    }

    pub fn rejected(error: impl Into<ErrorValue>) -> Self {
        Self(futures::future::ready(Err(CallError::Rejected(error.into()))).boxed())
    }

    pub(crate) fn from_settlement<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        Self(future.boxed())
    }
}

impl Future for Promise {
    type Output = Result<Value, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx)
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Promise")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolved_and_rejected() {
        assert_eq!(
            Promise::resolved(Value::from("ok")).await.unwrap().as_str(),
            Some("ok")
        );
        assert_eq!(
            Promise::rejected("bad").await.unwrap_err(),
            CallError::Rejected(ErrorValue::new("bad"))
        );
    }

    #[tokio::test]
    async fn wraps_future() {
        let (tx, rx) = tokio::sync::oneshot::channel::<i64>();
        let promise = Promise::new(async move {
            rx.await
                .map(Value::from)
                .map_err(|_| ErrorValue::new("sender dropped"))
        });
        tx.send(5).unwrap();

        assert_eq!(promise.await.unwrap().as_i64(), Some(5));
    }
}
