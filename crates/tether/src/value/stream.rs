use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};

use super::{ErrorValue, Value};

/// A pull-based sequence of values.
///
/// Reading past the end yields `None`. Dropping the stream before the end
/// cancels it; a remote producer is told to stop.
pub struct ReadableStream(BoxStream<'static, Result<Value, ErrorValue>>);

impl ReadableStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, ErrorValue>> + Send + 'static,
    {
        Self(stream.boxed())
    }

    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::new(futures::stream::iter(values.into_iter().map(Ok)))
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Stream for ReadableStream {
    type Item = Result<Value, ErrorValue>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx)
    }
}

impl fmt::Debug for ReadableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReadableStream")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_values_yields_in_order() {
        let stream = ReadableStream::from_values(vec![Value::from(1), Value::from(2)]);
        let items: Vec<_> = stream
            .map(|item| item.unwrap().as_i64().unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![1, 2]);
    }
}
