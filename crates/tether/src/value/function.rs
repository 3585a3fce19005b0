use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::{ErrorValue, Value};

/// Why a call (or promise) did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("rejected: {0}")]
    Rejected(ErrorValue),
    #[error("connection closed before the call settled")]
    Disconnected,
    #[error("failed to box call payload: {0}")]
    Box(String),
    #[error("failed to revive call result: {0}")]
    Revive(String),
}

impl CallError {
    /// Collapse into the error a reject settlement carries.
    pub fn into_error_value(self) -> ErrorValue {
        match self {
            Self::Rejected(error) => error,
            other => ErrorValue::new(other.to_string()),
        }
    }
}

impl From<ErrorValue> for CallError {
    fn from(error: ErrorValue) -> Self {
        Self::Rejected(error)
    }
}

/// Something that can be invoked with positional arguments.
///
/// Local closures and remote proxies both implement this; callers can't tell
/// them apart.
#[async_trait]
pub trait Callable: Send + Sync + 'static {
    async fn call(&self, args: Vec<Value>) -> Result<Value, CallError>;
}

struct Closure<F>(F);

#[async_trait]
impl<F, Fut> Callable for Closure<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ErrorValue>> + Send + 'static,
{
    async fn call(&self, args: Vec<Value>) -> Result<Value, CallError> {
        (self.0)(args).await.map_err(CallError::Rejected)
    }
}

/// A shareable callable value.
#[derive(Clone)]
pub struct Function(Arc<dyn Callable>);

impl Function {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorValue>> + Send + 'static,
    {
        Self(Arc::new(Closure(f)))
    }

    pub fn from_callable(callable: impl Callable) -> Self {
        Self(Arc::new(callable))
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value, CallError> {
        self.0.call(args).await
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Function")
    }
}
