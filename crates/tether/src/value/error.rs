use std::error::Error;
use std::fmt;

/// Captured stack text, exposed as the `source()` of an [`ErrorValue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTrace(String);

impl StackTrace {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for StackTrace {}

/// An error that can cross a connection: message plus optional stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    message: String,
    stack: Option<StackTrace>,
}

impl ErrorValue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(StackTrace(stack.into()));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_ref().map(StackTrace::as_str)
    }

    /// Single-string form used in reject settlements: message, then stack.
    pub(crate) fn render(&self) -> String {
        match &self.stack {
            Some(stack) => format!("{}\n{}", self.message, stack),
            None => self.message.clone(),
        }
    }

    /// Inverse of [`render`](Self::render): first line is the message.
    pub(crate) fn from_rendered(rendered: &str) -> Self {
        match rendered.split_once('\n') {
            Some((message, stack)) => Self::new(message).with_stack(stack),
            None => Self::new(rendered),
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for ErrorValue {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.stack.as_ref().map(|stack| stack as &(dyn Error + 'static))
    }
}

impl From<&str> for ErrorValue {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ErrorValue {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}
