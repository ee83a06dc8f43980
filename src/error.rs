use thiserror::Error;

/// Main error type for the Ingot dispatch core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngotError {
    /// A tensor with neither a handle nor a graph variable was queried
    #[error("Unresolved tensor: {0}")]
    UnresolvedTensor(String),

    /// The operation needs a backing representation the tensor lacks
    #[error("Invalid representation: {0}")]
    InvalidRepresentation(String),

    /// Handle-backed and variable-backed inputs that the route cannot reconcile
    #[error("Mixed representation: {0}")]
    MixedRepresentation(String),

    /// Opaque failure reported by a backend, carried through untouched
    #[error("Backend dispatch error: {backend} - {message}")]
    BackendDispatch {
        backend: String,
        message: String,
    },

    /// Argument count does not fit the operator's declared inputs
    #[error("Arity mismatch in {operation}: expected {expected}, got {got}")]
    ArityMismatch {
        operation: String,
        expected: String,
        got: usize,
    },

    /// Shape inference errors
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Internal errors that shouldn't happen
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl IngotError {
    /// Create a backend error tagged with the reporting backend
    pub fn backend(backend: &str, message: impl Into<String>) -> Self {
        IngotError::BackendDispatch {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    pub fn arity(operation: &str, expected: impl Into<String>, got: usize) -> Self {
        IngotError::ArityMismatch {
            operation: operation.to_string(),
            expected: expected.into(),
            got,
        }
    }

    /// Create a shape error with helpful suggestions
    pub fn shape_error(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        let message = if let Some(sugg) = suggestion {
            format!("Expected {}, got {}. Suggestion: {}", expected, got, sugg)
        } else {
            format!("Expected {}, got {}", expected, got)
        };
        IngotError::ShapeError(message)
    }
}

impl From<std::io::Error> for IngotError {
    fn from(err: std::io::Error) -> Self {
        IngotError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for IngotError {
    fn from(err: serde_json::Error) -> Self {
        IngotError::SerializationError(err.to_string())
    }
}

/// Result type for Ingot operations
pub type IngotResult<T> = Result<T, IngotError>;

/// Error context for providing additional debugging information
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub operation: String,
    pub input_layouts: Vec<String>,
    pub route: Option<String>,
    pub suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            input_layouts: Vec::new(),
            route: None,
            suggestions: Vec::new(),
        }
    }

    pub fn with_layout(mut self, layout: &str) -> Self {
        self.input_layouts.push(layout.to_string());
        self
    }

    pub fn with_route(mut self, route: &str) -> Self {
        self.route = Some(route.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestions.push(suggestion.to_string());
        self
    }

    pub fn to_error_message(&self) -> String {
        let mut message = format!("Operation: {}", self.operation);

        if !self.input_layouts.is_empty() {
            message.push_str(&format!("\nInputs: {}", self.input_layouts.join(", ")));
        }

        if let Some(ref route) = self.route {
            message.push_str(&format!("\nRoute: {}", route));
        }

        if !self.suggestions.is_empty() {
            message.push_str("\nSuggestions:");
            for suggestion in &self.suggestions {
                message.push_str(&format!("\n  - {}", suggestion));
            }
        }

        message
    }
}

/// Helper trait for adding context to errors
pub trait WithContext<T> {
    fn with_context<F>(self, f: F) -> IngotResult<T>
    where
        F: FnOnce() -> ErrorContext;
}

impl<T> WithContext<T> for IngotResult<T> {
    fn with_context<F>(self, f: F) -> IngotResult<T>
    where
        F: FnOnce() -> ErrorContext,
    {
        self.map_err(|e| {
            let context = f();
            match e {
                IngotError::BackendDispatch { backend, message } => IngotError::BackendDispatch {
                    backend,
                    message: format!("{}\nContext: {}", message, context.to_error_message()),
                },
                IngotError::MixedRepresentation(msg) => IngotError::MixedRepresentation(format!(
                    "{}\nContext: {}",
                    msg,
                    context.to_error_message()
                )),
                IngotError::ShapeError(msg) => {
                    IngotError::ShapeError(format!("{}\nContext: {}", msg, context.to_error_message()))
                }
                _ => e,
            }
        })
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unresolved,
    InvalidRepresentation,
    MixedRepresentation,
    BackendFailure,
    ArityMismatch,
    ShapeMismatch,
    InvalidInput,
    ConfigInvalid,
    SerializationFailed,
    Io,
    Internal,
}

impl IngotError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            IngotError::UnresolvedTensor(_) => ErrorCode::Unresolved,
            IngotError::InvalidRepresentation(_) => ErrorCode::InvalidRepresentation,
            IngotError::MixedRepresentation(_) => ErrorCode::MixedRepresentation,
            IngotError::BackendDispatch { .. } => ErrorCode::BackendFailure,
            IngotError::ArityMismatch { .. } => ErrorCode::ArityMismatch,
            IngotError::ShapeError(_) => ErrorCode::ShapeMismatch,
            IngotError::InvalidInput(_) => ErrorCode::InvalidInput,
            IngotError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            IngotError::SerializationError(_) => ErrorCode::SerializationFailed,
            IngotError::IoError(_) => ErrorCode::Io,
            IngotError::InternalError(_) => ErrorCode::Internal,
        }
    }

    /// Errors raised by the value model itself rather than by a backend
    pub fn is_representation_error(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::Unresolved | ErrorCode::InvalidRepresentation | ErrorCode::MixedRepresentation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display() {
        let error = IngotError::backend("interpreter", "kernel launch failed");
        assert_eq!(
            error.to_string(),
            "Backend dispatch error: interpreter - kernel launch failed"
        );
        assert_eq!(error.code(), ErrorCode::BackendFailure);
        assert!(!error.is_representation_error());
    }

    #[test]
    fn test_error_context() {
        let result: IngotResult<()> = Err(IngotError::backend("graph", "no such var"));
        let err = result
            .with_context(|| {
                ErrorContext::new("add")
                    .with_layout("[2, 3] f32 cpu")
                    .with_route("graph")
                    .with_suggestion("Check that every input belongs to the same graph")
            })
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("Operation: add"));
        assert!(message.contains("Inputs: [2, 3] f32 cpu"));
        assert!(message.contains("Route: graph"));
        assert!(message.contains("same graph"));
    }

    #[test]
    fn test_context_leaves_representation_errors_alone() {
        let result: IngotResult<()> = Err(IngotError::UnresolvedTensor("x".to_string()));
        let err = result.with_context(|| ErrorContext::new("add")).unwrap_err();
        assert_eq!(err, IngotError::UnresolvedTensor("x".to_string()));
        assert!(err.is_representation_error());
    }

    #[test]
    fn test_shape_error() {
        let error = IngotError::shape_error("[4, 4]", "[4, 2]", Some("Broadcast the smaller input"));
        assert!(error.to_string().contains("Expected [4, 4], got [4, 2]"));
        assert_eq!(error.code(), ErrorCode::ShapeMismatch);
    }
}
