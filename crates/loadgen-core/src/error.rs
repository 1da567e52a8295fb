use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum LoadgenError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Serialize for LoadgenError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LoadgenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = LoadgenError::Validation("duration must look like '30s'".to_string());
        assert_eq!(
            err.to_string(),
            "Validation error: duration must look like '30s'"
        );
    }

    #[test]
    fn engine_error_display() {
        let err = LoadgenError::Engine("no thread groups enabled".to_string());
        assert_eq!(err.to_string(), "Engine error: no thread groups enabled");
    }

    #[test]
    fn websocket_error_display() {
        let err = LoadgenError::WebSocket("handshake timed out".to_string());
        assert_eq!(err.to_string(), "WebSocket error: handshake timed out");
    }

    #[test]
    fn internal_error_display() {
        let err = LoadgenError::Internal("unexpected state".to_string());
        assert_eq!(err.to_string(), "Internal error: unexpected state");
    }

    #[test]
    fn io_error_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: LoadgenError = io_err.into();
        let msg = err.to_string();
        assert!(msg.contains("IO error"));
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn serde_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: LoadgenError = json_err.into();
        assert!(err.to_string().contains("Serialization error"));
    }

    #[test]
    fn serialize_produces_string() {
        let err = LoadgenError::Validation("test error".to_string());
        let json = serde_json::to_string(&err).expect("serialize should succeed");
        assert_eq!(json, "\"Validation error: test error\"");
    }

    #[test]
    fn error_is_debug() {
        let err = LoadgenError::Validation("test".to_string());
        let debug = format!("{:?}", err);
        assert!(debug.contains("Validation"));
    }
}
