//! Pipeline options.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};

/// Lanes are rendezvous unless asked otherwise.
pub const DEFAULT_CHANNEL_BUFFER: usize = 0;

/// Largest buffer a lane may be given.
pub const MAX_CHANNEL_BUFFER: usize = 1 << 16;

/// Options applied to every run of a pipeline.
///
/// Missing fields take their defaults; unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineOptions {
    /// Label attached to log spans and metrics.
    pub name: String,
    /// Items each lane of the graph may hold ahead of its receiver.
    ///
    /// With a buffer, fan-out may park an item behind a busy worker.
    pub channel_buffer: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }
}

impl PipelineOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> PipelineResult<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| PipelineError::Config(format!("failed to parse options: {}", e)))?;
        options.sanitize()?;
        Ok(options)
    }

    /// Validate option values before they are used to build a channel graph.
    pub fn sanitize(&self) -> PipelineResult<()> {
        if self.channel_buffer > MAX_CHANNEL_BUFFER {
            return Err(PipelineError::Config(format!(
                "channel_buffer {} exceeds the maximum of {}",
                self.channel_buffer, MAX_CHANNEL_BUFFER
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = PipelineOptions::default();
        assert_eq!(options.channel_buffer, 0);
        assert!(options.name.is_empty());
        assert!(options.sanitize().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let options = PipelineOptions::from_json(r#"{"name": "ingest"}"#).unwrap();
        assert_eq!(options.name, "ingest");
        assert_eq!(options.channel_buffer, DEFAULT_CHANNEL_BUFFER);

        let options = PipelineOptions::from_json(r#"{"channel_buffer": 8}"#).unwrap();
        assert_eq!(options.channel_buffer, 8);
    }

    #[test]
    fn test_oversized_buffer_rejected() {
        let json = format!(r#"{{"channel_buffer": {}}}"#, MAX_CHANNEL_BUFFER + 1);
        let result = PipelineOptions::from_json(&json);
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = PipelineOptions::from_json(r#"{"capacity": 4}"#);
        assert!(result.unwrap_err().to_string().contains("unknown field"));
    }
}
