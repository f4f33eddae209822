//! Construction parameters shared by source and sink streams.

use crate::error::{Error, Result};

/// Default threshold for byte-mode streams (16 KiB).
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Default threshold for object-mode streams, counted in chunks.
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;

/// Configuration for a single stream.
///
/// There is no process-wide default; every stream receives its own copy at
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StreamConfig {
    /// Soft capacity threshold that triggers backpressure signalling
    pub high_water_mark: usize,
    /// Whether each chunk counts as one unit instead of its byte length
    pub object_mode: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            object_mode: false,
        }
    }
}

impl StreamConfig {
    /// Object-mode configuration with a threshold of
    /// [`DEFAULT_OBJECT_HIGH_WATER_MARK`] chunks.
    pub fn object() -> Self {
        Self {
            high_water_mark: DEFAULT_OBJECT_HIGH_WATER_MARK,
            object_mode: true,
        }
    }

    /// Set the high water mark
    pub fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    /// Set object mode
    pub fn object_mode(mut self, object_mode: bool) -> Self {
        self.object_mode = object_mode;
        self
    }

    /// Reject configurations no stream can run with.
    pub fn validate(&self) -> Result<()> {
        if self.high_water_mark == 0 {
            return Err(Error::InvalidConfig(
                "high_water_mark must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.high_water_mark, 16384);
        assert!(!config.object_mode);

        let object = StreamConfig::object();
        assert_eq!(object.high_water_mark, 16);
        assert!(object.object_mode);
    }

    #[test]
    fn zero_high_water_mark_is_rejected() {
        let err = StreamConfig::default()
            .high_water_mark(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(StreamConfig::object().high_water_mark(1).validate().is_ok());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: StreamConfig = serde_json::from_str(r#"{"object_mode": true}"#).unwrap();
        assert_eq!(config.high_water_mark, DEFAULT_HIGH_WATER_MARK);
        assert!(config.object_mode);
    }
}
