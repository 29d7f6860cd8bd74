use crate::derivative::DerivativeSettings;
use crate::multipart::DecoderSettings;
use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration for the media storage service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Blob store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Multipart upload limits
    #[serde(default)]
    pub upload: UploadConfig,
    /// Derivative (resize) configuration
    #[serde(default)]
    pub derivative: DerivativeConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Blob store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Directory holding uploaded files and their derivatives
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
    /// Name given to parts uploaded without a file name
    #[serde(default = "default_placeholder_name")]
    pub placeholder_name: String,
}

/// Multipart upload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Longest accepted boundary or part header line in bytes
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    /// Maximum number of parts per request
    #[serde(default = "default_max_parts")]
    pub max_parts: usize,
}

/// Derivative configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DerivativeConfig {
    /// JPEG quality for derivatives (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Largest derivative width a client may request
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    /// Largest derivative area in pixels
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
}

/// API configuration for upload and retrieval endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "media-storage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_store_root() -> PathBuf {
    PathBuf::from("upload_temp")
}

fn default_placeholder_name() -> String {
    crate::multipart::PLACEHOLDER_NAME.to_string()
}

fn default_max_line_len() -> usize {
    8 * 1024 // 8KB
}

fn default_max_parts() -> usize {
    64
}

fn default_jpeg_quality() -> u8 {
    90
}

fn default_max_width() -> u32 {
    8192
}

fn default_max_pixels() -> u64 {
    8192 * 8192
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8081
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/media").required(false))
            .add_source(config::File::with_name("/etc/media/storage").required(false))
            // Override with environment variables
            // MEDIA__STORE__ROOT -> store.root
            .add_source(
                config::Environment::with_prefix("MEDIA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.store.root.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField("store.root".to_string()));
        }

        let name = &self.store.placeholder_name;
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(ConfigValidationError::InvalidValue {
                field: "store.placeholder_name".to_string(),
                message: "Must be a non-empty name without path separators".to_string(),
            });
        }

        if self.upload.max_line_len < 80 {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.max_line_len".to_string(),
                message: "Must be at least 80 bytes".to_string(),
            });
        }

        if self.upload.max_parts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.max_parts".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if !(1..=100).contains(&self.derivative.jpeg_quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "derivative.jpeg_quality".to_string(),
                message: "Must be between 1 and 100".to_string(),
            });
        }

        if self.derivative.max_width == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "derivative.max_width".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.derivative.max_pixels == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "derivative.max_pixels".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Decoder settings derived from the upload and store sections
    pub fn decoder_settings(&self) -> DecoderSettings {
        DecoderSettings {
            max_line_len: self.upload.max_line_len,
            max_parts: self.upload.max_parts,
            placeholder_name: self.store.placeholder_name.clone(),
        }
    }

    /// Derivative settings
    pub fn derivative_settings(&self) -> DerivativeSettings {
        DerivativeSettings {
            jpeg_quality: self.derivative.jpeg_quality,
            max_width: self.derivative.max_width,
            max_pixels: self.derivative.max_pixels,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            placeholder_name: default_placeholder_name(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_line_len: default_max_line_len(),
            max_parts: default_max_parts(),
        }
    }
}

impl Default for DerivativeConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
            max_width: default_max_width(),
            max_pixels: default_max_pixels(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            store: StoreConfig::default(),
            upload: UploadConfig::default(),
            derivative: DerivativeConfig::default(),
            api: ApiConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_line_len(), 8192);
        assert_eq!(default_jpeg_quality(), 90);
        assert_eq!(default_placeholder_name(), "unknown");
        assert_eq!(default_api_port(), 8081);
    }

    #[test]
    fn test_valid_config() {
        assert!(create_test_config().validate().is_ok());
    }

    #[test]
    fn test_empty_sections_deserialize_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.store.root, PathBuf::from("upload_temp"));
        assert_eq!(config.upload.max_parts, 64);
        assert!(config.api.cors_enabled);
    }

    #[test]
    fn test_invalid_placeholder_name() {
        let mut config = create_test_config();
        config.store.placeholder_name = "a/b".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_missing_store_root() {
        let mut config = create_test_config();
        config.store.root = PathBuf::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_jpeg_quality() {
        let mut config = create_test_config();
        config.derivative.jpeg_quality = 0;
        assert!(config.validate().is_err());
        config.derivative.jpeg_quality = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_conversion() {
        let mut config = create_test_config();
        config.upload.max_parts = 3;
        config.store.placeholder_name = "blob".to_string();
        let settings = config.decoder_settings();
        assert_eq!(settings.max_parts, 3);
        assert_eq!(settings.placeholder_name, "blob");
        assert_eq!(config.derivative_settings().max_width, 8192);
        assert_eq!(config.derivative_settings().max_pixels, 8192 * 8192);
    }

    #[test]
    fn test_zero_pixel_cap_rejected() {
        let mut config = create_test_config();
        config.derivative.max_pixels = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. }) if field == "derivative.max_pixels"
        ));
    }
}
