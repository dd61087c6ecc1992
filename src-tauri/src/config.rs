//! Configuration management for gemchat.
//!
//! Settings are merged from two JSON files in the working directory:
//! `media.json` carries the runtime A/V parameters and `config.json` the
//! development settings. Values from `config.json` take precedence on key
//! collision. The model's system prompt is loaded separately from the
//! plain-text file named by the `instructions_file` key.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::Path;

/// Default path of the development settings file.
pub const CONFIG_FILE: &str = "config.json";

/// Default path of the runtime media settings file.
pub const MEDIA_FILE: &str = "media.json";

/// Environment variable holding the Gemini API key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// A settings or instruction file does not exist or could not be read
    MissingFile(String),
    /// A settings file contains invalid JSON or fails validation
    Malformed(String),
    /// A required settings key is absent from both files
    MissingKey(&'static str),
    /// The configured microphone kind is not one of the supported values
    UnsupportedMicType(String),
    /// The instruction file exists but contains no text
    EmptyInstructions(String),
    /// The API key environment variable is not set
    MissingCredential,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingFile(path) => write!(f, "Configuration file not found: {}", path),
            ConfigError::Malformed(msg) => write!(f, "Invalid configuration: {}", msg),
            ConfigError::MissingKey(key) => write!(f, "Missing configuration key: {}", key),
            ConfigError::UnsupportedMicType(mic) => {
                write!(f, "Unsupported mic_type '{}' (expected dynamic_mic or computer_mic)", mic)
            }
            ConfigError::EmptyInstructions(path) => {
                write!(f, "Instruction file is empty: {}", path)
            }
            ConfigError::MissingCredential => write!(
                f,
                "{} not found in environment. Set it to your Gemini API key before starting a session.",
                API_KEY_ENV
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for String {
    fn from(err: ConfigError) -> Self {
        err.to_string()
    }
}

/// Microphone kind, which determines the audio capture chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicType {
    /// Dedicated/dynamic microphone: smaller chunks, lower latency
    DynamicMic,
    /// Built-in laptop microphone: larger chunks for stability
    ComputerMic,
}

impl MicType {
    /// Parse from string (case-insensitive).
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "dynamic_mic" => Some(MicType::DynamicMic),
            "computer_mic" => Some(MicType::ComputerMic),
            _ => None,
        }
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MicType::DynamicMic => "dynamic_mic",
            MicType::ComputerMic => "computer_mic",
        }
    }

    /// Capture chunk size in bytes for this microphone kind.
    pub fn chunk_size(&self) -> usize {
        match self {
            MicType::DynamicMic => 512,
            MicType::ComputerMic => 1024,
        }
    }
}

/// Merged application settings.
///
/// Recognized keys are typed below; anything else found in the settings
/// files is carried along untouched in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Microphone kind (determines capture chunk size).
    pub mic_type: MicType,
    /// Upstream model identifier.
    pub model: String,
    /// Prebuilt synthesized-voice identifier.
    pub voice_name: String,
    /// Seconds between webcam captures.
    #[serde(default = "default_video_capture_interval")]
    pub video_capture_interval: f64,
    /// Window/page title for the UI.
    #[serde(default = "default_ui_title")]
    pub ui_title: String,
    /// Response modalities requested from the model.
    #[serde(default = "default_response_modalities")]
    pub response_modalities: Vec<String>,
    /// Microphone sample rate in Hz.
    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,
    /// Speaker sample rate in Hz.
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,
    /// Number of audio channels (1 = mono).
    #[serde(default = "default_audio_channels")]
    pub audio_channels: u16,
    /// PCM sample format label.
    #[serde(default = "default_audio_format")]
    pub audio_format: String,
    /// Maximum bounding box for outgoing video frames, as [width, height].
    #[serde(default = "default_thumbnail_max_size")]
    pub thumbnail_max_size: [u32; 2],
    /// Placeholder image shape as [height, width, channels].
    #[serde(default = "default_blank_image_shape")]
    pub blank_image_shape: [u32; 3],
    /// Path to the plain-text system prompt file.
    pub instructions_file: String,
    /// Maximum depth of the inbound audio playback queue.
    #[serde(default = "default_audio_queue_depth")]
    pub audio_queue_depth: usize,
    /// Unrecognized keys, passed through inertly.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_video_capture_interval() -> f64 {
    0.5
}

fn default_ui_title() -> String {
    "Gemini Audio/Video Demo".to_string()
}

fn default_response_modalities() -> Vec<String> {
    vec!["AUDIO".to_string()]
}

fn default_input_sample_rate() -> u32 {
    16000
}

fn default_output_sample_rate() -> u32 {
    24000
}

fn default_audio_channels() -> u16 {
    1
}

fn default_audio_format() -> String {
    "s16le".to_string()
}

fn default_thumbnail_max_size() -> [u32; 2] {
    [1024, 1024]
}

fn default_blank_image_shape() -> [u32; 3] {
    [480, 640, 3]
}

fn default_audio_queue_depth() -> usize {
    64
}

impl Settings {
    /// Capture chunk size in bytes, derived from the microphone kind.
    pub fn chunk_size(&self) -> usize {
        self.mic_type.chunk_size()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.video_capture_interval <= 0.0 {
            return Err(ConfigError::Malformed(
                "video_capture_interval must be a positive number of seconds".to_string(),
            ));
        }
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            return Err(ConfigError::Malformed(
                "sample rates must be positive".to_string(),
            ));
        }
        if self.audio_channels == 0 {
            return Err(ConfigError::Malformed(
                "audio_channels must be at least 1".to_string(),
            ));
        }
        if self.audio_queue_depth == 0 {
            return Err(ConfigError::Malformed(
                "audio_queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_json_object(path: &Path) -> Result<serde_json::Map<String, Value>, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::MissingFile(path.display().to_string()));
    }
    let contents = fs::read_to_string(path)
        .map_err(|e| ConfigError::MissingFile(format!("{}: {}", path.display(), e)))?;
    let value: Value = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::Malformed(format!("{}: {}", path.display(), e)))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::Malformed(format!(
            "{}: expected a top-level JSON object",
            path.display()
        ))),
    }
}

/// Load and merge the two settings files.
///
/// Both files must exist. Keys from `config_path` override keys from
/// `media_path`.
pub fn load_settings(config_path: &Path, media_path: &Path) -> Result<Settings, ConfigError> {
    let mut merged = read_json_object(media_path)?;
    let dev = read_json_object(config_path)?;
    for (key, value) in dev {
        merged.insert(key, value);
    }

    // Check the mic kind before full deserialization so an unsupported
    // value surfaces as its own error rather than a generic parse failure.
    let mic = merged
        .get("mic_type")
        .and_then(Value::as_str)
        .ok_or(ConfigError::MissingKey("mic_type"))?;
    if MicType::from_str(mic).is_none() {
        return Err(ConfigError::UnsupportedMicType(mic.to_string()));
    }

    let settings: Settings = serde_json::from_value(Value::Object(merged))
        .map_err(|e| ConfigError::Malformed(e.to_string()))?;
    settings.validate()?;
    Ok(settings)
}

/// Load settings from the default file locations.
pub fn load_default_settings() -> Result<Settings, ConfigError> {
    load_settings(Path::new(CONFIG_FILE), Path::new(MEDIA_FILE))
}

/// Load the system instruction text named by the settings.
///
/// The entire file contents, trimmed, become the model's behavioral prompt.
/// A missing or empty file is a fatal startup error.
pub fn load_instruction(settings: &Settings) -> Result<String, ConfigError> {
    let path = Path::new(&settings.instructions_file);
    if !path.is_file() {
        return Err(ConfigError::MissingFile(path.display().to_string()));
    }
    let text = fs::read_to_string(path)
        .map_err(|e| ConfigError::MissingFile(format!("{}: {}", path.display(), e)))?;
    let text = text.trim();
    if text.is_empty() {
        return Err(ConfigError::EmptyInstructions(path.display().to_string()));
    }
    Ok(text.to_string())
}
