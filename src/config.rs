//! Deployment configuration
//!
//! An [`AppConfig`] is built once at startup and handed to every pipeline
//! service and to the live-view hub. It can be assembled with the builder
//! methods or loaded from the deployment's `KEY=VALUE` text file:
//!
//! ```text
//! plate=BUS042
//! streamEndpoint=rtmp://ingest.example.net/live/
//! source_1_endpoint=rtsp://10.0.0.10/stream1
//! source_1_audio=0
//! recording_segment_time=600
//! recording_output_dir=/var/lib/camrelay
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default recording segment length (15 minutes)
pub const DEFAULT_SEGMENT_TIME: Duration = Duration::from_secs(900);

/// Default base directory for recordings
pub const DEFAULT_OUTPUT_DIR: &str = "recordings";

/// One configured camera input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// RTSP endpoint
    pub endpoint: String,
    /// Whether the source carries audio
    pub audio: bool,
}

/// A camera as seen by the pipelines
///
/// Derived from [`AppConfig`]; read-only to everything downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSource {
    /// Camera identity (`<deployment>_<index>`)
    pub name: String,
    /// Ingest URI
    pub source: String,
    /// Push target for the relay, if any
    pub destination: Option<String>,
    /// Audio-enabled flag
    pub audio: bool,
}

impl CameraSource {
    /// Create a camera without a relay destination
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            destination: None,
            audio: false,
        }
    }

    /// Set the relay destination
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Deployment identifier, prefix of every camera name
    pub deployment: String,

    /// Relay push-URL prefix; the camera name is appended
    pub stream_endpoint: String,

    /// Ordered camera inputs
    pub sources: Vec<SourceConfig>,

    /// Recording segment duration
    pub segment_time: Duration,

    /// Base directory for recordings
    pub output_dir: PathBuf,
}

impl AppConfig {
    /// Create an empty configuration for a deployment
    pub fn new(deployment: impl Into<String>, stream_endpoint: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            stream_endpoint: stream_endpoint.into(),
            sources: Vec::new(),
            segment_time: DEFAULT_SEGMENT_TIME,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }

    /// Append a camera source
    pub fn source(mut self, endpoint: impl Into<String>, audio: bool) -> Self {
        self.sources.push(SourceConfig {
            endpoint: endpoint.into(),
            audio,
        });
        self
    }

    /// Set the recording segment duration
    pub fn segment_time(mut self, segment_time: Duration) -> Self {
        self.segment_time = segment_time;
        self
    }

    /// Set the recording base directory
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Name of the camera at `index`
    pub fn camera_name(&self, index: usize) -> String {
        format!("{}_{}", self.deployment, index)
    }

    /// All cameras in configuration order
    pub fn cameras(&self) -> Vec<CameraSource> {
        self.sources
            .iter()
            .enumerate()
            .map(|(index, src)| self.to_camera(index, src))
            .collect()
    }

    /// Names of all cameras in configuration order
    pub fn camera_names(&self) -> Vec<String> {
        (0..self.sources.len()).map(|i| self.camera_name(i)).collect()
    }

    /// Look up a camera by name
    pub fn camera(&self, name: &str) -> Option<CameraSource> {
        self.sources
            .iter()
            .enumerate()
            .find(|(index, _)| self.camera_name(*index) == name)
            .map(|(index, src)| self.to_camera(index, src))
    }

    fn to_camera(&self, index: usize, src: &SourceConfig) -> CameraSource {
        let name = self.camera_name(index);
        CameraSource {
            destination: Some(format!("{}{}", self.stream_endpoint, name)),
            source: src.endpoint.clone(),
            audio: src.audio,
            name,
        }
    }

    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&text)?;

        tracing::info!(
            path = %path.display(),
            deployment = %config.deployment,
            cameras = config.sources.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse `KEY=VALUE` text and validate the result
    pub fn parse(text: &str) -> Result<Self> {
        let mut deployment = None;
        let mut stream_endpoint = None;
        let mut segment_time = DEFAULT_SEGMENT_TIME;
        let mut output_dir = PathBuf::from(DEFAULT_OUTPUT_DIR);
        let mut partial: BTreeMap<usize, (Option<String>, Option<bool>)> = BTreeMap::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!(line = %line, "Ignoring malformed configuration line");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            if let Some((index, property)) = parse_source_key(key) {
                let slot = partial.entry(index).or_default();
                match property {
                    "endpoint" => slot.0 = Some(value.to_string()),
                    "audio" => slot.1 = Some(parse_flag(value)),
                    other => tracing::debug!(key = %key, property = %other, "Unknown source property"),
                }
                continue;
            }

            match key {
                "plate" => deployment = Some(value.to_string()),
                "streamEndpoint" => stream_endpoint = Some(value.to_string()),
                "recording_segment_time" => match value.parse::<u64>() {
                    Ok(secs) if secs > 0 => segment_time = Duration::from_secs(secs),
                    _ => tracing::warn!(value = %value, "Invalid recording_segment_time, using default"),
                },
                "recording_output_dir" if !value.is_empty() => output_dir = PathBuf::from(value),
                _ => tracing::debug!(key = %key, "Ignoring unknown configuration key"),
            }
        }

        let mut sources = Vec::with_capacity(partial.len());
        for (index, slot) in partial {
            match slot {
                (Some(endpoint), Some(audio)) if !endpoint.is_empty() => {
                    sources.push(SourceConfig { endpoint, audio });
                }
                _ => tracing::warn!(source = index, "Incomplete source configuration, skipping"),
            }
        }

        let config = Self {
            deployment: deployment
                .filter(|d| !d.is_empty())
                .ok_or_else(|| Error::Config("missing plate".into()))?,
            stream_endpoint: stream_endpoint
                .filter(|e| !e.is_empty())
                .ok_or_else(|| Error::Config("missing streamEndpoint".into()))?,
            sources,
            segment_time,
            output_dir,
        };

        if config.sources.is_empty() {
            return Err(Error::Config("no complete camera source configured".into()));
        }

        Ok(config)
    }
}

/// Split `source_<N>_<property>` into its 1-based index and property
fn parse_source_key(key: &str) -> Option<(usize, &str)> {
    let rest = key.strip_prefix("source_")?;
    let (index, property) = rest.split_once('_')?;
    let index: usize = index.parse().ok()?;
    if index == 0 {
        return None;
    }
    Some((index, property))
}

fn parse_flag(value: &str) -> bool {
    match value.parse::<i64>() {
        Ok(n) => n != 0,
        Err(_) => value.eq_ignore_ascii_case("true"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# deployment
plate=plate
streamEndpoint=rtmp://ingest/live/

source_1_endpoint=rtsp://10.0.0.1/a
source_1_audio=1
source_2_endpoint=rtsp://10.0.0.2/a
source_2_audio=0
source_4_endpoint=rtsp://10.0.0.4/a
source_4_audio=0
recording_segment_time=600
";

    #[test]
    fn test_parse_sources_in_order() {
        let config = AppConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.deployment, "plate");
        assert_eq!(config.sources.len(), 3);
        assert!(config.sources[0].audio);
        assert!(!config.sources[1].audio);
        assert_eq!(config.sources[2].endpoint, "rtsp://10.0.0.4/a");
        assert_eq!(config.segment_time, Duration::from_secs(600));
        assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
    }

    #[test]
    fn test_camera_names_follow_index() {
        let config = AppConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.camera_names(), vec!["plate_0", "plate_1", "plate_2"]);

        let camera = config.camera("plate_1").unwrap();
        assert_eq!(camera.source, "rtsp://10.0.0.2/a");
        assert_eq!(camera.destination.as_deref(), Some("rtmp://ingest/live/plate_1"));
        assert!(config.camera("plate_3").is_none());
    }

    #[test]
    fn test_incomplete_source_skipped() {
        let text = "plate=p\nstreamEndpoint=rtmp://x/\nsource_1_endpoint=rtsp://a\nsource_2_endpoint=rtsp://b\nsource_2_audio=0\n";
        let config = AppConfig::parse(text).unwrap();

        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].endpoint, "rtsp://b");
    }

    #[test]
    fn test_invalid_segment_time_uses_default() {
        let text = "plate=p\nstreamEndpoint=rtmp://x/\nsource_1_endpoint=rtsp://a\nsource_1_audio=0\nrecording_segment_time=-5\n";
        let config = AppConfig::parse(text).unwrap();

        assert_eq!(config.segment_time, DEFAULT_SEGMENT_TIME);
    }

    #[test]
    fn test_missing_required_keys() {
        let no_plate = "streamEndpoint=rtmp://x/\nsource_1_endpoint=rtsp://a\nsource_1_audio=0\n";
        assert!(matches!(AppConfig::parse(no_plate), Err(Error::Config(_))));

        let no_sources = "plate=p\nstreamEndpoint=rtmp://x/\n";
        assert!(matches!(AppConfig::parse(no_sources), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = tokio_test::assert_ok!(AppConfig::load(file.path()));
        assert_eq!(config.sources.len(), 3);

        let err = tokio_test::assert_err!(AppConfig::load("/nonexistent/camrelay.txt"));
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_builder_chaining() {
        let config = AppConfig::new("bus", "rtmp://ingest/")
            .source("rtsp://a", false)
            .source("rtsp://b", true)
            .segment_time(Duration::from_secs(60))
            .output_dir("/tmp/rec");

        assert_eq!(config.cameras().len(), 2);
        assert_eq!(config.cameras()[1].name, "bus_1");
        assert!(config.cameras()[1].audio);
        assert_eq!(config.segment_time, Duration::from_secs(60));
        assert_eq!(config.output_dir, PathBuf::from("/tmp/rec"));
    }
}
