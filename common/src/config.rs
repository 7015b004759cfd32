use crate::{Error, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Pipeline settings, read once at startup and passed explicitly to every stage.
///
/// The file is INI formatted. Section and key names are matched case-insensitively,
/// so `[OUTPUT] SONGTABLE = songs` and `[output] songtable = songs` are equivalent.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default, alias = "AWS")]
    pub aws: AwsConfig,
    #[serde(alias = "SOURCE")]
    pub source: SourceConfig,
    #[serde(alias = "OUTPUT")]
    pub output: OutputConfig,
    #[serde(default, alias = "PIPELINE")]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AwsConfig {
    #[serde(default, alias = "AWS_ACCESS_KEY_ID")]
    pub aws_access_key_id: Option<String>,
    #[serde(default, alias = "AWS_SECRET_ACCESS_KEY")]
    pub aws_secret_access_key: Option<String>,
    #[serde(default, alias = "REGION")]
    pub region: Option<String>,
    #[serde(default, alias = "ENDPOINT")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(alias = "SONGPATH")]
    pub songpath: String,
    #[serde(alias = "LOGPATH")]
    pub logpath: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(alias = "OUTPUT_PATH")]
    pub output_path: String,
    #[serde(alias = "SONGTABLE")]
    pub songtable: String,
    #[serde(alias = "ARTISTTABLE")]
    pub artisttable: String,
    #[serde(alias = "USERTABLE")]
    pub usertable: String,
    #[serde(alias = "TIMETABLE")]
    pub timetable: String,
    #[serde(alias = "SONGPLAY")]
    pub songplay: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_event_page", alias = "EVENT_PAGE")]
    pub event_page: String,
    #[serde(default = "default_song_match", alias = "SONG_MATCH")]
    pub song_match: String,
    #[serde(default, alias = "TARGET_PARTITIONS")]
    pub target_partitions: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            event_page: default_event_page(),
            song_match: default_song_match(),
            target_partitions: None,
        }
    }
}

fn default_event_page() -> String {
    "NextSong".to_string()
}

fn default_song_match() -> String {
    SongMatch::Title.to_string()
}

/// How play events are matched against the song dimension.
///
/// `Title` is the historical behavior and collides whenever two songs share a
/// title. `TitleArtist` also requires the event's artist to equal the artist name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SongMatch {
    Title,
    TitleArtist,
}

impl FromStr for SongMatch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "title" => Ok(SongMatch::Title),
            "title_artist" => Ok(SongMatch::TitleArtist),
            other => Err(Error::InvalidConfig(format!(
                "SONG_MATCH must be 'title' or 'title_artist', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SongMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SongMatch::Title => f.write_str("title"),
            SongMatch::TitleArtist => f.write_str("title_artist"),
        }
    }
}

impl AwsConfig {
    pub fn access_key_id(&self) -> Option<&str> {
        non_empty(&self.aws_access_key_id)
    }

    pub fn secret_access_key(&self) -> Option<&str> {
        non_empty(&self.aws_secret_access_key)
    }

    pub fn region(&self) -> Option<&str> {
        non_empty(&self.region)
    }

    pub fn endpoint(&self) -> Option<&str> {
        non_empty(&self.endpoint)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl OutputConfig {
    fn named_tables(&self) -> [(&'static str, &str); 5] {
        [
            ("SONGTABLE", self.songtable.as_str()),
            ("ARTISTTABLE", self.artisttable.as_str()),
            ("USERTABLE", self.usertable.as_str()),
            ("TIMETABLE", self.timetable.as_str()),
            ("SONGPLAY", self.songplay.as_str()),
        ]
    }
}

impl Settings {
    pub fn new(path: &str) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::new(path, FileFormat::Ini).required(true))
            .add_source(Environment::with_prefix("APP").separator("__"));

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;

        debug!(
            song_source = %settings.source.songpath,
            log_source = %settings.source.logpath,
            output_root = %settings.output.output_path,
            "Loaded pipeline settings"
        );

        Ok(settings)
    }

    pub fn song_match(&self) -> Result<SongMatch> {
        self.pipeline.song_match.parse()
    }

    fn validate(&self) -> Result<()> {
        let required = [
            ("SOURCE.SONGPATH", &self.source.songpath),
            ("SOURCE.LOGPATH", &self.source.logpath),
            ("OUTPUT.OUTPUT_PATH", &self.output.output_path),
            ("PIPELINE.EVENT_PAGE", &self.pipeline.event_page),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(Error::InvalidConfig(format!("{} must not be empty", key)));
            }
        }

        let mut seen = HashSet::new();
        for (key, name) in self.output.named_tables() {
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::InvalidConfig(format!("OUTPUT.{} must not be empty", key)));
            }
            if name.trim_matches('/').contains('/') {
                return Err(Error::InvalidConfig(format!(
                    "OUTPUT.{} must be a single path segment, got '{}'",
                    key, name
                )));
            }
            if !seen.insert(name.trim_matches('/')) {
                return Err(Error::InvalidConfig(format!(
                    "OUTPUT.{} reuses table name '{}'",
                    key, name
                )));
            }
        }

        if self.pipeline.target_partitions == Some(0) {
            return Err(Error::InvalidConfig(
                "PIPELINE.TARGET_PARTITIONS must be at least 1".to_string(),
            ));
        }

        self.song_match()?;
        Ok(())
    }
}
