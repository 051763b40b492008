use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::api::PostRequest;
use crate::db::Database;
use crate::news::Article;

const AI_CONFIG_KEY: &str = "ai_config";
const THEME_KEY: &str = "theme";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingError {
    #[error("unknown setting '{0}'")]
    UnknownKey(String),

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PostLength {
    #[serde(rename = "Corto")]
    Short,
    #[default]
    #[serde(rename = "Medio")]
    Medium,
    #[serde(rename = "Largo")]
    Long,
}

impl PostLength {
    pub const ALL: [PostLength; 3] = [PostLength::Short, PostLength::Medium, PostLength::Long];

    /// Name on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            PostLength::Short => "Corto",
            PostLength::Medium => "Medio",
            PostLength::Long => "Largo",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PostLength::Short => "Short",
            PostLength::Medium => "Medium",
            PostLength::Long => "Long",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(value) || l.label().eq_ignore_ascii_case(value))
    }
}

/// How generated posts should read. Stored fields missing from the saved
/// JSON fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub language: String,
    pub style: String,
    pub length: PostLength,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            language: "Español".to_string(),
            style: "Formal".to_string(),
            length: PostLength::Medium,
        }
    }
}

impl AiConfig {
    pub async fn load(db: &Database) -> anyhow::Result<Self> {
        let Some(raw) = db.get_setting(AI_CONFIG_KEY).await? else {
            return Ok(Self::default());
        };

        match serde_json::from_str(&raw) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("Stored AI config is unreadable, using defaults: {}", e);
                Ok(Self::default())
            }
        }
    }

    pub async fn save(&self, db: &Database) -> anyhow::Result<()> {
        db.put_setting(AI_CONFIG_KEY, &serde_json::to_string(self)?).await
    }

    /// Sets one field by name.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingError> {
        let value = value.trim();
        let invalid = || SettingError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "language" if !value.is_empty() => self.language = value.to_string(),
            "style" if !value.is_empty() => self.style = value.to_string(),
            "length" => self.length = PostLength::parse(value).ok_or_else(invalid)?,
            "language" | "style" => return Err(invalid()),
            _ => return Err(SettingError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Loads, changes one field and persists the result.
    pub async fn update(db: &Database, key: &str, value: &str) -> anyhow::Result<Self> {
        let mut config = Self::load(db).await?;
        config.set(key, value)?;
        config.save(db).await?;
        Ok(config)
    }

    pub fn post_request(&self, article: &Article) -> PostRequest {
        PostRequest {
            title: article.title.clone(),
            summary: article.summary.clone(),
            source: article.source.clone(),
            style: self.style.clone(),
            language: self.language.clone(),
            length: self.length.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Dark => "dark",
            Theme::Light => "light",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Theme::Dark => Theme::Light,
            Theme::Light => Theme::Dark,
        }
    }

    pub async fn load(db: &Database) -> anyhow::Result<Self> {
        let theme = match db.get_setting(THEME_KEY).await?.as_deref() {
            Some("light") => Theme::Light,
            _ => Theme::Dark,
        };
        Ok(theme)
    }

    pub async fn toggle(db: &Database) -> anyhow::Result<Self> {
        let theme = Self::load(db).await?.toggled();
        db.put_setting(THEME_KEY, theme.as_str()).await?;
        Ok(theme)
    }
}
