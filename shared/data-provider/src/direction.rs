use crate::DataError;

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// A source/target language pair, optionally qualified by the corpus it
/// came from. Written as `[origin/]source-target`, e.g. `flores/eng_Latn-fra_Latn`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Direction {
    pub source_lang: String,
    pub target_lang: String,
    pub origin: Option<String>,
}

impl Direction {
    pub fn new(source_lang: impl Into<String>, target_lang: impl Into<String>) -> Self {
        Self {
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(origin) = &self.origin {
            write!(f, "{origin}/")?;
        }
        write!(f, "{}-{}", self.source_lang, self.target_lang)
    }
}

impl FromStr for Direction {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DataError::InvalidDirection(s.to_string());

        let (origin, pair) = match s.split_once('/') {
            Some((origin, pair)) if !origin.is_empty() => (Some(origin.to_string()), pair),
            Some(_) => return Err(invalid()),
            None => (None, s),
        };
        let (source_lang, target_lang) = pair.split_once('-').ok_or_else(invalid)?;
        if source_lang.is_empty() || target_lang.is_empty() || target_lang.contains('-') {
            return Err(invalid());
        }

        Ok(Self {
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
            origin,
        })
    }
}

impl TryFrom<String> for Direction {
    type Error = DataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Direction> for String {
    fn from(value: Direction) -> Self {
        value.to_string()
    }
}
