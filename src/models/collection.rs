//! The fixed whitelist of CMS collections that can be backed up

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// A named collection of the CMS document store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Blogs,
    Users,
    Comments,
    Media,
    SystemSettings,
    Scripts,
    PageSeo,
    SchedulerConfigs,
}

impl Collection {
    /// Every whitelisted collection, in canonical backup order
    pub const ALL: [Collection; 8] = [
        Self::Blogs,
        Self::Users,
        Self::Comments,
        Self::Media,
        Self::SystemSettings,
        Self::Scripts,
        Self::PageSeo,
        Self::SchedulerConfigs,
    ];

    /// Name used by the document store and inside archives
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blogs => "blogs",
            Self::Users => "users",
            Self::Comments => "comments",
            Self::Media => "media",
            Self::SystemSettings => "systemsettings",
            Self::Scripts => "scripts",
            Self::PageSeo => "pageseo",
            Self::SchedulerConfigs => "schedulerconfigs",
        }
    }

    /// Parse a whitelisted name, `None` for anything else
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// Check whether a set covers the whole whitelist
    pub fn is_whole_whitelist(collections: &[Collection]) -> bool {
        Self::ALL.iter().all(|c| collections.contains(c))
    }

    /// Validate a list of names, dropping duplicates but keeping order
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>, EngineError> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let collection: Collection = name.as_ref().parse()?;
            if !out.contains(&collection) {
                out.push(collection);
            }
        }
        Ok(out)
    }

    /// Join names for log lines and CLI output
    pub fn join(collections: &[Collection]) -> String {
        collections
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| {
            EngineError::Validation(format!(
                "Unknown collection '{}'. Valid collections: {}",
                s.trim(),
                Self::join(&Self::ALL)
            ))
        })
    }
}
