use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

static DEFAULT_BRAND_PRIORITY: Lazy<Vec<String>> = Lazy::new(|| {
    [
        "nike.com",
        "puma.com",
        "foot-store.com",
        "adidas.com",
        "solesense.com",
        "footy.com",
        "kickscrew.com",
        "soccervillage.com",
        "goat.com",
        "soccerpost.com",
        "sportano.com",
        "soccerandrugby.com",
        "adsport.store",
        "mybrand.shoes",
        "u90soccer.com",
        "yoursportsperformance.com",
        "authenticsoccer.com",
    ]
    .into_iter()
    .map(String::from)
    .collect()
});

static DEFAULT_BANNED_PATTERNS: Lazy<Vec<String>> = Lazy::new(|| {
    vec![
        "assets.solesense.com/site/images/logos/solesense/square-black.png".to_string(),
        "https://media.foot-store.com/lazyload/websites/1/fs.jpg".to_string(),
    ]
});

const FOOT_STORE_HOST: &str = "media.foot-store.com";

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("unable to read merge rules from {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid merge rules: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// A source whose search results are unreliable about SKU identity. Its
/// URLs must mention the record's SKU and are ordered by their numeric
/// suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRule {
    pub host: String,
    #[serde(default = "enabled")]
    pub require_sku_in_url: bool,
    #[serde(default = "enabled")]
    pub numeric_suffix_order: bool,
}

impl SourceRule {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into().to_lowercase(),
            require_sku_in_url: true,
            numeric_suffix_order: true,
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        url_host(url).is_some_and(|host| host_matches(&host, &self.host))
    }
}

fn enabled() -> bool {
    true
}

/// Data-driven part of merging: trusted-source priority, banned URL
/// fragments and the consistency-checked sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeRules {
    pub brand_priority: Vec<String>,
    pub banned_patterns: Vec<String>,
    pub consistency_sources: Vec<SourceRule>,
}

impl Default for MergeRules {
    fn default() -> Self {
        Self {
            brand_priority: DEFAULT_BRAND_PRIORITY.clone(),
            banned_patterns: DEFAULT_BANNED_PATTERNS.clone(),
            consistency_sources: vec![SourceRule::new(FOOT_STORE_HOST)],
        }
    }
}

impl MergeRules {
    pub fn from_yaml_str(raw: &str) -> Result<Self, RulesError> {
        let mut rules: MergeRules = serde_yaml::from_str(raw)?;
        rules.normalize();
        Ok(rules)
    }

    pub fn load(path: &Path) -> Result<Self, RulesError> {
        let raw = std::fs::read_to_string(path).map_err(|err| RulesError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Rules from `MERGE_RULES_PATH` when set, otherwise the built-in lists.
    pub fn from_env() -> Self {
        let Ok(path) = std::env::var("MERGE_RULES_PATH") else {
            return Self::default();
        };
        match Self::load(Path::new(&path)) {
            Ok(rules) => {
                info!(
                    target = "catalog.merge",
                    path = %path,
                    brands = rules.brand_priority.len(),
                    banned = rules.banned_patterns.len(),
                    "loaded merge rules"
                );
                rules
            }
            Err(err) => {
                warn!(
                    target = "catalog.merge",
                    error = %err,
                    "falling back to built-in merge rules"
                );
                Self::default()
            }
        }
    }

    fn normalize(&mut self) {
        for domain in self.brand_priority.iter_mut() {
            *domain = domain.trim().to_lowercase();
        }
        self.brand_priority.retain(|domain| !domain.is_empty());
        self.banned_patterns.retain(|pattern| !pattern.trim().is_empty());
        for source in self.consistency_sources.iter_mut() {
            source.host = source.host.trim().to_lowercase();
        }
        self.consistency_sources.retain(|source| !source.host.is_empty());
    }

    /// Case-insensitive substring match against the banned list.
    pub fn is_banned(&self, url: &str) -> bool {
        if url.is_empty() {
            return false;
        }
        let lower = url.to_lowercase();
        self.banned_patterns
            .iter()
            .any(|pattern| lower.contains(&pattern.to_lowercase()))
    }

    /// Position of the first trusted domain serving `url`; unmatched URLs
    /// rank after every listed domain.
    pub fn brand_rank(&self, url: &str) -> usize {
        let Some(host) = url_host(url) else {
            return self.brand_priority.len();
        };
        self.brand_priority
            .iter()
            .position(|domain| host_matches(&host, domain))
            .unwrap_or(self.brand_priority.len())
    }

    pub fn source_rule_for(&self, url: &str) -> Option<&SourceRule> {
        self.consistency_sources
            .iter()
            .find(|source| source.matches(url))
    }
}

pub(crate) fn url_host(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_lowercase))
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}
