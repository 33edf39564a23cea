use std::{env, path::PathBuf, str::FromStr};

pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}

pub(crate) fn env_usize(key: &str, default: usize, min: usize) -> usize {
    env_parse::<usize>(key)
        .filter(|value| *value >= min)
        .unwrap_or(default)
}

pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    env_parse::<u64>(key)
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

/// Comma separated values, trimmed, blanks dropped.
pub(crate) fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|raw| split_list(&raw))
        .unwrap_or_default()
}

pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
        .collect()
}

/// Process-level settings for the HTTP surface.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub work_dir: PathBuf,
    pub request_max_bytes: usize,
    pub queue_capacity: usize,
    pub redis_url: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT").unwrap_or(8000),
            work_dir: env::var("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            request_max_bytes: env_usize("REQUEST_MAX_BYTES", 256 * 1024, 1),
            queue_capacity: env_usize("QUEUE_CAPACITY", 64, 1),
            redis_url: env::var("REDIS_URL")
                .ok()
                .filter(|value| !value.trim().is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(split_list(" a, ,b,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
