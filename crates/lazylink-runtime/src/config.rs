use std::time::Duration;

use anyhow::Context;

pub const ENV_PUBLIC_PATH: &str = "LAZYLINK_PUBLIC_PATH";
pub const ENV_CHUNK_TIMEOUT_MS: &str = "LAZYLINK_CHUNK_TIMEOUT_MS";
pub const ENV_SCRIPT_NONCE: &str = "LAZYLINK_SCRIPT_NONCE";

pub const DEFAULT_CHARSET: &str = "utf-8";
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Prefix of every chunk and binary module URL.
    pub public_path: String,
    pub charset: String,
    /// Bound on one chunk script injection.
    pub chunk_timeout: Duration,
    /// Content-security nonce attached to injected scripts.
    pub nonce: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            public_path: String::new(),
            charset: DEFAULT_CHARSET.to_string(),
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            nonce: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::default().with_env(|name| std::env::var(name).ok())
    }

    /// Applies overrides read through `lookup`. Unset variables leave the field alone.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        if let Some(raw) = lookup(ENV_PUBLIC_PATH) {
            self.public_path = raw.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_CHUNK_TIMEOUT_MS) {
            let ms = parse_timeout_ms(&raw)
                .with_context(|| format!("invalid environment variable {ENV_CHUNK_TIMEOUT_MS}={raw:?}"))?;
            self.chunk_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup(ENV_SCRIPT_NONCE) {
            let raw = raw.trim();
            self.nonce = (!raw.is_empty()).then(|| raw.to_string());
        }
        Ok(self)
    }

    pub fn with_public_path(mut self, public_path: impl Into<String>) -> Self {
        self.public_path = public_path.into();
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// Value of the script node's `timeout` attribute, in whole seconds.
    pub fn script_timeout_attr(&self) -> u64 {
        self.chunk_timeout.as_secs()
    }
}

pub fn parse_timeout_ms(raw: &str) -> anyhow::Result<u64> {
    let ms: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("expected a positive integer of milliseconds, got {raw:?}"))?;
    if ms == 0 {
        anyhow::bail!("chunk timeout must be positive");
    }
    Ok(ms)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_the_script_loader() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.public_path, "");
        assert_eq!(cfg.charset, "utf-8");
        assert_eq!(cfg.chunk_timeout, Duration::from_secs(120));
        assert_eq!(cfg.script_timeout_attr(), 120);
        assert!(cfg.nonce.is_none());
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = RuntimeConfig::default()
            .with_env(env(&[
                (ENV_PUBLIC_PATH, "/static/"),
                (ENV_CHUNK_TIMEOUT_MS, "2500"),
                (ENV_SCRIPT_NONCE, "abc123"),
            ]))
            .unwrap();
        assert_eq!(cfg.public_path, "/static/");
        assert_eq!(cfg.chunk_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.nonce.as_deref(), Some("abc123"));
    }

    #[test]
    fn blank_nonce_clears_it() {
        let cfg = RuntimeConfig::default()
            .with_nonce("x")
            .with_env(env(&[(ENV_SCRIPT_NONCE, "  ")]))
            .unwrap();
        assert!(cfg.nonce.is_none());
    }

    #[test]
    fn bad_timeout_names_the_variable() {
        for raw in ["0", "-5", "soon"] {
            let err = RuntimeConfig::default()
                .with_env(env(&[(ENV_CHUNK_TIMEOUT_MS, raw)]))
                .unwrap_err();
            assert!(
                format!("{err:#}").contains(ENV_CHUNK_TIMEOUT_MS),
                "raw={raw:?} err={err:#}"
            );
        }
    }
}
