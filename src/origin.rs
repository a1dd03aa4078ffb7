//! Origin allow-list for the websocket handshake.

/// Prefixes accepted by default: loopback over http and https, plus local files.
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 3] = ["http://localhost:", "https://localhost:", "file://"];

/// Decides whether a websocket client's declared origin is acceptable.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    prefixes: Vec<String>,
}

impl OriginPolicy {
    /// The default allow-list extended with `extra` prefixes.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut policy = Self::default();
        policy.prefixes.extend(extra.into_iter().map(Into::into));
        policy
    }

    /// Accept `origin` if it starts with any allowed prefix.
    pub fn accept(&self, origin: &str) -> bool {
        self.prefixes.iter().any(|prefix| origin.starts_with(prefix.as_str()))
    }
}

impl Default for OriginPolicy {
    fn default() -> Self {
        Self {
            prefixes: DEFAULT_ALLOWED_ORIGINS.iter().map(|p| p.to_string()).collect(),
        }
    }
}
