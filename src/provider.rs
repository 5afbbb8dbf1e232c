//! Known providers and their per-provider naming
//!
//! Each provider gets its own daemon, state file, wire prefix and session
//! file name. Unknown provider names are accepted and get derived names.

/// Static description of a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    /// Provider name as typed on the command line (`codex`, `gemini`, ...)
    pub name: String,
    /// Prefix of the wire `type` field (`<prefix>.request`)
    pub prefix: String,
    /// Session file name expected in a bound working directory
    pub session_filename: String,
}

const KNOWN: &[(&str, &str)] = &[
    ("codex", "cask"),
    ("gemini", "gask"),
    ("claude", "lask"),
    ("opencode", "oask"),
];

impl ProviderSpec {
    /// Look up (or derive) the spec for a provider name
    pub fn for_name(name: &str) -> Self {
        let name = name.trim().to_lowercase();
        let prefix = KNOWN
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, prefix)| prefix.to_string())
            .unwrap_or_else(|| format!("{}ask", name));
        Self {
            session_filename: format!(".{}-session", name),
            prefix,
            name,
        }
    }

    /// Names of the providers with built-in defaults
    pub fn known_names() -> Vec<&'static str> {
        KNOWN.iter().map(|(name, _)| *name).collect()
    }

    pub fn request_type(&self) -> String {
        format!("{}.request", self.prefix)
    }

    pub fn response_type(&self) -> String {
        format!("{}.response", self.prefix)
    }

    pub fn ping_type(&self) -> String {
        format!("{}.ping", self.prefix)
    }

    pub fn pong_type(&self) -> String {
        format!("{}.pong", self.prefix)
    }

    pub fn shutdown_type(&self) -> String {
        format!("{}.shutdown", self.prefix)
    }

    /// Upper-case token used in per-provider environment keys
    pub fn env_key(&self) -> String {
        self.name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_provider() {
        let spec = ProviderSpec::for_name("Codex");
        assert_eq!(spec.name, "codex");
        assert_eq!(spec.prefix, "cask");
        assert_eq!(spec.session_filename, ".codex-session");
        assert_eq!(spec.request_type(), "cask.request");
    }

    #[test]
    fn test_unknown_provider_gets_derived_names() {
        let spec = ProviderSpec::for_name("my-agent");
        assert_eq!(spec.prefix, "my-agentask");
        assert_eq!(spec.env_key(), "MY_AGENT");
    }
}
