use crate::error::{AskError, Result};
use std::sync::Mutex;
use tracing::debug;

/// Environment variable carrying the chain into spawned agent processes
pub const CHAIN_ENV: &str = "ASK_DELEGATION_CHAIN";

/// `chain` with `agent` appended, unless it is already the innermost entry
pub fn extend_chain(chain: &[String], agent: &str) -> Vec<String> {
    let agent = agent.trim().to_lowercase();
    let mut extended: Vec<String> = chain.to_vec();
    if !agent.is_empty() && extended.last() != Some(&agent) {
        extended.push(agent);
    }
    extended
}

/// Tracks which agents are currently delegating to one another.
///
/// Entering an agent that is already on the stack fails with
/// [`AskError::CircularDelegation`] before anything runs.
#[derive(Debug, Default)]
pub struct DelegationGuard {
    stack: Mutex<Vec<String>>,
}

impl DelegationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the stack with callers further up the chain (outermost first)
    pub fn with_chain<I, S>(chain: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stack: Mutex::new(
                chain
                    .into_iter()
                    .map(|s| s.into().trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
        }
    }

    /// Push `agent` for the lifetime of the returned scope
    pub fn enter(&self, agent: &str) -> Result<DelegationScope<'_>> {
        let agent = agent.trim().to_lowercase();
        let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
        if stack.contains(&agent) {
            let mut chain = stack.clone();
            chain.push(agent);
            return Err(AskError::CircularDelegation { chain });
        }
        stack.push(agent.clone());
        debug!(agent = %agent, depth = stack.len(), "entered delegation scope");
        Ok(DelegationScope { guard: self, agent })
    }

    /// Current chain, outermost first
    pub fn chain(&self) -> Vec<String> {
        self.stack.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Pops its agent from the guard when dropped
#[derive(Debug)]
pub struct DelegationScope<'a> {
    guard: &'a DelegationGuard,
    agent: String,
}

impl DelegationScope<'_> {
    pub fn agent(&self) -> &str {
        &self.agent
    }
}

impl Drop for DelegationScope<'_> {
    fn drop(&mut self) {
        let mut stack = self.guard.stack.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = stack.iter().rposition(|a| *a == self.agent) {
            stack.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_chain() {
        let chain = vec!["gemini".to_string()];
        assert_eq!(extend_chain(&chain, "Codex"), vec!["gemini", "codex"]);
        assert_eq!(extend_chain(&chain, "gemini"), vec!["gemini"]);
        assert_eq!(extend_chain(&[], "codex"), vec!["codex"]);
    }

    #[test]
    fn test_reentry_fails_fast() {
        let guard = DelegationGuard::new();
        let _a = guard.enter("claude").unwrap();
        let _b = guard.enter("codex").unwrap();
        match guard.enter("claude").unwrap_err() {
            AskError::CircularDelegation { chain } => {
                assert_eq!(chain, vec!["claude", "codex", "claude"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_scope_pops_on_drop() {
        let guard = DelegationGuard::new();
        {
            let _a = guard.enter("gemini").unwrap();
            assert_eq!(guard.chain(), vec!["gemini"]);
        }
        assert!(guard.chain().is_empty());
        assert!(guard.enter("gemini").is_ok());
    }

    #[test]
    fn test_seeded_chain_is_respected() {
        let guard = DelegationGuard::with_chain(["Claude", " "]);
        assert_eq!(guard.chain(), vec!["claude"]);
        assert!(guard.enter("claude").is_err());
        assert!(guard.enter("codex").is_ok());
    }
}
