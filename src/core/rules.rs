//! Domain and protocol block rules
//!
//! Consulted once per resolved destination of an admitted flow. Rules are
//! ordered; the first match rejects.

use regex::Regex;

use crate::error::{LimiterError, Result};

/// Compiled block rules of one node
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    domains: Vec<Regex>,
    protocols: Vec<String>,
}

impl RuleSet {
    /// Compile domain patterns and collect protocol names
    pub fn new<D, P>(domains: D, protocols: P) -> Result<Self>
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        let domains = domains
            .into_iter()
            .map(|pattern| {
                Regex::new(pattern.as_ref()).map_err(|e| {
                    LimiterError::Rule(format!("invalid domain rule '{}': {}", pattern.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            domains,
            protocols: protocols.into_iter().map(Into::into).collect(),
        })
    }

    /// Returns true if the destination matches a domain rule
    pub fn check_domain(&self, destination: &str) -> bool {
        self.domains.iter().any(|re| re.is_match(destination))
    }

    /// Returns true if the protocol is blocked
    pub fn check_protocol(&self, protocol: &str) -> bool {
        self.protocols.iter().any(|p| p == protocol)
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.protocols.is_empty()
    }

    pub fn domain_rule_count(&self) -> usize {
        self.domains.len()
    }

    pub fn protocol_rule_count(&self) -> usize {
        self.protocols.len()
    }
}
