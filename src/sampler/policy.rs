//! Interface eligibility.

use std::fmt;

use super::source::InterfaceInfo;

/// One denylist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyRule {
    /// `veth*` matches names starting with `veth`
    Prefix(String),
    /// `=lo` matches the name `lo` only
    Exact(String),
    /// Anything else matches when it occurs in the name or the description
    Contains(String),
}

impl DenyRule {
    pub fn parse(rule: &str) -> Option<Self> {
        let rule = rule.trim();
        if let Some(exact) = rule.strip_prefix('=') {
            return (!exact.is_empty()).then(|| DenyRule::Exact(exact.to_string()));
        }
        if let Some(prefix) = rule.strip_suffix('*') {
            return (!prefix.is_empty()).then(|| DenyRule::Prefix(prefix.to_string()));
        }
        (!rule.is_empty()).then(|| DenyRule::Contains(rule.to_string()))
    }

    pub fn matches(&self, info: &InterfaceInfo) -> bool {
        match self {
            DenyRule::Prefix(p) => info.name.starts_with(p.as_str()),
            DenyRule::Exact(name) => info.name == name.as_str(),
            DenyRule::Contains(needle) => {
                info.name.contains(needle.as_str())
                    || info
                        .description
                        .as_deref()
                        .map(|d| d.contains(needle.as_str()))
                        .unwrap_or(false)
            }
        }
    }
}

impl fmt::Display for DenyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyRule::Prefix(p) => write!(f, "{p}*"),
            DenyRule::Exact(n) => write!(f, "={n}"),
            DenyRule::Contains(s) => f.write_str(s),
        }
    }
}

/// Why an interface was or wasn't sampled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Loopback,
    Down,
    Denied(String),
}

impl Eligibility {
    #[inline]
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eligibility::Eligible => f.write_str("sampled"),
            Eligibility::Loopback => f.write_str("loopback"),
            Eligibility::Down => f.write_str("down"),
            Eligibility::Denied(rule) => write!(f, "denied by '{rule}'"),
        }
    }
}

/// Loopback and down interfaces are never sampled; the denylist comes from
/// configuration.
#[derive(Debug, Clone)]
pub struct InterfacePolicy {
    rules: Vec<DenyRule>,
    require_up: bool,
}

impl InterfacePolicy {
    pub fn new<S: AsRef<str>>(denylist: &[S], require_up: bool) -> Self {
        Self {
            rules: denylist
                .iter()
                .filter_map(|r| DenyRule::parse(r.as_ref()))
                .collect(),
            require_up,
        }
    }

    pub fn evaluate(&self, info: &InterfaceInfo) -> Eligibility {
        if info.is_loopback {
            return Eligibility::Loopback;
        }
        if self.require_up && !info.is_up {
            return Eligibility::Down;
        }
        match self.rules.iter().find(|rule| rule.matches(info)) {
            Some(rule) => Eligibility::Denied(rule.to_string()),
            None => Eligibility::Eligible,
        }
    }

    pub fn rules(&self) -> &[DenyRule] {
        &self.rules
    }
}
