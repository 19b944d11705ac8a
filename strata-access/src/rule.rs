//! Allow/deny rules.

use serde::{Deserialize, Serialize};

use strata_core::ValidationError;

use crate::address::{Address, AddressFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Allow,
    Deny,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Allow => "allow",
            RuleKind::Deny => "deny",
        }
    }

    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        match text {
            "allow" => Ok(RuleKind::Allow),
            "deny" => Ok(RuleKind::Deny),
            other => Err(ValidationError::InvalidValue {
                field: "kind".to_string(),
                reason: format!("unknown rule kind {other:?}"),
            }),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, RuleKind::Allow)
    }
}

/// What a rule covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleTarget {
    /// One full address.
    Exact { components: Vec<u32> },
    /// Every address starting with `prefix` whose next component lies in
    /// `low..=high`.
    Range {
        prefix: Vec<u32>,
        low: u32,
        high: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub list: String,
    pub kind: RuleKind,
    pub target: RuleTarget,
    /// Epoch seconds; `None` never expires.
    pub expires_at: Option<i64>,
}

impl Rule {
    pub fn exact(list: impl Into<String>, kind: RuleKind, address: &Address) -> Self {
        Self {
            list: list.into(),
            kind,
            target: RuleTarget::Exact {
                components: address.components().to_vec(),
            },
            expires_at: None,
        }
    }

    pub fn range(
        list: impl Into<String>,
        kind: RuleKind,
        prefix: Vec<u32>,
        low: u32,
        high: u32,
    ) -> Self {
        Self {
            list: list.into(),
            kind,
            target: RuleTarget::Range { prefix, low, high },
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_exact(&self) -> bool {
        matches!(self.target, RuleTarget::Exact { .. })
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Width of the covered range; 0 for exact rules.
    pub fn span(&self) -> u32 {
        match &self.target {
            RuleTarget::Exact { .. } => 0,
            RuleTarget::Range { low, high, .. } => high - low,
        }
    }

    /// First covered value of the ranged component.
    pub fn start(&self) -> u32 {
        match &self.target {
            RuleTarget::Exact { components } => components.last().copied().unwrap_or(0),
            RuleTarget::Range { low, .. } => *low,
        }
    }

    /// Precedence level: 0 for exact rules, otherwise the number of
    /// components not fixed by the prefix. Lower is more specific.
    pub fn level(&self, format: &AddressFormat) -> usize {
        match &self.target {
            RuleTarget::Exact { .. } => 0,
            RuleTarget::Range { prefix, .. } => format.component_count.saturating_sub(prefix.len()),
        }
    }

    pub fn matches(&self, address: &Address) -> bool {
        match &self.target {
            RuleTarget::Exact { components } => components.as_slice() == address.components(),
            RuleTarget::Range { prefix, low, high } => {
                address.prefix(prefix.len()) == prefix.as_slice()
                    && address
                        .component(prefix.len())
                        .is_some_and(|c| *low <= c && c <= *high)
            }
        }
    }

    pub fn validate(&self, format: &AddressFormat) -> Result<(), ValidationError> {
        if self.list.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "list".to_string(),
            });
        }
        match &self.target {
            RuleTarget::Exact { components } => {
                if components.len() != format.component_count {
                    return Err(ValidationError::InvalidValue {
                        field: "address".to_string(),
                        reason: format!(
                            "exact rule needs {} components",
                            format.component_count
                        ),
                    });
                }
                components
                    .iter()
                    .try_for_each(|c| format.check_component(*c))
            }
            RuleTarget::Range { prefix, low, high } => {
                if prefix.len() >= format.component_count {
                    return Err(ValidationError::InvalidValue {
                        field: "prefix".to_string(),
                        reason: "range rule prefix must leave a component to range over"
                            .to_string(),
                    });
                }
                if low > high {
                    return Err(ValidationError::InvalidValue {
                        field: "range".to_string(),
                        reason: format!("{low} is above {high}"),
                    });
                }
                prefix
                    .iter()
                    .chain([low, high])
                    .try_for_each(|c| format.check_component(*c))
            }
        }
    }
}
