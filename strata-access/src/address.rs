//! Dotted addresses split into bounded numeric components.

use serde::{Deserialize, Serialize};
use std::fmt;

use strata_core::{AccessSettings, ValidationError};

/// Shape of an address: separator, component count, component bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressFormat {
    pub separator: char,
    pub component_count: usize,
    /// Inclusive upper bound of every component.
    pub component_max: u32,
}

impl AddressFormat {
    /// Four `.`-separated components in `0..=255`.
    pub fn ipv4() -> Self {
        Self {
            separator: '.',
            component_count: 4,
            component_max: 255,
        }
    }

    /// Parse up to `component_count - 1` leading components. The empty
    /// string is the empty prefix.
    pub fn parse_prefix(&self, text: &str) -> Result<Vec<u32>, ValidationError> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let components = self.parse_components(text)?;
        if components.len() >= self.component_count {
            return Err(ValidationError::InvalidValue {
                field: "prefix".to_string(),
                reason: format!(
                    "prefix has {} components, at most {} allowed",
                    components.len(),
                    self.component_count - 1
                ),
            });
        }
        Ok(components)
    }

    /// Render components with the separator.
    pub fn join(&self, components: &[u32]) -> String {
        let separator = self.separator.to_string();
        components
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(&separator)
    }

    pub fn check_component(&self, value: u32) -> Result<(), ValidationError> {
        if value > self.component_max {
            return Err(ValidationError::InvalidValue {
                field: "component".to_string(),
                reason: format!("{value} exceeds {}", self.component_max),
            });
        }
        Ok(())
    }

    fn parse_components(&self, text: &str) -> Result<Vec<u32>, ValidationError> {
        text.split(self.separator)
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ValidationError::InvalidValue {
                        field: "address".to_string(),
                        reason: format!("component {part:?} of {text:?} is not a number"),
                    });
                }
                let value: u32 = part.parse().map_err(|_| ValidationError::InvalidValue {
                    field: "address".to_string(),
                    reason: format!("component {part:?} is out of range"),
                })?;
                self.check_component(value)?;
                Ok(value)
            })
            .collect()
    }
}

impl Default for AddressFormat {
    fn default() -> Self {
        Self::ipv4()
    }
}

impl From<&AccessSettings> for AddressFormat {
    fn from(settings: &AccessSettings) -> Self {
        Self {
            separator: settings.component_separator,
            component_count: settings.component_count,
            component_max: settings.component_max,
        }
    }
}

/// A fully specified address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    components: Vec<u32>,
    text: String,
}

impl Address {
    pub fn parse(text: &str, format: &AddressFormat) -> Result<Self, ValidationError> {
        let trimmed = text.trim();
        let components = format.parse_components(trimmed)?;
        if components.len() != format.component_count {
            return Err(ValidationError::InvalidValue {
                field: "address".to_string(),
                reason: format!(
                    "{trimmed:?} has {} components, expected {}",
                    components.len(),
                    format.component_count
                ),
            });
        }
        Ok(Self {
            text: format.join(&components),
            components,
        })
    }

    pub fn components(&self) -> &[u32] {
        &self.components
    }

    pub fn component(&self, index: usize) -> Option<u32> {
        self.components.get(index).copied()
    }

    /// The first `len` components.
    pub fn prefix(&self, len: usize) -> &[u32] {
        &self.components[..len.min(self.components.len())]
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let address = Address::parse("10.0.0.5", &AddressFormat::ipv4()).unwrap();
        assert_eq!(address.components(), &[10, 0, 0, 5]);
        assert_eq!(address.prefix(2), &[10, 0]);
        assert_eq!(address.to_string(), "10.0.0.5");
    }

    #[test]
    fn test_parse_normalizes_leading_zeros() {
        let address = Address::parse(" 010.0.0.005 ", &AddressFormat::ipv4()).unwrap();
        assert_eq!(address.as_str(), "10.0.0.5");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        let format = AddressFormat::ipv4();
        for bad in ["10.0.0", "10.0.0.256", "10..0.1", "a.b.c.d", "10.0.0.-1", "1.2.3.4.5"] {
            assert!(Address::parse(bad, &format).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_parse_prefix() {
        let format = AddressFormat::ipv4();
        assert_eq!(format.parse_prefix("").unwrap(), Vec::<u32>::new());
        assert_eq!(format.parse_prefix("10.0").unwrap(), vec![10, 0]);
        assert!(format.parse_prefix("10.0.0.1").is_err());
    }

    #[test]
    fn test_custom_format() {
        let format = AddressFormat::from(&AccessSettings {
            component_separator: ':',
            component_count: 2,
            component_max: 9,
        });
        assert!(Address::parse("3:9", &format).is_ok());
        assert!(Address::parse("3:10", &format).is_err());
    }
}
