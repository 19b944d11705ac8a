//! Precedence resolution.
//!
//! Pure function of an address, a rule set and a clock. The most specific
//! level with an unexpired matching rule decides; within it the narrowest
//! span wins, then the lowest start, then deny over allow. Less specific
//! levels are never consulted once a level has a candidate.

use std::cmp::Ordering;

use crate::address::{Address, AddressFormat};
use crate::rule::{Rule, RuleKind};

/// Precedence level of `rule` under `format`. 0 is an exact match.
pub fn level_of(rule: &Rule, format: &AddressFormat) -> usize {
    rule.level(format)
}

/// Order two candidates of the same level; `Less` wins.
pub fn tie_break(a: &Rule, b: &Rule) -> Ordering {
    a.span()
        .cmp(&b.span())
        .then_with(|| a.start().cmp(&b.start()))
        .then_with(|| deny_first(a.kind).cmp(&deny_first(b.kind)))
}

fn deny_first(kind: RuleKind) -> u8 {
    match kind {
        RuleKind::Deny => 0,
        RuleKind::Allow => 1,
    }
}

/// The winning rule for `address`, or `None` when nothing unexpired matches.
pub fn resolve<'a>(
    address: &Address,
    rules: &'a [Rule],
    format: &AddressFormat,
    now: i64,
) -> Option<&'a Rule> {
    rules
        .iter()
        .filter(|rule| !rule.is_expired(now) && rule.matches(address))
        .min_by(|a, b| {
            level_of(a, format)
                .cmp(&level_of(b, format))
                .then_with(|| tie_break(a, b))
        })
}

/// Winner among rules already known to sit on one level.
pub fn best_of_level<'a>(address: &Address, rules: &'a [Rule], now: i64) -> Option<&'a Rule> {
    rules
        .iter()
        .filter(|rule| !rule.is_expired(now) && rule.matches(address))
        .min_by(|a, b| tie_break(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> AddressFormat {
        AddressFormat::ipv4()
    }

    fn addr(text: &str) -> Address {
        Address::parse(text, &format()).unwrap()
    }

    #[test]
    fn test_exact_beats_overlapping_range() {
        let rules = vec![
            Rule::range("l", RuleKind::Allow, vec![10, 0, 0], 0, 10),
            Rule::exact("l", RuleKind::Deny, &addr("10.0.0.5")),
        ];
        let winner = resolve(&addr("10.0.0.5"), &rules, &format(), 0).unwrap();
        assert!(winner.is_exact());
        assert_eq!(winner.kind, RuleKind::Deny);
    }

    #[test]
    fn test_smaller_span_wins() {
        let rules = vec![
            Rule::range("l", RuleKind::Allow, vec![10, 0, 0], 0, 10),
            Rule::range("l", RuleKind::Deny, vec![10, 0, 0], 3, 8),
        ];
        let winner = resolve(&addr("10.0.0.5"), &rules, &format(), 0).unwrap();
        assert_eq!(winner.span(), 5);
        assert_eq!(winner.kind, RuleKind::Deny);
    }

    #[test]
    fn test_equal_span_lower_start_wins() {
        let rules = vec![
            Rule::range("l", RuleKind::Deny, vec![10, 0, 0], 20, 30),
            Rule::range("l", RuleKind::Allow, vec![10, 0, 0], 10, 30),
            Rule::range("l", RuleKind::Allow, vec![10, 0, 0], 10, 20),
        ];
        let winner = resolve(&addr("10.0.0.20"), &rules, &format(), 0).unwrap();
        assert_eq!(winner.start(), 10);
        assert_eq!(winner.span(), 10);
    }

    #[test]
    fn test_more_specific_level_wins_over_narrower_span() {
        let rules = vec![
            Rule::range("l", RuleKind::Allow, vec![10, 0, 0], 0, 255),
            Rule::range("l", RuleKind::Deny, vec![10, 0], 0, 0),
        ];
        let winner = resolve(&addr("10.0.0.5"), &rules, &format(), 0).unwrap();
        assert_eq!(winner.kind, RuleKind::Allow);
        assert_eq!(level_of(winner, &format()), 1);
    }

    #[test]
    fn test_expired_rules_ignored() {
        let rules = vec![
            Rule::exact("l", RuleKind::Deny, &addr("10.0.0.5")).with_expiry(50),
            Rule::range("l", RuleKind::Allow, vec![10, 0], 0, 255),
        ];
        let winner = resolve(&addr("10.0.0.5"), &rules, &format(), 100).unwrap();
        assert_eq!(winner.kind, RuleKind::Allow);
        let winner = resolve(&addr("10.0.0.5"), &rules, &format(), 10).unwrap();
        assert_eq!(winner.kind, RuleKind::Deny);
    }

    #[test]
    fn test_no_match() {
        let rules = vec![Rule::range("l", RuleKind::Deny, vec![192, 168], 0, 255)];
        assert!(resolve(&addr("10.0.0.5"), &rules, &format(), 0).is_none());
    }

    #[test]
    fn test_exact_tie_prefers_deny() {
        let rules = vec![
            Rule::range("l", RuleKind::Allow, vec![10, 0, 0], 5, 5),
            Rule::range("l", RuleKind::Deny, vec![10, 0, 0], 5, 5),
        ];
        let winner = resolve(&addr("10.0.0.5"), &rules, &format(), 0).unwrap();
        assert_eq!(winner.kind, RuleKind::Deny);
    }
}
