//! Gray release match rules
//!
//! A gray rule is a list of client-label predicates. A client hits the rule
//! only if every predicate is satisfied by a value present in its label set.
//! Supported matchers:
//! - Exact / NotEquals: string comparison
//! - Regex: full regular expression match
//! - In / NotIn: comma separated value lists
//! - Range: IPv4 CIDR ranges

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::net::IpAddr;

use vesta_common::VestaError;
use vesta_persistence::{ClientLabel, MatchType};

/// Well-known client label keys
pub mod labels {
    pub const CLIENT_IP: &str = "CLIENT_IP";
    pub const CLIENT_ID: &str = "CLIENT_ID";
    pub const REGION: &str = "REGION";
    pub const ZONE: &str = "ZONE";
    pub const CAMPUS: &str = "CAMPUS";
}

/// Single label predicate of a gray rule
pub trait LabelPredicate: Send + Sync + Debug {
    /// Label key the predicate reads
    fn key(&self) -> &str;

    /// Check the client's value for `key`
    fn matches(&self, value: &str) -> bool;
}

#[derive(Debug)]
struct ExactPredicate {
    key: String,
    value: String,
}

impl LabelPredicate for ExactPredicate {
    fn key(&self) -> &str {
        &self.key
    }

    fn matches(&self, value: &str) -> bool {
        self.value == value
    }
}

#[derive(Debug)]
struct NotEqualsPredicate {
    key: String,
    value: String,
}

impl LabelPredicate for NotEqualsPredicate {
    fn key(&self) -> &str {
        &self.key
    }

    fn matches(&self, value: &str) -> bool {
        self.value != value
    }
}

#[derive(Debug)]
struct RegexPredicate {
    key: String,
    regex: regex::Regex,
}

impl LabelPredicate for RegexPredicate {
    fn key(&self) -> &str {
        &self.key
    }

    fn matches(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

#[derive(Debug)]
struct InPredicate {
    key: String,
    values: HashSet<String>,
    negate: bool,
}

impl LabelPredicate for InPredicate {
    fn key(&self) -> &str {
        &self.key
    }

    fn matches(&self, value: &str) -> bool {
        self.values.contains(value) != self.negate
    }
}

#[derive(Clone, Debug)]
struct IpRange {
    network: u32,
    mask: u32,
}

#[derive(Debug)]
struct IpRangePredicate {
    key: String,
    ranges: Vec<IpRange>,
}

impl IpRangePredicate {
    fn parse_cidr(cidr: &str) -> Option<IpRange> {
        let parts: Vec<&str> = cidr.split('/').collect();
        if parts.is_empty() || parts.len() > 2 {
            return None;
        }

        let ip: IpAddr = parts[0].parse().ok()?;
        let prefix_len: u8 = if parts.len() == 2 {
            parts[1].parse().ok()?
        } else {
            32
        };

        if prefix_len > 32 {
            return None;
        }

        match ip {
            IpAddr::V4(ipv4) => {
                let mask = if prefix_len == 0 {
                    0
                } else {
                    !0u32 << (32 - prefix_len)
                };
                Some(IpRange {
                    network: u32::from(ipv4) & mask,
                    mask,
                })
            }
            // IPv6 ranges are not supported
            IpAddr::V6(_) => None,
        }
    }

    fn new(key: &str, expr: &str) -> Option<Self> {
        let ranges = split_values(expr)
            .map(Self::parse_cidr)
            .collect::<Option<Vec<_>>>()?;
        if ranges.is_empty() {
            return None;
        }
        Some(Self {
            key: key.to_string(),
            ranges,
        })
    }
}

impl LabelPredicate for IpRangePredicate {
    fn key(&self) -> &str {
        &self.key
    }

    fn matches(&self, value: &str) -> bool {
        match value.parse::<IpAddr>() {
            Ok(IpAddr::V4(ipv4)) => {
                let ip = u32::from(ipv4);
                self.ranges.iter().any(|r| (ip & r.mask) == r.network)
            }
            _ => false,
        }
    }
}

fn split_values(expr: &str) -> impl Iterator<Item = &str> {
    expr.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn invalid(label: &ClientLabel, reason: &str) -> VestaError {
    VestaError::InvalidMatchRule(format!("label '{}': {}", label.key, reason))
}

/// Build the predicate for one client label
pub fn create_predicate(label: &ClientLabel) -> Result<Box<dyn LabelPredicate>, VestaError> {
    let key = label.key.trim();
    if key.is_empty() {
        return Err(invalid(label, "empty label key"));
    }
    let value = label.value.value.trim();
    if value.is_empty() {
        return Err(invalid(label, "empty match value"));
    }

    let predicate: Box<dyn LabelPredicate> = match label.value.match_type {
        MatchType::Exact => Box::new(ExactPredicate {
            key: key.to_string(),
            value: value.to_string(),
        }),
        MatchType::NotEquals => Box::new(NotEqualsPredicate {
            key: key.to_string(),
            value: value.to_string(),
        }),
        MatchType::Regex => {
            let regex = regex::Regex::new(&format!("^(?:{})$", value))
                .map_err(|e| invalid(label, &format!("bad regex: {}", e)))?;
            Box::new(RegexPredicate {
                key: key.to_string(),
                regex,
            })
        }
        MatchType::In | MatchType::NotIn => Box::new(InPredicate {
            key: key.to_string(),
            values: split_values(value).map(str::to_string).collect(),
            negate: label.value.match_type == MatchType::NotIn,
        }),
        MatchType::Range => Box::new(
            IpRangePredicate::new(key, value)
                .ok_or_else(|| invalid(label, "malformed CIDR range"))?,
        ),
    };
    Ok(predicate)
}

/// Compiled gray rule: all predicates must match
#[derive(Debug, Default)]
pub struct GrayMatchRule {
    predicates: Vec<Box<dyn LabelPredicate>>,
}

impl GrayMatchRule {
    /// Compile a rule from its label list
    pub fn compile(labels: &[ClientLabel]) -> Result<Self, VestaError> {
        let predicates = labels
            .iter()
            .map(create_predicate)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { predicates })
    }

    /// Compile a rule persisted as a JSON label list
    pub fn from_json(json: &str) -> Result<Self, VestaError> {
        Self::compile(&parse_beta_labels(json)?)
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// An empty rule never matches
    pub fn matches(&self, client_labels: &HashMap<String, String>) -> bool {
        !self.predicates.is_empty()
            && self.predicates.iter().all(|p| {
                client_labels
                    .get(p.key())
                    .is_some_and(|value| p.matches(value))
            })
    }
}

/// Reject a gray label set that is empty or carries a malformed predicate
pub fn validate_beta_labels(labels: &[ClientLabel]) -> Result<(), VestaError> {
    if labels.is_empty() {
        return Err(VestaError::InvalidMatchRule(
            "gray release requires at least one beta label".to_string(),
        ));
    }
    GrayMatchRule::compile(labels).map(|_| ())
}

/// Serialize beta labels into a gray resource match rule
pub fn serialize_beta_labels(labels: &[ClientLabel]) -> Result<String, VestaError> {
    serde_json::to_string(labels)
        .map_err(|e| VestaError::InvalidMatchRule(format!("serialize beta labels: {}", e)))
}

pub fn parse_beta_labels(json: &str) -> Result<Vec<ClientLabel>, VestaError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json)
        .map_err(|e| VestaError::InvalidMatchRule(format!("parse beta labels: {}", e)))
}

#[cfg(test)]
mod tests {
    use vesta_persistence::MatchString;

    use super::*;

    fn label(key: &str, match_type: MatchType, value: &str) -> ClientLabel {
        ClientLabel {
            key: key.to_string(),
            value: MatchString {
                match_type,
                value: value.to_string(),
            },
        }
    }

    fn client(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_exact_rule() {
        let rule = GrayMatchRule::compile(&[ClientLabel::exact(labels::CLIENT_IP, "1.1.1.1")])
            .unwrap();
        assert!(rule.matches(&client(&[(labels::CLIENT_IP, "1.1.1.1")])));
        assert!(!rule.matches(&client(&[(labels::CLIENT_IP, "1.1.1.2")])));
        assert!(!rule.matches(&client(&[])));
    }

    #[test]
    fn test_all_predicates_must_match() {
        let rule = GrayMatchRule::compile(&[
            ClientLabel::exact(labels::REGION, "east"),
            label(labels::ZONE, MatchType::In, "z1, z2"),
        ])
        .unwrap();
        assert!(rule.matches(&client(&[(labels::REGION, "east"), (labels::ZONE, "z2")])));
        assert!(!rule.matches(&client(&[(labels::REGION, "east"), (labels::ZONE, "z3")])));
        assert!(!rule.matches(&client(&[(labels::REGION, "east")])));
    }

    #[test]
    fn test_empty_rule_never_matches() {
        let rule = GrayMatchRule::compile(&[]).unwrap();
        assert!(rule.is_empty());
        assert!(!rule.matches(&client(&[(labels::CLIENT_IP, "1.1.1.1")])));
    }

    #[test]
    fn test_not_equals_and_not_in() {
        let rule = GrayMatchRule::compile(&[
            label(labels::CAMPUS, MatchType::NotEquals, "hq"),
            label(labels::CLIENT_ID, MatchType::NotIn, "a,b"),
        ])
        .unwrap();
        assert!(rule.matches(&client(&[(labels::CAMPUS, "lab"), (labels::CLIENT_ID, "c")])));
        assert!(!rule.matches(&client(&[(labels::CAMPUS, "hq"), (labels::CLIENT_ID, "c")])));
        assert!(!rule.matches(&client(&[(labels::CAMPUS, "lab"), (labels::CLIENT_ID, "a")])));
    }

    #[test]
    fn test_regex_is_anchored() {
        let rule = GrayMatchRule::compile(&[label("app", MatchType::Regex, "order-.*")]).unwrap();
        assert!(rule.matches(&client(&[("app", "order-svc")])));
        assert!(!rule.matches(&client(&[("app", "x-order-svc")])));
    }

    #[test]
    fn test_ip_range_rule() {
        let rule = GrayMatchRule::compile(&[label(
            labels::CLIENT_IP,
            MatchType::Range,
            "192.168.1.0/24, 10.0.0.0/8",
        )])
        .unwrap();
        assert!(rule.matches(&client(&[(labels::CLIENT_IP, "192.168.1.100")])));
        assert!(rule.matches(&client(&[(labels::CLIENT_IP, "10.1.2.3")])));
        assert!(!rule.matches(&client(&[(labels::CLIENT_IP, "172.16.0.1")])));
        assert!(!rule.matches(&client(&[(labels::CLIENT_IP, "not-an-ip")])));
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(validate_beta_labels(&[]).is_err());
        assert!(validate_beta_labels(&[ClientLabel::exact("", "x")]).is_err());
        assert!(validate_beta_labels(&[ClientLabel::exact("k", " ")]).is_err());
        assert!(validate_beta_labels(&[label("k", MatchType::Regex, "(")]).is_err());
        assert!(validate_beta_labels(&[label("k", MatchType::Range, "10.0.0.0/33")]).is_err());
        assert!(matches!(
            validate_beta_labels(&[label("k", MatchType::Range, "::1/128")]),
            Err(VestaError::InvalidMatchRule(_))
        ));
    }

    #[test]
    fn test_json_roundtrip_through_rule() {
        let json =
            serialize_beta_labels(&[ClientLabel::exact(labels::CLIENT_IP, "1.1.1.1")]).unwrap();
        let rule = GrayMatchRule::from_json(&json).unwrap();
        assert!(rule.matches(&client(&[(labels::CLIENT_IP, "1.1.1.1")])));

        assert!(GrayMatchRule::from_json("").unwrap().is_empty());
        assert!(GrayMatchRule::from_json("{not json").is_err());
    }
}
