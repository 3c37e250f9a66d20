use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identifier for a policy rule across the whole datapath.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl RuleId {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.0.is_empty() {
            return Err("rule ID must not be empty");
        }
        Ok(())
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of the policy object referencing a rule, `namespace/name[/type]`.
///
/// The by-policy store index keys on the `namespace/name` prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleReference(pub String);

impl RuleReference {
    /// The `namespace/name` prefix used as store index key.
    /// Returns `None` when the reference has fewer than two segments.
    pub fn policy_key(&self) -> Option<String> {
        let mut parts = self.0.split('/').filter(|p| !p.is_empty());
        let ns = parts.next()?;
        let name = parts.next()?;
        Some(format!("{ns}/{name}"))
    }

    /// Split into (namespace, name, type). Missing segments are empty.
    pub fn segments(&self) -> (String, String, String) {
        let mut parts = self.0.split('/').filter(|p| !p.is_empty());
        let ns = parts.next().unwrap_or_default().to_string();
        let name = parts.next().unwrap_or_default().to_string();
        let kind = parts.next().unwrap_or_default().to_string();
        (ns, name, kind)
    }
}

impl fmt::Display for RuleReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RuleReference {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Any,
    Other(u8),
}

impl Protocol {
    /// Convert to the IP protocol number carried in flow matches.
    /// Returns 0 for Any (wildcard).
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
            Self::Any => 0,
            Self::Other(n) => n,
        }
    }

    pub fn from_u8(n: u8) -> Self {
        match n {
            0 => Self::Any,
            1 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            other => Self::Other(other),
        }
    }

    /// Whether the protocol carries L4 ports the compiler may match on.
    pub fn has_ports(self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

/// Rule action. The wire literals `"allow"` and `"deny"` are fixed for
/// interop with the management plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

impl RuleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl FromStr for RuleAction {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            _ => Err("action must be \"allow\" or \"deny\""),
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enforcement mode for a compiled rule.
///
/// - `Work`: the declared action is enforced.
/// - `Monitor`: the flow logs and allows; the declared action is reported
///   but not enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    #[default]
    Work,
    Monitor,
}

impl EnforcementMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::Monitor => "monitor",
        }
    }
}

impl FromStr for EnforcementMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "work" => Ok(Self::Work),
            "monitor" => Ok(Self::Monitor),
            _ => Err("mode must be \"work\" or \"monitor\""),
        }
    }
}

impl fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic direction a rule applies to, relative to the protected endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Egress,
    Ingress,
}

impl Direction {
    /// Wire value: egress=0, ingress=1.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Egress => 0,
            Self::Ingress => 1,
        }
    }

    pub fn from_u8(n: u8) -> Self {
        if n == 1 { Self::Ingress } else { Self::Egress }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Egress => f.write_str("egress"),
            Self::Ingress => f.write_str("ingress"),
        }
    }
}

/// Coarse-grained precedence class. The numeric rank doubles as the
/// policy-bridge table the rule's flow is installed in.
///
/// Tier3 (rank 150) numerically outranks Tier2 (rank 100); the ranks are
/// a wire contract and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyTier {
    Tier0,
    Tier1,
    Tier2,
    TierEcp,
    Tier3,
}

impl PolicyTier {
    /// Policy-bridge table rank. Tier0 shares the lowest rank with Tier1.
    pub fn rank(self) -> u8 {
        match self {
            Self::Tier0 | Self::Tier1 => 50,
            Self::Tier2 => 100,
            Self::TierEcp => 130,
            Self::Tier3 => 150,
        }
    }
}

impl fmt::Display for PolicyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tier0 => f.write_str("tier0"),
            Self::Tier1 => f.write_str("tier1"),
            Self::Tier2 => f.write_str("tier2"),
            Self::TierEcp => f.write_str("tier-ecp"),
            Self::Tier3 => f.write_str("tier3"),
        }
    }
}

/// A MAC address in its canonical 6-byte form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
}

impl FromStr for MacAddr {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut count = 0;
        for (i, part) in s.split(':').enumerate() {
            if i >= 6 {
                return Err("MAC address has more than 6 octets");
            }
            out[i] = u8::from_str_radix(part, 16).map_err(|_| "invalid MAC octet")?;
            count += 1;
        }
        if count != 6 {
            return Err("MAC address must have 6 octets");
        }
        Ok(Self(out))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}
