//! Region resolution
//!
//! PingOne runs isolated deployments per geography. Each deployment has its
//! own authorization and management API hosts. Users and older configuration
//! files refer to regions by code, display name or a handful of legacy
//! spellings; all of them resolve here to a canonical [`RegionCode`].
//!
//! Resolution is deliberately lenient: anything unrecognized becomes
//! [`RegionCode::NA`] with a warning, and nothing in this module fails.

use std::{convert::Infallible, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Canonical two-letter code for a PingOne deployment region
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RegionCode {
    /// North America
    #[default]
    NA,
    /// Europe
    EU,
    /// Canada
    CA,
    /// Asia Pacific
    AP,
    /// Australia
    AU,
    /// Singapore
    SG,
}

/// Which network host of a region is wanted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainKind {
    /// The authorization server host, which issues tokens
    Auth,
    /// The management API host
    Api,
}

/// A static description of one region
#[derive(Debug)]
pub struct RegionEntry {
    /// The canonical code
    pub code: RegionCode,
    /// Human-readable name
    pub display_name: &'static str,
    /// Authorization server host
    pub auth_domain: &'static str,
    /// Management API host
    pub api_domain: &'static str,
    /// Other spellings accepted for this region
    pub aliases: &'static [&'static str],
}

/// Every known region, North America first
pub static REGIONS: [RegionEntry; 6] = [
    RegionEntry {
        code: RegionCode::NA,
        display_name: "North America",
        auth_domain: "auth.pingone.com",
        api_domain: "api.pingone.com",
        aliases: &["NorthAmerica", "US", "com", "north_america"],
    },
    RegionEntry {
        code: RegionCode::EU,
        display_name: "Europe",
        auth_domain: "auth.pingone.eu",
        api_domain: "api.pingone.eu",
        aliases: &["Europe", "eu"],
    },
    RegionEntry {
        code: RegionCode::CA,
        display_name: "Canada",
        auth_domain: "auth.pingone.ca",
        api_domain: "api.pingone.ca",
        aliases: &["Canada", "ca"],
    },
    RegionEntry {
        code: RegionCode::AP,
        display_name: "Asia Pacific",
        auth_domain: "auth.pingone.asia",
        api_domain: "api.pingone.asia",
        aliases: &["AsiaPacific", "Asia", "APAC"],
    },
    RegionEntry {
        code: RegionCode::AU,
        display_name: "Australia",
        auth_domain: "auth.pingone.com.au",
        api_domain: "api.pingone.com.au",
        aliases: &["Australia", "com.au"],
    },
    RegionEntry {
        code: RegionCode::SG,
        display_name: "Singapore",
        auth_domain: "auth.pingone.sg",
        api_domain: "api.pingone.sg",
        aliases: &["Singapore", "sg"],
    },
];

/// Letters only, lower-cased
fn normalize(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_alphabetic())
        .flat_map(char::to_lowercase)
        .collect()
}

impl RegionEntry {
    fn matches(&self, normalized: &str) -> bool {
        normalize(self.code.as_str()) == normalized
            || normalize(self.display_name) == normalized
            || self.aliases.iter().any(|a| normalize(a) == normalized)
    }

    /// The host of the requested kind
    pub fn domain(&self, kind: DomainKind) -> &'static str {
        match kind {
            DomainKind::Auth => self.auth_domain,
            DomainKind::Api => self.api_domain,
        }
    }
}

impl RegionCode {
    /// The canonical two-letter code
    pub const fn as_str(self) -> &'static str {
        match self {
            RegionCode::NA => "NA",
            RegionCode::EU => "EU",
            RegionCode::CA => "CA",
            RegionCode::AP => "AP",
            RegionCode::AU => "AU",
            RegionCode::SG => "SG",
        }
    }

    /// The static table entry for this region
    pub fn entry(self) -> &'static RegionEntry {
        REGIONS
            .iter()
            .find(|e| e.code == self)
            .unwrap_or(&REGIONS[0])
    }

    /// The host of the requested kind for this region
    pub fn domain(self, kind: DomainKind) -> &'static str {
        self.entry().domain(kind)
    }

    /// Looks up a region by code, display name or alias without any fallback
    pub fn lookup(input: &str) -> Option<Self> {
        let normalized = normalize(input);
        if normalized.is_empty() {
            return None;
        }

        REGIONS
            .iter()
            .find(|e| e.matches(&normalized))
            .map(|e| e.code)
    }

    /// Resolves any accepted spelling to a canonical code
    ///
    /// Unrecognized input resolves to [`RegionCode::NA`] and is logged at
    /// `warn` level.
    pub fn resolve(input: &str) -> Self {
        Self::lookup(input).unwrap_or_else(|| {
            tracing::warn!(
                region = input,
                fallback = RegionCode::NA.as_str(),
                "unrecognized region, using default"
            );
            RegionCode::NA
        })
    }
}

/// Resolves any accepted spelling of a region to its canonical code
pub fn to_canonical_code(input: &str) -> RegionCode {
    RegionCode::resolve(input)
}

/// Returns the host of the requested kind for a region given as a string
///
/// Falls back to North American hosts for an unknown code.
pub fn domain_for(code: &str, kind: DomainKind) -> &'static str {
    RegionCode::lookup(code).unwrap_or_default().domain(kind)
}

impl fmt::Display for RegionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegionCode {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::resolve(s))
    }
}

impl Serialize for RegionCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RegionCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::resolve(&raw))
    }
}
