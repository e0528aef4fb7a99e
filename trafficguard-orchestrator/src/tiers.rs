use std::collections::HashMap;

/// Default upgrade table for the traffic reset cycle. Each entry maps a tier
/// to the next one up in the same family; the counter resets on any tier
/// change, so one step is enough. Top-of-family tiers have no entry on
/// purpose: no upgrade path is a terminal condition, not something to retry.
const DEFAULT_UPGRADE_MAP: &[(&str, &str)] = &[
    ("cx23", "cx33"),
    ("cx33", "cx43"),
    ("cx43", "cx53"),
    ("cax11", "cax21"),
    ("cax21", "cax31"),
    ("cax31", "cax41"),
];

/// Pure lookup from current tier to the temporary upgrade tier. No I/O.
#[derive(Debug, Clone)]
pub struct TierResolver {
    map: HashMap<String, String>,
}

impl Default for TierResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TierResolver {
    pub fn new() -> Self {
        Self::with_map(
            DEFAULT_UPGRADE_MAP
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        )
    }

    pub fn with_map(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn resolve_upgrade(&self, current_tier: &str) -> Option<&str> {
        self.map.get(current_tier).map(String::as_str)
    }
}
