use std::collections::HashMap;

use cadence_core::RecurrenceConfig;

/// Name reported for a recurring job whose interval matches no known recurrence.
pub const FAKE_SCHEDULE: &str = "__fake_schedule";

/// Lookup table between recurrence names and their intervals in seconds.
///
/// Two names registered with the same interval collapse into the one
/// registered last.
#[derive(Debug, Clone, Default)]
pub struct Recurrences {
    by_name: HashMap<String, u64>,
    by_interval: HashMap<u64, String>,
}

impl Recurrences {
    pub fn new(entries: &[RecurrenceConfig]) -> Self {
        let mut table = Self::default();
        for entry in entries {
            table.by_name.insert(entry.name.clone(), entry.interval);
            table.by_interval.insert(entry.interval, entry.name.clone());
        }
        table
    }

    pub fn interval_of(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, interval: u64) -> Option<&str> {
        self.by_interval.get(&interval).map(String::as_str)
    }

    /// Best guess at a recurrence name for a stored interval.
    pub fn name_or_fake(&self, interval: u64) -> String {
        self.name_of(interval).unwrap_or(FAKE_SCHEDULE).to_string()
    }

    /// `(interval, name)` pairs, sorted by interval.
    pub fn by_interval(&self) -> Vec<(u64, &str)> {
        let mut pairs: Vec<_> = self
            .by_interval
            .iter()
            .map(|(interval, name)| (*interval, name.as_str()))
            .collect();
        pairs.sort_unstable();
        pairs
    }
}
