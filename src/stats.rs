//! Access counters exposed at teardown.

use serde::Serialize;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub read_hit: u64,
    pub read_miss: u64,
    pub write_hit: u64,
    pub write_miss: u64,
    pub supply_hit: u64,
    pub supply_miss: u64,
    pub upgrade_miss: u64,
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "read {}/{} write {}/{} supply {}/{} upgrade misses {}",
            self.read_hit,
            self.read_hit + self.read_miss,
            self.write_hit,
            self.write_hit + self.write_miss,
            self.supply_hit,
            self.supply_hit + self.supply_miss,
            self.upgrade_miss,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_summarizes_totals() {
        let stats = Stats {
            read_hit: 3,
            read_miss: 1,
            ..Stats::default()
        };
        assert_eq!(
            stats.to_string(),
            "read 3/4 write 0/0 supply 0/0 upgrade misses 0"
        );
    }
}
