//! Load balancing strategies for server groups

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

use podroute_core::models::StrategyKind;

/// A live member a strategy can pick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub address: SocketAddr,
    /// Client sessions currently connected
    pub sessions: usize,
}

pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Pick one of `targets`; `None` only when `targets` is empty
    fn choose(&self, targets: &[Target]) -> Option<Target>;
}

/// Build the strategy for `kind`
#[must_use]
pub fn strategy_for(kind: StrategyKind) -> Arc<dyn Strategy> {
    match kind {
        StrategyKind::RoundRobin => Arc::new(RoundRobin::new()),
        StrategyKind::MinimumLoad => Arc::new(MinimumLoad),
    }
}

/// Cycles through the targets.
///
/// The cursor advances before it is read, so over `[A, B, C]` the picks are
/// `B, C, A, B, ...`. A cursor past the end (the member list shrank) wraps
/// to the first target.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: Mutex<usize>,
}

impl RoundRobin {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobin {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RoundRobin
    }

    fn choose(&self, targets: &[Target]) -> Option<Target> {
        if targets.is_empty() {
            return None;
        }

        let mut cursor = self.cursor.lock();
        *cursor += 1;
        if targets.len() <= *cursor {
            *cursor = 0;
        }
        targets.get(*cursor).cloned()
    }
}

/// Picks the target with the fewest sessions; ties go to the earliest one
#[derive(Debug, Default, Clone, Copy)]
pub struct MinimumLoad;

impl Strategy for MinimumLoad {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MinimumLoad
    }

    fn choose(&self, targets: &[Target]) -> Option<Target> {
        targets.iter().min_by_key(|t| t.sessions).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(loads: &[(&str, usize)]) -> Vec<Target> {
        loads
            .iter()
            .enumerate()
            .map(|(i, (name, sessions))| Target {
                name: (*name).to_string(),
                address: SocketAddr::from(([10, 0, 0, u8::try_from(i + 1).unwrap()], 25565)),
                sessions: *sessions,
            })
            .collect()
    }

    fn names(strategy: &dyn Strategy, targets: &[Target], picks: usize) -> Vec<String> {
        (0..picks)
            .map(|_| strategy.choose(targets).unwrap().name)
            .collect()
    }

    #[test]
    fn test_round_robin_advances_before_reading() {
        let members = targets(&[("a", 0), ("b", 0), ("c", 0)]);
        let strategy = RoundRobin::new();
        assert_eq!(names(&strategy, &members, 6), vec!["b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn test_round_robin_handles_shrinking_members() {
        let strategy = RoundRobin::new();
        let three = targets(&[("a", 0), ("b", 0), ("c", 0)]);
        let two = targets(&[("a", 0), ("b", 0)]);

        assert_eq!(strategy.choose(&three).unwrap().name, "b");
        assert_eq!(strategy.choose(&three).unwrap().name, "c");
        // cursor 2 -> 3 is past the end of two members
        assert_eq!(strategy.choose(&two).unwrap().name, "a");
        assert_eq!(strategy.choose(&two).unwrap().name, "b");
    }

    #[test]
    fn test_round_robin_single_member() {
        let strategy = RoundRobin::new();
        let one = targets(&[("solo", 3)]);
        assert_eq!(names(&strategy, &one, 3), vec!["solo", "solo", "solo"]);
    }

    #[test]
    fn test_empty_targets() {
        assert!(RoundRobin::new().choose(&[]).is_none());
        assert!(MinimumLoad.choose(&[]).is_none());
    }

    #[test]
    fn test_minimum_load() {
        let members = targets(&[("a", 4), ("b", 1), ("c", 7)]);
        assert_eq!(MinimumLoad.choose(&members).unwrap().name, "b");
    }

    #[test]
    fn test_minimum_load_tie_goes_to_first() {
        let members = targets(&[("a", 3), ("b", 1), ("c", 1)]);
        assert_eq!(MinimumLoad.choose(&members).unwrap().name, "b");
    }

    #[test]
    fn test_strategy_for_kind() {
        assert_eq!(strategy_for(StrategyKind::RoundRobin).kind(), StrategyKind::RoundRobin);
        assert_eq!(strategy_for(StrategyKind::MinimumLoad).kind(), StrategyKind::MinimumLoad);
    }
}
