//! Lock types: resource tags, modes, conflict tables and wait states

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Highest lock mode a conflict table may define
pub const MAX_LOCK_MODES: u8 = 31;

/// Identifier of a lockable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockTag(u64);

impl LockTag {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }

    /// Partition index this resource hashes to
    pub fn partition(&self, num_partitions: usize) -> usize {
        // Fibonacci hashing spreads sequential ids across partitions.
        let hash = self.0.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (hash >> 32) as usize % num_partitions
    }
}

impl fmt::Display for LockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource:{}", self.0)
    }
}

/// A lock mode, an index into the conflict table (1-based; 0 means "no lock")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockMode(u8);

impl LockMode {
    pub const fn new(mode: u8) -> Self {
        Self(mode)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bit set of lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LockMask(u32);

impl LockMask {
    pub const EMPTY: LockMask = LockMask(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bit(mode: LockMode) -> Self {
        Self(1 << mode.0)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, mode: LockMode) -> bool {
        self.0 & (1 << mode.0) != 0
    }

    pub fn intersects(&self, other: LockMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: LockMask) -> Self {
        Self(self.0 | other.0)
    }

    pub fn with(self, mode: LockMode) -> Self {
        Self(self.0 | (1 << mode.0))
    }

    pub fn without(self, mode: LockMode) -> Self {
        Self(self.0 & !(1 << mode.0))
    }

    /// Iterate over the modes set in this mask, lowest first
    pub fn iter(&self) -> impl Iterator<Item = LockMode> + '_ {
        (1..=MAX_LOCK_MODES)
            .filter(move |m| self.0 & (1 << m) != 0)
            .map(LockMode)
    }
}

impl std::ops::BitOr for LockMask {
    type Output = LockMask;

    fn bitor(self, rhs: LockMask) -> LockMask {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for LockMask {
    fn bitor_assign(&mut self, rhs: LockMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for LockMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, mode) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", mode)?;
        }
        write!(f, "]")
    }
}

/// Mode × mode compatibility table
///
/// `conflicts[m]` is the set of modes that cannot be held concurrently
/// with a request for mode `m`. Index 0 is unused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictTable {
    names: Vec<String>,
    conflicts: Vec<LockMask>,
}

impl ConflictTable {
    /// Build a table from mode names and `(mode, conflicting modes)` rows.
    ///
    /// Modes are numbered from 1 in the order given in `names`. The
    /// resulting relation must be symmetric.
    pub fn new(names: &[&str], rows: &[(u8, &[u8])]) -> Result<Self> {
        if names.is_empty() || names.len() > MAX_LOCK_MODES as usize {
            return Err(Error::ConfigError(format!(
                "conflict table must define between 1 and {} modes, got {}",
                MAX_LOCK_MODES,
                names.len()
            )));
        }
        let max = names.len() as u8;
        let mut conflicts = vec![LockMask::EMPTY; names.len() + 1];

        for (mode, others) in rows {
            if *mode == 0 || *mode > max {
                return Err(Error::InvalidLockMode { mode: *mode, max });
            }
            for other in *others {
                if *other == 0 || *other > max {
                    return Err(Error::InvalidLockMode { mode: *other, max });
                }
                conflicts[*mode as usize] = conflicts[*mode as usize].with(LockMode(*other));
            }
        }

        for a in 1..=max {
            for b in 1..=max {
                let ab = conflicts[a as usize].contains(LockMode(b));
                let ba = conflicts[b as usize].contains(LockMode(a));
                if ab != ba {
                    return Err(Error::ConfigError(format!(
                        "conflict table is not symmetric for modes {} and {}",
                        a, b
                    )));
                }
            }
        }

        Ok(Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            conflicts,
        })
    }

    /// Two modes: 1 = shared, 2 = exclusive
    pub fn shared_exclusive() -> Self {
        Self {
            names: vec!["Shared".to_string(), "Exclusive".to_string()],
            conflicts: vec![
                LockMask::EMPTY,
                LockMask::from_bits(1 << 2),
                LockMask::from_bits((1 << 1) | (1 << 2)),
            ],
        }
    }

    /// Three modes: 1 = shared, 2 = update, 3 = exclusive
    ///
    /// Update conflicts with itself and exclusive but coexists with shared.
    pub fn shared_update_exclusive() -> Self {
        Self {
            names: vec![
                "Shared".to_string(),
                "Update".to_string(),
                "Exclusive".to_string(),
            ],
            conflicts: vec![
                LockMask::EMPTY,
                LockMask::from_bits(1 << 3),
                LockMask::from_bits((1 << 2) | (1 << 3)),
                LockMask::from_bits((1 << 1) | (1 << 2) | (1 << 3)),
            ],
        }
    }

    /// Number of modes defined
    pub fn num_modes(&self) -> u8 {
        self.names.len() as u8
    }

    /// Mode by its name (case-insensitive)
    pub fn mode(&self, name: &str) -> Option<LockMode> {
        self.names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name))
            .map(|i| LockMode(i as u8 + 1))
    }

    /// Name of a mode
    pub fn mode_name(&self, mode: LockMode) -> &str {
        mode.index()
            .checked_sub(1)
            .and_then(|i| self.names.get(i))
            .map(String::as_str)
            .unwrap_or("NoLock")
    }

    /// Check that a mode is defined by this table
    pub fn validate(&self, mode: LockMode) -> Result<()> {
        if mode.0 == 0 || mode.0 > self.num_modes() {
            return Err(Error::InvalidLockMode {
                mode: mode.0,
                max: self.num_modes(),
            });
        }
        Ok(())
    }

    /// Modes that conflict with a request for `mode`
    pub fn conflicts(&self, mode: LockMode) -> LockMask {
        self.conflicts
            .get(mode.index())
            .copied()
            .unwrap_or(LockMask::EMPTY)
    }

    /// Whether a request for `mode` conflicts with any mode in `mask`
    pub fn conflicts_with(&self, mode: LockMode, mask: LockMask) -> bool {
        self.conflicts(mode).intersects(mask)
    }

    /// Whether two modes can be held concurrently
    pub fn compatible(&self, a: LockMode, b: LockMode) -> bool {
        !self.conflicts(a).contains(b)
    }
}

/// Outcome of a lock wait as seen by the waiting worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WaitStatus {
    /// Not waiting for anything
    Idle = 0,
    /// Queued, waiting to be granted
    Waiting = 1,
    /// Granted by a releaser
    Granted = 2,
    /// Kicked out of the queue (deadlock, cancel)
    Error = 3,
}

impl WaitStatus {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Waiting,
            2 => Self::Granted,
            3 => Self::Error,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Waiting => write!(f, "waiting"),
            Self::Granted => write!(f, "granted"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Result of the most recent deadlock check for a waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeadlockState {
    NotYetChecked = 0,
    NoDeadlock = 1,
    /// A cycle was broken by rearranging a wait queue
    SoftDeadlock = 2,
    /// A cycle that only failing a participant can break
    HardDeadlock = 3,
    /// No deadlock, but a background worker is in the way
    BlockedByBackgroundTask = 4,
}

impl DeadlockState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::NoDeadlock,
            2 => Self::SoftDeadlock,
            3 => Self::HardDeadlock,
            4 => Self::BlockedByBackgroundTask,
            _ => Self::NotYetChecked,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotYetChecked => "not_yet_checked",
            Self::NoDeadlock => "no_deadlock",
            Self::SoftDeadlock => "soft_deadlock",
            Self::HardDeadlock => "hard_deadlock",
            Self::BlockedByBackgroundTask => "blocked_by_background_task",
        }
    }
}

impl fmt::Display for DeadlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a non-blocking acquire treats already-queued waiters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDiscipline {
    /// A request that conflicts with any queued waiter's mode must queue too
    #[default]
    RespectQueue,
    /// Only currently held modes are consulted
    IgnoreQueue,
}

/// Result of a non-blocking acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireOutcome {
    Granted,
    WouldBlock,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_exclusive_table() {
        let table = ConflictTable::shared_exclusive();
        let shared = table.mode("shared").unwrap();
        let exclusive = table.mode("Exclusive").unwrap();

        assert!(table.compatible(shared, shared));
        assert!(!table.compatible(shared, exclusive));
        assert!(!table.compatible(exclusive, exclusive));
        assert_eq!(table.mode_name(exclusive), "Exclusive");
    }

    #[test]
    fn test_update_mode_coexists_with_shared() {
        let table = ConflictTable::shared_update_exclusive();
        let shared = LockMode::new(1);
        let update = LockMode::new(2);

        assert!(table.compatible(update, shared));
        assert!(!table.compatible(update, update));
    }

    #[test]
    fn test_asymmetric_table_rejected() {
        let err = ConflictTable::new(&["A", "B"], &[(1, &[2])]).unwrap_err();
        assert_eq!(err.code(), "E600");
    }

    #[test]
    fn test_custom_table_matches_builtin() {
        let table = ConflictTable::new(&["Shared", "Exclusive"], &[(1, &[2]), (2, &[1, 2])])
            .unwrap();
        assert_eq!(table, ConflictTable::shared_exclusive());
    }

    #[test]
    fn test_invalid_mode() {
        let table = ConflictTable::shared_exclusive();
        assert!(table.validate(LockMode::new(0)).is_err());
        assert!(table.validate(LockMode::new(3)).is_err());
        assert!(table.validate(LockMode::new(2)).is_ok());
    }

    #[test]
    fn test_mask_operations() {
        let mask = LockMask::EMPTY.with(LockMode::new(1)).with(LockMode::new(3));
        assert!(mask.contains(LockMode::new(3)));
        assert!(!mask.contains(LockMode::new(2)));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![LockMode::new(1), LockMode::new(3)]);
        assert_eq!(mask.without(LockMode::new(1)), LockMask::bit(LockMode::new(3)));
        assert_eq!(mask.to_string(), "[1,3]");
    }

    #[test]
    fn test_partition_in_range() {
        for id in 0..1000 {
            assert!(LockTag::new(id).partition(16) < 16);
        }
    }
}
