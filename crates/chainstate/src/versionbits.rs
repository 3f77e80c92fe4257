//! BIP9 deployment threshold states.
//!
//! A block's state equals the state of the first block of its retarget
//! period, so states are computed and memoised per period boundary. The
//! cache key is the arena index of the last block of the previous period
//! (`None` standing in for the parent of genesis).

use std::collections::HashMap;
use std::sync::Mutex;

use izzy_consensus::{Bip9Deployment, DeploymentPos, MAX_VERSION_BITS_DEPLOYMENTS};

use crate::tree::{BlockIndexEntry, BlockTree};
use crate::validation::{VERSIONBITS_TOP_BITS, VERSIONBITS_TOP_MASK};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

pub type ThresholdConditionCache = HashMap<Option<usize>, ThresholdState>;

/// Per-deployment memoisation, guarded by its own lock so reads can
/// populate it lazily.
#[derive(Default)]
pub struct VersionBitsCache {
    caches: Mutex<[ThresholdConditionCache; MAX_VERSION_BITS_DEPLOYMENTS]>,
}

impl VersionBitsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        let mut caches = self.caches.lock().expect("versionbits cache lock");
        for cache in caches.iter_mut() {
            cache.clear();
        }
    }

    pub fn state(
        &self,
        tree: &BlockTree,
        prev: Option<usize>,
        deployment: &Bip9Deployment,
        pos: DeploymentPos,
    ) -> ThresholdState {
        let mut caches = self.caches.lock().expect("versionbits cache lock");
        let checker = ThresholdConditionChecker { deployment };
        checker.state(tree, prev, &mut caches[pos as usize])
    }

    pub fn state_since_height(
        &self,
        tree: &BlockTree,
        prev: Option<usize>,
        deployment: &Bip9Deployment,
        pos: DeploymentPos,
    ) -> i32 {
        let mut caches = self.caches.lock().expect("versionbits cache lock");
        let checker = ThresholdConditionChecker { deployment };
        checker.state_since_height(tree, prev, &mut caches[pos as usize])
    }
}

/// Signalling statistics inside the period of one block.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Bip9Stats {
    pub period: i32,
    pub threshold: i32,
    pub elapsed: i32,
    pub count: i32,
    pub possible: bool,
}

pub fn versionbits_mask(deployment: &Bip9Deployment) -> i32 {
    1i32 << deployment.bit
}

/// The deployment descriptor together with its signalling condition.
pub struct ThresholdConditionChecker<'a> {
    pub deployment: &'a Bip9Deployment,
}

impl ThresholdConditionChecker<'_> {
    fn condition(&self, entry: &BlockIndexEntry) -> bool {
        (entry.version & VERSIONBITS_TOP_MASK) == VERSIONBITS_TOP_BITS
            && (entry.version & versionbits_mask(self.deployment)) != 0
    }

    /// State for the block whose parent is `prev`.
    pub fn state(
        &self,
        tree: &BlockTree,
        prev: Option<usize>,
        cache: &mut ThresholdConditionCache,
    ) -> ThresholdState {
        let period = self.deployment.period;
        let threshold = self.deployment.threshold;
        let start_time = self.deployment.start_time;
        let timeout = self.deployment.timeout;

        if start_time == Bip9Deployment::ALWAYS_ACTIVE {
            return ThresholdState::Active;
        }

        // Walk back to the last block of the previous period; the state
        // is constant inside a period.
        let mut prev = prev.and_then(|idx| {
            let height = tree.entry(idx).height;
            tree.ancestor(idx, height - ((height + 1) % period))
        });

        // Walk backwards in period strides until a cached (or trivially
        // known) ancestor is found.
        let mut to_compute = Vec::new();
        while !cache.contains_key(&prev) {
            match prev {
                None => {
                    // The genesis block is by definition defined.
                    cache.insert(None, ThresholdState::Defined);
                    break;
                }
                Some(idx) => {
                    if tree.median_time_past(idx) < start_time {
                        // Every earlier block is before the start time.
                        cache.insert(Some(idx), ThresholdState::Defined);
                        break;
                    }
                    to_compute.push(idx);
                    let height = tree.entry(idx).height;
                    prev = tree.ancestor(idx, height - period);
                }
            }
        }

        let mut state = *cache.get(&prev).expect("cache seeded above");

        // Walk forward, applying the transition table per period.
        while let Some(idx) = to_compute.pop() {
            let mut next = state;
            match state {
                ThresholdState::Defined => {
                    if tree.median_time_past(idx) >= timeout {
                        next = ThresholdState::Failed;
                    } else if tree.median_time_past(idx) >= start_time {
                        next = ThresholdState::Started;
                    }
                }
                ThresholdState::Started => {
                    if tree.median_time_past(idx) >= timeout {
                        next = ThresholdState::Failed;
                    } else {
                        let mut count = 0;
                        let mut walker = Some(idx);
                        for _ in 0..period {
                            let entry_idx = match walker {
                                Some(entry_idx) => entry_idx,
                                None => break,
                            };
                            let entry = tree.entry(entry_idx);
                            if self.condition(entry) {
                                count += 1;
                            }
                            walker = entry.parent;
                        }
                        if count >= threshold {
                            next = ThresholdState::LockedIn;
                        }
                    }
                }
                ThresholdState::LockedIn => {
                    next = ThresholdState::Active;
                }
                ThresholdState::Active | ThresholdState::Failed => {}
            }
            state = next;
            cache.insert(Some(idx), state);
        }

        state
    }

    /// Signalling statistics for the period containing `idx`.
    pub fn statistics(&self, tree: &BlockTree, idx: usize) -> Bip9Stats {
        let period = self.deployment.period;
        let mut stats = Bip9Stats {
            period,
            threshold: self.deployment.threshold,
            ..Bip9Stats::default()
        };

        let height = tree.entry(idx).height;
        let period_start = height - ((height + 1) % period);
        let end_of_prev_period = match tree.ancestor(idx, period_start) {
            Some(prev) => prev,
            None => return stats,
        };
        stats.elapsed = height - tree.entry(end_of_prev_period).height;

        let mut count = 0;
        let mut walker = idx;
        while tree.entry(walker).height != tree.entry(end_of_prev_period).height {
            if self.condition(tree.entry(walker)) {
                count += 1;
            }
            walker = match tree.entry(walker).parent {
                Some(parent) => parent,
                None => break,
            };
        }
        stats.count = count;
        stats.possible = (stats.period - stats.threshold) >= (stats.elapsed - count);
        stats
    }

    /// First height at which the current state applied.
    pub fn state_since_height(
        &self,
        tree: &BlockTree,
        prev: Option<usize>,
        cache: &mut ThresholdConditionCache,
    ) -> i32 {
        if self.deployment.start_time == Bip9Deployment::ALWAYS_ACTIVE {
            return 0;
        }

        let initial = self.state(tree, prev, cache);
        if initial == ThresholdState::Defined {
            return 0;
        }

        let period = self.deployment.period;
        let mut boundary = match prev {
            Some(idx) => {
                let height = tree.entry(idx).height;
                match tree.ancestor(idx, height - ((height + 1) % period)) {
                    Some(idx) => idx,
                    None => return 0,
                }
            }
            None => return 0,
        };

        loop {
            let height = tree.entry(boundary).height;
            let previous_boundary = tree.ancestor(boundary, height - period);
            match previous_boundary {
                Some(prev_idx) if self.state(tree, Some(prev_idx), cache) == initial => {
                    boundary = prev_idx;
                }
                _ => break,
            }
        }
        tree.entry(boundary).height + 1
    }
}
