use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::IntoEnumIterator;

#[derive(
    Debug,
    strum::EnumIter,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum AccessKind {
    Regular = 0,
    Atomic,
    Lock,
}

#[derive(
    Debug,
    strum::EnumIter,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum Event {
    ReadHit = 0,
    ReadMiss,
    WriteHit,
    WriteMiss,
    /// A valid line was evicted.
    LineEviction,
    /// A valid line carrying writes was evicted.
    DirtyLineEviction,
}

impl Event {
    #[must_use]
    pub fn hit(is_read: bool) -> Self {
        if is_read {
            Self::ReadHit
        } else {
            Self::WriteHit
        }
    }

    #[must_use]
    pub fn miss(is_read: bool) -> Self {
        if is_read {
            Self::ReadMiss
        } else {
            Self::WriteMiss
        }
    }
}

pub type CacheRow = ((AccessKind, Event), usize);

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    pub accesses: HashMap<(AccessKind, Event), usize>,
}

impl Cache {
    pub fn flatten(self) -> Vec<CacheRow> {
        let mut flattened: Vec<_> = self.accesses.into_iter().collect();
        flattened.sort_by_key(|(access, _)| *access);
        flattened
    }

    #[inline]
    pub fn inc(&mut self, kind: impl Into<AccessKind>, event: impl Into<Event>, count: usize) {
        *self
            .accesses
            .entry((kind.into(), event.into()))
            .or_insert(0) += count;
    }

    /// Number of `event`s summed over all access kinds.
    #[must_use]
    pub fn get(&self, event: Event) -> usize {
        AccessKind::iter()
            .filter_map(|kind| self.accesses.get(&(kind, event)))
            .sum()
    }

    #[must_use]
    pub fn get_kind(&self, kind: AccessKind, event: Event) -> usize {
        self.accesses.get(&(kind, event)).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_accesses(&self) -> usize {
        [Event::ReadHit, Event::ReadMiss, Event::WriteHit, Event::WriteMiss]
            .into_iter()
            .map(|event| self.get(event))
            .sum()
    }

    #[must_use]
    pub fn misses(&self) -> usize {
        self.get(Event::ReadMiss) + self.get(Event::WriteMiss)
    }
}

impl std::ops::AddAssign for Cache {
    fn add_assign(&mut self, other: Self) {
        for (k, v) in other.accesses {
            *self.accesses.entry(k).or_insert(0) += v;
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        let mut accesses = HashMap::new();
        for kind in AccessKind::iter() {
            for event in Event::iter() {
                accesses.insert((kind, event), 0);
            }
        }
        Self { accesses }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut accesses: Vec<_> = self
            .accesses
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|((kind, event), count)| (format!("{kind:?}[{event:?}]"), count))
            .collect();
        accesses.sort_by_key(|(key, _)| key.clone());

        let mut out = f.debug_struct("CacheStats");
        for (key, count) in accesses {
            out.field(&key, count);
        }
        out.finish_non_exhaustive()
    }
}

pub type PerCacheRow = (usize, CacheRow);

/// Cache statistics keyed by core id.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerCache(pub HashMap<usize, Cache>);

impl PerCache {
    pub fn into_inner(self) -> HashMap<usize, Cache> {
        self.0
    }

    pub fn flatten(self) -> Vec<PerCacheRow> {
        let mut flattened: Vec<_> = self
            .into_inner()
            .into_iter()
            .flat_map(|(id, cache)| {
                cache
                    .flatten()
                    .into_iter()
                    .map(move |cache_row| (id, cache_row))
            })
            .collect();
        flattened.sort_by_key(|(id, _)| *id);
        flattened
    }

    #[must_use]
    pub fn reduce(&self) -> Cache {
        let mut out = Cache::default();
        for stats in self.0.values() {
            out += stats.clone();
        }
        out
    }
}

impl std::ops::Deref for PerCache {
    type Target = HashMap<usize, Cache>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for PerCache {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessKind, Cache, Event};

    #[test]
    fn get_sums_over_access_kinds() {
        let mut stats = Cache::default();
        stats.inc(AccessKind::Regular, Event::ReadMiss, 2);
        stats.inc(AccessKind::Lock, Event::ReadMiss, 1);
        stats.inc(AccessKind::Atomic, Event::WriteHit, 4);
        assert_eq!(stats.get(Event::ReadMiss), 3);
        assert_eq!(stats.get_kind(AccessKind::Lock, Event::ReadMiss), 1);
        assert_eq!(stats.total_accesses(), 7);
        assert_eq!(stats.misses(), 3);
    }

    #[test]
    fn debug_skips_zero_counts() {
        let mut stats = Cache::default();
        stats.inc(AccessKind::Regular, Event::LineEviction, 1);
        assert_eq!(
            format!("{stats:?}"),
            "CacheStats { Regular[LineEviction]: 1, .. }"
        );
    }
}
