//! Lock region engine (spec.md §4.7). Transcribed from
//! `original_source/libfuse/lib/fuse.c`'s `locks_conflict`/`locks_insert`:
//! a per-node singly-linked (here: `Vec`-backed) list of byte-range
//! locks sorted by `start`, with same-owner same-type extend/merge and
//! same-owner different-type cover/split/trim.

pub const LOCK_RDLCK: u32 = libc::F_RDLCK as u32;
pub const LOCK_WRLCK: u32 = libc::F_WRLCK as u32;
pub const LOCK_UNLCK: u32 = libc::F_UNLCK as u32;

/// `end == OFF_MAX` represents "to end of file".
pub const OFF_MAX: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    pub lock_type: u32,
    pub start: u64,
    pub end: u64,
    pub pid: u32,
    pub owner: u64,
}

/// First record with a *different* owner whose range overlaps `query`
/// and where at least one side is `WRLCK` (spec.md §8 testable
/// property / libfuse's `locks_conflict`).
pub fn conflict<'a>(locks: &'a [Lock], query: &Lock) -> Option<&'a Lock> {
    locks.iter().find(|l| {
        l.owner != query.owner
            && query.start <= l.end
            && l.start <= query.end
            && (l.lock_type == LOCK_WRLCK || query.lock_type == LOCK_WRLCK)
    })
}

/// Insert `new_lock` into `locks`, maintaining invariant 6 (sorted by
/// `start`, no adjacent same-owner same-type ranges). Mirrors
/// `locks_insert`'s merge/split/trim walk exactly; unlike the C
/// version this can't fail on allocation (no up-front scratch records
/// to run out of), so there's no `-ENOLCK` path here — the type
/// signature still returns `Result` so callers that add a bound on
/// lock-table size can surface one.
pub fn insert(locks: &mut Vec<Lock>, mut new_lock: Lock) -> Result<(), crate::error::CoreError> {
    let mut result: Vec<Lock> = Vec::with_capacity(locks.len() + 1);
    let mut inserted_splits: Vec<Lock> = Vec::new();

    let mut i = 0;
    while i < locks.len() {
        let l = locks[i];
        if l.owner != new_lock.owner {
            result.push(l);
            i += 1;
            continue;
        }

        if new_lock.lock_type == l.lock_type {
            // same owner, same type: disjoint-and-not-adjacent -> keep both
            if l.end < new_lock.start.wrapping_sub(1) && l.end + 1 < new_lock.start {
                result.push(l);
                i += 1;
                continue;
            }
            if new_lock.end < l.start.saturating_sub(1) && new_lock.end + 1 < l.start {
                // new_lock ends strictly before l starts (and not adjacent):
                // nothing more to merge from here on (list is sorted).
                result.push(l);
                i += 1;
                continue;
            }
            // adjacent or overlapping: absorb l into new_lock, drop l.
            new_lock.start = new_lock.start.min(l.start);
            new_lock.end = new_lock.end.max(l.end);
            i += 1;
            continue;
        } else {
            // same owner, different type
            if l.end < new_lock.start {
                result.push(l);
                i += 1;
                continue;
            }
            if new_lock.end < l.start {
                result.push(l);
                i += 1;
                continue;
            }
            if new_lock.start <= l.start && l.end <= new_lock.end {
                // new_lock strictly covers l: drop l.
                i += 1;
                continue;
            }
            if l.start <= new_lock.start && new_lock.end <= l.end {
                // l strictly covers new_lock: split l into two around new_lock.
                if l.start < new_lock.start {
                    inserted_splits.push(Lock {
                        start: l.start,
                        end: new_lock.start - 1,
                        ..l
                    });
                }
                if new_lock.end < l.end {
                    inserted_splits.push(Lock {
                        start: new_lock.end + 1,
                        end: l.end,
                        ..l
                    });
                }
                i += 1;
                continue;
            }
            if l.end <= new_lock.end {
                // overlap on l's right side: trim l to end before new_lock.
                let mut trimmed = l;
                trimmed.end = new_lock.start - 1;
                result.push(trimmed);
                i += 1;
                continue;
            }
            // overlap on l's left side: trim l to start after new_lock.
            let mut trimmed = l;
            trimmed.start = new_lock.end + 1;
            result.push(trimmed);
            i += 1;
            continue;
        }
    }

    result.extend(inserted_splits);
    if new_lock.lock_type != LOCK_UNLCK {
        result.push(new_lock);
    }
    result.sort_by_key(|l| l.start);

    *locks = result;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(t: u32, start: u64, end: u64, owner: u64) -> Lock {
        Lock {
            lock_type: t,
            start,
            end,
            pid: 0,
            owner,
        }
    }

    #[test]
    fn insert_merges_adjacent_same_owner_same_type() {
        let mut locks = Vec::new();
        insert(&mut locks, lock(LOCK_RDLCK, 0, 9, 1)).unwrap();
        insert(&mut locks, lock(LOCK_RDLCK, 10, 19, 1)).unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0], lock(LOCK_RDLCK, 0, 19, 1));
    }

    #[test]
    fn insert_wrlck_splits_existing_rdlck_range() {
        // scenario 4 from spec.md §8
        let mut locks = Vec::new();
        insert(&mut locks, lock(LOCK_RDLCK, 0, 9, 1)).unwrap();
        insert(&mut locks, lock(LOCK_RDLCK, 10, 19, 1)).unwrap();
        insert(&mut locks, lock(LOCK_WRLCK, 5, 14, 1)).unwrap();

        assert_eq!(
            locks,
            vec![
                lock(LOCK_RDLCK, 0, 4, 1),
                lock(LOCK_WRLCK, 5, 14, 1),
                lock(LOCK_RDLCK, 15, 19, 1),
            ]
        );
    }

    #[test]
    fn insert_is_sorted_by_start() {
        let mut locks = Vec::new();
        for (s, e) in [(100, 110), (0, 10), (50, 60)] {
            insert(&mut locks, lock(LOCK_RDLCK, s, e, (s / 10) as u64 + 1)).unwrap();
        }
        let starts: Vec<u64> = locks.iter().map(|l| l.start).collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn unlock_covering_range_removes_all() {
        let mut locks = Vec::new();
        insert(&mut locks, lock(LOCK_RDLCK, 0, 9, 1)).unwrap();
        insert(&mut locks, lock(LOCK_WRLCK, 20, 29, 1)).unwrap();
        insert(&mut locks, lock(LOCK_UNLCK, 0, OFF_MAX, 1)).unwrap();
        assert!(locks.is_empty());
    }

    #[test]
    fn conflict_requires_different_owner_and_a_write_side() {
        let locks = vec![lock(LOCK_RDLCK, 0, 9, 1)];
        let query = lock(LOCK_RDLCK, 5, 15, 2);
        // both read, different owner: no conflict (two readers coexist)
        assert!(conflict(&locks, &query).is_none());

        let query = lock(LOCK_WRLCK, 5, 15, 2);
        assert!(conflict(&locks, &query).is_some());

        let query_same_owner = lock(LOCK_WRLCK, 5, 15, 1);
        assert!(conflict(&locks, &query_same_owner).is_none());
    }

    #[test]
    fn conflict_requires_overlap() {
        let locks = vec![lock(LOCK_WRLCK, 0, 9, 1)];
        let query = lock(LOCK_WRLCK, 10, 20, 2);
        assert!(conflict(&locks, &query).is_none());
    }

    #[test]
    fn same_owner_different_type_new_covers_old_deletes_old() {
        let mut locks = Vec::new();
        insert(&mut locks, lock(LOCK_RDLCK, 5, 10, 1)).unwrap();
        insert(&mut locks, lock(LOCK_WRLCK, 0, 20, 1)).unwrap();
        assert_eq!(locks, vec![lock(LOCK_WRLCK, 0, 20, 1)]);
    }

    #[test]
    fn same_owner_different_type_old_covers_new_splits_old() {
        let mut locks = Vec::new();
        insert(&mut locks, lock(LOCK_RDLCK, 0, 20, 1)).unwrap();
        insert(&mut locks, lock(LOCK_WRLCK, 5, 10, 1)).unwrap();
        assert_eq!(
            locks,
            vec![
                lock(LOCK_RDLCK, 0, 4, 1),
                lock(LOCK_WRLCK, 5, 10, 1),
                lock(LOCK_RDLCK, 11, 20, 1),
            ]
        );
    }
}
