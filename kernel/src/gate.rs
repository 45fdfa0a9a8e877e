//! The gate map: a single-entry record shared by the policy and the monitor.
//!
//! Layout mirrors a one-slot array map with key 0. The policy's hooks mutate
//! the live cell in place; the monitor goes through the map operations
//! (`lookup`, `clear_pending`, `register_monitor`) the way a userspace
//! loader goes through map syscalls.
//!
//! Field writers:
//!   - `pending`/`seq`       — `stopping` sets both; the monitor clears
//!                             `pending` with a CAS against the seq it read
//!   - `last_switched_out`   — `stopping` only
//!   - `monitor_task`        — the monitor, once, before its loop
//!   - `violations`          — `running` only
//!   - `monitor_runs`        — `running` only
//!   - `gate_empty_while_closed` — `dispatch` only
//!
//! `pending` and `seq` share one atomic word, so a clear can never erase a
//! close that happened after the monitor took its snapshot.
//!
//! `(seq, last_switched_out)` is published under a seqlock: writers bump
//! `version` to odd, write both, bump it back to even. Readers retry while
//! the version is odd or moved. The monitor's clear only flips the pending
//! bit and does not take part.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spin::{Mutex, RwLock};
use thiserror::Error;

use crate::sync::Notify;
use crate::task::{Pid, Tid};

/// The only valid key.
pub const GATE_KEY: u32 = 0;

const PENDING: u64 = 1 << 63;
const SEQ_MASK: u64 = PENDING - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("no entry for key {0}")]
    NoSuchKey(u32),
    #[error("gate entry has been deleted")]
    Deleted,
    #[error("monitor already registered as task {0}")]
    MonitorRegistered(Tid),
}

/// A full copy of the gate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateState {
    pub pending: bool,
    pub seq: u64,
    pub last_switched_out: (Pid, Tid),
    pub monitor_task: Option<Tid>,
    pub violations: u64,
    pub monitor_runs: u64,
    pub gate_empty_while_closed: u64,
}

impl GateState {
    /// True when the gate is closed and a monitor exists to reopen it.
    pub fn is_closed(&self) -> bool {
        self.pending && self.monitor_task.is_some()
    }
}

/// The live record. Hooks hold an `Arc` to it for the duration of one call.
#[derive(Debug, Default)]
pub struct GateCell {
    word: AtomicU64,
    last_switched_out: AtomicU64,
    /// Seqlock version; odd while a writer is mid-update.
    version: AtomicU64,
    /// Serializes seqlock writers.
    writer: Mutex<()>,
    /// Set once the cell has been removed from the map.
    retired: AtomicBool,
    monitor_task: AtomicU32,
    violations: AtomicU64,
    monitor_runs: AtomicU64,
    gate_empty_while_closed: AtomicU64,
}

fn pack_ids(pid: Pid, tid: Tid) -> u64 {
    (u64::from(pid.0) << 32) | u64::from(tid.0)
}

fn unpack_ids(raw: u64) -> (Pid, Tid) {
    (Pid((raw >> 32) as u32), Tid(raw as u32))
}

impl GateCell {
    fn from_state(state: &GateState) -> Self {
        let cell = Self::default();
        cell.store(state);
        cell
    }

    /// Run `write` as one seqlock write section.
    fn publish(&self, write: impl FnOnce() -> u64) -> u64 {
        let _writer = self.writer.lock();
        self.version.fetch_add(1, Ordering::SeqCst);
        let out = write();
        self.version.fetch_add(1, Ordering::SeqCst);
        out
    }

    fn store(&self, state: &GateState) {
        let seq = state.seq & SEQ_MASK;
        let word = if state.pending { PENDING | seq } else { seq };
        let (pid, tid) = state.last_switched_out;
        self.publish(|| {
            self.last_switched_out.store(pack_ids(pid, tid), Ordering::SeqCst);
            self.word.store(word, Ordering::SeqCst);
            word
        });
        self.monitor_task
            .store(state.monitor_task.map_or(0, |t| t.0), Ordering::SeqCst);
        self.violations.store(state.violations, Ordering::SeqCst);
        self.monitor_runs.store(state.monitor_runs, Ordering::SeqCst);
        self.gate_empty_while_closed
            .store(state.gate_empty_while_closed, Ordering::SeqCst);
    }

    /// Consistent copy of the record.
    ///
    /// `seq` and `last_switched_out` always come from the same close.
    pub fn snapshot(&self) -> GateState {
        let (word, last) = loop {
            let before = self.version.load(Ordering::SeqCst);
            if before & 1 != 0 {
                core::hint::spin_loop();
                continue;
            }
            let last = self.last_switched_out.load(Ordering::SeqCst);
            let word = self.word.load(Ordering::SeqCst);
            if self.version.load(Ordering::SeqCst) == before {
                break (word, last);
            }
            core::hint::spin_loop();
        };
        GateState {
            pending: word & PENDING != 0,
            seq: word & SEQ_MASK,
            last_switched_out: unpack_ids(last),
            monitor_task: self.monitor(),
            violations: self.violations.load(Ordering::SeqCst),
            monitor_runs: self.monitor_runs.load(Ordering::SeqCst),
            gate_empty_while_closed: self.gate_empty_while_closed.load(Ordering::SeqCst),
        }
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.word.load(Ordering::SeqCst) & PENDING != 0
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.word.load(Ordering::SeqCst) & SEQ_MASK
    }

    #[inline]
    pub fn monitor(&self) -> Option<Tid> {
        match self.monitor_task.load(Ordering::SeqCst) {
            0 => None,
            id => Some(Tid(id)),
        }
    }

    /// Close the gate after `(pid, tid)` switched out. Returns the new seq.
    pub fn close(&self, pid: Pid, tid: Tid) -> u64 {
        self.publish(|| {
            self.last_switched_out
                .store(pack_ids(pid, tid), Ordering::SeqCst);
            let prev = self
                .word
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                    Some(PENDING | (((w & SEQ_MASK) + 1) & SEQ_MASK))
                })
                .unwrap_or_else(|w| w);
            (prev & SEQ_MASK) + 1
        })
    }

    /// Reopen the gate if `seq` is still the latest close.
    pub fn try_open(&self, seq: u64) -> bool {
        self.word
            .compare_exchange(PENDING | seq, seq, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn note_violation(&self) {
        self.violations.fetch_add(1, Ordering::SeqCst);
    }

    pub fn note_monitor_run(&self) {
        self.monitor_runs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn note_gate_empty(&self) {
        self.gate_empty_while_closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// The map itself: one slot plus a change notifier the monitor can wait on.
#[derive(Debug)]
pub struct GateMap {
    slot: RwLock<Option<Arc<GateCell>>>,
    changed: Notify,
}

impl Default for GateMap {
    fn default() -> Self {
        Self::new()
    }
}

impl GateMap {
    /// A map with key 0 present and zeroed.
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(Some(Arc::new(GateCell::default()))),
            changed: Notify::new(),
        }
    }

    fn check_key(key: u32) -> Result<(), MapError> {
        if key == GATE_KEY {
            Ok(())
        } else {
            Err(MapError::NoSuchKey(key))
        }
    }

    /// The live cell, for hooks.
    pub fn cell(&self) -> Result<Arc<GateCell>, MapError> {
        self.slot.read().as_ref().map(Arc::clone).ok_or(MapError::Deleted)
    }

    /// Full copy of the record at `key`.
    pub fn lookup(&self, key: u32) -> Result<GateState, MapError> {
        Self::check_key(key)?;
        Ok(self.cell()?.snapshot())
    }

    /// Replace the whole record at `key`. Recreates a deleted entry.
    pub fn update(&self, key: u32, state: &GateState) -> Result<(), MapError> {
        Self::check_key(key)?;
        {
            let mut slot = self.slot.write();
            match slot.as_ref() {
                Some(cell) => cell.store(state),
                None => *slot = Some(Arc::new(GateCell::from_state(state))),
            }
        }
        self.changed.notify();
        Ok(())
    }

    /// Remove the entry; later lookups fail until the next `update`.
    pub fn delete(&self, key: u32) -> Result<(), MapError> {
        Self::check_key(key)?;
        let removed = self.slot.write().take();
        if let Some(cell) = &removed {
            cell.retired.store(true, Ordering::SeqCst);
        }
        self.changed.notify();
        removed.map(|_| ()).ok_or(MapError::Deleted)
    }

    /// Clear `pending` if the gate is still closed at `seq`.
    ///
    /// Returns `false` when a newer close has already happened (or the gate
    /// was already open); the caller picks the new seq up on its next read.
    pub fn clear_pending(&self, seq: u64) -> Result<bool, MapError> {
        let opened = self.cell()?.try_open(seq);
        if opened {
            self.changed.notify();
        }
        Ok(opened)
    }

    /// Record the monitor's task id. Only one monitor may ever register.
    pub fn register_monitor(&self, tid: Tid) -> Result<(), MapError> {
        let cell = self.cell()?;
        match cell
            .monitor_task
            .compare_exchange(0, tid.0, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(current) if current == tid.0 => Ok(()),
            Err(current) => Err(MapError::MonitorRegistered(Tid(current))),
        }
    }

    /// Wake anyone blocked in [`GateMap::wait_for_change`].
    pub fn notify(&self) {
        self.changed.notify();
    }

    /// Block until `seq` differs from `last_seq`, the entry disappears, or
    /// `timeout` elapses. Returns whether something changed.
    ///
    /// The slot lock is released before the wait; the notifier only ever
    /// reads the cell's atomics.
    pub fn wait_for_change(&self, last_seq: u64, timeout: Duration) -> bool {
        let Ok(cell) = self.cell() else {
            return true;
        };
        self.changed.wait_until(
            || cell.retired.load(Ordering::SeqCst) || cell.seq() != last_seq,
            timeout,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_map_is_zeroed_and_open() {
        let map = GateMap::new();
        let state = map.lookup(GATE_KEY).unwrap();
        assert_eq!(state, GateState::default());
        assert!(!state.is_closed());
        assert_eq!(map.lookup(1), Err(MapError::NoSuchKey(1)));
    }

    #[test]
    fn close_bumps_seq_and_records_identity() {
        let map = GateMap::new();
        let cell = map.cell().unwrap();
        assert_eq!(cell.close(Pid(4), Tid(9)), 1);
        assert_eq!(cell.close(Pid(5), Tid(10)), 2);
        let state = map.lookup(GATE_KEY).unwrap();
        assert!(state.pending);
        assert_eq!(state.seq, 2);
        assert_eq!(state.last_switched_out, (Pid(5), Tid(10)));
    }

    #[test]
    fn stale_clear_does_not_reopen() {
        let map = GateMap::new();
        let cell = map.cell().unwrap();
        cell.close(Pid(1), Tid(1));
        let seen = map.lookup(GATE_KEY).unwrap().seq;
        cell.close(Pid(1), Tid(2));
        assert!(!map.clear_pending(seen).unwrap());
        assert!(cell.is_pending());
        assert!(map.clear_pending(seen + 1).unwrap());
        assert!(!cell.is_pending());
        assert_eq!(cell.seq(), 2);
        // Already open.
        assert!(!map.clear_pending(2).unwrap());
    }

    #[test]
    fn monitor_registers_once() {
        let map = GateMap::new();
        map.register_monitor(Tid(7)).unwrap();
        map.register_monitor(Tid(7)).unwrap();
        assert_eq!(
            map.register_monitor(Tid(8)),
            Err(MapError::MonitorRegistered(Tid(7)))
        );
        assert_eq!(map.lookup(GATE_KEY).unwrap().monitor_task, Some(Tid(7)));
    }

    #[test]
    fn delete_then_update_recreates() {
        let map = GateMap::new();
        map.delete(GATE_KEY).unwrap();
        assert_eq!(map.lookup(GATE_KEY), Err(MapError::Deleted));
        assert_eq!(map.delete(GATE_KEY), Err(MapError::Deleted));
        assert!(map.wait_for_change(0, Duration::from_millis(1)));

        let state = GateState { seq: 3, pending: true, ..GateState::default() };
        map.update(GATE_KEY, &state).unwrap();
        assert_eq!(map.lookup(GATE_KEY).unwrap(), state);
    }

    #[test]
    fn wait_for_change_sees_close_from_other_thread() {
        let map = Arc::new(GateMap::new());
        let closer = {
            let map = Arc::clone(&map);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                map.cell().unwrap().close(Pid(2), Tid(3));
                map.notify();
            })
        };
        assert!(map.wait_for_change(0, Duration::from_secs(5)));
        closer.join().unwrap();
        assert!(!map.wait_for_change(1, Duration::from_millis(1)));
    }

    #[test]
    fn snapshot_pairs_seq_with_its_switch_out() {
        const CLOSES: u32 = 200_000;
        let map = Arc::new(GateMap::new());
        let writer = {
            let cell = map.cell().unwrap();
            std::thread::spawn(move || {
                for k in 1..=CLOSES {
                    cell.close(Pid(k), Tid(k));
                }
            })
        };
        loop {
            let state = map.lookup(GATE_KEY).unwrap();
            let (pid, tid) = state.last_switched_out;
            if state.seq != 0 {
                assert_eq!(u64::from(pid.0), state.seq, "torn read: {state:?}");
                assert_eq!(u64::from(tid.0), state.seq, "torn read: {state:?}");
            }
            if state.seq == u64::from(CLOSES) {
                break;
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn delete_wakes_a_waiter() {
        let map = Arc::new(GateMap::new());
        let deleter = {
            let map = Arc::clone(&map);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                map.delete(GATE_KEY).unwrap();
            })
        };
        assert!(map.wait_for_change(0, Duration::from_secs(5)));
        deleter.join().unwrap();
        assert_eq!(map.lookup(GATE_KEY), Err(MapError::Deleted));
    }
}
