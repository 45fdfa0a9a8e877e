// =============================================================================
// gatesched — Synchronization Primitives
// =============================================================================
//
// Lock ordering (outermost first):
//   Level 1: Host state lock        (parking_lot::Mutex<HostState>)
//   Level 2: Gate slot lock         (spin::RwLock, held only inside a hook
//                                    or a map operation)
//            Gate writer lock       (spin::Mutex in GateCell, seqlock writers)
//   Level 3: Notifier epoch lock    (parking_lot::Mutex<u64>)
//
// NEVER take the host state lock while holding a level 2 or 3 lock.
// Level 2 locks are released before notifying. Wait conditions evaluated
// under the epoch lock read atomics only; they take no other lock.
// =============================================================================

pub mod notify;

pub use notify::Notify;
