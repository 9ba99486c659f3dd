//! Synchronization primitives built directly on the thread core: counting
//! semaphores, locks with priority donation, and Mesa-style condition
//! variables. Grounded on Pintos' `threads/synch.c`
//! (`examples/original_source`), re-expressed against this crate's
//! intrusive `list` and `hal::IntrGuard` instead of Pintos' own
//! `list.c`/raw `intr_disable`/`intr_set_level` pairs.

pub mod condvar;
pub mod lock;
pub mod semaphore;
