//! Background compaction of the data file
//!
//! Compaction slides every live record toward the start of the file,
//! closing the holes left by removals, then truncates the tail.
//!
//! ```text
//! 1. write lock   snapshot live ids by position, stop recycling, queue new puts
//! 2. per record   write lock, move record to cursor, advance cursor
//! 3. write lock   pack queued puts after the cursor, truncate, clear recycle bin
//! ```
//!
//! The write lock is released between records so readers and writers keep
//! making progress while a pass runs. At most one pass runs per region; the
//! [`OptimizerState`] inside the locked region state enforces that.

use super::descriptor::DescriptorId;
use super::key::DiskKey;
use super::region::{Region, RegionState, RegionStatus};
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Where the region's optimizer is in its lifecycle
#[derive(Debug, Clone)]
pub(crate) enum OptimizerState {
    Idle,
    Compacting(Arc<CompactionTicket>),
    /// Dispose has started; no further passes are spawned
    Disposing,
}

impl OptimizerState {
    pub fn is_idle(&self) -> bool {
        matches!(self, OptimizerState::Idle)
    }
}

/// Completion signal for one compaction pass
#[derive(Debug, Default)]
pub(crate) struct CompactionTicket {
    done: Mutex<bool>,
    finished: Condvar,
}

impl CompactionTicket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.finished.notify_all();
    }

    /// Block until the pass has finished
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.finished.wait(&mut done);
        }
    }
}

/// Completes the ticket even if the pass unwinds
struct TicketGuard(Arc<CompactionTicket>);

impl Drop for TicketGuard {
    fn drop(&mut self) {
        self.0.complete();
    }
}

/// How a compaction pass ended
#[derive(Debug, PartialEq, Eq)]
enum PassOutcome {
    Compacted { final_length: u64 },
    /// The region was reset under the pass
    Abandoned,
}

impl<K: DiskKey> Region<K> {
    /// Count a removal toward the real-time threshold, spawning a pass once reached
    ///
    /// Removals during a pass are not counted.
    pub(crate) fn maybe_optimize_real_time(self: &Arc<Self>, st: &mut RegionState<K>) {
        if !self.config.real_time_optimization_enabled()
            || !st.optimizer.is_idle()
            || !st.is_alive()
        {
            return;
        }

        let count = st.remove_count;
        st.remove_count = st.remove_count.saturating_add(1);
        if count >= self.config.optimize_at_remove_count {
            debug!(region = %self.name(), remove_count = count, "Optimizing file in real time");
            if let Err(e) = self.spawn_compaction(st) {
                error!(region = %self.name(), "Failed to start optimization: {}", e);
            }
        }
    }

    /// Start a pass on a named background thread
    ///
    /// Called with the write lock held, so the pass cannot take its first
    /// snapshot before the state reads `Compacting`.
    fn spawn_compaction(self: &Arc<Self>, st: &mut RegionState<K>) -> Result<Arc<CompactionTicket>> {
        let ticket = Arc::new(CompactionTicket::new());
        let guard = TicketGuard(Arc::clone(&ticket));
        let region = Arc::clone(self);

        thread::Builder::new()
            .name(format!("diskcache-optimize-{}", self.config.file_name()))
            .spawn(move || {
                let _guard = guard;
                region.optimize_file();
            })
            .map_err(|e| Error::Storage(format!("Failed to spawn optimizer thread: {}", e)))?;

        st.optimizer = OptimizerState::Compacting(Arc::clone(&ticket));
        Ok(ticket)
    }

    /// Run a pass now, or join the one already running, and wait for it
    pub(crate) fn optimize(self: &Arc<Self>) -> Result<()> {
        let ticket = {
            let mut guard = self.state.write();
            let st = &mut *guard;
            if !st.is_alive() {
                return Err(Error::NotAlive(format!("region {} is {:?}", self.name(), st.status)));
            }
            let running = match &st.optimizer {
                OptimizerState::Compacting(ticket) => Some(Arc::clone(ticket)),
                OptimizerState::Idle => None,
                OptimizerState::Disposing => {
                    return Err(Error::NotAlive(format!("region {} is disposing", self.name())))
                }
            };
            match running {
                Some(ticket) => ticket,
                None => self.spawn_compaction(st)?,
            }
        };

        ticket.wait();
        Ok(())
    }

    /// One full compaction pass
    pub(crate) fn optimize_file(&self) {
        let timer = Instant::now();
        info!(region = %self.name(), "Beginning optimization");

        let (snapshot, generation) = self.begin_pass();
        let defragged = self.defrag_snapshot(&snapshot, generation);
        let outcome = self.end_pass(defragged, generation);

        match outcome {
            Ok(PassOutcome::Compacted { final_length }) => info!(
                region = %self.name(),
                final_length,
                elapsed = ?timer.elapsed(),
                "Finished optimization"
            ),
            Ok(PassOutcome::Abandoned) => {
                warn!(region = %self.name(), "Region was reset during optimization, pass abandoned")
            }
            Err(e) => error!(region = %self.name(), "Error optimizing disk cache: {}", e),
        }
    }

    /// Stop recycling, start queueing puts, and snapshot live ids by position
    fn begin_pass(&self) -> (Vec<DescriptorId>, u64) {
        let mut guard = self.state.write();
        let st = &mut *guard;
        st.times_optimized += 1;
        st.do_recycle = false;
        st.queue_input = true;
        let snapshot = st.position_sorted().into_iter().map(|(id, _)| id).collect();
        (snapshot, st.generation)
    }

    /// Pack queued puts and truncate unless the region was reset, then resume normal operation
    fn end_pass(&self, defragged: Result<Option<u64>>, generation: u64) -> Result<PassOutcome> {
        let mut guard = self.state.write();
        let st = &mut *guard;
        let outcome = defragged.and_then(|cursor| match cursor {
            Some(cursor) if st.generation == generation => self.pack_queued_puts(st, cursor),
            _ => Ok(PassOutcome::Abandoned),
        });
        self.finish_compaction(st, &outcome);
        outcome
    }

    /// Move snapshot records down to the cursor, one write lock per record
    ///
    /// Returns the cursor after the last record, or `None` if the region was
    /// reset under the pass.
    fn defrag_snapshot(&self, snapshot: &[DescriptorId], generation: u64) -> Result<Option<u64>> {
        let mut cursor = 0u64;
        for &id in snapshot {
            let mut guard = self.state.write();
            if guard.generation != generation {
                return Ok(None);
            }
            cursor = self.relocate(&mut guard, id, cursor)?;
        }
        Ok(Some(cursor))
    }

    /// Move one record to `cursor` if it is still live, returning the next cursor
    fn relocate(&self, st: &mut RegionState<K>, id: DescriptorId, cursor: u64) -> Result<u64> {
        // Removed since the snapshot
        let Some(slot) = st.arena.get(id).copied() else {
            return Ok(cursor);
        };

        if slot.position < cursor {
            return Err(Error::Corruption(format!(
                "record {} lies below the compaction cursor {}",
                slot, cursor
            )));
        }

        if slot.position != cursor {
            let mut moved = slot;
            st.files()?.data.move_record(&mut moved, cursor)?;
            if let Some(current) = st.arena.get_mut(id) {
                *current = moved;
            }
        }
        Ok(cursor + slot.record_size())
    }

    /// Pack puts made during the pass behind the cursor and truncate
    fn pack_queued_puts(&self, st: &mut RegionState<K>, mut cursor: u64) -> Result<PassOutcome> {
        let mut queued: Vec<_> = st
            .queued_puts
            .drain(..)
            .filter_map(|id| st.arena.get(id).map(|slot| (id, *slot)))
            .collect();
        queued.sort_unstable_by(|a, b| a.1.position_cmp(&b.1));

        if !queued.is_empty() {
            debug!(region = %self.name(), queued = queued.len(), "Packing queued puts");
        }
        for (id, _) in queued {
            cursor = self.relocate(st, id, cursor)?;
        }

        st.files()?.data.truncate(cursor)?;
        Ok(PassOutcome::Compacted {
            final_length: cursor,
        })
    }

    /// Restore normal operation after a pass, successful or not
    fn finish_compaction(&self, st: &mut RegionState<K>, outcome: &Result<PassOutcome>) {
        // Holes may have been overwritten by moves, so the bin is stale either way
        if !st.recycle.is_empty() {
            debug!(region = %self.name(), slots = st.recycle.len(), "Discarding recycle bin");
        }
        st.recycle.clear(&mut st.arena);
        st.queued_puts.clear();
        st.do_recycle = true;
        st.queue_input = false;

        if let Ok(PassOutcome::Compacted { .. }) = outcome {
            st.bytes_free = 0;
            st.remove_count = 0;
        }
        if let OptimizerState::Compacting(_) = st.optimizer {
            st.optimizer = OptimizerState::Idle;
        }
    }

    /// Shut the region down, waiting at most `dispose_timeout` for it
    ///
    /// The work runs on its own thread; on timeout it is abandoned and the
    /// region is left in `Disposing`.
    pub(crate) fn dispose(self: &Arc<Self>) {
        {
            let mut st = self.state.write();
            if !st.is_alive() {
                debug!(region = %self.name(), status = ?st.status, "Region is not alive, nothing to dispose");
                return;
            }
            st.status = RegionStatus::Disposing;
        }

        let (tx, rx) = mpsc::channel();
        let region = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("diskcache-dispose-{}", self.config.file_name()))
            .spawn(move || {
                region.dispose_internal();
                tx.send(()).ok();
            });

        match spawned {
            Ok(_) => match rx.recv_timeout(self.config.dispose_timeout()) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => warn!(
                    region = %self.name(),
                    timeout = ?self.config.dispose_timeout(),
                    "Disposal timed out, abandoning disposal thread"
                ),
                Err(RecvTimeoutError::Disconnected) => {
                    error!(region = %self.name(), "Disposal thread exited before finishing")
                }
            },
            Err(e) => {
                warn!(region = %self.name(), "Could not spawn disposal thread, disposing inline: {}", e);
                self.dispose_internal();
            }
        }
    }

    fn dispose_internal(&self) {
        info!(region = %self.name(), "Disposing");

        let (running, run_shutdown_pass) = {
            let mut st = self.state.write();
            let previous = std::mem::replace(&mut st.optimizer, OptimizerState::Disposing);
            let run = self.config.optimize_on_shutdown && st.bytes_free > 0;
            match previous {
                OptimizerState::Compacting(ticket) => (Some(ticket), false),
                _ => (None, run),
            }
        };

        if let Some(ticket) = running {
            info!(region = %self.name(), "Optimization already in progress, waiting for it");
            ticket.wait();
        } else if run_shutdown_pass {
            info!(region = %self.name(), "Optimizing file before shutdown");
            self.optimize_file();
        }

        let mut guard = self.state.write();
        if guard.files.is_some() {
            if let Err(e) = self.save_keys(&guard) {
                error!(region = %self.name(), "Failure saving keys on dispose: {}", e);
            }
        }
        if let Some(files) = guard.files.take() {
            if let Err(e) = files.close() {
                error!(region = %self.name(), "Failure closing files on dispose: {}", e);
            }
        }
        guard.status = RegionStatus::Closed;
        info!(region = %self.name(), "Shutdown complete");
    }
}
