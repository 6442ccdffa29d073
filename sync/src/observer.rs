//! Stats seam between a sync round and the surrounding queue process.

/// Callbacks invoked from the master as the round progresses.
pub trait SyncObserver: Send {
    /// Called once per batch with the number of messages handed to the
    /// syncer so far.
    fn handle_info(&mut self, syncing: u64);

    /// Called at round start and then at most once per second.
    fn emit_stats(&mut self, syncing: u64);

    /// Administrative cast mirrored from the control plane; applied the
    /// moment it is seen so the file-handle cache is never starved behind
    /// a long fold.
    fn set_maximum_since_use(&mut self, age: u64);
}
