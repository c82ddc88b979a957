pub mod archive;
pub mod inmemory;

use crate::event::QueryEvent;
use crate::Result;

/// Where captured query events go, and where replay reads them from.
/// Iteration is destructive and streaming: events move out of the storage
/// in insertion order. Single-threaded; the recorder thread is the only
/// writer of an active capture.
pub trait Storage: Send {
    fn add_query_event(&mut self, event: QueryEvent) -> Result<()>;

    fn add_query_events(&mut self, events: Vec<QueryEvent>) -> Result<()> {
        for event in events {
            self.add_query_event(event)?;
        }
        Ok(())
    }

    /// The next stored event, or `None` once drained.
    fn next_event(&mut self) -> Result<Option<QueryEvent>>;

    /// Approximate bytes written, for capture-size limits.
    fn bytes_written(&self) -> u64;

    /// Flush buffered records to durable storage.
    fn sync(&mut self) -> Result<()>;
}
