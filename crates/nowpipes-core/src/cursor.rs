//! Pull-based record cursors.
//!
//! A cursor is one epoch's worth of iteration over a stage's output. Each
//! call to [`RecordCursor::next_record`] pulls exactly one element from the
//! chain; exhaustion is a clean `None`, and iteration-time failures are
//! surfaced as `Some(Err(..))` so the consumer decides whether to skip or
//! abort. Resources acquired for an epoch (file handles, buffers) belong to
//! the cursor and are released when it is dropped, which also covers early
//! termination by a consumer that stops pulling before exhaustion.

use crate::error::Result;

pub trait RecordCursor<R> {
    fn next_record(&mut self) -> Option<Result<R>>;
}

/// Boxed cursor returned by [`crate::stage::Stage::iterate`].
pub type Cursor<R> = Box<dyn RecordCursor<R> + Send>;

/// Cursor over an owned vector of records.
pub struct VecCursor<R> {
    items: std::vec::IntoIter<R>,
}

impl<R> VecCursor<R> {
    pub fn new(items: Vec<R>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl<R> RecordCursor<R> for VecCursor<R> {
    fn next_record(&mut self) -> Option<Result<R>> {
        self.items.next().map(Ok)
    }
}
