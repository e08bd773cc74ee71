use serde_json::Value;

/// Ordered iterator over the records of a table or index.
///
/// A cursor is a snapshot: records committed by other transactions after it
/// was opened are not observed, and deleting a record through the owning
/// transaction does not disturb iteration.
#[derive(Debug)]
pub struct Cursor {
    records: std::vec::IntoIter<Value>,
}

impl Cursor {
    pub(crate) fn new(records: Vec<Value>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }

    /// Number of records not yet yielded.
    pub fn remaining(&self) -> usize {
        self.records.len()
    }
}

impl Iterator for Cursor {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        self.records.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}
