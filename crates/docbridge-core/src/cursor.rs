//! Lazy result cursors.

use crate::document::{RawRecord, Record};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;

/// Backend side of a cursor: yields batches until exhausted.
#[async_trait]
pub trait CursorSource: Send {
    /// Fetch the next batch; an empty batch ends the stream.
    async fn next_batch(&mut self) -> Result<Vec<RawRecord>>;
}

/// A lazy, closeable iterator over query results.
///
/// Records are fetched in batches and decoded into the caller's type one at
/// a time. A cursor that is dropped without [`Cursor::close`] is closed
/// implicitly.
pub struct Cursor {
    buffer: VecDeque<RawRecord>,
    source: Option<Box<dyn CursorSource>>,
    closed: bool,
}

impl Cursor {
    /// A cursor pulling batches from `source`.
    pub fn new(source: Box<dyn CursorSource>) -> Self {
        Self {
            buffer: VecDeque::new(),
            source: Some(source),
            closed: false,
        }
    }

    /// A cursor over already materialized records.
    pub fn from_records(records: Vec<RawRecord>) -> Self {
        Self {
            buffer: records.into(),
            source: None,
            closed: false,
        }
    }

    pub fn empty() -> Self {
        Self::from_records(Vec::new())
    }

    /// Next undecoded record, or `None` when exhausted.
    pub async fn next_raw(&mut self) -> Result<Option<RawRecord>> {
        if self.closed {
            return Err(Error::CursorClosed);
        }
        if self.buffer.is_empty() {
            if let Some(source) = self.source.as_mut() {
                let batch = source.next_batch().await?;
                if batch.is_empty() {
                    self.source = None;
                } else {
                    self.buffer.extend(batch);
                }
            }
        }
        Ok(self.buffer.pop_front())
    }

    /// Next record decoded into `T`.
    pub async fn next<T: Record>(&mut self) -> Result<Option<T>> {
        match self.next_raw().await? {
            Some(raw) => raw.decode().map(Some),
            None => Ok(None),
        }
    }

    /// Drain the cursor into typed records and close it.
    pub async fn try_collect<T: Record>(mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(record) = self.next().await? {
            out.push(record);
        }
        self.close();
        Ok(out)
    }

    /// Drain the cursor without decoding.
    pub async fn collect_raw(mut self) -> Result<Vec<RawRecord>> {
        let mut out = Vec::new();
        while let Some(raw) = self.next_raw().await? {
            out.push(raw);
        }
        self.close();
        Ok(out)
    }

    /// Release buffered rows and the backend source.
    pub fn close(&mut self) {
        self.closed = true;
        self.buffer.clear();
        self.source = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("buffered", &self.buffer.len())
            .field("has_source", &self.source.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DocId;
    use crate::json::Map;
    use serde_json::json;

    struct Batches(Vec<Vec<RawRecord>>);

    #[async_trait]
    impl CursorSource for Batches {
        async fn next_batch(&mut self) -> Result<Vec<RawRecord>> {
            Ok(if self.0.is_empty() {
                Vec::new()
            } else {
                self.0.remove(0)
            })
        }
    }

    fn raw(n: i64) -> RawRecord {
        RawRecord::from_payload(DocId::new(), json!({"n": n}).as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_batches_are_drained_in_order() {
        let cursor = Cursor::new(Box::new(Batches(vec![vec![raw(1), raw(2)], vec![raw(3)]])));
        let maps: Vec<Map> = cursor.try_collect().await.unwrap();
        let ns: Vec<i64> = maps.iter().map(|m| m["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_closed_cursor_errors() {
        let mut cursor = Cursor::from_records(vec![raw(1)]);
        cursor.close();
        assert!(matches!(cursor.next_raw().await, Err(Error::CursorClosed)));
    }

    #[tokio::test]
    async fn test_empty_cursor() {
        let mut cursor = Cursor::empty();
        assert!(cursor.next::<Map>().await.unwrap().is_none());
    }
}
