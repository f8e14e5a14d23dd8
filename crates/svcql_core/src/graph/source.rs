use std::fmt::Debug;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use svcql_error::Result;
use tracing::debug;

use super::queue::{QueuePoll, RowQueue};
use crate::types::{Parameters, Row, RowSchema};

#[derive(Debug, PartialEq)]
pub enum SourcePoll {
    Row(Row),
    /// No row available yet, poll again.
    Idle,
    Exhausted,
}

/// Produces the rows for the first step of a local graph.
pub trait RowSource: Send + Debug {
    /// Called once when the graph starts.
    fn open(&mut self, parameters: &Parameters) -> Result<()>;

    /// Get the next row, waiting at most `timeout`.
    fn poll_row(&mut self, timeout: Duration) -> Result<SourcePoll>;

    /// Called once when the graph completes or stops.
    fn close(&mut self) {}
}

/// Source over a fixed set of rows.
#[derive(Debug)]
pub struct MemorySource {
    schema: RowSchema,
    rows: Vec<Row>,
    /// When set, emit one row per interval and cycle through the rows
    /// forever.
    interval: Option<Duration>,
    /// Only emit rows matching parameters named after a field.
    filter_on_parameters: bool,
    active: Vec<Row>,
    pos: usize,
    next_emit: Option<Instant>,
}

impl MemorySource {
    pub fn new(schema: RowSchema, rows: Vec<Row>) -> Self {
        MemorySource {
            schema,
            rows,
            interval: None,
            filter_on_parameters: false,
            active: Vec::new(),
            pos: 0,
            next_emit: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_parameter_filter(mut self) -> Self {
        self.filter_on_parameters = true;
        self
    }
}

impl RowSource for MemorySource {
    fn open(&mut self, parameters: &Parameters) -> Result<()> {
        let filters: Vec<(usize, &String)> = if self.filter_on_parameters {
            parameters
                .iter()
                .filter_map(|(name, value)| self.schema.index_of(name).map(|idx| (idx, value)))
                .collect()
        } else {
            Vec::new()
        };

        self.active = self
            .rows
            .iter()
            .filter(|row| {
                filters.iter().all(|(idx, value)| {
                    row.get(*idx).is_some_and(|v| v.to_string() == **value)
                })
            })
            .cloned()
            .collect();
        self.pos = 0;
        debug!(rows = self.active.len(), filters = filters.len(), "opened memory source");
        Ok(())
    }

    fn poll_row(&mut self, timeout: Duration) -> Result<SourcePoll> {
        let interval = match self.interval {
            Some(interval) => interval,
            None => {
                if self.pos >= self.active.len() {
                    return Ok(SourcePoll::Exhausted);
                }
                self.pos += 1;
                return Ok(SourcePoll::Row(self.active[self.pos - 1].clone()));
            }
        };

        if self.active.is_empty() {
            thread::sleep(timeout);
            return Ok(SourcePoll::Idle);
        }

        let now = Instant::now();
        if let Some(next) = self.next_emit {
            if next > now {
                thread::sleep((next - now).min(timeout));
                if Instant::now() < next {
                    return Ok(SourcePoll::Idle);
                }
            }
        }
        self.next_emit = Some(Instant::now() + interval);

        let row = self.active[self.pos % self.active.len()].clone();
        self.pos += 1;
        Ok(SourcePoll::Row(row))
    }
}

/// Source reading from a bounded queue fed by a [`super::RowProducer`].
#[derive(Debug)]
pub struct QueueSource {
    queue: Arc<RowQueue>,
}

impl QueueSource {
    pub fn new(queue: Arc<RowQueue>) -> Self {
        QueueSource { queue }
    }
}

impl RowSource for QueueSource {
    fn open(&mut self, _parameters: &Parameters) -> Result<()> {
        Ok(())
    }

    fn poll_row(&mut self, timeout: Duration) -> Result<SourcePoll> {
        Ok(match self.queue.take_row_wait(timeout) {
            QueuePoll::Row(row) => SourcePoll::Row(row),
            QueuePoll::Empty => SourcePoll::Idle,
            QueuePoll::Finished => SourcePoll::Exhausted,
        })
    }

    fn close(&mut self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Field};

    fn schema() -> RowSchema {
        RowSchema::new([
            Field::new("region", DataType::String),
            Field::new("amount", DataType::Integer),
        ])
    }

    fn rows() -> Vec<Row> {
        vec![
            vec!["EU".into(), 1.into()],
            vec!["US".into(), 2.into()],
            vec!["EU".into(), 3.into()],
        ]
    }

    fn drain(source: &mut dyn RowSource) -> Vec<Row> {
        let mut out = Vec::new();
        loop {
            match source.poll_row(Duration::from_millis(10)).unwrap() {
                SourcePoll::Row(row) => out.push(row),
                SourcePoll::Idle => continue,
                SourcePoll::Exhausted => return out,
            }
        }
    }

    #[test]
    fn memory_source_emits_all_rows() {
        let mut source = MemorySource::new(schema(), rows());
        source.open(&Parameters::new()).unwrap();
        assert_eq!(rows(), drain(&mut source));
    }

    #[test]
    fn parameter_filter() {
        let mut source = MemorySource::new(schema(), rows()).with_parameter_filter();
        let mut params = Parameters::new();
        params.insert("region".to_string(), "EU".to_string());
        params.insert("unrelated".to_string(), "x".to_string());
        source.open(&params).unwrap();
        assert_eq!(2, drain(&mut source).len());
    }

    #[test]
    fn interval_source_cycles() {
        let mut source =
            MemorySource::new(schema(), rows()).with_interval(Duration::from_millis(1));
        source.open(&Parameters::new()).unwrap();
        let mut seen = Vec::new();
        while seen.len() < 5 {
            if let SourcePoll::Row(row) = source.poll_row(Duration::from_millis(10)).unwrap() {
                seen.push(row);
            }
        }
        assert_eq!(rows()[0], seen[3]);
    }
}
