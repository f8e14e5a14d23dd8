use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use svcql_error::{DbError, Result};

use super::RowProducer;
use crate::types::Row;

#[derive(Debug)]
struct QueueState {
    rows: VecDeque<Row>,
    /// Producer is done.
    finished: bool,
    /// Consumer is gone, further rows are rejected.
    closed: bool,
}

/// Bounded handoff between a producing thread and a graph's input step.
#[derive(Debug)]
pub struct RowQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// Outcome of taking a row from the queue.
#[derive(Debug, PartialEq)]
pub enum QueuePoll {
    Row(Row),
    /// Nothing arrived within the timeout.
    Empty,
    /// Producer finished and all rows were taken.
    Finished,
}

impl RowQueue {
    pub fn new(capacity: usize) -> Self {
        RowQueue {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                rows: VecDeque::new(),
                finished: false,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take_row_wait(&self, timeout: Duration) -> QueuePoll {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(row) = state.rows.pop_front() {
                self.not_full.notify_one();
                return QueuePoll::Row(row);
            }
            if state.finished {
                return QueuePoll::Finished;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return match state.rows.pop_front() {
                    Some(row) => {
                        self.not_full.notify_one();
                        QueuePoll::Row(row)
                    }
                    None if state.finished => QueuePoll::Finished,
                    None => QueuePoll::Empty,
                };
            }
        }
    }

    /// Reject any further rows and wake blocked producers.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.rows.clear();
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

impl RowProducer for RowQueue {
    fn put_row_wait(&self, row: Row, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(DbError::new("Row queue closed by consumer"));
            }
            if state.finished {
                return Err(DbError::new("Row queue already finished"));
            }
            if state.rows.len() < self.capacity {
                state.rows.push_back(row);
                self.not_empty.notify_one();
                return Ok(true);
            }
            if self.not_full.wait_until(&mut state, deadline).timed_out() {
                return Ok(false);
            }
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::types::ScalarValue;

    #[test]
    fn full_queue_times_out() {
        let queue = RowQueue::new(1);
        assert!(queue.put_row_wait(vec![1.into()], Duration::from_millis(10)).unwrap());
        assert!(!queue.put_row_wait(vec![2.into()], Duration::from_millis(10)).unwrap());
        assert_eq!(1, queue.len());
    }

    #[test]
    fn finish_drains_then_finishes() {
        let queue = RowQueue::new(4);
        queue.put_row_wait(vec![1.into()], Duration::from_millis(10)).unwrap();
        queue.finish();
        assert_eq!(
            QueuePoll::Row(vec![ScalarValue::Integer(1)]),
            queue.take_row_wait(Duration::from_millis(10))
        );
        assert_eq!(QueuePoll::Finished, queue.take_row_wait(Duration::from_millis(10)));
    }

    #[test]
    fn closed_queue_rejects() {
        let queue = RowQueue::new(4);
        queue.close();
        queue
            .put_row_wait(vec![1.into()], Duration::from_millis(10))
            .unwrap_err();
    }

    #[test]
    fn blocked_producer_resumes() {
        let queue = Arc::new(RowQueue::new(1));
        queue.put_row_wait(vec![1.into()], Duration::from_millis(10)).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.put_row_wait(vec![2.into()], Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            queue.take_row_wait(Duration::from_millis(10)),
            QueuePoll::Row(_)
        ));
        assert!(producer.join().unwrap().unwrap());
        assert_eq!(1, queue.len());
    }
}
