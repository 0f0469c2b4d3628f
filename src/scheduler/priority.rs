//! Task priorities and the priority-ordered queue buffer.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::scheduler::TaskFn;
use crate::sync::QueueOrder;

/// Relative urgency of a scheduled task.
///
/// On-demand work (a caller is blocked on the result) runs at `High`;
/// speculative or housekeeping work runs at `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// A closure plus its priority, as handed to the queue.
pub(crate) struct ScheduledTask {
    pub(crate) priority: Priority,
    pub(crate) run: TaskFn,
}

/// Heap entry: priority first, then arrival order within a priority.
struct HeapEntry {
    priority: Priority,
    seq: u64,
    run: TaskFn,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins; earlier sequence wins within one.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Queue buffer dequeuing by `(priority desc, sequence asc)`.
///
/// The sequence counter is assigned at enqueue time, which is what makes
/// equal-priority dispatch FIFO.
pub(crate) struct PriorityOrder {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

impl Default for PriorityOrder {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }
}

impl QueueOrder<ScheduledTask> for PriorityOrder {
    fn enqueue(&mut self, item: ScheduledTask) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry {
            priority: item.priority,
            seq,
            run: item.run,
        });
    }

    fn dequeue(&mut self) -> Option<ScheduledTask> {
        self.heap.pop().map(|entry| ScheduledTask {
            priority: entry.priority,
            run: entry.run,
        })
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(priority: Priority, tag: u32, log: &std::sync::Arc<parking_lot::Mutex<Vec<u32>>>) -> ScheduledTask {
        let log = std::sync::Arc::clone(log);
        ScheduledTask {
            priority,
            run: Box::new(move || log.lock().push(tag)),
        }
    }

    fn drain_tags(order: &mut PriorityOrder, log: &std::sync::Arc<parking_lot::Mutex<Vec<u32>>>) -> Vec<u32> {
        while let Some(t) = order.dequeue() {
            (t.run)();
        }
        log.lock().clone()
    }

    #[test]
    fn priority_enum_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn higher_priority_dequeued_first() {
        let log = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut order = PriorityOrder::default();
        order.enqueue(task(Priority::Low, 3, &log));
        order.enqueue(task(Priority::High, 1, &log));
        order.enqueue(task(Priority::Normal, 2, &log));

        assert_eq!(drain_tags(&mut order, &log), vec![1, 2, 3]);
    }

    #[test]
    fn fifo_within_equal_priority() {
        let log = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut order = PriorityOrder::default();
        for tag in 1..=5 {
            order.enqueue(task(Priority::Normal, tag, &log));
        }

        assert_eq!(drain_tags(&mut order, &log), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn mixed_priorities_keep_arrival_order_per_level() {
        let log = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut order = PriorityOrder::default();
        order.enqueue(task(Priority::Normal, 10, &log));
        order.enqueue(task(Priority::High, 1, &log));
        order.enqueue(task(Priority::Normal, 11, &log));
        order.enqueue(task(Priority::High, 2, &log));

        assert_eq!(drain_tags(&mut order, &log), vec![1, 2, 10, 11]);
    }

    #[test]
    fn clear_empties_buffer() {
        let log = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut order = PriorityOrder::default();
        order.enqueue(task(Priority::Normal, 1, &log));
        order.enqueue(task(Priority::High, 2, &log));
        assert_eq!(order.len(), 2);

        order.clear();
        assert_eq!(order.len(), 0);
        assert!(order.dequeue().is_none());
    }
}
