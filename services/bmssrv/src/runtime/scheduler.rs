//! Cycle planning
//!
//! Every cycle runs each HIGH read task once and the next `low_per_cycle` LOW
//! read tasks in round-robin order. Write tasks are offered every cycle, HIGH
//! before LOW; the bridge skips those without pending values.

use crate::protocols::modbus::task::{Priority, Task};

/// Task position on a bridge: device index and task index within the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskRef {
    pub device: usize,
    pub task: usize,
}

/// Tasks to run in one cycle, in execution order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CyclePlan {
    pub reads: Vec<TaskRef>,
    pub writes: Vec<TaskRef>,
}

#[derive(Debug, Default)]
pub struct TaskScheduler {
    high_reads: Vec<TaskRef>,
    low_reads: Vec<TaskRef>,
    high_writes: Vec<TaskRef>,
    low_writes: Vec<TaskRef>,
    low_per_cycle: usize,
    cursor: usize,
}

impl TaskScheduler {
    pub fn new(low_per_cycle: usize) -> Self {
        Self {
            low_per_cycle: low_per_cycle.max(1),
            ..Self::default()
        }
    }

    /// Register the tasks of device `device`
    pub fn add_device(&mut self, device: usize, tasks: &[Task]) {
        for (index, task) in tasks.iter().enumerate() {
            let task_ref = TaskRef {
                device,
                task: index,
            };
            let list = match (task.is_write(), task.priority()) {
                (false, Priority::High) => &mut self.high_reads,
                (false, Priority::Low) => &mut self.low_reads,
                (true, Priority::High) => &mut self.high_writes,
                (true, Priority::Low) => &mut self.low_writes,
            };
            list.push(task_ref);
        }
    }

    /// Cycles needed to run every LOW read task at least once
    pub fn low_rotation_cycles(&self) -> usize {
        self.low_reads.len().div_ceil(self.low_per_cycle)
    }

    /// Plan the next cycle and advance the LOW cursor
    pub fn plan_cycle(&mut self) -> CyclePlan {
        let mut reads = self.high_reads.clone();

        let low = self.low_reads.len();
        if low > 0 {
            let take = self.low_per_cycle.min(low);
            for i in 0..take {
                reads.push(self.low_reads[(self.cursor + i) % low]);
            }
            self.cursor = (self.cursor + take) % low;
        }

        let mut writes = self.high_writes.clone();
        writes.extend_from_slice(&self.low_writes);

        CyclePlan { reads, writes }
    }
}
