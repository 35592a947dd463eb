use std::collections::VecDeque;

/// One picked slot plus a FIFO of waiting entries.
///
/// At most one entry is picked at a time; the next is only handed out after
/// [`drop_picked_task`](Self::drop_picked_task). The engine queues group ids
/// (the group owns the chunked task itself), tests queue tasks directly.
#[derive(Debug)]
pub struct TaskQueueManager<T> {
    picked: Option<T>,
    waiting: VecDeque<T>,
}

impl<T> Default for TaskQueueManager<T> {
    fn default() -> Self {
        Self {
            picked: None,
            waiting: VecDeque::new(),
        }
    }
}

impl<T> TaskQueueManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_task(&mut self, task: T) {
        self.waiting.push_back(task);
    }

    /// Pick the oldest waiting entry if nothing is picked.
    pub fn pop_next_task(&mut self) -> Option<&mut T> {
        if self.picked.is_some() {
            return None;
        }
        self.picked = Some(self.waiting.pop_front()?);
        self.picked.as_mut()
    }

    /// Clear the picked slot, returning what was in it.
    pub fn drop_picked_task(&mut self) -> Option<T> {
        self.picked.take()
    }

    pub fn picked(&self) -> Option<&T> {
        self.picked.as_ref()
    }

    pub fn picked_mut(&mut self) -> Option<&mut T> {
        self.picked.as_mut()
    }

    /// Keep only the waiting entries matching `keep`. The picked slot is untouched.
    pub fn retain_waiting(&mut self, keep: impl FnMut(&T) -> bool) {
        self.waiting.retain(keep);
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Picked plus waiting.
    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.picked.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
