use std::mem;
use std::sync::Mutex;

/// A deferred unit of work enqueued by an I/O completion.
pub type Task = Box<dyn FnOnce() + Send>;

/// Queue of deferred work, drained atomically with respect to the update
/// loop that owns it.
///
/// `steal` takes the whole queue under a short-held lock; the caller
/// processes the stolen entries outside it, in enqueue order. The lock
/// protects only the queue itself, never any state the entries touch;
/// anything enqueued while stolen entries run waits for the next steal.
///
/// The server and cloud connections use typed entries to defer follow-up
/// work out of their event-draining loops; `TaskQueue<Task>` additionally
/// invokes plain callables through `run`.
pub struct TaskQueue<T> {
    tasks: Mutex<Vec<T>>,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, task: T) {
        self.tasks.lock().unwrap().push(task);
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    /// Take every entry enqueued before this call.
    pub fn steal(&self) -> Vec<T> {
        let mut tasks = self.tasks.lock().unwrap();
        mem::replace(&mut *tasks, Vec::new())
    }
}

impl TaskQueue<Task> {
    /// Invoke every task enqueued before this call; returns how many ran.
    pub fn run(&self) -> usize {
        let stolen = self.steal();
        let count = stolen.len();
        for task in stolen {
            task();
        }
        count
    }
}
