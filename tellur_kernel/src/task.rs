//! Cooperative task runtime.
//!
//! Kernel daemons are futures driven by a simple executor; anything that
//! needs to wait parks on a waker and is re-queued by whoever produces the
//! event (usually the interrupt dispatch). The executor owns its tasks, so
//! there is no separate task table to keep in sync.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use core::task::{Context, Poll, Waker};

use crossbeam_queue::ArrayQueue;
use futures_util::task::ArcWake;

/// Number of scheduler workers the system is configured for (`1 + aplim`).
/// Published before any AP is released.
static WIDTH: AtomicUsize = AtomicUsize::new(1);

pub fn set_width(n: usize) {
    assert!(n >= 1);
    WIDTH.store(n, Ordering::SeqCst);
}

pub fn width() -> usize {
    WIDTH.load(Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct Task {
    id: TaskId,
    future: Pin<Box<dyn Future<Output = ()>>>,
}

impl Task {
    pub fn new(future: impl Future<Output = ()> + 'static) -> Task {
        Task {
            id: TaskId::new(),
            future: Box::pin(future),
        }
    }

    fn poll(&mut self, cx: &mut Context) -> Poll<()> {
        self.future.as_mut().poll(cx)
    }
}

pub struct Executor {
    tasks: BTreeMap<TaskId, Task>,
    ready: Arc<ArrayQueue<TaskId>>,
    waker_cache: BTreeMap<TaskId, Waker>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Executor {
        Executor {
            tasks: BTreeMap::new(),
            ready: Arc::new(ArrayQueue::new(256)),
            waker_cache: BTreeMap::new(),
        }
    }

    pub fn spawn(&mut self, task: Task) {
        let id = task.id;
        if self.tasks.insert(id, task).is_some() {
            panic!("duplicate task id");
        }
        self.ready.push(id).expect("ready queue full");
    }

    /// Poll everything that is currently runnable, once.
    pub fn run_until_idle(&mut self) {
        while let Some(id) = self.ready.pop() {
            let task = match self.tasks.get_mut(&id) {
                Some(task) => task,
                // woken after completion; stale queue entry
                None => continue,
            };
            let waker = self
                .waker_cache
                .entry(id)
                .or_insert_with(|| TaskWaker::waker(id, self.ready.clone()));
            let mut cx = Context::from_waker(waker);
            if let Poll::Ready(()) = task.poll(&mut cx) {
                self.tasks.remove(&id);
                self.waker_cache.remove(&id);
            }
        }
    }

    /// Number of tasks that have not completed yet.
    pub fn live_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Drive tasks forever, halting the CPU while nothing is runnable.
    pub fn run(&mut self) -> ! {
        loop {
            self.run_until_idle();
            self.sleep_if_idle();
        }
    }

    fn sleep_if_idle(&self) {
        amd64::interrupts::disable();
        if self.ready.is_empty() {
            // wakes on the next interrupt, which may queue a task
            amd64::interrupts::enable_and_hlt();
        } else {
            amd64::interrupts::enable();
        }
    }
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<ArrayQueue<TaskId>>,
}

impl TaskWaker {
    fn waker(id: TaskId, ready: Arc<ArrayQueue<TaskId>>) -> Waker {
        futures_util::task::waker(Arc::new(TaskWaker { id, ready }))
    }
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        // dropping the wake on a full queue is safe: the task is already
        // queued if the queue is full of distinct ids
        let _ = arc_self.ready.push(arc_self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::sync::atomic::AtomicBool;

    #[test]
    fn tasks_run_to_completion() {
        static DONE: AtomicBool = AtomicBool::new(false);
        let mut ex = Executor::new();
        ex.spawn(Task::new(async {
            DONE.store(true, Ordering::SeqCst);
        }));
        ex.run_until_idle();
        assert!(DONE.load(Ordering::SeqCst));
        assert_eq!(ex.live_tasks(), 0);
    }

    #[test]
    fn width_is_published() {
        set_width(8);
        assert_eq!(width(), 8);
        set_width(1);
    }
}
