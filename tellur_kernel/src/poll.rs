//! Poll readiness plumbing shared by every pollable object.

use alloc::vec::Vec;

use bitflags::bitflags;

use core::task::Waker;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ready: u16 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const HUP = 1 << 2;
        const ERROR = 1 << 3;
    }
}

/// A poll subscription: which events the subscriber cares about, whether it
/// wants to be parked until one fires, and how to wake it.
pub struct PollMsg {
    pub events: Ready,
    pub dowait: bool,
    pub waker: Option<Waker>,
}

/// The subscriber list a pollable object keeps while it has nothing to
/// report.
#[derive(Default)]
pub struct Pollers {
    waiting: Vec<(Ready, Waker)>,
}

impl Pollers {
    pub fn new() -> Pollers {
        Pollers::default()
    }

    pub fn add(&mut self, pm: &PollMsg) {
        if let Some(waker) = &pm.waker {
            self.waiting.push((pm.events, waker.clone()));
        }
    }

    /// Wake every subscriber interested in any of `events`. Subscriptions
    /// are one-shot: woken entries leave the list.
    pub fn wake_ready(&mut self, events: Ready) -> usize {
        let mut woken = 0;
        self.waiting.retain(|(want, waker)| {
            if want.intersects(events) {
                waker.wake_by_ref();
                woken += 1;
                false
            } else {
                true
            }
        });
        woken
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use futures_util::task::ArcWake;

    pub struct CountingWaker(pub AtomicUsize);

    impl ArcWake for CountingWaker {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn wake_is_selective_and_one_shot() {
        let reader = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let writer = Arc::new(CountingWaker(AtomicUsize::new(0)));

        let mut pollers = Pollers::new();
        pollers.add(&PollMsg {
            events: Ready::READ,
            dowait: true,
            waker: Some(futures_util::task::waker(reader.clone())),
        });
        pollers.add(&PollMsg {
            events: Ready::WRITE,
            dowait: true,
            waker: Some(futures_util::task::waker(writer.clone())),
        });

        assert_eq!(pollers.wake_ready(Ready::READ), 1);
        assert_eq!(reader.0.load(Ordering::SeqCst), 1);
        assert_eq!(writer.0.load(Ordering::SeqCst), 0);
        // one-shot: a second readiness does not wake the reader again
        assert_eq!(pollers.wake_ready(Ready::READ), 0);
        assert_eq!(pollers.len(), 1);
    }
}
