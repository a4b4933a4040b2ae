//! The crate's only background thread: a one-shot reset timer.
//!
//! Degrade breakers schedule their re-close here. The thread is spawned on
//! first use and parks on a condvar until the nearest deadline.

use crate::clock::now_ms;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

struct ScheduledTask {
    deadline_ms: u64,
    seq: u64,
    job: Option<Box<dyn FnOnce() + Send>>,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the earliest deadline first.
        (other.deadline_ms, other.seq).cmp(&(self.deadline_ms, self.seq))
    }
}

struct TimerInner {
    queue: Mutex<BinaryHeap<ScheduledTask>>,
    wakeup: Condvar,
    next_seq: Mutex<u64>,
}

static TIMER: OnceLock<Arc<TimerInner>> = OnceLock::new();

fn timer() -> &'static Arc<TimerInner> {
    TIMER.get_or_init(|| {
        let inner = Arc::new(TimerInner {
            queue: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            next_seq: Mutex::new(0),
        });
        let worker = Arc::clone(&inner);
        std::thread::Builder::new()
            .name("tollgate-reset-timer".into())
            .spawn(move || run(worker))
            .ok();
        inner
    })
}

fn run(inner: Arc<TimerInner>) {
    let mut queue = inner.queue.lock();
    loop {
        let now = now_ms();
        let ready = queue
            .peek()
            .map(|task| task.deadline_ms.saturating_sub(now));
        match ready {
            Some(0) => {
                if let Some(mut task) = queue.pop() {
                    let job = task.job.take();
                    MutexGuard::unlocked(&mut queue, || {
                        if let Some(job) = job {
                            job();
                        }
                    });
                }
            }
            Some(remaining) => {
                inner
                    .wakeup
                    .wait_for(&mut queue, Duration::from_millis(remaining));
            }
            None => {
                inner.wakeup.wait(&mut queue);
            }
        }
    }
}

/// Run `job` once, `delay_ms` from now.
pub(crate) fn schedule_after(delay_ms: u64, job: impl FnOnce() + Send + 'static) {
    let inner = timer();
    let seq = {
        let mut next = inner.next_seq.lock();
        *next += 1;
        *next
    };
    inner.queue.lock().push(ScheduledTask {
        deadline_ms: now_ms() + delay_ms,
        seq,
        job: Some(Box::new(job)),
    });
    inner.wakeup.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn jobs_fire_after_their_delay() {
        static FIRED: AtomicU32 = AtomicU32::new(0);
        let begun = now_ms();
        schedule_after(30, || {
            FIRED.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);

        while FIRED.load(Ordering::SeqCst) == 0 && now_ms() - begun < 2000 {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert!(now_ms() - begun >= 30);
    }

    #[test]
    fn earlier_deadlines_run_first() {
        use std::sync::Mutex as StdMutex;
        static ORDER: StdMutex<Vec<&'static str>> = StdMutex::new(Vec::new());

        schedule_after(80, || ORDER.lock().unwrap().push("late"));
        schedule_after(20, || ORDER.lock().unwrap().push("early"));

        std::thread::sleep(Duration::from_millis(300));
        let order = ORDER.lock().unwrap();
        let early = order.iter().position(|s| *s == "early");
        let late = order.iter().position(|s| *s == "late");
        assert!(early < late, "expected early before late, got {order:?}");
    }
}
