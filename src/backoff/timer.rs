use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// spawned, but not running yet
    Scheduled,
    Running,
    /// interrupted as done, finalizing statistics
    Cancelling,
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Interrupt {
    /// restart the current round with the next iteration's backoff
    Postpone,
    /// the timer is no longer needed
    Done,
}

/// The current backoff round of a request timer
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Round {
    pub started: Instant,
    pub expire: Duration,
    /// REQUESTs for the same key received from other members since the last local REQUEST
    pub duplicates: u32,
}

/// The pool's side of a timer task
pub struct TimerControl {
    interrupt: watch::Sender<Option<Interrupt>>,
    state: watch::Receiver<TaskState>,
    round: Arc<Mutex<Option<Round>>>,
}

/// The task's side of a timer
pub struct TimerTask {
    interrupts: watch::Receiver<Option<Interrupt>>,
    state: watch::Sender<TaskState>,
    round: Arc<Mutex<Option<Round>>>,
}

pub fn new_timer() -> (TimerControl, TimerTask) {
    let (interrupt_send, interrupt_recv) = watch::channel(None);
    let (state_send, state_recv) = watch::channel(TaskState::Scheduled);
    let round = Arc::new(Mutex::new(None));

    (
        TimerControl {
            interrupt: interrupt_send,
            state: state_recv,
            round: round.clone(),
        },
        TimerTask {
            interrupts: interrupt_recv,
            state: state_send,
            round,
        },
    )
}

impl TimerControl {
    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Interrupts the task once it has started running, so that an interrupt is never
    ///  delivered to a task that did not reach its sleep yet. A task that is already finishing
    ///  is left alone.
    pub async fn interrupt(&self, interrupt: Interrupt) {
        let mut state = self.state.clone();
        let is_finishing = match state.wait_for(|s| *s != TaskState::Scheduled).await {
            Ok(s) => matches!(*s, TaskState::Cancelling | TaskState::Done),
            // the task terminated
            Err(_) => true,
        };
        if !is_finishing {
            self.interrupt.send_replace(Some(interrupt));
        }
    }

    pub async fn round(&self) -> Option<Round> {
        *self.round.lock().await
    }

    pub async fn count_duplicate(&self) -> Option<u32> {
        let mut round = self.round.lock().await;
        round.as_mut().map(|r| {
            r.duplicates += 1;
            r.duplicates
        })
    }
}

impl TimerTask {
    pub fn set_state(&self, state: TaskState) {
        self.state.send_replace(state);
    }

    /// Starts a new round, keeping duplicates that were counted since the last REQUEST
    pub async fn start_round(&self, expire: Duration) {
        let mut round = self.round.lock().await;
        let duplicates = round.map(|r| r.duplicates).unwrap_or(0);
        *round = Some(Round {
            started: Instant::now(),
            expire,
            duplicates,
        });
    }

    /// returns the number of duplicates counted since the previous call
    pub async fn take_duplicates(&self) -> u32 {
        let mut round = self.round.lock().await;
        match round.as_mut() {
            Some(r) => std::mem::take(&mut r.duplicates),
            None => 0,
        }
    }

    /// Waits for the next interrupt. This is cancellation safe, i.e. it can be used in a
    ///  `select!` without losing interrupts.
    pub async fn interrupted(&mut self) -> Interrupt {
        loop {
            if self.interrupts.changed().await.is_err() {
                // the pool dropped its handle
                return Interrupt::Done;
            }
            if let Some(interrupt) = *self.interrupts.borrow_and_update() {
                return interrupt;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_waits_for_task_to_start() {
        let (control, mut task) = new_timer();
        assert_eq!(control.state(), TaskState::Scheduled);

        let interrupter = tokio::spawn(async move {
            control.interrupt(Interrupt::Done).await;
            control
        });

        time::sleep(Duration::from_millis(100)).await;
        assert!(!interrupter.is_finished());

        task.set_state(TaskState::Running);
        let control = interrupter.await.unwrap();
        assert_eq!(task.interrupted().await, Interrupt::Done);
        assert_eq!(control.state(), TaskState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_postpone_is_seen_once() {
        let (control, mut task) = new_timer();
        task.set_state(TaskState::Running);

        control.interrupt(Interrupt::Postpone).await;
        assert_eq!(task.interrupted().await, Interrupt::Postpone);

        let second = time::timeout(Duration::from_secs(1), task.interrupted()).await;
        assert!(second.is_err());

        control.interrupt(Interrupt::Done).await;
        assert_eq!(task.interrupted().await, Interrupt::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finishing_task_is_not_interrupted() {
        let (control, mut task) = new_timer();
        task.set_state(TaskState::Cancelling);
        control.interrupt(Interrupt::Postpone).await;
        task.set_state(TaskState::Done);
        control.interrupt(Interrupt::Postpone).await;
        assert_eq!(control.state(), TaskState::Done);

        let interrupted = time::timeout(Duration::from_secs(1), task.interrupted()).await;
        assert!(interrupted.is_err());

        drop(task);
        control.interrupt(Interrupt::Done).await;
    }

    #[tokio::test]
    async fn test_dropped_control_is_done() {
        let (control, mut task) = new_timer();
        drop(control);
        assert_eq!(task.interrupted().await, Interrupt::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_bookkeeping() {
        let (control, task) = new_timer();
        assert_eq!(control.count_duplicate().await, None);

        task.start_round(Duration::from_secs(2)).await;
        assert_eq!(control.count_duplicate().await, Some(1));
        time::sleep(Duration::from_millis(300)).await;
        task.start_round(Duration::from_secs(4)).await;
        assert_eq!(control.count_duplicate().await, Some(2));

        let round = control.round().await.unwrap();
        assert_eq!(round.expire, Duration::from_secs(4));
        assert_eq!(round.started, Instant::now());

        assert_eq!(task.take_duplicates().await, 2);
        assert_eq!(task.take_duplicates().await, 0);
    }
}
