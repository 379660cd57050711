//! Transaction timers.
//!
//! Every transaction owns a [TimerSet] with one slot per [TimerRole]. Timers are executed by a
//! shared [TimerScheduler], usually the [SchedulingClock] thread. An expired timer does not act
//! directly: it posts its [TimerToken] back to the owning transaction, which accepts the token
//! only if the slot was not restarted or cancelled in the meantime.
use core::{cmp::Ordering, time::Duration};
use std::{
    collections::BinaryHeap,
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Instant,
};

use smallvec::SmallVec;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TimerRole {
    Inactivity,
    PositiveAck,
    Check,
    Nak,
    NakRecompute,
    KeepAlive,
}

impl TimerRole {
    pub const ALL: [TimerRole; 6] = [
        TimerRole::Inactivity,
        TimerRole::PositiveAck,
        TimerRole::Check,
        TimerRole::Nak,
        TimerRole::NakRecompute,
        TimerRole::KeepAlive,
    ];

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Generation tagged handle of a started timer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub role: TimerRole,
    pub epoch: u64,
}

pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Receives the tokens of expired timers.
pub type TimerSink = Arc<dyn Fn(TimerToken) + Send + Sync>;

pub trait TimerScheduler: Send + Sync {
    /// Runs the task once the delay has elapsed. Scheduled tasks can not be revoked.
    fn schedule(&self, delay: Duration, task: TimerTask);
}

#[derive(Debug, Default, Copy, Clone)]
struct TimerSlot {
    epoch: u64,
    armed: bool,
    periodic: bool,
    period: Duration,
}

/// Timers which were stopped by a suspension or a freeze and are restarted on resumption.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PausedTimers {
    timers: SmallVec<[(TimerRole, Duration, bool); 6]>,
}

impl PausedTimers {
    pub fn insert(&mut self, role: TimerRole, period: Duration, periodic: bool) {
        self.remove(role);
        self.timers.push((role, period, periodic));
    }

    pub fn remove(&mut self, role: TimerRole) {
        self.timers.retain(|(paused, _, _)| *paused != role);
    }

    pub fn contains(&self, role: TimerRole) -> bool {
        self.timers.iter().any(|(paused, _, _)| *paused == role)
    }

    pub fn roles(&self) -> impl Iterator<Item = TimerRole> + '_ {
        self.timers.iter().map(|(role, _, _)| *role)
    }
}

pub struct TimerSet {
    slots: [TimerSlot; 6],
    scheduler: Arc<dyn TimerScheduler>,
    sink: TimerSink,
}

impl core::fmt::Debug for TimerSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimerSet").field("slots", &self.slots).finish()
    }
}

impl TimerSet {
    pub fn new(scheduler: Arc<dyn TimerScheduler>, sink: TimerSink) -> Self {
        Self {
            slots: Default::default(),
            scheduler,
            sink,
        }
    }

    /// Starts a one-shot timer, replacing a running timer of the same role.
    pub fn start(&mut self, role: TimerRole, period: Duration) {
        self.arm(role, period, false);
    }

    /// Starts a timer which fires every `period` until it is cancelled.
    pub fn start_periodic(&mut self, role: TimerRole, period: Duration) {
        self.arm(role, period, true);
    }

    fn arm(&mut self, role: TimerRole, period: Duration, periodic: bool) {
        let slot = &mut self.slots[role.index()];
        slot.epoch += 1;
        slot.armed = true;
        slot.periodic = periodic;
        slot.period = period;
        let epoch = slot.epoch;
        log::trace!("starting {:?} timer with period {:?}", role, period);
        self.schedule(TimerToken { role, epoch });
    }

    fn schedule(&self, token: TimerToken) {
        let sink = self.sink.clone();
        let period = self.slots[token.role.index()].period;
        self.scheduler
            .schedule(period, Box::new(move || sink(token)));
    }

    /// Restarts an armed timer with its current period.
    pub fn restart(&mut self, role: TimerRole) {
        let slot = self.slots[role.index()];
        if slot.armed {
            self.arm(role, slot.period, slot.periodic);
        }
    }

    pub fn cancel(&mut self, role: TimerRole) {
        let slot = &mut self.slots[role.index()];
        if slot.armed {
            log::trace!("cancelling {:?} timer", role);
        }
        slot.epoch += 1;
        slot.armed = false;
    }

    pub fn cancel_all(&mut self) {
        for role in TimerRole::ALL {
            self.cancel(role);
        }
    }

    pub fn is_armed(&self, role: TimerRole) -> bool {
        self.slots[role.index()].armed
    }

    /// Validates an expired token. Stale tokens are rejected. Accepting the token of a one-shot
    /// timer disarms it, periodic timers are scheduled again.
    pub fn accept(&mut self, token: TimerToken) -> bool {
        let slot = &mut self.slots[token.role.index()];
        if !slot.armed || slot.epoch != token.epoch {
            log::trace!("dropping stale {:?} timer token", token.role);
            return false;
        }
        if !slot.periodic {
            slot.armed = false;
            return true;
        }
        self.schedule(token);
        true
    }

    /// Stops every armed timer and returns them for a later [Self::resume].
    pub fn pause_all(&mut self) -> PausedTimers {
        let mut paused = PausedTimers::default();
        for role in TimerRole::ALL {
            let slot = self.slots[role.index()];
            if slot.armed {
                paused.insert(role, slot.period, slot.periodic);
            }
            self.cancel(role);
        }
        paused
    }

    /// Restarts the paused timers with their full period.
    pub fn resume(&mut self, paused: PausedTimers) {
        for (role, period, periodic) in paused.timers {
            self.arm(role, period, periodic);
        }
    }
}

struct ScheduledTask {
    deadline: Instant,
    seq: u64,
    task: TimerTask,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    // Reversed so that the binary heap yields the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum ClockMsg {
    Schedule(Instant, TimerTask),
    Shutdown,
}

/// Shared clock thread which runs timer tasks in deadline order.
pub struct SchedulingClock {
    sender: mpsc::Sender<ClockMsg>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulingClock {
    pub fn new() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("cfdp-clock".into())
            .spawn(move || Self::run(receiver))?;
        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn run(receiver: mpsc::Receiver<ClockMsg>) {
        let mut queue = BinaryHeap::new();
        let mut seq = 0;
        loop {
            let now = Instant::now();
            while queue
                .peek()
                .is_some_and(|next: &ScheduledTask| next.deadline <= now)
            {
                if let Some(next) = queue.pop() {
                    (next.task)();
                }
            }
            let msg = match queue.peek() {
                Some(next) => {
                    match receiver.recv_timeout(next.deadline.saturating_duration_since(now)) {
                        Ok(msg) => msg,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match receiver.recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
            };
            match msg {
                ClockMsg::Schedule(deadline, task) => {
                    seq += 1;
                    queue.push(ScheduledTask {
                        deadline,
                        seq,
                        task,
                    });
                }
                ClockMsg::Shutdown => break,
            }
        }
        log::debug!("scheduling clock stopped with {} pending tasks", queue.len());
    }

    /// Stops the clock thread. Pending tasks are dropped without running.
    pub fn shutdown(&self) {
        let _ = self.sender.send(ClockMsg::Shutdown);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("scheduling clock thread panicked");
            }
        }
    }
}

impl TimerScheduler for SchedulingClock {
    fn schedule(&self, delay: Duration, task: TimerTask) {
        if self
            .sender
            .send(ClockMsg::Schedule(Instant::now() + delay, task))
            .is_err()
        {
            log::warn!("scheduling clock is stopped, dropping timer task");
        }
    }
}

impl Drop for SchedulingClock {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Scheduler with a virtual time base which only advances when told so.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    seq: u64,
    tasks: Vec<(Duration, u64, TimerTask)>,
}

impl ManualScheduler {
    /// Advances the virtual time and runs all tasks which became due, in deadline order.
    /// Returns the number of executed tasks.
    pub fn advance(&self, by: Duration) -> usize {
        let due = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.now += by;
            let now = state.now;
            let (mut due, pending): (Vec<_>, Vec<_>) = state
                .tasks
                .drain(..)
                .partition(|(deadline, _, _)| *deadline <= now);
            state.tasks = pending;
            due.sort_by_key(|(deadline, seq, _)| (*deadline, *seq));
            due
        };
        let count = due.len();
        for (_, _, task) in due {
            task();
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tasks
            .len()
    }
}

impl TimerScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.seq += 1;
        let entry = (state.now + delay, state.seq, task);
        state.tasks.push(entry);
    }
}
