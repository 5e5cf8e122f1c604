// (C) 2020 Brandon Lewis
//
// The cooperative task executor.
//
// Single-threaded and deterministic: a FIFO ready queue, waiter lists
// that preserve insertion order, and a virtual clock that only advances
// when the ready queue is empty. Tasks suspend by parking under an
// explicit key; the event that satisfies the key wakes every task
// parked under it.
//
// The executor owns the bookkeeping (task, scope, channel, timer and
// select tables). Actually polling a task re-enters the interpreter and
// therefore lives in the VM; see vm.rs.

use std::collections::{HashMap, VecDeque};

use log::trace;

use crate::error::{invalid_handle, Panic, PanicKind, Result};
use crate::heap::Heap;
use crate::mir::FuncId;
use crate::types::TypeId;
use crate::value::Value;

pub type TaskId = u64;
pub type ChannelId = u64;
pub type ScopeId = u64;
pub type TimerId = u64;
pub type SelectId = u64;

// The rendezvous identifiers tasks suspend on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ParkKey {
    Join(TaskId),
    ChanSend(ChannelId),
    ChanRecv(ChannelId),
    Select(SelectId),
    Timer(TimerId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Ready,
    Running,
    Waiting,
    Done,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    User,
    Checkpoint,
    Sleep,
    Timeout,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResultKind {
    Success,
    Cancelled,
}

// How a parked channel operation learns its outcome when it resumes.
#[derive(Clone, Debug, PartialEq)]
pub enum Resume {
    None,
    ChanSendAck,
    ChanSendClosed,
    ChanRecvValue(Value),
    ChanRecvClosed,
}

#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: Status,
    pub poll_fn: FuncId,
    // Captured state, owned by the task until completion.
    pub state: Value,
    // Valid once Done; owned by the task until drained.
    pub result: Value,
    pub result_kind: ResultKind,
    pub cancelled: bool,
    pub resume: Resume,
    // A value staged by a parked send, owned here until a receiver
    // takes it or the close handler drops it.
    pub staged: Option<Value>,
    pub park: Option<ParkKey>,
    // Checkpoint tasks yield exactly once.
    pub polled_once: bool,
    // Sleep / Timeout: virtual-clock deadline and the armed timer.
    pub deadline: u64,
    pub timer: Option<TimerId>,
    // Timeout kind: the task being raced and the type of the Cancelled
    // variant to produce.
    pub timeout_target: TaskId,
    pub result_ty: TypeId,
    // Timeout instruction: the helper task cached on the current task.
    pub timeout_task: TaskId,
    pub select: Option<SelectState>,
}

// Subscriptions and per-arm timers of a parked select, preserved across
// park/wake cycles so timers survive and waiters can be cleared.
#[derive(Debug)]
pub struct SelectState {
    pub id: SelectId,
    pub subs: Vec<ParkKey>,
    pub timers: HashMap<usize, TimerId>,
}

#[derive(Debug)]
pub struct Scope {
    pub id: ScopeId,
    pub owner: TaskId,
    pub failfast: bool,
    pub fired: bool,
    pub children: Vec<TaskId>,
}

#[derive(Debug)]
pub struct Channel {
    pub id: ChannelId,
    pub cap: usize,
    pub queue: VecDeque<Value>,
    pub closed: bool,
}

#[derive(Debug)]
pub struct Timer {
    pub id: TimerId,
    pub deadline: u64,
    pub fired: bool,
    // Woken when the timer fires, in addition to the Timer park key.
    pub task: TaskId,
}

pub enum SendOutcome {
    Sent,
    // The value comes back to the caller, who decides how to fail.
    Closed(Value),
    Full(Value),
}

pub enum RecvOutcome {
    Value(Value),
    Closed,
    Empty,
}

pub struct Executor {
    tasks: HashMap<TaskId, Task>,
    ready: VecDeque<TaskId>,
    parked: HashMap<ParkKey, Vec<TaskId>>,
    scopes: HashMap<ScopeId, Scope>,
    channels: HashMap<ChannelId, Channel>,
    timers: Vec<Timer>,
    current: TaskId,
    clock: u64,
    next_task: TaskId,
    next_chan: ChannelId,
    next_scope: ScopeId,
    next_timer: TimerId,
    next_select: SelectId,
}

impl Executor {
    pub fn new() -> Executor {
        Executor {
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            parked: HashMap::new(),
            scopes: HashMap::new(),
            channels: HashMap::new(),
            timers: Vec::new(),
            current: 0,
            clock: 0,
            next_task: 1,
            next_chan: 1,
            next_scope: 1,
            next_timer: 1,
            next_select: 1,
        }
    }

    // ---- tasks ----

    fn new_task(&mut self, kind: TaskKind) -> TaskId {
        let id = self.next_task;
        self.next_task += 1;
        self.tasks.insert(
            id,
            Task {
                id,
                kind,
                status: Status::Ready,
                poll_fn: 0,
                state: Value::Nothing,
                result: Value::Nothing,
                result_kind: ResultKind::Success,
                cancelled: false,
                resume: Resume::None,
                staged: None,
                park: None,
                polled_once: false,
                deadline: 0,
                timer: None,
                timeout_target: 0,
                result_ty: 0,
                timeout_task: 0,
                select: None,
            },
        );
        self.ready.push_back(id);
        id
    }

    pub fn spawn_user(&mut self, poll_fn: FuncId, state: Value) -> TaskId {
        let id = self.new_task(TaskKind::User);
        let task = self.tasks.get_mut(&id).unwrap();
        task.poll_fn = poll_fn;
        task.state = state;
        trace!("spawn user task {}", id);
        id
    }

    pub fn spawn_checkpoint(&mut self) -> TaskId {
        self.new_task(TaskKind::Checkpoint)
    }

    pub fn spawn_sleep(&mut self, delay_ms: u64) -> TaskId {
        let deadline = self.clock + delay_ms;
        let id = self.new_task(TaskKind::Sleep);
        self.tasks.get_mut(&id).unwrap().deadline = deadline;
        id
    }

    pub fn spawn_timeout(&mut self, target: TaskId, delay_ms: u64, result_ty: TypeId) -> TaskId {
        let deadline = self.clock + delay_ms;
        let id = self.new_task(TaskKind::Timeout);
        let timer = self.arm_timer(delay_ms, id);
        let task = self.tasks.get_mut(&id).unwrap();
        task.deadline = deadline;
        task.timeout_target = target;
        task.result_ty = result_ty;
        task.timer = Some(timer);
        id
    }

    pub fn task(&self, id: TaskId) -> Result<&Task> {
        self.tasks.get(&id).ok_or_else(|| invalid_handle(id))
    }

    pub fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks.get_mut(&id).ok_or_else(|| invalid_handle(id))
    }

    pub fn current(&self) -> TaskId {
        self.current
    }

    pub fn set_current(&mut self, id: TaskId) {
        self.current = id;
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    // ---- scheduling ----

    pub fn ready_pop(&mut self) -> Option<TaskId> {
        self.ready.pop_front()
    }

    pub fn ready_is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    // Nothing runnable and nothing parked: the state the executor must
    // be in once the entry returns. Done tasks may linger; they hold no
    // control flow.
    pub fn quiescent(&self) -> bool {
        self.ready_is_empty()
            && self
                .tasks
                .values()
                .all(|t| t.status != Status::Waiting)
    }

    // Move a task to the ready queue. Waking a Done task, a task that
    // is already queued, or the task currently being polled is a no-op.
    pub fn wake(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            if task.status == Status::Waiting {
                task.status = Status::Ready;
                task.park = None;
                self.ready.push_back(id);
                trace!("wake task {}", id);
            }
        }
    }

    // Wake every task parked under a key.
    pub fn wake_key(&mut self, key: ParkKey) {
        if let Some(list) = self.parked.remove(&key) {
            for id in list {
                self.wake(id);
            }
        }
    }

    // Put a freshly-polled task straight back on the queue, used when a
    // pending task declined to park (cancellation, checkpoint yield).
    pub fn requeue(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            if task.status != Status::Done {
                task.status = Status::Ready;
                task.park = None;
                self.ready.push_back(id);
            }
        }
    }

    pub fn park(&mut self, id: TaskId, key: ParkKey) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = Status::Waiting;
            task.park = Some(key);
            self.parked.entry(key).or_insert_with(Vec::new).push(id);
            trace!("park task {} under {:?}", id, key);
        }
    }

    // Record a subscription without changing the task's own park key,
    // used by select to listen on several keys at once.
    pub fn subscribe(&mut self, id: TaskId, key: ParkKey) {
        self.parked.entry(key).or_insert_with(Vec::new).push(id);
    }

    pub fn unsubscribe(&mut self, id: TaskId, key: ParkKey) {
        if let Some(list) = self.parked.get_mut(&key) {
            list.retain(|t| *t != id);
        }
    }

    // The first still-waiting task parked under `key`, removed from the
    // list. Stale entries (woken through another key) are discarded.
    fn take_waiter(&mut self, key: ParkKey) -> Option<TaskId> {
        let list = self.parked.get_mut(&key)?;
        while !list.is_empty() {
            let id = list.remove(0);
            if let Some(task) = self.tasks.get(&id) {
                if task.status == Status::Waiting {
                    return Some(id);
                }
            }
        }
        None
    }

    // Whether a still-waiting task is parked under `key`.
    pub fn has_waiter(&self, key: ParkKey) -> bool {
        match self.parked.get(&key) {
            Some(list) => list.iter().any(|id| {
                self.tasks
                    .get(id)
                    .map(|t| t.status == Status::Waiting)
                    .unwrap_or(false)
            }),
            None => false,
        }
    }

    // Whether a waiter is parked under `key` directly (not via a select
    // subscription). Only direct waiters carry staged values or resume
    // slots.
    pub fn has_plain_waiter(&self, key: ParkKey) -> bool {
        match self.parked.get(&key) {
            Some(list) => list.iter().any(|id| {
                self.tasks
                    .get(id)
                    .map(|t| t.status == Status::Waiting && t.park == Some(key))
                    .unwrap_or(false)
            }),
            None => false,
        }
    }

    // ---- completion ----

    // Mark a task Done with the given result, releasing its captured
    // state, and wake everything joined on it.
    pub fn complete(&mut self, heap: &mut Heap, id: TaskId, result: Value, rk: ResultKind) {
        if let Some(task) = self.tasks.get_mut(&id) {
            let state = std::mem::replace(&mut task.state, Value::Nothing);
            task.status = Status::Done;
            task.result = result;
            task.result_kind = rk;
            task.park = None;
            heap.drop_value(state);
            trace!("task {} done ({:?})", id, rk);
        }
        self.wake_key(ParkKey::Join(id));
    }

    // Remove a task record, dropping everything it still owns.
    pub fn release_task(&mut self, heap: &mut Heap, id: TaskId) {
        if let Some(task) = self.tasks.remove(&id) {
            heap.drop_value(task.result);
            heap.drop_value(task.state);
            if let Some(staged) = task.staged {
                heap.drop_value(staged);
            }
            if let Resume::ChanRecvValue(v) = task.resume {
                heap.drop_value(v);
            }
        }
    }

    // Cooperative cancellation: flag the task and wake it so it reaches
    // its next suspension point.
    pub fn cancel(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            if task.status != Status::Done {
                task.cancelled = true;
            }
        }
        self.wake(id);
    }

    // ---- channels ----

    pub fn chan_new(&mut self, cap: usize) -> ChannelId {
        let id = self.next_chan;
        self.next_chan += 1;
        self.channels.insert(
            id,
            Channel {
                id,
                cap,
                queue: VecDeque::new(),
                closed: false,
            },
        );
        id
    }

    pub fn channel(&self, id: ChannelId) -> Result<&Channel> {
        self.channels.get(&id).ok_or_else(|| invalid_handle(id))
    }

    // Attempt a synchronous send. Delivery preference: a parked
    // receiver first, then a buffer slot.
    pub fn try_send(&mut self, ch: ChannelId, v: Value) -> Result<SendOutcome> {
        let closed = self.channel(ch)?.closed;
        if closed {
            return Ok(SendOutcome::Closed(v));
        }
        if let Some(rx) = self.take_waiter(ParkKey::ChanRecv(ch)) {
            let parked_on_select = matches!(
                self.tasks.get(&rx).and_then(|t| t.park),
                Some(ParkKey::Select(_))
            );
            if parked_on_select {
                // A select subscriber retries its fast path when woken;
                // stage the value in the buffer where it will find it.
                self.channels.get_mut(&ch).unwrap().queue.push_back(v);
                self.wake(rx);
            } else {
                let task = self.tasks.get_mut(&rx).unwrap();
                task.resume = Resume::ChanRecvValue(v);
                self.wake(rx);
            }
            return Ok(SendOutcome::Sent);
        }
        let chan = self.channels.get_mut(&ch).unwrap();
        if chan.queue.len() < chan.cap {
            chan.queue.push_back(v);
            return Ok(SendOutcome::Sent);
        }
        Ok(SendOutcome::Full(v))
    }

    // Attempt a synchronous receive. Draining a buffer slot pulls one
    // parked sender's staged value in behind it.
    pub fn try_recv(&mut self, ch: ChannelId) -> Result<RecvOutcome> {
        let closed = self.channel(ch)?.closed;
        if let Some(v) = self.channels.get_mut(&ch).unwrap().queue.pop_front() {
            self.admit_parked_sender(ch);
            return Ok(RecvOutcome::Value(v));
        }
        if let Some(tx) = self.take_waiter(ParkKey::ChanSend(ch)) {
            let parked_on_select = matches!(
                self.tasks.get(&tx).and_then(|t| t.park),
                Some(ParkKey::Select(_))
            );
            if parked_on_select {
                // Wake the select; it will see this receiver parked and
                // commit its send arm. Report empty so the receiver
                // parks first.
                self.wake(tx);
                return Ok(RecvOutcome::Empty);
            }
            let task = self.tasks.get_mut(&tx).unwrap();
            let staged = task.staged.take().expect("parked sender without staged value");
            task.resume = Resume::ChanSendAck;
            self.wake(tx);
            return Ok(RecvOutcome::Value(staged));
        }
        if closed {
            return Ok(RecvOutcome::Closed);
        }
        Ok(RecvOutcome::Empty)
    }

    // Put a drained value back at the head of the queue, so the next
    // receive observes it first.
    pub fn chan_unpop(&mut self, ch: ChannelId, v: Value) {
        if let Some(chan) = self.channels.get_mut(&ch) {
            chan.queue.push_front(v);
        }
    }

    // After a buffer slot frees up, move one parked sender's staged
    // value into it.
    fn admit_parked_sender(&mut self, ch: ChannelId) {
        if let Some(tx) = self.take_waiter(ParkKey::ChanSend(ch)) {
            let parked_on_select = matches!(
                self.tasks.get(&tx).and_then(|t| t.park),
                Some(ParkKey::Select(_))
            );
            if parked_on_select {
                self.wake(tx);
                return;
            }
            let task = self.tasks.get_mut(&tx).unwrap();
            let staged = task.staged.take().expect("parked sender without staged value");
            task.resume = Resume::ChanSendAck;
            self.channels.get_mut(&ch).unwrap().queue.push_back(staged);
            self.wake(tx);
        }
    }

    // Close a channel: parked receivers observe Closed, parked senders
    // observe SendClosed (and will drop their staged value and panic).
    pub fn chan_close(&mut self, ch: ChannelId) -> Result<()> {
        self.channel(ch)?;
        self.channels.get_mut(&ch).unwrap().closed = true;
        while let Some(rx) = self.take_waiter(ParkKey::ChanRecv(ch)) {
            let plain = !matches!(
                self.tasks.get(&rx).and_then(|t| t.park),
                Some(ParkKey::Select(_))
            );
            if plain {
                self.tasks.get_mut(&rx).unwrap().resume = Resume::ChanRecvClosed;
            }
            self.wake(rx);
        }
        while let Some(tx) = self.take_waiter(ParkKey::ChanSend(ch)) {
            let plain = !matches!(
                self.tasks.get(&tx).and_then(|t| t.park),
                Some(ParkKey::Select(_))
            );
            if plain {
                self.tasks.get_mut(&tx).unwrap().resume = Resume::ChanSendClosed;
            }
            self.wake(tx);
        }
        Ok(())
    }

    // ---- timers ----

    pub fn arm_timer(&mut self, delay_ms: u64, task: TaskId) -> TimerId {
        let id = self.next_timer;
        self.next_timer += 1;
        self.timers.push(Timer {
            id,
            deadline: self.clock + delay_ms,
            fired: false,
            task,
        });
        id
    }

    pub fn timer_elapsed(&self, id: TimerId) -> bool {
        self.timers
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.fired || t.deadline <= self.clock)
            .unwrap_or(false)
    }

    // Advance the virtual clock to the earliest pending deadline and
    // fire everything due. Only legal when the ready queue is empty;
    // returns false when there is nothing to advance to.
    pub fn advance_clock(&mut self) -> bool {
        if !self.ready.is_empty() {
            return false;
        }
        let next = self
            .timers
            .iter()
            .filter(|t| !t.fired)
            .map(|t| t.deadline)
            .min();
        let next = match next {
            Some(d) => d,
            None => return false,
        };
        if next > self.clock {
            self.clock = next;
        }
        trace!("clock -> {}", self.clock);
        let mut due = Vec::new();
        for timer in self.timers.iter_mut() {
            if !timer.fired && timer.deadline <= self.clock {
                timer.fired = true;
                due.push((timer.id, timer.task));
            }
        }
        for (id, task) in due {
            self.wake(task);
            self.wake_key(ParkKey::Timer(id));
        }
        true
    }

    // ---- scopes ----

    pub fn scope_enter(&mut self, owner: TaskId, failfast: bool) -> ScopeId {
        let id = self.next_scope;
        self.next_scope += 1;
        self.scopes.insert(
            id,
            Scope {
                id,
                owner,
                failfast,
                fired: false,
                children: Vec::new(),
            },
        );
        id
    }

    pub fn scope_register(&mut self, scope: ScopeId, task: TaskId) -> Result<()> {
        match self.scopes.get_mut(&scope) {
            Some(sc) => {
                sc.children.push(task);
                Ok(())
            }
            None => Err(invalid_handle(scope)),
        }
    }

    pub fn scope_cancel_all(&mut self, scope: ScopeId) -> Result<()> {
        let children = match self.scopes.get(&scope) {
            Some(sc) => sc.children.clone(),
            None => return Err(invalid_handle(scope)),
        };
        for child in children {
            self.cancel(child);
        }
        Ok(())
    }

    // Prune completed children (releasing their records) and report
    // (all_done, first_pending_child, failfast_fired). The child set
    // only ever shrinks.
    pub fn scope_join_state(
        &mut self,
        heap: &mut Heap,
        scope: ScopeId,
    ) -> Result<(bool, TaskId, bool)> {
        let children = match self.scopes.get(&scope) {
            Some(sc) => sc.children.clone(),
            None => return Err(invalid_handle(scope)),
        };
        let failfast = self.scopes.get(&scope).unwrap().failfast;
        let mut remaining = Vec::new();
        let mut tripped = false;
        for child in children {
            let done = self
                .tasks
                .get(&child)
                .map(|t| t.status == Status::Done)
                .unwrap_or(true);
            if done {
                if failfast
                    && self
                        .tasks
                        .get(&child)
                        .map(|t| t.result_kind == ResultKind::Cancelled)
                        .unwrap_or(false)
                {
                    tripped = true;
                }
                self.release_task(heap, child);
            } else {
                remaining.push(child);
            }
        }
        let sc = self.scopes.get_mut(&scope).unwrap();
        sc.children = remaining;
        if tripped {
            sc.fired = true;
        }
        let fired = sc.fired;
        if sc.children.is_empty() {
            Ok((true, 0, fired))
        } else {
            Ok((false, sc.children[0], fired))
        }
    }

    pub fn scope_exit(&mut self, scope: ScopeId) -> Result<()> {
        match self.scopes.remove(&scope) {
            Some(_) => Ok(()),
            None => Err(invalid_handle(scope)),
        }
    }

    // ---- select ----

    pub fn next_select_id(&mut self) -> SelectId {
        let id = self.next_select;
        self.next_select += 1;
        id
    }

    // Drop all of a task's select subscriptions, keeping its timers.
    pub fn clear_select_subs(&mut self, id: TaskId) {
        let subs = match self.tasks.get_mut(&id) {
            Some(task) => match task.select.as_mut() {
                Some(sel) => std::mem::replace(&mut sel.subs, Vec::new()),
                None => return,
            },
            None => return,
        };
        for key in subs {
            self.unsubscribe(id, key);
        }
    }

    // Panic raised when nothing can run and nothing can wake.
    pub fn deadlock(&self) -> Panic {
        Panic::new(
            PanicKind::AsyncDeadlock,
            String::from("ready queue is empty while a task is still pending"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Value {
        Value::Int(v, 1)
    }

    #[test]
    fn test_task_ids_monotonic_and_queued() {
        let mut exec = Executor::new();
        let a = exec.spawn_checkpoint();
        let b = exec.spawn_checkpoint();
        assert!(b > a);
        assert_eq!(exec.ready_pop(), Some(a));
        assert_eq!(exec.ready_pop(), Some(b));
        assert_eq!(exec.ready_pop(), None);
    }

    #[test]
    fn test_park_wake_fifo() {
        let mut exec = Executor::new();
        let a = exec.spawn_checkpoint();
        let b = exec.spawn_checkpoint();
        exec.ready_pop();
        exec.ready_pop();
        exec.park(a, ParkKey::Join(99));
        exec.park(b, ParkKey::Join(99));
        exec.wake_key(ParkKey::Join(99));
        // Insertion order is preserved.
        assert_eq!(exec.ready_pop(), Some(a));
        assert_eq!(exec.ready_pop(), Some(b));
        assert!(exec.task(a).unwrap().park.is_none());
    }

    #[test]
    fn test_buffered_channel_fifo() {
        let mut exec = Executor::new();
        let ch = exec.chan_new(2);
        assert!(matches!(exec.try_send(ch, int(1)), Ok(SendOutcome::Sent)));
        assert!(matches!(exec.try_send(ch, int(2)), Ok(SendOutcome::Sent)));
        assert!(matches!(exec.try_send(ch, int(3)), Ok(SendOutcome::Full(_))));
        match exec.try_recv(ch).unwrap() {
            RecvOutcome::Value(v) => assert_eq!(v, int(1)),
            _ => panic!("expected a value"),
        }
        match exec.try_recv(ch).unwrap() {
            RecvOutcome::Value(v) => assert_eq!(v, int(2)),
            _ => panic!("expected a value"),
        }
        assert!(matches!(exec.try_recv(ch), Ok(RecvOutcome::Empty)));
    }

    #[test]
    fn test_closed_channel() {
        let mut exec = Executor::new();
        let ch = exec.chan_new(1);
        exec.try_send(ch, int(1)).unwrap();
        exec.chan_close(ch).unwrap();
        assert!(matches!(exec.try_send(ch, int(2)), Ok(SendOutcome::Closed(_))));
        // Buffered values drain before Closed is reported.
        assert!(matches!(exec.try_recv(ch), Ok(RecvOutcome::Value(_))));
        assert!(matches!(exec.try_recv(ch), Ok(RecvOutcome::Closed)));
    }

    #[test]
    fn test_parked_sender_handoff() {
        let mut exec = Executor::new();
        let mut heap = Heap::new();
        let ch = exec.chan_new(0);
        let tx = exec.spawn_checkpoint();
        exec.ready_pop();
        // Simulate the sender parking with a staged value.
        exec.task_mut(tx).unwrap().staged = Some(int(7));
        exec.park(tx, ParkKey::ChanSend(ch));
        match exec.try_recv(ch).unwrap() {
            RecvOutcome::Value(v) => assert_eq!(v, int(7)),
            _ => panic!("expected staged value"),
        }
        assert_eq!(exec.task(tx).unwrap().resume, Resume::ChanSendAck);
        assert_eq!(exec.task(tx).unwrap().status, Status::Ready);
        exec.release_task(&mut heap, tx);
    }

    #[test]
    fn test_virtual_clock_fires_earliest_deadline() {
        let mut exec = Executor::new();
        let t = exec.spawn_checkpoint();
        exec.ready_pop();
        exec.park(t, ParkKey::Join(42));
        let late = exec.arm_timer(100, t);
        let early = exec.arm_timer(10, 0);
        assert!(exec.advance_clock());
        assert_eq!(exec.clock(), 10);
        assert!(exec.timer_elapsed(early));
        assert!(!exec.timer_elapsed(late));
        // The second advance reaches the later deadline and wakes the
        // parked task directly.
        assert!(exec.advance_clock());
        assert_eq!(exec.clock(), 100);
        assert_eq!(exec.ready_pop(), Some(t));
    }

    #[test]
    fn test_clock_does_not_advance_while_ready() {
        let mut exec = Executor::new();
        let _t = exec.spawn_checkpoint();
        exec.arm_timer(10, 0);
        assert!(!exec.advance_clock());
        assert_eq!(exec.clock(), 0);
    }

    #[test]
    fn test_scope_join_state() {
        let mut exec = Executor::new();
        let mut heap = Heap::new();
        let sc = exec.scope_enter(0, true);
        let a = exec.spawn_checkpoint();
        let b = exec.spawn_checkpoint();
        exec.scope_register(sc, a).unwrap();
        exec.scope_register(sc, b).unwrap();

        let (done, pending, fired) = exec.scope_join_state(&mut heap, sc).unwrap();
        assert!(!done);
        assert_eq!(pending, a);
        assert!(!fired);

        exec.complete(&mut heap, a, Value::Nothing, ResultKind::Cancelled);
        exec.complete(&mut heap, b, Value::Nothing, ResultKind::Success);
        let (done, _, fired) = exec.scope_join_state(&mut heap, sc).unwrap();
        assert!(done);
        // Fail-fast tripped by the cancelled child.
        assert!(fired);
        exec.scope_exit(sc).unwrap();
        assert!(exec.scope_exit(sc).is_err());
    }

    #[test]
    fn test_quiescent() {
        let mut exec = Executor::new();
        let mut heap = Heap::new();
        assert!(exec.quiescent());

        let t = exec.spawn_checkpoint();
        assert!(!exec.quiescent());

        exec.ready_pop();
        exec.park(t, ParkKey::Join(9));
        assert!(!exec.quiescent());

        exec.wake_key(ParkKey::Join(9));
        assert!(!exec.quiescent());

        exec.ready_pop();
        exec.complete(&mut heap, t, Value::Nothing, ResultKind::Success);
        assert!(exec.quiescent());
    }

    #[test]
    fn test_cancel_wakes() {
        let mut exec = Executor::new();
        let t = exec.spawn_checkpoint();
        exec.ready_pop();
        exec.park(t, ParkKey::Join(7));
        exec.cancel(t);
        assert!(exec.task(t).unwrap().cancelled);
        assert_eq!(exec.ready_pop(), Some(t));
    }
}
