// (C) 2020 Brandon Lewis
//
// The instruction dispatcher.
//
// One MIR instruction executes per step against the top frame. Every
// handler returns a step outcome (advance, jump, or stay put after a
// frame push/pop); the driver loop applies it and emits a trace event.
//
// *Ownership*
//
// A handler that evaluates an operand owns the resulting value and
// must either store it (transferring ownership to a slot or heap cell)
// or drop it, on success and failure paths alike. `write_local`
// releases the previous occupant of a slot before installing the new
// value, so a terminating program ends with zero live heap objects.
//
// *Async*
//
// The async instructions cooperate with the executor through two side
// channels on the VM: `pending_park`, set by an instruction that wants
// the current task parked once its poll function returns, and the
// per-task resume slots, set by the executor to convey a channel
// outcome to the instruction that parked. Polling a task re-enters the
// interpreter through `run_function`, which saves and restores the
// whole frame stack, so task frames never contaminate the caller's.

use log::debug;

use crate::error::{invalid_location, unimplemented, Panic, PanicKind, Result};
use crate::exec::{
    Executor, ParkKey, RecvOutcome, Resume, ResultKind, SendOutcome, Status, TaskId, TaskKind,
};
use crate::frame::Frame;
use crate::heap::Heap;
use crate::layout::LayoutCache;
use crate::mir::{
    BlockId, FuncId, GlobalId, Instr, InstrKind, Module, Operand, Place, PlaceBase, RValue,
    SelectArm, Span,
};
use crate::trace::{LocalWrite, Tracer};
use crate::types::{TypeDef, TypeId, TypeRegistry, Width, NO_TYPE};
use crate::value::{Kind, Value};

#[derive(Debug)]
pub struct GlobalSlot {
    pub value: Value,
    pub ty: TypeId,
    pub name: String,
    pub init: bool,
}

// What the dispatcher should do with the instruction pointer.
enum Step {
    Advance,
    Jump(BlockId),
    // A frame was pushed or popped; the new top frame's cursor is
    // already correct.
    Stay,
}

pub struct Vm<'m> {
    pub module: &'m Module,
    pub types: &'m TypeRegistry,
    pub heap: Heap,
    pub layouts: LayoutCache,
    pub globals: Vec<GlobalSlot>,
    pub stack: Vec<Frame>,
    pub exec: Executor,
    pub tracer: Box<dyn Tracer>,
    pub(crate) halted: bool,
    pub(crate) started: bool,
    // One-shot return capture for nested execution: armed with
    // Some(None), filled by the bottom frame's Return.
    pub(crate) capture_return: Option<Option<Value>>,
    // Set by an async instruction that wants the current task parked.
    pub(crate) pending_park: Option<ParkKey>,
    pub(crate) local_writes: Vec<LocalWrite>,
}

impl<'m> Vm<'m> {
    pub fn new(module: &'m Module, types: &'m TypeRegistry, tracer: Box<dyn Tracer>) -> Vm<'m> {
        let globals = module
            .globals
            .iter()
            .map(|def| GlobalSlot {
                value: Value::Invalid,
                ty: def.ty,
                name: def.name.clone(),
                init: false,
            })
            .collect();
        Vm {
            module,
            types,
            heap: Heap::new(),
            layouts: LayoutCache::new(),
            globals,
            stack: Vec::new(),
            exec: Executor::new(),
            tracer,
            halted: false,
            started: false,
            capture_return: None,
            pending_park: None,
            local_writes: Vec::new(),
        }
    }

    // Run the named entry to completion and hand back its return value.
    pub fn run(&mut self, entry: &str, args: Vec<Value>) -> Result<Value> {
        self.init_globals()?;
        let fid = self
            .module
            .function(entry)
            .ok_or_else(|| unimplemented(&format!("no function named {}", entry)))?;
        match self.run_function(fid, args) {
            Ok(v) => {
                // A returning entry must leave nothing runnable or
                // parked behind it.
                debug_assert!(
                    self.exec.ready_is_empty() && self.exec.quiescent(),
                    "executor not quiescent after entry returned"
                );
                Ok(v)
            }
            Err(p) => {
                self.tracer.panic(&p);
                Err(p)
            }
        }
    }

    fn init_globals(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        let module = self.module;
        for (id, def) in module.globals.iter().enumerate() {
            let v = self.eval_rvalue(&RValue::Use(Operand::Const(def.init.clone())))?;
            self.write_global(id, v)?;
        }
        Ok(())
    }

    // ---- nested execution ----

    // Run a function in a fresh execution context: the frame stack,
    // halt flag and return capture are saved and restored around it.
    pub(crate) fn run_function(&mut self, fid: FuncId, args: Vec<Value>) -> Result<Value> {
        let saved_stack = std::mem::replace(&mut self.stack, Vec::new());
        let saved_halted = self.halted;
        let saved_capture = self.capture_return.take();
        self.halted = false;
        self.capture_return = Some(None);

        let mut result = self.push_frame(fid, args, None);
        if result.is_ok() {
            while !self.stack.is_empty() && !self.halted {
                if let Err(e) = self.step() {
                    result = Err(e);
                    break;
                }
            }
        }
        let captured = self.capture_return.take().and_then(|c| c);

        // On a panic the stranded frames are discarded; the dispatcher
        // stops rather than unwinding.
        self.stack = saved_stack;
        self.halted = saved_halted;
        self.capture_return = saved_capture;
        result.map(|_| captured.unwrap_or(Value::Nothing))
    }

    fn push_frame(&mut self, fid: FuncId, args: Vec<Value>, ret_dst: Option<Place>) -> Result<()> {
        let def = match self.module.functions.get(fid) {
            Some(def) => def,
            None => {
                for v in args {
                    self.heap.drop_value(v);
                }
                return Err(unimplemented("function id out of range"));
            }
        };
        if args.len() != def.arg_count || def.arg_count > def.locals.len() {
            for v in args {
                self.heap.drop_value(v);
            }
            return Err(unimplemented("argument count mismatch"));
        }
        let mut frame = Frame::new(fid, def, ret_dst, Span::none());
        // Argument ownership transfers into the first locals.
        for (i, v) in args.into_iter().enumerate() {
            frame.locals[i].value = v;
            frame.locals[i].init = true;
        }
        self.stack.push(frame);
        Ok(())
    }

    // ---- the step loop ----

    pub fn step(&mut self) -> Result<()> {
        let (fid, bb, ip, depth) = {
            let frame = self
                .stack
                .last()
                .ok_or_else(|| invalid_location("no active frame"))?;
            (frame.func, frame.bb, frame.ip, self.stack.len())
        };
        let module: &'m Module = self.module;
        let func = module
            .functions
            .get(fid)
            .ok_or_else(|| unimplemented("function id out of range"))?;
        let block = func
            .blocks
            .get(bb)
            .ok_or_else(|| invalid_location("block id out of range"))?;
        let instr: &'m Instr = block
            .instrs
            .get(ip)
            .ok_or_else(|| invalid_location("fell off the end of a block"))?;

        self.local_writes.clear();
        let step = self.dispatch(instr).map_err(|p| p.at(instr.span))?;
        match step {
            Step::Advance => {
                if let Some(frame) = self.stack.last_mut() {
                    frame.ip += 1;
                }
            }
            Step::Jump(target) => {
                if let Some(frame) = self.stack.last_mut() {
                    frame.bb = target;
                    frame.ip = 0;
                }
            }
            Step::Stay => {}
        }
        self.trace_instr(depth, &func.name, bb, ip, instr);
        Ok(())
    }

    fn dispatch(&mut self, instr: &'m Instr) -> Result<Step> {
        match &instr.kind {
            InstrKind::Nop => Ok(Step::Advance),
            InstrKind::Assign { dst, rv } => {
                let v = self.eval_rvalue(rv)?;
                self.store_place(dst, v)?;
                Ok(Step::Advance)
            }
            InstrKind::Call { dst, callee, args } => self.instr_call(dst.as_ref(), callee, args),
            InstrKind::Jump { bb } => Ok(Step::Jump(*bb)),
            InstrKind::Branch {
                cond,
                then_bb,
                else_bb,
            } => match self.eval_operand(cond)? {
                Value::Bool(true, _) => Ok(Step::Jump(*then_bb)),
                Value::Bool(false, _) => Ok(Step::Jump(*else_bb)),
                other => {
                    let kind = other.kind();
                    self.heap.drop_value(other);
                    Err(crate::error::expected(Kind::Bool.into(), kind))
                }
            },
            InstrKind::Return { value } => self.instr_return(value.as_ref()),
            InstrKind::Drop { place } => self.instr_drop(place),
            InstrKind::EndBorrow { place } => self.instr_end_borrow(place),
            InstrKind::Spawn { dst, task } => {
                let v = self.eval_operand(task)?;
                let tid = self.task_id_of(&v)?;
                self.exec.wake(tid);
                self.store_place(dst, v)?;
                Ok(Step::Advance)
            }
            InstrKind::Await { dst, task } => {
                let v = self.eval_operand(task)?;
                let tid = self.task_id_of(&v)?;
                let expected = self.place_type(Some(dst));
                let result = self.run_until_done(tid, expected)?;
                self.store_place(dst, result)?;
                Ok(Step::Advance)
            }
            InstrKind::Poll {
                task,
                ready_bb,
                pend_bb,
                dst,
            } => self.instr_poll(task, *ready_bb, *pend_bb, dst),
            InstrKind::JoinAll {
                scope,
                ready_bb,
                pend_bb,
                dst,
            } => self.instr_join_all(scope, *ready_bb, *pend_bb, dst),
            InstrKind::ChanSend {
                chan,
                value,
                ready_bb,
                pend_bb,
            } => self.instr_chan_send(chan, value, *ready_bb, *pend_bb),
            InstrKind::ChanRecv {
                chan,
                ready_bb,
                pend_bb,
                dst,
            } => self.instr_chan_recv(chan, *ready_bb, *pend_bb, dst),
            InstrKind::Timeout {
                task,
                ms,
                ready_bb,
                pend_bb,
                dst,
            } => self.instr_timeout(task, *ms, *ready_bb, *pend_bb, dst),
            InstrKind::Select {
                arms,
                ready_bb,
                pend_bb,
                dst,
            } => self.instr_select(arms, *ready_bb, *pend_bb, dst),
        }
    }

    // ---- plain instructions ----

    fn instr_call(&mut self, dst: Option<&Place>, callee: &str, args: &[Operand]) -> Result<Step> {
        let values = self.eval_operand_list(args)?;
        match self.module.function(callee) {
            Some(fid) => {
                // The caller resumes after the call once the frame pops.
                if let Some(frame) = self.stack.last_mut() {
                    frame.ip += 1;
                }
                self.push_frame(fid, values, dst.cloned())?;
                Ok(Step::Stay)
            }
            None => {
                self.call_intrinsic(callee, values, dst)?;
                Ok(Step::Advance)
            }
        }
    }

    fn instr_return(&mut self, value: Option<&Operand>) -> Result<Step> {
        let v = match value {
            Some(op) => self.eval_operand(op)?,
            None => Value::Nothing,
        };
        let mut frame = self
            .stack
            .pop()
            .ok_or_else(|| invalid_location("return with no frame"))?;
        for slot in frame.locals.drain(..) {
            if slot.is_live() {
                self.heap.drop_value(slot.value);
            }
        }
        if self.stack.is_empty() {
            match self.capture_return.as_mut() {
                Some(cap) => *cap = Some(v),
                None => self.heap.drop_value(v),
            }
            self.halted = true;
        } else if let Some(dst) = frame.ret_dst.take() {
            self.store_place(&dst, v)?;
        } else {
            self.heap.drop_value(v);
        }
        Ok(Step::Stay)
    }

    fn instr_drop(&mut self, place: &Place) -> Result<Step> {
        if !place.is_bare() {
            return Err(unimplemented("drop of a projected place"));
        }
        match place.base {
            PlaceBase::Local(id) => {
                let top = self.stack.len() - 1;
                let slot = self.stack[top].local_mut(id)?;
                let live = slot.init && !slot.moved;
                let old = std::mem::replace(&mut slot.value, Value::Invalid);
                slot.init = false;
                slot.dropped = true;
                if live {
                    self.heap.drop_value(old);
                }
            }
            PlaceBase::Global(id) => {
                let slot = self
                    .globals
                    .get_mut(id)
                    .ok_or_else(|| invalid_location("global id out of range"))?;
                let live = slot.init;
                let old = std::mem::replace(&mut slot.value, Value::Invalid);
                slot.init = false;
                if live {
                    self.heap.drop_value(old);
                }
            }
        }
        Ok(Step::Advance)
    }

    // Borrows do not own: the slot is cleared without a release.
    fn instr_end_borrow(&mut self, place: &Place) -> Result<Step> {
        if !place.is_bare() {
            return Err(unimplemented("end-borrow of a projected place"));
        }
        match place.base {
            PlaceBase::Local(id) => {
                let top = self.stack.len() - 1;
                let slot = self.stack[top].local_mut(id)?;
                slot.value = Value::Invalid;
                slot.init = false;
                slot.moved = false;
            }
            PlaceBase::Global(id) => {
                let slot = self
                    .globals
                    .get_mut(id)
                    .ok_or_else(|| invalid_location("global id out of range"))?;
                slot.value = Value::Invalid;
                slot.init = false;
            }
        }
        Ok(Step::Advance)
    }

    // ---- async instructions ----

    fn instr_poll(
        &mut self,
        task: &Operand,
        ready_bb: BlockId,
        pend_bb: BlockId,
        dst: &Place,
    ) -> Result<Step> {
        let cur = self.exec.current();
        if cur != 0 && self.exec.task(cur)?.cancelled {
            return Ok(Step::Jump(pend_bb));
        }
        let v = self.eval_operand(task)?;
        let tid = self.task_id_of(&v)?;
        if tid == cur {
            return Err(crate::error::invalid_handle(tid));
        }
        if self.exec.task(tid)?.status == Status::Done {
            let expected = self.place_type(Some(dst));
            let result = self.drain_task(tid, expected)?;
            self.store_place(dst, result)?;
            Ok(Step::Jump(ready_bb))
        } else {
            self.pending_park = Some(ParkKey::Join(tid));
            Ok(Step::Jump(pend_bb))
        }
    }

    fn instr_join_all(
        &mut self,
        scope: &Operand,
        ready_bb: BlockId,
        pend_bb: BlockId,
        dst: &Place,
    ) -> Result<Step> {
        let cur = self.exec.current();
        if cur != 0 && self.exec.task(cur)?.cancelled {
            return Ok(Step::Jump(pend_bb));
        }
        let v = self.eval_operand(scope)?;
        let sid = self.task_id_of(&v)?;
        let (done, pending, fired) = self.exec.scope_join_state(&mut self.heap, sid)?;
        if done {
            let boolean = self.types.builtins().boolean;
            self.store_place(dst, Value::Bool(fired, boolean))?;
            Ok(Step::Jump(ready_bb))
        } else {
            self.pending_park = Some(ParkKey::Join(pending));
            Ok(Step::Jump(pend_bb))
        }
    }

    fn instr_chan_send(
        &mut self,
        chan: &Operand,
        value: &Operand,
        ready_bb: BlockId,
        pend_bb: BlockId,
    ) -> Result<Step> {
        let cur = self.exec.current();
        // A resumed send never re-evaluates its operands; the staged
        // value already went out (ack) or must be dropped (closed).
        if cur != 0 {
            match self.exec.task(cur)?.resume {
                Resume::ChanSendAck => {
                    self.exec.task_mut(cur)?.resume = Resume::None;
                    return Ok(Step::Jump(ready_bb));
                }
                Resume::ChanSendClosed => {
                    let task = self.exec.task_mut(cur)?;
                    task.resume = Resume::None;
                    let staged = task.staged.take();
                    if let Some(v) = staged {
                        self.heap.drop_value(v);
                    }
                    return Err(send_on_closed());
                }
                _ => {}
            }
        }
        let ch = self.eval_operand(chan)?;
        let cid = self.task_id_of(&ch)?;
        let v = self.eval_operand(value)?;
        if cur == 0 {
            self.blocking_send(cid, v)?;
            return Ok(Step::Jump(ready_bb));
        }
        match self.exec.try_send(cid, v)? {
            SendOutcome::Sent => Ok(Step::Jump(ready_bb)),
            SendOutcome::Closed(v) => {
                self.heap.drop_value(v);
                Err(send_on_closed())
            }
            SendOutcome::Full(v) => {
                if self.exec.task(cur)?.cancelled {
                    // Stay runnable; the staged value dies here.
                    self.heap.drop_value(v);
                    Ok(Step::Jump(pend_bb))
                } else {
                    self.exec.task_mut(cur)?.staged = Some(v);
                    self.pending_park = Some(ParkKey::ChanSend(cid));
                    Ok(Step::Jump(pend_bb))
                }
            }
        }
    }

    fn instr_chan_recv(
        &mut self,
        chan: &Operand,
        ready_bb: BlockId,
        pend_bb: BlockId,
        dst: &Place,
    ) -> Result<Step> {
        let cur = self.exec.current();
        let dst_ty = self.place_type(Some(dst));
        if cur != 0 {
            let resumed = matches!(
                self.exec.task(cur)?.resume,
                Resume::ChanRecvValue(_) | Resume::ChanRecvClosed
            );
            if resumed {
                let resume =
                    std::mem::replace(&mut self.exec.task_mut(cur)?.resume, Resume::None);
                let out = match resume {
                    Resume::ChanRecvValue(v) => self.build_some(dst_ty, v),
                    _ => Value::Nothing,
                };
                self.store_place(dst, out)?;
                return Ok(Step::Jump(ready_bb));
            }
        }
        let ch = self.eval_operand(chan)?;
        let cid = self.task_id_of(&ch)?;
        if cur == 0 {
            let out = match self.blocking_recv(cid)? {
                Some(v) => self.build_some(dst_ty, v),
                None => Value::Nothing,
            };
            self.store_place(dst, out)?;
            return Ok(Step::Jump(ready_bb));
        }
        match self.exec.try_recv(cid)? {
            RecvOutcome::Value(v) => {
                let out = self.build_some(dst_ty, v);
                self.store_place(dst, out)?;
                Ok(Step::Jump(ready_bb))
            }
            RecvOutcome::Closed => {
                self.store_place(dst, Value::Nothing)?;
                Ok(Step::Jump(ready_bb))
            }
            RecvOutcome::Empty => {
                if !self.exec.task(cur)?.cancelled {
                    self.pending_park = Some(ParkKey::ChanRecv(cid));
                }
                Ok(Step::Jump(pend_bb))
            }
        }
    }

    fn instr_timeout(
        &mut self,
        task: &Operand,
        ms: u64,
        ready_bb: BlockId,
        pend_bb: BlockId,
        dst: &Place,
    ) -> Result<Step> {
        let cur = self.exec.current();
        if cur != 0 && self.exec.task(cur)?.cancelled {
            return Ok(Step::Jump(pend_bb));
        }
        let expected = self.place_type(Some(dst));
        // First entry spawns the racing task; re-polls reuse it.
        let helper = if cur != 0 && self.exec.task(cur)?.timeout_task != 0 {
            self.exec.task(cur)?.timeout_task
        } else {
            let v = self.eval_operand(task)?;
            let target = self.task_id_of(&v)?;
            let helper = self.exec.spawn_timeout(target, ms, expected);
            if cur != 0 {
                self.exec.task_mut(cur)?.timeout_task = helper;
            }
            helper
        };
        if cur == 0 {
            let result = self.run_until_done(helper, expected)?;
            self.store_place(dst, result)?;
            return Ok(Step::Jump(ready_bb));
        }
        if self.exec.task(helper)?.status == Status::Done {
            self.exec.task_mut(cur)?.timeout_task = 0;
            let result = self.drain_task(helper, expected)?;
            self.store_place(dst, result)?;
            Ok(Step::Jump(ready_bb))
        } else {
            self.pending_park = Some(ParkKey::Join(helper));
            Ok(Step::Jump(pend_bb))
        }
    }

    // ---- select ----

    fn instr_select(
        &mut self,
        arms: &[SelectArm],
        ready_bb: BlockId,
        pend_bb: BlockId,
        dst: &Place,
    ) -> Result<Step> {
        let cur = self.exec.current();
        if cur != 0 && self.exec.task(cur)?.cancelled {
            return Ok(Step::Jump(pend_bb));
        }
        if cur == 0 {
            // Outside a task the select drives the executor itself.
            loop {
                if let Some(chosen) = self.select_ready_arm(cur, arms)? {
                    self.select_commit(cur, arms, chosen)?;
                    return self.select_finish(dst, chosen, ready_bb);
                }
                if let Some(default) =
                    arms.iter().position(|a| matches!(a, SelectArm::Default))
                {
                    return self.select_finish(dst, default, ready_bb);
                }
                if let Some(next) = self.exec.ready_pop() {
                    self.poll_task(next)?;
                } else if self.exec.advance_clock() {
                    continue;
                } else {
                    return Err(self.exec.deadlock());
                }
            }
        }
        // Stale subscriptions from the previous poll go away before the
        // fast path runs again.
        self.exec.clear_select_subs(cur);
        if let Some(chosen) = self.select_ready_arm(cur, arms)? {
            self.select_commit(cur, arms, chosen)?;
            return self.select_finish(dst, chosen, ready_bb);
        }
        if let Some(default) = arms.iter().position(|a| matches!(a, SelectArm::Default)) {
            return self.select_finish(dst, default, ready_bb);
        }
        self.select_subscribe(cur, arms)?;
        let sid = match self.exec.task(cur)?.select.as_ref() {
            Some(sel) => sel.id,
            None => return Err(invalid_location("select without arbiter state")),
        };
        self.pending_park = Some(ParkKey::Select(sid));
        Ok(Step::Jump(pend_bb))
    }

    // First immediately-ready arm, in arm order.
    fn select_ready_arm(&mut self, cur: TaskId, arms: &[SelectArm]) -> Result<Option<usize>> {
        for (i, arm) in arms.iter().enumerate() {
            let ready = match arm {
                SelectArm::Default => false,
                SelectArm::TaskReady(op) => {
                    let v = self.eval_operand(op)?;
                    let tid = self.task_id_of(&v)?;
                    self.exec.task(tid)?.status == Status::Done
                }
                SelectArm::Recv(op) => {
                    let v = self.eval_operand(op)?;
                    let cid = self.task_id_of(&v)?;
                    let chan = self.exec.channel(cid)?;
                    !chan.queue.is_empty()
                        || chan.closed
                        || self.exec.has_plain_waiter(ParkKey::ChanSend(cid))
                }
                SelectArm::Send(op, _) => {
                    let v = self.eval_operand(op)?;
                    let cid = self.task_id_of(&v)?;
                    let chan = self.exec.channel(cid)?;
                    chan.closed
                        || chan.queue.len() < chan.cap
                        || self.exec.has_waiter(ParkKey::ChanRecv(cid))
                }
                SelectArm::Timeout(op, _) => {
                    let v = self.eval_operand(op)?;
                    let tid = self.task_id_of(&v)?;
                    if self.exec.task(tid)?.status == Status::Done {
                        true
                    } else if cur != 0 {
                        let timer = self
                            .exec
                            .task(cur)?
                            .select
                            .as_ref()
                            .and_then(|sel| sel.timers.get(&i).copied());
                        match timer {
                            Some(t) => self.exec.timer_elapsed(t),
                            None => false,
                        }
                    } else {
                        false
                    }
                }
            };
            if ready {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    fn select_commit(&mut self, cur: TaskId, arms: &[SelectArm], chosen: usize) -> Result<()> {
        match &arms[chosen] {
            SelectArm::Default | SelectArm::TaskReady(_) => Ok(()),
            SelectArm::Recv(op) => {
                let v = self.eval_operand(op)?;
                let cid = self.task_id_of(&v)?;
                match self.exec.try_recv(cid)? {
                    RecvOutcome::Value(value) => {
                        if cur != 0 {
                            // Conveyed to the ChanRecv the chosen arm's
                            // block executes next.
                            self.exec.task_mut(cur)?.resume = Resume::ChanRecvValue(value);
                        } else {
                            self.exec.chan_unpop(cid, value);
                        }
                    }
                    RecvOutcome::Closed => {
                        if cur != 0 {
                            self.exec.task_mut(cur)?.resume = Resume::ChanRecvClosed;
                        }
                    }
                    RecvOutcome::Empty => {}
                }
                Ok(())
            }
            SelectArm::Send(op, vop) => {
                let c = self.eval_operand(op)?;
                let cid = self.task_id_of(&c)?;
                let v = self.eval_operand(vop)?;
                match self.exec.try_send(cid, v)? {
                    SendOutcome::Sent => Ok(()),
                    SendOutcome::Closed(v) => {
                        self.heap.drop_value(v);
                        Err(send_on_closed())
                    }
                    SendOutcome::Full(v) => {
                        self.heap.drop_value(v);
                        Ok(())
                    }
                }
            }
            SelectArm::Timeout(op, _) => {
                let v = self.eval_operand(op)?;
                let tid = self.task_id_of(&v)?;
                if self.exec.task(tid)?.status != Status::Done {
                    self.exec.cancel(tid);
                }
                Ok(())
            }
        }
    }

    fn select_finish(&mut self, dst: &Place, chosen: usize, ready_bb: BlockId) -> Result<Step> {
        let ty = {
            let t = self.place_type(Some(dst));
            if t == NO_TYPE {
                self.types.builtins().int
            } else {
                t
            }
        };
        self.store_place(dst, Value::Int(chosen as i64, ty))?;
        Ok(Step::Jump(ready_bb))
    }

    // Subscribe the task under every arm's park key, arming per-arm
    // timers once and keeping them across park/wake cycles.
    fn select_subscribe(&mut self, cur: TaskId, arms: &[SelectArm]) -> Result<()> {
        if self.exec.task(cur)?.select.is_none() {
            let sid = self.exec.next_select_id();
            self.exec.task_mut(cur)?.select = Some(crate::exec::SelectState {
                id: sid,
                subs: Vec::new(),
                timers: std::collections::HashMap::new(),
            });
        }
        for (i, arm) in arms.iter().enumerate() {
            let keys: Vec<ParkKey> = match arm {
                SelectArm::Default => continue,
                SelectArm::TaskReady(op) => {
                    let v = self.eval_operand(op)?;
                    vec![ParkKey::Join(self.task_id_of(&v)?)]
                }
                SelectArm::Recv(op) => {
                    let v = self.eval_operand(op)?;
                    vec![ParkKey::ChanRecv(self.task_id_of(&v)?)]
                }
                SelectArm::Send(op, _) => {
                    let v = self.eval_operand(op)?;
                    vec![ParkKey::ChanSend(self.task_id_of(&v)?)]
                }
                SelectArm::Timeout(op, ms) => {
                    let v = self.eval_operand(op)?;
                    let tid = self.task_id_of(&v)?;
                    let have = self
                        .exec
                        .task(cur)?
                        .select
                        .as_ref()
                        .and_then(|sel| sel.timers.get(&i).copied());
                    let timer = match have {
                        Some(t) => t,
                        None => {
                            let t = self.exec.arm_timer(*ms, cur);
                            if let Some(sel) = self.exec.task_mut(cur)?.select.as_mut() {
                                sel.timers.insert(i, t);
                            }
                            t
                        }
                    };
                    vec![ParkKey::Join(tid), ParkKey::Timer(timer)]
                }
            };
            for key in keys {
                self.exec.subscribe(cur, key);
                if let Some(sel) = self.exec.task_mut(cur)?.select.as_mut() {
                    sel.subs.push(key);
                }
            }
        }
        Ok(())
    }

    // ---- polling ----

    // Drive one task through one poll. Status transitions, parking and
    // completion all happen here; the poll function itself runs in a
    // nested execution context.
    pub(crate) fn poll_task(&mut self, id: TaskId) -> Result<()> {
        let (kind, status) = {
            let t = self.exec.task(id)?;
            (t.kind, t.status)
        };
        if status == Status::Done {
            return Ok(());
        }
        let prev = self.exec.current();
        self.exec.set_current(id);
        self.exec.task_mut(id)?.status = Status::Running;
        let out = self.poll_task_inner(id, kind);
        self.exec.set_current(prev);
        out
    }

    fn poll_task_inner(&mut self, id: TaskId, kind: TaskKind) -> Result<()> {
        match kind {
            TaskKind::Checkpoint => {
                let t = self.exec.task(id)?;
                if t.cancelled {
                    self.exec
                        .complete(&mut self.heap, id, Value::Nothing, ResultKind::Cancelled);
                } else if !t.polled_once {
                    // Yield exactly once.
                    self.exec.task_mut(id)?.polled_once = true;
                    self.exec.requeue(id);
                } else {
                    self.exec
                        .complete(&mut self.heap, id, Value::Nothing, ResultKind::Success);
                }
                Ok(())
            }
            TaskKind::Sleep => {
                let (cancelled, deadline, timer) = {
                    let t = self.exec.task(id)?;
                    (t.cancelled, t.deadline, t.timer)
                };
                if cancelled {
                    self.exec
                        .complete(&mut self.heap, id, Value::Nothing, ResultKind::Cancelled);
                } else if self.exec.clock() >= deadline {
                    self.exec
                        .complete(&mut self.heap, id, Value::Nothing, ResultKind::Success);
                } else {
                    let timer = match timer {
                        Some(t) => t,
                        None => {
                            let delay = deadline - self.exec.clock();
                            let t = self.exec.arm_timer(delay, id);
                            self.exec.task_mut(id)?.timer = Some(t);
                            t
                        }
                    };
                    self.exec.park(id, ParkKey::Timer(timer));
                }
                Ok(())
            }
            TaskKind::Timeout => self.poll_timeout_task(id),
            TaskKind::User => self.poll_user_task(id),
        }
    }

    fn poll_timeout_task(&mut self, id: TaskId) -> Result<()> {
        let (cancelled, target, deadline, result_ty) = {
            let t = self.exec.task(id)?;
            (t.cancelled, t.timeout_target, t.deadline, t.result_ty)
        };
        if cancelled {
            self.exec
                .complete(&mut self.heap, id, Value::Nothing, ResultKind::Cancelled);
            return Ok(());
        }
        let target_done = self
            .exec
            .task(target)
            .map(|t| t.status == Status::Done)
            .unwrap_or(false);
        if target_done {
            let result = self.drain_task(target, result_ty)?;
            self.exec
                .complete(&mut self.heap, id, result, ResultKind::Success);
        } else if self.exec.clock() >= deadline {
            // The deadline wins: cancel the raced task and settle.
            self.exec.cancel(target);
            let result = self.build_cancelled(result_ty);
            self.exec
                .complete(&mut self.heap, id, result, ResultKind::Success);
        } else {
            self.exec.park(id, ParkKey::Join(target));
        }
        Ok(())
    }

    fn poll_user_task(&mut self, id: TaskId) -> Result<()> {
        let poll_fn = self.exec.task(id)?.poll_fn;
        self.pending_park = None;
        let ret = self.run_function(poll_fn, Vec::new())?;
        // The return is read as Poll<T>: Some(v) completes, Nothing
        // stays pending. Anything else is a protocol violation.
        match &ret {
            Value::Tag(h, _) => {
                let tag = self.heap.tag_name(*h)?.to_string();
                match tag.as_str() {
                    "Some" => {
                        let payload = self.heap.tag_field(*h, 0)?.clone();
                        let payload = self.heap.clone_for_share(&payload);
                        self.heap.drop_value(ret);
                        self.exec
                            .complete(&mut self.heap, id, payload, ResultKind::Success);
                        Ok(())
                    }
                    "Nothing" => {
                        self.heap.drop_value(ret);
                        self.task_pending(id)
                    }
                    other => {
                        let msg = format!("poll function returned tag {}", other);
                        self.heap.drop_value(ret);
                        Err(Panic::new(PanicKind::TypeMismatch, msg))
                    }
                }
            }
            Value::Nothing => self.task_pending(id),
            other => {
                let kind = other.kind();
                self.heap.drop_value(ret);
                Err(Panic::new(
                    PanicKind::TypeMismatch,
                    format!("poll function returned {:?}", kind),
                ))
            }
        }
    }

    fn task_pending(&mut self, id: TaskId) -> Result<()> {
        // A cancelled task that reports pending has reached its next
        // suspension point: it completes as Cancelled instead of
        // suspending again.
        if self.exec.task(id)?.cancelled {
            self.pending_park = None;
            self.exec
                .complete(&mut self.heap, id, Value::Nothing, ResultKind::Cancelled);
            return Ok(());
        }
        match self.pending_park.take() {
            Some(key) => self.exec.park(id, key),
            None => self.exec.requeue(id),
        }
        Ok(())
    }

    // Drive ready tasks until `target` completes, then drain it.
    pub(crate) fn run_until_done(&mut self, target: TaskId, expected_ty: TypeId) -> Result<Value> {
        loop {
            if self.exec.task(target)?.status == Status::Done {
                break;
            }
            if let Some(next) = self.exec.ready_pop() {
                self.poll_task(next)?;
            } else if self.exec.advance_clock() {
                continue;
            } else {
                debug!("deadlock while driving task {}", target);
                return Err(self.exec.deadlock());
            }
        }
        self.drain_task(target, expected_ty)
    }

    // Take a completed task's result (cloned) and release the task.
    // A cancelled task yields the Cancelled variant of the expected
    // result type.
    fn drain_task(&mut self, id: TaskId, expected_ty: TypeId) -> Result<Value> {
        let (rk, result) = {
            let t = self.exec.task(id)?;
            (t.result_kind, t.result.clone())
        };
        let out = if rk == ResultKind::Cancelled {
            self.build_cancelled(expected_ty)
        } else {
            self.heap.clone_for_share(&result)
        };
        self.exec.release_task(&mut self.heap, id);
        Ok(out)
    }

    fn build_cancelled(&mut self, ty: TypeId) -> Value {
        if ty == NO_TYPE {
            return Value::Nothing;
        }
        let h = self
            .heap
            .alloc_tag(ty, String::from("Cancelled"), Vec::new());
        Value::Tag(h, ty)
    }

    fn build_some(&mut self, ty: TypeId, v: Value) -> Value {
        let h = self.heap.alloc_tag(ty, String::from("Some"), vec![v]);
        Value::Tag(h, ty)
    }

    // ---- blocking channel ops for the entry context ----

    fn blocking_send(&mut self, cid: u64, v: Value) -> Result<()> {
        let mut pending = v;
        loop {
            match self.exec.try_send(cid, pending)? {
                SendOutcome::Sent => return Ok(()),
                SendOutcome::Closed(v) => {
                    self.heap.drop_value(v);
                    return Err(send_on_closed());
                }
                SendOutcome::Full(v) => {
                    pending = v;
                    if let Some(next) = self.exec.ready_pop() {
                        self.poll_task(next)?;
                    } else if self.exec.advance_clock() {
                        continue;
                    } else {
                        self.heap.drop_value(pending);
                        return Err(self.exec.deadlock());
                    }
                }
            }
        }
    }

    fn blocking_recv(&mut self, cid: u64) -> Result<Option<Value>> {
        loop {
            match self.exec.try_recv(cid)? {
                RecvOutcome::Value(v) => return Ok(Some(v)),
                RecvOutcome::Closed => return Ok(None),
                RecvOutcome::Empty => {
                    if let Some(next) = self.exec.ready_pop() {
                        self.poll_task(next)?;
                    } else if self.exec.advance_clock() {
                        continue;
                    } else {
                        return Err(self.exec.deadlock());
                    }
                }
            }
        }
    }

    // ---- slot writes ----

    // Install a value in a local slot: type-check, release the previous
    // occupant, record the write for the tracer.
    pub(crate) fn write_local(&mut self, frame: usize, id: usize, v: Value) -> Result<()> {
        let (slot_ty, name) = {
            let fr = self
                .stack
                .get(frame)
                .ok_or_else(|| invalid_location("frame gone"))?;
            let slot = fr.local(id)?;
            (slot.ty, slot.name.clone())
        };
        if let Err(e) = self.check_store_type(&v, slot_ty) {
            self.heap.drop_value(v);
            return Err(e);
        }
        let rendered = self.render_value(&v);
        let slot = self.stack[frame].local_mut(id)?;
        let was_live = slot.init && !slot.moved;
        let old = std::mem::replace(&mut slot.value, v);
        slot.init = true;
        slot.moved = false;
        slot.dropped = false;
        if was_live {
            self.heap.drop_value(old);
        }
        self.local_writes.push(LocalWrite {
            local: id,
            name,
            value: rendered,
        });
        Ok(())
    }

    pub(crate) fn write_global(&mut self, id: GlobalId, v: Value) -> Result<()> {
        let ty = {
            let slot = self
                .globals
                .get(id)
                .ok_or_else(|| invalid_location("global id out of range"))?;
            slot.ty
        };
        if let Err(e) = self.check_store_type(&v, ty) {
            self.heap.drop_value(v);
            return Err(e);
        }
        let slot = self.globals.get_mut(id).unwrap();
        let was_live = slot.init;
        let old = std::mem::replace(&mut slot.value, v);
        slot.init = true;
        if was_live {
            self.heap.drop_value(old);
        }
        Ok(())
    }

    pub(crate) fn store_place(&mut self, place: &Place, v: Value) -> Result<()> {
        let loc = match self.eval_place(place) {
            Ok(loc) => loc,
            Err(e) => {
                self.heap.drop_value(v);
                return Err(e);
            }
        };
        self.store_loc(&loc, v)
    }

    // The declared type of a bare destination; projections and absent
    // destinations have none.
    pub(crate) fn place_type(&self, place: Option<&Place>) -> TypeId {
        let place = match place {
            Some(p) if p.is_bare() => p,
            _ => return NO_TYPE,
        };
        match place.base {
            PlaceBase::Local(id) => self
                .stack
                .last()
                .and_then(|fr| fr.locals.get(id))
                .map(|slot| slot.ty)
                .unwrap_or(NO_TYPE),
            PlaceBase::Global(id) => self.globals.get(id).map(|g| g.ty).unwrap_or(NO_TYPE),
        }
    }

    // The static type discipline the MIR producer established; a
    // mismatch here is a lowering bug surfaced loudly.
    fn check_store_type(&self, v: &Value, ty: TypeId) -> Result<()> {
        if ty == NO_TYPE {
            return Ok(());
        }
        let kind = v.kind();
        let ok = match self.types.def(ty) {
            TypeDef::NoType => true,
            TypeDef::Bool => kind == Kind::Bool,
            TypeDef::Int(Width::Any) => kind == Kind::BigInt,
            TypeDef::Int(_) => kind == Kind::Int,
            TypeDef::Uint(Width::Any) => kind == Kind::BigUint,
            TypeDef::Uint(_) => kind == Kind::Int,
            TypeDef::Float(Width::Any) => kind == Kind::BigFloat,
            TypeDef::Float(_) => false,
            TypeDef::Str => kind == Kind::Str,
            TypeDef::Array(_) => kind == Kind::Array,
            TypeDef::Struct { .. } => kind == Kind::Struct,
            TypeDef::Union { .. } => kind == Kind::Tag || kind == Kind::Nothing,
            TypeDef::Pointer(_) => {
                kind == Kind::Ptr || kind == Kind::Ref || kind == Kind::RefMut
            }
            TypeDef::Range => kind == Kind::Range,
            TypeDef::Task(_) | TypeDef::Scope | TypeDef::Channel(_) => kind == Kind::Int,
            TypeDef::Alias(_) => true,
        };
        if ok {
            Ok(())
        } else {
            Err(Panic::new(
                PanicKind::TypeMismatch,
                format!(
                    "cannot store {:?} into a slot of type {}",
                    kind,
                    self.types.name(ty)
                ),
            ))
        }
    }

    // Runtime ids (tasks, scopes, channels) travel as integers.
    fn task_id_of(&mut self, v: &Value) -> Result<u64> {
        match v {
            Value::Int(id, _) if *id > 0 => Ok(*id as u64),
            _ => Err(crate::error::invalid_handle(0)),
        }
    }
}

fn send_on_closed() -> Panic {
    Panic::new(
        PanicKind::SendOnClosed,
        String::from("send on a closed channel"),
    )
}
