// Tracing and inspection.
//
// The dispatcher reports one event per executed instruction and one
// per heap store; sinks decide what to do with them. The inspector
// renders point-in-time views of locals, the frame stack and the live
// heap for a debugger front end.

use std::io::Write;

use regex::Regex;
use serde::Serialize;

use crate::error::Panic;
use crate::heap::{ObjectKind, StrRepr};
use crate::mir::{Instr, Span};
use crate::value::{Location, Value};
use crate::vm::Vm;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LocalWrite {
    pub local: usize,
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct InstrEvent {
    pub depth: usize,
    pub func: String,
    pub bb: usize,
    pub ip: usize,
    pub instr: String,
    pub span: Span,
    pub local_writes: Vec<LocalWrite>,
}

#[derive(Serialize, Debug, Clone)]
pub struct StoreEvent {
    pub location: String,
    pub value: String,
}

// Sink for execution events. All methods default to no-ops so a sink
// implements only what it cares about.
pub trait Tracer {
    fn instr(&mut self, _event: &InstrEvent) {}
    fn store(&mut self, _event: &StoreEvent) {}
    fn panic(&mut self, _panic: &Panic) {}
}

pub struct NullTracer;

impl Tracer for NullTracer {}

// One JSON object per line, suitable for piping into other tools.
pub struct JsonTracer<W: Write> {
    out: W,
}

impl<W: Write> JsonTracer<W> {
    pub fn new(out: W) -> JsonTracer<W> {
        JsonTracer { out }
    }
}

impl<W: Write> Tracer for JsonTracer<W> {
    fn instr(&mut self, event: &InstrEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(self.out, "{}", line);
        }
    }

    fn store(&mut self, event: &StoreEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(self.out, "{}", line);
        }
    }

    fn panic(&mut self, panic: &Panic) {
        let _ = writeln!(
            self.out,
            "{}",
            serde_json::json!({
                "panic": format!("{:?}", panic.kind),
                "message": panic.message,
                "span": panic.span,
            })
        );
    }
}

// Collects everything; used by tests to assert on the event stream.
#[derive(Default)]
pub struct Recording {
    pub instrs: Vec<InstrEvent>,
    pub stores: Vec<StoreEvent>,
    pub panics: Vec<Panic>,
}

impl Tracer for Recording {
    fn instr(&mut self, event: &InstrEvent) {
        self.instrs.push(event.clone());
    }

    fn store(&mut self, event: &StoreEvent) {
        self.stores.push(event.clone());
    }

    fn panic(&mut self, panic: &Panic) {
        self.panics.push(panic.clone());
    }
}

lazy_static! {
    // "L<id>" selects a local by id, anything else by name.
    static ref LOCAL_ID: Regex = Regex::new(r"^L(\d+)$").unwrap();
}

impl<'m> Vm<'m> {
    pub(crate) fn trace_instr(
        &mut self,
        depth: usize,
        func: &str,
        bb: usize,
        ip: usize,
        instr: &Instr,
    ) {
        let event = InstrEvent {
            depth,
            func: String::from(func),
            bb,
            ip,
            instr: instr_mnemonic(instr),
            span: instr.span,
            local_writes: std::mem::replace(&mut self.local_writes, Vec::new()),
        };
        self.tracer.instr(&event);
    }

    pub(crate) fn trace_store(&mut self, loc: &Location) {
        let value = match self.peek_loc(loc) {
            Ok(v) => self.render_value(&v),
            Err(_) => String::from("<gone>"),
        };
        let event = StoreEvent {
            location: self.render_location(loc),
            value,
        };
        self.tracer.store(&event);
    }

    // ---- the inspector ----

    // A local of the top frame, selected by name or "L<id>".
    pub fn print_local(&self, selector: &str) -> Option<String> {
        let frame = self.stack.last()?;
        let (id, slot) = if let Some(caps) = LOCAL_ID.captures(selector) {
            let id: usize = caps.get(1)?.as_str().parse().ok()?;
            (id, frame.locals.get(id)?)
        } else {
            let id = frame.locals.iter().position(|s| s.name == selector)?;
            (id, &frame.locals[id])
        };
        let state = if slot.moved {
            " [moved]"
        } else if slot.dropped {
            " [dropped]"
        } else if !slot.init {
            " [uninit]"
        } else {
            ""
        };
        Some(format!(
            "L{} {}: {} = {}{}",
            id,
            slot.name,
            self.types.name(slot.ty),
            self.render_value(&slot.value),
            state
        ))
    }

    pub fn dump_stack(&self) -> String {
        let mut out = String::new();
        for (i, frame) in self.stack.iter().enumerate().rev() {
            let name = self
                .module
                .functions
                .get(frame.func)
                .map(|f| f.name.as_str())
                .unwrap_or("<unknown>");
            out.push_str(&format!(
                "#{} {} bb{} ip{}\n",
                self.stack.len() - 1 - i,
                name,
                frame.bb,
                frame.ip
            ));
        }
        out
    }

    // Live handles with kind, length, type and refcount.
    pub fn heap_summary(&self) -> String {
        let mut entries: Vec<String> = self
            .heap
            .handles()
            .map(|(h, obj)| {
                let what = match &obj.kind {
                    ObjectKind::Str(StrRepr::Flat(b)) => format!("str flat len={}", b.len()),
                    ObjectKind::Str(StrRepr::Concat { byte_len, .. }) => {
                        format!("str rope len={}", byte_len)
                    }
                    ObjectKind::Str(StrRepr::Slice { byte_len, .. }) => {
                        format!("str slice len={}", byte_len)
                    }
                    ObjectKind::Array(v) => format!("array len={}", v.len()),
                    ObjectKind::ArraySlice { len, .. } => format!("array slice len={}", len),
                    ObjectKind::Map(m) => format!("map len={}", m.len()),
                    ObjectKind::Struct(f) => format!("struct fields={}", f.len()),
                    ObjectKind::Tag { tag, .. } => format!("tag {}", tag),
                    ObjectKind::Range(_) => String::from("range"),
                    ObjectKind::BigInt(_) => String::from("bigint"),
                    ObjectKind::BigUint(_) => String::from("biguint"),
                    ObjectKind::BigFloat(_) => String::from("bigfloat"),
                };
                format!(
                    "#{} {} ty={} refs={}",
                    h,
                    what,
                    self.types.name(obj.ty),
                    obj.refs
                )
            })
            .collect();
        entries.sort();
        entries.join("\n")
    }

    pub(crate) fn render_value(&self, v: &Value) -> String {
        match v {
            Value::Invalid => String::from("<invalid>"),
            Value::Nothing => String::from("nothing"),
            Value::Bool(b, _) => format!("{}", b),
            Value::Int(i, _) => format!("{}", i),
            Value::BigInt(h, _) => match self.heap.bigint(*h) {
                Ok(b) => format!("{}", b),
                Err(_) => format!("bigint #{}", h),
            },
            Value::BigUint(h, _) => match self.heap.biguint(*h) {
                Ok(b) => format!("{}", b),
                Err(_) => format!("biguint #{}", h),
            },
            Value::BigFloat(h, _) => match self.heap.bigfloat(*h) {
                Ok(f) => format!("{}", f),
                Err(_) => format!("bigfloat #{}", h),
            },
            Value::Str(h, _) => match self.heap.str_bytes(*h) {
                Ok(bytes) => format!("{:?}", String::from_utf8_lossy(&bytes)),
                Err(_) => format!("str #{}", h),
            },
            Value::Array(h, _) => format!("array #{}", h),
            Value::Struct(h, _) => format!("struct #{}", h),
            Value::Tag(h, _) => match self.heap.tag_name(*h) {
                Ok(tag) => format!("tag {} #{}", tag, h),
                Err(_) => format!("tag #{}", h),
            },
            Value::Range(h, _) => format!("range #{}", h),
            Value::Ref(loc) => format!("&{}", self.render_location(loc)),
            Value::RefMut(loc) => format!("&mut {}", self.render_location(loc)),
            Value::Ptr(loc) => format!("*{}", self.render_location(loc)),
        }
    }

    pub(crate) fn render_location(&self, loc: &Location) -> String {
        match loc {
            Location::Local { frame, id, .. } => format!("local {}.{}", frame, id),
            Location::Global { id, .. } => format!("global {}", id),
            Location::Field { handle, index, .. } => format!("#{}.{}", handle, index),
            Location::ArrayElem { handle, index, .. } => format!("#{}[{}]", handle, index),
            Location::StringBytes { handle, offset } => format!("#{}@{}", handle, offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PanicKind;
    use crate::mir::InstrKind;

    #[test]
    fn test_json_tracer_emits_lines() {
        let mut sink = JsonTracer::new(Vec::new());
        sink.instr(&InstrEvent {
            depth: 1,
            func: String::from("main"),
            bb: 0,
            ip: 0,
            instr: String::from("assign"),
            span: Span::none(),
            local_writes: vec![LocalWrite {
                local: 0,
                name: String::from("x"),
                value: String::from("5"),
            }],
        });
        sink.panic(&Panic::new(
            PanicKind::OutOfBounds,
            String::from("division by zero"),
        ));
        let text = String::from_utf8(sink.out).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().contains("\"instr\":\"assign\""));
        assert!(lines.next().unwrap().contains("OutOfBounds"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_mnemonics() {
        assert_eq!(instr_mnemonic(&Instr::new(InstrKind::Nop)), "nop");
        assert_eq!(
            instr_mnemonic(&Instr::new(InstrKind::Jump { bb: 3 })),
            "jump bb3"
        );
    }
}

// A short operator-style name for the trace stream.
fn instr_mnemonic(instr: &Instr) -> String {
    use crate::mir::InstrKind::*;
    match &instr.kind {
        Nop => String::from("nop"),
        Assign { .. } => String::from("assign"),
        Call { callee, .. } => format!("call {}", callee),
        Jump { bb } => format!("jump bb{}", bb),
        Branch { .. } => String::from("branch"),
        Return { .. } => String::from("return"),
        Drop { .. } => String::from("drop"),
        EndBorrow { .. } => String::from("end_borrow"),
        Spawn { .. } => String::from("spawn"),
        Await { .. } => String::from("await"),
        Poll { .. } => String::from("poll"),
        JoinAll { .. } => String::from("join_all"),
        ChanSend { .. } => String::from("chan_send"),
        ChanRecv { .. } => String::from("chan_recv"),
        Timeout { ms, .. } => format!("timeout {}ms", ms),
        Select { arms, .. } => format!("select /{}", arms.len()),
    }
}
