// Operand, place, and rvalue evaluation.
//
// Every evaluator returns a value or a panic. An evaluator that has
// consumed operands owns them: on the error path it drops what it
// already holds before propagating, so a failing instruction never
// strands a reference.

use num_bigint::{BigInt, BigUint};

use crate::error::{
    expected, invalid_location, out_of_bounds, overflow, type_mismatch, unimplemented, Panic,
    PanicKind, Result,
};
use crate::heap::{cp_count, cp_to_byte, RangeRepr};
use crate::mir::{BinOp, Const, Operand, Place, PlaceBase, Projection, RValue, UnOp};
use crate::types::{TypeDef, TypeId, Width, NO_TYPE};
use crate::value::{Handle, Kind, Location, Value};
use crate::vm::Vm;

impl<'m> Vm<'m> {
    // ---- operands ----

    pub fn eval_operand(&mut self, op: &Operand) -> Result<Value> {
        match op {
            Operand::Const(c) => self.eval_const(c),
            Operand::Copy(place) => {
                let loc = self.eval_place(place)?;
                let v = self.peek_loc(&loc)?;
                Ok(self.heap.clone_for_share(&v))
            }
            Operand::Move(place) => self.eval_move(place),
            Operand::AddrOf(place) => {
                let loc = self.eval_place(place)?;
                Ok(Value::Ref(loc.with_mut(false)))
            }
            Operand::AddrOfMut(place) => {
                let loc = self.eval_place(place)?;
                if !loc.is_mut() {
                    return Err(invalid_location("mutable borrow of immutable location"));
                }
                Ok(Value::RefMut(loc))
            }
        }
    }

    fn eval_const(&mut self, c: &Const) -> Result<Value> {
        let b = self.types.builtins();
        match c {
            Const::Unit => Ok(Value::Nothing),
            Const::Bool(v) => Ok(Value::Bool(*v, b.boolean)),
            Const::Int(v, ty) => {
                let ty = if *ty == NO_TYPE { b.int } else { *ty };
                Ok(Value::Int(*v, ty))
            }
            Const::Str(text) => {
                let ty = b.string;
                let h = self.heap.alloc_string(ty, text.as_bytes().to_vec());
                Ok(Value::Str(h, ty))
            }
            Const::BigLit(text, ty) => self.eval_big_literal(text, *ty),
            Const::Func(name) => match self.module.function(name) {
                Some(id) => Ok(Value::Int(id as i64, NO_TYPE)),
                None => Err(unimplemented(&format!("unknown function {}", name))),
            },
        }
    }

    // An arbitrary-width literal kept textual by the frontend, parsed
    // here against its destination classification.
    fn eval_big_literal(&mut self, text: &str, ty: TypeId) -> Result<Value> {
        let parse_err = |reason: &str| {
            Panic::new(
                PanicKind::TypeMismatch,
                format!("literal {:?} does not parse: {}", text, reason),
            )
        };
        match self.types.def(ty) {
            TypeDef::Int(Width::Any) => match text.parse::<BigInt>() {
                Ok(v) => Ok(Value::BigInt(self.heap.alloc_bigint(ty, v), ty)),
                Err(e) => Err(parse_err(&e.to_string())),
            },
            TypeDef::Uint(Width::Any) => match text.parse::<BigUint>() {
                Ok(v) => Ok(Value::BigUint(self.heap.alloc_biguint(ty, v), ty)),
                Err(e) => Err(parse_err(&e.to_string())),
            },
            TypeDef::Float(Width::Any) => match text.parse::<f64>() {
                Ok(v) => Ok(Value::BigFloat(self.heap.alloc_bigfloat(ty, v), ty)),
                Err(e) => Err(parse_err(&e.to_string())),
            },
            TypeDef::Int(_) | TypeDef::Uint(_) => match text.parse::<i64>() {
                Ok(v) => Ok(Value::Int(v, ty)),
                Err(e) => Err(parse_err(&e.to_string())),
            },
            TypeDef::Float(_) => Err(Panic::new(
                PanicKind::FloatUnsupported,
                String::from("fixed-width float literals are not supported"),
            )),
            _ => Err(parse_err("destination is not numeric")),
        }
    }

    // Moves are only defined for bare locals; the borrow checker
    // rejects projected moves before they reach the runtime.
    fn eval_move(&mut self, place: &Place) -> Result<Value> {
        if !place.is_bare() {
            return Err(unimplemented("move out of a projected place"));
        }
        let id = match place.base {
            PlaceBase::Local(id) => id,
            PlaceBase::Global(_) => return Err(unimplemented("move out of a global")),
        };
        let frame = self
            .stack
            .last_mut()
            .ok_or_else(|| invalid_location("no active frame"))?;
        let slot = frame.local_mut(id)?;
        if !slot.is_live() {
            return Err(invalid_location("move from a dead local"));
        }
        let v = std::mem::replace(&mut slot.value, Value::Invalid);
        slot.init = false;
        slot.moved = true;
        Ok(v)
    }

    // ---- places ----

    pub fn eval_place(&mut self, place: &Place) -> Result<Location> {
        let mut loc = match place.base {
            PlaceBase::Local(id) => Location::Local {
                frame: self.stack.len().saturating_sub(1),
                id,
                mutable: true,
            },
            PlaceBase::Global(id) => Location::Global { id, mutable: true },
        };
        for proj in &place.proj {
            loc = match proj {
                Projection::Field(index) => {
                    let v = self.peek_loc(&loc)?;
                    match v {
                        Value::Struct(handle, _) => Location::Field {
                            handle,
                            index: *index,
                            mutable: loc.is_mut(),
                        },
                        other => return Err(expected(Kind::Struct.into(), other.kind())),
                    }
                }
                Projection::Index(op) => {
                    let idx = self.eval_operand(op)?;
                    let i = match idx {
                        Value::Int(i, _) => i,
                        other => {
                            let kind = other.kind();
                            self.heap.drop_value(other);
                            return Err(expected(Kind::Int.into(), kind));
                        }
                    };
                    if i < 0 {
                        return Err(out_of_bounds(0, 0));
                    }
                    let v = self.peek_loc(&loc)?;
                    match v {
                        Value::Array(handle, _) => {
                            let (base, index) = self.heap.array_resolve(handle, i as usize)?;
                            Location::ArrayElem {
                                handle: base,
                                index,
                                mutable: loc.is_mut(),
                            }
                        }
                        other => return Err(expected(Kind::Array.into(), other.kind())),
                    }
                }
                Projection::Deref => {
                    let v = self.peek_loc(&loc)?;
                    match v {
                        Value::Ref(target) => target.with_mut(false),
                        Value::RefMut(target) => target,
                        Value::Ptr(target @ Location::StringBytes { .. }) => target,
                        _ => return Err(invalid_location("deref of a non-reference")),
                    }
                }
            };
        }
        Ok(loc)
    }

    // A non-owning snapshot of the value stored at a location. The
    // caller must not drop the snapshot through the heap; ownership
    // stays with the cell.
    pub fn peek_loc(&self, loc: &Location) -> Result<Value> {
        match loc {
            Location::Local { frame, id, .. } => {
                let fr = self
                    .stack
                    .get(*frame)
                    .ok_or_else(|| invalid_location("frame gone"))?;
                let slot = fr.local(*id)?;
                if !slot.is_live() {
                    return Err(invalid_location("read of a dead local"));
                }
                Ok(slot.value.clone())
            }
            Location::Global { id, .. } => {
                let slot = self
                    .globals
                    .get(*id)
                    .ok_or_else(|| invalid_location("global id out of range"))?;
                if !slot.init {
                    return Err(invalid_location("read of an uninitialized global"));
                }
                Ok(slot.value.clone())
            }
            Location::Field { handle, index, .. } => {
                Ok(self.heap.struct_get(*handle, *index)?.clone())
            }
            Location::ArrayElem { handle, index, .. } => {
                Ok(self.heap.array_get(*handle, *index)?.clone())
            }
            Location::StringBytes { handle, offset } => {
                let byte = self.heap.str_byte_at(*handle, *offset)?;
                Ok(Value::Int(byte as i64, self.types.builtins().uint8))
            }
        }
    }

    // An owning read: the snapshot plus a retain on heap kinds.
    pub fn load_loc(&mut self, loc: &Location) -> Result<Value> {
        let v = self.peek_loc(loc)?;
        Ok(self.heap.clone_for_share(&v))
    }

    // Install a value at a location, releasing whatever was there.
    pub fn store_loc(&mut self, loc: &Location, v: Value) -> Result<()> {
        match loc {
            Location::Local { frame, id, .. } => self.write_local(*frame, *id, v),
            Location::Global { id, .. } => self.write_global(*id, v),
            Location::Field { handle, index, mutable } => {
                if !mutable {
                    self.heap.drop_value(v);
                    return Err(invalid_location("store through an immutable field"));
                }
                let old = self.heap.struct_set(*handle, *index, v)?;
                self.heap.drop_value(old);
                self.trace_store(loc);
                Ok(())
            }
            Location::ArrayElem { handle, index, mutable } => {
                if !mutable {
                    self.heap.drop_value(v);
                    return Err(invalid_location("store through an immutable element"));
                }
                let old = self.heap.array_set(*handle, *index, v)?;
                self.heap.drop_value(old);
                self.trace_store(loc);
                Ok(())
            }
            Location::StringBytes { .. } => {
                self.heap.drop_value(v);
                Err(invalid_location("strings are immutable"))
            }
        }
    }

    // ---- rvalues ----

    pub fn eval_rvalue(&mut self, rv: &RValue) -> Result<Value> {
        match rv {
            RValue::Use(op) => self.eval_operand(op),
            RValue::Binary(op, x, y) => {
                let a = self.eval_operand(x)?;
                let b = match self.eval_operand(y) {
                    Ok(b) => b,
                    Err(e) => {
                        self.heap.drop_value(a);
                        return Err(e);
                    }
                };
                self.binary_value(*op, a, b)
            }
            RValue::Unary(op, x) => {
                let a = self.eval_operand(x)?;
                self.unary_value(*op, a)
            }
            RValue::Cast(x, ty) => {
                let a = self.eval_operand(x)?;
                self.convert(a, *ty)
            }
            RValue::Index(obj, idx) => {
                let a = self.eval_operand(obj)?;
                let b = match self.eval_operand(idx) {
                    Ok(b) => b,
                    Err(e) => {
                        self.heap.drop_value(a);
                        return Err(e);
                    }
                };
                self.index_value(a, b)
            }
            RValue::StructLit(ty, ops) => {
                let fields = self.eval_operand_list(ops)?;
                let h = self.heap.alloc_struct(*ty, fields);
                Ok(Value::Struct(h, *ty))
            }
            RValue::ArrayLit(ty, ops) => {
                let elems = self.eval_operand_list(ops)?;
                let h = self.heap.alloc_array(*ty, elems);
                Ok(Value::Array(h, *ty))
            }
            RValue::TagLit(ty, tag, ops) => {
                let fields = self.eval_operand_list(ops)?;
                let h = self.heap.alloc_tag(*ty, tag.clone(), fields);
                Ok(Value::Tag(h, *ty))
            }
            RValue::Field(obj, index) => {
                let a = self.eval_operand(obj)?;
                match a {
                    Value::Struct(h, _) => {
                        let v = match self.heap.struct_get(h, *index) {
                            Ok(v) => v.clone(),
                            Err(e) => {
                                self.heap.drop_value(a);
                                return Err(e);
                            }
                        };
                        let out = self.heap.clone_for_share(&v);
                        self.heap.drop_value(a);
                        Ok(out)
                    }
                    other => {
                        let kind = other.kind();
                        self.heap.drop_value(other);
                        Err(expected(Kind::Struct.into(), kind))
                    }
                }
            }
            RValue::TagTest(obj, tag) => {
                let a = self.eval_operand(obj)?;
                let boolean = self.types.builtins().boolean;
                match a {
                    Value::Tag(h, _) => {
                        let hit = self.heap.tag_name(h)? == tag.as_str();
                        self.heap.drop_value(a);
                        Ok(Value::Bool(hit, boolean))
                    }
                    // A payload-less union value may be the bare unit.
                    Value::Nothing => Ok(Value::Bool(tag == "Nothing", boolean)),
                    other => {
                        let kind = other.kind();
                        self.heap.drop_value(other);
                        Err(expected(Kind::Tag.into(), kind))
                    }
                }
            }
            RValue::TagPayload(obj, tag, index) => {
                let a = self.eval_operand(obj)?;
                match a {
                    Value::Tag(h, _) => {
                        let found = match self.heap.tag_name(h) {
                            Ok(name) => name.to_string(),
                            Err(e) => {
                                self.heap.drop_value(a);
                                return Err(e);
                            }
                        };
                        if found != *tag {
                            self.heap.drop_value(a);
                            return Err(Panic::new(
                                PanicKind::TypeMismatch,
                                format!("payload of tag {} requested, value is {}", tag, found),
                            ));
                        }
                        let v = match self.heap.tag_field(h, *index) {
                            Ok(v) => v.clone(),
                            Err(e) => {
                                self.heap.drop_value(a);
                                return Err(e);
                            }
                        };
                        let out = self.heap.clone_for_share(&v);
                        self.heap.drop_value(a);
                        Ok(out)
                    }
                    other => {
                        let kind = other.kind();
                        self.heap.drop_value(other);
                        Err(expected(Kind::Tag.into(), kind))
                    }
                }
            }
            RValue::Range {
                start,
                end,
                inclusive,
            } => {
                let lo = match start {
                    Some(op) => Some(self.eval_int_operand(op)?),
                    None => None,
                };
                let hi = match end {
                    Some(op) => Some(self.eval_int_operand(op)?),
                    None => None,
                };
                let h = self.heap.alloc_range(
                    NO_TYPE,
                    RangeRepr::Bounds {
                        start: lo,
                        end: hi,
                        inclusive: *inclusive,
                    },
                )?;
                Ok(Value::Range(h, NO_TYPE))
            }
        }
    }

    // Evaluate a list left to right, releasing the prefix on failure.
    pub(crate) fn eval_operand_list(&mut self, ops: &[Operand]) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            match self.eval_operand(op) {
                Ok(v) => out.push(v),
                Err(e) => {
                    for v in out {
                        self.heap.drop_value(v);
                    }
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    fn eval_int_operand(&mut self, op: &Operand) -> Result<i64> {
        match self.eval_operand(op)? {
            Value::Int(i, _) => Ok(i),
            other => {
                let kind = other.kind();
                self.heap.drop_value(other);
                Err(expected(Kind::Int.into(), kind))
            }
        }
    }

    // ---- operators ----

    pub fn binary_value(&mut self, op: BinOp, a: Value, b: Value) -> Result<Value> {
        let boolean = self.types.builtins().boolean;
        match (&a, &b) {
            (Value::Int(x, ty), Value::Int(y, _)) => {
                let (x, y, ty) = (*x, *y, *ty);
                self.int_binop(op, x, y, ty, boolean)
            }
            (Value::Bool(x, ty), Value::Bool(y, _)) => {
                let (x, y, ty) = (*x, *y, *ty);
                match op {
                    BinOp::And => Ok(Value::Bool(x && y, ty)),
                    BinOp::Or => Ok(Value::Bool(x || y, ty)),
                    BinOp::Eq => Ok(Value::Bool(x == y, boolean)),
                    BinOp::Ne => Ok(Value::Bool(x != y, boolean)),
                    _ => Err(type_mismatch(Kind::Bool, Kind::Bool)),
                }
            }
            (Value::BigInt(..), Value::BigInt(..)) => self.bigint_binop(op, a, b),
            (Value::BigUint(..), Value::BigUint(..)) => self.biguint_binop(op, a, b),
            (Value::BigFloat(..), Value::BigFloat(..)) => self.bigfloat_binop(op, a, b),
            (Value::Str(..), Value::Str(..)) => self.string_binop(op, a, b),
            _ if a.is_heap() && b.is_heap() && a.kind() == b.kind() => {
                // Non-string heap values compare by identity.
                let kind = a.kind();
                let hit = a.handle() == b.handle();
                self.heap.drop_value(a);
                self.heap.drop_value(b);
                match op {
                    BinOp::Eq => Ok(Value::Bool(hit, boolean)),
                    BinOp::Ne => Ok(Value::Bool(!hit, boolean)),
                    _ => Err(type_mismatch(kind, kind)),
                }
            }
            _ => {
                let (ka, kb) = (a.kind(), b.kind());
                self.heap.drop_value(a);
                self.heap.drop_value(b);
                Err(type_mismatch(ka, kb))
            }
        }
    }

    // Fixed-width integers overflow loudly, never silently.
    fn int_binop(&self, op: BinOp, x: i64, y: i64, ty: TypeId, boolean: TypeId) -> Result<Value> {
        let div_zero = || Panic::new(PanicKind::OutOfBounds, String::from("division by zero"));
        match op {
            BinOp::Add => Ok(Value::Int(x.checked_add(y).ok_or_else(|| overflow("+"))?, ty)),
            BinOp::Sub => Ok(Value::Int(x.checked_sub(y).ok_or_else(|| overflow("-"))?, ty)),
            BinOp::Mul => Ok(Value::Int(x.checked_mul(y).ok_or_else(|| overflow("*"))?, ty)),
            BinOp::Div => {
                if y == 0 {
                    return Err(div_zero());
                }
                Ok(Value::Int(x.checked_div(y).ok_or_else(|| overflow("/"))?, ty))
            }
            BinOp::Mod => {
                if y == 0 {
                    return Err(div_zero());
                }
                Ok(Value::Int(x.checked_rem(y).ok_or_else(|| overflow("%"))?, ty))
            }
            BinOp::Eq => Ok(Value::Bool(x == y, boolean)),
            BinOp::Ne => Ok(Value::Bool(x != y, boolean)),
            BinOp::Lt => Ok(Value::Bool(x < y, boolean)),
            BinOp::Le => Ok(Value::Bool(x <= y, boolean)),
            BinOp::Gt => Ok(Value::Bool(x > y, boolean)),
            BinOp::Ge => Ok(Value::Bool(x >= y, boolean)),
            BinOp::And | BinOp::Or | BinOp::Concat => Err(type_mismatch(Kind::Int, Kind::Int)),
        }
    }

    fn bigint_binop(&mut self, op: BinOp, a: Value, b: Value) -> Result<Value> {
        let boolean = self.types.builtins().boolean;
        let ty = a.type_id();
        let (ha, hb) = (a.handle().unwrap(), b.handle().unwrap());
        let x = self.heap.bigint(ha)?.clone();
        let y = self.heap.bigint(hb)?.clone();
        self.heap.drop_value(a);
        self.heap.drop_value(b);
        let num = |vm: &mut Vm<'m>, v: BigInt| {
            let h = vm.heap.alloc_bigint(ty, v);
            Value::BigInt(h, ty)
        };
        match op {
            BinOp::Add => Ok(num(self, x + y)),
            BinOp::Sub => Ok(num(self, x - y)),
            BinOp::Mul => Ok(num(self, x * y)),
            BinOp::Div => {
                if y == BigInt::from(0) {
                    return Err(Panic::new(
                        PanicKind::OutOfBounds,
                        String::from("division by zero"),
                    ));
                }
                Ok(num(self, x / y))
            }
            BinOp::Mod => {
                if y == BigInt::from(0) {
                    return Err(Panic::new(
                        PanicKind::OutOfBounds,
                        String::from("division by zero"),
                    ));
                }
                Ok(num(self, x % y))
            }
            BinOp::Eq => Ok(Value::Bool(x == y, boolean)),
            BinOp::Ne => Ok(Value::Bool(x != y, boolean)),
            BinOp::Lt => Ok(Value::Bool(x < y, boolean)),
            BinOp::Le => Ok(Value::Bool(x <= y, boolean)),
            BinOp::Gt => Ok(Value::Bool(x > y, boolean)),
            BinOp::Ge => Ok(Value::Bool(x >= y, boolean)),
            _ => Err(type_mismatch(Kind::BigInt, Kind::BigInt)),
        }
    }

    fn biguint_binop(&mut self, op: BinOp, a: Value, b: Value) -> Result<Value> {
        let boolean = self.types.builtins().boolean;
        let ty = a.type_id();
        let (ha, hb) = (a.handle().unwrap(), b.handle().unwrap());
        let x = self.heap.biguint(ha)?.clone();
        let y = self.heap.biguint(hb)?.clone();
        self.heap.drop_value(a);
        self.heap.drop_value(b);
        let num = |vm: &mut Vm<'m>, v: BigUint| {
            let h = vm.heap.alloc_biguint(ty, v);
            Value::BigUint(h, ty)
        };
        match op {
            BinOp::Add => Ok(num(self, x + y)),
            BinOp::Sub => {
                if y > x {
                    return Err(overflow("-"));
                }
                Ok(num(self, x - y))
            }
            BinOp::Mul => Ok(num(self, x * y)),
            BinOp::Div => {
                if y == BigUint::from(0u32) {
                    return Err(Panic::new(
                        PanicKind::OutOfBounds,
                        String::from("division by zero"),
                    ));
                }
                Ok(num(self, x / y))
            }
            BinOp::Mod => {
                if y == BigUint::from(0u32) {
                    return Err(Panic::new(
                        PanicKind::OutOfBounds,
                        String::from("division by zero"),
                    ));
                }
                Ok(num(self, x % y))
            }
            BinOp::Eq => Ok(Value::Bool(x == y, boolean)),
            BinOp::Ne => Ok(Value::Bool(x != y, boolean)),
            BinOp::Lt => Ok(Value::Bool(x < y, boolean)),
            BinOp::Le => Ok(Value::Bool(x <= y, boolean)),
            BinOp::Gt => Ok(Value::Bool(x > y, boolean)),
            BinOp::Ge => Ok(Value::Bool(x >= y, boolean)),
            _ => Err(type_mismatch(Kind::BigUint, Kind::BigUint)),
        }
    }

    fn bigfloat_binop(&mut self, op: BinOp, a: Value, b: Value) -> Result<Value> {
        let boolean = self.types.builtins().boolean;
        let ty = a.type_id();
        let x = self.heap.bigfloat(a.handle().unwrap())?;
        let y = self.heap.bigfloat(b.handle().unwrap())?;
        self.heap.drop_value(a);
        self.heap.drop_value(b);
        let num = |vm: &mut Vm<'m>, v: f64| {
            let h = vm.heap.alloc_bigfloat(ty, v);
            Value::BigFloat(h, ty)
        };
        match op {
            BinOp::Add => Ok(num(self, x + y)),
            BinOp::Sub => Ok(num(self, x - y)),
            BinOp::Mul => Ok(num(self, x * y)),
            BinOp::Div => Ok(num(self, x / y)),
            BinOp::Mod => Ok(num(self, x % y)),
            BinOp::Eq => Ok(Value::Bool(x == y, boolean)),
            BinOp::Ne => Ok(Value::Bool(x != y, boolean)),
            BinOp::Lt => Ok(Value::Bool(x < y, boolean)),
            BinOp::Le => Ok(Value::Bool(x <= y, boolean)),
            BinOp::Gt => Ok(Value::Bool(x > y, boolean)),
            BinOp::Ge => Ok(Value::Bool(x >= y, boolean)),
            _ => Err(type_mismatch(Kind::BigFloat, Kind::BigFloat)),
        }
    }

    fn string_binop(&mut self, op: BinOp, a: Value, b: Value) -> Result<Value> {
        let boolean = self.types.builtins().boolean;
        let ty = a.type_id();
        let (ha, hb) = (a.handle().unwrap(), b.handle().unwrap());
        match op {
            BinOp::Concat => {
                let h = self.heap.alloc_string_concat(ty, ha, hb)?;
                self.heap.drop_value(a);
                self.heap.drop_value(b);
                Ok(Value::Str(h, ty))
            }
            BinOp::Eq | BinOp::Ne => {
                // Strings compare by content, not by handle.
                let hit = self.heap.str_eq(ha, hb)?;
                self.heap.drop_value(a);
                self.heap.drop_value(b);
                Ok(Value::Bool(
                    if op == BinOp::Eq { hit } else { !hit },
                    boolean,
                ))
            }
            _ => {
                self.heap.drop_value(a);
                self.heap.drop_value(b);
                Err(type_mismatch(Kind::Str, Kind::Str))
            }
        }
    }

    pub fn unary_value(&mut self, op: UnOp, a: Value) -> Result<Value> {
        match (op, &a) {
            (UnOp::Neg, Value::Int(x, ty)) => {
                let (x, ty) = (*x, *ty);
                Ok(Value::Int(x.checked_neg().ok_or_else(|| overflow("-"))?, ty))
            }
            (UnOp::Neg, Value::BigInt(h, ty)) => {
                let (h, ty) = (*h, *ty);
                let v = -self.heap.bigint(h)?.clone();
                self.heap.drop_value(a);
                let out = self.heap.alloc_bigint(ty, v);
                Ok(Value::BigInt(out, ty))
            }
            (UnOp::Neg, Value::BigFloat(h, ty)) => {
                let (h, ty) = (*h, *ty);
                let v = -self.heap.bigfloat(h)?;
                self.heap.drop_value(a);
                let out = self.heap.alloc_bigfloat(ty, v);
                Ok(Value::BigFloat(out, ty))
            }
            (UnOp::Not, Value::Bool(x, ty)) => Ok(Value::Bool(!*x, *ty)),
            _ => {
                let kind = a.kind();
                self.heap.drop_value(a);
                Err(expected(
                    Kind::Int | Kind::BigInt | Kind::BigFloat | Kind::Bool,
                    kind,
                ))
            }
        }
    }

    // ---- indexing ----

    pub fn index_value(&mut self, obj: Value, idx: Value) -> Result<Value> {
        let b = *self.types.builtins();
        match (&obj, &idx) {
            (Value::Array(h, _), Value::Int(i, _)) => {
                let (h, i) = (*h, *i);
                if i < 0 {
                    self.heap.drop_value(obj);
                    return Err(out_of_bounds(0, self.heap.array_len(h)?));
                }
                let v = self.heap.array_get(h, i as usize).map(|v| v.clone());
                let v = match v {
                    Ok(v) => v,
                    Err(e) => {
                        self.heap.drop_value(obj);
                        return Err(e);
                    }
                };
                let out = self.heap.clone_for_share(&v);
                self.heap.drop_value(obj);
                Ok(out)
            }
            (Value::Array(h, ty), Value::Range(rh, _)) => {
                let (h, ty, rh) = (*h, *ty, *rh);
                let len = self.heap.array_len(h)?;
                let (lo, hi) = match self.range_bounds(rh, len) {
                    Ok(r) => r,
                    Err(e) => {
                        self.heap.drop_value(obj);
                        self.heap.drop_value(idx);
                        return Err(e);
                    }
                };
                // The slice retains the base; the operand references go
                // away with the operands.
                let slice = self.heap.alloc_array_slice(ty, h, lo, hi - lo, len - lo)?;
                self.heap.drop_value(obj);
                self.heap.drop_value(idx);
                Ok(Value::Array(slice, ty))
            }
            (Value::Str(h, _), Value::Int(i, _)) => {
                let (h, i) = (*h, *i);
                if i < 0 {
                    self.heap.drop_value(obj);
                    return Err(out_of_bounds(0, self.heap.str_cp_len(h)?));
                }
                let cp = self.heap.str_cp_at(h, i as usize);
                self.heap.drop_value(obj);
                Ok(Value::Int(cp? as i64, b.uint32))
            }
            (Value::Str(h, ty), Value::Range(rh, _)) => {
                let (h, ty, rh) = (*h, *ty, *rh);
                let cp_len = self.heap.str_cp_len(h)?;
                let (lo, hi) = match self.range_bounds(rh, cp_len) {
                    Ok(r) => r,
                    Err(e) => {
                        self.heap.drop_value(obj);
                        self.heap.drop_value(idx);
                        return Err(e);
                    }
                };
                let bytes = self.heap.str_bytes(h)?;
                let blo = cp_to_byte(&bytes, lo).ok_or_else(|| out_of_bounds(lo, cp_count(&bytes)))?;
                let bhi = cp_to_byte(&bytes, hi).ok_or_else(|| out_of_bounds(hi, cp_count(&bytes)))?;
                let slice = self
                    .heap
                    .alloc_string_slice(ty, h, lo, hi - lo, bhi - blo)?;
                self.heap.drop_value(obj);
                self.heap.drop_value(idx);
                Ok(Value::Str(slice, ty))
            }
            (Value::Struct(h, ty), Value::Int(i, _)) => {
                let (h, ty, i) = (*h, *ty, *i);
                let out = self.bytes_view_byte(h, ty, i);
                self.heap.drop_value(obj);
                out
            }
            _ => {
                let (ka, kb) = (obj.kind(), idx.kind());
                self.heap.drop_value(obj);
                self.heap.drop_value(idx);
                Err(Panic::new(
                    PanicKind::TypeMismatch,
                    format!("cannot index {:?} with {:?}", ka, kb),
                ))
            }
        }
    }

    // Indexing a bytes-view struct reads a raw byte out of the backing
    // string, bounds-checked against the view's stored length.
    fn bytes_view_byte(&mut self, h: Handle, ty: TypeId, i: i64) -> Result<Value> {
        let b = *self.types.builtins();
        let layout = self.layouts.struct_layout(self.types, ty)?;
        let (ptr_idx, len_idx) = match (layout.field_index("ptr"), layout.field_index("len")) {
            (Some(p), Some(l)) => (p, l),
            _ => {
                return Err(Panic::new(
                    PanicKind::TypeMismatch,
                    format!("type {} is not indexable", self.types.name(ty)),
                ))
            }
        };
        let ptr = self.heap.struct_get(h, ptr_idx)?.clone();
        let len = match self.heap.struct_get(h, len_idx)? {
            Value::Int(l, _) => *l,
            other => return Err(expected(Kind::Int.into(), other.kind())),
        };
        let (owner, offset) = match ptr {
            Value::Ptr(Location::StringBytes { handle, offset }) => (handle, offset),
            other => return Err(expected(Kind::Ptr.into(), other.kind())),
        };
        if i < 0 || i >= len {
            return Err(out_of_bounds(i.max(0) as usize, len.max(0) as usize));
        }
        let byte = self.heap.str_byte_at(owner, offset + i as usize)?;
        Ok(Value::Int(byte as i64, b.uint8))
    }

    // Interpret a range descriptor against a container of length `len`.
    fn range_bounds(&self, rh: Handle, len: usize) -> Result<(usize, usize)> {
        let (start, end, inclusive) = match &self.heap.get(rh)?.kind {
            crate::heap::ObjectKind::Range(RangeRepr::Bounds {
                start,
                end,
                inclusive,
            }) => (*start, *end, *inclusive),
            _ => {
                return Err(Panic::new(
                    PanicKind::TypeMismatch,
                    String::from("not a bounds range"),
                ))
            }
        };
        let lo = start.unwrap_or(0);
        let mut hi = end.unwrap_or(len as i64);
        if inclusive {
            hi += 1;
        }
        if lo < 0 || hi < lo || hi as usize > len {
            return Err(out_of_bounds(hi.max(0) as usize, len));
        }
        Ok((lo as usize, hi as usize))
    }
}
