// Builtin operations, dispatched by callee name when a Call names no
// MIR function.
//
// Each intrinsic consumes its arguments (dropping them on every path)
// and produces one result, stored to the call's destination. The
// destination's declared type steers the intrinsics whose result width
// depends on it (__len, __to, rt_string_bytes_view, task creation).

use num_bigint::{BigInt, BigUint};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::error::{expected, invalid_handle, unimplemented, Panic, PanicKind, Result};
use crate::mir::{BinOp, Place, UnOp};
use crate::types::{TypeDef, TypeId, Width, NO_TYPE};
use crate::value::{Kind, Location, Value};
use crate::vm::Vm;

impl<'m> Vm<'m> {
    pub(crate) fn call_intrinsic(
        &mut self,
        name: &str,
        mut args: Vec<Value>,
        dst: Option<&Place>,
    ) -> Result<()> {
        let result = self.intrinsic_result(name, &mut args, dst);
        // Whatever the intrinsic did not consume still belongs to us.
        for v in args.drain(..) {
            self.heap.drop_value(v);
        }
        let result = result?;
        match dst {
            Some(place) => self.store_place(place, result),
            None => {
                self.heap.drop_value(result);
                Ok(())
            }
        }
    }

    fn intrinsic_result(
        &mut self,
        name: &str,
        args: &mut Vec<Value>,
        dst: Option<&Place>,
    ) -> Result<Value> {
        let dst_ty = self.place_type(dst);
        match name {
            "__len" => {
                let v = take_arg(args, name)?;
                self.intr_len(v, dst_ty)
            }
            "__clone" => {
                let v = take_arg(args, name)?;
                self.intr_string_clone(v)
            }
            "clone" => {
                let v = take_arg(args, name)?;
                self.intr_copy_clone(v, dst_ty)
            }
            "__index" => {
                let obj = take_arg(args, name)?;
                let idx = take_arg(args, name)?;
                self.index_value(obj, idx)
            }
            "__to" => {
                let v = take_arg(args, name)?;
                self.convert(v, dst_ty)
            }
            "rt_string_force_flatten" => {
                let v = take_arg(args, name)?;
                match v {
                    Value::Str(h, _) => {
                        self.heap.force_flatten(h)?;
                        self.heap.drop_value(v);
                        Ok(Value::Nothing)
                    }
                    other => {
                        let kind = other.kind();
                        self.heap.drop_value(other);
                        Err(expected(Kind::Str.into(), kind))
                    }
                }
            }
            "rt_string_bytes_view" => {
                let v = take_arg(args, name)?;
                self.intr_bytes_view(v, dst_ty)
            }
            "__task_create" => {
                let f = take_arg(args, name)?;
                let state = take_arg(args, name)?;
                let poll_fn = match f {
                    Value::Int(id, _) if id >= 0 => id as usize,
                    other => {
                        let kind = other.kind();
                        self.heap.drop_value(other);
                        self.heap.drop_value(state);
                        return Err(expected(Kind::Int.into(), kind));
                    }
                };
                if poll_fn >= self.module.functions.len() {
                    self.heap.drop_value(state);
                    return Err(unimplemented("task poll function out of range"));
                }
                let id = self.exec.spawn_user(poll_fn, state);
                Ok(Value::Int(id as i64, dst_ty))
            }
            "checkpoint" => {
                let id = self.exec.spawn_checkpoint();
                Ok(Value::Int(id as i64, dst_ty))
            }
            "sleep" => {
                let ms = self.take_int_arg(args, name)?;
                let id = self.exec.spawn_sleep(ms.max(0) as u64);
                Ok(Value::Int(id as i64, dst_ty))
            }
            "timeout" => {
                let target = self.take_int_arg(args, name)? as u64;
                let ms = self.take_int_arg(args, name)?;
                self.exec.task(target)?;
                let result_ty = self.types.task_result(dst_ty).unwrap_or(NO_TYPE);
                let id = self.exec.spawn_timeout(target, ms.max(0) as u64, result_ty);
                Ok(Value::Int(id as i64, dst_ty))
            }
            "cancel" => {
                let target = self.take_int_arg(args, name)? as u64;
                self.exec.task(target)?;
                self.exec.cancel(target);
                Ok(Value::Nothing)
            }
            "__task_state" => self.intr_task_state(args),
            "rt_scope_enter" => {
                let failfast = match take_arg(args, name)? {
                    Value::Bool(b, _) => b,
                    other => {
                        let kind = other.kind();
                        self.heap.drop_value(other);
                        return Err(expected(Kind::Bool.into(), kind));
                    }
                };
                let owner = self.exec.current();
                let id = self.exec.scope_enter(owner, failfast);
                Ok(Value::Int(id as i64, dst_ty))
            }
            "rt_scope_register_child" => {
                let scope = self.take_int_arg(args, name)? as u64;
                let task = self.take_int_arg(args, name)? as u64;
                self.exec.scope_register(scope, task)?;
                Ok(Value::Nothing)
            }
            "rt_scope_cancel_all" => {
                let scope = self.take_int_arg(args, name)? as u64;
                self.exec.scope_cancel_all(scope)?;
                Ok(Value::Nothing)
            }
            "rt_scope_join_all" => {
                let scope = self.take_int_arg(args, name)? as u64;
                self.intr_scope_join_all(scope)
            }
            "rt_scope_exit" => {
                let scope = self.take_int_arg(args, name)? as u64;
                self.exec.scope_exit(scope)?;
                Ok(Value::Nothing)
            }
            "rt_chan_new" => {
                let cap = self.take_int_arg(args, name)?;
                if cap < 0 {
                    return Err(Panic::new(
                        PanicKind::OutOfBounds,
                        String::from("negative channel capacity"),
                    ));
                }
                let id = self.exec.chan_new(cap as usize);
                Ok(Value::Int(id as i64, dst_ty))
            }
            "rt_chan_close" => {
                let ch = self.take_int_arg(args, name)? as u64;
                self.exec.chan_close(ch)?;
                Ok(Value::Nothing)
            }
            "__add" => self.intr_binop(BinOp::Add, args),
            "__sub" => self.intr_binop(BinOp::Sub, args),
            "__mul" => self.intr_binop(BinOp::Mul, args),
            "__div" => self.intr_binop(BinOp::Div, args),
            "__mod" => self.intr_binop(BinOp::Mod, args),
            "__eq" => self.intr_binop(BinOp::Eq, args),
            "__ne" => self.intr_binop(BinOp::Ne, args),
            "__lt" => self.intr_binop(BinOp::Lt, args),
            "__le" => self.intr_binop(BinOp::Le, args),
            "__gt" => self.intr_binop(BinOp::Gt, args),
            "__ge" => self.intr_binop(BinOp::Ge, args),
            "__neg" => {
                let v = take_arg(args, name)?;
                self.unary_value(UnOp::Neg, v)
            }
            "__not" => {
                let v = take_arg(args, name)?;
                self.unary_value(UnOp::Not, v)
            }
            _ => Err(unimplemented(&format!("unknown intrinsic {}", name))),
        }
    }

    fn take_int_arg(&mut self, args: &mut Vec<Value>, name: &str) -> Result<i64> {
        match take_arg(args, name)? {
            Value::Int(i, _) => Ok(i),
            other => {
                let kind = other.kind();
                self.heap.drop_value(other);
                Err(expected(Kind::Int.into(), kind))
            }
        }
    }

    // The operator intrinsics unify mixed-width dispatch: a fixed Int
    // next to an arbitrary-width operand is promoted before the shared
    // operator surface runs.
    fn intr_binop(&mut self, op: BinOp, args: &mut Vec<Value>) -> Result<Value> {
        let a = take_arg(args, "operator")?;
        let b = match take_arg(args, "operator") {
            Ok(b) => b,
            Err(e) => {
                self.heap.drop_value(a);
                return Err(e);
            }
        };
        let (a, b) = self.promote_pair(a, b)?;
        self.binary_value(op, a, b)
    }

    fn promote_pair(&mut self, a: Value, b: Value) -> Result<(Value, Value)> {
        if a.kind() == b.kind() {
            return Ok((a, b));
        }
        let widen = |vm: &mut Vm<'m>, v: Value| -> Result<Value> {
            match v {
                Value::Int(i, _) => {
                    let h = vm.heap.alloc_bigint(NO_TYPE, BigInt::from(i));
                    Ok(Value::BigInt(h, NO_TYPE))
                }
                Value::BigUint(h, _) => {
                    let big = BigInt::from(vm.heap.biguint(h)?.clone());
                    vm.heap.drop_value(v);
                    let out = vm.heap.alloc_bigint(NO_TYPE, big);
                    Ok(Value::BigInt(out, NO_TYPE))
                }
                other => Ok(other),
            }
        };
        let integral = |v: &Value| {
            matches!(v.kind(), Kind::Int | Kind::BigInt | Kind::BigUint)
        };
        if integral(&a) && integral(&b) {
            let a = widen(self, a)?;
            let b = widen(self, b)?;
            Ok((a, b))
        } else {
            Ok((a, b))
        }
    }

    fn intr_len(&mut self, v: Value, dst_ty: TypeId) -> Result<Value> {
        let len = match &v {
            Value::Str(h, _) => self.heap.str_cp_len(*h),
            Value::Array(h, _) => self.heap.array_len(*h),
            Value::Struct(h, ty) => {
                // A bytes-view carries its length as a field.
                let layout = self.layouts.struct_layout(self.types, *ty)?;
                match layout.field_index("len") {
                    Some(idx) => match self.heap.struct_get(*h, idx)? {
                        Value::Int(l, _) => Ok(*l as usize),
                        other => Err(expected(Kind::Int.into(), other.kind())),
                    },
                    None => Err(Panic::new(
                        PanicKind::TypeMismatch,
                        format!("type {} has no length", self.types.name(*ty)),
                    )),
                }
            }
            other => Err(expected(
                Kind::Str | Kind::Array | Kind::Struct,
                other.kind(),
            )),
        };
        let len = match len {
            Ok(len) => len,
            Err(e) => {
                self.heap.drop_value(v);
                return Err(e);
            }
        };
        self.heap.drop_value(v);
        match self.types.def(dst_ty) {
            TypeDef::Uint(Width::Any) => {
                let h = self.heap.alloc_biguint(dst_ty, BigUint::from(len));
                Ok(Value::BigUint(h, dst_ty))
            }
            _ => {
                let ty = if dst_ty == NO_TYPE {
                    self.types.builtins().uint
                } else {
                    dst_ty
                };
                Ok(Value::Int(len as i64, ty))
            }
        }
    }

    // Deep clone; strings only. The result is always flat.
    fn intr_string_clone(&mut self, v: Value) -> Result<Value> {
        match v {
            Value::Str(h, ty) => {
                let bytes = self.heap.str_bytes(h)?;
                self.heap.drop_value(v);
                let out = self.heap.alloc_string(ty, bytes);
                Ok(Value::Str(out, ty))
            }
            other => {
                let kind = other.kind();
                self.heap.drop_value(other);
                Err(expected(Kind::Str.into(), kind))
            }
        }
    }

    // Clone for Copy-classified types: ownership of the argument simply
    // transfers to the destination.
    fn intr_copy_clone(&mut self, v: Value, dst_ty: TypeId) -> Result<Value> {
        let ty = if dst_ty != NO_TYPE { dst_ty } else { v.type_id() };
        if !self.types.is_copy(ty) {
            let kind = v.kind();
            self.heap.drop_value(v);
            return Err(Panic::new(
                PanicKind::TypeMismatch,
                format!("clone of non-Copy {:?} value", kind),
            ));
        }
        Ok(v)
    }

    // Build {owner, ptr, len} over a string. The struct takes over the
    // argument's reference as `owner`.
    fn intr_bytes_view(&mut self, v: Value, dst_ty: TypeId) -> Result<Value> {
        let h = match &v {
            Value::Str(h, _) => *h,
            other => {
                let kind = other.kind();
                let kind_err = expected(Kind::Str.into(), kind);
                self.heap.drop_value(v);
                return Err(kind_err);
            }
        };
        let byte_len = self.heap.str_byte_len(h)?;
        let layout = self.layouts.struct_layout(self.types, dst_ty)?;
        let (owner_idx, ptr_idx, len_idx) = match (
            layout.field_index("owner"),
            layout.field_index("ptr"),
            layout.field_index("len"),
        ) {
            (Some(o), Some(p), Some(l)) => (o, p, l),
            _ => {
                let name = self.types.name(dst_ty);
                self.heap.drop_value(v);
                return Err(Panic::new(
                    PanicKind::TypeMismatch,
                    format!("type {} is not a bytes view", name),
                ));
            }
        };
        let size = self.layouts.struct_layout(self.types, dst_ty)?.size();
        let uint = self.types.builtins().uint;
        let mut fields = vec![Value::Nothing; size];
        fields[owner_idx] = v;
        fields[ptr_idx] = Value::Ptr(Location::StringBytes {
            handle: h,
            offset: 0,
        });
        fields[len_idx] = Value::Int(byte_len as i64, uint);
        let out = self.heap.alloc_struct(dst_ty, fields);
        Ok(Value::Struct(out, dst_ty))
    }

    // Read or replace the current task's captured state.
    fn intr_task_state(&mut self, args: &mut Vec<Value>) -> Result<Value> {
        let cur = self.exec.current();
        if cur == 0 {
            return Err(invalid_handle(0));
        }
        if args.is_empty() {
            let state = self.exec.task(cur)?.state.clone();
            Ok(self.heap.clone_for_share(&state))
        } else {
            let v = args.remove(0);
            let task = self.exec.task_mut(cur)?;
            let old = std::mem::replace(&mut task.state, v);
            self.heap.drop_value(old);
            Ok(Value::Nothing)
        }
    }

    // Blocking join: drive the executor until every child of the scope
    // has completed, then report whether fail-fast tripped.
    fn intr_scope_join_all(&mut self, scope: u64) -> Result<Value> {
        let boolean = self.types.builtins().boolean;
        loop {
            let (done, _pending, fired) = self.exec.scope_join_state(&mut self.heap, scope)?;
            if done {
                return Ok(Value::Bool(fired, boolean));
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

    // ---- numeric conversion (__to and Cast) ----

    pub(crate) fn convert(&mut self, v: Value, dst: TypeId) -> Result<Value> {
        match self.types.def(dst).clone() {
            TypeDef::Str => self.convert_to_string(v, dst),
            TypeDef::Int(Width::Any) => self.convert_to_bigint(v, dst),
            TypeDef::Uint(Width::Any) => self.convert_to_biguint(v, dst),
            TypeDef::Float(Width::Any) => self.convert_to_bigfloat(v, dst),
            TypeDef::Int(_) | TypeDef::Uint(_) | TypeDef::Float(_) => {
                self.heap.drop_value(v);
                Err(unimplemented("fixed-width numeric conversion"))
            }
            _ => {
                let kind = v.kind();
                self.heap.drop_value(v);
                Err(Panic::new(
                    PanicKind::TypeMismatch,
                    format!(
                        "no conversion from {:?} to {}",
                        kind,
                        self.types.name(dst)
                    ),
                ))
            }
        }
    }

    fn convert_to_string(&mut self, v: Value, dst: TypeId) -> Result<Value> {
        let text = match &v {
            Value::Int(i, _) => format!("{}", i),
            Value::BigInt(h, _) => format!("{}", self.heap.bigint(*h)?),
            Value::BigUint(h, _) => format!("{}", self.heap.biguint(*h)?),
            Value::BigFloat(h, _) => format!("{}", self.heap.bigfloat(*h)?),
            Value::Bool(b, _) => String::from(if *b { "true" } else { "false" }),
            // Same bytes, new type: keep the reference.
            Value::Str(h, _) => return Ok(Value::Str(*h, dst)),
            other => {
                let kind = other.kind();
                self.heap.drop_value(v);
                return Err(expected(
                    Kind::Int | Kind::BigInt | Kind::BigUint | Kind::BigFloat | Kind::Bool
                        | Kind::Str,
                    kind,
                ));
            }
        };
        self.heap.drop_value(v);
        let h = self.heap.alloc_string(dst, text.into_bytes());
        Ok(Value::Str(h, dst))
    }

    fn convert_to_bigint(&mut self, v: Value, dst: TypeId) -> Result<Value> {
        let out = match &v {
            Value::Int(i, _) => BigInt::from(*i),
            Value::BigInt(h, _) => {
                return Ok(Value::BigInt(*h, dst));
            }
            Value::BigUint(h, _) => BigInt::from(self.heap.biguint(*h)?.clone()),
            Value::BigFloat(h, _) => {
                let f = self.heap.bigfloat(*h)?;
                match BigInt::from_f64(f.trunc()) {
                    Some(b) => b,
                    None => {
                        self.heap.drop_value(v);
                        return Err(Panic::new(
                            PanicKind::InvalidNumericConversion,
                            format!("{} has no integer value", f),
                        ));
                    }
                }
            }
            Value::Bool(b, _) => BigInt::from(*b as i64),
            Value::Str(h, _) => {
                let text = String::from_utf8_lossy(&self.heap.str_bytes(*h)?).into_owned();
                match text.trim().parse::<BigInt>() {
                    Ok(b) => b,
                    Err(e) => {
                        self.heap.drop_value(v);
                        return Err(Panic::new(
                            PanicKind::TypeMismatch,
                            format!("{:?} does not parse as an integer: {}", text, e),
                        ));
                    }
                }
            }
            Value::Struct(h, ty) => {
                // Legacy conversion off a {code: int} wrapper.
                let layout = self.layouts.struct_layout(self.types, *ty)?;
                match layout.field_index("code") {
                    Some(idx) => match self.heap.struct_get(*h, idx)? {
                        Value::Int(code, _) => BigInt::from(*code),
                        other => {
                            let kind = other.kind();
                            self.heap.drop_value(v);
                            return Err(expected(Kind::Int.into(), kind));
                        }
                    },
                    None => {
                        let name = self.types.name(*ty);
                        self.heap.drop_value(v);
                        return Err(Panic::new(
                            PanicKind::TypeMismatch,
                            format!("struct {} has no code field", name),
                        ));
                    }
                }
            }
            other => {
                let kind = other.kind();
                self.heap.drop_value(v);
                return Err(expected(
                    Kind::Int | Kind::BigInt | Kind::BigUint | Kind::BigFloat | Kind::Bool
                        | Kind::Str | Kind::Struct,
                    kind,
                ));
            }
        };
        self.heap.drop_value(v);
        let h = self.heap.alloc_bigint(dst, out);
        Ok(Value::BigInt(h, dst))
    }

    fn convert_to_biguint(&mut self, v: Value, dst: TypeId) -> Result<Value> {
        let negative = || {
            Panic::new(
                PanicKind::InvalidNumericConversion,
                String::from("negative value in unsigned conversion"),
            )
        };
        let out = match &v {
            Value::Int(i, _) => {
                if *i < 0 {
                    self.heap.drop_value(v);
                    return Err(negative());
                }
                BigUint::from(*i as u64)
            }
            Value::BigUint(h, _) => {
                return Ok(Value::BigUint(*h, dst));
            }
            Value::BigInt(h, _) => match self.heap.bigint(*h)?.to_biguint() {
                Some(b) => b,
                None => {
                    self.heap.drop_value(v);
                    return Err(negative());
                }
            },
            Value::BigFloat(h, _) => {
                let f = self.heap.bigfloat(*h)?;
                match BigUint::from_f64(f.trunc()) {
                    Some(b) => b,
                    None => {
                        self.heap.drop_value(v);
                        return Err(negative());
                    }
                }
            }
            Value::Bool(b, _) => BigUint::from(*b as u64),
            Value::Str(h, _) => {
                let text = String::from_utf8_lossy(&self.heap.str_bytes(*h)?).into_owned();
                match text.trim().parse::<BigUint>() {
                    Ok(b) => b,
                    Err(e) => {
                        self.heap.drop_value(v);
                        return Err(Panic::new(
                            PanicKind::TypeMismatch,
                            format!("{:?} does not parse as an unsigned integer: {}", text, e),
                        ));
                    }
                }
            }
            other => {
                let kind = other.kind();
                self.heap.drop_value(v);
                return Err(expected(
                    Kind::Int | Kind::BigInt | Kind::BigUint | Kind::BigFloat | Kind::Bool
                        | Kind::Str,
                    kind,
                ));
            }
        };
        self.heap.drop_value(v);
        let h = self.heap.alloc_biguint(dst, out);
        Ok(Value::BigUint(h, dst))
    }

    fn convert_to_bigfloat(&mut self, v: Value, dst: TypeId) -> Result<Value> {
        let out = match &v {
            Value::Int(i, _) => *i as f64,
            Value::BigInt(h, _) => match self.heap.bigint(*h)?.to_f64() {
                Some(f) => f,
                None => {
                    self.heap.drop_value(v);
                    return Err(Panic::new(
                        PanicKind::InvalidNumericConversion,
                        String::from("integer exceeds float range"),
                    ));
                }
            },
            Value::BigUint(h, _) => match self.heap.biguint(*h)?.to_f64() {
                Some(f) => f,
                None => {
                    self.heap.drop_value(v);
                    return Err(Panic::new(
                        PanicKind::InvalidNumericConversion,
                        String::from("integer exceeds float range"),
                    ));
                }
            },
            Value::BigFloat(h, _) => {
                return Ok(Value::BigFloat(*h, dst));
            }
            Value::Bool(b, _) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Str(h, _) => {
                let text = String::from_utf8_lossy(&self.heap.str_bytes(*h)?).into_owned();
                match text.trim().parse::<f64>() {
                    Ok(f) => f,
                    Err(e) => {
                        self.heap.drop_value(v);
                        return Err(Panic::new(
                            PanicKind::TypeMismatch,
                            format!("{:?} does not parse as a float: {}", text, e),
                        ));
                    }
                }
            }
            other => {
                let kind = other.kind();
                self.heap.drop_value(v);
                return Err(expected(
                    Kind::Int | Kind::BigInt | Kind::BigUint | Kind::BigFloat | Kind::Bool
                        | Kind::Str,
                    kind,
                ));
            }
        };
        self.heap.drop_value(v);
        let h = self.heap.alloc_bigfloat(dst, out);
        Ok(Value::BigFloat(h, dst))
    }
}

fn take_arg(args: &mut Vec<Value>, name: &str) -> Result<Value> {
    if args.is_empty() {
        Err(unimplemented(&format!("missing argument to {}", name)))
    } else {
        Ok(args.remove(0))
    }
}
