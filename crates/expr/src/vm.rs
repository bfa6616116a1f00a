use telemesh_attr::{AttributeBag, AttributeValue, ValueType};

use crate::builtins;
use crate::errors::ExprError;
use crate::program::{Builtin, Op, Program};

/// Runs a compiled program against a bag. Attribute resolution goes through
/// `AttributeBag::get`, so every read lands in the referenced-attributes set.
pub fn run(program: &Program, bag: &AttributeBag) -> Result<AttributeValue, ExprError> {
    let mut stack: Vec<AttributeValue> = Vec::with_capacity(8);
    let mut ip = 0usize;

    while ip < program.ops.len() {
        let mut next = ip + 1;
        match program.ops[ip] {
            Op::Const(idx) => {
                stack.push(program.consts[idx as usize].clone());
            }
            Op::Resolve(idx) => {
                let name = &program.names[idx as usize];
                match bag.get(name) {
                    Some(value) => stack.push(value),
                    None => return Err(ExprError::UnresolvedAttribute(name.clone())),
                }
            }
            Op::TryResolve(idx, target) => {
                let name = &program.names[idx as usize];
                if let Some(value) = bag.get(name) {
                    stack.push(value);
                    next = target as usize;
                }
            }
            Op::Eq => {
                let (l, r) = pop_pair(&mut stack)?;
                stack.push(AttributeValue::Bool(l.wire_eq(&r)));
            }
            Op::Ne => {
                let (l, r) = pop_pair(&mut stack)?;
                stack.push(AttributeValue::Bool(!l.wire_eq(&r)));
            }
            Op::Not => {
                let value = pop_bool(&mut stack)?;
                stack.push(AttributeValue::Bool(!value));
            }
            Op::Neg => match pop(&mut stack)? {
                AttributeValue::Int64(v) => stack.push(AttributeValue::Int64(-v)),
                AttributeValue::Double(v) => stack.push(AttributeValue::Double(-v)),
                other => {
                    return Err(ExprError::TypeMismatch {
                        expected: ValueType::Int64,
                        actual: other.value_type(),
                    })
                }
            },
            Op::Add => arithmetic(&mut stack, |l, r| l.checked_add(r), |l, r| l + r)?,
            Op::Sub => arithmetic(&mut stack, |l, r| l.checked_sub(r), |l, r| l - r)?,
            Op::Mul => arithmetic(&mut stack, |l, r| l.checked_mul(r), |l, r| l * r)?,
            Op::Div => {
                let (l, r) = pop_pair(&mut stack)?;
                match (l, r) {
                    (AttributeValue::Int64(_), AttributeValue::Int64(0)) => {
                        return Err(ExprError::DivideByZero)
                    }
                    (AttributeValue::Int64(l), AttributeValue::Int64(r)) => {
                        stack.push(AttributeValue::Int64(l / r))
                    }
                    (AttributeValue::Double(l), AttributeValue::Double(r)) => {
                        stack.push(AttributeValue::Double(l / r))
                    }
                    (l, r) => {
                        return Err(ExprError::Type(format!(
                            "cannot divide {} by {}",
                            l.value_type(),
                            r.value_type()
                        )))
                    }
                }
            }
            Op::Call(builtin, arity) => {
                let mut args = Vec::with_capacity(arity as usize);
                for _ in 0..arity {
                    args.push(pop(&mut stack)?);
                }
                args.reverse();
                stack.push(call_builtin(builtin, &args)?);
            }
            Op::Jump(target) => {
                next = target as usize;
            }
            Op::JumpIfFalse(target) => {
                if !pop_bool(&mut stack)? {
                    next = target as usize;
                }
            }
            Op::JumpIfTrue(target) => {
                if pop_bool(&mut stack)? {
                    next = target as usize;
                }
            }
        }
        ip = next;
    }

    pop(&mut stack)
}

fn call_builtin(builtin: Builtin, args: &[AttributeValue]) -> Result<AttributeValue, ExprError> {
    match builtin {
        Builtin::Ip => builtins::ip(as_str(&args[0])?),
        Builtin::Match => Ok(AttributeValue::Bool(builtins::wildcard_match(
            as_str(&args[0])?,
            as_str(&args[1])?,
        ))),
        Builtin::Timestamp => builtins::timestamp(as_str(&args[0])?),
    }
}

fn as_str(value: &AttributeValue) -> Result<&str, ExprError> {
    match value {
        AttributeValue::String(s) => Ok(s),
        other => Err(ExprError::TypeMismatch {
            expected: ValueType::String,
            actual: other.value_type(),
        }),
    }
}

fn pop(stack: &mut Vec<AttributeValue>) -> Result<AttributeValue, ExprError> {
    stack
        .pop()
        .ok_or_else(|| ExprError::Type("operand stack underflow".to_string()))
}

fn pop_pair(stack: &mut Vec<AttributeValue>) -> Result<(AttributeValue, AttributeValue), ExprError> {
    let r = pop(stack)?;
    let l = pop(stack)?;
    Ok((l, r))
}

fn pop_bool(stack: &mut Vec<AttributeValue>) -> Result<bool, ExprError> {
    match pop(stack)? {
        AttributeValue::Bool(b) => Ok(b),
        other => Err(ExprError::TypeMismatch {
            expected: ValueType::Bool,
            actual: other.value_type(),
        }),
    }
}

fn arithmetic(
    stack: &mut Vec<AttributeValue>,
    int_op: fn(i64, i64) -> Option<i64>,
    double_op: fn(f64, f64) -> f64,
) -> Result<(), ExprError> {
    let (l, r) = pop_pair(stack)?;
    match (l, r) {
        (AttributeValue::Int64(l), AttributeValue::Int64(r)) => {
            let value = int_op(l, r)
                .ok_or_else(|| ExprError::Type("integer overflow".to_string()))?;
            stack.push(AttributeValue::Int64(value));
            Ok(())
        }
        (AttributeValue::Double(l), AttributeValue::Double(r)) => {
            stack.push(AttributeValue::Double(double_op(l, r)));
            Ok(())
        }
        (l, r) => Err(ExprError::Type(format!(
            "arithmetic on {} and {}",
            l.value_type(),
            r.value_type()
        ))),
    }
}
