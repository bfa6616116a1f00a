use telemesh_attr::{AttributeValue, Finder, ValueType};

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::errors::ExprError;
use crate::parser::parse;
use crate::program::{Builtin, Op, Program};

/// Compiles expression text against a vocabulary. The returned program
/// carries its result type and the vocabulary generation it was checked
/// against.
pub fn compile(
    text: &str,
    finder: &dyn Finder,
    vocabulary_id: u64,
) -> Result<Program, ExprError> {
    let expr = parse(text)?;
    let mut program = Program {
        ops: Vec::new(),
        consts: Vec::new(),
        names: Vec::new(),
        result_type: ValueType::Bool,
        vocabulary_id,
    };
    let result_type = emit(&expr, finder, &mut program)?;
    program.result_type = result_type;
    Ok(program)
}

fn emit(expr: &Expr, finder: &dyn Finder, program: &mut Program) -> Result<ValueType, ExprError> {
    match expr {
        Expr::Attribute(name) => {
            let ty = finder
                .find(name)
                .ok_or_else(|| ExprError::Type(format!("unknown attribute '{name}'")))?;
            let idx = program.add_name(name);
            program.emit(Op::Resolve(idx));
            Ok(ty)
        }
        Expr::StringLit(s) => {
            let idx = program.add_const(AttributeValue::String(s.clone()));
            program.emit(Op::Const(idx));
            Ok(ValueType::String)
        }
        Expr::IntLit(v) => {
            let idx = program.add_const(AttributeValue::Int64(*v));
            program.emit(Op::Const(idx));
            Ok(ValueType::Int64)
        }
        Expr::FloatLit(v) => {
            let idx = program.add_const(AttributeValue::Double(*v));
            program.emit(Op::Const(idx));
            Ok(ValueType::Double)
        }
        Expr::BoolLit(v) => {
            let idx = program.add_const(AttributeValue::Bool(*v));
            program.emit(Op::Const(idx));
            Ok(ValueType::Bool)
        }
        Expr::Unary(UnaryOp::Not, inner) => {
            let ty = emit(inner, finder, program)?;
            require(ty, ValueType::Bool, "operand of '!'")?;
            program.emit(Op::Not);
            Ok(ValueType::Bool)
        }
        Expr::Unary(UnaryOp::Neg, inner) => {
            let ty = emit(inner, finder, program)?;
            if ty != ValueType::Int64 && ty != ValueType::Double {
                return Err(ExprError::Type(format!(
                    "operand of unary '-' must be numeric, got {ty}"
                )));
            }
            program.emit(Op::Neg);
            Ok(ty)
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => emit_logical(lhs, rhs, true, finder, program),
        Expr::Binary(BinaryOp::Or, lhs, rhs) => emit_logical(lhs, rhs, false, finder, program),
        Expr::Binary(BinaryOp::Default, _, _) => emit_default(expr, finder, program),
        Expr::Binary(op @ (BinaryOp::Eq | BinaryOp::Ne), lhs, rhs) => {
            let lt = emit(lhs, finder, program)?;
            let rt = emit(rhs, finder, program)?;
            if lt != rt {
                return Err(ExprError::Type(format!(
                    "cannot compare {lt} with {rt}"
                )));
            }
            program.emit(if *op == BinaryOp::Eq { Op::Eq } else { Op::Ne });
            Ok(ValueType::Bool)
        }
        Expr::Binary(op, lhs, rhs) => {
            let lt = emit(lhs, finder, program)?;
            let rt = emit(rhs, finder, program)?;
            if lt != rt || (lt != ValueType::Int64 && lt != ValueType::Double) {
                return Err(ExprError::Type(format!(
                    "arithmetic requires matching numeric operands, got {lt} and {rt}"
                )));
            }
            program.emit(match op {
                BinaryOp::Add => Op::Add,
                BinaryOp::Sub => Op::Sub,
                BinaryOp::Mul => Op::Mul,
                BinaryOp::Div => Op::Div,
                _ => unreachable!(),
            });
            Ok(lt)
        }
        Expr::Call(name, args) => emit_call(name, args, finder, program),
    }
}

fn emit_logical(
    lhs: &Expr,
    rhs: &Expr,
    is_and: bool,
    finder: &dyn Finder,
    program: &mut Program,
) -> Result<ValueType, ExprError> {
    let lt = emit(lhs, finder, program)?;
    require(lt, ValueType::Bool, "logical operand")?;
    let short = program.emit(if is_and {
        Op::JumpIfFalse(0)
    } else {
        Op::JumpIfTrue(0)
    });
    let rt = emit(rhs, finder, program)?;
    require(rt, ValueType::Bool, "logical operand")?;
    let done = program.emit(Op::Jump(0));
    let short_target = program.here();
    let idx = program.add_const(AttributeValue::Bool(!is_and));
    program.emit(Op::Const(idx));
    let end = program.here();
    program.patch_jump(short, short_target);
    program.patch_jump(done, end);
    Ok(ValueType::Bool)
}

/// `a | b | "fallback"` — try each attribute operand in order; the first
/// defined value wins. A non-attribute operand always yields a value and
/// terminates the chain.
fn emit_default(
    expr: &Expr,
    finder: &dyn Finder,
    program: &mut Program,
) -> Result<ValueType, ExprError> {
    let mut operands = Vec::new();
    flatten_default(expr, &mut operands);

    let mut chain_type: Option<ValueType> = None;
    let mut jumps = Vec::new();
    for (i, operand) in operands.iter().enumerate() {
        let last = i == operands.len() - 1;
        let ty = match operand {
            Expr::Attribute(name) if !last => {
                let ty = finder
                    .find(name)
                    .ok_or_else(|| ExprError::Type(format!("unknown attribute '{name}'")))?;
                let idx = program.add_name(name);
                jumps.push(program.emit(Op::TryResolve(idx, 0)));
                ty
            }
            other => {
                let ty = emit(other, finder, program)?;
                // always-defined operand: the rest of the chain is dead
                let end = program.here();
                for jump in jumps.drain(..) {
                    program.patch_jump(jump, end);
                }
                check_chain_type(&mut chain_type, ty)?;
                return Ok(chain_type.unwrap());
            }
        };
        check_chain_type(&mut chain_type, ty)?;
    }
    unreachable!("default chain always ends in a terminal operand");
}

fn check_chain_type(
    chain_type: &mut Option<ValueType>,
    ty: ValueType,
) -> Result<(), ExprError> {
    match chain_type {
        None => {
            *chain_type = Some(ty);
            Ok(())
        }
        Some(existing) if *existing == ty => Ok(()),
        Some(existing) => Err(ExprError::Type(format!(
            "default alternatives disagree: {existing} vs {ty}"
        ))),
    }
}

fn flatten_default<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    if let Expr::Binary(BinaryOp::Default, lhs, rhs) = expr {
        flatten_default(lhs, out);
        flatten_default(rhs, out);
    } else {
        out.push(expr);
    }
}

fn emit_call(
    name: &str,
    args: &[Expr],
    finder: &dyn Finder,
    program: &mut Program,
) -> Result<ValueType, ExprError> {
    let (builtin, param_types, result): (Builtin, &[ValueType], ValueType) = match name {
        "ip" => (Builtin::Ip, &[ValueType::String], ValueType::IpAddress),
        "match" => (
            Builtin::Match,
            &[ValueType::String, ValueType::String],
            ValueType::Bool,
        ),
        "timestamp" => (Builtin::Timestamp, &[ValueType::String], ValueType::Timestamp),
        other => {
            return Err(ExprError::Type(format!("unknown function '{other}'")));
        }
    };
    if args.len() != param_types.len() {
        return Err(ExprError::Type(format!(
            "{name}() takes {} argument(s), got {}",
            param_types.len(),
            args.len()
        )));
    }
    for (arg, expected) in args.iter().zip(param_types) {
        let ty = emit(arg, finder, program)?;
        require(ty, *expected, name)?;
    }
    program.emit(Op::Call(builtin, args.len() as u8));
    Ok(result)
}

fn require(actual: ValueType, expected: ValueType, what: &str) -> Result<(), ExprError> {
    if actual != expected {
        return Err(ExprError::Type(format!(
            "{what} must be {expected}, got {actual}"
        )));
    }
    Ok(())
}
