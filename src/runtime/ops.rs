//! Operator semantics shared by the evaluator and the VM.
//!
//! Every function returns a plain `Value`; failures come back as exception
//! values so both backends propagate them identically. Dispatch is a single
//! match over `(op, left kind, right kind)`.

use std::collections::HashMap;

use crate::ast::{InfixOp, PrefixOp};
use crate::runtime::value::{HashKey, HashPair, Value};

pub fn prefix_op(op: PrefixOp, right: &Value) -> Value {
    match op {
        PrefixOp::Not => Value::Bool(!right.is_truthy()),
        PrefixOp::Neg => match right {
            Value::Int(value) => Value::Int(-value),
            Value::Float(value) => Value::Float(-value),
            other => Value::exception(format!("unknown operator: -{}", other.type_name())),
        },
    }
}

pub fn binary_op(op: InfixOp, left: &Value, right: &Value) -> Value {
    match (left, right) {
        (Value::Int(l), Value::Int(r)) => int_op(op, *l, *r),
        (Value::Float(l), Value::Float(r)) => float_op(op, *l, *r),
        (Value::Str(_), Value::Str(_)) => string_op(op, left, right),
        (Value::Array(_), Value::Array(_)) => array_op(op, left, right),
        _ if same_kind(left, right) => equality_only(op, left, right),
        _ => match op {
            // Distinct kinds are comparable but never equal.
            InfixOp::Eq => Value::Bool(false),
            InfixOp::NotEq => Value::Bool(true),
            _ => Value::exception(format!(
                "type mismatch: {} {} {}",
                left.type_name(),
                op.as_str(),
                right.type_name()
            )),
        },
    }
}

fn int_op(op: InfixOp, left: i64, right: i64) -> Value {
    match op {
        InfixOp::Add => Value::Int(left.wrapping_add(right)),
        InfixOp::Sub => Value::Int(left.wrapping_sub(right)),
        InfixOp::Mul => Value::Int(left.wrapping_mul(right)),
        InfixOp::Div => {
            if right == 0 {
                Value::exception("division by zero")
            } else {
                Value::Int(left.wrapping_div(right))
            }
        }
        InfixOp::Mod => {
            if right == 0 {
                Value::exception("division by zero")
            } else {
                Value::Int(left.wrapping_rem(right))
            }
        }
        InfixOp::BitAnd => Value::Int(left & right),
        InfixOp::BitOr => Value::Int(left | right),
        InfixOp::BitXor => Value::Int(left ^ right),
        InfixOp::BitAndNot => Value::Int(left & !right),
        InfixOp::ShiftLeft | InfixOp::ShiftRight if right < 0 => {
            Value::exception("negative shift amount")
        }
        InfixOp::ShiftLeft => Value::Int(left.wrapping_shl(right as u32)),
        InfixOp::ShiftRight => Value::Int(left.wrapping_shr(right as u32)),
        InfixOp::Lt => Value::Bool(left < right),
        InfixOp::Gt => Value::Bool(left > right),
        InfixOp::LtEq => Value::Bool(left <= right),
        InfixOp::GtEq => Value::Bool(left >= right),
        InfixOp::Eq => Value::Bool(left == right),
        InfixOp::NotEq => Value::Bool(left != right),
    }
}

fn float_op(op: InfixOp, left: f64, right: f64) -> Value {
    match op {
        InfixOp::Add => Value::Float(left + right),
        InfixOp::Sub => Value::Float(left - right),
        InfixOp::Mul => Value::Float(left * right),
        // IEEE-754: division by zero yields an infinity or NaN.
        InfixOp::Div => Value::Float(left / right),
        InfixOp::Lt => Value::Bool(left < right),
        InfixOp::Gt => Value::Bool(left > right),
        InfixOp::LtEq => Value::Bool(left <= right),
        InfixOp::GtEq => Value::Bool(left >= right),
        InfixOp::Eq => Value::Bool(left == right),
        InfixOp::NotEq => Value::Bool(left != right),
        _ => unknown_operator(op, "FLOAT"),
    }
}

fn string_op(op: InfixOp, left: &Value, right: &Value) -> Value {
    let (Value::Str(l), Value::Str(r)) = (left, right) else {
        return unknown_operator(op, "STRING");
    };
    match op {
        InfixOp::Add => Value::string(format!("{l}{r}")),
        InfixOp::Eq => Value::Bool(l == r),
        InfixOp::NotEq => Value::Bool(l != r),
        _ => unknown_operator(op, "STRING"),
    }
}

fn array_op(op: InfixOp, left: &Value, right: &Value) -> Value {
    let (Value::Array(l), Value::Array(r)) = (left, right) else {
        return unknown_operator(op, "ARRAY");
    };
    match op {
        InfixOp::Add => {
            let mut elements = l.borrow().clone();
            elements.extend(r.borrow().iter().cloned());
            Value::array(elements)
        }
        InfixOp::Eq | InfixOp::NotEq => equality_only(op, left, right),
        _ => unknown_operator(op, "ARRAY"),
    }
}

fn equality_only(op: InfixOp, left: &Value, right: &Value) -> Value {
    match op {
        InfixOp::Eq => Value::Bool(left == right),
        InfixOp::NotEq => Value::Bool(left != right),
        _ => Value::exception(format!(
            "unknown operator: {} {} {}",
            left.type_name(),
            op.as_str(),
            right.type_name()
        )),
    }
}

fn unknown_operator(op: InfixOp, type_name: &str) -> Value {
    Value::exception(format!(
        "unknown operator: {type_name} {} {type_name}",
        op.as_str()
    ))
}

fn same_kind(left: &Value, right: &Value) -> bool {
    left.type_name() == right.type_name()
}

/// Index read: `a[i]` / `h[k]`. Out-of-range array reads yield null.
pub fn index_get(left: &Value, index: &Value) -> Value {
    match left {
        Value::Array(elements) => {
            let Value::Int(raw) = index else {
                return Value::exception(format!(
                    "Invalid array index type {}",
                    index.type_name()
                ));
            };
            let elements = elements.borrow();
            resolve_array_index(*raw, elements.len())
                .and_then(|idx| elements.get(idx).cloned())
                .unwrap_or(Value::Null)
        }
        Value::Hash(pairs) => match hash_key(index) {
            Ok(key) => pairs
                .borrow()
                .get(&key)
                .map(|pair| pair.value.clone())
                .unwrap_or(Value::Null),
            Err(exception) => exception,
        },
        other => Value::exception(format!("Index operator not allowed: {}", other.type_name())),
    }
}

/// Index write: bounds-checked for arrays, insert-or-replace for hashes.
pub fn index_set(target: &Value, index: &Value, value: Value) -> Value {
    match target {
        Value::Array(elements) => {
            let Value::Int(raw) = index else {
                return Value::exception(format!(
                    "Invalid array index type {}",
                    index.type_name()
                ));
            };
            let mut elements = elements.borrow_mut();
            let len = elements.len();
            if *raw < 0 || *raw as usize >= len {
                return Value::exception(format!("Index out of bounds: {raw}"));
            }
            elements[*raw as usize] = value;
            Value::Null
        }
        Value::Hash(pairs) => match hash_key(index) {
            Ok(key) => {
                pairs.borrow_mut().insert(
                    key,
                    HashPair {
                        key: index.clone(),
                        value,
                    },
                );
                Value::Null
            }
            Err(exception) => exception,
        },
        other => Value::exception(format!("Index operator not allowed: {}", other.type_name())),
    }
}

/// Negative indices resolve from the tail; anything still out of range is
/// reported as `None`.
fn resolve_array_index(raw: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if raw < 0 { len + raw } else { raw };
    if idx < 0 || idx >= len {
        None
    } else {
        Some(idx as usize)
    }
}

/// Member read shared by both backends.
pub fn member_get(object: &Value, property: &str) -> Value {
    match object {
        Value::Instance(instance) => {
            if let Some(value) = instance.fields.get_local(property) {
                return value;
            }
            if let Some(method) = instance.class.find_method(property) {
                if let Some(bound) = method.bind_self(object.clone()) {
                    return bound;
                }
            }
            Value::exception(format!(
                "Unknown member '{property}' for instance of {}",
                instance.class.name
            ))
        }
        Value::Module(module) => {
            if let Some(builtin) = module.methods.get(property) {
                return Value::Builtin(*builtin);
            }
            if let Some(value) = module.vars.get(property) {
                return value.clone();
            }
            Value::exception(format!(
                "Unknown member '{property}' for module {}",
                module.name
            ))
        }
        other => Value::exception(format!(
            "Member access not allowed: {}",
            other.type_name()
        )),
    }
}

/// Member write shared by both backends.
pub fn member_set(object: &Value, property: &str, value: Value) -> Value {
    match object {
        Value::Instance(instance) => {
            instance.fields.set_force(property, value, false);
            Value::Null
        }
        other => Value::exception(format!(
            "Member assignment not allowed: {}",
            other.type_name()
        )),
    }
}

/// Converts a thrown value into an unwinding exception. Rethrowing a
/// caught exception arms it again.
pub fn throw_value(value: Value) -> Value {
    match value {
        Value::Exception(exception) => {
            if exception.caught {
                Value::Exception(std::rc::Rc::new(crate::runtime::value::Exception {
                    message: exception.message.clone(),
                    payload: exception.payload.clone(),
                    catchable: exception.catchable,
                    caught: false,
                }))
            } else {
                Value::Exception(exception)
            }
        }
        Value::Str(message) => Value::exception(message.to_string()),
        other => {
            let message = other.render();
            Value::Exception(std::rc::Rc::new(crate::runtime::value::Exception {
                message,
                payload: Some(other),
                catchable: true,
                caught: false,
            }))
        }
    }
}

/// Snapshot of the (key, value) pairs an iteration loop walks.
pub fn iter_pairs(value: &Value) -> Result<Vec<(Value, Value)>, Value> {
    match value {
        Value::Array(elements) => Ok(elements
            .borrow()
            .iter()
            .enumerate()
            .map(|(i, element)| (Value::Int(i as i64), element.clone()))
            .collect()),
        Value::Hash(pairs) => Ok(pairs
            .borrow()
            .values()
            .map(|pair| (pair.key.clone(), pair.value.clone()))
            .collect()),
        Value::Str(value) => Ok(value
            .chars()
            .enumerate()
            .map(|(i, c)| (Value::Int(i as i64), Value::string(c.to_string())))
            .collect()),
        other => Err(Value::exception(format!(
            "Cannot iterate over {}",
            other.type_name()
        ))),
    }
}

pub fn hash_key(value: &Value) -> Result<HashKey, Value> {
    match value {
        Value::Int(v) => Ok(HashKey::Int(*v)),
        Value::Bool(v) => Ok(HashKey::Bool(*v)),
        Value::Str(v) => Ok(HashKey::Str(v.clone())),
        Value::Float(v) => Ok(HashKey::Float(v.to_bits())),
        other => Err(Value::exception(format!(
            "Invalid map key: {}",
            other.type_name()
        ))),
    }
}

pub fn hash_from_pairs(pairs: Vec<(Value, Value)>) -> Result<Value, Value> {
    let mut map = HashMap::new();
    for (key, value) in pairs {
        let hashed = hash_key(&key)?;
        map.insert(hashed, HashPair { key, value });
    }
    Ok(Value::hash(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_add(l: i64, r: i64) -> Value {
        binary_op(InfixOp::Add, &Value::Int(l), &Value::Int(r))
    }

    #[test]
    fn integer_arithmetic() {
        assert_eq!(int_add(2, 3), Value::Int(5));
        assert_eq!(
            binary_op(InfixOp::Mul, &Value::Int(4), &Value::Int(-3)),
            Value::Int(-12)
        );
        assert_eq!(
            binary_op(InfixOp::Mod, &Value::Int(7), &Value::Int(3)),
            Value::Int(1)
        );
        assert_eq!(
            binary_op(InfixOp::ShiftLeft, &Value::Int(1), &Value::Int(4)),
            Value::Int(16)
        );
        assert_eq!(
            binary_op(InfixOp::BitAndNot, &Value::Int(0b1111), &Value::Int(0b0101)),
            Value::Int(0b1010)
        );
    }

    #[test]
    fn integer_division_by_zero_is_an_exception() {
        let result = binary_op(InfixOp::Div, &Value::Int(1), &Value::Int(0));
        let Value::Exception(exception) = result else {
            panic!("expected exception, got {result:?}");
        };
        assert_eq!(exception.message, "division by zero");
    }

    #[test]
    fn float_division_follows_ieee() {
        let inf = binary_op(InfixOp::Div, &Value::Float(1.0), &Value::Float(0.0));
        assert_eq!(inf, Value::Float(f64::INFINITY));
        let Value::Float(nan) = binary_op(InfixOp::Div, &Value::Float(0.0), &Value::Float(0.0))
        else {
            panic!("expected float");
        };
        assert!(nan.is_nan());
    }

    #[test]
    fn string_concat_and_compare() {
        assert_eq!(
            binary_op(InfixOp::Add, &Value::string("foo"), &Value::string("bar")),
            Value::string("foobar")
        );
        assert_eq!(
            binary_op(InfixOp::Eq, &Value::string("a"), &Value::string("a")),
            Value::Bool(true)
        );
        let result = binary_op(InfixOp::Sub, &Value::string("a"), &Value::string("b"));
        assert!(matches!(result, Value::Exception(_)));
    }

    #[test]
    fn type_mismatch_is_an_exception_except_equality() {
        let result = binary_op(InfixOp::Add, &Value::Int(1), &Value::string("a"));
        let Value::Exception(exception) = result else {
            panic!("expected exception");
        };
        assert_eq!(exception.message, "type mismatch: INTEGER + STRING");

        assert_eq!(
            binary_op(InfixOp::Eq, &Value::Int(1), &Value::string("a")),
            Value::Bool(false)
        );
        assert_eq!(
            binary_op(InfixOp::NotEq, &Value::Int(1), &Value::Float(1.0)),
            Value::Bool(true)
        );
    }

    #[test]
    fn array_concat_makes_a_new_array() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = Value::array(vec![Value::Int(2)]);
        let joined = binary_op(InfixOp::Add, &a, &b);
        let Value::Array(elements) = &joined else {
            panic!("expected array");
        };
        assert_eq!(
            *elements.borrow(),
            vec![Value::Int(1), Value::Int(2)]
        );
        assert_ne!(joined, a);
    }

    #[test]
    fn arrays_use_reference_identity_for_equality() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = Value::array(vec![Value::Int(1)]);
        assert_eq!(binary_op(InfixOp::Eq, &a, &b), Value::Bool(false));
        assert_eq!(binary_op(InfixOp::Eq, &a, &a.clone()), Value::Bool(true));
    }

    #[test]
    fn array_index_wraps_from_the_tail() {
        let array = Value::array(vec![Value::Int(10), Value::Int(20), Value::Int(30)]);
        let n = 3i64;
        for i in -n..n {
            let wrapped = ((i % n) + n) % n;
            assert_eq!(
                index_get(&array, &Value::Int(i)),
                index_get(&array, &Value::Int(wrapped)),
                "index {i}"
            );
        }
    }

    #[test]
    fn out_of_range_reads_are_null() {
        let array = Value::array(vec![Value::Int(1)]);
        assert_eq!(index_get(&array, &Value::Int(5)), Value::Null);
        assert_eq!(index_get(&array, &Value::Int(-2)), Value::Null);
    }

    #[test]
    fn out_of_range_assignment_is_an_exception() {
        let array = Value::array(vec![Value::Int(1)]);
        let result = index_set(&array, &Value::Int(3), Value::Int(9));
        let Value::Exception(exception) = result else {
            panic!("expected exception");
        };
        assert_eq!(exception.message, "Index out of bounds: 3");
    }

    #[test]
    fn hash_index_inserts_and_reads() {
        let hash = hash_from_pairs(vec![(Value::string("a"), Value::Int(1))])
            .expect("hash construction failed");
        assert_eq!(index_get(&hash, &Value::string("a")), Value::Int(1));
        assert_eq!(index_get(&hash, &Value::string("missing")), Value::Null);

        index_set(&hash, &Value::string("b"), Value::Int(2));
        assert_eq!(index_get(&hash, &Value::string("b")), Value::Int(2));

        let result = index_get(&hash, &Value::array(vec![]));
        assert!(matches!(result, Value::Exception(_)));
    }

    #[test]
    fn prefix_operators() {
        assert_eq!(prefix_op(PrefixOp::Not, &Value::Bool(false)), Value::Bool(true));
        assert_eq!(prefix_op(PrefixOp::Not, &Value::Int(0)), Value::Bool(true));
        assert_eq!(prefix_op(PrefixOp::Not, &Value::Int(3)), Value::Bool(false));
        assert_eq!(prefix_op(PrefixOp::Neg, &Value::Int(3)), Value::Int(-3));
        assert_eq!(prefix_op(PrefixOp::Neg, &Value::Float(2.5)), Value::Float(-2.5));
        assert!(matches!(
            prefix_op(PrefixOp::Neg, &Value::string("x")),
            Value::Exception(_)
        ));
    }
}
