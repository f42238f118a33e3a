//! Argument marshaling between tagged values and engine values
//!
//! Both directions preserve length and order. Up to [`INLINE_ARGS`] values
//! live in an inline buffer; longer lists spill to the heap without the
//! caller noticing.

use crate::callback::NativeFunction;
use crate::engine::{Completion, Engine, EngineValue};
use crate::env::Environment;
use crate::error::ConversionError;
use crate::exception::JsException;
use crate::handle::ObjectHandle;
use crate::value::TaggedValue;
use smallvec::SmallVec;

/// Inline capacity of argument buffers.
pub const INLINE_ARGS: usize = 16;

pub type TaggedArgs = SmallVec<[TaggedValue; INLINE_ARGS]>;
pub type EngineArgs = SmallVec<[EngineValue; INLINE_ARGS]>;

/// Engine arguments of an inbound call, converted for a native callback.
pub fn marshal_out(
    engine: &dyn Engine,
    args: &[EngineValue],
    flags: u32,
) -> Result<TaggedArgs, ConversionError> {
    let mut out = TaggedArgs::with_capacity(args.len());
    for arg in args {
        out.push(TaggedValue::from_engine(engine, arg, flags)?);
    }
    Ok(out)
}

/// Tagged arguments of an outbound call, converted for the engine.
pub fn marshal_in(engine: &dyn Engine, args: &[TaggedValue]) -> Result<EngineArgs, ConversionError> {
    let mut out = EngineArgs::with_capacity(args.len());
    for arg in args {
        out.push(arg.to_engine(engine)?);
    }
    Ok(out)
}

/// Runs a native function for an engine call and produces the engine-side
/// completion.
pub(crate) fn invoke_native(
    env: &Environment,
    function: &NativeFunction,
    flags: u32,
    this: Option<ObjectHandle>,
    args: &[EngineValue],
) -> Completion {
    let args = match marshal_out(env.engine(), args, flags) {
        Ok(args) => args,
        Err(e) => {
            env.set_exception(JsException::native(format!("argument conversion failed: {}", e)));
            return Err(throw_pending(env));
        }
    };
    let result = function(env, this, &args);
    complete(env, result)
}

/// Turns a native callback's outcome into a completion. A set exception slot
/// always wins over the produced result.
pub(crate) fn complete(env: &Environment, result: Option<TaggedValue>) -> Completion {
    if env.has_exception() {
        return Err(throw_pending(env));
    }
    match result {
        None => Ok(EngineValue::Undefined),
        Some(value) => value.to_engine(env.engine()).or_else(|e| {
            env.set_exception(JsException::native(format!("result conversion failed: {}", e)));
            Err(throw_pending(env))
        }),
    }
}

/// Moves the exception slot into an engine error object and clears the slot.
pub(crate) fn throw_pending(env: &Environment) -> EngineValue {
    let exception = env.take_exception();
    let message = if exception.message.is_empty() {
        "native callback failed"
    } else {
        exception.message.as_str()
    };
    env.engine().new_error(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_until_threshold() {
        let small: TaggedArgs = (0..INLINE_ARGS as i32).map(TaggedValue::Int).collect();
        assert!(!small.spilled());
        let large: TaggedArgs = (0..=INLINE_ARGS as i32).map(TaggedValue::Int).collect();
        assert!(large.spilled());
        assert_eq!(large.len(), INLINE_ARGS + 1);
        assert_eq!(large[INLINE_ARGS], TaggedValue::Int(INLINE_ARGS as i32));
    }
}
