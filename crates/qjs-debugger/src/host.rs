use serde_json::Value;

use crate::breakpoints::{FunctionBreakpoints, FunctionLayout};
use crate::location::Location;
use crate::protocol::{StackFrame, Variable};

/// The function executing at a program counter, with its breakpoint cache.
pub struct FunctionSlot<'a> {
    pub breakpoints: &'a mut FunctionBreakpoints,
    pub layout: &'a dyn FunctionLayout,
    /// Instruction offset of the program counter inside the function.
    pub offset: usize,
}

/// Introspection hooks the engine needs from the virtual machine.
///
/// Frame index 0 is the innermost frame. The engine validates frame indices
/// against [`DebugHost::stack_depth`] before calling the per-frame hooks.
pub trait DebugHost {
    type Pc: Copy;

    fn current_location(&self, pc: Self::Pc) -> Option<Location>;

    fn stack_depth(&self) -> usize;

    /// `None` for native code or functions without debug info.
    fn function_at(&mut self, pc: Self::Pc) -> Option<FunctionSlot<'_>>;

    fn build_backtrace(&self, pc: Self::Pc) -> Vec<StackFrame>;

    fn locals_at(&self, frame: usize) -> Vec<Variable>;

    fn closure_variables_at(&self, frame: usize) -> Vec<Variable>;

    /// Evaluates `expression` in the scope of `frame`. An exception thrown by
    /// the expression is returned as its message.
    fn evaluate_at(&mut self, frame: usize, expression: &str) -> Result<Value, String>;
}
