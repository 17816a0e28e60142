//! Load-time bytecode verifier.
//!
//! Rejects modules whose functions reference missing functions, operations
//! or jump targets, and checks that every reachable instruction sees a
//! consistent address stack height and pending operation depth:
//! - Control Flow: jump targets and labels lie within `0..=code.len()`
//! - Height Consistency: every merge point is reached with one height
//! - Stack Effect Validation: no address stack or pending operation underflow
//!
//! Checks that depend on the arena layout (result slots, data segment) are
//! left to the interpreter.

use std::collections::{HashSet, VecDeque};

use thiserror::Error;

use super::bytecode::{Function, Module};
use super::ops::Instruction;

/// Verification error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("duplicate function `{0}`")]
    DuplicateFunction(String),

    #[error("duplicate label `{label}` in `{function}`")]
    DuplicateLabel { function: String, label: String },

    #[error("label `{label}` in `{function}` points at {pc}, outside of the code")]
    InvalidLabel {
        function: String,
        label: String,
        pc: usize,
    },

    #[error("invalid jump target in `{function}` at pc={pc}: target={target} is out of bounds")]
    InvalidJumpTarget {
        function: String,
        pc: usize,
        target: usize,
    },

    #[error("unknown function {index} called from `{function}` at pc={pc}")]
    UnknownFunction {
        function: String,
        pc: usize,
        index: usize,
    },

    #[error("unknown operation {index} in `{function}` at pc={pc}")]
    UnknownOperation {
        function: String,
        pc: usize,
        index: usize,
    },

    #[error(
        "address stack underflow in `{function}` at pc={pc}: requires {required} addresses, but only {actual} available"
    )]
    AddressStackUnderflow {
        function: String,
        pc: usize,
        required: usize,
        actual: usize,
    },

    #[error("{instruction} outside of an operation in `{function}` at pc={pc}")]
    NotInOperation {
        function: String,
        pc: usize,
        instruction: String,
    },

    #[error(
        "inconsistent state at merge point in `{function}` pc={pc}: expected {expected:?}, got {actual:?}"
    )]
    StateMismatch {
        function: String,
        pc: usize,
        expected: (usize, usize),
        actual: (usize, usize),
    },
}

/// Abstract state at an instruction: (address stack height, open operations).
type State = (usize, usize);

/// Verify every function of `module`.
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    let mut names = HashSet::new();
    for func in &module.functions {
        if !names.insert(func.name.as_str()) {
            return Err(VerifyError::DuplicateFunction(func.name.clone()));
        }
    }
    let verifier = Verifier { module };
    for func in &module.functions {
        verifier.verify_function(func)?;
    }
    Ok(())
}

struct Verifier<'m> {
    module: &'m Module,
}

impl Verifier<'_> {
    fn verify_function(&self, func: &Function) -> Result<(), VerifyError> {
        let len = func.code.len();

        let mut labels = HashSet::new();
        for (label, pc) in &func.labels {
            if !labels.insert(label.as_str()) {
                return Err(VerifyError::DuplicateLabel {
                    function: func.name.clone(),
                    label: label.clone(),
                });
            }
            if *pc as usize > len {
                return Err(VerifyError::InvalidLabel {
                    function: func.name.clone(),
                    label: label.clone(),
                    pc: *pc as usize,
                });
            }
        }

        for (pc, instruction) in func.code.iter().enumerate() {
            self.check_references(func, pc, instruction)?;
        }

        self.check_stack(func)
    }

    fn check_references(&self, func: &Function, pc: usize, instruction: &Instruction) -> Result<(), VerifyError> {
        if let Some(target) = instruction.jump_target() {
            if target as usize > func.code.len() {
                return Err(VerifyError::InvalidJumpTarget {
                    function: func.name.clone(),
                    pc,
                    target: target as usize,
                });
            }
        }
        match instruction {
            Instruction::Call(index) if *index as usize >= self.module.functions.len() => {
                Err(VerifyError::UnknownFunction {
                    function: func.name.clone(),
                    pc,
                    index: *index as usize,
                })
            }
            Instruction::OpEnd { op, .. } if *op as usize >= self.module.ops.len() => {
                Err(VerifyError::UnknownOperation {
                    function: func.name.clone(),
                    pc,
                    index: *op as usize,
                })
            }
            _ => Ok(()),
        }
    }

    /// Abstract interpretation over the control flow graph, visiting each
    /// reachable instruction once with its entry state.
    fn check_stack(&self, func: &Function) -> Result<(), VerifyError> {
        let len = func.code.len();
        let mut states: Vec<Option<State>> = vec![None; len + 1];
        let mut worklist = VecDeque::new();

        states[0] = Some((0, 0));
        worklist.push_back(0usize);

        while let Some(pc) = worklist.pop_front() {
            if pc == len {
                continue;
            }
            let Some(state) = states[pc] else { continue };
            let instruction = &func.code[pc];
            let next = self.apply(func, pc, instruction, state)?;

            let successors = match instruction {
                Instruction::Return => vec![],
                Instruction::Jump(target) => vec![*target as usize],
                Instruction::BranchIf(target) => vec![pc + 1, *target as usize],
                _ => vec![pc + 1],
            };

            for succ in successors {
                match states[succ] {
                    None => {
                        states[succ] = Some(next);
                        worklist.push_back(succ);
                    }
                    Some(existing) if existing != next => {
                        return Err(VerifyError::StateMismatch {
                            function: func.name.clone(),
                            pc: succ,
                            expected: existing,
                            actual: next,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(())
    }

    fn apply(&self, func: &Function, pc: usize, instruction: &Instruction, state: State) -> Result<State, VerifyError> {
        let (height, open) = state;

        let (pops, pushes) = match instruction {
            Instruction::DataAddress(_)
            | Instruction::ParamsAddress(_)
            | Instruction::ResultAddress
            | Instruction::LocalsAddress(_)
            | Instruction::GlobalsAddress(_) => (0, 1),
            Instruction::Offset(_) | Instruction::Reference | Instruction::Dereference => (1, 1),
            Instruction::Tuple(sizes) => (sizes.len(), 1),
            Instruction::Copy(_) => (2, 0),
            Instruction::OpBegin => (0, 0),
            Instruction::Param | Instruction::Target => (1, 0),
            Instruction::OpEnd { result, .. } => (0, usize::from(*result > 0)),
            Instruction::Call(index) => {
                let callee = &self.module.functions[*index as usize];
                (callee.params.len(), usize::from(callee.result.is_some()))
            }
            Instruction::Jump(_) | Instruction::Return => (0, 0),
            Instruction::BranchIf(_) => (1, 0),
        };

        if height < pops {
            return Err(VerifyError::AddressStackUnderflow {
                function: func.name.clone(),
                pc,
                required: pops,
                actual: height,
            });
        }

        let open = match instruction {
            Instruction::OpBegin => open + 1,
            Instruction::Param | Instruction::Target | Instruction::OpEnd { .. } if open == 0 => {
                return Err(VerifyError::NotInOperation {
                    function: func.name.clone(),
                    pc,
                    instruction: instruction.to_string(),
                });
            }
            Instruction::OpEnd { .. } => open - 1,
            _ => open,
        };

        Ok((height - pops + pushes, open))
    }
}
