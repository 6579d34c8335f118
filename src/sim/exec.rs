// Invocation execution
//
// Each invocation is a stack of frames stepping through function bodies.
// A workgroup is run cooperatively: every invocation runs until it reaches
// OpControlBarrier or returns, and no invocation passes a barrier before all
// of its siblings have arrived at one.

use std::collections::HashMap;

use spirv::{BuiltIn, ExecutionModel, Op, StorageClass};

use super::program::{Program, Type};
use super::value::{Pointer, Space, Value};
use super::{Buffers, SimError, VertexOutput};
use crate::spirv::Instruction;

/// Instructions one invocation may execute before it is assumed to hang.
pub const STEP_LIMIT: u64 = 1 << 20;

enum Flow {
    Next,
    Barrier,
    Return,
}

#[derive(Debug, PartialEq, Eq)]
enum Status {
    Barrier,
    Done,
}

struct Frame {
    function: u32,
    pc: usize,
    block: u32,
    prev_block: u32,
    /// Caller id receiving the return value.
    result: Option<u32>,
}

struct Env<'a> {
    shared: &'a mut HashMap<u32, Value>,
    buffers: &'a mut Buffers,
}

struct Invocation<'p> {
    program: &'p Program,
    values: HashMap<u32, Value>,
    private: HashMap<u32, Value>,
    frames: Vec<Frame>,
    steps: u64,
}

impl<'p> Invocation<'p> {
    fn new(program: &'p Program, inputs: &[(BuiltIn, Value)]) -> Result<Self, SimError> {
        let mut inv = Self {
            program,
            values: HashMap::new(),
            private: HashMap::new(),
            frames: Vec::new(),
            steps: 0,
        };

        for global in &program.globals {
            let storage = global.storage;
            let pointer = if storage == StorageClass::StorageBuffer as u32 || storage == StorageClass::Uniform as u32 {
                let binding = program.binding(global.id).ok_or(SimError::Unbound(global.id))?;
                Pointer::Buffer {
                    binding,
                    offset: 0,
                    ty: global.ty,
                }
            } else if storage == StorageClass::Workgroup as u32 {
                Pointer::Logical {
                    space: Space::Shared,
                    root: global.id,
                    path: Vec::new(),
                    ty: global.ty,
                }
            } else {
                let provided = program
                    .builtin(global.id)
                    .and_then(|b| inputs.iter().find(|(i, _)| *i as u32 == b))
                    .map(|(_, v)| v.clone());
                let initial = match (provided, global.initializer) {
                    (Some(v), _) => v,
                    (None, Some(init)) => inv.value(init)?,
                    (None, None) => program.zero(global.ty)?,
                };
                inv.private.insert(global.id, initial);
                Pointer::Logical {
                    space: Space::Private,
                    root: global.id,
                    path: Vec::new(),
                    ty: global.ty,
                }
            };
            inv.values.insert(global.id, Value::Pointer(pointer));
        }

        let entry = program.function(program.entry.function)?;
        let first = entry.entry_block()?;
        inv.frames.push(Frame {
            function: entry.id,
            pc: first + 1,
            block: entry.body[first].operands[0],
            prev_block: 0,
            result: None,
        });
        Ok(inv)
    }

    fn value(&self, id: u32) -> Result<Value, SimError> {
        self.values
            .get(&id)
            .or_else(|| self.program.constants.get(&id))
            .cloned()
            .ok_or(SimError::UnknownId(id))
    }

    fn word(&self, id: u32) -> Result<u32, SimError> {
        self.value(id)?.word()
    }

    fn set(&mut self, id: u32, value: Value) -> Flow {
        self.values.insert(id, value);
        Flow::Next
    }

    fn frame(&mut self) -> Result<&mut Frame, SimError> {
        self.frames.last_mut().ok_or(SimError::Malformed("no active frame"))
    }

    /// Run until a barrier or until the entry point returns.
    fn run(&mut self, env: &mut Env<'_>) -> Result<Status, SimError> {
        let program = self.program;
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Ok(Status::Done);
            };
            let function = program.function(frame.function)?;
            let inst = function
                .body
                .get(frame.pc)
                .ok_or(SimError::Malformed("fell off the end of a function"))?;
            frame.pc += 1;

            self.steps += 1;
            if self.steps > STEP_LIMIT {
                return Err(SimError::StepLimit(STEP_LIMIT));
            }
            match self.execute(inst, env)? {
                Flow::Next => {}
                Flow::Barrier => return Ok(Status::Barrier),
                Flow::Return if self.frames.is_empty() => return Ok(Status::Done),
                Flow::Return => {}
            }
        }
    }

    fn branch(&mut self, target: u32) -> Result<Flow, SimError> {
        let program = self.program;
        let frame = self.frame()?;
        let index = *program
            .function(frame.function)?
            .labels
            .get(&target)
            .ok_or(SimError::UnknownLabel(target))?;
        frame.prev_block = frame.block;
        frame.block = target;
        frame.pc = index + 1;
        Ok(Flow::Next)
    }

    fn ret(&mut self, value: Option<Value>) -> Result<Flow, SimError> {
        let frame = self.frames.pop().ok_or(SimError::Malformed("return without a frame"))?;
        if let (Some(id), Some(value)) = (frame.result, value) {
            self.values.insert(id, value);
        }
        Ok(Flow::Return)
    }

    fn call(&mut self, ops: &[u32]) -> Result<Flow, SimError> {
        let program = self.program;
        let callee = program.function(ops[2])?;
        for (param, arg) in callee.params.iter().zip(&ops[3..]) {
            let value = self.value(*arg)?;
            self.values.insert(*param, value);
        }
        let first = callee.entry_block()?;
        self.frames.push(Frame {
            function: callee.id,
            pc: first + 1,
            block: callee.body[first].operands[0],
            prev_block: 0,
            result: Some(ops[1]),
        });
        Ok(Flow::Next)
    }

    fn unary(&mut self, ops: &[u32], f: impl Fn(u32) -> Result<Value, SimError>) -> Result<Flow, SimError> {
        let a = self.value(ops[2])?;
        let r = a.map(&mut |x| f(x.word()?))?;
        Ok(self.set(ops[1], r))
    }

    fn binary(&mut self, ops: &[u32], f: impl Fn(u32, u32) -> Result<Value, SimError>) -> Result<Flow, SimError> {
        let a = self.value(ops[2])?;
        let b = self.value(ops[3])?;
        let r = a.zip(&b, &mut |x, y| f(x.word()?, y.word()?))?;
        Ok(self.set(ops[1], r))
    }

    fn logical(&mut self, ops: &[u32], f: impl Fn(bool, bool) -> bool) -> Result<Flow, SimError> {
        let a = self.value(ops[2])?;
        let b = self.value(ops[3])?;
        let r = a.zip(&b, &mut |x, y| Ok(Value::Bool(f(x.boolean()?, y.boolean()?))))?;
        Ok(self.set(ops[1], r))
    }

    fn execute(&mut self, inst: &Instruction, env: &mut Env<'_>) -> Result<Flow, SimError> {
        let ops = inst.operands.as_slice();
        let op = Op::from_u32(inst.opcode as u32).ok_or(SimError::UnsupportedOpcode(inst.opcode))?;
        let word = |x: u32| -> Result<Value, SimError> { Ok(Value::Word(x)) };
        let float = |x: f32| -> Result<Value, SimError> { Ok(Value::Word(x.to_bits())) };
        let boolean = |x: bool| -> Result<Value, SimError> { Ok(Value::Bool(x)) };

        match op {
            Op::Nop
            | Op::Line
            | Op::NoLine
            | Op::Label
            | Op::SelectionMerge
            | Op::LoopMerge
            | Op::MemoryBarrier => Ok(Flow::Next),
            Op::ControlBarrier => Ok(Flow::Barrier),

            // Control flow
            Op::Branch => self.branch(ops[0]),
            Op::BranchConditional => {
                let target = if self.value(ops[0])?.boolean()? { ops[1] } else { ops[2] };
                self.branch(target)
            }
            Op::Switch => {
                let selector = self.word(ops[0])?;
                let target = ops[2..]
                    .chunks_exact(2)
                    .find(|case| case[0] == selector)
                    .map_or(ops[1], |case| case[1]);
                self.branch(target)
            }
            Op::Phi => {
                let prev = self.frame()?.prev_block;
                let incoming = ops[2..]
                    .chunks_exact(2)
                    .find(|pair| pair[1] == prev)
                    .ok_or(SimError::Malformed("phi has no entry for the previous block"))?[0];
                let value = self.value(incoming)?;
                Ok(self.set(ops[1], value))
            }
            Op::Return => self.ret(None),
            Op::ReturnValue => {
                let value = self.value(ops[0])?;
                self.ret(Some(value))
            }
            Op::FunctionCall => self.call(ops),
            Op::Unreachable | Op::Kill | Op::TerminateInvocation => Err(SimError::Unreachable),

            // Memory
            Op::Variable => {
                let ty = match self.program.ty(ops[0])? {
                    Type::Pointer { pointee, .. } => *pointee,
                    _ => return Err(SimError::NotAPointer(ops[0])),
                };
                let initial = match ops.get(3) {
                    Some(init) => self.value(*init)?,
                    None => self.program.zero(ty)?,
                };
                self.private.insert(ops[1], initial);
                let pointer = Pointer::Logical {
                    space: Space::Private,
                    root: ops[1],
                    path: Vec::new(),
                    ty,
                };
                Ok(self.set(ops[1], Value::Pointer(pointer)))
            }
            Op::Load => {
                let pointer = self.value(ops[2])?.pointer()?.clone();
                let value = self.read(env, &pointer)?;
                Ok(self.set(ops[1], value))
            }
            Op::Store => {
                let pointer = self.value(ops[0])?.pointer()?.clone();
                let value = self.value(ops[1])?;
                self.write(env, &pointer, value)?;
                Ok(Flow::Next)
            }
            Op::AccessChain | Op::InBoundsAccessChain => {
                let base = self.value(ops[2])?.pointer()?.clone();
                let indices = ops[3..]
                    .iter()
                    .map(|id| self.word(*id))
                    .collect::<Result<Vec<_>, _>>()?;
                let pointer = self.chain(base, &indices)?;
                Ok(self.set(ops[1], Value::Pointer(pointer)))
            }
            Op::AtomicLoad => {
                let pointer = self.value(ops[2])?.pointer()?.clone();
                let value = self.read(env, &pointer)?;
                Ok(self.set(ops[1], value))
            }
            Op::AtomicStore => {
                let pointer = self.value(ops[0])?.pointer()?.clone();
                let value = self.value(ops[3])?;
                self.write(env, &pointer, value)?;
                Ok(Flow::Next)
            }
            Op::AtomicExchange
            | Op::AtomicIAdd
            | Op::AtomicISub
            | Op::AtomicUMin
            | Op::AtomicUMax
            | Op::AtomicAnd
            | Op::AtomicOr
            | Op::AtomicXor
            | Op::AtomicIIncrement
            | Op::AtomicIDecrement
            | Op::AtomicCompareExchange => self.atomic(op, ops, env),

            // Composites
            Op::CopyObject | Op::Bitcast => {
                let value = self.value(ops[2])?;
                Ok(self.set(ops[1], value))
            }
            Op::Undef => Ok(self.set(ops[1], Value::Undef)),
            Op::CompositeConstruct => {
                let parts = ops[2..]
                    .iter()
                    .map(|id| self.value(*id))
                    .collect::<Result<Vec<_>, _>>()?;
                let parts = if matches!(self.program.ty(ops[0])?, Type::Vector { .. }) {
                    // Vectors may be assembled from smaller vectors.
                    parts
                        .into_iter()
                        .flat_map(|p| match p {
                            Value::Composite(inner) => inner,
                            scalar => vec![scalar],
                        })
                        .collect()
                } else {
                    parts
                };
                Ok(self.set(ops[1], Value::Composite(parts)))
            }
            Op::CompositeExtract => {
                let value = self.value(ops[2])?.at(&ops[3..])?.clone();
                Ok(self.set(ops[1], value))
            }
            Op::CompositeInsert => {
                let object = self.value(ops[2])?;
                let mut composite = self.value(ops[3])?;
                *composite.at_mut(&ops[4..])? = object;
                Ok(self.set(ops[1], composite))
            }
            Op::VectorShuffle => {
                let mut pool = self.value(ops[2])?.parts()?.to_vec();
                pool.extend_from_slice(self.value(ops[3])?.parts()?);
                let picked = ops[4..]
                    .iter()
                    .map(|i| pool.get(*i as usize).cloned().unwrap_or(Value::Undef))
                    .collect();
                Ok(self.set(ops[1], Value::Composite(picked)))
            }
            Op::Select => {
                let condition = self.value(ops[2])?;
                let a = self.value(ops[3])?;
                let b = self.value(ops[4])?;
                let value = match condition {
                    Value::Bool(c) => {
                        if c {
                            a
                        } else {
                            b
                        }
                    }
                    Value::Composite(lanes) => Value::Composite(
                        lanes
                            .iter()
                            .zip(a.parts()?.iter().zip(b.parts()?))
                            .map(|(c, (x, y))| Ok(if c.boolean()? { x.clone() } else { y.clone() }))
                            .collect::<Result<_, SimError>>()?,
                    ),
                    other => return Err(SimError::TypeMismatch(format!("select on {other:?}"))),
                };
                Ok(self.set(ops[1], value))
            }

            // Integer arithmetic
            Op::IAdd => self.binary(ops, |a, b| word(a.wrapping_add(b))),
            Op::ISub => self.binary(ops, |a, b| word(a.wrapping_sub(b))),
            Op::IMul => self.binary(ops, |a, b| word(a.wrapping_mul(b))),
            Op::UDiv => self.binary(ops, |a, b| word(a.checked_div(b).ok_or(SimError::DivisionByZero)?)),
            Op::UMod => self.binary(ops, |a, b| word(a.checked_rem(b).ok_or(SimError::DivisionByZero)?)),
            Op::SDiv => self.binary(ops, |a, b| {
                if b == 0 {
                    return Err(SimError::DivisionByZero);
                }
                word((a as i32).wrapping_div(b as i32) as u32)
            }),
            Op::SRem => self.binary(ops, |a, b| {
                if b == 0 {
                    return Err(SimError::DivisionByZero);
                }
                word((a as i32).wrapping_rem(b as i32) as u32)
            }),
            Op::SMod => self.binary(ops, |a, b| {
                if b == 0 {
                    return Err(SimError::DivisionByZero);
                }
                let (a, b) = (a as i32, b as i32);
                let r = a.wrapping_rem(b);
                let r = if r != 0 && (r < 0) != (b < 0) { r + b } else { r };
                word(r as u32)
            }),
            Op::SNegate => self.unary(ops, |a| word((a as i32).wrapping_neg() as u32)),
            Op::ShiftLeftLogical => self.binary(ops, |a, b| word(a.wrapping_shl(b))),
            Op::ShiftRightLogical => self.binary(ops, |a, b| word(a.wrapping_shr(b))),
            Op::ShiftRightArithmetic => self.binary(ops, |a, b| word((a as i32).wrapping_shr(b) as u32)),
            Op::BitwiseAnd => self.binary(ops, |a, b| word(a & b)),
            Op::BitwiseOr => self.binary(ops, |a, b| word(a | b)),
            Op::BitwiseXor => self.binary(ops, |a, b| word(a ^ b)),
            Op::Not => self.unary(ops, |a| word(!a)),

            // Float arithmetic
            Op::FAdd => self.binary(ops, |a, b| float(f32::from_bits(a) + f32::from_bits(b))),
            Op::FSub => self.binary(ops, |a, b| float(f32::from_bits(a) - f32::from_bits(b))),
            Op::FMul => self.binary(ops, |a, b| float(f32::from_bits(a) * f32::from_bits(b))),
            Op::FDiv => self.binary(ops, |a, b| float(f32::from_bits(a) / f32::from_bits(b))),
            Op::FNegate => self.unary(ops, |a| float(-f32::from_bits(a))),
            Op::ConvertFToU => self.unary(ops, |a| word(f32::from_bits(a) as u32)),
            Op::ConvertFToS => self.unary(ops, |a| word(f32::from_bits(a) as i32 as u32)),
            Op::ConvertUToF => self.unary(ops, |a| float(a as f32)),
            Op::ConvertSToF => self.unary(ops, |a| float(a as i32 as f32)),

            // Comparisons
            Op::IEqual => self.binary(ops, |a, b| boolean(a == b)),
            Op::INotEqual => self.binary(ops, |a, b| boolean(a != b)),
            Op::ULessThan => self.binary(ops, |a, b| boolean(a < b)),
            Op::ULessThanEqual => self.binary(ops, |a, b| boolean(a <= b)),
            Op::UGreaterThan => self.binary(ops, |a, b| boolean(a > b)),
            Op::UGreaterThanEqual => self.binary(ops, |a, b| boolean(a >= b)),
            Op::SLessThan => self.binary(ops, |a, b| boolean((a as i32) < (b as i32))),
            Op::SLessThanEqual => self.binary(ops, |a, b| boolean((a as i32) <= (b as i32))),
            Op::SGreaterThan => self.binary(ops, |a, b| boolean((a as i32) > (b as i32))),
            Op::SGreaterThanEqual => self.binary(ops, |a, b| boolean((a as i32) >= (b as i32))),
            Op::FOrdEqual => self.binary(ops, |a, b| boolean(f32::from_bits(a) == f32::from_bits(b))),
            Op::FOrdNotEqual => self.binary(ops, |a, b| boolean(f32::from_bits(a) != f32::from_bits(b))),
            Op::FOrdLessThan => self.binary(ops, |a, b| boolean(f32::from_bits(a) < f32::from_bits(b))),
            Op::FOrdGreaterThan => self.binary(ops, |a, b| boolean(f32::from_bits(a) > f32::from_bits(b))),
            Op::FOrdLessThanEqual => self.binary(ops, |a, b| boolean(f32::from_bits(a) <= f32::from_bits(b))),
            Op::FOrdGreaterThanEqual => {
                self.binary(ops, |a, b| boolean(f32::from_bits(a) >= f32::from_bits(b)))
            }

            // Logic
            Op::LogicalAnd => self.logical(ops, |a, b| a && b),
            Op::LogicalOr => self.logical(ops, |a, b| a || b),
            Op::LogicalEqual => self.logical(ops, |a, b| a == b),
            Op::LogicalNotEqual => self.logical(ops, |a, b| a != b),
            Op::LogicalNot => {
                let a = self.value(ops[2])?;
                let r = a.map(&mut |x| Ok(Value::Bool(!x.boolean()?)))?;
                Ok(self.set(ops[1], r))
            }

            _ => Err(SimError::UnsupportedOpcode(inst.opcode)),
        }
    }

    fn atomic(&mut self, op: Op, ops: &[u32], env: &mut Env<'_>) -> Result<Flow, SimError> {
        let pointer = self.value(ops[2])?.pointer()?.clone();
        let old = self.read(env, &pointer)?.word()?;
        let new = match op {
            Op::AtomicExchange => self.word(ops[5])?,
            Op::AtomicIAdd => old.wrapping_add(self.word(ops[5])?),
            Op::AtomicISub => old.wrapping_sub(self.word(ops[5])?),
            Op::AtomicUMin => old.min(self.word(ops[5])?),
            Op::AtomicUMax => old.max(self.word(ops[5])?),
            Op::AtomicAnd => old & self.word(ops[5])?,
            Op::AtomicOr => old | self.word(ops[5])?,
            Op::AtomicXor => old ^ self.word(ops[5])?,
            Op::AtomicIIncrement => old.wrapping_add(1),
            Op::AtomicIDecrement => old.wrapping_sub(1),
            Op::AtomicCompareExchange => {
                if old == self.word(ops[7])? {
                    self.word(ops[6])?
                } else {
                    old
                }
            }
            _ => return Err(SimError::UnsupportedOpcode(op as u16)),
        };
        self.write(env, &pointer, Value::Word(new))?;
        Ok(self.set(ops[1], Value::Word(old)))
    }

    fn chain(&self, base: Pointer, indices: &[u32]) -> Result<Pointer, SimError> {
        let program = self.program;
        Ok(match base {
            Pointer::Buffer {
                binding,
                mut offset,
                mut ty,
            } => {
                for index in indices {
                    offset += program.layout_offset(ty, *index)?;
                    ty = program.child(ty, *index)?;
                }
                Pointer::Buffer { binding, offset, ty }
            }
            Pointer::Logical {
                space,
                root,
                mut path,
                mut ty,
            } => {
                for index in indices {
                    ty = program.child(ty, *index)?;
                    path.push(*index);
                }
                Pointer::Logical { space, root, path, ty }
            }
        })
    }

    fn read(&self, env: &Env<'_>, pointer: &Pointer) -> Result<Value, SimError> {
        match pointer {
            Pointer::Buffer { binding, offset, ty } => {
                let words = env.buffers.get(binding.0, binding.1).ok_or(SimError::MissingBinding {
                    set: binding.0,
                    binding: binding.1,
                })?;
                self.read_buffer(words, *binding, *offset, *ty)
            }
            Pointer::Logical { space, root, path, .. } => {
                let memory = match space {
                    Space::Shared => &*env.shared,
                    Space::Private => &self.private,
                };
                memory
                    .get(root)
                    .ok_or(SimError::UnknownId(*root))?
                    .at(path)
                    .cloned()
            }
        }
    }

    fn write(&mut self, env: &mut Env<'_>, pointer: &Pointer, value: Value) -> Result<(), SimError> {
        match pointer {
            Pointer::Buffer { binding, offset, ty } => {
                let words = env.buffers.get_mut(binding.0, binding.1).ok_or(SimError::MissingBinding {
                    set: binding.0,
                    binding: binding.1,
                })?;
                write_buffer(self.program, words, *binding, *offset, *ty, &value)
            }
            Pointer::Logical { space, root, path, .. } => {
                let memory = match space {
                    Space::Shared => &mut *env.shared,
                    Space::Private => &mut self.private,
                };
                let slot = memory.get_mut(root).ok_or(SimError::UnknownId(*root))?.at_mut(path)?;
                *slot = value;
                Ok(())
            }
        }
    }

    fn read_buffer(&self, words: &[u32], binding: (u32, u32), offset: u32, ty: u32) -> Result<Value, SimError> {
        let program = self.program;
        let count = match program.ty(ty)? {
            Type::Int { .. } | Type::Float { .. } | Type::Bool => {
                let word = *words.get((offset / 4) as usize).ok_or(SimError::OutOfBuffer {
                    set: binding.0,
                    binding: binding.1,
                    offset,
                })?;
                return Ok(if matches!(program.ty(ty)?, Type::Bool) {
                    Value::Bool(word != 0)
                } else {
                    Value::Word(word)
                });
            }
            Type::Vector { count, .. } | Type::Matrix { count, .. } => *count,
            Type::Array { length, .. } => *length,
            Type::Struct { members } => members.len() as u32,
            _ => return Err(SimError::Unsized(ty)),
        };
        (0..count)
            .map(|i| {
                let at = offset + program.layout_offset(ty, i)?;
                self.read_buffer(words, binding, at, program.child(ty, i)?)
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Composite)
    }
}

fn write_buffer(
    program: &Program,
    words: &mut [u32],
    binding: (u32, u32),
    offset: u32,
    ty: u32,
    value: &Value,
) -> Result<(), SimError> {
    match value {
        Value::Composite(parts) => {
            for (i, part) in parts.iter().enumerate() {
                let i = i as u32;
                let at = offset + program.layout_offset(ty, i)?;
                write_buffer(program, words, binding, at, program.child(ty, i)?, part)?;
            }
            Ok(())
        }
        scalar => {
            let slot = words.get_mut((offset / 4) as usize).ok_or(SimError::OutOfBuffer {
                set: binding.0,
                binding: binding.1,
                offset,
            })?;
            *slot = scalar.word()?;
            Ok(())
        }
    }
}

fn expect_model(program: &Program, model: ExecutionModel) -> Result<(), SimError> {
    if program.entry.model == model as u32 {
        Ok(())
    } else {
        Err(SimError::WrongStage {
            expected: model as u32,
            found: program.entry.model,
        })
    }
}

fn uvec3(v: [u32; 3]) -> Value {
    Value::Composite(v.iter().map(|w| Value::Word(*w)).collect())
}

/// Run `groups` workgroups of a compute module against `buffers`.
pub fn dispatch(program: &Program, groups: [u32; 3], buffers: &mut Buffers) -> Result<(), SimError> {
    expect_model(program, ExecutionModel::GLCompute)?;
    let size = program.entry.local_size;

    for gz in 0..groups[2] {
        for gy in 0..groups[1] {
            for gx in 0..groups[0] {
                let group = [gx, gy, gz];
                let mut shared = program
                    .globals_in(StorageClass::Workgroup)
                    .map(|g| Ok((g.id, program.zero(g.ty)?)))
                    .collect::<Result<HashMap<_, _>, SimError>>()?;

                let mut invocations = Vec::new();
                for lz in 0..size[2] {
                    for ly in 0..size[1] {
                        for lx in 0..size[0] {
                            let local = [lx, ly, lz];
                            let index = lx + ly * size[0] + lz * size[0] * size[1];
                            let global = [
                                gx * size[0] + lx,
                                gy * size[1] + ly,
                                gz * size[2] + lz,
                            ];
                            let inputs = [
                                (BuiltIn::LocalInvocationIndex, Value::Word(index)),
                                (BuiltIn::LocalInvocationId, uvec3(local)),
                                (BuiltIn::WorkgroupId, uvec3(group)),
                                (BuiltIn::NumWorkgroups, uvec3(groups)),
                                (BuiltIn::GlobalInvocationId, uvec3(global)),
                                (BuiltIn::WorkgroupSize, uvec3(size)),
                            ];
                            invocations.push(Invocation::new(program, &inputs)?);
                        }
                    }
                }

                let mut env = Env {
                    shared: &mut shared,
                    buffers: &mut *buffers,
                };
                // Highest local index first, so nothing relies on invocation 0 leading.
                let mut done = vec![false; invocations.len()];
                while done.iter().any(|d| !d) {
                    for (inv, finished) in invocations.iter_mut().zip(done.iter_mut()).rev() {
                        if !*finished {
                            *finished = inv.run(&mut env)? == Status::Done;
                        }
                    }
                }
                log::trace!("workgroup {group:?} finished");
            }
        }
    }
    Ok(())
}

/// Run one vertex invocation and collect its outputs.
pub fn run_vertex(program: &Program, vertex_index: u32, buffers: &mut Buffers) -> Result<VertexOutput, SimError> {
    expect_model(program, ExecutionModel::Vertex)?;
    let inputs = [
        (BuiltIn::VertexIndex, Value::Word(vertex_index)),
        (BuiltIn::InstanceIndex, Value::Word(0)),
    ];
    let mut inv = Invocation::new(program, &inputs)?;
    let mut shared = HashMap::new();
    let mut env = Env {
        shared: &mut shared,
        buffers,
    };
    while inv.run(&mut env)? != Status::Done {}

    let mut output = VertexOutput::default();
    for global in program.globals_in(StorageClass::Output) {
        let value = inv.private.get(&global.id).cloned().unwrap_or(Value::Undef);
        let position = if program.builtin(global.id) == Some(BuiltIn::Position as u32) {
            Some(value.clone())
        } else if let Type::Struct { members } = program.ty(global.ty)? {
            (0..members.len() as u32)
                .find(|m| program.member_builtin(global.ty, *m) == Some(BuiltIn::Position as u32))
                .map(|m| value.at(&[m]).cloned())
                .transpose()?
        } else {
            None
        };
        if let Some(position) = position {
            output.set_position(&position)?;
        }
        if let Some(location) = program.location(global.id) {
            output.locations.insert(location, value.clone());
        }
        output.values.insert(global.id, value);
    }
    Ok(output)
}
