// Module loading for the reference executor
//
// Resolves a decoded module into the tables execution needs: type shapes,
// constant values, module-scope variables, buffer layout decorations and
// function bodies indexed by label.

use std::collections::HashMap;

use spirv::{BuiltIn, Decoration, ExecutionMode, Op, StorageClass};

use super::value::Value;
use super::SimError;
use crate::spirv::{Bytecode, Instruction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Void,
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: u32, count: u32 },
    Matrix { column: u32, count: u32 },
    Array { element: u32, length: u32 },
    RuntimeArray { element: u32 },
    Struct { members: Vec<u32> },
    Pointer { storage: u32, pointee: u32 },
    Function,
}

#[derive(Debug, Clone)]
pub struct Global {
    pub id: u32,
    /// Type of the variable's storage, not its pointer type.
    pub ty: u32,
    pub storage: u32,
    pub initializer: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub id: u32,
    pub params: Vec<u32>,
    /// Instructions between `OpFunction` and `OpFunctionEnd`, exclusive.
    pub body: Vec<Instruction>,
    /// Label id to index of its `OpLabel` in `body`.
    pub labels: HashMap<u32, usize>,
}

impl Function {
    /// Index of the first block's label.
    pub fn entry_block(&self) -> Result<usize, SimError> {
        self.body
            .iter()
            .position(|inst| inst.is(Op::Label))
            .ok_or(SimError::NoBody(self.id))
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub model: u32,
    pub function: u32,
    pub name: String,
    pub local_size: [u32; 3],
}

/// A loaded module ready for execution.
#[derive(Debug, Clone)]
pub struct Program {
    pub types: HashMap<u32, Type>,
    pub constants: HashMap<u32, Value>,
    pub globals: Vec<Global>,
    pub functions: HashMap<u32, Function>,
    pub entry: Entry,
    builtins: HashMap<u32, u32>,
    member_builtins: HashMap<(u32, u32), u32>,
    bindings: HashMap<u32, (u32, u32)>,
    offsets: HashMap<(u32, u32), u32>,
    strides: HashMap<u32, u32>,
    locations: HashMap<u32, u32>,
}

impl Program {
    pub fn load(words: &[u32]) -> Result<Self, SimError> {
        let bytecode = Bytecode::new(words)?;
        let mut program = Self {
            types: HashMap::new(),
            constants: HashMap::new(),
            globals: Vec::new(),
            functions: HashMap::new(),
            entry: Entry {
                model: 0,
                function: 0,
                name: String::new(),
                local_size: [1, 1, 1],
            },
            builtins: HashMap::new(),
            member_builtins: HashMap::new(),
            bindings: HashMap::new(),
            offsets: HashMap::new(),
            strides: HashMap::new(),
            locations: HashMap::new(),
        };
        let mut entry_found = false;
        let mut sets: HashMap<u32, u32> = HashMap::new();
        let mut binding_of: HashMap<u32, u32> = HashMap::new();
        let mut current: Option<Function> = None;

        for inst in bytecode.instructions() {
            if let Some(function) = current.as_mut() {
                if inst.is(Op::FunctionEnd) {
                    let done = current.take().ok_or(SimError::Malformed("function end"))?;
                    program.functions.insert(done.id, done);
                } else if inst.is(Op::FunctionParameter) {
                    function.params.push(inst.operands[1]);
                } else {
                    if inst.is(Op::Label) {
                        function.labels.insert(inst.operands[0], function.body.len());
                    }
                    function.body.push(inst);
                }
                continue;
            }

            let ops = &inst.operands;
            match Op::from_u32(inst.opcode as u32) {
                Some(Op::EntryPoint) if !entry_found => {
                    entry_found = true;
                    program.entry.model = ops[0];
                    program.entry.function = ops[1];
                    program.entry.name = inst.string_at(2).map(|(s, _)| s).unwrap_or_default();
                }
                Some(Op::ExecutionMode) if ops[1] == ExecutionMode::LocalSize as u32 => {
                    program.entry.local_size = [ops[2], ops[3], ops[4]];
                }
                Some(Op::Decorate) => {
                    let (target, decoration) = (ops[0], ops[1]);
                    if decoration == Decoration::BuiltIn as u32 {
                        program.builtins.insert(target, ops[2]);
                    } else if decoration == Decoration::DescriptorSet as u32 {
                        sets.insert(target, ops[2]);
                    } else if decoration == Decoration::Binding as u32 {
                        binding_of.insert(target, ops[2]);
                    } else if decoration == Decoration::ArrayStride as u32 {
                        program.strides.insert(target, ops[2]);
                    } else if decoration == Decoration::Location as u32 {
                        program.locations.insert(target, ops[2]);
                    }
                }
                Some(Op::MemberDecorate) => {
                    let (target, member, decoration) = (ops[0], ops[1], ops[2]);
                    if decoration == Decoration::Offset as u32 {
                        program.offsets.insert((target, member), ops[3]);
                    } else if decoration == Decoration::BuiltIn as u32 {
                        program.member_builtins.insert((target, member), ops[3]);
                    }
                }
                Some(Op::TypeVoid) => program.declare(ops[0], Type::Void),
                Some(Op::TypeBool) => program.declare(ops[0], Type::Bool),
                Some(Op::TypeInt) => program.declare(
                    ops[0],
                    Type::Int {
                        width: ops[1],
                        signed: ops[2] != 0,
                    },
                ),
                Some(Op::TypeFloat) => program.declare(ops[0], Type::Float { width: ops[1] }),
                Some(Op::TypeVector) => program.declare(
                    ops[0],
                    Type::Vector {
                        component: ops[1],
                        count: ops[2],
                    },
                ),
                Some(Op::TypeMatrix) => program.declare(
                    ops[0],
                    Type::Matrix {
                        column: ops[1],
                        count: ops[2],
                    },
                ),
                Some(Op::TypeArray) => {
                    let length = program.constant_word(ops[2])?;
                    program.declare(
                        ops[0],
                        Type::Array {
                            element: ops[1],
                            length,
                        },
                    )
                }
                Some(Op::TypeRuntimeArray) => program.declare(ops[0], Type::RuntimeArray { element: ops[1] }),
                Some(Op::TypeStruct) => program.declare(
                    ops[0],
                    Type::Struct {
                        members: ops[1..].to_vec(),
                    },
                ),
                Some(Op::TypePointer) => program.declare(
                    ops[0],
                    Type::Pointer {
                        storage: ops[1],
                        pointee: ops[2],
                    },
                ),
                Some(Op::TypeFunction) => program.declare(ops[0], Type::Function),
                Some(Op::Constant) | Some(Op::SpecConstant) => {
                    program.constants.insert(ops[1], Value::Word(ops[2]));
                }
                Some(Op::ConstantTrue) | Some(Op::SpecConstantTrue) => {
                    program.constants.insert(ops[1], Value::Bool(true));
                }
                Some(Op::ConstantFalse) | Some(Op::SpecConstantFalse) => {
                    program.constants.insert(ops[1], Value::Bool(false));
                }
                Some(Op::ConstantComposite) | Some(Op::SpecConstantComposite) => {
                    let parts = ops[2..]
                        .iter()
                        .map(|id| program.constants.get(id).cloned().ok_or(SimError::UnknownId(*id)))
                        .collect::<Result<Vec<_>, _>>()?;
                    program.constants.insert(ops[1], Value::Composite(parts));
                }
                Some(Op::ConstantNull) => {
                    let zero = program.zero(ops[0])?;
                    program.constants.insert(ops[1], zero);
                }
                Some(Op::Undef) => {
                    program.constants.insert(ops[1], Value::Undef);
                }
                Some(Op::Variable) => {
                    let ty = match program.types.get(&ops[0]) {
                        Some(Type::Pointer { pointee, .. }) => *pointee,
                        _ => return Err(SimError::NotAPointer(ops[0])),
                    };
                    program.globals.push(Global {
                        id: ops[1],
                        ty,
                        storage: ops[2],
                        initializer: ops.get(3).copied(),
                    });
                }
                Some(Op::Function) => {
                    current = Some(Function {
                        id: ops[1],
                        params: Vec::new(),
                        body: Vec::new(),
                        labels: HashMap::new(),
                    });
                }
                _ => {}
            }
        }

        if !entry_found {
            return Err(SimError::NoEntryPoint);
        }
        for (var, set) in sets {
            if let Some(binding) = binding_of.get(&var) {
                program.bindings.insert(var, (set, *binding));
            }
        }
        log::debug!(
            "loaded `{}`: {} types, {} globals, {} functions",
            program.entry.name,
            program.types.len(),
            program.globals.len(),
            program.functions.len()
        );
        Ok(program)
    }

    fn declare(&mut self, id: u32, ty: Type) {
        self.types.insert(id, ty);
    }

    fn constant_word(&self, id: u32) -> Result<u32, SimError> {
        match self.constants.get(&id) {
            Some(Value::Word(w)) => Ok(*w),
            _ => Err(SimError::UnknownId(id)),
        }
    }

    pub fn ty(&self, id: u32) -> Result<&Type, SimError> {
        self.types.get(&id).ok_or(SimError::UnknownId(id))
    }

    /// Zero value of type `id`.
    pub fn zero(&self, id: u32) -> Result<Value, SimError> {
        Ok(match self.ty(id)? {
            Type::Bool => Value::Bool(false),
            Type::Int { .. } | Type::Float { .. } => Value::Word(0),
            Type::Vector { component, count } => Value::Composite(vec![self.zero(*component)?; *count as usize]),
            Type::Matrix { column, count } => Value::Composite(vec![self.zero(*column)?; *count as usize]),
            Type::Array { element, length } => Value::Composite(vec![self.zero(*element)?; *length as usize]),
            Type::Struct { members } => Value::Composite(
                members
                    .iter()
                    .map(|m| self.zero(*m))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Type::Pointer { .. } | Type::Void | Type::Function => Value::Undef,
            Type::RuntimeArray { .. } => return Err(SimError::Unsized(id)),
        })
    }

    /// Type reached by stepping into `ty` with `index`.
    pub fn child(&self, ty: u32, index: u32) -> Result<u32, SimError> {
        match self.ty(ty)? {
            Type::Vector { component, .. } => Ok(*component),
            Type::Matrix { column, .. } => Ok(*column),
            Type::Array { element, .. } | Type::RuntimeArray { element } => Ok(*element),
            Type::Struct { members } => members
                .get(index as usize)
                .copied()
                .ok_or(SimError::OutOfBounds { index, ty }),
            _ => Err(SimError::NotComposite(ty)),
        }
    }

    /// Byte offset of `index` inside a buffer object of type `ty`.
    pub fn layout_offset(&self, ty: u32, index: u32) -> Result<u32, SimError> {
        match self.ty(ty)? {
            Type::Struct { .. } => self
                .offsets
                .get(&(ty, index))
                .copied()
                .ok_or(SimError::Layout(ty)),
            Type::Array { .. } | Type::RuntimeArray { .. } => {
                let stride = self.strides.get(&ty).copied().ok_or(SimError::Layout(ty))?;
                Ok(index * stride)
            }
            Type::Vector { .. } => Ok(index * 4),
            Type::Matrix { column, .. } => Ok(index * self.byte_size(*column)?),
            _ => Err(SimError::NotComposite(ty)),
        }
    }

    /// Bytes a tightly packed object of type `ty` spans.
    pub fn byte_size(&self, ty: u32) -> Result<u32, SimError> {
        Ok(match self.ty(ty)? {
            Type::Bool | Type::Int { .. } | Type::Float { .. } => 4,
            Type::Vector { component, count } => count * self.byte_size(*component)?,
            Type::Matrix { column, count } => count * self.byte_size(*column)?,
            Type::Array { element, length } => match self.strides.get(&ty) {
                Some(stride) => length * stride,
                None => length * self.byte_size(*element)?,
            },
            _ => return Err(SimError::Unsized(ty)),
        })
    }

    pub fn builtin(&self, var: u32) -> Option<u32> {
        self.builtins.get(&var).copied()
    }

    pub fn member_builtin(&self, ty: u32, member: u32) -> Option<u32> {
        self.member_builtins.get(&(ty, member)).copied()
    }

    pub fn binding(&self, var: u32) -> Option<(u32, u32)> {
        self.bindings.get(&var).copied()
    }

    pub fn location(&self, var: u32) -> Option<u32> {
        self.locations.get(&var).copied()
    }

    pub fn function(&self, id: u32) -> Result<&Function, SimError> {
        self.functions.get(&id).ok_or(SimError::UnknownFunction(id))
    }

    pub fn globals_in(&self, storage: StorageClass) -> impl Iterator<Item = &Global> {
        self.globals.iter().filter(move |g| g.storage == storage as u32)
    }

    /// Module-scope variable decorated with `builtin`, if any.
    pub fn builtin_global(&self, builtin: BuiltIn) -> Option<&Global> {
        self.globals.iter().find(|g| self.builtin(g.id) == Some(builtin as u32))
    }
}
