// Mesh shader interface discovery
//
// Read-only passes over the source module: which builtins it uses, which
// outputs become varyings, and where each varying lands in a flattened
// per-vertex record of 32-bit words.

use std::collections::HashMap;

use spirv::{BuiltIn, Decoration, ExecutionMode, ExecutionModel, Op, StorageClass};

use super::LowerErrorKind;
use crate::spirv::{Instruction, MutableBytecode, SpirvError, TraverseOrder};

/// Decorations of a module, keyed by target.
#[derive(Debug, Default, Clone)]
pub struct Decorations {
    /// `target -> [decoration, literals...]` for every `OpDecorate`.
    pub targets: HashMap<u32, Vec<Vec<u32>>>,
    /// `(struct, member) -> [decoration, literals...]` for every `OpMemberDecorate`.
    pub members: HashMap<(u32, u32), Vec<Vec<u32>>>,
}

impl Decorations {
    pub fn collect(code: &MutableBytecode) -> Self {
        let mut out = Self::default();
        for inst in code.instructions() {
            if inst.is(Op::Decorate) {
                out.targets
                    .entry(inst.operands[0])
                    .or_default()
                    .push(inst.operands[1..].to_vec());
            } else if inst.is(Op::MemberDecorate) {
                out.members
                    .entry((inst.operands[0], inst.operands[1]))
                    .or_default()
                    .push(inst.operands[2..].to_vec());
            }
        }
        out
    }

    /// Literals of `decoration` on `target`.
    pub fn get(&self, target: u32, decoration: Decoration) -> Option<&[u32]> {
        self.targets
            .get(&target)?
            .iter()
            .find(|d| d[0] == decoration as u32)
            .map(|d| &d[1..])
    }

    pub fn has(&self, target: u32, decoration: Decoration) -> bool {
        self.get(target, decoration).is_some()
    }

    /// Whether any member of struct `target` carries `decoration`.
    pub fn any_member(&self, target: u32, decoration: Decoration) -> bool {
        self.members
            .iter()
            .any(|((s, _), list)| *s == target && list.iter().any(|d| d[0] == decoration as u32))
    }

    pub fn builtin(&self, target: u32) -> Option<u32> {
        self.get(target, Decoration::BuiltIn).map(|lits| lits[0])
    }
}

/// `OpName` strings by target.
pub fn debug_names(code: &MutableBytecode) -> HashMap<u32, String> {
    code.instructions()
        .iter()
        .filter(|inst| inst.is(Op::Name))
        .filter_map(|inst| Some((inst.operands[0], inst.string_at(1)?.0)))
        .collect()
}

/// Variables the source module binds to fixed hardware roles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Builtins {
    pub num_workgroups: Option<u32>,
    pub workgroup_size: Option<u32>,
    pub workgroup_id: Option<u32>,
    pub local_invocation_id: Option<u32>,
    pub local_invocation_index: Option<u32>,
    /// `gl_PrimitiveTriangleIndicesEXT`.
    pub primitive_indices: Option<u32>,
    /// `gl_MeshVerticesEXT`, the implicit per-vertex output block.
    pub per_vertex: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub function: u32,
    pub name: String,
    pub interface: Vec<u32>,
    pub local_size: [u32; 3],
    pub max_vertices: u32,
    pub max_primitives: u32,
}

/// One output of the mesh shader, flattened into the per-vertex record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Varying {
    pub variable: u32,
    /// `ptr<Output, T[max_vertices]>`.
    pub pointer_type: u32,
    /// `T`, the per-vertex type.
    pub element_type: u32,
    pub location: Option<u32>,
    /// First word of this varying inside the per-vertex record.
    pub write_offset: u32,
    /// Scalar leaves of `T`.
    pub leaf_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshInterface {
    pub entry: EntryPoint,
    pub builtins: Builtins,
    pub varyings: Vec<Varying>,
    /// Words per vertex: scalar leaves across all varyings.
    pub var_count: u32,
}

impl MeshInterface {
    pub fn varying(&self, variable: u32) -> Option<&Varying> {
        self.varyings.iter().find(|v| v.variable == variable)
    }
}

/// Run both discovery passes.
pub fn analyze(code: &MutableBytecode) -> Result<MeshInterface, LowerErrorKind> {
    let (entry, builtins) = analyze_builtins(code)?;
    let (varyings, var_count) = traverse_varyings(code, &builtins)?;
    log::debug!(
        "entry `{}`: {} varyings, {} words per vertex",
        entry.name,
        varyings.len(),
        var_count
    );
    Ok(MeshInterface {
        entry,
        builtins,
        varyings,
        var_count,
    })
}

fn pointee(code: &MutableBytecode, pointer_type: u32) -> Option<u32> {
    code.find_def(pointer_type)
        .filter(|decl| decl.is(Op::TypePointer))
        .map(|decl| decl.operands[2])
}

fn is_per_vertex_builtin(builtin: u32) -> bool {
    [BuiltIn::Position, BuiltIn::PointSize, BuiltIn::ClipDistance, BuiltIn::CullDistance]
        .iter()
        .any(|b| *b as u32 == builtin)
}

/// Single scan for the mesh entry point, its execution modes and builtins.
pub fn analyze_builtins(code: &MutableBytecode) -> Result<(EntryPoint, Builtins), LowerErrorKind> {
    let decorations = Decorations::collect(code);

    let entries: Vec<(usize, &Instruction)> = code
        .instructions()
        .iter()
        .enumerate()
        .filter(|(_, inst)| inst.is(Op::EntryPoint))
        .collect();
    let mesh = entries
        .iter()
        .find(|(_, inst)| inst.operands[0] == ExecutionModel::MeshEXT as u32);
    let (index, mesh) = match (mesh, entries.first()) {
        (Some(found), _) => *found,
        (None, Some((_, other))) => {
            let name = other.string_at(2).map(|(s, _)| s).unwrap_or_default();
            return Err(LowerErrorKind::NotMeshShader {
                entry: name,
                model: other.operands[0],
            });
        }
        (None, None) => return Err(LowerErrorKind::MissingEntryPoint),
    };

    let function = mesh.operands[1];
    let (name, rest) = mesh
        .string_at(2)
        .ok_or_else(|| SpirvError::UnterminatedString {
            offset: code.word_offset(index),
        })?;
    let mut entry = EntryPoint {
        function,
        name,
        interface: mesh.operands[rest..].to_vec(),
        local_size: [1, 1, 1],
        max_vertices: 0,
        max_primitives: 0,
    };

    let mut triangles = false;
    let mut local_size_seen = false;
    for inst in code.instructions() {
        let is_mode = inst.is(Op::ExecutionMode) || inst.is(Op::ExecutionModeId);
        if !is_mode || inst.operands[0] != function {
            continue;
        }
        let mode = inst.operands[1];
        let lits = &inst.operands[2..];
        if mode == ExecutionMode::LocalSize as u32 {
            entry.local_size = [lits[0], lits[1], lits[2]];
            local_size_seen = true;
        } else if mode == ExecutionMode::LocalSizeId as u32 {
            for (axis, id) in lits.iter().enumerate().take(3) {
                entry.local_size[axis] = code.constant_value(*id).ok_or_else(|| {
                    LowerErrorKind::Unsupported("LocalSizeId with a non-constant operand".into())
                })?;
            }
            local_size_seen = true;
        } else if mode == ExecutionMode::OutputVertices as u32 {
            entry.max_vertices = lits[0];
        } else if mode == ExecutionMode::OutputPrimitivesEXT as u32 {
            entry.max_primitives = lits[0];
        } else if mode == ExecutionMode::OutputTrianglesEXT as u32 {
            triangles = true;
        } else if mode == ExecutionMode::OutputLinesEXT as u32 || mode == ExecutionMode::OutputPoints as u32 {
            return Err(LowerErrorKind::UnsupportedTopology);
        }
    }
    if !triangles {
        return Err(LowerErrorKind::UnsupportedTopology);
    }
    if !local_size_seen {
        log::warn!("entry `{}` declares no workgroup size, assuming 1x1x1", entry.name);
    }

    let mut builtins = Builtins::default();
    for inst in code.instructions() {
        if !inst.is(Op::Variable) {
            continue;
        }
        let var = inst.operands[1];
        let storage = inst.operands[2];
        match decorations.builtin(var) {
            Some(b) if b == BuiltIn::NumWorkgroups as u32 => builtins.num_workgroups = Some(var),
            Some(b) if b == BuiltIn::WorkgroupSize as u32 => builtins.workgroup_size = Some(var),
            Some(b) if b == BuiltIn::WorkgroupId as u32 => builtins.workgroup_id = Some(var),
            Some(b) if b == BuiltIn::LocalInvocationId as u32 => builtins.local_invocation_id = Some(var),
            Some(b) if b == BuiltIn::LocalInvocationIndex as u32 => {
                builtins.local_invocation_index = Some(var)
            }
            Some(b) if b == BuiltIn::PrimitiveTriangleIndicesEXT as u32 => {
                builtins.primitive_indices = Some(var)
            }
            Some(b)
                if b == BuiltIn::PrimitiveLineIndicesEXT as u32
                    || b == BuiltIn::PrimitivePointIndicesEXT as u32 =>
            {
                return Err(LowerErrorKind::UnsupportedTopology)
            }
            _ if storage == StorageClass::Output as u32 => {
                let block = pointee(code, inst.operands[0])
                    .and_then(|arr| code.find_def(arr))
                    .filter(|decl| decl.is(Op::TypeArray))
                    .map(|decl| decl.operands[1]);
                let is_per_vertex = block.is_some_and(|s| {
                    decorations.members.iter().any(|((t, _), list)| {
                        *t == s
                            && list.iter().any(|d| {
                                d[0] == Decoration::BuiltIn as u32 && is_per_vertex_builtin(d[1])
                            })
                    })
                });
                if is_per_vertex {
                    builtins.per_vertex = Some(var);
                }
            }
            _ => {}
        }
    }
    // WorkgroupSize may also decorate a constant rather than a variable.
    if builtins.workgroup_size.is_none() {
        builtins.workgroup_size = decorations
            .targets
            .iter()
            .find(|(_, list)| {
                list.iter().any(|d| {
                    d[0] == Decoration::BuiltIn as u32 && d[1] == BuiltIn::WorkgroupSize as u32
                })
            })
            .map(|(target, _)| *target);
    }

    Ok((entry, builtins))
}

fn check_leaf(code: &MutableBytecode, var: u32, leaf: u32) -> Result<(), LowerErrorKind> {
    let decl = code
        .find_def(leaf)
        .ok_or_else(|| LowerErrorKind::Unsupported(format!("type %{leaf} has no declaration")))?;
    let is_word = (decl.is(Op::TypeInt) || decl.is(Op::TypeFloat)) && decl.operands[1] == 32;
    if is_word {
        Ok(())
    } else {
        Err(LowerErrorKind::Unsupported(format!(
            "output %{var} has a component that is not a 32-bit int or float"
        )))
    }
}

/// Enumerate every module-scope output except the index buffer, assigning
/// consecutive word ranges in declaration order. Returns the varyings and
/// the total words per vertex.
pub fn traverse_varyings(
    code: &MutableBytecode,
    builtins: &Builtins,
) -> Result<(Vec<Varying>, u32), LowerErrorKind> {
    let decorations = Decorations::collect(code);
    let mut varyings = Vec::new();
    let mut write_offset = 0;

    let outputs = code.instructions().iter().filter(|inst| {
        inst.is(Op::Variable)
            && inst.operands[2] == StorageClass::Output as u32
            && Some(inst.operands[1]) != builtins.primitive_indices
    });
    for inst in outputs {
        let var = inst.operands[1];
        let pointer_type = inst.operands[0];
        let array = pointee(code, pointer_type)
            .and_then(|id| code.find_def(id))
            .filter(|decl| decl.is(Op::TypeArray))
            .ok_or_else(|| LowerErrorKind::Unsupported(format!("output %{var} is not arrayed per vertex")))?;
        let element_type = array.operands[1];

        let per_primitive = decorations.has(var, Decoration::PerPrimitiveEXT)
            || decorations.any_member(element_type, Decoration::PerPrimitiveEXT);
        if per_primitive {
            return Err(LowerErrorKind::Unsupported(format!(
                "per-primitive output %{var}"
            )));
        }

        let mut leaves = Vec::new();
        code.traverse_type(element_type, TraverseOrder::Leaves, |node| leaves.push(node.type_id));
        for leaf in &leaves {
            check_leaf(code, var, *leaf)?;
        }
        let leaf_count = leaves.len() as u32;

        log::trace!("varying %{var}: {leaf_count} words at offset {write_offset}");
        varyings.push(Varying {
            variable: var,
            pointer_type,
            element_type,
            location: decorations.get(var, Decoration::Location).map(|l| l[0]),
            write_offset,
            leaf_count,
        });
        write_offset += leaf_count;
    }

    Ok((varyings, write_offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spirv::Section;

    #[test]
    fn unterminated_entry_name_is_a_decode_error() {
        let mut code = MutableBytecode::empty(crate::spirv::version(1, 4), 0);
        code.op_capability(spirv::Capability::MeshShadingEXT);
        let at = code.find_section(Section::EntryPoint);
        let name = u32::from_le_bytes(*b"main");
        code.insert(at, Op::EntryPoint, &[ExecutionModel::MeshEXT as u32, 7, name]);

        let err = analyze_builtins(&code).unwrap_err();
        // One Capability instruction (2 words) after the header.
        assert_eq!(err, LowerErrorKind::Spirv(SpirvError::UnterminatedString { offset: 7 }));
    }
}
