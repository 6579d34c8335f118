// Runtime values of the reference executor
//
// Scalars are raw 32-bit words regardless of their SPIR-V type; floats are
// reinterpreted at the operations that need them.

use super::SimError;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Word(u32),
    Bool(bool),
    Composite(Vec<Value>),
    Pointer(Pointer),
    Undef,
}

/// Where logical (non-buffer) memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// Workgroup storage, shared by every invocation of a workgroup.
    Shared,
    /// Input, Output, Private and Function storage of one invocation.
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pointer {
    /// Byte offset into a bound storage buffer.
    Buffer { binding: (u32, u32), offset: u32, ty: u32 },
    /// Path into a variable's value tree.
    Logical { space: Space, root: u32, path: Vec<u32>, ty: u32 },
}

impl Pointer {
    pub fn ty(&self) -> u32 {
        match self {
            Pointer::Buffer { ty, .. } | Pointer::Logical { ty, .. } => *ty,
        }
    }
}

impl Value {
    pub fn word(&self) -> Result<u32, SimError> {
        match self {
            Value::Word(w) => Ok(*w),
            Value::Bool(b) => Ok(u32::from(*b)),
            Value::Undef => Ok(0),
            other => Err(SimError::TypeMismatch(format!("expected a scalar, found {other:?}"))),
        }
    }

    pub fn float(&self) -> Result<f32, SimError> {
        self.word().map(f32::from_bits)
    }

    pub fn boolean(&self) -> Result<bool, SimError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(SimError::TypeMismatch(format!("expected a bool, found {other:?}"))),
        }
    }

    pub fn pointer(&self) -> Result<&Pointer, SimError> {
        match self {
            Value::Pointer(p) => Ok(p),
            other => Err(SimError::TypeMismatch(format!("expected a pointer, found {other:?}"))),
        }
    }

    pub fn parts(&self) -> Result<&[Value], SimError> {
        match self {
            Value::Composite(parts) => Ok(parts),
            other => Err(SimError::TypeMismatch(format!("expected a composite, found {other:?}"))),
        }
    }

    /// Follow literal indices into a composite.
    pub fn at(&self, path: &[u32]) -> Result<&Value, SimError> {
        path.iter().try_fold(self, |v, i| {
            v.parts()?.get(*i as usize).ok_or(SimError::OutOfBounds { index: *i, ty: 0 })
        })
    }

    pub fn at_mut(&mut self, path: &[u32]) -> Result<&mut Value, SimError> {
        let mut v = self;
        for i in path {
            v = match v {
                Value::Composite(parts) => parts
                    .get_mut(*i as usize)
                    .ok_or(SimError::OutOfBounds { index: *i, ty: 0 })?,
                other => {
                    return Err(SimError::TypeMismatch(format!("cannot index into {other:?}")))
                }
            };
        }
        Ok(v)
    }

    /// Apply `f` to each scalar, component-wise over composites.
    pub fn map(&self, f: &mut impl FnMut(&Value) -> Result<Value, SimError>) -> Result<Value, SimError> {
        match self {
            Value::Composite(parts) => Ok(Value::Composite(
                parts.iter().map(|p| p.map(&mut *f)).collect::<Result<_, _>>()?,
            )),
            scalar => f(scalar),
        }
    }

    /// Apply `f` pairwise, component-wise over composites of equal shape.
    pub fn zip(
        &self,
        other: &Value,
        f: &mut impl FnMut(&Value, &Value) -> Result<Value, SimError>,
    ) -> Result<Value, SimError> {
        match (self, other) {
            (Value::Composite(a), Value::Composite(b)) if a.len() == b.len() => Ok(Value::Composite(
                a.iter().zip(b).map(|(x, y)| x.zip(y, &mut *f)).collect::<Result<_, _>>()?,
            )),
            (Value::Composite(_), _) | (_, Value::Composite(_)) => Err(SimError::TypeMismatch(
                "component-wise operands differ in shape".into(),
            )),
            (a, b) => f(a, b),
        }
    }
}
