use anyhow::Result;
use lowbit_quant::{ElementType, QK};

use crate::arena::Span;

/// Index of a tensor inside a graph.
pub type TensorId = usize;

/// Shape and strides of an up-to-4-D tensor.
///
/// `ne` holds extents innermost first, `nb` byte strides. Unused trailing
/// dimensions have extent 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub ty: ElementType,
    pub ne: [usize; 4],
    pub nb: [usize; 4],
}

impl Layout {
    /// Densely packed layout. Packed weights have no addressable strides, their `nb` is zero.
    pub fn contiguous(ty: ElementType, dims: &[usize]) -> Self {
        debug_assert!(!dims.is_empty() && dims.len() <= 4);
        let mut ne = [1usize; 4];
        ne[..dims.len()].copy_from_slice(dims);

        let mut nb = [0usize; 4];
        if let Some(row_bytes) = row_bytes(ty, ne[0]) {
            nb[0] = element_stride(ty);
            nb[1] = row_bytes;
            nb[2] = nb[1] * ne[1];
            nb[3] = nb[2] * ne[2];
        }
        Self { ty, ne, nb }
    }

    pub fn f32(dims: &[usize]) -> Self {
        Self::contiguous(ElementType::F32, dims)
    }

    pub fn n_elements(&self) -> usize {
        self.ne.iter().product()
    }

    /// Number of rows of length `ne[0]`.
    pub fn n_rows(&self) -> usize {
        self.ne[1] * self.ne[2] * self.ne[3]
    }

    pub fn n_dims(&self) -> usize {
        self.ne.iter().rposition(|&n| n > 1).map_or(1, |i| i + 1)
    }

    pub fn is_contiguous(&self) -> bool {
        *self == Self::contiguous(self.ty, &self.ne)
    }

    /// Bytes spanned from the first to one past the last element.
    pub fn extent_bytes(&self) -> usize {
        if self.n_elements() == 0 {
            return 0;
        }
        element_stride(self.ty) + (0..4).map(|i| (self.ne[i] - 1) * self.nb[i]).sum::<usize>()
    }

    /// Byte offset of element `(i0, i1, i2, i3)`.
    #[inline]
    pub fn offset_of(&self, idx: [usize; 4]) -> usize {
        idx[0] * self.nb[0] + idx[1] * self.nb[1] + idx[2] * self.nb[2] + idx[3] * self.nb[3]
    }
}

fn element_stride(ty: ElementType) -> usize {
    match ty {
        ElementType::F32 | ElementType::I32 => 4,
        ElementType::F16 | ElementType::I16 => 2,
        ElementType::I8 | ElementType::Packed => 1,
        other => other.payload_size(QK).unwrap_or(1),
    }
}

fn row_bytes(ty: ElementType, ne0: usize) -> Option<usize> {
    match ty {
        ElementType::Packed => None,
        ty if ty.block_format().is_some() || ty == ElementType::Q8_1 => ty.payload_size(ne0),
        ty => Some(element_stride(ty) * ne0),
    }
}

/// Where a graph tensor's data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Owned by a span of the arena.
    Arena(Span),
    /// Aliases another tensor, starting `offset` bytes into it.
    View { base: TensorId, offset: usize },
}

/// Ownership tag of a tensor's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Arena,
    Mapped,
    Owned,
    View,
}

/// A named f32 tensor of the compute graph.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub name: String,
    pub layout: Layout,
    pub storage: Storage,
}

impl Tensor {
    pub fn ownership(&self) -> Ownership {
        match self.storage {
            Storage::Arena(_) => Ownership::Arena,
            Storage::View { .. } => Ownership::View,
        }
    }

    pub fn ne(&self) -> [usize; 4] {
        self.layout.ne
    }
}

/// Resolved location of a tensor: the arena span holding it and the first f32 slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub span: Span,
    pub start: usize,
}

/// Follows views down to the arena span that owns the data.
pub fn resolve(tensors: &[Tensor], id: TensorId) -> Result<Resolved> {
    let mut current = id;
    let mut offset = 0usize;
    loop {
        let tensor = tensors.get(current).ok_or_else(|| anyhow::anyhow!("Unknown tensor id {current}"))?;
        match tensor.storage {
            Storage::Arena(span) => {
                if offset % 4 != 0 {
                    anyhow::bail!("Tensor '{}' is not aligned to its element size", tensors[id].name);
                }
                return Ok(Resolved { span, start: offset / 4 });
            }
            Storage::View { base, offset: view_offset } => {
                if base >= current {
                    anyhow::bail!("View '{}' refers to a later tensor", tensor.name);
                }
                offset += view_offset;
                current = base;
            }
        }
    }
}

/// Checks that a view of `layout` starting `offset` bytes into `base` stays inside it.
pub fn check_view_bounds(base: &Tensor, layout: &Layout, offset: usize) -> Result<()> {
    let available = base.layout.extent_bytes();
    let needed = offset + layout.extent_bytes();
    if needed > available {
        anyhow::bail!("View of '{}' needs {needed} bytes but the tensor spans {available}", base.name);
    }
    Ok(())
}
