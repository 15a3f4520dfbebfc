//! Mapping between global L-vectors and element-local E-vectors.
//!
//! An E-vector stores the values of every element separately, so nodes shared by several
//! elements are duplicated. Unblocked E-vectors are laid out `[comp][elem][node]`, blocked
//! E-vectors `[block][comp][node][elem-in-block]`, with the entries of padding elements in
//! the last block reading as zero.
//!
//! Offset tables refer to nodes, and `lmode` selects how the components of a node are laid
//! out in the L-vector: [`TransposeMode::Transpose`] means interlaced (`node * C + comp`),
//! [`TransposeMode::NoTranspose`] component-major (`node + comp * L / C`). Strided
//! restrictions ignore `lmode`.
use std::fmt;
use std::fmt::{Debug, Formatter};

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::error::{ensure_config, ensure_usage};
use crate::vector::Vector;
use crate::workspace::Workspace;
use crate::{Backend, Error, Result, Scalar, TransposeMode};

/// Location of the L-vector entries an element restriction refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestrictionLayout {
    /// Node index of every element node, `E * P` entries.
    Offsets(Vec<usize>),
    /// Strides `(node, comp, elem)` into the L-vector.
    Strided([usize; 3]),
}

pub struct ElemRestriction {
    backend: Backend,
    num_elem: usize,
    elem_size: usize,
    num_comp: usize,
    l_size: usize,
    block_size: usize,
    layout: RestrictionLayout,
    pub(crate) data: Mutex<Workspace>,
}

impl Debug for ElemRestriction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElemRestriction")
            .field("num_elem", &self.num_elem)
            .field("elem_size", &self.elem_size)
            .field("num_comp", &self.num_comp)
            .field("l_size", &self.l_size)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl ElemRestriction {
    pub(crate) fn new(
        backend: Backend,
        num_elem: usize,
        elem_size: usize,
        block_size: usize,
        num_comp: usize,
        l_size: usize,
        layout: RestrictionLayout,
    ) -> Result<Self> {
        ensure_config!(elem_size > 0, "element size must be positive");
        ensure_config!(num_comp > 0, "number of components must be positive");
        ensure_config!(block_size > 0, "block size must be positive");

        match &layout {
            RestrictionLayout::Offsets(offsets) => {
                ensure_config!(
                    offsets.len() == num_elem * elem_size,
                    "expected {} offsets for {} elements of size {}, got {}",
                    num_elem * elem_size,
                    num_elem,
                    elem_size,
                    offsets.len()
                );
                ensure_config!(
                    l_size % num_comp == 0,
                    "L-vector size {} is not divisible by the number of components {}",
                    l_size,
                    num_comp
                );
                let num_nodes = l_size / num_comp;
                if let Some((idx, offset)) = offsets.iter().enumerate().find(|(_, &o)| o >= num_nodes) {
                    return Err(Error::configuration(format!(
                        "offset {offset} at position {idx} is out of range for {num_nodes} nodes"
                    )));
                }
            }
            RestrictionLayout::Strided([s_node, s_comp, s_elem]) => {
                if num_elem > 0 {
                    let max_index = (elem_size - 1) * s_node + (num_comp - 1) * s_comp + (num_elem - 1) * s_elem;
                    ensure_config!(
                        max_index < l_size,
                        "strides ({}, {}, {}) reach index {}, but the L-vector has size {}",
                        s_node,
                        s_comp,
                        s_elem,
                        max_index,
                        l_size
                    );
                }
            }
        }

        log::debug!(
            "Created element restriction with {} elements of size {}, {} components, L-size {}, block size {}",
            num_elem,
            elem_size,
            num_comp,
            l_size,
            block_size
        );

        Ok(Self {
            backend,
            num_elem,
            elem_size,
            num_comp,
            l_size,
            block_size,
            layout,
            data: Mutex::new(Workspace::default()),
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn num_elements(&self) -> usize {
        self.num_elem
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn num_components(&self) -> usize {
        self.num_comp
    }

    pub fn l_size(&self) -> usize {
        self.l_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        (self.num_elem + self.block_size - 1) / self.block_size
    }

    /// Size of the E-vector, including the padding of the last block.
    pub fn e_size(&self) -> usize {
        self.num_blocks() * self.block_size * self.elem_size * self.num_comp
    }

    pub fn layout(&self) -> &RestrictionLayout {
        &self.layout
    }

    /// Strides `(node, comp, elem)` of the E-vector.
    ///
    /// Blocked E-vectors cannot be described by strides, so this is an error for them.
    pub fn e_layout(&self) -> Result<[usize; 3]> {
        ensure_usage!(
            self.block_size == 1,
            "blocked element restrictions have no strided E-layout"
        );
        Ok([1, self.num_elem * self.elem_size, self.elem_size])
    }

    pub fn create_lvector<'a>(&self) -> Result<Vector<'a>> {
        self.backend.vector(self.l_size)
    }

    pub fn create_evector<'a>(&self) -> Result<Vector<'a>> {
        self.backend.vector(self.e_size())
    }

    /// Restricts `u` to elements (`NoTranspose`, overwriting `v`) or adds the element
    /// contributions in `u` into `v` (`Transpose`).
    pub fn apply(&self, tmode: TransposeMode, lmode: TransposeMode, u: &Vector, v: &Vector) -> Result<()> {
        let (u_len, v_len) = match tmode {
            TransposeMode::NoTranspose => (self.l_size, self.e_size()),
            TransposeMode::Transpose => (self.e_size(), self.l_size),
        };
        self.check_lengths(u, v, u_len, v_len)?;
        self.backend
            .methods()
            .restriction_apply
            .apply(self, tmode, lmode, u, v)
    }

    /// Like [`apply`](Self::apply), for the single block `block` of a blocked restriction.
    ///
    /// The E-vector holds `block_size * elem_size * num_comp` entries.
    pub fn apply_block(
        &self,
        block: usize,
        tmode: TransposeMode,
        lmode: TransposeMode,
        u: &Vector,
        v: &Vector,
    ) -> Result<()> {
        ensure_usage!(
            block < self.num_blocks(),
            "block {} is out of range for {} blocks",
            block,
            self.num_blocks()
        );
        let block_len = self.block_size * self.elem_size * self.num_comp;
        match tmode {
            TransposeMode::NoTranspose => {
                self.check_lengths(u, v, self.l_size, block_len)?;
                let u = u.view()?;
                let mut v = v.view_mut()?;
                self.gather_block(block, self.block_size, lmode, &u, &mut v);
            }
            TransposeMode::Transpose => {
                self.check_lengths(u, v, block_len, self.l_size)?;
                let u = u.view()?;
                let mut v = v.view_mut()?;
                self.scatter_add_block(block, self.block_size, lmode, &u, &mut v);
            }
        }
        Ok(())
    }

    /// Number of elements each L-vector entry belongs to, written to `mult`.
    pub fn multiplicity(&self, lmode: TransposeMode, mult: &Vector) -> Result<()> {
        let ones = self.create_evector()?;
        ones.set_value(1.0)?;
        mult.set_value(0.0)?;
        self.apply(TransposeMode::Transpose, lmode, &ones, mult)
    }

    fn check_lengths(&self, u: &Vector, v: &Vector, u_len: usize, v_len: usize) -> Result<()> {
        ensure_usage!(
            u.length() == u_len,
            "input vector has length {}, expected {}",
            u.length(),
            u_len
        );
        ensure_usage!(
            v.length() == v_len,
            "output vector has length {}, expected {}",
            v.length(),
            v_len
        );
        Ok(())
    }

    /// L-vector index of component `comp` of node `node` of element `elem`.
    pub(crate) fn node_index(&self, elem: usize, comp: usize, node: usize, lmode: TransposeMode) -> usize {
        match &self.layout {
            RestrictionLayout::Offsets(offsets) => {
                let offset = offsets[elem * self.elem_size + node];
                match lmode {
                    TransposeMode::Transpose => offset * self.num_comp + comp,
                    TransposeMode::NoTranspose => offset + comp * (self.l_size / self.num_comp),
                }
            }
            RestrictionLayout::Strided([s_node, s_comp, s_elem]) => node * s_node + comp * s_comp + elem * s_elem,
        }
    }

    /// L-vector index of E-vector entry `i`, `None` for padding entries.
    pub(crate) fn l_index(&self, i: usize, lmode: TransposeMode) -> Option<usize> {
        let (p, e) = (self.elem_size, self.num_elem);
        if self.block_size == 1 {
            let comp = i / (e * p);
            let elem = (i % (e * p)) / p;
            let node = i % p;
            Some(self.node_index(elem, comp, node, lmode))
        } else {
            let (elem, comp, node) = decode_blocked(i, self.block_size, p, self.num_comp);
            (elem < e).then(|| self.node_index(elem, comp, node, lmode))
        }
    }

    /// Table of [`l_index`](Self::l_index) for every E-vector entry, with `u64::MAX` marking
    /// padding.
    pub(crate) fn gather_indices(&self, lmode: TransposeMode) -> Vec<u64> {
        (0..self.e_size())
            .map(|i| self.l_index(i, lmode).map_or(u64::MAX, |l| l as u64))
            .collect()
    }

    pub(crate) fn gather(&self, lmode: TransposeMode, u: &[Scalar], v: &mut [Scalar]) {
        v.par_iter_mut()
            .enumerate()
            .for_each(|(i, v_i)| *v_i = self.l_index(i, lmode).map_or(0.0, |l| u[l]));
    }

    pub(crate) fn scatter_add(&self, lmode: TransposeMode, u: &[Scalar], v: &mut [Scalar]) {
        for (i, u_i) in u.iter().enumerate() {
            if let Some(l) = self.l_index(i, lmode) {
                v[l] += u_i;
            }
        }
    }

    /// Gathers the elements of block `block` for an element block size of `b` into `v`,
    /// laid out `[comp][node][elem-in-block]`.
    pub(crate) fn gather_block(&self, block: usize, b: usize, lmode: TransposeMode, u: &[Scalar], v: &mut [Scalar]) {
        let p = self.elem_size;
        for (i, v_i) in v.iter_mut().enumerate() {
            let (k, node, comp) = (i % b, (i / b) % p, i / (b * p));
            let elem = block * b + k;
            *v_i = if elem < self.num_elem {
                u[self.node_index(elem, comp, node, lmode)]
            } else {
                0.0
            };
        }
    }

    /// Transpose of [`gather_block`](Self::gather_block), adding into `v`.
    pub(crate) fn scatter_add_block(
        &self,
        block: usize,
        b: usize,
        lmode: TransposeMode,
        u: &[Scalar],
        v: &mut [Scalar],
    ) {
        let p = self.elem_size;
        for (i, u_i) in u.iter().enumerate() {
            let (k, node, comp) = (i % b, (i / b) % p, i / (b * p));
            let elem = block * b + k;
            if elem < self.num_elem {
                v[self.node_index(elem, comp, node, lmode)] += u_i;
            }
        }
    }
}

/// Decodes a blocked E-vector index into `(elem, comp, node)`.
fn decode_blocked(i: usize, block_size: usize, elem_size: usize, num_comp: usize) -> (usize, usize, usize) {
    let k = i % block_size;
    let rest = i / block_size;
    let node = rest % elem_size;
    let rest = rest / elem_size;
    let comp = rest % num_comp;
    let block = rest / num_comp;
    (block * block_size + k, comp, node)
}

/// Converts per-element closure indices of an interlaced mesh numbering into node offsets.
///
/// `closure` holds `num_comp` consecutive entries for every node of every element, so
/// `num_elem * elem_size * num_comp` entries in total. Constrained entries are encoded as
/// `-(loc + 1)`. The components of a node must occupy consecutive locations starting at a
/// multiple of `num_comp`, otherwise the numbering cannot be expressed with node offsets.
pub fn offsets_from_interlaced_closure(
    closure: &[isize],
    num_elem: usize,
    elem_size: usize,
    num_comp: usize,
) -> Result<Vec<usize>> {
    ensure_config!(num_comp > 0, "number of components must be positive");
    ensure_config!(
        closure.len() == num_elem * elem_size * num_comp,
        "closure of length {} does not describe {} elements with {} nodes of {} components",
        closure.len(),
        num_elem,
        elem_size,
        num_comp
    );
    let decode = |entry: isize| if entry < 0 { (-(entry + 1)) as usize } else { entry as usize };

    closure
        .chunks_exact(num_comp)
        .enumerate()
        .map(|(node, entries)| {
            let first = decode(entries[0]);
            let interlaced = first % num_comp == 0
                && entries
                    .iter()
                    .enumerate()
                    .all(|(comp, &entry)| decode(entry) == first + comp);
            ensure_config!(
                interlaced,
                "closure of element {} node {} is not interlaced: {:?}",
                node / elem_size,
                node % elem_size,
                entries
            );
            Ok(first / num_comp)
        })
        .collect()
}
