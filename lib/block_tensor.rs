//! Tensors that store only charge-conserving elements.
//!
//! A [`BlockSparseTensor`] is described by a list of [`Index`]es, one per leg.
//! An element at dense position (*i*<sub>1</sub>, ..., *i*<sub>N</sub>) is
//! allowed to be nonzero only if the flow-weighted charges selected by each
//! *i*<sub>*k*</sub> sum to the tensor's total charge (usually zero):
//!
//! <blockquote>
//!   <p style="font-size:20px">
//!     Σ<sub><i>k</i></sub> <i>f</i><sub><i>k</i></sub>
//!     <i>q</i><sub><i>k</i></sub>(<i>i</i><sub><i>k</i></sub>) = <i>Q</i>
//!   </p>
//! </blockquote>
//!
//! All other elements are exact zeros and are never stored.
//!
//! Stored elements are kept in a flat buffer, in row-major order of their
//! dense positions. Row-major order over a tensor's elementary legs is the same
//! no matter how neighboring legs are grouped together, so merging or
//! splitting legs with [`BlockSparseTensor::reshape`] only rewrites the
//! indices and never touches the stored data.
//!
//! Viewed as a matrix with some leading legs fused into rows and the rest into
//! columns, the stored elements fall into dense blocks, one per row charge;
//! these are available through [`BlockSparseTensor::blocks`].
//!
//! ```
//! use rand::{ SeedableRng, rngs::StdRng };
//! use block_tensor_net::block_tensor::BlockSparseTensor;
//! use block_tensor_net::index::{ Flow, Index };
//!
//! let mut rng = StdRng::seed_from_u64(0);
//! let row = Index::new(vec![0, 0, 1, 2], Flow::In).unwrap();
//! let col = Index::new(vec![1, 0, 2], Flow::Out).unwrap();
//! let t: BlockSparseTensor<f64>
//!     = BlockSparseTensor::randn([row, col], &mut rng).unwrap();
//!
//! // charge 0: rows {0, 1} x col {1}; charge 1: row {2} x col {0};
//! // charge 2: row {3} x col {2}
//! assert_eq!(t.num_nonzero(), 4);
//! let blocks = t.blocks(1).unwrap();
//! let charges: Vec<i64> = blocks.iter().map(|b| b.charge).collect();
//! assert_eq!(charges, vec![0, 1, 2]);
//! assert_eq!(blocks[0].data.dim(), (2, 1));
//! ```

use std::{ collections::BTreeMap, fmt };
use ndarray as nd;
use num_traits::{ Float, Zero };
use rand::Rng;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;
use crate::{
    Elem,
    index::{ Index, Leg, fused_effective_charges },
};

#[derive(Debug, Error)]
pub enum ConstructionError {
    /// Returned when attempting to create an index with no charges.
    #[error("error in index creation: charges must be nonempty")]
    EmptyCharges,

    /// Returned when converting an integer other than ±1 to a flow.
    #[error("error in index creation: invalid flow {0}; must be +1 or -1")]
    InvalidFlow(i32),

    /// Returned when attempting to create a tensor with no indices.
    #[error("error in tensor creation: at least one index is required")]
    NoIndices,

    /// Returned when attempting to create a tensor from a dense array whose
    /// shape does not match the provided indices.
    #[error("error in tensor creation: array shape {found:?} does not match indices {expected:?}")]
    ShapeMismatch { expected: Vec<usize>, found: Vec<usize> },

    /// Returned when attempting to create a tensor from a dense array holding a
    /// nonzero element that violates charge conservation.
    #[error("error in tensor creation: nonzero element at {0:?} violates charge conservation")]
    ChargeViolation(Vec<usize>),
}

#[derive(Debug, Error)]
pub enum ShapeError {
    /// Returned when a reshape target has a different total number of
    /// elements. A count that overflows `usize` is reported as `usize::MAX`.
    #[error("error in reshape: cannot reshape {expected} elements into {found}")]
    ElementCount { expected: usize, found: usize },

    /// Returned when a dense reshape target cannot be formed by grouping
    /// neighboring legs of the tensor.
    #[error("error in reshape: target shape cannot be formed by grouping neighboring legs")]
    Ungroupable,

    /// Returned when a sparse reshape target is built from legs that differ
    /// from those of the tensor.
    #[error("error in reshape: target indices have incompatible charges")]
    IncompatibleCharges,

    /// Returned when a matrix view is requested with more row legs than the
    /// tensor has.
    #[error("error in block view: cannot take {nrow} row legs from a rank-{rank} tensor")]
    BadSplit { nrow: usize, rank: usize },
}

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("{0}")]
    Construction(#[from] ConstructionError),

    #[error("{0}")]
    Shape(#[from] ShapeError),
}
pub type BlockResult<T> = Result<T, BlockError>;

/// Target shape for [`BlockSparseTensor::reshape`].
///
/// Plain dimension lists convert to `Dense`; lists of indices convert to
/// `Sparse`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Shape {
    /// Dense dimensions for each new leg.
    Dense(Vec<usize>),
    /// Full index descriptions for each new leg.
    Sparse(Vec<Index>),
}

impl Shape {
    /// Return the dense dimensions described by `self`.
    pub fn dims(&self) -> Vec<usize> {
        match self {
            Self::Dense(dims) => dims.clone(),
            Self::Sparse(idxs) => idxs.iter().map(Index::dim).collect(),
        }
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self { Self::Dense(dims) }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self { Self::Dense(dims.to_vec()) }
}

impl From<&Vec<usize>> for Shape {
    fn from(dims: &Vec<usize>) -> Self { Self::Dense(dims.clone()) }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self { Self::Dense(dims.to_vec()) }
}

impl From<Vec<Index>> for Shape {
    fn from(idxs: Vec<Index>) -> Self { Self::Sparse(idxs) }
}

impl From<&[Index]> for Shape {
    fn from(idxs: &[Index]) -> Self { Self::Sparse(idxs.to_vec()) }
}

impl From<&Vec<Index>> for Shape {
    fn from(idxs: &Vec<Index>) -> Self { Self::Sparse(idxs.clone()) }
}

/// A single charge sector of a block-sparse tensor viewed as a matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct Block<A> {
    /// Effective charge shared by all rows of the block.
    pub charge: i64,
    /// Positions of the block's rows along the fused row legs.
    pub rows: Vec<usize>,
    /// Positions of the block's columns along the fused column legs.
    pub cols: Vec<usize>,
    /// Block elements.
    pub data: nd::Array2<A>,
}

// bookkeeping for a row/column split of a run of elementary legs: for every
// row, the sorted column positions completing it to the total charge
struct Sectors {
    row_charges: Vec<i64>,
    ncols: usize,
    cols_by_charge: HashMap<i64, Vec<usize>>,
}

impl Sectors {
    fn new(row_legs: &[Leg], col_legs: &[Leg]) -> Self {
        let row_charges = fused_effective_charges(row_legs);
        let col_charges = fused_effective_charges(col_legs);
        let ncols = col_charges.len();
        let mut cols_by_charge: HashMap<i64, Vec<usize>> = HashMap::default();
        col_charges.into_iter()
            .enumerate()
            .for_each(|(j, q)| { cols_by_charge.entry(q).or_default().push(j); });
        Self { row_charges, ncols, cols_by_charge }
    }

    // columns allowed for a row of charge `q`
    fn cols_for(&self, q: i64, total_charge: i64) -> &[usize] {
        self.cols_by_charge.get(&(total_charge - q))
            .map(|cols| cols.as_slice())
            .unwrap_or(&[])
    }

    fn positions(&self, total_charge: i64) -> Vec<usize> {
        let mut positions: Vec<usize> = Vec::new();
        for (i, q) in self.row_charges.iter().enumerate() {
            positions.extend(
                self.cols_for(*q, total_charge).iter().map(|j| i * self.ncols + j));
        }
        positions
    }
}

// split a run of legs where the row dimension first reaches the square root of
// the total dimension, so that both halves stay small
fn square_split(legs: &[Leg]) -> usize {
    let total: usize = legs.iter().map(Leg::dim).product();
    let side: usize = (total as f64).sqrt().round() as usize;
    legs.iter()
        .scan(1, |acc, leg| { *acc *= leg.dim(); Some(*acc) })
        .position(|rowdim| rowdim >= side)
        .map(|k| k + 1)
        .unwrap_or(legs.len())
}

// row-major linear positions of all charge-conserving elements, ascending
fn nonzero_positions_of(legs: &[Leg], total_charge: i64) -> Vec<usize> {
    let (row, col) = legs.split_at(square_split(legs));
    Sectors::new(row, col).positions(total_charge)
}

// total number of dense elements, or `None` on overflow
fn checked_size<'a, I>(dims: I) -> Option<usize>
where I: IntoIterator<Item = &'a usize>
{
    dims.into_iter().try_fold(1_usize, |acc, d| acc.checked_mul(*d))
}

fn elementary_legs(indices: &[Index]) -> Vec<Leg> {
    indices.iter().flat_map(|idx| idx.legs().iter().cloned()).collect()
}

fn unravel(mut p: usize, shape: &[usize], out: &mut [usize]) {
    for (k, d) in out.iter_mut().zip(shape).rev() {
        *k = p % d;
        p /= d;
    }
}

fn ravel(idx: &[usize], shape: &[usize]) -> usize {
    idx.iter().zip(shape).fold(0, |acc, (k, d)| acc * d + k)
}

/// A tensor storing only the elements allowed by charge conservation.
///
/// See the [module-level documentation][self] for details.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockSparseTensor<A> {
    indices: Vec<Index>,
    data: nd::Array1<A>,
    total_charge: i64,
}

impl<A> BlockSparseTensor<A> {
    fn check_indices<I>(indices: I) -> BlockResult<Vec<Index>>
    where I: IntoIterator<Item = Index>
    {
        let indices: Vec<Index> = indices.into_iter().collect();
        if indices.is_empty() {
            return Err(ConstructionError::NoIndices.into());
        }
        Ok(indices)
    }

    /// Create a new tensor by calling `elems` on the dense multi-index of every
    /// stored element.
    ///
    /// Elements are visited in row-major order.
    pub fn from_fn<I, F>(indices: I, total_charge: i64, mut elems: F)
        -> BlockResult<Self>
    where
        I: IntoIterator<Item = Index>,
        F: FnMut(&[usize]) -> A,
    {
        let indices = Self::check_indices(indices)?;
        let shape: Vec<usize> = indices.iter().map(Index::dim).collect();
        let positions = nonzero_positions_of(&elementary_legs(&indices), total_charge);
        let mut idx: Vec<usize> = vec![0; shape.len()];
        let data: nd::Array1<A>
            = positions.into_iter()
            .map(|p| { unravel(p, &shape, &mut idx); elems(&idx) })
            .collect();
        Ok(Self { indices, data, total_charge })
    }

    /// Return the indices of `self`.
    pub fn indices(&self) -> &[Index] { &self.indices }

    /// Return an owned copy of the indices of `self`.
    ///
    /// The copy is independent of `self`; modifying it has no effect on the
    /// tensor.
    pub fn sparse_shape(&self) -> Vec<Index> { self.indices.clone() }

    /// Return the dense dimension of each leg.
    pub fn shape(&self) -> Vec<usize> {
        self.indices.iter().map(Index::dim).collect()
    }

    /// Return the number of legs.
    pub fn rank(&self) -> usize { self.indices.len() }

    /// Return the total number of elements in the dense representation,
    /// saturating at `usize::MAX`.
    pub fn dense_size(&self) -> usize {
        checked_size(self.shape().iter()).unwrap_or(usize::MAX)
    }

    /// Return the total charge selected by every stored element.
    pub fn total_charge(&self) -> i64 { self.total_charge }

    /// Return the number of stored elements.
    pub fn num_nonzero(&self) -> usize { self.data.len() }

    /// Return the stored elements in row-major order of their positions.
    pub fn data(&self) -> &nd::Array1<A> { &self.data }

    /// Return an iterator over the elementary legs of all indices.
    pub fn legs(&self) -> impl Iterator<Item = &Leg> + '_ {
        self.indices.iter().flat_map(|idx| idx.legs().iter())
    }

    /// Return the row-major linear positions of all stored elements in the
    /// dense representation, in ascending order.
    pub fn nonzero_positions(&self) -> Vec<usize> {
        nonzero_positions_of(&elementary_legs(&self.indices), self.total_charge)
    }

    // compute the indices resulting from regrouping the legs of `self`
    fn regroup(&self, target: &Shape) -> BlockResult<Vec<Index>> {
        let expected = checked_size(self.shape().iter());
        let found = checked_size(target.dims().iter());
        match (expected, found) {
            (Some(e), Some(f)) if e == f => { },
            _ => {
                return Err(ShapeError::ElementCount {
                    expected: expected.unwrap_or(usize::MAX),
                    found: found.unwrap_or(usize::MAX),
                }.into());
            },
        }
        let legs = elementary_legs(&self.indices);
        match target {
            Shape::Dense(dims) => {
                let mut groups: Vec<Vec<Leg>> = Vec::with_capacity(dims.len());
                let mut legs_iter = legs.into_iter();
                for d in dims.iter().copied() {
                    let mut group: Vec<Leg> = Vec::new();
                    let mut prod: usize = 1;
                    while prod < d || group.is_empty() {
                        let leg = legs_iter.next().ok_or(ShapeError::Ungroupable)?;
                        prod *= leg.dim();
                        group.push(leg);
                    }
                    if prod != d { return Err(ShapeError::Ungroupable.into()); }
                    groups.push(group);
                }
                // element counts match, so anything left over has dimension 1
                if let Some(last) = groups.last_mut() {
                    last.extend(legs_iter);
                }
                Ok(groups.into_iter().map(Index::from_legs).collect())
            },
            Shape::Sparse(idxs) => {
                let compatible
                    = idxs.iter().flat_map(|idx| idx.legs().iter())
                    .eq(legs.iter());
                if !compatible {
                    return Err(ShapeError::IncompatibleCharges.into());
                }
                Ok(idxs.clone())
            },
        }
    }

    /// Merge or split the legs of `self` in place.
    ///
    /// `target` is either a list of dense dimensions or a list of indices. A
    /// dense target is satisfied by grouping neighboring elementary legs so
    /// that each group has the requested dimension; legs of dimension 1 left
    /// over at the end join the last group. A sparse target must be built from
    /// exactly the elementary legs of `self`, in order: a freshly created
    /// [`Index`] is rejected with [`ShapeError::IncompatibleCharges`] even if
    /// its charges equal the fused charges of the legs it would replace, so
    /// merged indices should be formed by fusing (`&a * &b`) the tensor's own
    /// indices. Stored data is never moved.
    ///
    /// On error, `self` is left unchanged.
    pub fn reshape<S>(&mut self, target: S) -> BlockResult<()>
    where S: Into<Shape>
    {
        let indices = self.regroup(&target.into())?;
        self.indices = indices;
        Ok(())
    }
}

impl<A> BlockSparseTensor<A>
where A: Elem
{
    /// Create a new tensor of total charge zero with all stored elements drawn
    /// from the standard normal distribution.
    pub fn randn<I, R>(indices: I, rng: &mut R) -> BlockResult<Self>
    where
        I: IntoIterator<Item = Index>,
        R: Rng + ?Sized,
    {
        Self::randn_with_charge(indices, 0, rng)
    }

    /// Like [`Self::randn`], but for an arbitrary total charge.
    pub fn randn_with_charge<I, R>(indices: I, total_charge: i64, rng: &mut R)
        -> BlockResult<Self>
    where
        I: IntoIterator<Item = Index>,
        R: Rng + ?Sized,
    {
        Self::from_fn(indices, total_charge, |_| A::sample_normal(&mut *rng))
    }

    /// Create a new tensor with all stored elements equal to zero.
    pub fn zeros<I>(indices: I, total_charge: i64) -> BlockResult<Self>
    where I: IntoIterator<Item = Index>
    {
        Self::from_fn(indices, total_charge, |_| A::zero())
    }

    /// Create a new tensor from a dense array.
    ///
    /// Fails if the array's shape doesn't match `indices` or if any nonzero
    /// element of the array sits at a position forbidden by charge
    /// conservation.
    pub fn from_dense<I>(array: &nd::ArrayD<A>, indices: I, total_charge: i64)
        -> BlockResult<Self>
    where I: IntoIterator<Item = Index>
    {
        let indices = Self::check_indices(indices)?;
        let shape: Vec<usize> = indices.iter().map(Index::dim).collect();
        if array.shape() != shape.as_slice() {
            return Err(ConstructionError::ShapeMismatch {
                expected: shape,
                found: array.shape().to_vec(),
            }.into());
        }
        let positions = nonzero_positions_of(&elementary_legs(&indices), total_charge);
        let mut data: Vec<A> = Vec::with_capacity(positions.len());
        let mut allowed = positions.iter().copied().peekable();
        for (p, a) in array.iter().enumerate() {
            if allowed.next_if_eq(&p).is_some() {
                data.push(*a);
            } else if !a.is_zero() {
                let mut idx: Vec<usize> = vec![0; shape.len()];
                unravel(p, &shape, &mut idx);
                return Err(ConstructionError::ChargeViolation(idx).into());
            }
        }
        Ok(Self { indices, data: data.into(), total_charge })
    }

    /// Return the element at a dense multi-index.
    ///
    /// Positions forbidden by charge conservation give zero. Returns `None` if
    /// `idx` has the wrong length or is out of bounds.
    ///
    /// Forbidden positions are recognized from the leg charges alone. Locating
    /// a stored element takes time proportional to the row and column counts
    /// of the tensor's square matrix view, roughly the square root of its
    /// dense size.
    pub fn get(&self, idx: &[usize]) -> Option<A> {
        let shape = self.shape();
        let in_bounds
            = idx.len() == shape.len()
            && idx.iter().zip(&shape).all(|(k, d)| k < d);
        if !in_bounds { return None; }
        let p = ravel(idx, &shape);

        let legs = elementary_legs(&self.indices);
        let leg_dims: Vec<usize> = legs.iter().map(Leg::dim).collect();
        let mut leg_idx: Vec<usize> = vec![0; legs.len()];
        unravel(p, &leg_dims, &mut leg_idx);
        let q: i64
            = legs.iter().zip(&leg_idx)
            .map(|(leg, k)| leg.flow().sign() * leg.charges()[*k])
            .sum();
        if q != self.total_charge { return Some(A::zero()); }

        // same split as `nonzero_positions_of`, so offsets line up with `data`
        let (row_legs, col_legs) = legs.split_at(square_split(&legs));
        let sectors = Sectors::new(row_legs, col_legs);
        let (row, col) = (p / sectors.ncols, p % sectors.ncols);
        let offset: usize
            = sectors.row_charges[..row].iter()
            .map(|qr| sectors.cols_for(*qr, self.total_charge).len())
            .sum();
        let k = sectors.cols_for(sectors.row_charges[row], self.total_charge)
            .binary_search(&col)
            .ok()?;
        Some(self.data[offset + k])
    }

    /// Convert to a dense array.
    pub fn todense(&self) -> nd::ArrayD<A> {
        let mut dense: nd::ArrayD<A> = nd::ArrayD::zeros(self.shape());
        let mut stored
            = self.nonzero_positions().into_iter()
            .zip(self.data.iter())
            .peekable();
        for (p, elem) in dense.iter_mut().enumerate() {
            if let Some((_, a)) = stored.next_if(|(q, _)| *q == p) {
                *elem = *a;
            }
        }
        dense
    }

    /// View `self` as a matrix whose rows are the first `nrow` legs fused
    /// together and whose columns are the remaining legs, and return its
    /// nonzero blocks.
    ///
    /// Blocks are ordered by ascending row charge; rows and columns within a
    /// block are in ascending order of position.
    pub fn blocks(&self, nrow: usize) -> BlockResult<Vec<Block<A>>> {
        let rank = self.rank();
        if nrow > rank {
            return Err(ShapeError::BadSplit { nrow, rank }.into());
        }
        let legs = elementary_legs(&self.indices);
        let n_row_legs: usize
            = self.indices.iter().take(nrow).map(Index::num_legs).sum();
        let (row_legs, col_legs) = legs.split_at(n_row_legs);
        let sectors = Sectors::new(row_legs, col_legs);

        // offset into `data` of the first stored element of each row
        let mut row_offsets: Vec<usize> = Vec::with_capacity(sectors.row_charges.len());
        let mut rows_by_charge: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        let mut offset: usize = 0;
        for (i, q) in sectors.row_charges.iter().copied().enumerate() {
            row_offsets.push(offset);
            offset += sectors.cols_for(q, self.total_charge).len();
            rows_by_charge.entry(q).or_default().push(i);
        }

        let blocks: Vec<Block<A>>
            = rows_by_charge.into_iter()
            .filter_map(|(charge, rows)| {
                let cols = sectors.cols_for(charge, self.total_charge).to_vec();
                if cols.is_empty() { return None; }
                let data
                    = nd::Array2::from_shape_fn(
                        (rows.len(), cols.len()),
                        |(a, b)| self.data[row_offsets[rows[a]] + b],
                    );
                Some(Block { charge, rows, cols, data })
            })
            .collect();
        Ok(blocks)
    }

    /// Return a new tensor holding the complex conjugates of all elements.
    pub fn conj(&self) -> Self {
        Self {
            indices: self.indices.clone(),
            data: self.data.mapv(|a| a.conj()),
            total_charge: self.total_charge,
        }
    }

    /// Return the Frobenius norm.
    pub fn norm(&self) -> A::Real {
        self.data.iter()
            .fold(A::Real::zero(), |acc, a| acc + a.norm_sqr())
            .sqrt()
    }
}

/// Return a reshaped copy of `tensor`, leaving the original untouched.
///
/// See [`BlockSparseTensor::reshape`].
pub fn reshape<A, S>(tensor: &BlockSparseTensor<A>, target: S)
    -> BlockResult<BlockSparseTensor<A>>
where
    A: Clone,
    S: Into<Shape>,
{
    let indices = tensor.regroup(&target.into())?;
    Ok(BlockSparseTensor {
        indices,
        data: tensor.data.clone(),
        total_charge: tensor.total_charge,
    })
}

impl<A> fmt::Display for BlockSparseTensor<A>
where A: fmt::Display
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{ ", self.data)?;
        let n_idxs = self.indices.len();
        for (k, idx) in self.indices.iter().enumerate() {
            write!(f, "{}", idx)?;
            if k < n_idxs - 1 { write!(f, ", ")?; }
        }
        write!(f, " }}, charge={}", self.total_charge)
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex64 as C64;
    use ndarray::Dimension;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::index::Flow;
    use super::*;

    fn random_charges(dim: usize, rng: &mut StdRng) -> Vec<i64> {
        (0..dim).map(|_| rng.gen_range(0..4)).collect()
    }

    // the rank-4 tensor used throughout the tutorial
    fn tutorial_indices(rng: &mut StdRng) -> Vec<Index> {
        [(4, Flow::In), (6, Flow::Out), (8, Flow::In), (10, Flow::Out)]
            .into_iter()
            .map(|(d, flow)| Index::new(random_charges(d, rng), flow).unwrap())
            .collect()
    }

    fn tutorial_tensor(seed: u64) -> BlockSparseTensor<C64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let indices = tutorial_indices(&mut rng);
        BlockSparseTensor::randn(indices, &mut rng).unwrap()
    }

    fn check_conservation<A>(t: &BlockSparseTensor<A>) {
        let legs: Vec<&Leg> = t.legs().collect();
        let dims: Vec<usize> = legs.iter().map(|leg| leg.dim()).collect();
        let mut idx: Vec<usize> = vec![0; dims.len()];
        let positions = t.nonzero_positions();
        assert_eq!(positions.len(), t.num_nonzero());
        for p in positions {
            unravel(p, &dims, &mut idx);
            let q: i64
                = legs.iter().zip(&idx)
                .map(|(leg, k)| leg.flow().sign() * leg.charges()[*k])
                .sum();
            assert_eq!(q, t.total_charge());
        }
    }

    #[test]
    fn randn_shape_matches_indices() {
        let t = tutorial_tensor(1);
        assert_eq!(t.shape(), vec![4, 6, 8, 10]);
        assert_eq!(t.rank(), 4);
        assert_eq!(t.total_charge(), 0);
        check_conservation(&t);
    }

    #[test]
    fn randn_counts_match_brute_force() {
        let mut rng = StdRng::seed_from_u64(7);
        let indices = tutorial_indices(&mut rng);
        let t: BlockSparseTensor<f64>
            = BlockSparseTensor::randn_with_charge(indices.clone(), 1, &mut rng)
            .unwrap();
        let q: Vec<Vec<i64>>
            = indices.iter().map(Index::effective_charges).collect();
        let mut count: usize = 0;
        for a in 0..4 {
            for b in 0..6 {
                for c in 0..8 {
                    for d in 0..10 {
                        if q[0][a] + q[1][b] + q[2][c] + q[3][d] == 1 {
                            count += 1;
                        }
                    }
                }
            }
        }
        assert_eq!(t.num_nonzero(), count);
        check_conservation(&t);
    }

    #[test]
    fn randn_requires_indices() {
        let mut rng = StdRng::seed_from_u64(0);
        let res: BlockResult<BlockSparseTensor<f64>>
            = BlockSparseTensor::randn(Vec::new(), &mut rng);
        assert!(matches!(res, Err(BlockError::Construction(ConstructionError::NoIndices))));
    }

    #[test]
    fn dense_reshape_merges_neighbors() {
        let a = tutorial_tensor(2);
        let b = reshape(&a, [4, 48, 10]).unwrap();
        assert_eq!(b.shape(), vec![4, 48, 10]);
        assert_eq!(b.data(), a.data());
        assert_eq!(b.indices()[1], &a.indices()[1] * &a.indices()[2]);
        assert_eq!(a.shape(), vec![4, 6, 8, 10]);
        check_conservation(&b);
    }

    #[test]
    fn dense_round_trip_restores_tensor() {
        let orig = tutorial_tensor(3);
        let mut a = orig.clone();
        let shape_a = a.shape();
        a.reshape([shape_a[0] * shape_a[1], shape_a[2], shape_a[3]]).unwrap();
        assert_eq!(a.shape(), vec![24, 8, 10]);
        a.reshape(&shape_a).unwrap();
        assert_eq!(a, orig);
    }

    #[test]
    fn sparse_round_trip_restores_tensor() {
        let orig = tutorial_tensor(4);
        let mut a = orig.clone();
        let sparse = a.sparse_shape();
        let merged = vec![&sparse[0] * &sparse[1], sparse[2].clone(), sparse[3].clone()];
        let b = reshape(&a, merged.clone()).unwrap();
        a.reshape(merged).unwrap();
        assert_eq!(a, b);
        a.reshape(sparse).unwrap();
        assert_eq!(a, orig);
        assert_eq!(reshape(&b, orig.sparse_shape()).unwrap(), orig);
    }

    #[test]
    fn full_merge_and_split() {
        let orig = tutorial_tensor(5);
        let flat = reshape(&orig, [1920]).unwrap();
        assert_eq!(flat.rank(), 1);
        assert_eq!(flat.indices()[0].num_legs(), 4);
        check_conservation(&flat);
        let back = reshape(&flat, [4, 6, 8, 10]).unwrap();
        assert_eq!(back, orig);
    }

    #[test]
    fn element_count_mismatch_is_error() {
        let mut a = tutorial_tensor(6);
        let before = a.clone();
        let res = a.reshape([4, 6, 8, 11]);
        assert!(matches!(
            res,
            Err(BlockError::Shape(ShapeError::ElementCount { expected: 1920, found: 2112 }))
        ));
        assert_eq!(a, before);
    }

    #[test]
    fn overflowing_target_is_element_count_error() {
        let i = Index::new(vec![0, 1], Flow::In).unwrap();
        let j = Index::new(vec![0, 1, 1], Flow::Out).unwrap();
        let mut a: BlockSparseTensor<f64>
            = BlockSparseTensor::zeros([i, j], 0).unwrap();
        let before = a.clone();
        assert!(matches!(
            a.reshape([usize::MAX, 2]),
            Err(BlockError::Shape(ShapeError::ElementCount { expected: 6, found: usize::MAX }))
        ));
        assert!(matches!(
            reshape(&a, [usize::MAX / 2 + 1, 2, 3]),
            Err(BlockError::Shape(ShapeError::ElementCount { expected: 6, found: usize::MAX }))
        ));
        assert_eq!(a, before);
    }

    #[test]
    fn unit_legs_round_trip() {
        let mut rng = StdRng::seed_from_u64(16);
        let indices = vec![
            Index::new(vec![0, 1], Flow::In).unwrap(),
            Index::new(vec![1], Flow::Out).unwrap(),
            Index::new(vec![0, 1, 2], Flow::Out).unwrap(),
        ];
        let orig: BlockSparseTensor<f64>
            = BlockSparseTensor::randn_with_charge(indices, -1, &mut rng).unwrap();
        assert_eq!(orig.shape(), vec![2, 1, 3]);

        // the unit leg is absorbed into the following group
        let merged = reshape(&orig, [2, 3]).unwrap();
        assert_eq!(merged.indices()[0], orig.indices()[0]);
        assert_eq!(merged.indices()[1].num_legs(), 2);
        assert_eq!(merged.data(), orig.data());
        assert_eq!(reshape(&merged, [2, 1, 3]).unwrap(), orig);

        let flat = reshape(&orig, [6]).unwrap();
        assert_eq!(flat.indices()[0].num_legs(), 3);
        check_conservation(&flat);
        assert_eq!(reshape(&flat, orig.sparse_shape()).unwrap(), orig);

        // trailing unit legs join the last group
        let mut rng = StdRng::seed_from_u64(17);
        let indices = vec![
            Index::new(vec![0, 1, 1], Flow::In).unwrap(),
            Index::new(vec![1, 0], Flow::Out).unwrap(),
            Index::new(vec![0], Flow::In).unwrap(),
        ];
        let t: BlockSparseTensor<f64>
            = BlockSparseTensor::randn(indices, &mut rng).unwrap();
        let u = reshape(&t, [3, 2]).unwrap();
        assert_eq!(u.indices()[1].num_legs(), 2);
        assert_eq!(reshape(&u, [3, 2, 1]).unwrap(), t);
    }

    #[test]
    fn ungroupable_shape_is_error() {
        let mut a = tutorial_tensor(7);
        let before = a.clone();
        // 4 * 6 * 8 * 10 == 12 * 160, but 12 straddles the first two legs
        assert!(matches!(
            a.reshape([12, 160]),
            Err(BlockError::Shape(ShapeError::Ungroupable))
        ));
        assert_eq!(a, before);
    }

    #[test]
    fn incompatible_sparse_target_is_error() {
        let mut a = tutorial_tensor(8);
        let before = a.clone();
        let mut sparse = a.sparse_shape();
        sparse[0] = sparse[0].flip_flow();
        assert!(matches!(
            a.reshape(sparse),
            Err(BlockError::Shape(ShapeError::IncompatibleCharges))
        ));
        assert_eq!(a, before);
    }

    #[test]
    fn fresh_index_is_not_a_fused_target() {
        let a = tutorial_tensor(18);
        let sparse = a.sparse_shape();
        let fused = &sparse[0] * &sparse[1];
        let fresh = Index::new(fused.charges(), Flow::In).unwrap();
        assert_eq!(fresh.charges(), fused.charges());
        let target = vec![fresh, sparse[2].clone(), sparse[3].clone()];
        assert!(matches!(
            reshape(&a, target),
            Err(BlockError::Shape(ShapeError::IncompatibleCharges))
        ));
    }

    #[test]
    fn sparse_shape_is_deep_copy() {
        let a = tutorial_tensor(9);
        let mut sparse = a.sparse_shape();
        sparse[0] = Index::new(vec![9, 9, 9, 9], Flow::Out).unwrap();
        sparse.pop();
        assert_eq!(a.rank(), 4);
        assert_ne!(a.indices()[0], sparse[0]);
    }

    #[test]
    fn in_place_and_copy_agree() {
        let a = tutorial_tensor(10);
        let copy = reshape(&a, [4, 480]).unwrap();
        let mut in_place = a.clone();
        in_place.reshape([4, 480]).unwrap();
        assert_eq!(copy, in_place);
        assert_eq!(a.shape(), vec![4, 6, 8, 10]);
    }

    #[test]
    fn dense_conversion_round_trip() {
        let a = tutorial_tensor(11);
        let dense = a.todense();
        assert_eq!(dense.shape(), &[4, 6, 8, 10]);
        let nnz = dense.iter().filter(|z| !z.is_zero()).count();
        assert_eq!(nnz, a.num_nonzero());
        let b = BlockSparseTensor::from_dense(&dense, a.sparse_shape(), 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.get(&[1, 2, 3, 4]), Some(dense[[1, 2, 3, 4]]));
        assert_eq!(a.get(&[4, 0, 0, 0]), None);
        assert_eq!(a.get(&[0, 0, 0]), None);
    }

    #[test]
    fn get_matches_dense_everywhere() {
        let a = tutorial_tensor(19);
        let merged = reshape(&a, [24, 8, 10]).unwrap();
        let dense = a.todense();
        for (k, z) in dense.indexed_iter() {
            assert_eq!(a.get(k.slice()), Some(*z));
        }
        let dense = merged.todense();
        for ((i, j, k), z) in dense.into_shape((24, 8, 10)).unwrap().indexed_iter() {
            assert_eq!(merged.get(&[i, j, k]), Some(*z));
        }
    }

    #[test]
    fn from_dense_rejects_charge_violation() {
        let i = Index::new(vec![0, 1], Flow::In).unwrap();
        let j = Index::new(vec![0, 1], Flow::Out).unwrap();
        let dense = nd::array![[1.0, 2.0], [0.0, 3.0]].into_dyn();
        let res = BlockSparseTensor::from_dense(&dense, [i.clone(), j.clone()], 0);
        assert!(matches!(
            res,
            Err(BlockError::Construction(ConstructionError::ChargeViolation(ref idx)))
                if idx == &vec![0, 1]
        ));
        let bad_shape = nd::array![[1.0, 0.0, 0.0]].into_dyn();
        assert!(BlockSparseTensor::from_dense(&bad_shape, [i, j], 0).is_err());
    }

    #[test]
    fn blocks_cover_all_elements() {
        let a = tutorial_tensor(12);
        for nrow in 0..=a.rank() {
            let blocks = a.blocks(nrow).unwrap();
            let total: usize = blocks.iter().map(|b| b.data.len()).sum();
            assert_eq!(total, a.num_nonzero());
            assert!(blocks.windows(2).all(|w| w[0].charge < w[1].charge));
        }
        assert!(matches!(
            a.blocks(5),
            Err(BlockError::Shape(ShapeError::BadSplit { nrow: 5, rank: 4 }))
        ));
    }

    #[test]
    fn blocks_match_dense_elements() {
        let a = tutorial_tensor(13);
        let dense = a.todense();
        let matrix = dense.into_shape((24, 80)).unwrap();
        for block in a.blocks(2).unwrap() {
            for (r, i) in block.rows.iter().enumerate() {
                for (c, j) in block.cols.iter().enumerate() {
                    assert_eq!(block.data[[r, c]], matrix[[*i, *j]]);
                }
            }
        }
    }

    #[test]
    fn from_fn_visits_allowed_positions() {
        let i = Index::new(vec![0, 1, 2], Flow::In).unwrap();
        let j = Index::new(vec![2, 1, 0], Flow::Out).unwrap();
        let t: BlockSparseTensor<f64>
            = BlockSparseTensor::from_fn([i, j], 0, |idx| (10 * idx[0] + idx[1]) as f64)
            .unwrap();
        // only the anti-diagonal conserves charge
        assert_eq!(t.data().to_vec(), vec![2.0, 11.0, 20.0]);
        assert_eq!(t.nonzero_positions(), vec![2, 4, 6]);
    }

    #[test]
    fn conj_and_norm() {
        let a = tutorial_tensor(14);
        let c = a.conj();
        assert!(a.data().iter().zip(c.data()).all(|(x, y)| x.conj() == *y));
        let expected: f64 = a.todense().iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt();
        assert!((a.norm() - expected).abs() < 1e-10);
    }

    #[test]
    fn zeros_has_no_weight() {
        let mut rng = StdRng::seed_from_u64(15);
        let indices = tutorial_indices(&mut rng);
        let t: BlockSparseTensor<f32> = BlockSparseTensor::zeros(indices, 0).unwrap();
        assert_eq!(t.norm(), 0.0);
        check_conservation(&t);
    }
}
