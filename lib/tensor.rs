//! Dense tensors with labelled indices.
//!
//! A [`Tensor`] pairs an N-dimensional array with one label per axis. Two
//! tensors are contracted by summing over every index they have in common,
//! which is how the weight nodes of a
//! [`DenseCondenser`][crate::condenser::DenseCondenser] are chained together:
//!
//! <blockquote>
//!   <p style="font-size:20px">
//!     <i>C</i><sub>
//!       <i>a</i><sub>1</sub>,...,<i>a</i><sub><i>N</i></sub>,
//!       <i>b</i><sub>1</sub>,...,<i>b</i><sub><i>M</i></sub>
//!     </sub>
//!       = Σ<sub><i>α</i><sub>1</sub>,...,<i>α</i><sub><i>D</i></sub></sub> [
//!         <i>A</i><sub>
//!           <i>a</i><sub>1</sub>,...,<i>a</i><sub><i>N</i></sub>,
//!           <i>α</i><sub>1</sub>,...,<i>α</i><sub><i>D</i></sub>
//!         </sub>
//!         × <i>B</i><sub>
//!           <i>b</i><sub>1</sub>,...,<i>b</i><sub><i>M</i></sub>,
//!           <i>α</i><sub>1</sub>,...,<i>α</i><sub><i>D</i></sub>
//!         </sub>
//!       ]
//!   </p>
//! </blockquote>
//!
//! ```
//! use block_tensor_net::tensor::{ DynIdx, Tensor };
//!
//! let i = DynIdx::from(("i", 3));
//! let j = DynIdx::from(("j", 4));
//! let k = DynIdx::from(("k", 5));
//!
//! let a = Tensor::new([i.clone(), j.clone()], |_| 1.0);
//! let b = Tensor::new([j, k.clone()], |_| 2.0);
//! let c: Tensor<DynIdx, f64> = a.contract(b).unwrap(); // C_ik = A_ij B_jk
//! assert_eq!(c.shape(), vec![3, 5]);
//! assert!(c.into_array().iter().all(|x| *x == 8.0));
//! ```

use std::{ fmt, iter::Sum, ops::{ Mul, Range } };
use itertools::Itertools;
use ndarray::{ self as nd, Dimension };
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TensorError {
    /// Returned when a contraction is attempted between two tensors (rank > 0)
    /// with no common indices.
    #[error("error in tensor contraction: no matching indices")]
    NoMatchingIndices,

    /// Returned when attempting to create a tensor from an array whose shape
    /// does not match the provided indices.
    #[error("error in tensor creation: array shape does not match indices")]
    IncompatibleShape,
}
use TensorError::*;
pub type TensorResult<T> = Result<T, TensorError>;

/// Describes a tensor index.
///
/// Indices are matched by equality when contracting, so two tensors sharing an
/// index must agree on its dimension.
pub trait Idx: Clone + Eq + fmt::Debug {
    /// Return the number of values the index can take.
    fn dim(&self) -> usize;

    /// Return an iterator over all possible index values. The default
    /// implementation returns `0..self.dim()`.
    fn iter(&self) -> Range<usize> { 0..self.dim() }
}

/// A dynamically labelled and dimensioned tensor index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DynIdx(
    /// Identifier label.
    pub String,
    /// Index dimension.
    pub usize,
);

impl Idx for DynIdx {
    fn dim(&self) -> usize { self.1 }
}

impl<T> From<(T, usize)> for DynIdx
where String: From<T>
{
    fn from(x: (T, usize)) -> Self {
        let (label, dim) = x;
        Self(label.into(), dim)
    }
}

#[derive(Clone, PartialEq, Eq)]
enum TensorData<T, A> {
    Scalar(A),
    Tensor(Vec<T>, nd::ArrayD<A>),
}

impl<T, A> fmt::Debug for TensorData<T, A>
where
    T: fmt::Debug,
    A: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(a) => {
                fmt::Debug::fmt(a, f)?;
                write!(f, ", type=scalar, rank=0, indices=[]")?;
            },
            Self::Tensor(idxs, a) => {
                fmt::Debug::fmt(a, f)?;
                write!(
                    f,
                    ",\ntype=tensor, rank={}, indices={:?}",
                    idxs.len(),
                    idxs,
                )?;
            },
        }
        Ok(())
    }
}

// return the indices of `idxs` not in `common`, along with the axis permutation
// moving `common` (in its own order) to the front and leaving the rest in order
fn common_first<T>(idxs: &[T], common: &[T]) -> (Vec<T>, Vec<usize>)
where T: PartialEq + Clone
{
    let mut perm: Vec<usize>
        = common.iter()
        .filter_map(|c| idxs.iter().position(|idx| idx == c))
        .collect();
    let free: Vec<usize>
        = (0..idxs.len())
        .filter(|k| !perm.contains(k))
        .collect();
    let free_idxs: Vec<T> = free.iter().map(|k| idxs[*k].clone()).collect();
    perm.extend(free);
    (free_idxs, perm)
}

impl<T, A> TensorData<T, A>
where T: Idx
{
    fn new<I, F>(indices: I, mut elems: F) -> Self
    where
        I: IntoIterator<Item = T>,
        F: FnMut(&[usize]) -> A,
    {
        let indices: Vec<T> = indices.into_iter().collect();
        if indices.is_empty() {
            Self::Scalar(elems(&[]))
        } else {
            let shape: Vec<usize>
                = indices.iter().map(|idx| idx.dim()).collect();
            let mut k: Vec<usize> = vec![0; shape.len()];
            let data: nd::ArrayD<A>
                = nd::ArrayD::from_shape_fn(
                    shape,
                    |k_dim| {
                        k.iter_mut()
                            .zip(k_dim.as_array_view())
                            .for_each(|(k_ref, k_dim_ref)| { *k_ref = *k_dim_ref; });
                        elems(&k)
                    },
                );
            Self::Tensor(indices, data)
        }
    }

    fn from_array<I>(indices: I, array: nd::ArrayD<A>) -> TensorResult<Self>
    where
        I: IntoIterator<Item = T>,
        A: Clone,
    {
        let indices: Vec<T> = indices.into_iter().collect();
        if indices.is_empty() {
            if array.ndim() != 0 { return Err(IncompatibleShape); }
            array.iter().next().cloned()
                .map(Self::Scalar)
                .ok_or(IncompatibleShape)
        } else {
            let matching
                = indices.len() == array.ndim()
                && indices.iter().zip(array.shape()).all(|(idx, d)| idx.dim() == *d);
            if !matching { return Err(IncompatibleShape); }
            Ok(Self::Tensor(indices, array))
        }
    }

    fn shape(&self) -> Vec<usize> {
        match self {
            Self::Scalar(_) => Vec::new(),
            Self::Tensor(idxs, _)
                => idxs.iter().map(|idx| idx.dim()).collect(),
        }
    }

    fn indices(&self) -> &[T] {
        match self {
            Self::Scalar(_) => &[],
            Self::Tensor(idxs, _) => idxs.as_slice(),
        }
    }

    fn contract<B, C>(self, other: TensorData<T, B>)
        -> TensorResult<TensorData<T, C>>
    where
        A: Clone + Mul<B, Output = C>,
        B: Clone,
        C: Sum,
    {
        match (self, other) {
            (TensorData::Scalar(a), TensorData::Scalar(b)) => {
                Ok(TensorData::Scalar(a * b))
            },
            (TensorData::Scalar(a), TensorData::Tensor(idxs, b)) => {
                let mul: nd::ArrayD<C> = b.mapv(|bk| a.clone() * bk);
                Ok(TensorData::Tensor(idxs, mul))
            },
            (TensorData::Tensor(idxs, a), TensorData::Scalar(b)) => {
                let mul: nd::ArrayD<C> = a.mapv(|ak| ak * b.clone());
                Ok(TensorData::Tensor(idxs, mul))
            },
            (TensorData::Tensor(idxs_a, a), TensorData::Tensor(idxs_b, b)) => {
                let idx_common: Vec<T>
                    = idxs_a.iter()
                    .filter(|idx| idxs_b.contains(idx))
                    .cloned()
                    .collect();
                if idx_common.is_empty() { return Err(NoMatchingIndices); }

                // move common axes to the front of both arrays so that summing
                // is a matter of fixing the leading coordinates
                let (free_a, perm_a) = common_first(&idxs_a, &idx_common);
                let (free_b, perm_b) = common_first(&idxs_b, &idx_common);
                let a = a.permuted_axes(perm_a);
                let b = b.permuted_axes(perm_b);

                let n_ix: usize = idx_common.len();
                let n_idx_a: usize = free_a.len();
                let new_shape: Vec<usize>
                    = free_a.iter().chain(free_b.iter())
                    .map(|idx| idx.dim())
                    .collect();
                if new_shape.is_empty() {
                    let c: C
                        = idx_common.iter()
                        .map(|idx| idx.iter())
                        .multi_cartesian_product()
                        .map(|k_sum| a[k_sum.as_slice()].clone() * b[k_sum.as_slice()].clone())
                        .sum();
                    return Ok(TensorData::Scalar(c));
                }

                let mut k_a: Vec<usize> = vec![0; a.ndim()];
                let mut k_b: Vec<usize> = vec![0; b.ndim()];
                let new_data: nd::ArrayD<C>
                    = nd::ArrayD::from_shape_fn(
                        new_shape,
                        |k_res| {
                            let k_res = k_res.as_array_view();
                            k_a.iter_mut().skip(n_ix)
                                .zip(k_res.iter().take(n_idx_a))
                                .for_each(|(k_a_ref, k_res_ref)| { *k_a_ref = *k_res_ref; });
                            k_b.iter_mut().skip(n_ix)
                                .zip(k_res.iter().skip(n_idx_a))
                                .for_each(|(k_b_ref, k_res_ref)| { *k_b_ref = *k_res_ref; });
                            idx_common.iter()
                                .map(|idx| idx.iter())
                                .multi_cartesian_product()
                                .map(|k_sum| {
                                    k_a[..n_ix].copy_from_slice(&k_sum);
                                    k_b[..n_ix].copy_from_slice(&k_sum);
                                    a[k_a.as_slice()].clone() * b[k_b.as_slice()].clone()
                                })
                                .sum::<C>()
                        },
                    );
                let new_idxs: Vec<T>
                    = free_a.into_iter().chain(free_b).collect();
                Ok(TensorData::Tensor(new_idxs, new_data))
            },
        }
    }

    fn into_array(self) -> nd::ArrayD<A> {
        match self {
            Self::Scalar(a) => nd::arr0(a).into_dyn(),
            Self::Tensor(_, a) => a,
        }
    }
}

/// Basic implementation of a dense, labelled tensor.
///
/// A `Tensor<T, A>` consists of some number of quantities of type `A` and a
/// series of indices belonging to a type `T` that implements [`Idx`]. Rank 0
/// (scalar) and rank > 0 (array) quantities are distinguished internally.
#[derive(Clone, PartialEq, Eq)]
pub struct Tensor<T, A>(TensorData<T, A>);

impl<T, A> fmt::Debug for Tensor<T, A>
where
    T: fmt::Debug,
    A: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(")?;
        fmt::Debug::fmt(&self.0, f)?;
        write!(f, ")")
    }
}

impl<T, A> From<TensorData<T, A>> for Tensor<T, A> {
    fn from(data: TensorData<T, A>) -> Self { Self(data) }
}

impl<T, A> Tensor<T, A>
where T: Idx
{
    /// Create a new tensor using a function over given indices.
    pub fn new<I, F>(indices: I, elems: F) -> Self
    where
        I: IntoIterator<Item = T>,
        F: FnMut(&[usize]) -> A,
    {
        TensorData::new(indices, elems).into()
    }

    /// Create a new tensor from an existing array.
    ///
    /// Fails if the dimensions of `indices` don't match the shape of `array`.
    /// An empty set of indices requires a zero-dimensional array.
    pub fn from_array<I>(indices: I, array: nd::ArrayD<A>) -> TensorResult<Self>
    where
        I: IntoIterator<Item = T>,
        A: Clone,
    {
        TensorData::from_array(indices, array).map(Self::from)
    }

    /// Return the shape (dimensions of each index) of `self` in a vector.
    ///
    /// If `self` is a scalar, the returned vector is empty.
    pub fn shape(&self) -> Vec<usize> { self.0.shape() }

    /// Return all indices in axis order.
    pub fn indices(&self) -> &[T] { self.0.indices() }

    /// Contract `self` with `other` over all common indices, consuming both.
    ///
    /// The result's indices are the non-common indices of `self` followed by
    /// those of `other`, each group in its original order.
    pub fn contract<B, C>(self, other: Tensor<T, B>)
        -> TensorResult<Tensor<T, C>>
    where
        A: Clone + Mul<B, Output = C>,
        B: Clone,
        C: Sum,
    {
        let (Tensor(lhs), Tensor(rhs)) = (self, other);
        lhs.contract(rhs).map(Tensor::from)
    }

    /// Unwrap `self` into a bare array, discarding indices.
    ///
    /// Scalars become zero-dimensional arrays.
    pub fn into_array(self) -> nd::ArrayD<A> { self.0.into_array() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(label: &str, dim: usize) -> DynIdx { DynIdx::from((label, dim)) }

    #[test]
    fn matrix_product() {
        let a = Tensor::new([idx("i", 2), idx("j", 3)], |k| (k[0] * 3 + k[1]) as f64);
        let b = Tensor::new([idx("j", 3), idx("k", 2)], |k| (k[0] * 2 + k[1]) as f64);
        let c: Tensor<DynIdx, f64> = a.contract(b).unwrap();
        assert_eq!(c.indices(), &[idx("i", 2), idx("k", 2)]);
        let expected = nd::array![[10.0, 13.0], [28.0, 40.0]].into_dyn();
        assert_eq!(c.into_array(), expected);
    }

    #[test]
    fn contraction_keeps_free_index_order() {
        let a = Tensor::new([idx("x", 2), idx("s", 2), idx("y", 3)], |_| 1.0);
        let b = Tensor::new([idx("u", 4), idx("s", 2), idx("v", 5)], |_| 1.0);
        let c: Tensor<DynIdx, f64> = a.contract(b).unwrap();
        assert_eq!(c.shape(), vec![2, 3, 4, 5]);
        assert!(c.into_array().iter().all(|x| *x == 2.0));
    }

    #[test]
    fn full_contraction_is_scalar() {
        let a = Tensor::new([idx("i", 3), idx("j", 2)], |k| (k[0] + k[1]) as f64);
        let b = Tensor::new([idx("j", 2), idx("i", 3)], |_| 1.0);
        let c: Tensor<DynIdx, f64> = a.contract(b).unwrap();
        assert!(c.shape().is_empty());
        assert_eq!(c.into_array(), nd::arr0(9.0).into_dyn());
    }

    #[test]
    fn no_common_indices_is_error() {
        let a = Tensor::new([idx("i", 3)], |_| 1.0);
        let b = Tensor::new([idx("j", 3)], |_| 1.0);
        let res: TensorResult<Tensor<DynIdx, f64>> = a.contract(b);
        assert!(matches!(res, Err(NoMatchingIndices)));
    }

    #[test]
    fn from_array_checks_shape() {
        let arr = nd::ArrayD::<f64>::zeros(vec![2, 3]);
        assert!(Tensor::from_array([idx("i", 2), idx("j", 3)], arr.clone()).is_ok());
        assert!(matches!(
            Tensor::from_array([idx("i", 3), idx("j", 2)], arr),
            Err(IncompatibleShape)
        ));
        let scalar = Tensor::<DynIdx, f64>::from_array([], nd::arr0(4.0).into_dyn()).unwrap();
        assert_eq!(scalar.into_array(), nd::arr0(4.0).into_dyn());
        assert!(matches!(
            Tensor::<DynIdx, f64>::from_array([], nd::ArrayD::zeros(vec![1])),
            Err(IncompatibleShape)
        ));
    }
}
