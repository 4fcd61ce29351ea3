#![allow(non_snake_case, non_upper_case_globals)]

//! Charge-conserving block-sparse tensors, plus a small dense tensor-network
//! layer built on labelled tensor contractions.
//!
//! The core of the crate is [`BlockSparseTensor`][block_tensor::BlockSparseTensor],
//! whose legs are described by [`Index`][index::Index] objects carrying an
//! integer charge for every basis element and a [`Flow`][index::Flow]. Only
//! elements whose flow-weighted charges sum to a fixed total are stored; every
//! other element is an exact zero.
//!
//! ```
//! use num_complex::Complex64 as C64;
//! use rand::{ SeedableRng, rngs::StdRng };
//! use block_tensor_net::block_tensor::{ self as bt, BlockSparseTensor };
//! use block_tensor_net::index::{ Flow, Index };
//!
//! let mut rng = StdRng::seed_from_u64(10546);
//! let i1 = Index::new(vec![0, 1, 1, 2], Flow::In).unwrap();
//! let i2 = Index::new(vec![0, 0, 1, 2, 3, 1], Flow::Out).unwrap();
//! let i3 = Index::new(vec![1, 2, 0], Flow::In).unwrap();
//!
//! let mut a: BlockSparseTensor<C64>
//!     = BlockSparseTensor::randn([i1, i2, i3], &mut rng).unwrap();
//! assert_eq!(a.shape(), vec![4, 6, 3]);
//!
//! // merge the first two legs; the stored elements are left untouched
//! let b = bt::reshape(&a, [24, 3]).unwrap();
//! assert_eq!(b.shape(), vec![24, 3]);
//! assert_eq!(b.data(), a.data());
//!
//! // same thing in place, using a sparse target shape
//! let sparse = a.sparse_shape();
//! a.reshape(vec![&sparse[0] * &sparse[1], sparse[2].clone()]).unwrap();
//! assert_eq!(a, b);
//! a.reshape(sparse).unwrap();
//! assert_eq!(a.shape(), vec![4, 6, 3]);
//! ```

use std::fmt;
use num_complex::{ ComplexFloat, Complex };
use num_traits::Float;
use rand::{ Rng, distributions::Distribution };
use statrs::distribution::Normal;

pub mod index;
pub mod block_tensor;
pub mod tensor;
pub mod condenser;

/// Element types that can be held by a
/// [`BlockSparseTensor`][block_tensor::BlockSparseTensor].
///
/// This is implemented for `f32`, `f64`, and complex numbers over either.
pub trait Elem: ComplexFloat + fmt::Debug {
    /// Draw a single value from the standard normal distribution.
    ///
    /// Complex values have independent, standard normal real and imaginary
    /// parts.
    fn sample_normal<R>(rng: &mut R) -> Self
    where R: Rng + ?Sized;

    /// Return `|self|²` as a real number.
    fn norm_sqr(self) -> Self::Real { (self.conj() * self).re() }
}

impl Elem for f64 {
    fn sample_normal<R>(rng: &mut R) -> Self
    where R: Rng + ?Sized
    {
        Normal::standard().sample(rng)
    }
}

impl Elem for f32 {
    fn sample_normal<R>(rng: &mut R) -> Self
    where R: Rng + ?Sized
    {
        <f64 as Elem>::sample_normal(rng) as f32
    }
}

impl<T> Elem for Complex<T>
where
    T: Elem + Float,
    Complex<T>: ComplexFloat<Real = T>,
{
    fn sample_normal<R>(rng: &mut R) -> Self
    where R: Rng + ?Sized
    {
        let re = T::sample_normal(rng);
        let im = T::sample_normal(rng);
        Self::new(re, im)
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex64 as C64;
    use rand::{ SeedableRng, rngs::StdRng };
    use super::*;

    #[test]
    fn complex_samples_have_both_parts() {
        let mut rng = StdRng::seed_from_u64(1);
        let z: Vec<C64> = (0..32).map(|_| C64::sample_normal(&mut rng)).collect();
        assert!(z.iter().any(|zk| zk.re != 0.0));
        assert!(z.iter().any(|zk| zk.im != 0.0));
    }

    #[test]
    fn norm_sqr_is_real() {
        let z = C64::new(3.0, -4.0);
        assert_eq!(z.norm_sqr(), 25.0);
        assert_eq!(Elem::norm_sqr(-2.0_f64), 4.0);
    }
}
