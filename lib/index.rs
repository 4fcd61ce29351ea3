//! Charge-labelled tensor legs.
//!
//! An [`Index`] describes one leg of a
//! [`BlockSparseTensor`][crate::block_tensor::BlockSparseTensor]: each basis
//! element along the leg carries an integer charge, and the leg as a whole has
//! a [`Flow`] saying whether charge enters or leaves the tensor through it.
//!
//! Indices can be fused into composite indices (see [`Index::fuse`]), which is
//! how neighboring legs of a tensor are merged by a reshape. A composite index
//! remembers the elementary legs it was built from, so a fusion can always be
//! undone exactly.
//!
//! ```
//! use block_tensor_net::index::{ Flow, Index };
//!
//! let a = Index::new(vec![0, 1], Flow::In).unwrap();
//! let b = Index::new(vec![0, 2, 3], Flow::Out).unwrap();
//! let ab = &a * &b;
//! assert_eq!(ab.dim(), 6);
//! assert_eq!(ab.charges(), vec![0, -2, -3, 1, -1, -2]);
//! assert_eq!(ab.flow(), Flow::In);
//! assert_eq!(ab.split(), Some((a, b)));
//! ```

use std::{ fmt, ops::Mul };
use itertools::Itertools;
use crate::block_tensor::{ BlockResult, ConstructionError };

/// Direction of charge flow through a tensor leg.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Flow {
    /// Charge flows into the tensor; charges count with sign +1.
    In,
    /// Charge flows out of the tensor; charges count with sign -1.
    Out,
}

impl Flow {
    /// Return `+1` for `In` and `-1` for `Out`.
    pub fn sign(self) -> i64 {
        match self {
            Self::In => 1,
            Self::Out => -1,
        }
    }

    /// Return the opposite flow.
    pub fn reversed(self) -> Self {
        match self {
            Self::In => Self::Out,
            Self::Out => Self::In,
        }
    }
}

impl TryFrom<i32> for Flow {
    type Error = ConstructionError;

    fn try_from(x: i32) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::In),
            -1 => Ok(Self::Out),
            _ => Err(ConstructionError::InvalidFlow(x)),
        }
    }
}

impl From<Flow> for i32 {
    fn from(flow: Flow) -> Self { flow.sign() as i32 }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => write!(f, "+1"),
            Self::Out => write!(f, "-1"),
        }
    }
}

/// Row-major, flow-weighted outer sum of two charge sequences.
///
/// The element at position `i * q2.len() + j` is
/// `f1.sign() * q1[i] + f2.sign() * q2[j]`.
pub fn fuse_charges(q1: &[i64], f1: Flow, q2: &[i64], f2: Flow) -> Vec<i64> {
    let (s1, s2) = (f1.sign(), f2.sign());
    q1.iter()
        .cartesian_product(q2.iter())
        .map(|(a, b)| s1 * a + s2 * b)
        .collect()
}

/// A single, unfused tensor leg.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Leg {
    charges: Vec<i64>,
    flow: Flow,
}

impl Leg {
    /// Charges of all basis elements along the leg.
    pub fn charges(&self) -> &[i64] { &self.charges }

    /// Direction of charge flow.
    pub fn flow(&self) -> Flow { self.flow }

    /// Number of basis elements.
    pub fn dim(&self) -> usize { self.charges.len() }

    /// Charges multiplied by the sign of the flow.
    pub fn effective_charges(&self) -> Vec<i64> {
        let s = self.flow.sign();
        self.charges.iter().map(|q| s * q).collect()
    }
}

/// Describes one leg of a block-sparse tensor.
///
/// An `Index` is a nonempty sequence of elementary [`Leg`]s. Indices created
/// with [`Index::new`] have exactly one; fusing two indices concatenates their
/// legs, so fusion is associative and `(a * b) * c == a * (b * c)`.
///
/// The charges of a composite index are the row-major outer sum of its legs'
/// flow-weighted charges (the left-most leg varies slowest), and its flow is
/// always [`Flow::In`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Index {
    legs: Vec<Leg>,
}

impl Index {
    /// Create a new elementary index.
    ///
    /// Fails if `charges` is empty.
    pub fn new<I>(charges: I, flow: Flow) -> BlockResult<Self>
    where I: IntoIterator<Item = i64>
    {
        let charges: Vec<i64> = charges.into_iter().collect();
        if charges.is_empty() {
            return Err(ConstructionError::EmptyCharges.into());
        }
        Ok(Self { legs: vec![Leg { charges, flow }] })
    }

    // `legs` must be nonempty
    pub(crate) fn from_legs(legs: Vec<Leg>) -> Self {
        debug_assert!(!legs.is_empty());
        Self { legs }
    }

    /// Return the elementary legs making up `self`, in order.
    pub fn legs(&self) -> &[Leg] { &self.legs }

    /// Return the number of elementary legs making up `self`.
    pub fn num_legs(&self) -> usize { self.legs.len() }

    /// Return `true` if `self` is not the product of a fusion.
    pub fn is_elementary(&self) -> bool { self.legs.len() == 1 }

    /// Return the number of basis elements along `self`.
    pub fn dim(&self) -> usize { self.legs.iter().map(Leg::dim).product() }

    /// Return the flow of `self`.
    ///
    /// Composite indices always have flow [`Flow::In`], their charges being
    /// already flow-weighted.
    pub fn flow(&self) -> Flow {
        if self.is_elementary() { self.legs[0].flow } else { Flow::In }
    }

    /// Return the charges of all basis elements along `self`.
    ///
    /// For an elementary index these are the charges it was created with. For a
    /// composite index these are the flow-weighted fused charges.
    pub fn charges(&self) -> Vec<i64> {
        if self.is_elementary() {
            self.legs[0].charges.clone()
        } else {
            self.effective_charges()
        }
    }

    /// Return the charges of `self` multiplied by the sign of its flow.
    pub fn effective_charges(&self) -> Vec<i64> {
        fused_effective_charges(self.legs.iter())
    }

    /// Return all distinct effective charges with their degeneracies, sorted
    /// in ascending order of charge.
    pub fn unique_charges(&self) -> Vec<(i64, usize)> {
        self.effective_charges().into_iter()
            .sorted()
            .dedup_with_count()
            .map(|(count, q)| (q, count))
            .collect()
    }

    /// Fuse `self` with `other` into a composite index.
    ///
    /// `self` is the slower-varying factor of the result.
    pub fn fuse(&self, other: &Self) -> Self {
        let legs: Vec<Leg>
            = self.legs.iter().chain(other.legs.iter()).cloned().collect();
        Self { legs }
    }

    /// Undo the last fusion of `self`, returning the index formed by all but
    /// the last leg and the last leg on its own.
    ///
    /// Returns `None` if `self` is elementary.
    pub fn split(&self) -> Option<(Self, Self)> {
        if self.is_elementary() { return None; }
        let (last, rest) = self.legs.split_last()?;
        Some((
            Self { legs: rest.to_vec() },
            Self { legs: vec![last.clone()] },
        ))
    }

    /// Return a copy of `self` with the flow of every leg reversed.
    pub fn flip_flow(&self) -> Self {
        let legs: Vec<Leg>
            = self.legs.iter()
            .map(|leg| Leg { charges: leg.charges.clone(), flow: leg.flow.reversed() })
            .collect();
        Self { legs }
    }
}

// row-major fusion of the flow-weighted charges of a run of legs; an empty run
// fuses to a single element of zero charge
pub(crate) fn fused_effective_charges<'a, I>(legs: I) -> Vec<i64>
where I: IntoIterator<Item = &'a Leg>
{
    legs.into_iter()
        .fold(vec![0], |acc, leg| fuse_charges(&acc, Flow::In, &leg.charges, leg.flow))
}

impl Mul<&Index> for &Index {
    type Output = Index;

    fn mul(self, rhs: &Index) -> Self::Output { self.fuse(rhs) }
}

impl Mul<Index> for Index {
    type Output = Index;

    fn mul(mut self, rhs: Index) -> Self::Output {
        self.legs.extend(rhs.legs);
        self
    }
}

impl Mul<&Index> for Index {
    type Output = Index;

    fn mul(self, rhs: &Index) -> Self::Output { self.fuse(rhs) }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Index {{ dim: {}, flow: {}, legs: [", self.dim(), self.flow())?;
        let n_legs = self.legs.len();
        for (k, leg) in self.legs.iter().enumerate() {
            write!(f, "{}{}", leg.dim(), if leg.flow == Flow::In { "+" } else { "-" })?;
            if k < n_legs - 1 { write!(f, ", ")?; }
        }
        write!(f, "] }}")
    }
}
