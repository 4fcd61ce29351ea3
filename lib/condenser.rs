//! A dense layer that condenses an input vector through a chain of rank-3
//! tensor-network nodes.
//!
//! For `num_nodes` nodes, an input of dimension *d*<sup>`num_nodes` + 1</sup>
//! is reshaped into `num_nodes + 1` legs of dimension *d*. Each node then
//! absorbs the last two legs of the running state and emits a single new one,
//! so that after all nodes only a single leg of dimension *d* remains:
//!
//! ```text
//!      xxxxxxxxx
//!      | | |   |
//!      | | 11111
//!      | |   |
//!      | 22222
//!      |   |
//!      33333
//!        |
//!        |
//! ```
//!
//! The resulting vector is offset by an optional bias and passed through an
//! activation function. Only the forward pass is provided.
//!
//! All array operations are delegated to a [`Backend`]; [`DenseBackend`] uses
//! this crate's labelled [`Tensor`] contractions.
//!
//! ```
//! use ndarray as nd;
//! use rand::{ SeedableRng, rngs::StdRng };
//! use block_tensor_net::condenser::*;
//!
//! let mut rng = StdRng::seed_from_u64(10546);
//! let config = CondenserConfig::new(2).with_activation(Activation::Relu);
//! let layer = DenseCondenser::build(config, 27, DenseBackend, &mut rng).unwrap();
//! assert_eq!(layer.leg_dim(), 3);
//!
//! let inputs = nd::Array2::from_shape_fn((5, 27), |(i, j)| (i + j) as f64 / 27.0);
//! let outputs = layer.forward(&inputs).unwrap();
//! assert_eq!(outputs.dim(), (5, 3));
//! assert!(outputs.iter().all(|y| *y >= 0.0));
//! ```

use ndarray::{ self as nd, Ix1 };
use rand::{ Rng, distributions::Distribution };
use serde::{ Serialize, Deserialize };
use statrs::distribution::Normal;
use thiserror::Error;
use crate::tensor::{ DynIdx, Tensor, TensorError };

#[derive(Debug, Error)]
pub enum CondenserError {
    /// Returned when attempting to build a layer with zero nodes.
    #[error("error in condenser creation: num_nodes must be at least 1")]
    InvalidNumNodes,

    /// Returned when the input dimension is not a perfect
    /// `(num_nodes + 1)`-th power.
    #[error("error in condenser: input dimension {input_dim} is not a perfect power for {num_nodes} nodes")]
    IncompatibleInputDim { input_dim: usize, num_nodes: usize },

    /// Returned when a backend is asked to contract axes that don't exist or
    /// have different dimensions.
    #[error("error in backend contraction: invalid axis pair ({0}, {1})")]
    BadContraction(usize, usize),

    #[error("backend tensor error: {0}")]
    BackendTensor(#[from] TensorError),

    #[error("backend reshape error: {0}")]
    Reshape(#[from] nd::ShapeError),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}
use CondenserError::*;
pub type CondenserResult<T> = Result<T, CondenserError>;

/// Element-wise activation applied to the layer's output.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// `a(x) = x`
    #[default]
    Linear,
    /// `a(x) = max(x, 0)`
    Relu,
    /// `a(x) = 1 / (1 + e^-x)`
    Sigmoid,
    /// `a(x) = tanh(x)`
    Tanh,
    /// `a(x) = ln(1 + e^x)`
    Softplus,
}

impl Activation {
    /// Evaluate the activation at `x`.
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Linear => x,
            Self::Relu => x.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
            Self::Softplus => x.exp().ln_1p(),
        }
    }
}

/// Scheme for filling a new weight array.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Initializer {
    /// All zeros.
    Zeros,
    /// All ones.
    Ones,
    /// Uniform on `[-l, l]` with `l = sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform,
    /// Normal with mean 0 and standard deviation
    /// `sqrt(2 / (fan_in + fan_out))`.
    GlorotNormal,
    /// Normal with mean 0 and the given standard deviation.
    RandomNormal { stddev: f64 },
    /// Uniform on `[-limit, limit]`.
    RandomUniform { limit: f64 },
}

// fan-in and fan-out of a weight array; for rank > 2, all leading axes are
// counted as the receptive field
fn fans(shape: &[usize]) -> (f64, f64) {
    match shape {
        [] => (1.0, 1.0),
        [n] => (*n as f64, *n as f64),
        [lead @ .., fan_in, fan_out] => {
            let receptive: usize = lead.iter().product();
            ((fan_in * receptive) as f64, (fan_out * receptive) as f64)
        },
    }
}

fn uniform_array<R>(shape: &[usize], limit: f64, rng: &mut R) -> nd::ArrayD<f64>
where R: Rng + ?Sized
{
    nd::ArrayD::from_shape_simple_fn(shape, || (2.0 * rng.gen::<f64>() - 1.0) * limit)
}

fn normal_array<R>(shape: &[usize], stddev: f64, rng: &mut R) -> nd::ArrayD<f64>
where R: Rng + ?Sized
{
    let normal = Normal::standard();
    nd::ArrayD::from_shape_simple_fn(shape, || stddev * normal.sample(&mut *rng))
}

impl Initializer {
    /// Generate a new array of the given shape.
    pub fn sample<R>(&self, shape: &[usize], rng: &mut R) -> nd::ArrayD<f64>
    where R: Rng + ?Sized
    {
        let (fan_in, fan_out) = fans(shape);
        match *self {
            Self::Zeros => nd::ArrayD::zeros(shape),
            Self::Ones => nd::ArrayD::ones(shape),
            Self::GlorotUniform
                => uniform_array(shape, (6.0 / (fan_in + fan_out)).sqrt(), rng),
            Self::RandomUniform { limit } => uniform_array(shape, limit, rng),
            Self::GlorotNormal
                => normal_array(shape, (2.0 / (fan_in + fan_out)).sqrt(), rng),
            Self::RandomNormal { stddev } => normal_array(shape, stddev, rng),
        }
    }
}

fn default_use_bias() -> bool { true }

fn default_kernel_initializer() -> Initializer { Initializer::GlorotUniform }

fn default_bias_initializer() -> Initializer { Initializer::Zeros }

/// Configuration for a [`DenseCondenser`].
///
/// The layer can be rebuilt (without its weights) from this alone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CondenserConfig {
    /// Number of rank-3 nodes in the chain.
    pub num_nodes: usize,
    /// Whether to add a bias vector to the output.
    #[serde(default = "default_use_bias")]
    pub use_bias: bool,
    /// Activation applied to the output.
    #[serde(default)]
    pub activation: Activation,
    /// Initializer for all nodes.
    #[serde(default = "default_kernel_initializer")]
    pub kernel_initializer: Initializer,
    /// Initializer for the bias vector.
    #[serde(default = "default_bias_initializer")]
    pub bias_initializer: Initializer,
}

impl CondenserConfig {
    /// Create a new configuration with default options.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            use_bias: default_use_bias(),
            activation: Activation::default(),
            kernel_initializer: default_kernel_initializer(),
            bias_initializer: default_bias_initializer(),
        }
    }

    /// Set whether a bias is used.
    pub fn with_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Set the activation.
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Set the node initializer.
    pub fn with_kernel_initializer(mut self, init: Initializer) -> Self {
        self.kernel_initializer = init;
        self
    }

    /// Set the bias initializer.
    pub fn with_bias_initializer(mut self, init: Initializer) -> Self {
        self.bias_initializer = init;
        self
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> CondenserResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from a JSON string.
    ///
    /// Missing optional fields take their default values.
    pub fn from_json(s: &str) -> CondenserResult<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Array operations needed by a [`DenseCondenser`].
pub trait Backend {
    /// Reshape `data` (taken in row-major order) into `shape`.
    fn reshape(&self, data: nd::ArrayD<f64>, shape: &[usize])
        -> CondenserResult<nd::ArrayD<f64>>;

    /// Contract `a` with `b`, summing over each pair of axes `(i, j)` in
    /// `axes`, with `i` an axis of `a` and `j` an axis of `b`.
    ///
    /// The result's axes are the remaining axes of `a` followed by the
    /// remaining axes of `b`, each in their original order.
    fn contract(
        &self,
        a: &nd::ArrayD<f64>,
        b: &nd::ArrayD<f64>,
        axes: &[(usize, usize)],
    ) -> CondenserResult<nd::ArrayD<f64>>;

    /// Generate a new array of the given shape.
    fn random_fill<R>(&self, shape: &[usize], init: Initializer, rng: &mut R)
        -> nd::ArrayD<f64>
    where R: Rng + ?Sized;
}

/// [`Backend`] built on this crate's dense [`Tensor`] type.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DenseBackend;

impl DenseBackend {
    // label the axes of an array, giving the `k`-th contracted axis the shared
    // label `c{k}` and every other axis a label unique to `side`
    fn labels(shape: &[usize], side: &str, contracted: &[usize]) -> Vec<DynIdx> {
        shape.iter().enumerate()
            .map(|(ax, d)| {
                match contracted.iter().position(|c| *c == ax) {
                    Some(k) => DynIdx(format!("c{k}"), *d),
                    None => DynIdx(format!("{side}{ax}"), *d),
                }
            })
            .collect()
    }
}

impl Backend for DenseBackend {
    fn reshape(&self, data: nd::ArrayD<f64>, shape: &[usize])
        -> CondenserResult<nd::ArrayD<f64>>
    {
        let elems: Vec<f64> = data.iter().copied().collect();
        Ok(nd::ArrayD::from_shape_vec(shape, elems)?)
    }

    fn contract(
        &self,
        a: &nd::ArrayD<f64>,
        b: &nd::ArrayD<f64>,
        axes: &[(usize, usize)],
    ) -> CondenserResult<nd::ArrayD<f64>>
    {
        for (i, j) in axes.iter().copied() {
            let valid
                = i < a.ndim() && j < b.ndim()
                && a.shape()[i] == b.shape()[j];
            if !valid { return Err(BadContraction(i, j)); }
        }
        let (axes_a, axes_b): (Vec<usize>, Vec<usize>) = axes.iter().copied().unzip();
        let ta = Tensor::from_array(Self::labels(a.shape(), "a", &axes_a), a.clone())?;
        let tb = Tensor::from_array(Self::labels(b.shape(), "b", &axes_b), b.clone())?;
        let tc: Tensor<DynIdx, f64> = ta.contract(tb)?;
        Ok(tc.into_array())
    }

    fn random_fill<R>(&self, shape: &[usize], init: Initializer, rng: &mut R)
        -> nd::ArrayD<f64>
    where R: Rng + ?Sized
    {
        init.sample(shape, rng)
    }
}

/// Condenses vectors of dimension `leg_dim^(num_nodes + 1)` down to
/// `leg_dim` through a chain of rank-3 nodes.
///
/// See the [module-level documentation][self] for details.
#[derive(Clone, Debug)]
pub struct DenseCondenser<B = DenseBackend> {
    config: CondenserConfig,
    backend: B,
    leg_dim: usize,
    nodes: Vec<nd::ArrayD<f64>>,
    bias: Option<nd::Array1<f64>>,
}

impl<B> DenseCondenser<B>
where B: Backend
{
    /// Create a new layer for inputs of dimension `input_dim`, initializing
    /// all weights from `rng`.
    ///
    /// Fails if `config.num_nodes` is zero or if `input_dim` is not a perfect
    /// `(num_nodes + 1)`-th power.
    pub fn build<R>(
        config: CondenserConfig,
        input_dim: usize,
        backend: B,
        rng: &mut R,
    ) -> CondenserResult<Self>
    where R: Rng + ?Sized
    {
        let num_nodes = config.num_nodes;
        if num_nodes == 0 { return Err(InvalidNumNodes); }
        let num_legs = num_nodes + 1;
        let leg_dim = (input_dim as f64).powf(1.0 / num_legs as f64).round() as usize;
        let exact
            = u32::try_from(num_legs).ok()
            .and_then(|n| leg_dim.checked_pow(n))
            .is_some_and(|total| leg_dim > 0 && total == input_dim);
        if !exact { return Err(IncompatibleInputDim { input_dim, num_nodes }); }

        let node_shape = [leg_dim, leg_dim, leg_dim];
        let nodes: Vec<nd::ArrayD<f64>>
            = (0..num_nodes)
            .map(|_| backend.random_fill(&node_shape, config.kernel_initializer, &mut *rng))
            .collect();
        let bias: Option<nd::Array1<f64>>
            = if config.use_bias {
                let b = backend.random_fill(&[leg_dim], config.bias_initializer, rng);
                Some(b.into_dimensionality::<Ix1>()?)
            } else {
                None
            };
        Ok(Self { config, backend, leg_dim, nodes, bias })
    }

    /// Return the layer's configuration.
    pub fn config(&self) -> &CondenserConfig { &self.config }

    /// Return the dimension of every leg in the chain.
    pub fn leg_dim(&self) -> usize { self.leg_dim }

    /// Return the expected input dimension.
    pub fn input_dim(&self) -> usize { self.leg_dim.pow(self.num_legs() as u32) }

    /// Return the output dimension (equal to the leg dimension).
    pub fn output_dim(&self) -> usize { self.leg_dim }

    /// Return the weights of all nodes, in contraction order.
    pub fn nodes(&self) -> &[nd::ArrayD<f64>] { &self.nodes }

    /// Return the bias vector, if there is one.
    pub fn bias(&self) -> Option<&nd::Array1<f64>> { self.bias.as_ref() }

    /// Return the output shape for a batch of `batch` inputs.
    pub fn compute_output_shape(&self, batch: usize) -> (usize, usize) {
        (batch, self.output_dim())
    }

    fn num_legs(&self) -> usize { self.config.num_nodes + 1 }

    fn forward_single(&self, x: nd::ArrayView1<f64>)
        -> CondenserResult<nd::Array1<f64>>
    {
        let shape: Vec<usize> = vec![self.leg_dim; self.num_legs()];
        let mut state = self.backend.reshape(x.to_owned().into_dyn(), &shape)?;
        for node in self.nodes.iter() {
            let rank = state.ndim();
            state = self.backend.contract(&state, node, &[(rank - 1, 0), (rank - 2, 1)])?;
        }
        let mut out: nd::Array1<f64>
            = self.backend.reshape(state, &[self.leg_dim])?
            .into_dimensionality::<Ix1>()?;
        if let Some(bias) = &self.bias {
            out += bias;
        }
        let activation = self.config.activation;
        out.mapv_inplace(|y| activation.apply(y));
        Ok(out)
    }

    /// Apply the layer to a batch of inputs, one per row.
    ///
    /// Fails if the number of columns isn't [`Self::input_dim`].
    pub fn forward(&self, inputs: &nd::Array2<f64>)
        -> CondenserResult<nd::Array2<f64>>
    {
        let input_dim = inputs.ncols();
        if input_dim != self.input_dim() {
            return Err(IncompatibleInputDim {
                input_dim,
                num_nodes: self.config.num_nodes,
            });
        }
        let mut outputs: nd::Array2<f64>
            = nd::Array2::zeros(self.compute_output_shape(inputs.nrows()));
        for (x, mut y) in inputs.outer_iter().zip(outputs.outer_iter_mut()) {
            y.assign(&self.forward_single(x)?);
        }
        Ok(outputs)
    }
}
