//! Walk through the construction and reshaping of a rank-4 symmetric tensor,
//! then push a batch of vectors through a small condenser layer.

use ndarray as nd;
use num_complex::Complex64 as C64;
use rand::{ Rng, thread_rng };
use block_tensor_net::{
    block_tensor::{ self as bt, BlockResult, BlockSparseTensor },
    condenser::{ Activation, CondenserConfig, CondenserResult, DenseBackend, DenseCondenser },
    index::{ Flow, Index },
};

/// Charges on each leg are drawn from `0..B`
const B: i64 = 4;
/// Bond dimensions on each leg
const DIMS: [usize; 4] = [4, 6, 8, 10];
/// Flows on each leg
const FLOWS: [Flow; 4] = [Flow::In, Flow::Out, Flow::In, Flow::Out];
/// Number of condenser nodes
const NODES: usize = 2;
/// Condenser input dimension
const INPUT_DIM: usize = 64;
/// Condenser batch size
const BATCH: usize = 8;

fn symmetric_tensor() -> BlockResult<()> {
    let mut rng = thread_rng();

    // generate random charges on each leg and wrap them in indices
    let indices: Vec<Index>
        = DIMS.iter().zip(FLOWS)
        .map(|(d, flow)| {
            let charges: Vec<i64> = (0..*d).map(|_| rng.gen_range(0..B)).collect();
            Index::new(charges, flow)
        })
        .collect::<BlockResult<_>>()?;
    for (k, idx) in indices.iter().enumerate() {
        eprintln!("leg {k}: {idx}; charges {:?}", idx.charges());
    }

    let mut a: BlockSparseTensor<C64> = BlockSparseTensor::randn(indices, &mut rng)?;
    eprintln!(
        "random symmetric tensor: shape {:?}, {} of {} elements stored",
        a.shape(), a.num_nonzero(), a.dense_size(),
    );

    // dense reshapes
    let b = bt::reshape(&a, [4, 48, 10])?;
    eprintln!("copy reshaped to {:?}; original still {:?}", b.shape(), a.shape());
    let shape_a = a.shape();
    a.reshape([shape_a[0] * shape_a[1], shape_a[2], shape_a[3]])?;
    eprintln!("reshaped in place to {:?}", a.shape());
    a.reshape(&shape_a)?;
    eprintln!("reshaped back to {:?}", a.shape());

    // sparse reshapes
    let sparse_shape = a.sparse_shape();
    let new_sparse_shape = vec![
        &sparse_shape[0] * &sparse_shape[1],
        sparse_shape[2].clone(),
        sparse_shape[3].clone(),
    ];
    let b = bt::reshape(&a, new_sparse_shape.clone())?;
    eprintln!("copy reshaped to {:?}", b.shape());
    a.reshape(new_sparse_shape)?;
    eprintln!("reshaped in place to {:?}; merged leg {}", a.shape(), a.indices()[0]);
    a.reshape(sparse_shape)?;
    eprintln!("reshaped back to {:?}", a.shape());

    for block in a.blocks(2)?.iter() {
        eprintln!("  block charge {:3}: {:?}", block.charge, block.data.dim());
    }
    Ok(())
}

fn condenser() -> CondenserResult<()> {
    let mut rng = thread_rng();
    let config = CondenserConfig::new(NODES).with_activation(Activation::Relu);
    eprintln!("condenser config: {}", config.to_json()?);
    let layer = DenseCondenser::build(config, INPUT_DIM, DenseBackend, &mut rng)?;
    eprintln!("leg dimension {}, output dimension {}", layer.leg_dim(), layer.output_dim());
    let inputs: nd::Array2<f64>
        = nd::Array2::from_shape_simple_fn((BATCH, INPUT_DIM), || rng.gen::<f64>());
    let outputs = layer.forward(&inputs)?;
    println!("{outputs}");
    Ok(())
}

fn main() {
    if let Err(err) = symmetric_tensor() {
        eprintln!("{err}");
        std::process::exit(1);
    }
    if let Err(err) = condenser() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
