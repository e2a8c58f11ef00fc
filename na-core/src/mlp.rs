//! A dense feed-forward network over a flat parameter vector.
//!
//! Parameters are laid out layer by layer; each layer stores its bias
//! (`out` entries) followed by its kernel (`in x out`, row-major). The
//! final layer has no activation.

use nd::{s, Array, ArrayView, Ix1, Ix2};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::{check_dim, Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Activation {
  Relu,
  Elu,
  Tanh,
  Identity,
}

impl Activation {
  pub fn apply(self, z: f64) -> f64 {
    match self {
      Activation::Relu => z.max(0.0),
      Activation::Elu => if z > 0.0 { z } else { z.exp_m1() },
      Activation::Tanh => z.tanh(),
      Activation::Identity => z,
    }
  }
  pub fn derivative(self, z: f64) -> f64 {
    match self {
      Activation::Relu => if z > 0.0 { 1.0 } else { 0.0 },
      Activation::Elu => if z > 0.0 { 1.0 } else { z.exp() },
      Activation::Tanh => {
        let t = z.tanh();
        1.0 - t * t
      },
      Activation::Identity => 1.0,
    }
  }
}

#[derive(Clone, Debug)]
pub struct Mlp {
  dims: Vec<usize>,
  activation: Activation,
}

#[derive(Copy, Clone, Debug)]
struct Layer {
  input: usize,
  output: usize,
  bias: usize,
  kernel: usize,
}

impl Mlp {
  /// `dims` is `[input, hidden.., output]`.
  pub fn new(dims: Vec<usize>, activation: Activation) -> Result<Mlp> {
    if dims.len() < 2 {
      return Err(Error::invalid("dims", "need at least an input and an output size"));
    }
    if dims.iter().any(|&d| d == 0) {
      return Err(Error::invalid("dims", "layer sizes must be positive"));
    }
    Ok(Mlp { dims, activation, })
  }

  pub fn input_dim(&self) -> usize { self.dims[0] }
  pub fn output_dim(&self) -> usize { self.dims[self.dims.len() - 1] }
  pub fn activation(&self) -> Activation { self.activation }

  pub fn n_params(&self) -> usize {
    self.dims
      .windows(2)
      .map(|w| (w[0] + 1) * w[1])
      .sum()
  }

  fn layers(&self) -> Vec<Layer> {
    let mut offset = 0;
    self.dims
      .windows(2)
      .map(|w| {
        let l = Layer {
          input: w[0],
          output: w[1],
          bias: offset,
          kernel: offset + w[1],
        };
        offset += (w[0] + 1) * w[1];
        l
      })
      .collect()
  }

  /// Zero biases, LeCun-normal kernels.
  pub fn init_params<R>(&self, rng: &mut R) -> Result<Array<f64, Ix1>>
    where R: Rng + ?Sized,
  {
    let mut params = Array::zeros(self.n_params());
    for l in self.layers() {
      let std = 1.0 / (l.input as f64).sqrt();
      let normal = Normal::new(0.0, std)
        .map_err(|e| Error::invalid("dims", e.to_string()))?;
      params
        .slice_mut(s![l.kernel..l.kernel + l.input * l.output])
        .mapv_inplace(|_| normal.sample(rng));
    }
    Ok(params)
  }

  fn check(&self, params: &ArrayView<f64, Ix1>, x: &ArrayView<f64, Ix1>) -> Result<()> {
    check_dim("mlp parameters", self.n_params(), params.len())?;
    check_dim("mlp input", self.input_dim(), x.len())
  }

  fn kernel<'a>(&self, params: &ArrayView<'a, f64, Ix1>, l: &Layer)
    -> Result<ArrayView<'a, f64, Ix2>>
  {
    let flat = params.clone()
      .slice_move(s![l.kernel..l.kernel + l.input * l.output]);
    Ok(flat.into_shape((l.input, l.output))?)
  }

  pub fn forward(&self, params: ArrayView<f64, Ix1>, x: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix1>>
  {
    self.check(&params, &x)?;
    let layers = self.layers();
    let last = layers.len() - 1;

    let mut a = x.to_owned();
    for (i, l) in layers.iter().enumerate() {
      let k = self.kernel(&params, l)?;
      let mut z = k.t().dot(&a);
      z += &params.slice(s![l.bias..l.bias + l.output]);
      if i != last {
        let act = self.activation;
        z.mapv_inplace(|v| act.apply(v));
      }
      a = z;
    }
    Ok(a)
  }

  /// Returns the network output and its Jacobian with respect to the
  /// parameters (`output x n_params`), by backpropagating every output at
  /// once.
  pub fn forward_with_jacobian(&self,
                               params: ArrayView<f64, Ix1>,
                               x: ArrayView<f64, Ix1>)
    -> Result<(Array<f64, Ix1>, Array<f64, Ix2>)>
  {
    self.check(&params, &x)?;
    let layers = self.layers();
    let last = layers.len() - 1;
    let act = self.activation;

    // activations[i] feeds layer i; pre[i] is layer i's pre-activation.
    let mut activations = Vec::with_capacity(layers.len());
    let mut pre = Vec::with_capacity(layers.len());
    let mut a = x.to_owned();
    for (i, l) in layers.iter().enumerate() {
      let k = self.kernel(&params, l)?;
      let mut z = k.t().dot(&a);
      z += &params.slice(s![l.bias..l.bias + l.output]);
      let next = if i != last { z.mapv(|v| act.apply(v)) } else { z.clone() };
      activations.push(a);
      pre.push(z);
      a = next;
    }
    let output = a;

    let c = self.output_dim();
    let mut jac = Array::zeros((c, self.n_params()));
    let mut delta: Array<f64, Ix2> = Array::eye(c);
    for i in (0..layers.len()).rev() {
      let l = &layers[i];
      let input = &activations[i];

      jac.slice_mut(s![.., l.bias..l.bias + l.output])
        .assign(&delta);
      for r in 0..l.input {
        let v = input[r];
        let off = l.kernel + r * l.output;
        let mut block = jac.slice_mut(s![.., off..off + l.output]);
        block.zip_mut_with(&delta, |j, &d| *j = v * d );
      }

      if i > 0 {
        let k = self.kernel(&params, l)?;
        let mut prev = delta.dot(&k.t());
        let dz = pre[i - 1].mapv(|v| act.derivative(v));
        prev *= &dz;
        delta = prev;
      }
    }

    Ok((output, jac))
  }
}
