//! # Sparsity Pruner
//!
//! A stack of widening feature layers, each scaled by one learned gate in
//! `[0, 1]`. Training pushes gates toward zero through [`SparseStack::regularizer`]
//! and keeps them in range with [`SparseStack::prox`]; [`SparseStack::prune`]
//! then drops every layer whose gate reached zero.

use candle_core::{DType, Device, Tensor, Var};
use tracing::debug;

use crate::error::{LmCrfError, Result};
use crate::sparse::layer::FeatureLayer;

/// Sparsity terms for one stack.
#[derive(Debug, Clone)]
pub struct SparsityPenalty {
    /// Number of strictly positive gates.
    pub nonzero: usize,

    /// Sum of the positive gates (scalar tensor).
    pub l1: Tensor,

    /// `sum(g * (1 - g))` over all gates (scalar tensor).
    pub binary: Tensor,
}

/// Gated layers over a fixed input width.
#[derive(Debug)]
pub struct SparseStack {
    input_dim: usize,
    layers: Vec<Box<dyn FeatureLayer>>,
    gates: Option<Var>,
    frozen: bool,
    pruned: bool,
    device: Device,
}

impl SparseStack {
    /// A stack whose gates start at `gates`, or at 1.0 when `None`.
    ///
    /// Layer `k` must read exactly the width produced by layer `k - 1`.
    pub fn new(
        input_dim: usize,
        layers: Vec<Box<dyn FeatureLayer>>,
        gates: Option<Tensor>,
        frozen: bool,
        device: &Device,
    ) -> Result<Self> {
        let mut width = input_dim;
        for layer in &layers {
            if layer.input_dim() != width {
                return Err(LmCrfError::ShapeMismatch {
                    context: "stacked layer input",
                    expected: width,
                    actual: layer.input_dim(),
                });
            }
            width = layer.output_dim();
        }

        let gates = if layers.is_empty() {
            None
        } else {
            let gates = match gates {
                Some(gates) => gates.to_dtype(DType::F32)?.to_device(device)?,
                None => Tensor::ones(layers.len(), DType::F32, device)?,
            };
            if gates.dims1()? != layers.len() {
                return Err(LmCrfError::ShapeMismatch {
                    context: "gate vector",
                    expected: layers.len(),
                    actual: gates.dims1()?,
                });
            }
            Some(Var::from_tensor(&gates)?)
        };

        Ok(Self {
            input_dim,
            layers,
            gates,
            frozen,
            pruned: false,
            device: device.clone(),
        })
    }

    /// Width of the stack's input.
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Width of the stack's output.
    pub fn output_dim(&self) -> usize {
        self.layers
            .last()
            .map_or(self.input_dim, |layer| layer.output_dim())
    }

    /// Number of remaining layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Stable ids of the remaining layers, in order.
    pub fn layer_ids(&self) -> Vec<usize> {
        self.layers.iter().map(|layer| layer.id()).collect()
    }

    /// Whether [`prune`](Self::prune) already ran.
    pub fn is_pruned(&self) -> bool {
        self.pruned
    }

    /// The gate vector, `None` once every layer was pruned away.
    pub fn gates(&self) -> Option<&Var> {
        self.gates.as_ref()
    }

    /// The gate vector if it should receive gradient updates.
    pub fn trainable_gates(&self) -> Option<&Var> {
        if self.frozen || self.pruned {
            return None;
        }
        self.gates.as_ref()
    }

    /// Current gate values.
    pub fn gate_values(&self) -> Result<Vec<f32>> {
        match &self.gates {
            Some(gates) => Ok(gates.as_tensor().to_vec1::<f32>()?),
            None => Ok(Vec::new()),
        }
    }

    /// Run every layer, scaling its new features by its gate.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let Some(gates) = &self.gates else {
            return Ok(xs.clone());
        };
        let gates = if self.trainable_gates().is_some() {
            gates.as_tensor().clone()
        } else {
            gates.as_tensor().detach()
        };

        let mut xs = xs.clone();
        for (k, layer) in self.layers.iter().enumerate() {
            let gate = gates.narrow(0, k, 1)?;
            xs = layer.forward_gated(&xs, &gate, train)?;
        }
        Ok(xs)
    }

    /// Non-zero gate count, L1 term over positive gates, and the binary penalty.
    pub fn regularizer(&self) -> Result<SparsityPenalty> {
        let Some(gates) = &self.gates else {
            let zero = Tensor::zeros((), DType::F32, &self.device)?;
            return Ok(SparsityPenalty {
                nonzero: 0,
                l1: zero.clone(),
                binary: zero,
            });
        };

        let gates = gates.as_tensor();
        let nonzero = gates.to_vec1::<f32>()?.iter().filter(|&&g| g > 0.0).count();
        let l1 = gates.relu()?.sum_all()?;
        let binary = (gates * gates.affine(-1.0, 1.0)?)?.sum_all()?;
        Ok(SparsityPenalty {
            nonzero,
            l1,
            binary,
        })
    }

    /// Clip every gate into `[0, 1]` and return the number still positive.
    ///
    /// Must run after the optimizer step and before the next forward pass.
    /// A soft-threshold step (subtract the L1 weight before clipping) would
    /// slot in here; only plain clipping is applied.
    pub fn prox(&self) -> Result<usize> {
        let Some(gates) = &self.gates else {
            return Ok(0);
        };
        let clipped = gates.as_tensor().clamp(0f32, 1f32)?;
        gates.set(&clipped)?;
        Ok(clipped.to_vec1::<f32>()?.iter().filter(|&&g| g > 0.0).count())
    }

    /// Drop every layer whose gate is not positive and trim the survivors'
    /// inputs to the surviving features.
    ///
    /// Returns the survival mask over the pre-pruning output positions. When
    /// no layer survives the stack becomes a pass-through over its input.
    /// Gates are frozen afterwards.
    pub fn prune(&mut self) -> Result<Vec<bool>> {
        let values = self.gate_values()?;
        let mut survived = vec![true; self.input_dim];
        let mut kept: Vec<Box<dyn FeatureLayer>> = Vec::with_capacity(self.layers.len());
        let mut kept_gates = Vec::with_capacity(self.layers.len());

        for (mut layer, gate) in std::mem::take(&mut self.layers).into_iter().zip(values) {
            if gate > 0.0 {
                let keep: Vec<u32> = survived
                    .iter()
                    .enumerate()
                    .filter_map(|(position, &alive)| alive.then_some(position as u32))
                    .collect();
                let len = keep.len();
                let keep = Tensor::from_vec(keep, len, &self.device)?;
                layer.prune_inputs(&keep)?;
                survived.extend(std::iter::repeat_n(true, layer.increment()));
                kept_gates.push(gate);
                kept.push(layer);
            } else {
                debug!(layer = layer.id(), gate, "pruned layer");
                survived.extend(std::iter::repeat_n(false, layer.increment()));
            }
        }

        self.gates = if kept.is_empty() {
            None
        } else {
            let len = kept_gates.len();
            Some(Var::from_tensor(&Tensor::from_vec(kept_gates, len, &self.device)?)?)
        };
        self.layers = kept;
        self.pruned = true;

        debug!(
            layers = self.layers.len(),
            output_dim = self.output_dim(),
            "pruned stack"
        );
        Ok(survived)
    }

    /// Named tensors of every remaining layer plus `gates`.
    pub fn tensors(&self) -> Vec<(String, Tensor)> {
        let mut tensors: Vec<(String, Tensor)> =
            self.layers.iter().flat_map(|layer| layer.tensors()).collect();
        if let Some(gates) = &self.gates {
            tensors.push(("gates".to_string(), gates.as_tensor().clone()));
        }
        tensors
    }
}
