use std::collections::HashMap;

use candle_core::{DType, Tensor};
use candle_nn::rnn::{lstm, LSTMConfig, LSTM, RNN};
use candle_nn::{Init, VarBuilder};

use crate::error::{LmCrfError, Result};

/// A feature transform that widens its input by a fixed increment.
///
/// Layers are stacked so that layer `k` sees the input plus the outputs of
/// every earlier layer. Pruning trims a layer's input connections to the
/// surviving feature positions.
pub trait FeatureLayer: std::fmt::Debug + Send + Sync {
    /// Stable id, unchanged by pruning.
    fn id(&self) -> usize;

    /// Width of the features this layer reads.
    fn input_dim(&self) -> usize;

    /// Number of features this layer appends.
    fn increment(&self) -> usize;

    /// Width after this layer.
    fn output_dim(&self) -> usize {
        self.input_dim() + self.increment()
    }

    /// `[.., input_dim]` to `[.., input_dim + increment]`, the new features
    /// scaled by `gate`.
    fn forward_gated(&self, xs: &Tensor, gate: &Tensor, train: bool) -> Result<Tensor>;

    /// Keep only the input columns listed in `keep` (`u32` indices).
    fn prune_inputs(&mut self, keep: &Tensor) -> Result<()>;

    /// Named parameter tensors, for checkpoints.
    fn tensors(&self) -> Vec<(String, Tensor)>;
}

/// A frozen single-layer LSTM over the time axis whose hidden states are
/// concatenated to its input.
#[derive(Debug, Clone)]
pub struct RecurrentUnit {
    id: usize,
    input_dim: usize,
    increment: usize,
    dropout: f32,
    weight_ih: Tensor,
    weight_hh: Tensor,
    bias_ih: Tensor,
    bias_hh: Tensor,
    rnn: LSTM,
}

const WEIGHT_IH: &str = "weight_ih_l0";
const WEIGHT_HH: &str = "weight_hh_l0";
const BIAS_IH: &str = "bias_ih_l0";
const BIAS_HH: &str = "bias_hh_l0";

impl RecurrentUnit {
    /// Load or initialize `weight_ih_l0 (4*increment, input_dim)`,
    /// `weight_hh_l0 (4*increment, increment)` and the two biases under `vb`.
    /// The parameters are detached from any gradient tape.
    pub fn new(
        id: usize,
        input_dim: usize,
        increment: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let gates = 4 * increment;
        let weight_ih = vb
            .get_with_hints((gates, input_dim), WEIGHT_IH, candle_nn::init::DEFAULT_KAIMING_UNIFORM)?
            .detach();
        let weight_hh = vb
            .get_with_hints((gates, increment), WEIGHT_HH, candle_nn::init::DEFAULT_KAIMING_UNIFORM)?
            .detach();
        let bias_ih = vb.get_with_hints(gates, BIAS_IH, Init::Const(0.0))?.detach();
        let bias_hh = vb.get_with_hints(gates, BIAS_HH, Init::Const(0.0))?.detach();
        let rnn = Self::build(input_dim, increment, [&weight_ih, &weight_hh, &bias_ih, &bias_hh])?;
        Ok(Self {
            id,
            input_dim,
            increment,
            dropout,
            weight_ih,
            weight_hh,
            bias_ih,
            bias_hh,
            rnn,
        })
    }

    fn build(input_dim: usize, increment: usize, params: [&Tensor; 4]) -> Result<LSTM> {
        let device = params[0].device().clone();
        let tensors: HashMap<String, Tensor> = [WEIGHT_IH, WEIGHT_HH, BIAS_IH, BIAS_HH]
            .into_iter()
            .zip(params)
            .map(|(name, tensor)| (name.to_string(), tensor.clone()))
            .collect();
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        Ok(lstm(input_dim, increment, LSTMConfig::default(), vb)?)
    }
}

impl FeatureLayer for RecurrentUnit {
    fn id(&self) -> usize {
        self.id
    }

    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn increment(&self) -> usize {
        self.increment
    }

    fn forward_gated(&self, xs: &Tensor, gate: &Tensor, train: bool) -> Result<Tensor> {
        let (_, _, width) = xs.dims3()?;
        if width != self.input_dim {
            return Err(LmCrfError::ShapeMismatch {
                context: "recurrent unit input",
                expected: self.input_dim,
                actual: width,
            });
        }

        let input = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(xs, self.dropout)?
        } else {
            xs.clone()
        };
        // [time, batch, in] -> [batch, time, in] for the LSTM and back
        let states = self.rnn.seq(&input.transpose(0, 1)?.contiguous()?)?;
        let out = self
            .rnn
            .states_to_tensor(&states)?
            .transpose(0, 1)?
            .contiguous()?
            .broadcast_mul(gate)?;
        Ok(Tensor::cat(&[xs, &out], 2)?)
    }

    fn prune_inputs(&mut self, keep: &Tensor) -> Result<()> {
        let weight_ih = self.weight_ih.index_select(keep, 1)?.contiguous()?;
        let input_dim = weight_ih.dim(1)?;
        self.rnn = Self::build(
            input_dim,
            self.increment,
            [&weight_ih, &self.weight_hh, &self.bias_ih, &self.bias_hh],
        )?;
        self.weight_ih = weight_ih;
        self.input_dim = input_dim;
        Ok(())
    }

    fn tensors(&self) -> Vec<(String, Tensor)> {
        [
            (WEIGHT_IH, &self.weight_ih),
            (WEIGHT_HH, &self.weight_hh),
            (BIAS_IH, &self.bias_ih),
            (BIAS_HH, &self.bias_hh),
        ]
        .into_iter()
        .map(|(name, tensor)| (format!("layers.{}.{name}", self.id), tensor.clone()))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use candle_nn::VarMap;

    use super::*;

    fn unit(input_dim: usize, increment: usize) -> RecurrentUnit {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        RecurrentUnit::new(0, input_dim, increment, 0.0, vb).unwrap()
    }

    /// `[time, 1, width]` rows of the output.
    fn rows(out: &Tensor) -> Vec<Vec<f32>> {
        let (time, _, width) = out.dims3().unwrap();
        out.reshape((time, width)).unwrap().to_vec2::<f32>().unwrap()
    }

    #[test]
    fn test_forward_concatenates_gated_states() {
        let layer = unit(2, 3);
        let xs = Tensor::new(&[[[0.5f32, -0.5]], [[1.0, 2.0]]], &Device::Cpu).unwrap();
        let one = Tensor::new(&[1f32], &Device::Cpu).unwrap();
        let half = Tensor::new(&[0.5f32], &Device::Cpu).unwrap();

        let full = layer.forward_gated(&xs, &one, false).unwrap();
        assert_eq!(full.dims(), &[2, 1, 5]);
        let full = rows(&full);
        let halved = rows(&layer.forward_gated(&xs, &half, false).unwrap());

        assert_eq!(&full[0][..2], &[0.5, -0.5]);
        assert_eq!(&full[1][..2], &[1.0, 2.0]);
        for (f, h) in full.iter().zip(&halved) {
            for k in 2..5 {
                assert!((0.5 * f[k] - h[k]).abs() < 1e-6);
                assert!(f[k].abs() < 1.0);
            }
        }
    }

    #[test]
    fn test_earlier_words_reach_later_states() {
        let layer = unit(2, 2);
        let one = Tensor::new(&[1f32], &Device::Cpu).unwrap();
        // two sequences that differ only at t = 0
        let xs = Tensor::new(&[[[1f32, 0.0], [-1.0, 3.0]], [[0.5, 0.5], [0.5, 0.5]]], &Device::Cpu).unwrap();

        let out = layer.forward_gated(&xs, &one, false).unwrap();
        let last = out.get(1).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(&last[0][..2], &last[1][..2]);
        assert_ne!(&last[0][2..], &last[1][2..]);
    }

    #[test]
    fn test_prune_inputs_trims_input_weights_only() {
        let mut layer = unit(3, 1);
        let before: HashMap<String, Tensor> = layer.tensors().into_iter().collect();
        let keep = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        layer.prune_inputs(&keep).unwrap();

        assert_eq!(layer.input_dim(), 2);
        assert_eq!(layer.output_dim(), 3);
        let after: HashMap<String, Tensor> = layer.tensors().into_iter().collect();

        let old_ih = before["layers.0.weight_ih_l0"].to_vec2::<f32>().unwrap();
        let new_ih = after["layers.0.weight_ih_l0"].to_vec2::<f32>().unwrap();
        for (old, new) in old_ih.iter().zip(&new_ih) {
            assert_eq!(new, &vec![old[0], old[2]]);
        }
        assert_eq!(
            after["layers.0.weight_hh_l0"].to_vec2::<f32>().unwrap(),
            before["layers.0.weight_hh_l0"].to_vec2::<f32>().unwrap()
        );

        let xs = Tensor::ones((2, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let gate = Tensor::ones(1, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(layer.forward_gated(&xs, &gate, false).unwrap().dims(), &[2, 1, 3]);
    }

    #[test]
    fn test_rejects_wrong_width() {
        let layer = unit(2, 1);
        let xs = Tensor::zeros((1, 1, 3), DType::F32, &Device::Cpu).unwrap();
        let gate = Tensor::ones(1, DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            layer.forward_gated(&xs, &gate, false),
            Err(LmCrfError::ShapeMismatch { expected: 2, actual: 3, .. })
        ));
    }
}
