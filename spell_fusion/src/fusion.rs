use crate::config::{FusionKind, GateActivation};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{sigmoid, softmax};

/// マスク付き平均プーリング
///
/// hiddens: [B, S, H], mask: [B, S] → [B, H]
/// 実トークンが1つもない行はゼロベクトルになる。
pub fn masked_mean<B: Backend>(hiddens: Tensor<B, 3>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch_size, _, hidden] = hiddens.dims();
    let weights = mask.unsqueeze_dim::<3>(2);

    let summed = (hiddens * weights.clone()).sum_dim(1).reshape([batch_size, hidden]);
    let counts = weights.sum_dim(1).reshape([batch_size, 1]).clamp_min(1.0);

    summed / counts
}

/// 融合結果
#[derive(Debug, Clone)]
pub struct FusionOutput<B: Backend> {
    /// [B, S, H]
    pub blended: Tensor<B, 3>,
    /// [B, S, K]（ゲート融合のみ）
    pub weights: Option<Tensor<B, 3>>,
}

/// 文脈表現と補助ストリームを位置ごとに融合する
#[derive(Module, Debug)]
pub struct FusionGate<B: Backend> {
    projection: Linear<B>,
    num_streams: usize,
    gated: bool,
    softmax: bool,
    pooled_context: bool,
}

impl<B: Backend> FusionGate<B> {
    /// num_streams: 文脈表現を含むストリーム数 K
    pub fn new(
        hidden: usize,
        num_streams: usize,
        kind: FusionKind,
        activation: GateActivation,
        pooled_context: bool,
        device: &B::Device,
    ) -> Self {
        let gated = kind == FusionKind::Gate;
        let pooled_context = gated && pooled_context;

        // ゲート: 連結 (+平均) → K、線形統合: 連結 → H
        let d_input = hidden * (num_streams + usize::from(pooled_context));
        let d_output = if gated { num_streams } else { hidden };

        Self {
            projection: LinearConfig::new(d_input, d_output).init(device),
            num_streams,
            gated,
            softmax: activation == GateActivation::Softmax,
            pooled_context,
        }
    }

    /// base: 文脈エンコーダーの出力、auxiliaries: 補助ストリーム（正規順）。全て [B, S, H]
    pub fn forward(
        &self,
        base: Tensor<B, 3>,
        auxiliaries: Vec<Tensor<B, 3>>,
        mask: Tensor<B, 2>,
    ) -> FusionOutput<B> {
        debug_assert_eq!(auxiliaries.len() + 1, self.num_streams);

        let mut streams = Vec::with_capacity(auxiliaries.len() + 1);
        streams.push(base.clone());
        streams.extend(auxiliaries);

        if !self.gated {
            let blended = self.projection.forward(Tensor::cat(streams, 2));
            return FusionOutput {
                blended,
                weights: None,
            };
        }

        let [batch_size, seq_len, hidden] = base.dims();
        let mut inputs = streams.clone();
        if self.pooled_context {
            let pooled = masked_mean(base, mask)
                .unsqueeze_dim::<3>(1)
                .expand([batch_size, seq_len, hidden]);
            inputs.push(pooled);
        }

        let logits = self.projection.forward(Tensor::cat(inputs, 2));
        let weights = if self.softmax {
            softmax(logits, 2)
        } else {
            sigmoid(logits)
        };

        // 平均項はゲートの計算のみに使い、加重和には入れない
        let blended = streams.into_iter().enumerate().fold(
            Tensor::zeros([batch_size, seq_len, hidden], &weights.device()),
            |acc, (k, hiddens)| {
                let gate = weights.clone().slice([0..batch_size, 0..seq_len, k..k + 1]);
                acc + hiddens * gate
            },
        );

        FusionOutput {
            blended,
            weights: Some(weights),
        }
    }
}
