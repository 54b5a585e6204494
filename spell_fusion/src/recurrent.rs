use crate::config::PAD_ID;
use burn::nn::gru::{Gru, GruConfig};
use burn::nn::Embedding;
use burn::prelude::*;

/// パディングID（0）の位置をゼロベクトルにした埋め込み
pub fn masked_embedding<B: Backend>(embedding: &Embedding<B>, ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
    let keep = ids.clone().not_equal_elem(PAD_ID as i64).float().unsqueeze_dim::<3>(2);
    embedding.forward(ids) * keep
}

/// 各行の「長さ-1」番目の状態を取り出す
///
/// states: [N, L, H], lengths: [N] → [N, H]
/// 長さ0は先頭（パディング埋め込みを読んだ直後の状態）にクランプする。
pub fn select_last_state<B: Backend>(states: Tensor<B, 3>, lengths: Tensor<B, 1, Int>) -> Tensor<B, 2> {
    let [n, seq_len, hidden] = states.dims();

    let index = lengths
        .sub_scalar(1)
        .clamp(0, seq_len.saturating_sub(1) as i64)
        .reshape([n, 1, 1])
        .expand([n, 1, hidden]);

    states.gather(1, index).reshape([n, hidden])
}

// ===== 一方向GRU（記号列の要約） =====

#[derive(Module, Debug)]
pub struct SymbolGru<B: Backend> {
    gru: Gru<B>,
}

impl<B: Backend> SymbolGru<B> {
    pub fn new(d_input: usize, d_hidden: usize, device: &B::Device) -> Self {
        Self {
            gru: GruConfig::new(d_input, d_hidden, true).init(device),
        }
    }

    /// embeds: [N, L, H] → 各行の最終状態 [N, H]
    ///
    /// 長さ以降のパディングは最終状態に影響しない。
    pub fn forward(&self, embeds: Tensor<B, 3>, lengths: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        let states = self.gru.forward(embeds, None);
        select_last_state(states, lengths)
    }

    /// 全ステップの状態
    pub fn forward_all(&self, embeds: Tensor<B, 3>) -> Tensor<B, 3> {
        self.gru.forward(embeds, None)
    }
}

// ===== 双方向多層GRU（誤り検出器用） =====

#[derive(Module, Debug)]
pub struct BiGruLayer<B: Backend> {
    forward_gru: Gru<B>,
    backward_gru: Gru<B>,
}

impl<B: Backend> BiGruLayer<B> {
    fn new(d_input: usize, d_hidden: usize, device: &B::Device) -> Self {
        Self {
            forward_gru: GruConfig::new(d_input, d_hidden, true).init(device),
            backward_gru: GruConfig::new(d_input, d_hidden, true).init(device),
        }
    }

    fn run(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let forward_states = self.forward_gru.forward(x.clone(), None);
        // 時間方向を反転して読み、元の順に戻す
        let backward_states = self.backward_gru.forward(x.flip([1]), None).flip([1]);
        Tensor::cat(vec![forward_states, backward_states], 2)
    }
}

#[derive(Module, Debug)]
pub struct BiGru<B: Backend> {
    layers: Vec<BiGruLayer<B>>,
}

impl<B: Backend> BiGru<B> {
    pub fn new(d_input: usize, d_hidden: usize, num_layers: usize, device: &B::Device) -> Self {
        let layers = (0..num_layers)
            .map(|i| {
                let d_in = if i == 0 { d_input } else { d_hidden * 2 };
                BiGruLayer::new(d_in, d_hidden, device)
            })
            .collect();

        Self { layers }
    }

    /// x: [B, S, H_in] → [B, S, 2 * H]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.layers.iter().fold(x, |x, layer| layer.run(x))
    }
}
