use crate::error::{FusionError, Result as FusionResult};
use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear,
    LinearConfig,
};
use burn::prelude::*;

// ===== 共通ヘルパー関数 =====

/// 正弦波位置エンコーディング [seq_len, d_model]
pub fn positional_encoding<B: Backend>(
    seq_len: usize,
    d_model: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let mut data = Vec::with_capacity(seq_len * d_model);

    for pos in 0..seq_len {
        for i in 0..d_model {
            let even = i - i % 2;
            let angle = pos as f32 / 10000_f32.powf(even as f32 / d_model as f32);
            data.push(if i % 2 == 0 { angle.sin() } else { angle.cos() });
        }
    }

    Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([seq_len, d_model])
}

/// 位置IDの扱い
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionIds {
    /// 0..S の絶対位置
    Absolute,
    /// 全位置に位置0を使う（上流で位置情報が入っている前提）
    Zeroed,
}

fn add_positional_encoding<B: Backend>(x: Tensor<B, 3>, positions: PositionIds) -> Tensor<B, 3> {
    let [batch_size, seq_len, d_model] = x.dims();
    let device = x.device();

    let encoding = match positions {
        PositionIds::Absolute => positional_encoding::<B>(seq_len, d_model, &device),
        PositionIds::Zeroed => {
            positional_encoding::<B>(1, d_model, &device).expand([seq_len, d_model])
        }
    };

    x + encoding.unsqueeze::<3>().expand([batch_size, seq_len, d_model])
}

// ===== FeedForward =====

#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    w_1: Linear<B>,
    w_2: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> FeedForward<B> {
    pub fn new(d_model: usize, d_ff: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            w_1: LinearConfig::new(d_model, d_ff).init(device),
            w_2: LinearConfig::new(d_ff, d_model).init(device),
            dropout: DropoutConfig::new(dropout).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self.w_1.forward(x);
        let activated = burn::tensor::activation::gelu(hidden);
        self.dropout.forward(self.w_2.forward(activated))
    }
}

// ===== Multi-Head Self-Attention =====

#[derive(Module, Debug)]
pub struct CustomMultiHeadAttention<B: Backend> {
    w_q: Vec<Linear<B>>,
    w_k: Vec<Linear<B>>,
    w_v: Vec<Linear<B>>,
    w_o: Linear<B>,
    d_head: usize,
}

impl<B: Backend> CustomMultiHeadAttention<B> {
    pub fn new(d_model: usize, n_heads: usize, device: &B::Device) -> Self {
        let d_head = d_model / n_heads;
        let mut w_q = Vec::new();
        let mut w_k = Vec::new();
        let mut w_v = Vec::new();

        for _ in 0..n_heads {
            w_q.push(LinearConfig::new(d_model, d_head).init(device));
            w_k.push(LinearConfig::new(d_model, d_head).init(device));
            w_v.push(LinearConfig::new(d_model, d_head).init(device));
        }

        let w_o = LinearConfig::new(d_head * n_heads, d_model).init(device);

        Self {
            w_q,
            w_k,
            w_v,
            w_o,
            d_head,
        }
    }

    /// mask: [B, S]（1 = 実トークン）
    pub fn forward(&self, x: Tensor<B, 3>, mask: Option<Tensor<B, 2>>) -> Tensor<B, 3> {
        let head_outputs = (0..self.w_q.len())
            .map(|head_idx| self.compute_head(x.clone(), head_idx, mask.clone()))
            .collect();

        self.w_o.forward(Tensor::cat(head_outputs, 2))
    }

    fn compute_head(
        &self,
        x: Tensor<B, 3>,
        head_idx: usize,
        mask: Option<Tensor<B, 2>>,
    ) -> Tensor<B, 3> {
        let q = self.w_q[head_idx].forward(x.clone());
        let k = self.w_k[head_idx].forward(x.clone());
        let v = self.w_v[head_idx].forward(x);

        let scores = q.matmul(k.transpose()) / (self.d_head as f32).sqrt();

        let scores = match mask {
            Some(mask) => {
                let [batch_size, seq_len] = mask.dims();
                // キー方向のマスクを全クエリ行に展開 [B, S, S]
                let key_mask = mask
                    .unsqueeze_dim::<3>(1)
                    .expand([batch_size, seq_len, seq_len]);
                scores.mask_fill(key_mask.equal_elem(0.0), -1e9)
            }
            None => scores,
        };

        let attention_weights = burn::tensor::activation::softmax(scores, 2);
        attention_weights.matmul(v)
    }
}

// ===== Transformer Block =====

#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    attention: CustomMultiHeadAttention<B>,
    feed_forward: FeedForward<B>,
    layer_norm1: LayerNorm<B>,
    layer_norm2: LayerNorm<B>,
    dropout: Dropout,
}

impl<B: Backend> TransformerBlock<B> {
    pub fn new(config: &ContextEncoderConfig, device: &B::Device) -> Self {
        let layer_norm = || {
            LayerNormConfig::new(config.d_model)
                .with_epsilon(config.layer_norm_eps)
                .init(device)
        };

        Self {
            attention: CustomMultiHeadAttention::new(config.d_model, config.n_heads, device),
            feed_forward: FeedForward::new(config.d_model, config.d_ff, config.dropout, device),
            layer_norm1: layer_norm(),
            layer_norm2: layer_norm(),
            dropout: DropoutConfig::new(config.dropout).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, mask: Option<Tensor<B, 2>>) -> Tensor<B, 3> {
        // Pre-LN方式
        let normalized1 = self.layer_norm1.forward(x.clone());
        let attention_output = self.attention.forward(normalized1, mask);
        let residual1 = x + self.dropout.forward(attention_output);

        let normalized2 = self.layer_norm2.forward(residual1.clone());
        residual1 + self.feed_forward.forward(normalized2)
    }
}

// ===== 文脈エンコーダー =====

#[derive(Config, Debug)]
pub struct ContextEncoderConfig {
    /// 埋め込み層の語彙（Noneなら埋め込みを受け取る専用）
    pub vocab_size: Option<usize>,
    pub d_model: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub n_layers: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    #[config(default = 1e-12)]
    pub layer_norm_eps: f64,
}

impl ContextEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ContextEncoder<B> {
        let embedding = self
            .vocab_size
            .map(|vocab_size| EmbeddingConfig::new(vocab_size, self.d_model).init(device));

        let blocks = (0..self.n_layers)
            .map(|_| TransformerBlock::new(self, device))
            .collect();

        let layer_norm = || {
            LayerNormConfig::new(self.d_model)
                .with_epsilon(self.layer_norm_eps)
                .init(device)
        };

        ContextEncoder {
            embedding,
            embed_norm: layer_norm(),
            dropout: DropoutConfig::new(self.dropout).init(),
            blocks,
            final_norm: layer_norm(),
        }
    }
}

/// 位置ごとの文脈表現 [B, S, H] を作るエンコーダー
///
/// 文脈エンコーダー、各ストリームの浅い文脈層、出力デコーダーで共用する。
#[derive(Module, Debug)]
pub struct ContextEncoder<B: Backend> {
    embedding: Option<Embedding<B>>,
    embed_norm: LayerNorm<B>,
    dropout: Dropout,
    blocks: Vec<TransformerBlock<B>>,
    final_norm: LayerNorm<B>,
}

impl<B: Backend> ContextEncoder<B> {
    /// トークンIDから
    pub fn forward_ids(
        &self,
        ids: Tensor<B, 2, Int>,
        mask: Option<Tensor<B, 2>>,
    ) -> FusionResult<Tensor<B, 3>> {
        let embedding = self.embedding.as_ref().ok_or_else(|| {
            FusionError::InvalidConfig("埋め込み層のないエンコーダーにIDを渡しました".to_string())
        })?;

        Ok(self.forward_embeds(embedding.forward(ids), mask, PositionIds::Absolute))
    }

    /// 埋め込み済みの入力から
    pub fn forward_embeds(
        &self,
        embeds: Tensor<B, 3>,
        mask: Option<Tensor<B, 2>>,
        positions: PositionIds,
    ) -> Tensor<B, 3> {
        let x = add_positional_encoding(embeds, positions);
        let mut x = self.dropout.forward(self.embed_norm.forward(x));

        for block in &self.blocks {
            x = block.forward(x, mask.clone());
        }

        self.final_norm.forward(x)
    }

    pub fn word_embeddings(&self) -> Option<&Embedding<B>> {
        self.embedding.as_ref()
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }
}
