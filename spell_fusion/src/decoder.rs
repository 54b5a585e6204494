use crate::encoder::{ContextEncoder, ContextEncoderConfig, PositionIds};
use crate::error::{FusionError, Result};
use burn::module::Param;
use burn::nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use log::info;

// ===== 出力デコーダー =====

/// 融合後の表現を浅いTransformerで再文脈化する
///
/// 位置IDは全て0（位置情報は上流のエンコーダーで入っている前提）。
#[derive(Module, Debug)]
pub struct OutputDecoder<B: Backend> {
    stack: Option<ContextEncoder<B>>,
    dropout: Dropout,
}

impl<B: Backend> OutputDecoder<B> {
    /// config.n_layers == 0 なら素通し（dropoutのみ）
    pub fn new(config: &ContextEncoderConfig, device: &B::Device) -> Self {
        let stack = (config.n_layers > 0).then(|| config.init(device));

        Self {
            stack,
            dropout: DropoutConfig::new(config.dropout).init(),
        }
    }

    /// residual があればデコーダー出力に足し戻す
    pub fn forward(
        &self,
        hiddens: Tensor<B, 3>,
        mask: Tensor<B, 2>,
        residual: Option<Tensor<B, 3>>,
    ) -> Tensor<B, 3> {
        let output = match &self.stack {
            Some(stack) => stack.forward_embeds(hiddens, Some(mask), PositionIds::Zeroed),
            None => hiddens,
        };

        let output = match residual {
            Some(residual) => output + residual,
            None => output,
        };

        self.dropout.forward(output)
    }
}

// ===== 分類ヘッド =====

/// MaskedLm ヘッドの変換部: dense + GELU + LayerNorm
#[derive(Module, Debug)]
pub struct HeadTransform<B: Backend> {
    dense: Linear<B>,
    norm: LayerNorm<B>,
}

impl<B: Backend> HeadTransform<B> {
    fn new(hidden: usize, layer_norm_eps: f64, device: &B::Device) -> Self {
        Self {
            dense: LinearConfig::new(hidden, hidden).init(device),
            norm: LayerNormConfig::new(hidden)
                .with_epsilon(layer_norm_eps)
                .init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = burn::tensor::activation::gelu(self.dense.forward(x));
        self.norm.forward(x)
    }
}

/// 隠れ状態 → 語彙ロジット
///
/// projection が None の間は文脈エンコーダーの単語埋め込み（転置）を共有する。
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    transform: Option<HeadTransform<B>>,
    projection: Option<Linear<B>>,
    bias: Param<Tensor<B, 1>>,
    vocab_size: usize,
}

impl<B: Backend> ClassifierHead<B> {
    /// 独立した H → V の線形層
    pub fn linear(hidden: usize, vocab_size: usize, device: &B::Device) -> Self {
        Self {
            transform: None,
            projection: Some(LinearConfig::new(hidden, vocab_size).init(device)),
            bias: Param::from_tensor(Tensor::zeros([vocab_size], device)),
            vocab_size,
        }
    }

    /// 変換 + 独立した線形層（単語埋め込みを持たない事前学習用）
    pub fn transformed(hidden: usize, vocab_size: usize, layer_norm_eps: f64, device: &B::Device) -> Self {
        Self {
            transform: Some(HeadTransform::new(hidden, layer_norm_eps, device)),
            projection: Some(LinearConfig::new(hidden, vocab_size).init(device)),
            bias: Param::from_tensor(Tensor::zeros([vocab_size], device)),
            vocab_size,
        }
    }

    /// 変換 + 共有埋め込み + バイアス（常に共有）
    pub fn masked_lm(hidden: usize, vocab_size: usize, layer_norm_eps: f64, device: &B::Device) -> Self {
        Self {
            transform: Some(HeadTransform::new(hidden, layer_norm_eps, device)),
            projection: None,
            bias: Param::from_tensor(Tensor::zeros([vocab_size], device)),
            vocab_size,
        }
    }

    pub fn is_tied(&self) -> bool {
        self.projection.is_none()
    }

    /// 埋め込み [V_enc, H] と共有する
    pub fn tie(&mut self, embedding_dims: [usize; 2]) -> Result<()> {
        let classifier = match &self.projection {
            Some(projection) => projection.weight.dims(),
            None => {
                let hidden = embedding_dims[1];
                [hidden, self.vocab_size]
            }
        };

        let [vocab_enc, hidden] = embedding_dims;
        if vocab_enc != classifier[1] || hidden != classifier[0] {
            return Err(FusionError::TieShapeMismatch {
                embedding: embedding_dims,
                classifier,
            });
        }

        if self.projection.take().is_some() {
            info!("分類器の重みを単語埋め込みと共有しました: {:?}", embedding_dims);
        }
        Ok(())
    }

    /// hiddens: [B, S, H] → [B, S, V]
    ///
    /// tied: 共有時に使う単語埋め込み [V, H]
    pub fn forward(&self, hiddens: Tensor<B, 3>, tied: Option<Tensor<B, 2>>) -> Result<Tensor<B, 3>> {
        let hiddens = match &self.transform {
            Some(transform) => transform.forward(hiddens),
            None => hiddens,
        };

        if let Some(projection) = &self.projection {
            return Ok(projection.forward(hiddens));
        }

        let embedding = tied.ok_or_else(|| {
            FusionError::InvalidConfig("共有ヘッドに単語埋め込みが渡されていません".to_string())
        })?;

        let [batch_size, seq_len, hidden] = hiddens.dims();
        let logits = hiddens
            .reshape([batch_size * seq_len, hidden])
            .matmul(embedding.transpose())
            + self.bias.val().unsqueeze::<2>();

        Ok(logits.reshape([batch_size, seq_len, self.vocab_size]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn test_decoder_zero_layers_is_identity() {
        let device = Default::default();
        let config = ContextEncoderConfig::new(8, 2, 16, 0).with_dropout(0.0);
        let decoder = OutputDecoder::<TestBackend>::new(&config, &device);

        let hiddens = Tensor::<TestBackend, 3>::random([1, 3, 8], Distribution::Default, &device);
        let mask = Tensor::ones([1, 3], &device);
        let output = decoder.forward(hiddens.clone(), mask, None);

        let diff: f32 = (output - hiddens).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_decoder_residual_shape() {
        let device = Default::default();
        let config = ContextEncoderConfig::new(8, 2, 16, 2).with_dropout(0.0);
        let decoder = OutputDecoder::<TestBackend>::new(&config, &device);

        let hiddens = Tensor::<TestBackend, 3>::random([2, 3, 8], Distribution::Default, &device);
        let mask = Tensor::ones([2, 3], &device);
        let output = decoder.forward(hiddens.clone(), mask, Some(hiddens));
        assert_eq!(output.dims(), [2, 3, 8]);
    }

    #[test]
    fn test_tie_shape_mismatch() {
        let device = Default::default();
        let mut head = ClassifierHead::<TestBackend>::linear(8, 20, &device);

        assert!(matches!(
            head.tie([21, 8]),
            Err(FusionError::TieShapeMismatch { .. })
        ));
        assert!(!head.is_tied());

        head.tie([20, 8]).unwrap();
        assert!(head.is_tied());
        // 共有後は何度呼んでも同じ
        head.tie([20, 8]).unwrap();
    }

    #[test]
    fn test_tied_forward_uses_embedding() {
        let device = Default::default();
        let mut head = ClassifierHead::<TestBackend>::linear(4, 3, &device);
        head.tie([3, 4]).unwrap();

        let hiddens = Tensor::<TestBackend, 3>::from_data([[[1.0, 0.0, 0.0, 0.0]]], &device);
        let embedding = Tensor::<TestBackend, 2>::from_data(
            [[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0], [9.0, 10.0, 11.0, 12.0]],
            &device,
        );

        let logits: Vec<f32> = head
            .forward(hiddens.clone(), Some(embedding))
            .unwrap()
            .to_data()
            .to_vec()
            .unwrap();
        assert_eq!(logits, vec![1.0, 5.0, 9.0]);

        assert!(head.forward(hiddens, None).is_err());
    }

    #[test]
    fn test_masked_lm_head_shape() {
        let device = Default::default();
        let head = ClassifierHead::<TestBackend>::masked_lm(4, 6, 1e-12, &device);
        assert!(head.is_tied());

        let hiddens = Tensor::<TestBackend, 3>::random([2, 3, 4], Distribution::Default, &device);
        let embedding = Tensor::<TestBackend, 2>::random([6, 4], Distribution::Default, &device);
        let logits = head.forward(hiddens, Some(embedding)).unwrap();
        assert_eq!(logits.dims(), [2, 3, 6]);
    }
}
