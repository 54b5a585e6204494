use crate::batch::Batch;
use crate::config::{StreamKind, SymbolSummary, GLYPH_SIZE, HIDDEN_SIZE, NUM_HEADS, NUM_STREAM_LAYERS};
use crate::decoder::ClassifierHead;
use crate::encoder::{ContextEncoder, ContextEncoderConfig, PositionIds};
use crate::error::{FusionError, Result as FusionResult};
use crate::glyph::{GlyphEncoder, GlyphEncoderConfig, GlyphTable};
use crate::loss::{active_cross_entropy, ActivePositions};
use crate::streams::SymbolStreamEncoder;
use burn::nn::{Dropout, DropoutConfig};
use burn::prelude::*;
use log::info;

/// ストリーム単体の事前学習設定
#[derive(Config, Debug)]
pub struct PretrainConfig {
    pub vocab_size: usize,
    pub streams: Vec<StreamKind>,
    #[config(default = "HIDDEN_SIZE")]
    pub hidden_size: usize,
    #[config(default = "NUM_HEADS")]
    pub num_heads: usize,
    #[config(default = "HIDDEN_SIZE * 4")]
    pub d_ff: usize,
    /// 0 なら文字単位（文脈なし）
    #[config(default = "NUM_STREAM_LAYERS")]
    pub context_layers: usize,
    #[config(default = 0)]
    pub phonetic_vocab: usize,
    #[config(default = 0)]
    pub structural_vocab: usize,
    #[config(default = 1)]
    pub num_fonts: usize,
    #[config(default = "GLYPH_SIZE")]
    pub glyph_size: usize,
    #[config(default = 0)]
    pub image_model_type: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    #[config(default = 1e-12)]
    pub layer_norm_eps: f64,
}

/// 事前学習の出力（対象位置のみ）
#[derive(Debug, Clone)]
pub struct PretrainOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    /// [N_active]
    pub predictions: Tensor<B, 1, Int>,
    /// [N_active]
    pub labels: Tensor<B, 1, Int>,
}

/// 正解文字の発音・字形構造・字形信号だけから文字を当てる
///
/// バッチの src_idx に正解文字を置き、ストリームもそれから作っておく。
#[derive(Module, Debug)]
pub struct StreamPretrainModel<B: Backend> {
    phonetic: Option<SymbolStreamEncoder<B>>,
    structural: Option<SymbolStreamEncoder<B>>,
    glyph: Option<GlyphEncoder<B>>,
    context: Option<ContextEncoder<B>>,
    dropout: Dropout,
    head: ClassifierHead<B>,
}

impl<B: Backend> StreamPretrainModel<B> {
    pub fn new(config: &PretrainConfig, device: &B::Device) -> FusionResult<Self> {
        if config.streams.is_empty() || config.streams.contains(&StreamKind::PartOfSpeech) {
            return Err(FusionError::InvalidConfig(
                "事前学習には発音・字形構造・字形のいずれかが必要です".to_string(),
            ));
        }

        let hidden = config.hidden_size;
        let symbol_stream = |kind: StreamKind, symbol_vocab: usize| -> FusionResult<Option<SymbolStreamEncoder<B>>> {
            if !config.streams.contains(&kind) {
                return Ok(None);
            }
            if symbol_vocab < 2 {
                return Err(FusionError::InvalidConfig(format!("{:?} の記号空間が空です", kind)));
            }
            Ok(Some(SymbolStreamEncoder::new(
                symbol_vocab,
                hidden,
                SymbolSummary::Recurrent,
                None,
                device,
            )))
        };

        let glyph = if config.streams.contains(&StreamKind::Glyph) {
            Some(
                GlyphEncoderConfig::new(config.vocab_size, hidden)
                    .with_num_fonts(config.num_fonts)
                    .with_glyph_size(config.glyph_size)
                    .with_image_model_type(config.image_model_type)
                    .init(device)?,
            )
        } else {
            None
        };

        let context = (config.context_layers > 0).then(|| {
            ContextEncoderConfig::new(hidden, config.num_heads, config.d_ff, config.context_layers)
                .with_dropout(config.dropout)
                .with_layer_norm_eps(config.layer_norm_eps)
                .init(device)
        });

        // 文脈ありは MLM 型ヘッド、文字単位は線形層のみ
        let head = match &context {
            Some(_) => ClassifierHead::transformed(hidden, config.vocab_size, config.layer_norm_eps, device),
            None => ClassifierHead::linear(hidden, config.vocab_size, device),
        };

        info!(
            "事前学習モデル構築: ストリーム {:?}, 文脈層 {}",
            config.streams, config.context_layers
        );

        Ok(Self {
            phonetic: symbol_stream(StreamKind::Phonetic, config.phonetic_vocab)?,
            structural: symbol_stream(StreamKind::Structural, config.structural_vocab)?,
            glyph,
            context,
            dropout: DropoutConfig::new(config.dropout).init(),
            head,
        })
    }

    pub fn init_glyph_table(&mut self, table: &GlyphTable) -> FusionResult<()> {
        match self.glyph.as_mut() {
            Some(glyph) => glyph.init_glyph_table(table),
            None => Err(FusionError::InvalidConfig(
                "字形ストリームが有効ではありません".to_string(),
            )),
        }
    }

    pub fn forward(&self, batch: &Batch<B>) -> FusionResult<PretrainOutput<B>> {
        batch.validate()?;
        let [batch_size, seq_len] = batch.dims();
        let positions = batch_size * seq_len;

        // 各ストリームの文字ごとの要約を足し合わせる
        let mut summaries: Vec<Tensor<B, 2>> = Vec::new();
        if let Some(encoder) = &self.phonetic {
            summaries.push(encoder.summarize(batch.stream(StreamKind::Phonetic)?));
        }
        if let Some(encoder) = &self.structural {
            summaries.push(encoder.summarize(batch.stream(StreamKind::Structural)?));
        }
        if let Some(glyph) = &self.glyph {
            summaries.push(glyph.features(batch.src_idx.clone().reshape([positions]))?);
        }

        let summed = summaries
            .into_iter()
            .reduce(|acc, summary| acc + summary)
            .ok_or_else(|| FusionError::InvalidConfig("ストリームがありません".to_string()))?;
        let [_, hidden] = summed.dims();
        let hiddens = summed.reshape([batch_size, seq_len, hidden]);

        let hiddens = match &self.context {
            Some(context) => context.forward_embeds(
                hiddens,
                Some(batch.masks.clone().float()),
                PositionIds::Absolute,
            ),
            None => hiddens,
        };

        let logits = self.head.forward(self.dropout.forward(hiddens), None)?;

        let active = ActivePositions::from_mask(batch.loss_masks.clone())?;
        let loss = active_cross_entropy(logits.clone(), batch.src_idx.clone(), &active);
        let [n_active, _] = active.rows(logits.clone()).dims();
        let predictions = active.rows(logits).argmax(1).reshape([n_active]);

        Ok(PretrainOutput {
            loss,
            predictions,
            labels: active.labels(batch.src_idx.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::StreamIndex;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn small(streams: Vec<StreamKind>) -> PretrainConfig {
        PretrainConfig::new(12, streams)
            .with_hidden_size(8)
            .with_num_heads(2)
            .with_d_ff(16)
            .with_context_layers(1)
            .with_phonetic_vocab(6)
            .with_glyph_size(8)
            .with_dropout(0.0)
    }

    fn batch(device: &<TestBackend as Backend>::Device) -> Batch<TestBackend> {
        let ids = Tensor::<TestBackend, 2, Int>::from_data([[3, 4, 5], [6, 7, 0]], device);
        let masks = Tensor::<TestBackend, 2, Int>::from_data([[1, 1, 1], [1, 1, 0]], device);
        let codes: Vec<Vec<usize>> = (0..6).map(|i| vec![1 + i % 5, 1 + (i + 1) % 5]).collect();
        let lengths = vec![2; 6];

        Batch::new(ids, masks.clone(), masks)
            .unwrap()
            .with_stream(
                StreamKind::Phonetic,
                StreamIndex::from_codes(&codes, &lengths, device).unwrap(),
            )
    }

    #[test]
    fn test_pretrain_outputs_active_positions() {
        let device = Default::default();
        let model = StreamPretrainModel::<TestBackend>::new(&small(vec![StreamKind::Phonetic]), &device).unwrap();

        let output = model.forward(&batch(&device)).unwrap();
        assert_eq!(output.predictions.dims(), [5]);
        assert_eq!(output.labels.dims(), [5]);

        let loss: f32 = output.loss.into_scalar();
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn test_pretrain_with_glyph() {
        let device = Default::default();
        let config = small(vec![StreamKind::Phonetic, StreamKind::Glyph]).with_context_layers(0);
        let mut model = StreamPretrainModel::<TestBackend>::new(&config, &device).unwrap();

        assert!(matches!(
            model.forward(&batch(&device)),
            Err(FusionError::GlyphTableUninitialized)
        ));

        let table = GlyphTable::from_raw(12, 1, 8, (0..12 * 64).map(|i| (i % 7) as f32).collect()).unwrap();
        model.init_glyph_table(&table).unwrap();
        let output = model.forward(&batch(&device)).unwrap();
        assert_eq!(output.predictions.dims(), [5]);
    }

    #[test]
    fn test_pretrain_rejects_pos_stream() {
        let device = Default::default();
        let config = small(vec![StreamKind::PartOfSpeech]);
        assert!(StreamPretrainModel::<TestBackend>::new(&config, &device).is_err());
    }
}
