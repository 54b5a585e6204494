use crate::batch::Batch;
use crate::config::{
    DetectorInput, FusionConfig, GlyphProjection, HeadKind, ResidualSource, StreamKind,
    SymbolSummary,
};
use crate::decoder::{ClassifierHead, OutputDecoder};
use crate::detector::{correct_probability, detection_labels, soft_mask, ErrorDetector};
use crate::encoder::{ContextEncoder, ContextEncoderConfig};
use crate::error::{FusionError, Result};
use crate::fusion::{masked_mean, FusionGate, FusionOutput};
use crate::glyph::{GlyphEncoder, GlyphEncoderConfig, GlyphTable};
use crate::loss::{
    active_cross_entropy, detection_loss, margin_loss, random_permutation, sentence_contrast,
    ActivePositions, LossBreakdown,
};
use crate::streams::SymbolStreamEncoder;
use burn::module::Ignored;
use burn::nn::{Embedding, Linear, LinearConfig};
use burn::prelude::*;
use log::info;

/// forward の出力
///
/// 位置ではなく名前で参照する。loss は tgt_idx がある時のみ。
#[derive(Debug, Clone)]
pub struct SpellOutput<B: Backend> {
    pub loss: Option<LossBreakdown<B>>,
    /// [B, S, V]
    pub logits: Tensor<B, 3>,
    /// 融合（＋ソフトマスク）後の表現 [B, S, H]
    pub hiddens: Tensor<B, 3>,
    /// [B, S, K]（ゲート融合のみ）
    pub gate_weights: Option<Tensor<B, 3>>,
    /// [B, S, 2]（検出器ありのみ）
    pub detect_probs: Option<Tensor<B, 3>>,
    /// [B, S, P]（品詞タグ損失ありのみ）
    pub pos_logits: Option<Tensor<B, 3>>,
}

// ===== 多ストリーム融合による誤字訂正モデル =====

#[derive(Module, Debug)]
pub struct SpellFusionModel<B: Backend> {
    base: ContextEncoder<B>,
    phonetic: Option<SymbolStreamEncoder<B>>,
    glyph: Option<GlyphEncoder<B>>,
    structural: Option<SymbolStreamEncoder<B>>,
    pos: Option<SymbolStreamEncoder<B>>,
    fusion: Option<FusionGate<B>>,
    detector: Option<ErrorDetector<B>>,
    decoder: OutputDecoder<B>,
    head: ClassifierHead<B>,
    pos_classifier: Option<Linear<B>>,
    config: Ignored<FusionConfig>,
}

impl<B: Backend> SpellFusionModel<B> {
    /// 設定エラーはここで返す（forward では起きない）
    pub fn new(config: &FusionConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;

        let hidden = config.hidden_size;
        let layers = |vocab_size: Option<usize>, n_layers: usize| {
            ContextEncoderConfig::new(hidden, config.num_heads, config.d_ff, n_layers)
                .with_vocab_size(vocab_size)
                .with_dropout(config.dropout)
                .with_layer_norm_eps(config.layer_norm_eps)
        };
        let stream_context = layers(None, config.stream_layers);

        let symbol_stream = |kind: StreamKind, summary: SymbolSummary| {
            config.has_stream(kind).then(|| {
                SymbolStreamEncoder::new(
                    config.symbol_vocab(kind),
                    hidden,
                    summary,
                    Some(&stream_context),
                    device,
                )
            })
        };

        let glyph = if config.has_stream(StreamKind::Glyph) {
            let context = match config.glyph_projection {
                GlyphProjection::LayerNorm => None,
                GlyphProjection::Contextual => Some(stream_context.clone()),
            };
            let encoder = GlyphEncoderConfig::new(config.encoder_vocab(), hidden)
                .with_num_fonts(config.num_fonts)
                .with_glyph_size(config.glyph_size)
                .with_image_model_type(config.image_model_type)
                .with_layer_norm_eps(config.layer_norm_eps)
                .with_context(context)
                .init(device)?;
            Some(encoder)
        } else {
            None
        };

        let streams = config.enabled_streams();
        let fusion = (!streams.is_empty()).then(|| {
            FusionGate::new(
                hidden,
                config.num_gates(),
                config.fusion,
                config.gate_activation,
                config.pooled_context,
                device,
            )
        });

        let head = match config.head {
            HeadKind::Linear => ClassifierHead::linear(hidden, config.vocab_size, device),
            HeadKind::MaskedLm => {
                ClassifierHead::masked_lm(hidden, config.vocab_size, config.layer_norm_eps, device)
            }
        };

        info!(
            "モデル構築: ストリーム {:?}, 融合 {:?}, 検出器 {:?}, デコーダー {} 層",
            streams, config.fusion, config.detector, config.decoder_layers
        );

        Ok(Self {
            base: layers(Some(config.encoder_vocab()), config.base_layers).init(device),
            phonetic: symbol_stream(StreamKind::Phonetic, config.phonetic_summary),
            glyph,
            structural: symbol_stream(StreamKind::Structural, SymbolSummary::Recurrent),
            pos: symbol_stream(StreamKind::PartOfSpeech, config.pos_summary),
            fusion,
            detector: config.detector.map(|_| ErrorDetector::new(hidden, device)),
            decoder: OutputDecoder::new(&layers(None, config.decoder_layers), device),
            head,
            pos_classifier: config
                .pos_tagging
                .then(|| LinearConfig::new(hidden, config.pos_vocab).init(device)),
            config: Ignored(config.clone()),
        })
    }

    pub fn is_tied(&self) -> bool {
        self.head.is_tied()
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config.0
    }

    /// 文脈エンコーダーの単語埋め込み
    pub fn word_embeddings(&self) -> Option<&Embedding<B>> {
        self.base.word_embeddings()
    }

    /// 分類器を文脈エンコーダーの単語埋め込みと共有する
    pub fn tie_cls_weight(&mut self) -> Result<()> {
        let embedding = self.base.word_embeddings().ok_or_else(|| {
            FusionError::InvalidConfig("文脈エンコーダーに埋め込み層がありません".to_string())
        })?;
        self.head.tie(embedding.weight.dims())
    }

    /// 凍結字形テーブルの書き込み（forward の前に1回）
    pub fn init_glyph_table(&mut self, table: &GlyphTable) -> Result<()> {
        let glyph = self.glyph.as_mut().ok_or_else(|| {
            FusionError::InvalidConfig("字形ストリームが有効ではありません".to_string())
        })?;
        glyph.init_glyph_table(table)
    }

    pub fn forward(&self, batch: &Batch<B>) -> Result<SpellOutput<B>> {
        self.forward_with_negatives(batch, None)
    }

    /// negatives: 文対照損失の負例の並び（None ならランダム）
    pub fn forward_with_negatives(
        &self,
        batch: &Batch<B>,
        negatives: Option<&[usize]>,
    ) -> Result<SpellOutput<B>> {
        batch.validate()?;
        let config = self.config();
        let [batch_size, seq_len] = batch.dims();
        let mask = batch.masks.clone().float();

        // 1. 各エンコーダー
        let base_hiddens = self.base.forward_ids(batch.src_idx.clone(), Some(mask.clone()))?;

        let mut auxiliaries = Vec::new();
        for kind in config.enabled_streams() {
            let hiddens = match kind {
                StreamKind::Glyph => self
                    .glyph
                    .as_ref()
                    .ok_or(FusionError::MissingBatchKey(kind.key()))?
                    .forward(batch.src_idx.clone(), mask.clone())?,
                _ => self
                    .symbol_stream(kind)
                    .ok_or(FusionError::MissingBatchKey(kind.key()))?
                    .forward(batch.stream(kind)?, batch_size, seq_len, mask.clone()),
            };
            auxiliaries.push(hiddens);
        }

        // 2. 融合
        let FusionOutput { blended, weights } = match &self.fusion {
            Some(fusion) => fusion.forward(base_hiddens.clone(), auxiliaries, mask.clone()),
            None => FusionOutput {
                blended: base_hiddens.clone(),
                weights: None,
            },
        };

        // 3. 誤り検出とソフトマスク
        let (hiddens, detect_probs) = match (&self.detector, config.detector) {
            (Some(detector), Some(source)) => {
                let input = match source {
                    DetectorInput::Base => base_hiddens.clone(),
                    DetectorInput::Blended => blended.clone(),
                };
                let probs = detector.forward(input);
                let masked = soft_mask(blended, correct_probability(probs.clone()));
                (masked, Some(probs))
            }
            _ => (blended, None),
        };

        // 4. 出力デコーダーと分類器
        let residual = match config.residual {
            ResidualSource::None => None,
            ResidualSource::Base => Some(base_hiddens),
            ResidualSource::Blended => Some(hiddens.clone()),
        };
        let sequence_output = self.decoder.forward(hiddens.clone(), mask.clone(), residual);

        let tied = self
            .head
            .is_tied()
            .then(|| self.base.word_embeddings().map(|e| e.weight.val()))
            .flatten();
        let logits = self.head.forward(sequence_output.clone(), tied)?;
        let pos_logits = self
            .pos_classifier
            .as_ref()
            .map(|classifier| classifier.forward(sequence_output));

        // 5. 損失
        let loss = match &batch.tgt_idx {
            Some(tgt_idx) => Some(self.compute_loss(
                batch,
                tgt_idx.clone(),
                &logits,
                &hiddens,
                detect_probs.as_ref(),
                pos_logits.as_ref(),
                mask,
                negatives,
            )?),
            None => None,
        };

        Ok(SpellOutput {
            loss,
            logits,
            hiddens,
            gate_weights: weights,
            detect_probs,
            pos_logits,
        })
    }

    /// 訂正結果のID [B, S]
    pub fn predict(&self, batch: &Batch<B>) -> Result<Tensor<B, 2, Int>> {
        let output = self.forward(batch)?;
        let [batch_size, seq_len, _] = output.logits.dims();
        Ok(output.logits.argmax(2).reshape([batch_size, seq_len]))
    }

    fn symbol_stream(&self, kind: StreamKind) -> Option<&SymbolStreamEncoder<B>> {
        match kind {
            StreamKind::Phonetic => self.phonetic.as_ref(),
            StreamKind::Structural => self.structural.as_ref(),
            StreamKind::PartOfSpeech => self.pos.as_ref(),
            StreamKind::Glyph => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compute_loss(
        &self,
        batch: &Batch<B>,
        tgt_idx: Tensor<B, 2, Int>,
        logits: &Tensor<B, 3>,
        hiddens: &Tensor<B, 3>,
        detect_probs: Option<&Tensor<B, 3>>,
        pos_logits: Option<&Tensor<B, 3>>,
        mask: Tensor<B, 2>,
        negatives: Option<&[usize]>,
    ) -> Result<LossBreakdown<B>> {
        let loss_config = &self.config().loss;
        let active = ActivePositions::from_mask(batch.loss_masks.clone())?;

        let correction = active_cross_entropy(logits.clone(), tgt_idx.clone(), &active);

        let detection = detect_probs.map(|probs| {
            let labels = detection_labels(batch.src_idx.clone(), tgt_idx.clone());
            detection_loss(probs.clone(), labels, &active)
        });

        let margin = loss_config
            .margin
            .map(|policy| {
                margin_loss(
                    policy,
                    active.rows(logits.clone()),
                    active.labels(tgt_idx.clone()),
                    loss_config.top_k,
                )
            })
            .transpose()?;

        let sentence = if loss_config.sentence_contrast_weight > 0.0 {
            let [batch_size, _, _] = hiddens.dims();
            let permutation = match negatives {
                Some(order) => order.to_vec(),
                None => random_permutation(batch_size),
            };
            let pooled = masked_mean(hiddens.clone(), mask);
            Some(sentence_contrast(pooled, &permutation, loss_config.temperature)?)
        } else {
            None
        };

        let pos = match pos_logits {
            Some(pos_logits) => {
                let tags = batch
                    .tgt_pos_idx
                    .clone()
                    .ok_or(FusionError::MissingBatchKey("tgt_pos_idx"))?;
                Some(active_cross_entropy(pos_logits.clone(), tags, &active))
            }
            None => None,
        };

        LossBreakdown::compose(loss_config, correction, detection, margin, sentence, pos)
    }
}
