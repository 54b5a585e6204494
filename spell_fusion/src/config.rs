use crate::error::{FusionError, Result as FusionResult};
use burn::config::Config;
use serde::{Deserialize, Serialize};

// ===== 既定のハイパーパラメーター =====
pub const HIDDEN_SIZE: usize = 768; // 隠れ層の次元
pub const NUM_HEADS: usize = 12; // Attentionのヘッド数
pub const D_FF: usize = HIDDEN_SIZE * 4; // Feed-forward中間層の次元
pub const NUM_BASE_LAYERS: usize = 12; // 文脈エンコーダーの層数
pub const NUM_STREAM_LAYERS: usize = 4; // 補助ストリームの文脈層数
pub const NUM_DECODER_LAYERS: usize = 3; // 出力デコーダーの層数
pub const GLYPH_SIZE: usize = 32; // 字形画像の一辺（ピクセル）
pub const PAD_ID: usize = 0; // 全ストリーム共通のパディングID

// ===== ポリシー列挙型 =====

/// 補助ストリームの種類（ゲートでの並び順もこの順）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamKind {
    Phonetic,
    Glyph,
    Structural,
    PartOfSpeech,
}

impl StreamKind {
    pub const CANONICAL: [StreamKind; 4] = [
        StreamKind::Phonetic,
        StreamKind::Glyph,
        StreamKind::Structural,
        StreamKind::PartOfSpeech,
    ];

    /// バッチ上のキー名
    pub fn key(&self) -> &'static str {
        match self {
            StreamKind::Phonetic => "pho_idx",
            StreamKind::Glyph => "src_idx",
            StreamKind::Structural => "wubi_idx",
            StreamKind::PartOfSpeech => "pos_idx",
        }
    }

    /// 記号列（コード列）を持つストリームか
    pub fn is_symbolic(&self) -> bool {
        !matches!(self, StreamKind::Glyph)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FusionKind {
    /// 位置ごとのスカラーゲートで加重和
    Gate,
    /// 連結してLinearで直接H次元へ
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateActivation {
    Sigmoid,
    Softmax,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolSummary {
    /// GRUの最終状態
    Recurrent,
    /// 記号埋め込みの和
    EmbeddingSum,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorInput {
    Base,
    Blended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResidualSource {
    None,
    Base,
    Blended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadKind {
    Linear,
    MaskedLm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginPolicy {
    /// 生ロジットでのヒンジ
    LogitHinge,
    /// softmax確率の差
    ProbabilityGap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlyphProjection {
    LayerNorm,
    Contextual,
}

// ===== 損失設定 =====

#[derive(Config, Debug)]
pub struct LossConfig {
    /// 訂正損失の重み（検出器あり時、残りは検出損失）
    #[config(default = 0.8)]
    pub alpha: f32,
    /// マージン損失の重み
    #[config(default = 1.0)]
    pub beta: f32,
    #[config(default = 5)]
    pub top_k: usize,
    pub margin: Option<MarginPolicy>,
    /// 文単位対照損失の重み（0で無効）
    #[config(default = 0.0)]
    pub sentence_contrast_weight: f32,
    #[config(default = 0.9)]
    pub temperature: f32,
    /// 品詞タグ損失の重み
    #[config(default = 1.0)]
    pub pos_weight: f32,
}

// ===== モデル設定 =====

#[derive(Config, Debug)]
pub struct FusionConfig {
    pub vocab_size: usize,
    /// 文脈エンコーダーの語彙（未指定ならvocab_size）
    pub encoder_vocab_size: Option<usize>,
    #[config(default = "HIDDEN_SIZE")]
    pub hidden_size: usize,
    #[config(default = "NUM_HEADS")]
    pub num_heads: usize,
    #[config(default = "D_FF")]
    pub d_ff: usize,
    #[config(default = "NUM_BASE_LAYERS")]
    pub base_layers: usize,
    #[config(default = "NUM_STREAM_LAYERS")]
    pub stream_layers: usize,
    #[config(default = "NUM_DECODER_LAYERS")]
    pub decoder_layers: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    #[config(default = 1e-12)]
    pub layer_norm_eps: f64,

    // 補助ストリーム
    #[config(default = "Vec::new()")]
    pub streams: Vec<StreamKind>,
    #[config(default = 0)]
    pub phonetic_vocab: usize,
    #[config(default = 0)]
    pub structural_vocab: usize,
    #[config(default = 0)]
    pub pos_vocab: usize,
    #[config(default = "SymbolSummary::Recurrent")]
    pub phonetic_summary: SymbolSummary,
    /// 品詞は1文字1記号なので埋め込みだけでも足りる
    #[config(default = "SymbolSummary::Recurrent")]
    pub pos_summary: SymbolSummary,

    // 字形
    #[config(default = 1)]
    pub num_fonts: usize,
    #[config(default = "GLYPH_SIZE")]
    pub glyph_size: usize,
    #[config(default = 0)]
    pub image_model_type: usize,
    #[config(default = "GlyphProjection::LayerNorm")]
    pub glyph_projection: GlyphProjection,

    // 融合・検出・出力
    #[config(default = "FusionKind::Gate")]
    pub fusion: FusionKind,
    #[config(default = "GateActivation::Sigmoid")]
    pub gate_activation: GateActivation,
    #[config(default = true)]
    pub pooled_context: bool,
    pub detector: Option<DetectorInput>,
    #[config(default = "ResidualSource::None")]
    pub residual: ResidualSource,
    #[config(default = "HeadKind::Linear")]
    pub head: HeadKind,
    #[config(default = false)]
    pub pos_tagging: bool,

    #[config(default = "LossConfig::new()")]
    pub loss: LossConfig,
}

impl FusionConfig {
    pub fn encoder_vocab(&self) -> usize {
        self.encoder_vocab_size.unwrap_or(self.vocab_size)
    }

    /// 有効なストリームを正規順で返す（重複除去）
    pub fn enabled_streams(&self) -> Vec<StreamKind> {
        StreamKind::CANONICAL
            .into_iter()
            .filter(|kind| self.streams.contains(kind))
            .collect()
    }

    pub fn has_stream(&self, kind: StreamKind) -> bool {
        self.streams.contains(&kind)
    }

    /// ストリームの記号空間サイズ（パディング0を含む）
    pub fn symbol_vocab(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Phonetic => self.phonetic_vocab,
            StreamKind::Structural => self.structural_vocab,
            StreamKind::PartOfSpeech => self.pos_vocab,
            StreamKind::Glyph => 0,
        }
    }

    /// ゲート数 K = 1 + 有効ストリーム数
    pub fn num_gates(&self) -> usize {
        1 + self.enabled_streams().len()
    }

    /// 構築前の整合性チェック
    pub fn validate(&self) -> FusionResult<()> {
        let invalid = |msg: String| Err(FusionError::InvalidConfig(msg));

        if self.vocab_size == 0 || self.hidden_size == 0 {
            return invalid("vocab_size と hidden_size は1以上が必要です".to_string());
        }
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return invalid(format!(
                "hidden_size {} はヘッド数 {} で割り切れません",
                self.hidden_size, self.num_heads
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("dropout {} は [0, 1) の範囲外です", self.dropout));
        }
        for kind in self.enabled_streams() {
            if kind.is_symbolic() && self.symbol_vocab(kind) < 2 {
                return invalid(format!("{:?} ストリームの記号空間が空です", kind));
            }
        }
        if self.has_stream(StreamKind::Glyph) && (self.num_fonts == 0 || self.glyph_size < 4) {
            return invalid("字形ストリームには num_fonts >= 1, glyph_size >= 4 が必要です".into());
        }
        if self.pos_tagging && self.pos_vocab < 2 {
            return invalid("品詞タグ損失には pos_vocab が必要です".to_string());
        }
        if self.head == HeadKind::MaskedLm && self.encoder_vocab() != self.vocab_size {
            return invalid("MaskedLmヘッドは埋め込みと同じ語彙が必要です".to_string());
        }
        if self.residual == ResidualSource::Blended && self.decoder_layers == 0 {
            return invalid("残差接続にはデコーダー層が必要です".to_string());
        }
        if self.detector.is_some() && !(0.0..=1.0).contains(&self.loss.alpha) {
            return invalid(format!("alpha {} は [0, 1] の範囲外です", self.loss.alpha));
        }
        if self.loss.temperature <= 0.0 {
            return invalid("temperature は正の値が必要です".to_string());
        }
        if self.loss.margin.is_some() && self.loss.top_k == 0 {
            return invalid("マージン損失には top_k >= 1 が必要です".to_string());
        }
        Ok(())
    }
}

// ===== 歴史的な構成のプリセット =====

/// 過去の各アーキテクチャを1つの設定値として表現
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preset {
    /// 文脈エンコーダー + 分類器のみ
    Baseline,
    /// 発音ストリームを線形統合
    Phonetic,
    /// 発音 + 字形を線形統合
    PhoneticGlyph,
    /// 発音 + 字形をsigmoidゲートで融合
    GatedPhoneticGlyph,
    /// softmaxゲート
    SoftmaxGated,
    /// MaskedLmヘッド
    GatedPhoneticGlyphMlm,
    /// 字形にも文脈エンコーダーを付ける
    ContextualGlyph,
    /// 品詞ストリーム追加
    GatedPos,
    /// 品詞ストリーム + 品詞タグ損失
    GatedPosTagging,
    /// 字形構造（五筆）ストリーム追加
    GatedStructural,
    /// 文単位の対照損失
    SentenceContrast,
    /// 文脈エンコーダー出力で検出し、ソフトマスク
    SoftMask,
    /// 融合後の表現で検出
    SoftMaskBlended,
    /// 融合後の表現で検出 + 残差
    SoftMaskBlendedResidual,
    /// 構造ストリーム + ソフトマスク
    SoftMaskStructural,
    /// 構造ストリーム + ソフトマスク + マージン損失
    SoftMaskStructuralContrast,
}

impl Preset {
    pub fn config(self, vocab_size: usize) -> FusionConfig {
        use StreamKind::*;
        let base = FusionConfig::new(vocab_size);
        let gated = |streams: Vec<StreamKind>| base.clone().with_streams(streams);

        match self {
            Preset::Baseline => gated(Vec::new()).with_decoder_layers(0),
            Preset::Phonetic => gated(vec![Phonetic])
                .with_fusion(FusionKind::Linear)
                .with_decoder_layers(2),
            Preset::PhoneticGlyph => gated(vec![Phonetic, Glyph])
                .with_fusion(FusionKind::Linear)
                .with_decoder_layers(2),
            Preset::GatedPhoneticGlyph => gated(vec![Phonetic, Glyph]),
            Preset::SoftmaxGated => {
                gated(vec![Phonetic, Glyph]).with_gate_activation(GateActivation::Softmax)
            }
            Preset::GatedPhoneticGlyphMlm => gated(vec![Phonetic, Glyph]).with_head(HeadKind::MaskedLm),
            Preset::ContextualGlyph => {
                gated(vec![Phonetic, Glyph]).with_glyph_projection(GlyphProjection::Contextual)
            }
            Preset::GatedPos => gated(vec![Phonetic, Glyph, PartOfSpeech]),
            Preset::GatedPosTagging => {
                gated(vec![Phonetic, Glyph, PartOfSpeech])
                    .with_pos_tagging(true)
                    .with_pos_summary(SymbolSummary::EmbeddingSum)
            }
            Preset::GatedStructural => gated(vec![Phonetic, Glyph, Structural]),
            Preset::SentenceContrast => gated(vec![Phonetic, Glyph])
                .with_loss(LossConfig::new().with_sentence_contrast_weight(0.1)),
            Preset::SoftMask => gated(vec![Phonetic, Glyph])
                .with_detector(Some(DetectorInput::Base))
                .with_residual(ResidualSource::Base)
                .with_decoder_layers(6),
            Preset::SoftMaskBlended => gated(vec![Phonetic, Glyph])
                .with_detector(Some(DetectorInput::Blended))
                .with_residual(ResidualSource::Blended)
                .with_decoder_layers(6),
            Preset::SoftMaskBlendedResidual => gated(vec![Phonetic, Glyph])
                .with_detector(Some(DetectorInput::Base))
                .with_residual(ResidualSource::Blended)
                .with_decoder_layers(6)
                .with_loss(LossConfig::new().with_alpha(0.0)),
            Preset::SoftMaskStructural => gated(vec![Phonetic, Glyph, Structural])
                .with_detector(Some(DetectorInput::Base))
                .with_residual(ResidualSource::Blended)
                .with_decoder_layers(6)
                .with_loss(LossConfig::new().with_alpha(0.5)),
            Preset::SoftMaskStructuralContrast => gated(vec![Phonetic, Glyph, Structural])
                .with_detector(Some(DetectorInput::Base))
                .with_residual(ResidualSource::Blended)
                .with_decoder_layers(6)
                .with_loss(
                    LossConfig::new()
                        .with_alpha(0.5)
                        .with_margin(Some(MarginPolicy::LogitHinge)),
                ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_streams_canonical_order() {
        let config = FusionConfig::new(30).with_streams(vec![
            StreamKind::Structural,
            StreamKind::Phonetic,
            StreamKind::Glyph,
            StreamKind::Phonetic,
        ]);
        assert_eq!(
            config.enabled_streams(),
            vec![StreamKind::Phonetic, StreamKind::Glyph, StreamKind::Structural]
        );
        assert_eq!(config.num_gates(), 4);
    }

    #[test]
    fn test_validate_rejects_missing_symbol_space() {
        let config = FusionConfig::new(30).with_streams(vec![StreamKind::Phonetic]);
        assert!(matches!(config.validate(), Err(FusionError::InvalidConfig(_))));

        let config = config.with_phonetic_vocab(10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_heads() {
        let config = FusionConfig::new(30).with_hidden_size(10).with_num_heads(3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets() {
        let config = Preset::SoftMaskStructuralContrast.config(100);
        assert_eq!(config.detector, Some(DetectorInput::Base));
        assert_eq!(config.loss.alpha, 0.5);
        assert_eq!(config.loss.top_k, 5);
        assert_eq!(config.loss.margin, Some(MarginPolicy::LogitHinge));
        assert_eq!(config.decoder_layers, 6);

        let config = Preset::SoftMask.config(100);
        assert_eq!(config.loss.alpha, 0.8);
        assert_eq!(config.residual, ResidualSource::Base);

        assert_eq!(Preset::Baseline.config(100).decoder_layers, 0);
        assert_eq!(Preset::SoftmaxGated.config(100).gate_activation, GateActivation::Softmax);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = Preset::GatedPosTagging.config(50).with_pos_vocab(8);
        let json = serde_json::to_string(&config).unwrap();
        let restored: FusionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.enabled_streams(), config.enabled_streams());
        assert!(restored.pos_tagging);
        assert_eq!(restored.pos_summary, SymbolSummary::EmbeddingSum);
        assert_eq!(Preset::GatedPos.config(50).pos_summary, SymbolSummary::Recurrent);
    }
}
