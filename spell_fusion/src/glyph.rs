use crate::batch::to_host_ids;
use crate::encoder::{ContextEncoder, ContextEncoderConfig, PositionIds};
use crate::error::{FusionError, Result as FusionResult};
use crate::recurrent::SymbolGru;
use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{
    BatchNorm, BatchNormConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig, PaddingConfig2d,
};
use burn::prelude::*;
use burn::tensor::{Distribution, ElementConversion, TensorData};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ===== フォント・描画のインターフェース =====

/// フォント記述（パスと繁体字フラグ）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FontDescriptor {
    pub path: PathBuf,
    #[serde(default)]
    pub traditional: bool,
}

impl FontDescriptor {
    pub fn new(path: impl Into<PathBuf>, traditional: bool) -> Self {
        Self {
            path: path.into(),
            traditional,
        }
    }
}

/// フォント一覧をJSONから読み込む
///
/// 形式: `[{"path": "fonts/simhei.ttf", "traditional": false}, ...]`
pub fn load_font_list(path: impl AsRef<Path>) -> FusionResult<Vec<FontDescriptor>> {
    let json = std::fs::read_to_string(path.as_ref())?;
    let fonts: Vec<FontDescriptor> = serde_json::from_str(&json)?;
    if fonts.is_empty() {
        return Err(FusionError::InvalidConfig(format!(
            "フォント一覧が空です: {}",
            path.as_ref().display()
        )));
    }
    info!("フォント一覧読み込み: {} 件", fonts.len());
    Ok(fonts)
}

pub fn save_font_list(fonts: &[FontDescriptor], path: impl AsRef<Path>) -> FusionResult<()> {
    let json = serde_json::to_string_pretty(fonts)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// 1文字分のグレースケール画像（行優先）
#[derive(Clone, Debug, PartialEq)]
pub struct Bitmap {
    pub rows: usize,
    pub cols: usize,
    pub pixels: Vec<f32>,
}

/// フォントのラスタライザ
pub trait GlyphRenderer {
    /// 描画できない文字は None（ゼロ画像になる）
    fn render(&self, font: &FontDescriptor, ch: char) -> Option<Bitmap>;
}

/// 簡体字 → 繁体字の変換
pub trait ScriptConverter {
    fn to_traditional(&self, text: &str) -> String;
}

/// CJK統合漢字（拡張・互換を含む）か
pub fn is_cjk_char(ch: char) -> bool {
    matches!(
        ch as u32,
        0x4E00..=0x9FFF
            | 0x3400..=0x4DBF
            | 0x20000..=0x2A6DF
            | 0x2A700..=0x2B73F
            | 0x2B740..=0x2B81F
            | 0x2B820..=0x2CEAF
            | 0xF900..=0xFAFF
            | 0x2F800..=0x2FA1F
    )
}

// ===== 字形テーブル =====

/// 正規化済みの字形画像 [vocab_size, num_fonts, size, size]
#[derive(Clone, Debug)]
pub struct GlyphTable {
    vocab_size: usize,
    num_fonts: usize,
    size: usize,
    data: Vec<f32>,
}

impl GlyphTable {
    pub fn from_raw(vocab_size: usize, num_fonts: usize, size: usize, data: Vec<f32>) -> FusionResult<Self> {
        let expected = vocab_size * num_fonts * size * size;
        if data.len() != expected {
            return Err(FusionError::GlyphTableShape {
                expected: vec![vocab_size, num_fonts, size, size],
                actual: vec![data.len()],
            });
        }
        Ok(Self {
            vocab_size,
            num_fonts,
            size,
            data,
        })
    }

    pub fn dims(&self) -> [usize; 4] {
        [self.vocab_size, self.num_fonts, self.size, self.size]
    }

    /// 語彙ID の画像（全フォント分）
    pub fn image(&self, id: usize) -> Option<&[f32]> {
        let stride = self.num_fonts * self.size * self.size;
        self.data.get(id * stride..(id + 1) * stride)
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        Tensor::from_data(TensorData::new(self.data.clone(), self.dims()), device)
    }
}

/// 語彙とフォント一覧から字形テーブルを作る
pub struct GlyphTableBuilder<'a> {
    renderer: &'a dyn GlyphRenderer,
    converter: Option<&'a dyn ScriptConverter>,
    size: usize,
    cjk_only: bool,
}

impl<'a> GlyphTableBuilder<'a> {
    pub fn new(renderer: &'a dyn GlyphRenderer, size: usize) -> Self {
        Self {
            renderer,
            converter: None,
            size,
            cjk_only: true,
        }
    }

    pub fn with_converter(mut self, converter: &'a dyn ScriptConverter) -> Self {
        self.converter = Some(converter);
        self
    }

    /// false なら非CJKの1文字も描画する
    pub fn with_cjk_only(mut self, cjk_only: bool) -> Self {
        self.cjk_only = cjk_only;
        self
    }

    pub fn build(&self, vocab: &[String], fonts: &[FontDescriptor]) -> FusionResult<GlyphTable> {
        if fonts.is_empty() {
            return Err(FusionError::InvalidConfig("フォントが1つもありません".to_string()));
        }

        let area = self.size * self.size;
        let mut data = vec![0.0_f32; vocab.len() * fonts.len() * area];

        for (font_idx, font) in fonts.iter().enumerate() {
            let converter = match (font.traditional, self.converter) {
                (true, None) => {
                    return Err(FusionError::InvalidConfig(format!(
                        "繁体字フォント {:?} には変換器が必要です",
                        font.path
                    )))
                }
                (true, Some(converter)) => Some(converter),
                (false, _) => None,
            };

            for (id, token) in vocab.iter().enumerate() {
                let Some(ch) = self.single_char(token) else {
                    continue;
                };
                let ch = match converter {
                    Some(converter) => converter.to_traditional(&ch.to_string()).chars().next().unwrap_or(ch),
                    None => ch,
                };
                if let Some(bitmap) = self.renderer.render(font, ch) {
                    let offset = (id * fonts.len() + font_idx) * area;
                    self.place(&bitmap, &mut data[offset..offset + area]);
                }
            }
        }

        normalize(&mut data);
        info!(
            "字形テーブル構築: 語彙 {} × フォント {} × {}px",
            vocab.len(),
            fonts.len(),
            self.size
        );

        GlyphTable::from_raw(vocab.len(), fonts.len(), self.size, data)
    }

    /// 描画対象の1文字（複数文字トークンは対象外）
    fn single_char(&self, token: &str) -> Option<char> {
        let mut chars = token.chars();
        let ch = chars.next()?;
        if chars.next().is_some() || (self.cjk_only && !is_cjk_char(ch)) {
            return None;
        }
        Some(ch)
    }

    /// size×size に切り取り、小さい画像は中央に配置
    fn place(&self, bitmap: &Bitmap, target: &mut [f32]) {
        let rows = bitmap.rows.min(self.size);
        let cols = bitmap.cols.min(self.size);
        let offset_row = (self.size - rows) / 2;
        let offset_col = (self.size - cols) / 2;

        for r in 0..rows {
            for c in 0..cols {
                if let Some(&pixel) = bitmap.pixels.get(r * bitmap.cols + c) {
                    target[(offset_row + r) * self.size + offset_col + c] = pixel;
                }
            }
        }
    }
}

/// テーブル全体の平均・標準偏差で正規化
fn normalize(data: &mut [f32]) {
    if data.is_empty() {
        return;
    }
    let n = data.len() as f64;
    let mean = data.iter().map(|&v| v as f64).sum::<f64>() / n;
    let variance = data.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();

    let std = if std > 0.0 {
        std
    } else {
        warn!("字形テーブルの標準偏差が0です（全画像が同一）");
        1.0
    };

    for v in data.iter_mut() {
        *v = ((*v as f64 - mean) / std) as f32;
    }
}

// ===== 文字画像用ResNet =====

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    shortcut: Option<Conv2d<B>>,
    shortcut_bn: Option<BatchNorm<B, 2>>,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let conv3x3 = |c_in: usize, s: usize| {
            Conv2dConfig::new([c_in, out_channels], [3, 3])
                .with_stride([s, s])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device)
        };

        let projection = in_channels != out_channels || stride != 1;
        let shortcut = projection.then(|| {
            Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device)
        });

        Self {
            conv1: conv3x3(in_channels, stride),
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv3x3(out_channels, 1),
            bn2: BatchNormConfig::new(out_channels).init(device),
            shortcut,
            shortcut_bn: projection.then(|| BatchNormConfig::new(out_channels).init(device)),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.bn1.forward(self.conv1.forward(x.clone()));
        let out = burn::tensor::activation::relu(out);
        let out = self.bn2.forward(self.conv2.forward(out));

        let identity = match (&self.shortcut, &self.shortcut_bn) {
            (Some(conv), Some(bn)) => bn.forward(conv.forward(x)),
            _ => x,
        };

        burn::tensor::activation::relu(out + identity)
    }
}

/// 文字画像 [N, C, S, S] → 特徴 [N, H]
#[derive(Module, Debug)]
pub struct CharResNet<B: Backend> {
    stem: Conv2d<B>,
    stem_bn: BatchNorm<B, 2>,
    blocks: Vec<ResidualBlock<B>>,
    pool: AdaptiveAvgPool2d,
    fc: Linear<B>,
}

impl<B: Backend> CharResNet<B> {
    /// widths[0] が stem の出力、以降は stride 2 のブロック
    pub fn new(in_channels: usize, widths: &[usize], hidden: usize, device: &B::Device) -> Self {
        let stem_width = widths.first().copied().unwrap_or(hidden);

        let blocks = widths
            .windows(2)
            .map(|pair| ResidualBlock::new(pair[0], pair[1], 2, device))
            .collect();
        let last_width = widths.last().copied().unwrap_or(stem_width);

        Self {
            stem: Conv2dConfig::new([in_channels, stem_width], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            stem_bn: BatchNormConfig::new(stem_width).init(device),
            blocks,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(last_width, hidden).init(device),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem_bn.forward(self.stem.forward(images));
        let mut x = burn::tensor::activation::relu(x);

        for block in &self.blocks {
            x = block.forward(x);
        }

        let [n, channels, _, _] = x.dims();
        let pooled = self.pool.forward(x).reshape([n, channels]);
        self.fc.forward(pooled)
    }
}

/// image_model_type からバックボーンを作る
///
/// 0: 多チャンネル（フォント数）ResNet、1: 単一チャンネルの軽量版
pub fn build_backbone<B: Backend>(
    selector: usize,
    num_fonts: usize,
    hidden: usize,
    device: &B::Device,
) -> FusionResult<CharResNet<B>> {
    match selector {
        0 => Ok(CharResNet::new(num_fonts, &[32, 64, 128, 256], hidden, device)),
        1 if num_fonts == 1 => Ok(CharResNet::new(1, &[16, 32, 64], hidden, device)),
        1 => Err(FusionError::BackboneChannelMismatch {
            backbone: "CharResNetLite",
            channels: num_fonts,
        }),
        other => Err(FusionError::UnsupportedBackbone(other)),
    }
}

// ===== 字形エンコーダー =====

#[derive(Config, Debug)]
pub struct GlyphEncoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    #[config(default = 1)]
    pub num_fonts: usize,
    #[config(default = "crate::config::GLYPH_SIZE")]
    pub glyph_size: usize,
    #[config(default = 0)]
    pub image_model_type: usize,
    #[config(default = 1e-12)]
    pub layer_norm_eps: f64,
    /// 文脈射影（None なら LayerNorm）
    pub context: Option<ContextEncoderConfig>,
}

impl GlyphEncoderConfig {
    /// 未対応のバックボーンはここでエラーになる
    pub fn init<B: Backend>(&self, device: &B::Device) -> FusionResult<GlyphEncoder<B>> {
        let backbone = build_backbone(
            self.image_model_type,
            self.num_fonts,
            self.hidden_size,
            device,
        )?;

        // init_glyph_table までは乱数で埋めておく
        let table = Tensor::random(
            [self.vocab_size, self.num_fonts, self.glyph_size, self.glyph_size],
            Distribution::Default,
            device,
        );

        let (norm, gru, context) = match &self.context {
            None => (
                Some(
                    LayerNormConfig::new(self.hidden_size)
                        .with_epsilon(self.layer_norm_eps)
                        .init(device),
                ),
                None,
                None,
            ),
            Some(config) => (
                None,
                Some(SymbolGru::new(self.hidden_size, self.hidden_size, device)),
                Some(config.init(device)),
            ),
        };

        Ok(GlyphEncoder {
            table: Param::from_tensor(table).set_require_grad(false),
            initialized: Param::from_tensor(Tensor::zeros([1], device)).set_require_grad(false),
            backbone,
            norm,
            gru,
            context,
        })
    }
}

/// 語彙ID → 字形画像 → ResNet → [B, S, H]
#[derive(Module, Debug)]
pub struct GlyphEncoder<B: Backend> {
    /// 凍結された字形テーブル [V, F, S, S]
    table: Param<Tensor<B, 4>>,
    /// 書き込み済みなら1（レコードに保存されるので読み込み後も有効）
    initialized: Param<Tensor<B, 1>>,
    backbone: CharResNet<B>,
    norm: Option<LayerNorm<B>>,
    gru: Option<SymbolGru<B>>,
    context: Option<ContextEncoder<B>>,
}

impl<B: Backend> GlyphEncoder<B> {
    /// 字形テーブルを書き込む（同じテーブルなら何度呼んでも同じ状態）
    pub fn init_glyph_table(&mut self, table: &GlyphTable) -> FusionResult<()> {
        let expected = self.table.dims();
        if table.dims() != expected {
            return Err(FusionError::GlyphTableShape {
                expected: expected.to_vec(),
                actual: table.dims().to_vec(),
            });
        }

        let device = self.table.device();
        self.table = Param::from_tensor(table.to_tensor::<B>(&device)).set_require_grad(false);
        self.initialized = Param::from_tensor(Tensor::ones([1], &device)).set_require_grad(false);
        info!("字形テーブルを初期化しました: {:?}", expected);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.val().into_scalar().elem::<f32>() > 0.5
    }

    /// 語彙ID列 [N] の画像 [N, F, S, S]
    pub fn lookup(&self, ids: Tensor<B, 1, Int>) -> FusionResult<Tensor<B, 4>> {
        if !self.is_initialized() {
            return Err(FusionError::GlyphTableUninitialized);
        }

        let [vocab_size, ..] = self.table.dims();
        let host_ids = to_host_ids(ids.clone())?;
        if let Some(&index) = host_ids.iter().find(|&&id| id >= vocab_size) {
            return Err(FusionError::IndexOutOfRange {
                name: "glyph_ids",
                index,
                bound: vocab_size,
            });
        }
        Ok(self.table.val().select(0, ids))
    }

    /// 文字ごとの特徴 [N, H]（射影前）
    pub fn features(&self, ids: Tensor<B, 1, Int>) -> FusionResult<Tensor<B, 2>> {
        Ok(self.backbone.forward(self.lookup(ids)?))
    }

    /// ids: [B, S] → [B, S, H]
    pub fn forward(&self, ids: Tensor<B, 2, Int>, mask: Tensor<B, 2>) -> FusionResult<Tensor<B, 3>> {
        let [batch_size, seq_len] = ids.dims();
        let features = self.features(ids.reshape([batch_size * seq_len]))?;
        let [_, hidden] = features.dims();

        if let Some(norm) = &self.norm {
            return Ok(norm.forward(features.reshape([batch_size, seq_len, hidden])));
        }

        // 長さ1の系列としてGRUに通し、文脈エンコーダーへ
        let features = match &self.gru {
            Some(gru) => gru.forward_all(features.reshape([batch_size * seq_len, 1, hidden])),
            None => features.reshape([batch_size * seq_len, 1, hidden]),
        };
        let hiddens = features.reshape([batch_size, seq_len, hidden]);

        Ok(match &self.context {
            Some(context) => context.forward_embeds(hiddens, Some(mask), PositionIds::Absolute),
            None => hiddens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    /// コードポイントの下位ビットで市松模様を描く
    struct PatternRenderer;

    impl GlyphRenderer for PatternRenderer {
        fn render(&self, font: &FontDescriptor, ch: char) -> Option<Bitmap> {
            let seed = ch as usize + if font.traditional { 7 } else { 0 };
            let pixels = (0..36).map(|i| ((i + seed) % 3) as f32).collect();
            Some(Bitmap {
                rows: 6,
                cols: 6,
                pixels,
            })
        }
    }

    #[test]
    fn test_font_list_json() {
        let path = std::env::temp_dir().join("spell_fusion_fonts_test.json");
        let fonts = vec![
            FontDescriptor::new("fonts/simhei.ttf", false),
            FontDescriptor::new("fonts/mingliu.ttc", true),
        ];
        save_font_list(&fonts, &path).unwrap();
        assert_eq!(load_font_list(&path).unwrap(), fonts);

        // traditional は省略可
        std::fs::write(&path, r#"[{"path": "fonts/kaiti.ttf"}]"#).unwrap();
        let loaded = load_font_list(&path).unwrap();
        assert!(!loaded[0].traditional);

        std::fs::write(&path, "[]").unwrap();
        assert!(matches!(load_font_list(&path), Err(FusionError::InvalidConfig(_))));
        std::fs::remove_file(&path).ok();
    }

    struct Shift;

    impl ScriptConverter for Shift {
        fn to_traditional(&self, text: &str) -> String {
            text.chars()
                .map(|c| char::from_u32(c as u32 + 1).unwrap_or(c))
                .collect()
        }
    }

    fn vocab() -> Vec<String> {
        ["[PAD]", "中", "文", "a", "##字"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_is_cjk_char() {
        assert!(is_cjk_char('中'));
        assert!(is_cjk_char('\u{3400}'));
        assert!(!is_cjk_char('a'));
        assert!(!is_cjk_char('あ'));
    }

    #[test]
    fn test_table_normalized_globally() {
        let renderer = PatternRenderer;
        let table = GlyphTableBuilder::new(&renderer, 8)
            .build(&vocab(), &[FontDescriptor::new("simhei.ttf", false)])
            .unwrap();
        assert_eq!(table.dims(), [5, 1, 8, 8]);

        let all: Vec<f32> = (0..5).flat_map(|id| table.image(id).unwrap().to_vec()).collect();
        let mean = all.iter().sum::<f32>() / all.len() as f32;
        let var = all.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / all.len() as f32;
        assert!(mean.abs() < 1e-4);
        assert!((var - 1.0).abs() < 1e-3);

        // 複数文字・非CJKはゼロ画像（正規化後は同じ定数）
        assert_eq!(table.image(0), table.image(3));
        assert_eq!(table.image(0), table.image(4));
        assert_ne!(table.image(0), table.image(1));
    }

    #[test]
    fn test_small_bitmap_is_centered() {
        let renderer = PatternRenderer;
        let builder = GlyphTableBuilder::new(&renderer, 8);
        let bitmap = Bitmap {
            rows: 2,
            cols: 2,
            pixels: vec![1.0; 4],
        };
        let mut target = vec![0.0; 64];
        builder.place(&bitmap, &mut target);

        let lit: Vec<usize> = (0..64).filter(|&i| target[i] > 0.0).collect();
        assert_eq!(lit, vec![27, 28, 35, 36]);
    }

    #[test]
    fn test_traditional_font_requires_converter() {
        let renderer = PatternRenderer;
        let fonts = [
            FontDescriptor::new("simhei.ttf", false),
            FontDescriptor::new("simhei.ttf", true),
        ];
        assert!(GlyphTableBuilder::new(&renderer, 8).build(&vocab(), &fonts).is_err());

        let table = GlyphTableBuilder::new(&renderer, 8)
            .with_converter(&Shift)
            .build(&vocab(), &fonts)
            .unwrap();
        assert_eq!(table.dims(), [5, 2, 8, 8]);
    }

    #[test]
    fn test_unsupported_backbone() {
        let device = Default::default();
        let config = GlyphEncoderConfig::new(5, 8).with_image_model_type(7);
        assert!(matches!(
            config.init::<TestBackend>(&device),
            Err(FusionError::UnsupportedBackbone(7))
        ));

        let config = GlyphEncoderConfig::new(5, 8)
            .with_image_model_type(1)
            .with_num_fonts(3);
        assert!(matches!(
            config.init::<TestBackend>(&device),
            Err(FusionError::BackboneChannelMismatch { channels: 3, .. })
        ));
    }

    #[test]
    fn test_lookup_before_init_fails() {
        let device = Default::default();
        let encoder = GlyphEncoderConfig::new(5, 8)
            .with_glyph_size(8)
            .init::<TestBackend>(&device)
            .unwrap();
        let ids = Tensor::<TestBackend, 2, Int>::from_data([[1, 2]], &device);
        let mask = Tensor::<TestBackend, 2>::ones([1, 2], &device);

        assert!(matches!(
            encoder.forward(ids, mask),
            Err(FusionError::GlyphTableUninitialized)
        ));
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let device = Default::default();
        let renderer = PatternRenderer;
        let table = GlyphTableBuilder::new(&renderer, 8)
            .build(&vocab(), &[FontDescriptor::new("simhei.ttf", false)])
            .unwrap();

        let mut encoder = GlyphEncoderConfig::new(5, 8)
            .with_glyph_size(8)
            .init::<TestBackend>(&device)
            .unwrap();
        encoder.init_glyph_table(&table).unwrap();
        encoder.init_glyph_table(&table).unwrap();
        assert!(encoder.is_initialized());

        let ids = Tensor::<TestBackend, 1, Int>::from_data([2, 1, 2], &device);
        let images = encoder.lookup(ids).unwrap();
        let first: Vec<f32> = images.clone().slice([0..1]).to_data().to_vec().unwrap();
        let third: Vec<f32> = images.slice([2..3]).to_data().to_vec().unwrap();
        assert_eq!(first, third);
        assert_eq!(first.as_slice(), table.image(2).unwrap());
    }

    #[test]
    fn test_lookup_rejects_out_of_range_ids() {
        let device = Default::default();
        let mut encoder = GlyphEncoderConfig::new(4, 8)
            .with_glyph_size(8)
            .init::<TestBackend>(&device)
            .unwrap();
        encoder
            .init_glyph_table(&GlyphTable::from_raw(4, 1, 8, vec![0.5; 4 * 64]).unwrap())
            .unwrap();

        let ids = Tensor::<TestBackend, 1, Int>::from_data([1, 6], &device);
        assert!(matches!(
            encoder.features(ids),
            Err(FusionError::IndexOutOfRange { name: "glyph_ids", index: 6, bound: 4 })
        ));
    }

    #[test]
    fn test_initialized_flag_survives_record() {
        let device = Default::default();
        let config = GlyphEncoderConfig::new(5, 8).with_glyph_size(8);
        let table = GlyphTable::from_raw(5, 1, 8, (0..5 * 64).map(|i| (i % 7) as f32).collect()).unwrap();

        let mut encoder = config.init::<TestBackend>(&device).unwrap();
        encoder.init_glyph_table(&table).unwrap();

        // レコードから復元したモデルは再初期化なしで使える
        let restored = config
            .init::<TestBackend>(&device)
            .unwrap()
            .load_record(encoder.into_record());
        assert!(restored.is_initialized());

        let ids = Tensor::<TestBackend, 1, Int>::from_data([3], &device);
        let image: Vec<f32> = restored.lookup(ids).unwrap().to_data().to_vec().unwrap();
        assert_eq!(image.as_slice(), table.image(3).unwrap());
    }

    #[test]
    fn test_table_shape_mismatch() {
        let device = Default::default();
        let mut encoder = GlyphEncoderConfig::new(5, 8)
            .with_glyph_size(8)
            .init::<TestBackend>(&device)
            .unwrap();
        let table = GlyphTable::from_raw(4, 1, 8, vec![0.0; 4 * 64]).unwrap();

        assert!(matches!(
            encoder.init_glyph_table(&table),
            Err(FusionError::GlyphTableShape { .. })
        ));
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let table = GlyphTable::from_raw(5, 1, 8, (0..5 * 64).map(|i| (i % 5) as f32).collect()).unwrap();
        let ids = Tensor::<TestBackend, 2, Int>::from_data([[1, 2, 3], [4, 0, 0]], &device);
        let mask = Tensor::<TestBackend, 2>::ones([2, 3], &device);

        let mut encoder = GlyphEncoderConfig::new(5, 8)
            .with_glyph_size(8)
            .init::<TestBackend>(&device)
            .unwrap();
        encoder.init_glyph_table(&table).unwrap();
        assert_eq!(encoder.forward(ids.clone(), mask.clone()).unwrap().dims(), [2, 3, 8]);

        let context = ContextEncoderConfig::new(8, 2, 16, 1).with_dropout(0.0);
        let mut encoder = GlyphEncoderConfig::new(5, 8)
            .with_glyph_size(8)
            .with_image_model_type(1)
            .with_context(Some(context))
            .init::<TestBackend>(&device)
            .unwrap();
        encoder.init_glyph_table(&table).unwrap();
        assert_eq!(encoder.forward(ids, mask).unwrap().dims(), [2, 3, 8]);
    }
}
