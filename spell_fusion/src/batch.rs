use crate::config::{StreamKind, PAD_ID};
use crate::error::{ensure_shape, FusionError, Result};
use burn::prelude::*;
use burn::tensor::TensorData;
use std::collections::HashMap;

// ===== 外部コラボレーターのインターフェース =====

/// ID → 表層文字の変換
pub trait Tokenizer {
    fn convert_ids_to_tokens(&self, ids: &[usize]) -> Vec<String>;
    fn vocab_size(&self) -> usize;
}

/// 文字列 → 記号ID列（発音・字形構造・品詞）
///
/// 返り値は (各文字の記号ID列, 各文字の真の長さ)。記号ID 0 はパディング。
pub trait StreamConvertor {
    fn convert(&self, tokens: &[String]) -> (Vec<Vec<usize>>, Vec<usize>);
    fn symbol_space_size(&self) -> usize;
}

// ===== バッチ =====

/// 1ストリーム分の記号インデックス
#[derive(Clone, Debug)]
pub struct StreamIndex<B: Backend> {
    /// [B*S, L]
    pub idx: Tensor<B, 2, Int>,
    /// [B*S]
    pub lens: Tensor<B, 1, Int>,
}

impl<B: Backend> StreamIndex<B> {
    /// ホスト上の可変長コード列からパディングして作る
    pub fn from_codes(
        codes: &[Vec<usize>],
        lengths: &[usize],
        device: &B::Device,
    ) -> Result<Self> {
        if codes.len() != lengths.len() {
            return Err(FusionError::ShapeMismatch {
                name: "stream_lens",
                expected: vec![codes.len()],
                actual: vec![lengths.len()],
            });
        }

        let max_len = codes.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let mut flat = Vec::with_capacity(codes.len() * max_len);
        for code in codes {
            flat.extend(code.iter().map(|&symbol| symbol as i64));
            flat.extend(std::iter::repeat(PAD_ID as i64).take(max_len - code.len()));
        }
        let lens: Vec<i64> = codes
            .iter()
            .zip(lengths)
            .map(|(code, &len)| len.min(code.len()) as i64)
            .collect();

        Ok(Self {
            idx: Tensor::from_data(TensorData::new(flat, [codes.len(), max_len]), device),
            lens: Tensor::from_data(TensorData::new(lens, [codes.len()]), device),
        })
    }

    pub fn validate(&self, positions: usize) -> Result<()> {
        let [rows, _] = self.idx.dims();
        ensure_shape("stream_idx", &[positions], &[rows])?;
        ensure_shape("stream_lens", &[positions], &self.lens.dims())
    }
}

/// 前処理済みのバッチ
///
/// 必須: src_idx, masks, loss_masks。tgt_idx は教師ありの時のみ。
/// 記号ストリームは `BatchBuilder::build_batch` で注入してから forward に渡す。
#[derive(Clone, Debug)]
pub struct Batch<B: Backend> {
    pub src_idx: Tensor<B, 2, Int>,
    pub tgt_idx: Option<Tensor<B, 2, Int>>,
    pub masks: Tensor<B, 2, Int>,
    pub loss_masks: Tensor<B, 2, Int>,
    pub streams: HashMap<StreamKind, StreamIndex<B>>,
    pub tgt_pos_idx: Option<Tensor<B, 2, Int>>,
}

impl<B: Backend> Batch<B> {
    pub fn new(
        src_idx: Tensor<B, 2, Int>,
        masks: Tensor<B, 2, Int>,
        loss_masks: Tensor<B, 2, Int>,
    ) -> Result<Self> {
        let dims = src_idx.dims();
        ensure_shape("masks", &dims, &masks.dims())?;
        ensure_shape("loss_masks", &dims, &loss_masks.dims())?;

        Ok(Self {
            src_idx,
            tgt_idx: None,
            masks,
            loss_masks,
            streams: HashMap::new(),
            tgt_pos_idx: None,
        })
    }

    pub fn with_target(mut self, tgt_idx: Tensor<B, 2, Int>) -> Result<Self> {
        ensure_shape("tgt_idx", &self.src_idx.dims(), &tgt_idx.dims())?;
        self.tgt_idx = Some(tgt_idx);
        Ok(self)
    }

    pub fn with_stream(mut self, kind: StreamKind, index: StreamIndex<B>) -> Self {
        self.streams.insert(kind, index);
        self
    }

    /// [B, S]
    pub fn dims(&self) -> [usize; 2] {
        self.src_idx.dims()
    }

    /// 注入済みストリームを取り出す（形状も検証）
    pub fn stream(&self, kind: StreamKind) -> Result<&StreamIndex<B>> {
        let index = self
            .streams
            .get(&kind)
            .ok_or(FusionError::MissingBatchKey(kind.key()))?;
        let [batch_size, seq_len] = self.dims();
        index.validate(batch_size * seq_len)?;
        Ok(index)
    }

    /// 全テンソルが src_idx と位置合わせされているか
    pub fn validate(&self) -> Result<()> {
        let dims = self.dims();
        ensure_shape("masks", &dims, &self.masks.dims())?;
        ensure_shape("loss_masks", &dims, &self.loss_masks.dims())?;
        if let Some(tgt_idx) = &self.tgt_idx {
            ensure_shape("tgt_idx", &dims, &tgt_idx.dims())?;
        }
        if let Some(tgt_pos_idx) = &self.tgt_pos_idx {
            ensure_shape("tgt_pos_idx", &dims, &tgt_pos_idx.dims())?;
        }
        for index in self.streams.values() {
            index.validate(dims[0] * dims[1])?;
        }
        Ok(())
    }
}

/// Int テンソルをホストの usize 列へ
pub(crate) fn to_host_ids<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Result<Vec<usize>> {
    let values = tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| FusionError::TensorData(format!("{:?}", e)))?;
    Ok(values.into_iter().map(|v| v.max(0) as usize).collect())
}

// ===== 前処理 =====

/// 各ストリームの記号インデックスをバッチに注入する
pub struct BatchBuilder {
    tokenizer: Box<dyn Tokenizer>,
    convertors: Vec<(StreamKind, Box<dyn StreamConvertor>)>,
    pos_targets: bool,
}

impl BatchBuilder {
    pub fn new(tokenizer: Box<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            convertors: Vec::new(),
            pos_targets: false,
        }
    }

    pub fn with_convertor(mut self, kind: StreamKind, convertor: Box<dyn StreamConvertor>) -> Self {
        self.convertors.retain(|(existing, _)| *existing != kind);
        self.convertors.push((kind, convertor));
        self
    }

    /// 品詞タグ損失用に tgt_idx の品詞も作る
    pub fn with_pos_targets(mut self, enabled: bool) -> Self {
        self.pos_targets = enabled;
        self
    }

    pub fn symbol_space_size(&self, kind: StreamKind) -> Option<usize> {
        self.convertors
            .iter()
            .find(|(existing, _)| *existing == kind)
            .map(|(_, convertor)| convertor.symbol_space_size())
    }

    pub fn build_batch<B: Backend>(&self, mut batch: Batch<B>) -> Result<Batch<B>> {
        let [batch_size, seq_len] = batch.dims();
        let device = batch.src_idx.device();

        let src_ids = to_host_ids(batch.src_idx.clone())?;
        let tokens = self.tokenizer.convert_ids_to_tokens(&src_ids);
        ensure_shape("tokens", &[src_ids.len()], &[tokens.len()])?;

        for (kind, convertor) in &self.convertors {
            let (codes, lengths) = convertor.convert(&tokens);
            ensure_shape(kind.key(), &[tokens.len()], &[codes.len()])?;
            let index = StreamIndex::from_codes(&codes, &lengths, &device)?;
            batch.streams.insert(*kind, index);
        }

        if self.pos_targets {
            let convertor = self
                .convertors
                .iter()
                .find(|(kind, _)| *kind == StreamKind::PartOfSpeech)
                .map(|(_, convertor)| convertor)
                .ok_or(FusionError::MissingBatchKey(StreamKind::PartOfSpeech.key()))?;

            if let Some(tgt_idx) = &batch.tgt_idx {
                let tgt_ids = to_host_ids(tgt_idx.clone())?;
                let tgt_tokens = self.tokenizer.convert_ids_to_tokens(&tgt_ids);
                let (codes, _) = convertor.convert(&tgt_tokens);
                ensure_shape("tgt_pos_idx", &[tgt_ids.len()], &[codes.len()])?;

                let tags: Vec<i64> = codes
                    .iter()
                    .map(|code| code.first().copied().unwrap_or(PAD_ID) as i64)
                    .collect();
                batch.tgt_pos_idx = Some(Tensor::from_data(
                    TensorData::new(tags, [batch_size, seq_len]),
                    &device,
                ));
            }
        }

        Ok(batch)
    }
}
