use crate::batch::StreamIndex;
use crate::config::SymbolSummary;
use crate::encoder::{ContextEncoder, ContextEncoderConfig, PositionIds};
use crate::recurrent::{masked_embedding, SymbolGru};
use burn::nn::{Embedding, EmbeddingConfig};
use burn::prelude::*;

/// 発音・字形構造・品詞ストリームのエンコーダー
///
/// 記号列 [B*S, L] → 文字ごとの要約 [B*S, H] → [B, S, H] → 浅い文脈エンコーダー
#[derive(Module, Debug)]
pub struct SymbolStreamEncoder<B: Backend> {
    embedding: Embedding<B>,
    gru: Option<SymbolGru<B>>,
    context: Option<ContextEncoder<B>>,
}

impl<B: Backend> SymbolStreamEncoder<B> {
    /// context が None の場合は文字ごとの要約のみ（事前学習用）
    pub fn new(
        symbol_vocab: usize,
        d_model: usize,
        summary: SymbolSummary,
        context: Option<&ContextEncoderConfig>,
        device: &B::Device,
    ) -> Self {
        let gru = match summary {
            SymbolSummary::Recurrent => Some(SymbolGru::new(d_model, d_model, device)),
            SymbolSummary::EmbeddingSum => None,
        };

        Self {
            embedding: EmbeddingConfig::new(symbol_vocab, d_model).init(device),
            gru,
            context: context.map(|config| config.init(device)),
        }
    }

    /// 文字ごとの要約ベクトル [B*S, H]
    pub fn summarize(&self, index: &StreamIndex<B>) -> Tensor<B, 2> {
        let embeds = masked_embedding(&self.embedding, index.idx.clone());

        match &self.gru {
            Some(gru) => gru.forward(embeds, index.lens.clone()),
            None => {
                let [rows, _, hidden] = embeds.dims();
                embeds.sum_dim(1).reshape([rows, hidden])
            }
        }
    }

    /// [B, S, H]
    pub fn forward(
        &self,
        index: &StreamIndex<B>,
        batch_size: usize,
        seq_len: usize,
        mask: Tensor<B, 2>,
    ) -> Tensor<B, 3> {
        let summary = self.summarize(index);
        let [_, hidden] = summary.dims();
        let hiddens = summary.reshape([batch_size, seq_len, hidden]);

        match &self.context {
            Some(context) => context.forward_embeds(hiddens, Some(mask), PositionIds::Absolute),
            None => hiddens,
        }
    }
}
