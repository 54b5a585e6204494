use crate::batch::to_host_ids;
use crate::config::{LossConfig, MarginPolicy};
use crate::error::{FusionError, Result};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::{relu, softmax};
use burn::tensor::ElementConversion;
use log::debug;
use rand::seq::SliceRandom;

// ===== 対象位置 =====

/// loss_masks == 1 の位置（平坦化したインデックス）
#[derive(Clone, Debug)]
pub struct ActivePositions<B: Backend> {
    index: Tensor<B, 1, Int>,
    count: usize,
}

impl<B: Backend> ActivePositions<B> {
    /// 対象位置が1つもなければ EmptyActiveSet
    pub fn from_mask(loss_masks: Tensor<B, 2, Int>) -> Result<Self> {
        let device = loss_masks.device();
        let flags = to_host_ids(loss_masks)?;
        let positions: Vec<i64> = flags
            .iter()
            .enumerate()
            .filter(|(_, &flag)| flag == 1)
            .map(|(i, _)| i as i64)
            .collect();

        if positions.is_empty() {
            return Err(FusionError::EmptyActiveSet);
        }

        Ok(Self {
            count: positions.len(),
            index: Tensor::from_data(positions.as_slice(), &device),
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// [B, S, C] → 対象位置の行 [N_active, C]
    pub fn rows(&self, x: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch_size, seq_len, channels] = x.dims();
        x.reshape([batch_size * seq_len, channels])
            .select(0, self.index.clone())
    }

    /// [B, S] → [N_active]
    pub fn labels(&self, labels: Tensor<B, 2, Int>) -> Tensor<B, 1, Int> {
        let [batch_size, seq_len] = labels.dims();
        labels
            .reshape([batch_size * seq_len])
            .select(0, self.index.clone())
    }
}

// ===== 各損失項 =====

/// 平均交差エントロピー（logits: [N, C], labels: [N]）
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let loss = CrossEntropyLossConfig::new().init(&logits.device());
    loss.forward(logits, labels)
}

/// 対象位置のみの交差エントロピー
pub fn active_cross_entropy<B: Backend>(
    logits: Tensor<B, 3>,
    labels: Tensor<B, 2, Int>,
    active: &ActivePositions<B>,
) -> Tensor<B, 1> {
    cross_entropy(active.rows(logits), active.labels(labels))
}

/// 検出損失: sigmoid済みの2チャンネル出力をそのままロジットとして交差エントロピー
pub fn detection_loss<B: Backend>(
    detect_probs: Tensor<B, 3>,
    detect_labels: Tensor<B, 2, Int>,
    active: &ActivePositions<B>,
) -> Tensor<B, 1> {
    active_cross_entropy(detect_probs, detect_labels, active)
}

/// L2正規化（最後の次元）
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-12);
    x / norm
}

/// バッチ内シャッフルで負例を作る置換
pub fn random_permutation(n: usize) -> Vec<usize> {
    let mut permutation: Vec<usize> = (0..n).collect();
    permutation.shuffle(&mut rand::rng());
    permutation
}

/// 文単位のInfoNCE
///
/// sentences: [B, H]（プーリング済み）。負例は permutation で並べ替えたバッチ。
/// 類似度 / temperature を、恒等置換を正解として交差エントロピー。
pub fn sentence_contrast<B: Backend>(
    sentences: Tensor<B, 2>,
    permutation: &[usize],
    temperature: f32,
) -> Result<Tensor<B, 1>> {
    let [batch_size, _] = sentences.dims();
    if permutation.len() != batch_size {
        return Err(FusionError::ShapeMismatch {
            name: "permutation",
            expected: vec![batch_size],
            actual: vec![permutation.len()],
        });
    }
    if let Some(&index) = permutation.iter().find(|&&i| i >= batch_size) {
        return Err(FusionError::IndexOutOfRange {
            name: "permutation",
            index,
            bound: batch_size,
        });
    }

    let device = sentences.device();
    let order: Vec<i64> = permutation.iter().map(|&i| i as i64).collect();
    let negatives = sentences
        .clone()
        .select(0, Tensor::from_data(order.as_slice(), &device));

    let anchors = l2_normalize(sentences);
    let negatives = l2_normalize(negatives);
    let logits = anchors.matmul(negatives.transpose()) / temperature;

    let targets = Tensor::arange(0..batch_size as i64, &device);
    Ok(cross_entropy(logits, targets))
}

/// 正解ロジットと上位K候補のヒンジ: mean(relu(top_k - gold))
///
/// 上位K候補が正解自身でも除外しない。
pub fn logit_hinge_margin<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
    top_k: usize,
) -> Tensor<B, 1> {
    let [n, vocab_size] = logits.dims();
    let k = top_k.min(vocab_size);

    let gold = logits.clone().gather(1, labels.reshape([n, 1]));
    let (top_values, _) = logits.topk_with_indices(k, 1);

    relu(top_values - gold).mean()
}

/// softmax確率の差: -mean(gold_prob - top_k_prob)
///
/// 列 x の候補が全ての対象位置で正解と一致する場合のみ、その列を除外する。
pub fn probability_gap_margin<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
    top_k: usize,
) -> Result<Tensor<B, 1>> {
    let [n, vocab_size] = logits.dims();
    let k = top_k.min(vocab_size);
    let device = logits.device();

    let probs = softmax(logits, 1);
    let gold = probs.clone().gather(1, labels.clone().reshape([n, 1]));
    let (top_values, top_indices) = probs.topk_with_indices(k, 1);

    let mut gaps = Vec::with_capacity(k);
    for x in 0..k {
        let column = top_indices.clone().slice([0..n, x..x + 1]).reshape([n]);
        let matches = column
            .equal(labels.clone())
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
        if matches as usize == n {
            continue;
        }
        let neg = top_values.clone().slice([0..n, x..x + 1]);
        gaps.push(gold.clone() - neg);
    }

    if gaps.is_empty() {
        return Ok(Tensor::zeros([1], &device));
    }

    Ok(Tensor::cat(gaps, 1).mean().neg())
}

// ===== 合成 =====

/// 各損失項と合計
#[derive(Clone, Debug)]
pub struct LossBreakdown<B: Backend> {
    pub total: Tensor<B, 1>,
    pub correction: Tensor<B, 1>,
    pub detection: Option<Tensor<B, 1>>,
    pub margin: Option<Tensor<B, 1>>,
    pub sentence: Option<Tensor<B, 1>>,
    pub pos: Option<Tensor<B, 1>>,
}

impl<B: Backend> LossBreakdown<B> {
    /// 固定係数で合成
    ///
    /// 検出あり: alpha * 訂正 + (1 - alpha) * 検出、なし: 訂正のみ。
    /// そこに beta * マージン、重み * 文対照、pos_weight * 品詞 を足す。
    pub fn compose(
        config: &LossConfig,
        correction: Tensor<B, 1>,
        detection: Option<Tensor<B, 1>>,
        margin: Option<Tensor<B, 1>>,
        sentence: Option<Tensor<B, 1>>,
        pos: Option<Tensor<B, 1>>,
    ) -> Result<Self> {
        let mut total = match &detection {
            Some(detection) => {
                correction.clone().mul_scalar(config.alpha)
                    + detection.clone().mul_scalar(1.0 - config.alpha)
            }
            None => correction.clone(),
        };
        if let Some(margin) = &margin {
            total = total + margin.clone().mul_scalar(config.beta);
        }
        if let Some(sentence) = &sentence {
            total = total + sentence.clone().mul_scalar(config.sentence_contrast_weight);
        }
        if let Some(pos) = &pos {
            total = total + pos.clone().mul_scalar(config.pos_weight);
        }

        let value = total.clone().into_scalar().elem::<f32>();
        if !value.is_finite() {
            return Err(FusionError::NonFiniteLoss(value));
        }
        debug!(
            "損失: 合計 {:.4}（訂正 {:.4}）",
            value,
            correction.clone().into_scalar().elem::<f32>()
        );

        Ok(Self {
            total,
            correction,
            detection,
            margin,
            sentence,
            pos,
        })
    }

    /// 合計のホスト値
    pub fn value(&self) -> f32 {
        self.total.clone().into_scalar().elem::<f32>()
    }
}

/// マージン方針ごとの計算
pub fn margin_loss<B: Backend>(
    policy: MarginPolicy,
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
    top_k: usize,
) -> Result<Tensor<B, 1>> {
    match policy {
        MarginPolicy::LogitHinge => Ok(logit_hinge_margin(logits, labels, top_k)),
        MarginPolicy::ProbabilityGap => probability_gap_margin(logits, labels, top_k),
    }
}
