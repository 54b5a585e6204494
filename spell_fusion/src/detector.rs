use crate::recurrent::BiGru;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;

/// 誤り検出器: 双方向2層GRU → Linear(2H, 2) → sigmoid
///
/// 2チャンネルは独立した確率として扱う。チャンネル0が「この位置は正しい」確率。
#[derive(Module, Debug)]
pub struct ErrorDetector<B: Backend> {
    gru: BiGru<B>,
    classifier: Linear<B>,
}

impl<B: Backend> ErrorDetector<B> {
    pub fn new(hidden: usize, device: &B::Device) -> Self {
        Self {
            gru: BiGru::new(hidden, hidden, 2, device),
            classifier: LinearConfig::new(hidden * 2, 2).init(device),
        }
    }

    /// hiddens: [B, S, H] → 検出確率 [B, S, 2]
    pub fn forward(&self, hiddens: Tensor<B, 3>) -> Tensor<B, 3> {
        let states = self.gru.forward(hiddens);
        sigmoid(self.classifier.forward(states))
    }
}

/// 「正しい」確率（チャンネル0）[B, S]
pub fn correct_probability<B: Backend>(detect_probs: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch_size, seq_len, _] = detect_probs.dims();
    detect_probs
        .slice([0..batch_size, 0..seq_len, 0..1])
        .reshape([batch_size, seq_len])
}

/// ソフトマスク: hidden * p + mask * (1 - p)、mask はゼロベクトル
pub fn soft_mask<B: Backend>(hiddens: Tensor<B, 3>, p_correct: Tensor<B, 2>) -> Tensor<B, 3> {
    let mask_embedding = hiddens.zeros_like();
    let p = p_correct.unsqueeze_dim::<3>(2);
    let q = p.clone().neg().add_scalar(1.0);

    hiddens * p + mask_embedding * q
}

/// 検出ラベル: src != tgt の位置が1
pub fn detection_labels<B: Backend>(
    src_idx: Tensor<B, 2, Int>,
    tgt_idx: Tensor<B, 2, Int>,
) -> Tensor<B, 2, Int> {
    src_idx.not_equal(tgt_idx).int()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn test_detector_probabilities() {
        let device = Default::default();
        let detector = ErrorDetector::<TestBackend>::new(6, &device);
        let hiddens = Tensor::<TestBackend, 3>::random([2, 5, 6], Distribution::Normal(0.0, 1.0), &device);

        let probs = detector.forward(hiddens);
        assert_eq!(probs.dims(), [2, 5, 2]);
        let values: Vec<f32> = probs.clone().to_data().to_vec().unwrap();
        assert!(values.iter().all(|&p| (0.0..=1.0).contains(&p)));
        assert_eq!(correct_probability(probs).dims(), [2, 5]);
    }

    #[test]
    fn test_soft_mask_boundaries() {
        let device = Default::default();
        let hiddens = Tensor::<TestBackend, 3>::random([2, 3, 4], Distribution::Normal(0.0, 1.0), &device);

        // p = 1 なら何も隠さない
        let kept = soft_mask(hiddens.clone(), Tensor::ones([2, 3], &device));
        let expected: Vec<f32> = hiddens.clone().to_data().to_vec().unwrap();
        let actual: Vec<f32> = kept.to_data().to_vec().unwrap();
        assert_eq!(actual, expected);

        // p = 0 ならマスクベクトル（ゼロ）そのもの
        let masked: Vec<f32> = soft_mask(hiddens, Tensor::zeros([2, 3], &device))
            .to_data()
            .to_vec()
            .unwrap();
        assert!(masked.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_detection_labels() {
        let device = Default::default();
        let src = Tensor::<TestBackend, 2, Int>::from_data([[1, 2, 3], [4, 5, 6]], &device);

        let unchanged: Vec<i64> = detection_labels(src.clone(), src.clone())
            .to_data()
            .convert::<i64>()
            .to_vec()
            .unwrap();
        assert!(unchanged.iter().all(|&l| l == 0));

        let tgt = Tensor::<TestBackend, 2, Int>::from_data([[1, 9, 3], [4, 5, 7]], &device);
        let labels: Vec<i64> = detection_labels(src, tgt).to_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(labels, vec![0, 1, 0, 0, 0, 1]);
    }
}
