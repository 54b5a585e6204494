use thiserror::Error;

/// 融合モデル全体で使うエラー型
#[derive(Debug, Error)]
pub enum FusionError {
    // ===== 設定エラー（構築・セットアップ時） =====
    #[error("設定が不正です: {0}")]
    InvalidConfig(String),

    #[error("未対応の画像バックボーン: image_model_type = {0}")]
    UnsupportedBackbone(usize),

    #[error("バックボーン {backbone} は {channels} チャンネル入力に対応していません")]
    BackboneChannelMismatch {
        backbone: &'static str,
        channels: usize,
    },

    #[error("字形テーブルの形状が一致しません: 期待 {expected:?}, 実際 {actual:?}")]
    GlyphTableShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("重み共有できません: 埋め込み {embedding:?} と分類器 {classifier:?}")]
    TieShapeMismatch {
        embedding: [usize; 2],
        classifier: [usize; 2],
    },

    // ===== データ契約エラー =====
    #[error("バッチに必須キーがありません: {0}")]
    MissingBatchKey(&'static str),

    #[error("{name} の形状が不正です: 期待 {expected:?}, 実際 {actual:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{name} の添字 {index} が範囲外です（上限 {bound}）")]
    IndexOutOfRange {
        name: &'static str,
        index: usize,
        bound: usize,
    },

    #[error("字形テーブルが未初期化です（init_glyph_table を先に呼んでください）")]
    GlyphTableUninitialized,

    #[error("テンソルデータの変換に失敗しました: {0}")]
    TensorData(String),

    // ===== 数値エラー =====
    #[error("損失を計算する対象位置がありません（loss_masks が全て0）")]
    EmptyActiveSet,

    #[error("損失が有限値ではありません: {0}")]
    NonFiniteLoss(f32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSONの読み書きに失敗: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FusionError>;

/// 形状を検証するヘルパー
pub(crate) fn ensure_shape(name: &'static str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(FusionError::ShapeMismatch {
            name,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_shape() {
        assert!(ensure_shape("src_idx", &[2, 5], &[2, 5]).is_ok());
        let err = ensure_shape("src_idx", &[2, 5], &[2, 4]).unwrap_err();
        assert!(matches!(err, FusionError::ShapeMismatch { name: "src_idx", .. }));
    }
}
