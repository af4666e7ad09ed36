//! 标签平滑损失
//!
//! 基于 KL 散度：将 one-hot 目标替换为平滑分布（正确类 confidence，
//! 其余非填充类均分 smoothing），并对填充位置整行清零。

use ndarray::Array2;

/// 标签平滑 KL 散度损失
///
/// 损失为 sum 归约的 KL(true_dist ‖ exp(log_probs))，
/// 反向梯度为 -true_dist（KL 对 log_probs 的导数）。
#[derive(Debug, Clone)]
pub struct LabelSmoothing {
    /// 类别数（目标词表大小）
    size: usize,
    /// 填充符索引（概率恒为 0）
    padding_idx: usize,
    /// 正确类保留的概率质量
    confidence: f32,
    /// 分摊到其余类的概率质量
    smoothing: f32,
}

impl LabelSmoothing {
    /// 创建标签平滑损失
    ///
    /// # 参数
    /// - `size`: 词表大小
    /// - `padding_idx`: 填充符索引
    /// - `smoothing`: 平滑系数（0.0 等价于 one-hot）
    pub fn new(size: usize, padding_idx: usize, smoothing: f32) -> Self {
        assert!(size > 2, "vocabulary size must exceed 2");
        assert!(
            (0.0..=1.0).contains(&smoothing),
            "smoothing must be in [0, 1]"
        );
        Self {
            size,
            padding_idx,
            confidence: 1.0 - smoothing,
            smoothing,
        }
    }

    /// 构造平滑后的目标分布
    ///
    /// 每行：正确类 = confidence，其余 = smoothing / (size - 2)，
    /// 填充列 = 0；目标本身为填充符的行整行置 0。
    pub fn smoothed_targets(&self, targets: &[usize]) -> Array2<f32> {
        let fill = self.smoothing / (self.size - 2) as f32;
        let mut dist = Array2::from_elem((targets.len(), self.size), fill);

        for (i, &t) in targets.iter().enumerate() {
            assert!(t < self.size, "target id {} out of vocabulary", t);
            if t == self.padding_idx {
                dist.row_mut(i).fill(0.0);
            } else {
                dist[[i, t]] = self.confidence;
                dist[[i, self.padding_idx]] = 0.0;
            }
        }
        dist
    }

    /// 计算损失与梯度
    ///
    /// # 参数
    /// - `log_probs`: [n, size] 对数概率
    /// - `targets`: n 个目标 token
    ///
    /// # 返回
    /// (损失总和, 对 log_probs 的梯度)
    pub fn forward(&self, log_probs: &Array2<f32>, targets: &[usize]) -> (f32, Array2<f32>) {
        assert_eq!(log_probs.nrows(), targets.len(), "row count mismatch");
        assert_eq!(log_probs.ncols(), self.size, "vocabulary size mismatch");

        let true_dist = self.smoothed_targets(targets);

        // KL(t ‖ p) = Σ t·(ln t − log p)，t=0 的项视为 0
        let mut loss = 0.0;
        for (t, lp) in true_dist.iter().zip(log_probs.iter()) {
            if *t > 0.0 {
                loss += t * (t.ln() - lp);
            }
        }

        (loss, -true_dist)
    }
}

/// 交叉熵损失（不做平滑，忽略填充位置）
///
/// 训练外的评估场景使用，如困惑度计算。
pub fn cross_entropy(log_probs: &Array2<f32>, targets: &[usize], padding_idx: usize) -> f32 {
    let mut loss = 0.0;
    let mut count = 0;
    for (i, &t) in targets.iter().enumerate() {
        if t != padding_idx {
            loss -= log_probs[[i, t]];
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        loss / count as f32
    }
}

/// 贪心预测准确率（忽略填充位置）
pub fn accuracy(log_probs: &Array2<f32>, targets: &[usize], padding_idx: usize) -> f32 {
    let mut correct = 0;
    let mut count = 0;
    for (i, &t) in targets.iter().enumerate() {
        if t == padding_idx {
            continue;
        }
        let row = log_probs.row(i);
        let mut best = 0;
        let mut best_val = f32::NEG_INFINITY;
        for (j, &v) in row.iter().enumerate() {
            if v > best_val {
                best_val = v;
                best = j;
            }
        }
        if best == t {
            correct += 1;
        }
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        correct as f32 / count as f32
    }
}
