//! 张量操作扩展和工具函数
//!
//! 基于 ndarray 实现 Transformer 所需的张量操作。

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::Rng;

/// 张量扩展 trait
///
/// 所有组件共享的数值操作，统一实现在 `Array2<f32>` 上。
pub trait TensorExt {
    /// 创建随机张量（Xavier 均匀初始化）
    ///
    /// 使用外部传入的 rng，保证固定种子下初始化可复现。
    fn random_xavier(shape: (usize, usize), rng: &mut StdRng) -> Array2<f32>;

    /// 矩阵乘法
    fn matmul(&self, other: &Array2<f32>) -> Array2<f32>;

    /// 沿指定维度应用 softmax
    fn softmax(&self, axis: usize) -> Array2<f32>;

    /// 沿指定维度应用 log-softmax
    fn log_softmax(&self, axis: usize) -> Array2<f32>;
}

impl TensorExt for Array2<f32> {
    fn random_xavier(shape: (usize, usize), rng: &mut StdRng) -> Array2<f32> {
        let limit = (6.0 / (shape.0 + shape.1) as f32).sqrt();

        Array2::from_shape_fn(shape, |_| rng.gen_range(-limit..limit))
    }

    fn matmul(&self, other: &Array2<f32>) -> Array2<f32> {
        self.dot(other)
    }

    fn softmax(&self, axis: usize) -> Array2<f32> {
        // 减去最大值以提高数值稳定性
        let max = self.fold_axis(Axis(axis), f32::NEG_INFINITY, |a, &b| a.max(b));
        let max_view = max.insert_axis(Axis(axis));

        let exp = (self - &max_view).mapv(|x: f32| x.exp());
        let sum = exp.sum_axis(Axis(axis));
        let sum_view = sum.insert_axis(Axis(axis));

        exp / sum_view
    }

    fn log_softmax(&self, axis: usize) -> Array2<f32> {
        let max = self.fold_axis(Axis(axis), f32::NEG_INFINITY, |a, &b| a.max(b));
        let max_view = max.insert_axis(Axis(axis));

        let shifted = self - &max_view;
        let log_sum = shifted
            .mapv(|x: f32| x.exp())
            .sum_axis(Axis(axis))
            .mapv(|x: f32| x.ln());
        let log_sum_view = log_sum.insert_axis(Axis(axis));

        shifted - &log_sum_view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_matmul() {
        let a = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Array2::from_shape_vec((3, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let c = a.matmul(&b);

        assert_eq!(c.shape(), &[2, 2]);
        assert!((c[[0, 0]] - 22.0).abs() < 1e-6);
    }

    #[test]
    fn test_softmax() {
        let x = Array2::from_shape_vec((1, 3), vec![1.0, 2.0, 3.0]).unwrap();
        let s = x.softmax(1);

        let sum: f32 = s.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_log_softmax() {
        let x = Array2::from_shape_vec((2, 4), vec![1.0, 2.0, 3.0, 4.0, -1.0, 0.0, 1.0, 2.0])
            .unwrap();
        let lp = x.log_softmax(1);

        // exp(log_softmax) 每行和为 1
        for row in 0..2 {
            let sum: f32 = lp.row(row).iter().map(|&v| v.exp()).sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }

        // 与 softmax().ln() 一致
        let reference = x.softmax(1).mapv(|v| v.ln());
        for (a, b) in lp.iter().zip(reference.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_xavier_seeded_reproducible() {
        let mut rng1 = StdRng::seed_from_u64(7);
        let mut rng2 = StdRng::seed_from_u64(7);

        let a = Array2::random_xavier((8, 16), &mut rng1);
        let b = Array2::random_xavier((8, 16), &mut rng2);

        assert_eq!(a, b);

        // 界限检查
        let limit = (6.0 / 24.0_f32).sqrt();
        assert!(a.iter().all(|&v| v.abs() <= limit));
    }
}
