//! 可训练参数
//!
//! 参数持有数据和累积梯度，并提供按名字遍历的接口，
//! 供优化器、检查点和分布式梯度同步复用。

use ndarray::Array2;

/// 可训练参数（数据 + 梯度）
#[derive(Debug, Clone)]
pub struct Parameter {
    /// 权重数据
    pub data: Array2<f32>,
    /// 累积梯度（与 data 同形状）
    pub grad: Array2<f32>,
}

impl Parameter {
    pub fn new(data: Array2<f32>) -> Self {
        let dim = data.dim();
        Self {
            data,
            grad: Array2::zeros(dim),
        }
    }

    /// 清零梯度
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// 累积梯度
    pub fn accumulate(&mut self, grad: &Array2<f32>) {
        self.grad += grad;
    }
}

/// 参数访问器
///
/// 各组件按固定顺序回调 `(名字, 参数)`，顺序在一次运行内确定不变，
/// 因此可以用来做参数展平、广播和 all-reduce。
pub type ParamVisitor<'a> = dyn FnMut(&str, &mut Parameter) + 'a;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_parameter_creation() {
        let mut rng = StdRng::seed_from_u64(0);
        let param = Parameter::new(Array2::random_xavier((10, 20), &mut rng));

        assert_eq!(param.data.shape(), &[10, 20]);
        assert_eq!(param.grad.shape(), &[10, 20]);
        assert_eq!(param.grad.iter().filter(|&&g| g != 0.0).count(), 0);
    }

    #[test]
    fn test_accumulate_and_zero_grad() {
        let mut param = Parameter::new(Array2::zeros((2, 2)));
        let g = Array2::from_elem((2, 2), 0.5);

        param.accumulate(&g);
        param.accumulate(&g);
        assert!((param.grad[[0, 0]] - 1.0).abs() < 1e-6);

        param.zero_grad();
        assert_eq!(param.grad.iter().sum::<f32>(), 0.0);
    }
}
