//! 优化器
//!
//! 按参数名维护状态，通过模型的参数遍历接口逐个更新。

use crate::param::Parameter;
use ndarray::Array2;
use std::collections::HashMap;

/// 优化器接口
pub trait Optimizer {
    /// 用已累积的梯度更新一个命名参数
    fn update(&mut self, name: &str, param: &mut Parameter);

    /// 设置当前学习率（供调度器驱动）
    fn set_lr(&mut self, lr: f32);

    /// 当前学习率
    fn lr(&self) -> f32;

    /// 优化器名称
    fn name(&self) -> &str;
}

/// Adam 优化器
///
/// 一阶/二阶动量按参数名分别维护，偏差修正使用该参数自己的步数。
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    m: HashMap<String, Array2<f32>>,
    v: HashMap<String, Array2<f32>>,
    steps: HashMap<String, usize>,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        assert!(lr > 0.0, "learning rate must be positive");
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            m: HashMap::new(),
            v: HashMap::new(),
            steps: HashMap::new(),
        }
    }

    /// 设置动量系数
    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        assert!((0.0..1.0).contains(&beta1), "beta1 must be in [0, 1)");
        assert!((0.0..1.0).contains(&beta2), "beta2 must be in [0, 1)");
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// 设置数值稳定项
    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        assert!(epsilon > 0.0, "epsilon must be positive");
        self.epsilon = epsilon;
        self
    }
}

impl Optimizer for Adam {
    fn update(&mut self, name: &str, param: &mut Parameter) {
        let shape = param.data.dim();
        let m = self
            .m
            .entry(name.to_string())
            .or_insert_with(|| Array2::zeros(shape));
        let v = self
            .v
            .entry(name.to_string())
            .or_insert_with(|| Array2::zeros(shape));
        let step = self.steps.entry(name.to_string()).or_insert(0);
        *step += 1;
        let t = *step as i32;

        *m = &*m * self.beta1 + &param.grad * (1.0 - self.beta1);
        *v = &*v * self.beta2 + &(&param.grad * &param.grad) * (1.0 - self.beta2);

        let m_hat = &*m / (1.0 - self.beta1.powi(t));
        let v_hat = &*v / (1.0 - self.beta2.powi(t));

        let update = m_hat / (v_hat.mapv(f32::sqrt) + self.epsilon) * self.lr;
        param.data = &param.data - &update;
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn name(&self) -> &str {
        "Adam"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn make_param() -> Parameter {
        Parameter::new(arr2(&[[1.0, 2.0], [3.0, 4.0]]))
    }

    #[test]
    fn test_adam_moves_against_gradient() {
        let mut opt = Adam::new(0.1);
        let mut p = make_param();
        p.grad = arr2(&[[1.0, 1.0], [1.0, 1.0]]);
        let before = p.data.clone();

        opt.update("w", &mut p);
        for (a, b) in p.data.iter().zip(before.iter()) {
            assert!(a < b, "positive gradient should decrease the parameter");
        }
    }

    #[test]
    fn test_adam_zero_grad_no_change() {
        let mut opt = Adam::new(0.1);
        let mut p = make_param();
        let before = p.data.clone();

        opt.update("w", &mut p);
        assert_eq!(p.data, before);
    }

    #[test]
    fn test_adam_per_param_state() {
        let mut opt = Adam::new(0.1);
        let mut a = make_param();
        let mut b = make_param();
        a.grad.fill(1.0);
        b.grad.fill(1.0);

        // 每个名字独立的步数与动量：先更新 a 三次不影响 b 的首步
        opt.update("a", &mut a);
        opt.update("a", &mut a);
        opt.update("a", &mut a);
        opt.update("b", &mut b);

        let mut fresh_opt = Adam::new(0.1);
        let mut fresh = make_param();
        fresh.grad.fill(1.0);
        fresh_opt.update("b", &mut fresh);
        assert_eq!(b.data, fresh.data);
    }

    #[test]
    fn test_adam_builder() {
        let opt = Adam::new(0.5).with_betas(0.9, 0.98).with_epsilon(1e-9);
        assert_eq!(opt.lr(), 0.5);
        assert_eq!(opt.name(), "Adam");
    }

    #[test]
    fn test_set_lr() {
        let mut opt = Adam::new(0.1);
        opt.set_lr(0.01);
        assert_eq!(opt.lr(), 0.01);
    }
}
