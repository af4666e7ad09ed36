//! 学习率调度器
//!
//! step 是优化器步数（梯度累积的多个批次只算一步），从 1 开始。

/// 学习率调度器接口
pub trait LRScheduler {
    /// 根据优化器步数计算学习率
    fn get_lr(&self, step: usize) -> f32;

    /// 调度器名称
    fn name(&self) -> &str;
}

/// 常数学习率
#[derive(Debug, Clone)]
pub struct ConstantLR {
    lr: f32,
}

impl ConstantLR {
    pub fn new(lr: f32) -> Self {
        assert!(lr > 0.0, "learning rate must be positive");
        Self { lr }
    }
}

impl LRScheduler for ConstantLR {
    fn get_lr(&self, _step: usize) -> f32 {
        self.lr
    }

    fn name(&self) -> &str {
        "ConstantLR"
    }
}

/// Noam 调度：线性预热 + 按步数倒平方根衰减
///
/// ```text
/// lr = factor · d_model^{-0.5} · min(step^{-0.5}, step · warmup^{-1.5})
/// ```
///
/// warmup 步处达到峰值。step 0 按 1 处理，避免 0^{-0.5}。
#[derive(Debug, Clone)]
pub struct NoamLR {
    model_size: usize,
    factor: f32,
    warmup: usize,
}

impl NoamLR {
    /// # 参数
    /// - `model_size`: d_model
    /// - `factor`: 整体缩放系数
    /// - `warmup`: 预热步数
    pub fn new(model_size: usize, factor: f32, warmup: usize) -> Self {
        assert!(model_size > 0, "model_size must be positive");
        assert!(warmup > 0, "warmup must be positive");
        Self {
            model_size,
            factor,
            warmup,
        }
    }
}

impl LRScheduler for NoamLR {
    fn get_lr(&self, step: usize) -> f32 {
        let step = step.max(1) as f32;
        let warmup = self.warmup as f32;
        let scale = (self.model_size as f32).powf(-0.5);
        self.factor * scale * (step.powf(-0.5)).min(step * warmup.powf(-1.5))
    }

    fn name(&self) -> &str {
        "NoamLR"
    }
}
