//! Transformer 的基础层
//!
//! 包含可训练的线性层、Layer Normalization、Position-wise Feed-Forward、
//! Dropout 以及残差子层包装器。所有层都实现手动反向传播：
//! forward 在训练模式下缓存中间值，backward 累积参数梯度并返回输入梯度。

use crate::param::{ParamVisitor, Parameter};
use crate::tensor::TensorExt;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 可训练的线性层
///
/// 输出 = x · W + b，权重 `[in_features, out_features]`。
#[derive(Debug, Clone)]
pub struct Linear {
    /// 权重: [in_features, out_features]
    pub weight: Parameter,
    /// 偏置: [1, out_features]
    pub bias: Parameter,
    /// 保存输入（用于反向传播）
    input_cache: Option<Array2<f32>>,
    training: bool,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        Self {
            weight: Parameter::new(Array2::random_xavier((in_features, out_features), rng)),
            bias: Parameter::new(Array2::zeros((1, out_features))),
            input_cache: None,
            training: false,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        if !training {
            self.input_cache = None;
        }
    }

    /// 前向传播
    ///
    /// 输入: [n, in_features]，输出: [n, out_features]
    pub fn forward(&mut self, x: &Array2<f32>) -> Array2<f32> {
        if self.training {
            self.input_cache = Some(x.clone());
        }

        x.matmul(&self.weight.data) + &self.bias.data
    }

    /// 反向传播
    ///
    /// 参数梯度累积到 weight.grad / bias.grad，返回输入梯度。
    pub fn backward(&mut self, grad_output: &Array2<f32>) -> Array2<f32> {
        let input = self.input_cache.as_ref().expect("Linear: no cached input");

        // d_weight = input^T · grad_output
        let input_t = input.t().to_owned();
        self.weight.accumulate(&input_t.matmul(grad_output));

        // d_bias = sum(grad_output, axis=0)
        let grad_bias = grad_output.sum_axis(Axis(0)).insert_axis(Axis(0));
        self.bias.accumulate(&grad_bias);

        // grad_input = grad_output · weight^T
        let weight_t = self.weight.data.t().to_owned();
        grad_output.matmul(&weight_t)
    }

    pub fn visit(&mut self, prefix: &str, f: &mut ParamVisitor) {
        f(&format!("{}.weight", prefix), &mut self.weight);
        f(&format!("{}.bias", prefix), &mut self.bias);
    }

    pub fn param_count(&self) -> usize {
        self.weight.data.len() + self.bias.data.len()
    }
}

/// Dropout 层
///
/// 训练模式下以概率 p 将元素置零，其余元素按 1/(1-p) 缩放以保持期望；
/// 推理模式下恒等。模式由显式 training 标记控制。
#[derive(Debug, Clone)]
pub struct Dropout {
    prob: f32,
    training: bool,
    rng: StdRng,
    /// 缓存缩放后的掩码（反向传播复用）
    mask_cache: Option<Array2<f32>>,
}

impl Dropout {
    pub fn new(prob: f32) -> Self {
        assert!((0.0..1.0).contains(&prob), "dropout prob must be in [0, 1)");

        Self {
            prob,
            training: false,
            rng: StdRng::from_entropy(),
            mask_cache: None,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        if !training {
            self.mask_cache = None;
        }
    }

    pub fn forward(&mut self, x: &Array2<f32>) -> Array2<f32> {
        if !self.training || self.prob == 0.0 {
            self.mask_cache = None;
            return x.clone();
        }

        let keep_scale = 1.0 / (1.0 - self.prob);
        let prob = self.prob;
        let rng = &mut self.rng;
        let mask = Array2::from_shape_fn(x.dim(), |_| {
            if rng.gen::<f32>() < prob {
                0.0
            } else {
                keep_scale
            }
        });

        let out = x * &mask;
        self.mask_cache = Some(mask);
        out
    }

    pub fn backward(&self, grad_output: &Array2<f32>) -> Array2<f32> {
        match &self.mask_cache {
            Some(mask) => grad_output * mask,
            None => grad_output.clone(),
        }
    }
}

/// Layer Normalization
///
/// 对每个位置沿特征轴归一化：减均值、除以（标准差 + eps），
/// 再应用可学习的逐元素缩放和平移。
///
/// ```text
/// y = γ * ((x - μ) / (σ + ε)) + β
/// ```
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// 缩放参数 [1, d_model]
    pub gamma: Parameter,
    /// 平移参数 [1, d_model]
    pub beta: Parameter,
    eps: f32,
    cache: Option<NormCache>,
    training: bool,
}

#[derive(Debug, Clone)]
struct NormCache {
    /// 归一化后的值 [n, d_model]
    x_hat: Array2<f32>,
    /// 每行的 σ + ε [n, 1]
    sigma: Array2<f32>,
}

impl LayerNorm {
    pub fn new(d_model: usize, eps: Option<f32>) -> Self {
        Self {
            gamma: Parameter::new(Array2::ones((1, d_model))),
            beta: Parameter::new(Array2::zeros((1, d_model))),
            eps: eps.unwrap_or(1e-6),
            cache: None,
            training: false,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        if !training {
            self.cache = None;
        }
    }

    /// 前向传播: [n, d_model] -> [n, d_model]
    pub fn forward(&mut self, x: &Array2<f32>) -> Array2<f32> {
        let mean = x.mean_axis(Axis(1)).unwrap().insert_axis(Axis(1));
        let centered = x - &mean;
        let var = centered
            .mapv(|v: f32| v * v)
            .mean_axis(Axis(1))
            .unwrap()
            .insert_axis(Axis(1));
        let sigma = var.mapv(|v: f32| v.sqrt()) + self.eps;

        let x_hat = &centered / &sigma;
        let out = &x_hat * &self.gamma.data + &self.beta.data;

        if self.training {
            self.cache = Some(NormCache { x_hat, sigma });
        }

        out
    }

    /// 反向传播
    pub fn backward(&mut self, grad_output: &Array2<f32>) -> Array2<f32> {
        let cache = self.cache.as_ref().expect("LayerNorm: no cached forward");
        let x_hat = &cache.x_hat;
        let sigma = &cache.sigma;

        self.gamma
            .accumulate(&(grad_output * x_hat).sum_axis(Axis(0)).insert_axis(Axis(0)));
        self.beta
            .accumulate(&grad_output.sum_axis(Axis(0)).insert_axis(Axis(0)));

        // g_hat = grad ⊙ γ，再按行减去均值修正项
        let g_hat = grad_output * &self.gamma.data;
        let m = g_hat.mean_axis(Axis(1)).unwrap().insert_axis(Axis(1));
        let mh = (&g_hat * x_hat)
            .mean_axis(Axis(1))
            .unwrap()
            .insert_axis(Axis(1));

        (&g_hat - &m) / sigma - x_hat * &(mh / sigma)
    }

    pub fn visit(&mut self, prefix: &str, f: &mut ParamVisitor) {
        f(&format!("{}.gamma", prefix), &mut self.gamma);
        f(&format!("{}.beta", prefix), &mut self.beta);
    }
}

/// Position-wise Feed-Forward Network
///
/// 两层线性变换，中间 ReLU 激活和 dropout，逐位置独立作用：
///
/// ```text
/// FFN(x) = Dropout(ReLU(xW1 + b1)) W2 + b2
/// ```
#[derive(Debug, Clone)]
pub struct FeedForward {
    linear1: Linear,
    linear2: Linear,
    dropout: Dropout,
    /// 缓存第一层的预激活值（ReLU 反向用）
    hidden_cache: Option<Array2<f32>>,
    training: bool,
}

impl FeedForward {
    pub fn new(d_model: usize, d_ff: usize, dropout: f32, rng: &mut StdRng) -> Self {
        Self {
            linear1: Linear::new(d_model, d_ff, rng),
            linear2: Linear::new(d_ff, d_model, rng),
            dropout: Dropout::new(dropout),
            hidden_cache: None,
            training: false,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.linear1.set_training(training);
        self.linear2.set_training(training);
        self.dropout.set_training(training);
        if !training {
            self.hidden_cache = None;
        }
    }

    /// 前向传播: [n, d_model] -> [n, d_model]
    pub fn forward(&mut self, x: &Array2<f32>) -> Array2<f32> {
        let hidden = self.linear1.forward(x);
        let activated = hidden.mapv(|v: f32| v.max(0.0));

        if self.training {
            self.hidden_cache = Some(hidden);
        }

        let dropped = self.dropout.forward(&activated);
        self.linear2.forward(&dropped)
    }

    /// 反向传播
    pub fn backward(&mut self, grad_output: &Array2<f32>) -> Array2<f32> {
        let hidden = self
            .hidden_cache
            .as_ref()
            .expect("FeedForward: no cached hidden");

        let grad_dropped = self.linear2.backward(grad_output);
        let grad_activated = self.dropout.backward(&grad_dropped);

        // ReLU 梯度：预激活 > 0 的位置通过
        let relu_mask = hidden.mapv(|v: f32| if v > 0.0 { 1.0 } else { 0.0 });
        let grad_hidden = grad_activated * relu_mask;

        self.linear1.backward(&grad_hidden)
    }

    pub fn visit(&mut self, prefix: &str, f: &mut ParamVisitor) {
        self.linear1.visit(&format!("{}.linear1", prefix), f);
        self.linear2.visit(&format!("{}.linear2", prefix), f);
    }

    pub fn param_count(&self) -> usize {
        self.linear1.param_count() + self.linear2.param_count()
    }
}

/// 残差子层包装器（pre-norm）
///
/// 把任意子层变换 f 包装为 `x + Dropout(f(LayerNorm(x)))`。
/// 子层以闭包注入：forward 传入前向闭包，backward 传入对应的反向闭包。
#[derive(Debug, Clone)]
pub struct SublayerConnection {
    norm: LayerNorm,
    dropout: Dropout,
}

impl SublayerConnection {
    pub fn new(d_model: usize, dropout: f32) -> Self {
        Self {
            norm: LayerNorm::new(d_model, None),
            dropout: Dropout::new(dropout),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.norm.set_training(training);
        self.dropout.set_training(training);
    }

    /// 前向传播: output = x + Dropout(sublayer(LayerNorm(x)))
    pub fn forward<F>(&mut self, x: &Array2<f32>, sublayer: F) -> Array2<f32>
    where
        F: FnOnce(&Array2<f32>) -> Array2<f32>,
    {
        let normed = self.norm.forward(x);
        let out = sublayer(&normed);
        x + &self.dropout.forward(&out)
    }

    /// 反向传播
    ///
    /// `sublayer_backward` 是 forward 时注入的子层对应的反向闭包。
    /// 残差分支的梯度在出口处相加。
    pub fn backward<F>(&mut self, grad_output: &Array2<f32>, sublayer_backward: F) -> Array2<f32>
    where
        F: FnOnce(&Array2<f32>) -> Array2<f32>,
    {
        let grad_sub = self.dropout.backward(grad_output);
        let grad_normed = sublayer_backward(&grad_sub);
        self.norm.backward(&grad_normed) + grad_output
    }

    pub fn visit(&mut self, prefix: &str, f: &mut ParamVisitor) {
        self.norm.visit(&format!("{}.norm", prefix), f);
    }
}
