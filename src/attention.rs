//! Multi-Head Attention
//!
//! Transformer 的核心组件：允许模型关注输入序列的不同位置。
//! 掩码在 softmax 之前以 -1e9 加性偏置实现，被屏蔽位置的概率质量
//! 在归一化后约等于 0。

use crate::layers::{Dropout, Linear};
use crate::param::ParamVisitor;
use crate::tensor::TensorExt;
use ndarray::{s, Array2, Axis};
use rand::rngs::StdRng;

/// 被屏蔽位置的分数哨兵值
const MASK_FILL: f32 = -1e9;

/// Multi-Head Attention 参数
#[derive(Debug, Clone)]
pub struct AttentionParams {
    /// 模型维度
    pub d_model: usize,
    /// 注意力头数
    pub n_heads: usize,
    /// 每个头的维度
    pub d_k: usize,
}

impl AttentionParams {
    pub fn new(d_model: usize, n_heads: usize) -> Self {
        assert_eq!(d_model % n_heads, 0, "d_model must be divisible by n_heads");

        let d_k = d_model / n_heads;

        Self {
            d_model,
            n_heads,
            d_k,
        }
    }
}

/// 缩放点积注意力
///
/// ```text
/// Attention(Q, K, V) = softmax(QK^T / √d_k) * V
/// ```
///
/// 单个头上的注意力原语，支持反向传播；概率张量上可选 dropout。
#[derive(Debug, Clone)]
pub struct ScaledDotProduct {
    dropout: Dropout,
    cache: Option<SdpCache>,
    training: bool,
}

#[derive(Debug, Clone)]
struct SdpCache {
    q: Array2<f32>,
    k: Array2<f32>,
    v: Array2<f32>,
    /// softmax 后、dropout 前的概率
    probs: Array2<f32>,
}

impl ScaledDotProduct {
    pub fn new(dropout: f32) -> Self {
        Self {
            dropout: Dropout::new(dropout),
            cache: None,
            training: false,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.dropout.set_training(training);
        if !training {
            self.cache = None;
        }
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `q`: Query [len_q, d_k]
    /// - `k`: Key [len_k, d_k]
    /// - `v`: Value [len_k, d_k]
    /// - `mask`: 可选掩码，[len_q, len_k] 或 [1, len_k]（按查询轴广播）
    ///
    /// # 返回
    /// - 注意力输出 [len_q, d_k]
    /// - 注意力概率 [len_q, len_k]（用于可视化/检查）
    pub fn forward(
        &mut self,
        q: &Array2<f32>,
        k: &Array2<f32>,
        v: &Array2<f32>,
        mask: Option<&Array2<bool>>,
    ) -> (Array2<f32>, Array2<f32>) {
        let scale = (q.ncols() as f32).sqrt();

        let k_t = k.t().to_owned();
        let mut scores = q.matmul(&k_t).mapv(|x| x / scale);

        if let Some(mask) = mask {
            let broadcast_rows = mask.nrows() == 1;
            for ((i, j), score) in scores.indexed_iter_mut() {
                let allowed = if broadcast_rows {
                    mask[[0, j]]
                } else {
                    mask[[i, j]]
                };
                if !allowed {
                    *score = MASK_FILL;
                }
            }
        }

        let probs = scores.softmax(1);
        let dropped = self.dropout.forward(&probs);
        let output = dropped.matmul(v);

        if self.training {
            self.cache = Some(SdpCache {
                q: q.clone(),
                k: k.clone(),
                v: v.clone(),
                probs: probs.clone(),
            });
        }

        (output, probs)
    }

    /// 反向传播
    ///
    /// 返回 (grad_q, grad_k, grad_v)。
    pub fn backward(
        &mut self,
        grad_output: &Array2<f32>,
    ) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let cache = self
            .cache
            .as_ref()
            .expect("ScaledDotProduct: no cached forward");
        let scale = (cache.q.ncols() as f32).sqrt();

        // dropout 掩码与概率逐元素相乘，还原 dropout 后的概率
        let probs_dropped = self.dropout.backward(&cache.probs);

        // dV = P_drop^T · grad_output
        let grad_v = probs_dropped.t().to_owned().matmul(grad_output);

        // dP 经过 dropout 掩码回传
        let v_t = cache.v.t().to_owned();
        let grad_probs = self.dropout.backward(&grad_output.matmul(&v_t));

        // softmax 雅可比: dS = P ⊙ (dP - rowsum(dP ⊙ P))
        let dot = (&grad_probs * &cache.probs)
            .sum_axis(Axis(1))
            .insert_axis(Axis(1));
        let grad_scores = (&cache.probs * &(grad_probs - dot)).mapv(|x| x / scale);

        // dQ = dS · K, dK = dS^T · Q
        let grad_q = grad_scores.matmul(&cache.k);
        let grad_k = grad_scores.t().to_owned().matmul(&cache.q);

        (grad_q, grad_k, grad_v)
    }
}

/// Multi-Head Attention 层
///
/// 将 Q/K/V 线性投影后按特征轴切成 h 个子空间，每个头独立做
/// 缩放点积注意力，拼接后再做输出投影。
///
/// ```text
/// Input → [Q, K, V] → Split into Heads →
///     [Scaled Dot-Product Attention × h] →
///     Concat Heads → Linear → Output
/// ```
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    params: AttentionParams,
    /// Query 投影: [d_model, d_model]
    w_q: Linear,
    /// Key 投影: [d_model, d_model]
    w_k: Linear,
    /// Value 投影: [d_model, d_model]
    w_v: Linear,
    /// 输出投影: [d_model, d_model]
    w_o: Linear,
    /// 每个头的注意力原语（持有各自的缓存和 dropout）
    heads: Vec<ScaledDotProduct>,
    /// 最近一次前向的各头注意力概率（供外部检查）
    attn_weights: Vec<Array2<f32>>,
    /// 反向传播需要的形状信息
    shape_cache: Option<(usize, usize)>,
    training: bool,
}

impl MultiHeadAttention {
    /// 创建新的 Multi-Head Attention 层
    ///
    /// # 参数
    /// - `d_model`: 模型维度（必须能被 `n_heads` 整除）
    /// - `n_heads`: 注意力头数
    /// - `dropout`: 注意力概率上的 dropout 比率
    pub fn new(d_model: usize, n_heads: usize, dropout: f32, rng: &mut StdRng) -> Self {
        let params = AttentionParams::new(d_model, n_heads);
        let heads = (0..n_heads).map(|_| ScaledDotProduct::new(dropout)).collect();

        Self {
            params,
            w_q: Linear::new(d_model, d_model, rng),
            w_k: Linear::new(d_model, d_model, rng),
            w_v: Linear::new(d_model, d_model, rng),
            w_o: Linear::new(d_model, d_model, rng),
            heads,
            attn_weights: Vec::new(),
            shape_cache: None,
            training: false,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.w_q.set_training(training);
        self.w_k.set_training(training);
        self.w_v.set_training(training);
        self.w_o.set_training(training);
        for head in &mut self.heads {
            head.set_training(training);
        }
        if !training {
            self.shape_cache = None;
        }
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `query`: [len_q, d_model]
    /// - `key` / `value`: [len_k, d_model]
    /// - `mask`: 可选掩码，[len_q, len_k] 或 [1, len_k]
    ///
    /// # 返回
    /// - 输出 [len_q, d_model]
    pub fn forward(
        &mut self,
        query: &Array2<f32>,
        key: &Array2<f32>,
        value: &Array2<f32>,
        mask: Option<&Array2<bool>>,
    ) -> Array2<f32> {
        let d_k = self.params.d_k;
        let len_q = query.nrows();
        let len_k = key.nrows();

        let q = self.w_q.forward(query);
        let k = self.w_k.forward(key);
        let v = self.w_v.forward(value);

        let mut concat = Array2::zeros((len_q, self.params.d_model));
        self.attn_weights.clear();

        for (h, head) in self.heads.iter_mut().enumerate() {
            let cols = s![.., h * d_k..(h + 1) * d_k];
            let q_h = q.slice(cols).to_owned();
            let k_h = k.slice(cols).to_owned();
            let v_h = v.slice(cols).to_owned();

            let (out_h, probs_h) = head.forward(&q_h, &k_h, &v_h, mask);
            concat.slice_mut(cols).assign(&out_h);
            self.attn_weights.push(probs_h);
        }

        if self.training {
            self.shape_cache = Some((len_q, len_k));
        }

        self.w_o.forward(&concat)
    }

    /// 反向传播
    ///
    /// 返回 (grad_query, grad_key, grad_value)；自注意力场景由调用方
    /// 将三者相加。
    pub fn backward(
        &mut self,
        grad_output: &Array2<f32>,
    ) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let (len_q, len_k) = self
            .shape_cache
            .expect("MultiHeadAttention: no cached forward");
        let d_k = self.params.d_k;
        let d_model = self.params.d_model;

        let grad_concat = self.w_o.backward(grad_output);

        let mut grad_q = Array2::zeros((len_q, d_model));
        let mut grad_k = Array2::zeros((len_k, d_model));
        let mut grad_v = Array2::zeros((len_k, d_model));

        for (h, head) in self.heads.iter_mut().enumerate() {
            let cols = s![.., h * d_k..(h + 1) * d_k];
            let grad_out_h = grad_concat.slice(cols).to_owned();
            let (gq, gk, gv) = head.backward(&grad_out_h);

            grad_q.slice_mut(cols).assign(&gq);
            grad_k.slice_mut(cols).assign(&gk);
            grad_v.slice_mut(cols).assign(&gv);
        }

        (
            self.w_q.backward(&grad_q),
            self.w_k.backward(&grad_k),
            self.w_v.backward(&grad_v),
        )
    }

    /// 最近一次前向的各头注意力概率，每项形状 [len_q, len_k]
    pub fn attention_weights(&self) -> &[Array2<f32>] {
        &self.attn_weights
    }

    pub fn params(&self) -> &AttentionParams {
        &self.params
    }

    pub fn visit(&mut self, prefix: &str, f: &mut ParamVisitor) {
        self.w_q.visit(&format!("{}.w_q", prefix), f);
        self.w_k.visit(&format!("{}.w_k", prefix), f);
        self.w_v.visit(&format!("{}.w_v", prefix), f);
        self.w_o.visit(&format!("{}.w_o", prefix), f);
    }

    pub fn param_count(&self) -> usize {
        self.w_q.param_count()
            + self.w_k.param_count()
            + self.w_v.param_count()
            + self.w_o.param_count()
    }
}
