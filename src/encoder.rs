//! Transformer Encoder
//!
//! Encoder 层 = 自注意力子层 + 前馈子层，各自带 pre-norm 残差包装；
//! Encoder 堆叠 N 个结构相同、独立初始化的层，最后接一个 LayerNorm。

use crate::attention::MultiHeadAttention;
use crate::layers::{FeedForward, LayerNorm, SublayerConnection};
use crate::param::ParamVisitor;
use ndarray::Array2;
use rand::rngs::StdRng;

/// 单个 Encoder 层
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    self_attn: MultiHeadAttention,
    feed_forward: FeedForward,
    attn_sublayer: SublayerConnection,
    ff_sublayer: SublayerConnection,
}

impl EncoderLayer {
    pub fn new(d_model: usize, n_heads: usize, d_ff: usize, dropout: f32, rng: &mut StdRng) -> Self {
        Self {
            self_attn: MultiHeadAttention::new(d_model, n_heads, dropout, rng),
            feed_forward: FeedForward::new(d_model, d_ff, dropout, rng),
            attn_sublayer: SublayerConnection::new(d_model, dropout),
            ff_sublayer: SublayerConnection::new(d_model, dropout),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.self_attn.set_training(training);
        self.feed_forward.set_training(training);
        self.attn_sublayer.set_training(training);
        self.ff_sublayer.set_training(training);
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `x`: [seq_len, d_model]
    /// - `mask`: 源序列填充掩码 [1, seq_len]
    pub fn forward(&mut self, x: &Array2<f32>, mask: Option<&Array2<bool>>) -> Array2<f32> {
        let Self {
            self_attn,
            feed_forward,
            attn_sublayer,
            ff_sublayer,
        } = self;

        let x = attn_sublayer.forward(x, |normed| self_attn.forward(normed, normed, normed, mask));
        ff_sublayer.forward(&x, |normed| feed_forward.forward(normed))
    }

    /// 反向传播
    pub fn backward(&mut self, grad_output: &Array2<f32>) -> Array2<f32> {
        let Self {
            self_attn,
            feed_forward,
            attn_sublayer,
            ff_sublayer,
        } = self;

        let grad = ff_sublayer.backward(grad_output, |g| feed_forward.backward(g));
        attn_sublayer.backward(&grad, |g| {
            // 自注意力: q = k = v = 输入，三路梯度在入口处相加
            let (gq, gk, gv) = self_attn.backward(g);
            gq + gk + gv
        })
    }

    /// 最近一次前向的各头注意力概率
    pub fn attention_weights(&self) -> &[Array2<f32>] {
        self.self_attn.attention_weights()
    }

    pub fn visit(&mut self, prefix: &str, f: &mut ParamVisitor) {
        self.self_attn.visit(&format!("{}.self_attn", prefix), f);
        self.feed_forward.visit(&format!("{}.feed_forward", prefix), f);
        self.attn_sublayer.visit(&format!("{}.sublayer0", prefix), f);
        self.ff_sublayer.visit(&format!("{}.sublayer1", prefix), f);
    }

    pub fn param_count(&self) -> usize {
        self.self_attn.param_count() + self.feed_forward.param_count()
    }
}

/// Encoder 堆叠
///
/// N 个独立参数化的 Encoder 层顺序作用，最后做一次层归一化。
#[derive(Debug, Clone)]
pub struct Encoder {
    layers: Vec<EncoderLayer>,
    norm: LayerNorm,
}

impl Encoder {
    pub fn new(
        n_layers: usize,
        d_model: usize,
        n_heads: usize,
        d_ff: usize,
        dropout: f32,
        rng: &mut StdRng,
    ) -> Self {
        // 每层单独构造、单独初始化——结构相同但不共享权重
        let layers = (0..n_layers)
            .map(|_| EncoderLayer::new(d_model, n_heads, d_ff, dropout, rng))
            .collect();

        Self {
            layers,
            norm: LayerNorm::new(d_model, None),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
        self.norm.set_training(training);
    }

    /// 前向传播: [seq_len, d_model] -> [seq_len, d_model]
    pub fn forward(&mut self, x: &Array2<f32>, mask: Option<&Array2<bool>>) -> Array2<f32> {
        let mut x = x.clone();
        for layer in &mut self.layers {
            x = layer.forward(&x, mask);
        }
        self.norm.forward(&x)
    }

    /// 反向传播
    pub fn backward(&mut self, grad_output: &Array2<f32>) -> Array2<f32> {
        let mut grad = self.norm.backward(grad_output);
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad);
        }
        grad
    }

    pub fn layers(&self) -> &[EncoderLayer] {
        &self.layers
    }

    pub fn visit(&mut self, prefix: &str, f: &mut ParamVisitor) {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.visit(&format!("{}.layers.{}", prefix, i), f);
        }
        self.norm.visit(&format!("{}.norm", prefix), f);
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(|l| l.param_count()).sum()
    }
}
