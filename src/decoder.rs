//! Transformer Decoder
//!
//! Decoder 层 = 带因果掩码的自注意力 → 对 encoder memory 的交叉注意力
//! → 前馈网络，三个子层各自带 pre-norm 残差包装。
//! Decoder 堆叠与 Encoder 镜像，最后接一个 LayerNorm。

use crate::attention::MultiHeadAttention;
use crate::layers::{FeedForward, LayerNorm, SublayerConnection};
use crate::param::ParamVisitor;
use ndarray::Array2;
use rand::rngs::StdRng;

/// 单个 Decoder 层
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    /// 带因果掩码的自注意力
    self_attn: MultiHeadAttention,
    /// 交叉注意力：query 来自 decoder，key/value 来自 encoder memory
    src_attn: MultiHeadAttention,
    feed_forward: FeedForward,
    self_sublayer: SublayerConnection,
    src_sublayer: SublayerConnection,
    ff_sublayer: SublayerConnection,
}

impl DecoderLayer {
    pub fn new(d_model: usize, n_heads: usize, d_ff: usize, dropout: f32, rng: &mut StdRng) -> Self {
        Self {
            self_attn: MultiHeadAttention::new(d_model, n_heads, dropout, rng),
            src_attn: MultiHeadAttention::new(d_model, n_heads, dropout, rng),
            feed_forward: FeedForward::new(d_model, d_ff, dropout, rng),
            self_sublayer: SublayerConnection::new(d_model, dropout),
            src_sublayer: SublayerConnection::new(d_model, dropout),
            ff_sublayer: SublayerConnection::new(d_model, dropout),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.self_attn.set_training(training);
        self.src_attn.set_training(training);
        self.feed_forward.set_training(training);
        self.self_sublayer.set_training(training);
        self.src_sublayer.set_training(training);
        self.ff_sublayer.set_training(training);
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `x`: decoder 输入 [tgt_len, d_model]
    /// - `memory`: encoder 输出 [src_len, d_model]
    /// - `src_mask`: 源序列填充掩码 [1, src_len]
    /// - `tgt_mask`: 目标序列掩码（填充 ∧ 因果）[tgt_len, tgt_len]
    pub fn forward(
        &mut self,
        x: &Array2<f32>,
        memory: &Array2<f32>,
        src_mask: Option<&Array2<bool>>,
        tgt_mask: Option<&Array2<bool>>,
    ) -> Array2<f32> {
        let Self {
            self_attn,
            src_attn,
            feed_forward,
            self_sublayer,
            src_sublayer,
            ff_sublayer,
        } = self;

        let x =
            self_sublayer.forward(x, |normed| self_attn.forward(normed, normed, normed, tgt_mask));
        let x =
            src_sublayer.forward(&x, |normed| src_attn.forward(normed, memory, memory, src_mask));
        ff_sublayer.forward(&x, |normed| feed_forward.forward(normed))
    }

    /// 反向传播
    ///
    /// 返回 (decoder 输入梯度, encoder memory 梯度)。
    pub fn backward(&mut self, grad_output: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
        let Self {
            self_attn,
            src_attn,
            feed_forward,
            self_sublayer,
            src_sublayer,
            ff_sublayer,
        } = self;

        let grad = ff_sublayer.backward(grad_output, |g| feed_forward.backward(g));

        let mut grad_memory = None;
        let grad = src_sublayer.backward(&grad, |g| {
            let (gq, gk, gv) = src_attn.backward(g);
            grad_memory = Some(gk + gv);
            gq
        });

        let grad = self_sublayer.backward(&grad, |g| {
            let (gq, gk, gv) = self_attn.backward(g);
            gq + gk + gv
        });

        (grad, grad_memory.expect("DecoderLayer: no cross-attention gradient"))
    }

    /// 最近一次前向的交叉注意力概率
    pub fn cross_attention_weights(&self) -> &[Array2<f32>] {
        self.src_attn.attention_weights()
    }

    pub fn visit(&mut self, prefix: &str, f: &mut ParamVisitor) {
        self.self_attn.visit(&format!("{}.self_attn", prefix), f);
        self.src_attn.visit(&format!("{}.src_attn", prefix), f);
        self.feed_forward.visit(&format!("{}.feed_forward", prefix), f);
        self.self_sublayer.visit(&format!("{}.sublayer0", prefix), f);
        self.src_sublayer.visit(&format!("{}.sublayer1", prefix), f);
        self.ff_sublayer.visit(&format!("{}.sublayer2", prefix), f);
    }

    pub fn param_count(&self) -> usize {
        self.self_attn.param_count() + self.src_attn.param_count() + self.feed_forward.param_count()
    }
}

/// Decoder 堆叠
#[derive(Debug, Clone)]
pub struct Decoder {
    layers: Vec<DecoderLayer>,
    norm: LayerNorm,
}

impl Decoder {
    pub fn new(
        n_layers: usize,
        d_model: usize,
        n_heads: usize,
        d_ff: usize,
        dropout: f32,
        rng: &mut StdRng,
    ) -> Self {
        let layers = (0..n_layers)
            .map(|_| DecoderLayer::new(d_model, n_heads, d_ff, dropout, rng))
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

    /// 前向传播: [tgt_len, d_model] -> [tgt_len, d_model]
    pub fn forward(
        &mut self,
        x: &Array2<f32>,
        memory: &Array2<f32>,
        src_mask: Option<&Array2<bool>>,
        tgt_mask: Option<&Array2<bool>>,
    ) -> Array2<f32> {
        let mut x = x.clone();
        for layer in &mut self.layers {
            x = layer.forward(&x, memory, src_mask, tgt_mask);
        }
        self.norm.forward(&x)
    }

    /// 反向传播
    ///
    /// 每层对 memory 都有一份梯度贡献，跨层累加后一并返回。
    pub fn backward(&mut self, grad_output: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
        let mut grad = self.norm.backward(grad_output);
        let mut grad_memory: Option<Array2<f32>> = None;

        for layer in self.layers.iter_mut().rev() {
            let (g, gm) = layer.backward(&grad);
            grad = g;
            grad_memory = Some(match grad_memory {
                Some(acc) => acc + gm,
                None => gm,
            });
        }

        (grad, grad_memory.expect("Decoder: empty layer stack"))
    }

    pub fn layers(&self) -> &[DecoderLayer] {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::{padding_mask, target_mask};
    use crate::tensor::TensorExt;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(9)
    }

    #[test]
    fn test_decoder_layer_shapes() {
        let mut layer = DecoderLayer::new(32, 4, 64, 0.0, &mut rng());

        let x = Array2::random_xavier((4, 32), &mut rng());
        let memory = Array2::random_xavier((7, 32), &mut rng());
        let src_mask = padding_mask(&[1, 2, 3, 4, 5, 0, 0], 0);
        let tgt_mask = target_mask(&[1, 2, 3, 4], 0);

        let y = layer.forward(&x, &memory, Some(&src_mask), Some(&tgt_mask));
        assert_eq!(y.shape(), &[4, 32]);
    }

    #[test]
    fn test_decoder_backward_returns_memory_grad() {
        let mut decoder = Decoder::new(2, 16, 2, 32, 0.0, &mut rng());
        decoder.set_training(true);

        let x = Array2::random_xavier((3, 16), &mut rng());
        let memory = Array2::random_xavier((5, 16), &mut rng());
        let tgt_mask = target_mask(&[1, 2, 3], 0);

        let y = decoder.forward(&x, &memory, None, Some(&tgt_mask));
        assert_eq!(y.shape(), &[3, 16]);

        let (grad_x, grad_memory) = decoder.backward(&Array2::ones((3, 16)));
        assert_eq!(grad_x.shape(), &[3, 16]);
        assert_eq!(grad_memory.shape(), &[5, 16]);

        // memory 确实收到非零梯度
        assert!(grad_memory.iter().any(|&g| g.abs() > 1e-8));
    }
}
