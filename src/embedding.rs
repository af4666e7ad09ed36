//! 嵌入层、位置编码和输出投影
//!
//! 将离散的 token ID 转换为连续的向量表示，添加位置信息；
//! Generator 把模型输出投影回词表并取 log-softmax。

use crate::layers::{Dropout, Linear};
use crate::param::{ParamVisitor, Parameter};
use crate::tensor::TensorExt;
use ndarray::{s, Array2, Axis};
use rand::rngs::StdRng;

/// 词嵌入层
///
/// 将 token ID 映射到 d_model 维向量，结果乘以 √d_model——
/// 补偿随后加上的位置编码的相对幅度。
#[derive(Debug, Clone)]
pub struct Embedding {
    /// 权重矩阵: [vocab_size, d_model]
    pub weight: Parameter,
    vocab_size: usize,
    d_model: usize,
    /// 缓存输入 token（反向传播按行散射梯度）
    ids_cache: Option<Vec<usize>>,
    training: bool,
}

impl Embedding {
    pub fn new(vocab_size: usize, d_model: usize, rng: &mut StdRng) -> Self {
        Self {
            weight: Parameter::new(Array2::random_xavier((vocab_size, d_model), rng)),
            vocab_size,
            d_model,
            ids_cache: None,
            training: false,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        if !training {
            self.ids_cache = None;
        }
    }

    /// 前向传播: [seq_len] token IDs -> [seq_len, d_model]
    pub fn forward(&mut self, input: &[usize]) -> Array2<f32> {
        let scale = (self.d_model as f32).sqrt();
        let mut embedded = Array2::zeros((input.len(), self.d_model));

        for (i, &token_id) in input.iter().enumerate() {
            assert!(
                token_id < self.vocab_size,
                "token id {} out of vocabulary (size {})",
                token_id,
                self.vocab_size
            );
            let row = self.weight.data.row(token_id).mapv(|v| v * scale);
            embedded.row_mut(i).assign(&row);
        }

        if self.training {
            self.ids_cache = Some(input.to_vec());
        }

        embedded
    }

    /// 反向传播：梯度按 token 行累积进嵌入表
    pub fn backward(&mut self, grad_output: &Array2<f32>) {
        let ids = self.ids_cache.as_ref().expect("Embedding: no cached input");
        let scale = (self.d_model as f32).sqrt();

        for (i, &token_id) in ids.iter().enumerate() {
            let grad_row = grad_output.row(i).mapv(|v| v * scale);
            let mut target = self.weight.grad.row_mut(token_id);
            target += &grad_row;
        }
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn visit(&mut self, prefix: &str, f: &mut ParamVisitor) {
        f(&format!("{}.weight", prefix), &mut self.weight);
    }
}

/// 位置编码
///
/// 确定性的正弦/余弦位置信号，预计算到最大长度后按需切片；
/// 常量缓冲区，不参与梯度更新。编码之后接 dropout。
///
/// ```text
/// PE(pos, 2i)   = sin(pos / 10000^(2i/d_model))
/// PE(pos, 2i+1) = cos(pos / 10000^(2i/d_model))
/// ```
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    /// 预计算的位置编码: [max_seq_len, d_model]
    pe: Array2<f32>,
    dropout: Dropout,
    max_seq_len: usize,
}

impl PositionalEncoding {
    pub fn new(max_seq_len: usize, d_model: usize, dropout: f32) -> Self {
        let mut pe = Array2::zeros((max_seq_len, d_model));

        for pos in 0..max_seq_len {
            for i in (0..d_model).step_by(2) {
                let freq = (-(i as f32) * (10000.0_f32).ln() / d_model as f32).exp();

                pe[[pos, i]] = ((pos as f32) * freq).sin();
                if i + 1 < d_model {
                    pe[[pos, i + 1]] = ((pos as f32) * freq).cos();
                }
            }
        }

        Self {
            pe,
            dropout: Dropout::new(dropout),
            max_seq_len,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }

    /// 前向传播: [seq_len, d_model] -> [seq_len, d_model]
    pub fn forward(&mut self, x: &Array2<f32>) -> Array2<f32> {
        let seq_len = x.nrows();
        assert!(
            seq_len <= self.max_seq_len,
            "sequence length {} exceeds maximum length {}",
            seq_len,
            self.max_seq_len
        );

        let pe_slice = self.pe.slice(s![..seq_len, ..]);
        self.dropout.forward(&(x + &pe_slice))
    }

    /// 反向传播：位置编码是常量，只需回传 dropout 梯度
    pub fn backward(&self, grad_output: &Array2<f32>) -> Array2<f32> {
        self.dropout.backward(grad_output)
    }

    /// 获取位置编码缓冲区
    pub fn encoding(&self) -> &Array2<f32> {
        &self.pe
    }
}

/// 输出投影（Generator）
///
/// 从 d_model 投影到词表大小，沿词表轴取 log-softmax，
/// 产出供损失计算和贪婪解码使用的对数概率。
#[derive(Debug, Clone)]
pub struct Generator {
    proj: Linear,
    /// 缓存 softmax 概率（log-softmax 反向用）
    probs_cache: Option<Array2<f32>>,
    training: bool,
}

impl Generator {
    pub fn new(d_model: usize, vocab_size: usize, rng: &mut StdRng) -> Self {
        Self {
            proj: Linear::new(d_model, vocab_size, rng),
            probs_cache: None,
            training: false,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.proj.set_training(training);
        if !training {
            self.probs_cache = None;
        }
    }

    /// 前向传播: [n, d_model] -> [n, vocab_size] 对数概率
    pub fn forward(&mut self, x: &Array2<f32>) -> Array2<f32> {
        let logits = self.proj.forward(x);
        let log_probs = logits.log_softmax(1);

        if self.training {
            self.probs_cache = Some(log_probs.mapv(|v| v.exp()));
        }

        log_probs
    }

    /// 反向传播：输入是对数概率上的梯度，返回 d_model 上的梯度
    pub fn backward(&mut self, grad_log_probs: &Array2<f32>) -> Array2<f32> {
        let probs = self
            .probs_cache
            .as_ref()
            .expect("Generator: no cached forward");

        // log-softmax 反向: dL/dlogits = g - softmax ⊙ rowsum(g)
        let row_sum = grad_log_probs.sum_axis(Axis(1)).insert_axis(Axis(1));
        let grad_logits = grad_log_probs - &(probs * &row_sum);

        self.proj.backward(&grad_logits)
    }

    pub fn visit(&mut self, prefix: &str, f: &mut ParamVisitor) {
        self.proj.visit(&format!("{}.proj", prefix), f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    #[test]
    fn test_embedding_shape_and_scale() {
        let mut embedding = Embedding::new(100, 64, &mut rng());
        let input = vec![0, 5, 10];
        let output = embedding.forward(&input);

        assert_eq!(output.shape(), &[3, 64]);

        // 输出 = 权重行 × √d_model
        let scale = 64.0_f32.sqrt();
        let expected = embedding.weight.data[[5, 0]] * scale;
        assert!((output[[1, 0]] - expected).abs() < 1e-5);
    }

    #[test]
    #[should_panic(expected = "out of vocabulary")]
    fn test_embedding_rejects_out_of_vocab() {
        let mut embedding = Embedding::new(10, 8, &mut rng());
        embedding.forward(&[10]);
    }

    #[test]
    fn test_embedding_backward_scatters_rows() {
        let mut embedding = Embedding::new(10, 4, &mut rng());
        embedding.set_training(true);

        let _ = embedding.forward(&[2, 2, 7]);
        let grad = Array2::ones((3, 4));
        embedding.backward(&grad);

        let scale = 4.0_f32.sqrt();
        // token 2 出现两次，梯度翻倍
        assert!((embedding.weight.grad[[2, 0]] - 2.0 * scale).abs() < 1e-5);
        assert!((embedding.weight.grad[[7, 0]] - scale).abs() < 1e-5);
        assert_eq!(embedding.weight.grad[[0, 0]], 0.0);
    }

    #[test]
    fn test_positional_encoding_first_position() {
        let pe = PositionalEncoding::new(10, 4, 0.0);
        let encoding = pe.encoding();

        assert_eq!(encoding.shape(), &[10, 4]);

        // 位置 0: sin(0) = 0, cos(0) = 1
        assert!(encoding[[0, 0]].abs() < 1e-6);
        assert!((encoding[[0, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_positional_encoding_added() {
        let mut pe = PositionalEncoding::new(16, 8, 0.0);
        let x = Array2::zeros((4, 8));
        let y = pe.forward(&x);

        // 输入为零时输出等于编码本身
        for i in 0..4 {
            for j in 0..8 {
                assert!((y[[i, j]] - pe.encoding()[[i, j]]).abs() < 1e-6);
            }
        }
    }

    #[test]
    #[should_panic(expected = "exceeds maximum length")]
    fn test_positional_encoding_length_check() {
        let mut pe = PositionalEncoding::new(4, 8, 0.0);
        pe.forward(&Array2::zeros((5, 8)));
    }

    #[test]
    fn test_generator_log_probs() {
        let mut generator = Generator::new(16, 32, &mut rng());
        let x = Array2::random_xavier((3, 16), &mut rng());
        let lp = generator.forward(&x);

        assert_eq!(lp.shape(), &[3, 32]);

        // 每行 exp 之和为 1，对数概率非正
        for row in 0..3 {
            let sum: f32 = lp.row(row).iter().map(|&v| v.exp()).sum();
            assert!((sum - 1.0).abs() < 1e-4);
        }
        assert!(lp.iter().all(|&v| v <= 0.0));
    }
}
