//! Encoder-Decoder 模型
//!
//! 组合源/目标嵌入、位置编码、Encoder / Decoder 堆叠和输出投影，
//! 暴露 encode / decode / forward 以及整条反向传播链。

use crate::decoder::Decoder;
use crate::embedding::{Embedding, Generator, PositionalEncoding};
use crate::encoder::Encoder;
use crate::param::{ParamVisitor, Parameter};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// 模型配置
#[derive(Debug, Clone, Copy)]
pub struct Seq2SeqConfig {
    /// 源词表大小
    pub src_vocab: usize,
    /// 目标词表大小
    pub tgt_vocab: usize,
    /// Encoder / Decoder 层数
    pub n_layers: usize,
    /// 模型维度
    pub d_model: usize,
    /// 注意力头数
    pub n_heads: usize,
    /// FFN 隐藏层维度
    pub d_ff: usize,
    /// 最大序列长度（位置编码预计算长度）
    pub max_seq_len: usize,
    /// Dropout 比率
    pub dropout: f32,
    /// 参数初始化种子
    pub seed: u64,
}

impl Default for Seq2SeqConfig {
    fn default() -> Self {
        Self {
            src_vocab: 10000,
            tgt_vocab: 10000,
            n_layers: 6,
            d_model: 512,
            n_heads: 8,
            d_ff: 2048,
            max_seq_len: 512,
            dropout: 0.1,
            seed: 42,
        }
    }
}

/// Encoder-Decoder Transformer
///
/// ```text
/// src → Embed(×√d_model) → PosEnc → Encoder → memory
/// tgt → Embed(×√d_model) → PosEnc → Decoder(memory) → Generator → log P
/// ```
///
/// 所有秩 > 1 的参数在构造时做 Xavier 均匀初始化（由 config.seed 驱动，
/// 可复现）；偏置与归一化参数保持默认值。
#[derive(Debug, Clone)]
pub struct EncoderDecoder {
    pub src_embed: Embedding,
    pub src_pos: PositionalEncoding,
    pub tgt_embed: Embedding,
    pub tgt_pos: PositionalEncoding,
    pub encoder: Encoder,
    pub decoder: Decoder,
    pub generator: Generator,
    config: Seq2SeqConfig,
    training: bool,
}

impl EncoderDecoder {
    pub fn new(config: Seq2SeqConfig) -> Self {
        assert_eq!(
            config.d_model % config.n_heads,
            0,
            "d_model must be divisible by n_heads"
        );
        assert!(config.n_layers > 0, "n_layers must be positive");

        let mut rng = StdRng::seed_from_u64(config.seed);

        let src_embed = Embedding::new(config.src_vocab, config.d_model, &mut rng);
        let tgt_embed = Embedding::new(config.tgt_vocab, config.d_model, &mut rng);
        let encoder = Encoder::new(
            config.n_layers,
            config.d_model,
            config.n_heads,
            config.d_ff,
            config.dropout,
            &mut rng,
        );
        let decoder = Decoder::new(
            config.n_layers,
            config.d_model,
            config.n_heads,
            config.d_ff,
            config.dropout,
            &mut rng,
        );
        let generator = Generator::new(config.d_model, config.tgt_vocab, &mut rng);

        Self {
            src_embed,
            src_pos: PositionalEncoding::new(config.max_seq_len, config.d_model, config.dropout),
            tgt_embed,
            tgt_pos: PositionalEncoding::new(config.max_seq_len, config.d_model, config.dropout),
            encoder,
            decoder,
            generator,
            config,
            training: false,
        }
    }

    pub fn config(&self) -> &Seq2SeqConfig {
        &self.config
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.src_embed.set_training(training);
        self.src_pos.set_training(training);
        self.tgt_embed.set_training(training);
        self.tgt_pos.set_training(training);
        self.encoder.set_training(training);
        self.decoder.set_training(training);
        self.generator.set_training(training);
    }

    /// 编码源序列，返回 memory [src_len, d_model]
    pub fn encode(&mut self, src: &[usize], src_mask: Option<&Array2<bool>>) -> Array2<f32> {
        let embedded = self.src_embed.forward(src);
        let encoded = self.src_pos.forward(&embedded);
        self.encoder.forward(&encoded, src_mask)
    }

    /// 解码目标序列，返回 decoder 输出 [tgt_len, d_model]
    pub fn decode(
        &mut self,
        memory: &Array2<f32>,
        src_mask: Option<&Array2<bool>>,
        tgt: &[usize],
        tgt_mask: Option<&Array2<bool>>,
    ) -> Array2<f32> {
        let embedded = self.tgt_embed.forward(tgt);
        let encoded = self.tgt_pos.forward(&embedded);
        self.decoder.forward(&encoded, memory, src_mask, tgt_mask)
    }

    /// 完整前向传播（教师强制）
    pub fn forward(
        &mut self,
        src: &[usize],
        tgt: &[usize],
        src_mask: Option<&Array2<bool>>,
        tgt_mask: Option<&Array2<bool>>,
    ) -> Array2<f32> {
        let memory = self.encode(src, src_mask);
        self.decode(&memory, src_mask, tgt, tgt_mask)
    }

    /// 反向传播
    ///
    /// 输入是 decoder 输出上的梯度（Generator 的反向由损失计算方驱动），
    /// 梯度一路回传穿过 decoder、encoder 和两侧嵌入。
    pub fn backward(&mut self, grad_decoder_output: &Array2<f32>) {
        let (grad_tgt, grad_memory) = self.decoder.backward(grad_decoder_output);

        let grad_tgt_embedded = self.tgt_pos.backward(&grad_tgt);
        self.tgt_embed.backward(&grad_tgt_embedded);

        let grad_src = self.encoder.backward(&grad_memory);
        let grad_src_embedded = self.src_pos.backward(&grad_src);
        self.src_embed.backward(&grad_src_embedded);
    }

    /// 按固定顺序遍历全部命名参数
    pub fn visit_parameters(&mut self, f: &mut ParamVisitor) {
        self.src_embed.visit("src_embed", f);
        self.tgt_embed.visit("tgt_embed", f);
        self.encoder.visit("encoder", f);
        self.decoder.visit("decoder", f);
        self.generator.visit("generator", f);
    }

    /// 清零所有参数梯度
    pub fn zero_grad(&mut self) {
        self.visit_parameters(&mut |_name: &str, p: &mut Parameter| p.zero_grad());
    }

    /// 参数总数
    pub fn param_count(&mut self) -> usize {
        let mut count = 0;
        self.visit_parameters(&mut |_name: &str, p: &mut Parameter| count += p.data.len());
        count
    }
}

/// 预设配置
pub mod configs {
    use super::Seq2SeqConfig;

    /// 小型模型（用于快速测试）
    pub fn mini(src_vocab: usize, tgt_vocab: usize) -> Seq2SeqConfig {
        Seq2SeqConfig {
            src_vocab,
            tgt_vocab,
            n_layers: 2,
            d_model: 128,
            n_heads: 4,
            d_ff: 512,
            max_seq_len: 64,
            dropout: 0.1,
            seed: 42,
        }
    }

    /// 基础模型（原始 Transformer base 配置）
    pub fn base(src_vocab: usize, tgt_vocab: usize) -> Seq2SeqConfig {
        Seq2SeqConfig {
            src_vocab,
            tgt_vocab,
            n_layers: 6,
            d_model: 512,
            n_heads: 8,
            d_ff: 2048,
            max_seq_len: 512,
            dropout: 0.1,
            seed: 42,
        }
    }
}
