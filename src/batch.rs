//! 训练批次
//!
//! 把填充对齐的源/目标序列打包成带掩码的批次，
//! 目标序列做教师强制位移：输入去尾、标签去头。

use crate::mask::{padding_mask, target_mask};
use ndarray::Array2;

/// 一个批次的序列与掩码
///
/// 序列按行存放；掩码逐序列构造：源掩码 [1, src_len]（填充不可见），
/// 目标掩码 [t, t]（因果 ∧ 填充不可见，t = tgt_len − 1）。
#[derive(Debug, Clone)]
pub struct Batch {
    /// 源序列，每条 src_len 个 token
    pub src: Vec<Vec<usize>>,
    /// 目标输入（去掉末位）
    pub tgt: Vec<Vec<usize>>,
    /// 目标标签（去掉首位）
    pub tgt_y: Vec<Vec<usize>>,
    /// 逐序列源掩码
    pub src_mask: Vec<Array2<bool>>,
    /// 逐序列目标掩码
    pub tgt_mask: Vec<Array2<bool>>,
    /// 标签中非填充 token 数
    pub ntokens: usize,
}

impl Batch {
    /// 构造带目标的训练批次
    pub fn new(src: Vec<Vec<usize>>, tgt: Vec<Vec<usize>>, pad: usize) -> Self {
        assert_eq!(src.len(), tgt.len(), "src/tgt sequence count mismatch");
        assert!(
            tgt.iter().all(|t| t.len() >= 2),
            "target sequences need at least 2 tokens for shifting"
        );

        let src_mask = src.iter().map(|s| padding_mask(s, pad)).collect();

        let mut tgt_in = Vec::with_capacity(tgt.len());
        let mut tgt_y = Vec::with_capacity(tgt.len());
        let mut tgt_mask = Vec::with_capacity(tgt.len());
        let mut ntokens = 0;

        for t in &tgt {
            let input = t[..t.len() - 1].to_vec();
            let labels = t[1..].to_vec();
            ntokens += labels.iter().filter(|&&tok| tok != pad).count();
            tgt_mask.push(target_mask(&input, pad));
            tgt_in.push(input);
            tgt_y.push(labels);
        }

        Self {
            src,
            tgt: tgt_in,
            tgt_y,
            src_mask,
            tgt_mask,
            ntokens,
        }
    }

    /// 构造仅有源序列的批次（推理用）
    pub fn source_only(src: Vec<Vec<usize>>, pad: usize) -> Self {
        let src_mask = src.iter().map(|s| padding_mask(s, pad)).collect();
        Self {
            src,
            tgt: Vec::new(),
            tgt_y: Vec::new(),
            src_mask,
            tgt_mask: Vec::new(),
            ntokens: 0,
        }
    }

    /// 批内序列条数
    pub fn len(&self) -> usize {
        self.src.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }
}

/// 训练进度计数
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainState {
    /// 已处理批次数
    pub step: usize,
    /// 已执行优化器步数
    pub accum_step: usize,
    /// 已处理序列条数
    pub samples: usize,
    /// 已处理标签 token 数
    pub tokens: usize,
}
