//! 贪心解码
//!
//! 编码一次源序列，然后自回归地逐位取 argmax，
//! 固定生成 max_len 个 token（含起始符），不做提前停止。

use crate::mask::subsequent_mask;
use crate::model::EncoderDecoder;
use ndarray::Array2;

/// 贪心生成
///
/// # 参数
/// - `src`: 源 token 序列
/// - `src_mask`: 源填充掩码 [1, src_len]
/// - `max_len`: 输出总长度（含起始符）
/// - `start_symbol`: 起始符 token
///
/// # 返回
/// 长度为 max_len 的 token 序列，首位为 start_symbol
pub fn greedy_decode(
    model: &mut EncoderDecoder,
    src: &[usize],
    src_mask: Option<&Array2<bool>>,
    max_len: usize,
    start_symbol: usize,
) -> Vec<usize> {
    assert!(max_len >= 1, "max_len must be at least 1");

    model.set_training(false);
    let memory = model.encode(src, src_mask);

    let mut ys = vec![start_symbol];
    for _ in 1..max_len {
        let tgt_mask = subsequent_mask(ys.len());
        let out = model.decode(&memory, src_mask, &ys, Some(&tgt_mask));
        let log_probs = model.generator.forward(&out);

        let last = log_probs.row(log_probs.nrows() - 1);
        let mut next = 0;
        let mut best = f32::NEG_INFINITY;
        for (i, &v) in last.iter().enumerate() {
            if v > best {
                best = v;
                next = i;
            }
        }
        ys.push(next);
    }
    ys
}
