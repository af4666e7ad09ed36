//! 注意力掩码
//!
//! 布尔掩码，`true` = 允许关注，`false` = 屏蔽。
//! 两类掩码：填充掩码（屏蔽 pad 位置）和因果掩码（屏蔽后续位置），
//! decoder 自注意力使用两者的逻辑与。

use ndarray::Array2;

/// 因果掩码（下三角，含对角线）
///
/// `mask[i][j] == true` 当且仅当 `j <= i`，即位置 i 只能关注 0..=i。
pub fn subsequent_mask(size: usize) -> Array2<bool> {
    Array2::from_shape_fn((size, size), |(i, j)| j <= i)
}

/// 填充掩码
///
/// 形状 `[1, seq_len]`，按键轴广播：`mask[0][j] == true` 表示第 j 个
/// token 不是 pad，可以被关注。
pub fn padding_mask(ids: &[usize], pad: usize) -> Array2<bool> {
    Array2::from_shape_fn((1, ids.len()), |(_, j)| ids[j] != pad)
}

/// 目标序列掩码（教师强制用）
///
/// 填充掩码与因果掩码的逻辑与，形状 `[len, len]`：
/// 位置 i 只能关注 `j <= i` 且非 pad 的位置。
pub fn target_mask(ids: &[usize], pad: usize) -> Array2<bool> {
    let n = ids.len();
    Array2::from_shape_fn((n, n), |(i, j)| j <= i && ids[j] != pad)
}
