//! 数据集与批次加载
//!
//! Dataset 提供成对的源/目标序列，DataLoader 负责填充对齐并打包成 Batch，
//! ShardSampler 在多 worker 场景下切分索引。

use crate::batch::Batch;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// 序列对数据集接口
pub trait Dataset {
    /// 样本总数
    fn len(&self) -> usize;

    /// 取第 index 个 (源, 目标) 序列对
    fn get(&self, index: usize) -> (Vec<usize>, Vec<usize>);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 复制任务数据集
///
/// 每条样本为随机 token 序列（值域 [1, vocab)），首位固定为起始符 1，
/// 目标与源相同。种子固定则内容可复现。
#[derive(Debug, Clone)]
pub struct CopyTaskDataset {
    samples: Vec<Vec<usize>>,
}

impl CopyTaskDataset {
    /// # 参数
    /// - `vocab_size`: 词表大小（0 保留给填充，1 保留给起始符）
    /// - `seq_len`: 每条序列长度
    /// - `n_samples`: 样本条数
    /// - `seed`: 随机种子
    pub fn new(vocab_size: usize, seq_len: usize, n_samples: usize, seed: u64) -> Self {
        assert!(vocab_size > 2, "vocab_size must exceed 2");
        assert!(seq_len >= 2, "seq_len must be at least 2");

        let mut rng = StdRng::seed_from_u64(seed);
        let samples = (0..n_samples)
            .map(|_| {
                let mut seq: Vec<usize> =
                    (0..seq_len).map(|_| rng.gen_range(1..vocab_size)).collect();
                seq[0] = 1;
                seq
            })
            .collect();
        Self { samples }
    }
}

impl Dataset for CopyTaskDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> (Vec<usize>, Vec<usize>) {
        let seq = self.samples[index].clone();
        (seq.clone(), seq)
    }
}

/// 按 worker 切分样本索引
///
/// 先用 epoch 派生的种子全局洗牌，再按 rank 轮转取样。
/// 尾部不足 world_size 的余数被丢弃，保证各分片等长——
/// 梯度同步要求所有 worker 执行相同数量的优化器步。
#[derive(Debug, Clone, Copy)]
pub struct ShardSampler {
    rank: usize,
    world_size: usize,
    seed: u64,
}

impl ShardSampler {
    pub fn new(rank: usize, world_size: usize, seed: u64) -> Self {
        assert!(world_size > 0, "world_size must be positive");
        assert!(rank < world_size, "rank must be below world_size");
        Self {
            rank,
            world_size,
            seed,
        }
    }

    /// 本 worker 在该 epoch 应处理的索引
    pub fn indices(&self, n_samples: usize, epoch: usize) -> Vec<usize> {
        let mut all: Vec<usize> = (0..n_samples).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        all.shuffle(&mut rng);

        let even = n_samples - n_samples % self.world_size;
        all.truncate(even);
        all.into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

/// 把数据集切成填充对齐的批次
///
/// 每条序列右填充到 `max_padding` 长度；末尾不足一个批次的样本仍然成批。
pub struct DataLoader<'a> {
    dataset: &'a dyn Dataset,
    batch_size: usize,
    max_padding: usize,
    pad: usize,
}

impl<'a> DataLoader<'a> {
    pub fn new(dataset: &'a dyn Dataset, batch_size: usize, max_padding: usize, pad: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be positive");
        Self {
            dataset,
            batch_size,
            max_padding,
            pad,
        }
    }

    fn pad_to(&self, mut seq: Vec<usize>) -> Vec<usize> {
        assert!(
            seq.len() <= self.max_padding,
            "sequence length {} exceeds max_padding {}",
            seq.len(),
            self.max_padding
        );
        seq.resize(self.max_padding, self.pad);
        seq
    }

    /// 按给定索引顺序产出批次
    pub fn batches(&self, indices: &[usize]) -> Vec<Batch> {
        indices
            .chunks(self.batch_size)
            .map(|chunk| {
                let mut src = Vec::with_capacity(chunk.len());
                let mut tgt = Vec::with_capacity(chunk.len());
                for &i in chunk {
                    let (s, t) = self.dataset.get(i);
                    src.push(self.pad_to(s));
                    tgt.push(self.pad_to(t));
                }
                Batch::new(src, tgt, self.pad)
            })
            .collect()
    }

    /// 顺序遍历整个数据集
    pub fn all_batches(&self) -> Vec<Batch> {
        let indices: Vec<usize> = (0..self.dataset.len()).collect();
        self.batches(&indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_task_format() {
        let ds = CopyTaskDataset::new(11, 10, 20, 0);
        assert_eq!(ds.len(), 20);

        for i in 0..ds.len() {
            let (src, tgt) = ds.get(i);
            assert_eq!(src, tgt);
            assert_eq!(src.len(), 10);
            assert_eq!(src[0], 1);
            assert!(src.iter().all(|&t| t >= 1 && t < 11));
        }
    }

    #[test]
    fn test_copy_task_seeded() {
        let a = CopyTaskDataset::new(11, 8, 5, 7);
        let b = CopyTaskDataset::new(11, 8, 5, 7);
        let c = CopyTaskDataset::new(11, 8, 5, 8);
        for i in 0..5 {
            assert_eq!(a.get(i), b.get(i));
        }
        assert!((0..5).any(|i| a.get(i) != c.get(i)));
    }

    #[test]
    fn test_shard_sampler_partitions() {
        let n = 10;
        let s0 = ShardSampler::new(0, 2, 3).indices(n, 0);
        let s1 = ShardSampler::new(1, 2, 3).indices(n, 0);

        assert_eq!(s0.len() + s1.len(), n);
        let mut all: Vec<usize> = s0.iter().chain(s1.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn test_shard_sampler_equal_shards() {
        // 9 条样本、2 个 worker：丢弃余数，各得 4 条
        let s0 = ShardSampler::new(0, 2, 3).indices(9, 0);
        let s1 = ShardSampler::new(1, 2, 3).indices(9, 0);
        assert_eq!(s0.len(), 4);
        assert_eq!(s1.len(), 4);
    }

    #[test]
    fn test_shard_sampler_epoch_reshuffles() {
        let sampler = ShardSampler::new(0, 1, 3);
        let e0 = sampler.indices(50, 0);
        let e1 = sampler.indices(50, 1);
        assert_ne!(e0, e1);

        // 同一 epoch 可复现
        assert_eq!(e0, sampler.indices(50, 0));
    }

    #[test]
    fn test_loader_pads_and_batches() {
        let ds = CopyTaskDataset::new(11, 6, 5, 0);
        let loader = DataLoader::new(&ds, 2, 8, 0);
        let batches = loader.all_batches();

        // 5 条样本，批大小 2 → 3 个批次（末批 1 条）
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[2].len(), 1);

        // 右填充到 max_padding；目标做位移后长度减一
        assert_eq!(batches[0].src[0].len(), 8);
        assert_eq!(batches[0].src[0][6], 0);
        assert_eq!(batches[0].tgt[0].len(), 7);
    }

    #[test]
    #[should_panic(expected = "exceeds max_padding")]
    fn test_loader_rejects_long_sequence() {
        let ds = CopyTaskDataset::new(11, 10, 2, 0);
        let loader = DataLoader::new(&ds, 1, 6, 0);
        loader.all_batches();
    }
}
