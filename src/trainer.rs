//! 训练循环
//!
//! run_epoch 逐批执行前向、损失、反向，并按梯度累积间隔驱动
//! 优化器与学习率调度；调度步数使用优化器步数而非批次数。

use crate::batch::{Batch, TrainState};
use crate::distributed::{average_gradients, Collective};
use crate::embedding::Generator;
use crate::loss::LabelSmoothing;
use crate::lr_scheduler::LRScheduler;
use crate::model::EncoderDecoder;
use crate::optimizer::Optimizer;
use crate::param::Parameter;
use ndarray::Array2;
use std::time::Instant;

/// 一轮训练的运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainMode {
    /// 训练，不打印进度
    Train,
    /// 训练并周期性打印进度
    TrainLog,
    /// 仅评估，不更新参数
    Eval,
}

/// 训练配置
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// 每批序列条数
    pub batch_size: usize,
    /// 是否启用多 worker 数据并行
    pub distributed: bool,
    /// 训练轮数
    pub num_epochs: usize,
    /// 梯度累积间隔（多少个批次执行一次优化器步）
    pub accum_iter: usize,
    /// Noam 调度的整体系数
    pub base_lr: f32,
    /// 序列填充到的统一长度
    pub max_padding: usize,
    /// 预热步数
    pub warmup: usize,
    /// 检查点文件名前缀
    pub file_prefix: String,
    /// worker 数（distributed 为 false 时忽略）
    pub workers: usize,
    /// 数据与初始化种子
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            distributed: false,
            num_epochs: 8,
            accum_iter: 1,
            base_lr: 1.0,
            max_padding: 72,
            warmup: 3000,
            file_prefix: "model_".to_string(),
            workers: 1,
            seed: 42,
        }
    }
}

/// 损失计算：Generator 前向 + 标签平滑 + 梯度回传到 decoder 输出
pub struct LossCompute {
    criterion: LabelSmoothing,
}

impl LossCompute {
    pub fn new(criterion: LabelSmoothing) -> Self {
        Self { criterion }
    }

    /// # 参数
    /// - `generator`: 模型输出投影
    /// - `dec_output`: decoder 输出 [t, d_model]
    /// - `targets`: t 个标签 token
    /// - `norm`: 损失归一化尺度（通常为批内非填充 token 数）
    ///
    /// # 返回
    /// (未归一化的损失总和, 对 decoder 输出的梯度（已除以 norm）)
    pub fn compute(
        &self,
        generator: &mut Generator,
        dec_output: &Array2<f32>,
        targets: &[usize],
        norm: f32,
    ) -> (f32, Array2<f32>) {
        let log_probs = generator.forward(dec_output);
        let (loss, grad_log_probs) = self.criterion.forward(&log_probs, targets);
        let grad_dec = generator.backward(&(grad_log_probs / norm));
        (loss, grad_dec)
    }

    /// 仅计算损失，不做反向传播（评估用）
    pub fn loss(
        &self,
        generator: &mut Generator,
        dec_output: &Array2<f32>,
        targets: &[usize],
    ) -> f32 {
        let log_probs = generator.forward(dec_output);
        self.criterion.forward(&log_probs, targets).0
    }
}

/// 跑一轮训练或评估
///
/// # 参数
/// - `accum_iter`: 每多少个批次执行一次优化器步
/// - `state`: 跨 epoch 延续的进度计数
/// - `collective`: 数据并行时在每次优化器步前做梯度平均
///
/// # 返回
/// (平均每 token 损失, 更新后的进度)
#[allow(clippy::too_many_arguments)]
pub fn run_epoch(
    model: &mut EncoderDecoder,
    batches: &[Batch],
    loss_compute: &LossCompute,
    optimizer: &mut dyn Optimizer,
    scheduler: &dyn LRScheduler,
    mode: TrainMode,
    accum_iter: usize,
    mut state: TrainState,
    collective: Option<&dyn Collective>,
) -> (f32, TrainState) {
    assert!(accum_iter > 0, "accum_iter must be positive");

    let training = mode != TrainMode::Eval;
    model.set_training(training);

    let mut total_loss = 0.0;
    let mut total_tokens = 0usize;
    let mut window_loss = 0.0;
    let mut window_tokens = 0usize;
    let start = Instant::now();

    for (i, batch) in batches.iter().enumerate() {
        let norm = batch.ntokens.max(1) as f32;
        let mut batch_loss = 0.0;

        for s in 0..batch.len() {
            let out = model.forward(
                &batch.src[s],
                &batch.tgt[s],
                Some(&batch.src_mask[s]),
                Some(&batch.tgt_mask[s]),
            );
            if training {
                let (loss, grad_dec) =
                    loss_compute.compute(&mut model.generator, &out, &batch.tgt_y[s], norm);
                batch_loss += loss;
                model.backward(&grad_dec);
            } else {
                batch_loss += loss_compute.loss(&mut model.generator, &out, &batch.tgt_y[s]);
            }
        }

        total_loss += batch_loss;
        total_tokens += batch.ntokens;
        window_loss += batch_loss;
        window_tokens += batch.ntokens;

        if training {
            state.step += 1;
            state.samples += batch.len();
            state.tokens += batch.ntokens;

            if (i + 1) % accum_iter == 0 {
                if let Some(c) = collective {
                    average_gradients(model, c);
                }
                state.accum_step += 1;
                optimizer.set_lr(scheduler.get_lr(state.accum_step));
                model.visit_parameters(&mut |name: &str, p: &mut Parameter| {
                    optimizer.update(name, p);
                });
                model.zero_grad();
            }
        }

        if mode == TrainMode::TrainLog && (i + 1) % 40 == 0 {
            let elapsed = start.elapsed().as_secs_f32().max(1e-6);
            println!(
                "批次 {:5} | 优化步 {:5} | 损失/token {:.4} | token/s {:8.1} | lr {:.2e}",
                i + 1,
                state.accum_step,
                window_loss / window_tokens.max(1) as f32,
                state.tokens as f32 / elapsed,
                optimizer.lr()
            );
            window_loss = 0.0;
            window_tokens = 0;
        }
    }

    (total_loss / total_tokens.max(1) as f32, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{CopyTaskDataset, DataLoader, Dataset};
    use crate::lr_scheduler::{ConstantLR, NoamLR};
    use crate::model::{configs, EncoderDecoder, Seq2SeqConfig};
    use crate::optimizer::Adam;

    fn tiny_model(vocab: usize) -> EncoderDecoder {
        EncoderDecoder::new(Seq2SeqConfig {
            n_layers: 1,
            d_model: 16,
            n_heads: 2,
            d_ff: 32,
            max_seq_len: 16,
            dropout: 0.0,
            seed: 0,
            ..configs::mini(vocab, vocab)
        })
    }

    #[test]
    fn test_eval_mode_keeps_parameters() {
        let mut model = tiny_model(11);
        let ds = CopyTaskDataset::new(11, 5, 4, 0);
        let batches = DataLoader::new(&ds, 2, 6, 0).all_batches();
        let loss_compute = LossCompute::new(LabelSmoothing::new(11, 0, 0.0));
        let mut opt = Adam::new(0.1);
        let scheduler = ConstantLR::new(0.1);

        let mut before = Vec::new();
        model.visit_parameters(&mut |_n: &str, p: &mut Parameter| before.push(p.data.clone()));

        let (loss, state) = run_epoch(
            &mut model,
            &batches,
            &loss_compute,
            &mut opt,
            &scheduler,
            TrainMode::Eval,
            1,
            TrainState::default(),
            None,
        );

        assert!(loss > 0.0);
        assert_eq!(state.step, 0);
        let mut i = 0;
        model.visit_parameters(&mut |_n: &str, p: &mut Parameter| {
            assert_eq!(p.data, before[i]);
            i += 1;
        });
    }

    #[test]
    fn test_accumulation_counts_optimizer_steps() {
        let mut model = tiny_model(11);
        let ds = CopyTaskDataset::new(11, 5, 8, 0);
        let batches = DataLoader::new(&ds, 2, 6, 0).all_batches();
        assert_eq!(batches.len(), 4);

        let loss_compute = LossCompute::new(LabelSmoothing::new(11, 0, 0.1));
        let mut opt = Adam::new(0.001);
        let scheduler = ConstantLR::new(0.001);

        let (_, state) = run_epoch(
            &mut model,
            &batches,
            &loss_compute,
            &mut opt,
            &scheduler,
            TrainMode::Train,
            2,
            TrainState::default(),
            None,
        );

        // 4 个批次、累积间隔 2 → 2 次优化器步
        assert_eq!(state.step, 4);
        assert_eq!(state.accum_step, 2);
        assert_eq!(state.samples, 8);
    }

    #[test]
    fn test_parameters_change_only_on_optimizer_step() {
        let mut model = tiny_model(11);
        let ds = CopyTaskDataset::new(11, 5, 4, 0);
        let batches = DataLoader::new(&ds, 2, 6, 0).all_batches();
        assert_eq!(batches.len(), 2);

        let loss_compute = LossCompute::new(LabelSmoothing::new(11, 0, 0.1));
        let mut opt = Adam::new(0.001);
        let scheduler = ConstantLR::new(0.001);

        let snapshot = |m: &mut EncoderDecoder| {
            let mut v = Vec::new();
            m.visit_parameters(&mut |_n: &str, p: &mut Parameter| v.push(p.data.clone()));
            v
        };

        // 只跑 1 个批次、累积间隔 2：未到步点，参数不变
        let before = snapshot(&mut model);
        let (_, state) = run_epoch(
            &mut model,
            &batches[..1],
            &loss_compute,
            &mut opt,
            &scheduler,
            TrainMode::Train,
            2,
            TrainState::default(),
            None,
        );
        assert_eq!(state.accum_step, 0);
        assert_eq!(snapshot(&mut model), before);

        // 2 个批次到达步点，参数更新
        let (_, state) = run_epoch(
            &mut model,
            &batches,
            &loss_compute,
            &mut opt,
            &scheduler,
            TrainMode::Train,
            2,
            state,
            None,
        );
        assert_eq!(state.accum_step, 1);
        assert_ne!(snapshot(&mut model), before);
    }

    #[test]
    fn test_scheduler_follows_accum_step() {
        let mut model = tiny_model(11);
        let ds = CopyTaskDataset::new(11, 5, 8, 0);
        let batches = DataLoader::new(&ds, 2, 6, 0).all_batches();

        let loss_compute = LossCompute::new(LabelSmoothing::new(11, 0, 0.1));
        let mut opt = Adam::new(1.0);
        let scheduler = NoamLR::new(16, 1.0, 400);

        let (_, state) = run_epoch(
            &mut model,
            &batches,
            &loss_compute,
            &mut opt,
            &scheduler,
            TrainMode::Train,
            2,
            TrainState::default(),
            None,
        );

        // 最后一次优化器步的学习率由 accum_step（而非批次数）决定
        assert_eq!(state.accum_step, 2);
        assert!((opt.lr() - scheduler.get_lr(2)).abs() < 1e-12);
    }

    #[test]
    fn test_copy_task_loss_decreases() {
        let vocab = 11;
        let mut model = tiny_model(vocab);
        let ds = CopyTaskDataset::new(vocab, 5, 16, 0);
        let batches = DataLoader::new(&ds, 4, 6, 0).all_batches();

        let loss_compute = LossCompute::new(LabelSmoothing::new(vocab, 0, 0.0));
        let mut opt = Adam::new(0.0).with_betas(0.9, 0.98).with_epsilon(1e-9);
        let scheduler = NoamLR::new(16, 1.0, 40);

        let mut state = TrainState::default();
        let (first_loss, s) = run_epoch(
            &mut model,
            &batches,
            &loss_compute,
            &mut opt,
            &scheduler,
            TrainMode::Train,
            1,
            state,
            None,
        );
        state = s;

        let mut last_loss = first_loss;
        for _ in 0..10 {
            let (loss, s) = run_epoch(
                &mut model,
                &batches,
                &loss_compute,
                &mut opt,
                &scheduler,
                TrainMode::Train,
                1,
                state,
                None,
            );
            state = s;
            last_loss = loss;
        }

        assert!(
            last_loss < first_loss,
            "loss should decrease: first {} last {}",
            first_loss,
            last_loss
        );
    }

    #[test]
    #[ignore] // 训练到收敛较慢，cargo test -- --ignored 运行
    fn test_copy_task_learns_to_copy() {
        use crate::generate::greedy_decode;
        use crate::mask::padding_mask;

        let vocab = 11;
        let seq_len = 6;
        let mut model = EncoderDecoder::new(Seq2SeqConfig {
            n_layers: 2,
            d_model: 64,
            n_heads: 4,
            d_ff: 128,
            max_seq_len: 16,
            dropout: 0.0,
            seed: 0,
            ..configs::mini(vocab, vocab)
        });
        let ds = CopyTaskDataset::new(vocab, seq_len, 64, 0);
        let batches = DataLoader::new(&ds, 8, seq_len + 1, 0).all_batches();

        let loss_compute = LossCompute::new(LabelSmoothing::new(vocab, 0, 0.0));
        let mut opt = Adam::new(0.0).with_betas(0.9, 0.98).with_epsilon(1e-9);
        let scheduler = NoamLR::new(64, 1.0, 100);

        let mut state = TrainState::default();
        for _ in 0..40 {
            let (_, s) = run_epoch(
                &mut model,
                &batches,
                &loss_compute,
                &mut opt,
                &scheduler,
                TrainMode::Train,
                1,
                state,
                None,
            );
            state = s;
        }

        // 训练后的模型应能逐 token 复制源序列
        let mut correct = 0;
        let mut total = 0;
        for i in 0..8 {
            let (src, _) = ds.get(i);
            let mask = padding_mask(&src, 0);
            let out = greedy_decode(&mut model, &src, Some(&mask), src.len(), 1);
            for (a, b) in out.iter().zip(src.iter()) {
                if a == b {
                    correct += 1;
                }
                total += 1;
            }
        }
        let acc = correct as f32 / total as f32;
        assert!(acc > 0.8, "copy accuracy too low: {}", acc);
    }
}
