//! 数据并行训练
//!
//! Collective 抽象 worker 间的通信原语，ThreadCollective 用线程 +
//! 共享内存实现；worker 以相同参数起步，每次优化器步前做梯度
//! 全归约平均，使所有副本保持一致。

use crate::checkpoint::{epoch_path, final_path, ModelSnapshot};
use crate::dataset::{DataLoader, Dataset, ShardSampler};
use crate::loss::LabelSmoothing;
use crate::lr_scheduler::NoamLR;
use crate::model::{EncoderDecoder, Seq2SeqConfig};
use crate::optimizer::Adam;
use crate::param::Parameter;
use crate::trainer::{run_epoch, LossCompute, TrainConfig, TrainMode};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

/// worker 间通信原语
pub trait Collective {
    /// 本 worker 序号
    fn rank(&self) -> usize;

    /// worker 总数
    fn world_size(&self) -> usize;

    /// 把 rank 0 的数据复制给所有 worker
    fn broadcast(&self, data: &mut [f32]);

    /// 所有 worker 的逐元素求和，结果写回各自的 data
    fn all_reduce_sum(&self, data: &mut [f32]);

    /// 等待所有 worker 到达
    fn barrier(&self);
}

struct Group {
    barrier: Barrier,
    buffer: Mutex<Vec<f32>>,
}

/// 线程版 Collective
///
/// 共享缓冲区三段式协议：写入 → 屏障 → 读取 → 屏障 → rank 0 清空 → 屏障，
/// 保证下一次通信开始前缓冲区已复位。
pub struct ThreadCollective {
    rank: usize,
    world_size: usize,
    group: Arc<Group>,
}

impl ThreadCollective {
    /// 创建一组互联的 collective 句柄，第 i 个给 rank i
    pub fn group(world_size: usize) -> Vec<Self> {
        assert!(world_size > 0, "world_size must be positive");
        let group = Arc::new(Group {
            barrier: Barrier::new(world_size),
            buffer: Mutex::new(Vec::new()),
        });
        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                group: Arc::clone(&group),
            })
            .collect()
    }

    fn finish_round(&self) {
        self.group.barrier.wait();
        if self.rank == 0 {
            self.group.buffer.lock().unwrap().clear();
        }
        self.group.barrier.wait();
    }
}

impl Collective for ThreadCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast(&self, data: &mut [f32]) {
        if self.world_size == 1 {
            return;
        }
        if self.rank == 0 {
            let mut buf = self.group.buffer.lock().unwrap();
            buf.clear();
            buf.extend_from_slice(data);
        }
        self.group.barrier.wait();
        {
            let buf = self.group.buffer.lock().unwrap();
            assert_eq!(buf.len(), data.len(), "broadcast length mismatch");
            data.copy_from_slice(&buf);
        }
        self.finish_round();
    }

    fn all_reduce_sum(&self, data: &mut [f32]) {
        if self.world_size == 1 {
            return;
        }
        {
            let mut buf = self.group.buffer.lock().unwrap();
            if buf.is_empty() {
                buf.resize(data.len(), 0.0);
            }
            assert_eq!(buf.len(), data.len(), "all-reduce length mismatch");
            for (acc, &x) in buf.iter_mut().zip(data.iter()) {
                *acc += x;
            }
        }
        self.group.barrier.wait();
        {
            let buf = self.group.buffer.lock().unwrap();
            data.copy_from_slice(&buf);
        }
        self.finish_round();
    }

    fn barrier(&self) {
        self.group.barrier.wait();
    }
}

/// 把所有参数展平成一个向量（遍历顺序固定）
pub fn flatten_params(model: &mut EncoderDecoder) -> Vec<f32> {
    let mut flat = Vec::new();
    model.visit_parameters(&mut |_n: &str, p: &mut Parameter| {
        flat.extend(p.data.iter().copied());
    });
    flat
}

/// 按遍历顺序把展平向量写回参数
pub fn apply_params(model: &mut EncoderDecoder, flat: &[f32]) {
    let mut offset = 0;
    model.visit_parameters(&mut |_n: &str, p: &mut Parameter| {
        let len = p.data.len();
        for (dst, &src) in p.data.iter_mut().zip(&flat[offset..offset + len]) {
            *dst = src;
        }
        offset += len;
    });
    assert_eq!(offset, flat.len(), "parameter count mismatch");
}

/// 展平所有梯度
pub fn flatten_grads(model: &mut EncoderDecoder) -> Vec<f32> {
    let mut flat = Vec::new();
    model.visit_parameters(&mut |_n: &str, p: &mut Parameter| {
        flat.extend(p.grad.iter().copied());
    });
    flat
}

/// 写回所有梯度
pub fn apply_grads(model: &mut EncoderDecoder, flat: &[f32]) {
    let mut offset = 0;
    model.visit_parameters(&mut |_n: &str, p: &mut Parameter| {
        let len = p.grad.len();
        for (dst, &src) in p.grad.iter_mut().zip(&flat[offset..offset + len]) {
            *dst = src;
        }
        offset += len;
    });
    assert_eq!(offset, flat.len(), "gradient count mismatch");
}

/// 用 rank 0 的参数覆盖所有副本
pub fn sync_parameters(model: &mut EncoderDecoder, collective: &dyn Collective) {
    let mut flat = flatten_params(model);
    collective.broadcast(&mut flat);
    apply_params(model, &flat);
}

/// 全归约并平均所有副本的梯度
pub fn average_gradients(model: &mut EncoderDecoder, collective: &dyn Collective) {
    let mut flat = flatten_grads(model);
    collective.all_reduce_sum(&mut flat);
    let scale = 1.0 / collective.world_size() as f32;
    for g in &mut flat {
        *g *= scale;
    }
    apply_grads(model, &flat);
}

/// 单个 worker 的完整训练流程
///
/// 先与 rank 0 对齐初始参数，每轮按分片取数据，每次优化器步前
/// 梯度全归约；只有 rank 0 负责写检查点。
pub fn train_worker(
    model: &mut EncoderDecoder,
    dataset: &dyn Dataset,
    config: &TrainConfig,
    collective: &dyn Collective,
) -> Result<(), Box<dyn std::error::Error>> {
    let rank = collective.rank();
    let is_main = rank == 0;

    sync_parameters(model, collective);

    let tgt_vocab = model.config().tgt_vocab;
    let d_model = model.config().d_model;
    let pad = 0;

    let loss_compute = LossCompute::new(LabelSmoothing::new(tgt_vocab, pad, 0.1));
    let mut optimizer = Adam::new(0.0).with_betas(0.9, 0.98).with_epsilon(1e-9);
    let scheduler = NoamLR::new(d_model, config.base_lr, config.warmup);
    let sampler = ShardSampler::new(rank, collective.world_size(), config.seed);
    let loader = DataLoader::new(dataset, config.batch_size, config.max_padding, pad);

    let mut state = crate::batch::TrainState::default();
    for epoch in 0..config.num_epochs {
        let indices = sampler.indices(dataset.len(), epoch);
        let batches = loader.batches(&indices);

        let mode = if is_main {
            TrainMode::TrainLog
        } else {
            TrainMode::Train
        };
        let (loss, new_state) = run_epoch(
            model,
            &batches,
            &loss_compute,
            &mut optimizer,
            &scheduler,
            mode,
            config.accum_iter,
            state,
            Some(collective),
        );
        state = new_state;

        if is_main {
            println!("轮次 {} | 训练损失/token {:.4}", epoch, loss);
            ModelSnapshot::snapshot(model).save_json(epoch_path(&config.file_prefix, epoch))?;
        }
        collective.barrier();
    }

    if is_main {
        ModelSnapshot::snapshot(model).save_json(final_path(&config.file_prefix))?;
    }
    Ok(())
}

/// 启动训练
///
/// distributed 为真时为每个 worker 起一个线程并行训练，
/// 否则在当前线程单 worker 执行。返回 rank 0 的模型。
pub fn train<D>(
    model_config: Seq2SeqConfig,
    config: TrainConfig,
    dataset: Arc<D>,
) -> Result<EncoderDecoder, Box<dyn std::error::Error>>
where
    D: Dataset + Send + Sync + 'static,
{
    if !config.distributed || config.workers <= 1 {
        let collective = ThreadCollective::group(1).pop().ok_or("empty group")?;
        let mut model = EncoderDecoder::new(model_config);
        train_worker(&mut model, dataset.as_ref(), &config, &collective)?;
        return Ok(model);
    }

    let mut handles = Vec::new();
    for collective in ThreadCollective::group(config.workers) {
        let dataset = Arc::clone(&dataset);
        let config = config.clone();
        let handle = thread::spawn(move || -> Result<Option<EncoderDecoder>, String> {
            let mut model = EncoderDecoder::new(model_config);
            train_worker(&mut model, dataset.as_ref(), &config, &collective)
                .map_err(|e| e.to_string())?;
            if collective.rank() == 0 {
                Ok(Some(model))
            } else {
                Ok(None)
            }
        });
        handles.push(handle);
    }

    let mut main_model = None;
    for handle in handles {
        let result = handle.join().map_err(|_| "worker thread panicked")?;
        if let Some(model) = result.map_err(|e| -> Box<dyn std::error::Error> { e.into() })? {
            main_model = Some(model);
        }
    }
    main_model.ok_or_else(|| "no model returned from rank 0".into())
}
