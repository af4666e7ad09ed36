//! # Mini Seq2Seq
//!
//! 一个从零实现的 Encoder-Decoder Transformer，用于学习序列到序列
//! 建模的完整训练流程：手写反向传播、标签平滑、Noam 调度、
//! 梯度累积与多 worker 数据并行。
//!
//! ## 架构概览
//!
//! ```text
//! src → Embedding → Positional Encoding →
//!     [Encoder Layer × N] → memory
//!     ├── Multi-Head Self-Attention
//!     ├── Add & Norm（pre-norm 残差）
//!     ├── Feed Forward Network
//!     └── Add & Norm
//!
//! tgt → Embedding → Positional Encoding →
//!     [Decoder Layer × N] → Generator → log P(token)
//!     ├── Masked Self-Attention
//!     ├── Cross-Attention(memory)
//!     └── Feed Forward Network
//! ```

pub mod tensor;
pub mod param;
pub mod mask;
pub mod layers;
pub mod attention;
pub mod embedding;
pub mod encoder;
pub mod decoder;
pub mod model;
pub mod loss;
pub mod lr_scheduler;
pub mod optimizer;
pub mod batch;
pub mod dataset;
pub mod trainer;
pub mod distributed;
pub mod checkpoint;
pub mod generate;

pub use tensor::TensorExt;
pub use param::Parameter;
pub use mask::{padding_mask, subsequent_mask, target_mask};
pub use layers::{Dropout, FeedForward, LayerNorm, Linear, SublayerConnection};
pub use attention::{AttentionParams, MultiHeadAttention, ScaledDotProduct};
pub use embedding::{Embedding, Generator, PositionalEncoding};
pub use encoder::{Encoder, EncoderLayer};
pub use decoder::{Decoder, DecoderLayer};
pub use model::{configs, EncoderDecoder, Seq2SeqConfig};
pub use loss::{accuracy, cross_entropy, LabelSmoothing};
pub use lr_scheduler::{ConstantLR, LRScheduler, NoamLR};
pub use optimizer::{Adam, Optimizer};
pub use batch::{Batch, TrainState};
pub use dataset::{CopyTaskDataset, DataLoader, Dataset, ShardSampler};
pub use trainer::{run_epoch, LossCompute, TrainConfig, TrainMode};
pub use distributed::{train, train_worker, Collective, ThreadCollective};
pub use checkpoint::{ModelSnapshot, SerializableArray};
pub use generate::greedy_decode;
