//! 模型检查点
//!
//! 只保存架构元信息与命名参数（不含优化器状态），
//! 支持 JSON（可读）与 bincode（紧凑）两种格式。

use crate::model::{EncoderDecoder, Seq2SeqConfig};
use crate::param::Parameter;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// 可序列化的二维数组
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableArray {
    pub shape: (usize, usize),
    pub data: Vec<f32>,
}

impl SerializableArray {
    pub fn from_array(array: &Array2<f32>) -> Self {
        Self {
            shape: array.dim(),
            data: array.iter().copied().collect(),
        }
    }

    pub fn to_array(&self) -> Result<Array2<f32>, Box<dyn std::error::Error>> {
        Ok(Array2::from_shape_vec(self.shape, self.data.clone())?)
    }
}

/// 架构元信息，加载时逐项校验
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub src_vocab: usize,
    pub tgt_vocab: usize,
    pub n_layers: usize,
    pub d_model: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub max_seq_len: usize,
}

impl ModelMeta {
    fn from_config(config: &Seq2SeqConfig) -> Self {
        Self {
            src_vocab: config.src_vocab,
            tgt_vocab: config.tgt_vocab,
            n_layers: config.n_layers,
            d_model: config.d_model,
            n_heads: config.n_heads,
            d_ff: config.d_ff,
            max_seq_len: config.max_seq_len,
        }
    }
}

/// 模型快照：元信息 + 按名排序的参数表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub meta: ModelMeta,
    pub params: BTreeMap<String, SerializableArray>,
}

impl ModelSnapshot {
    /// 抓取模型当前参数
    pub fn snapshot(model: &mut EncoderDecoder) -> Self {
        let meta = ModelMeta::from_config(model.config());
        let mut params = BTreeMap::new();
        model.visit_parameters(&mut |name: &str, p: &mut Parameter| {
            params.insert(name.to_string(), SerializableArray::from_array(&p.data));
        });
        Self { meta, params }
    }

    /// 把快照写回模型
    ///
    /// 架构元信息、参数名集合、每个参数的形状都必须严格匹配。
    pub fn restore(&self, model: &mut EncoderDecoder) -> Result<(), Box<dyn std::error::Error>> {
        let meta = ModelMeta::from_config(model.config());
        if meta != self.meta {
            return Err(format!(
                "architecture mismatch: checkpoint {:?}, model {:?}",
                self.meta, meta
            )
            .into());
        }

        // 先整体校验，再写入，避免半程失败留下混合状态
        let mut expected = Vec::new();
        model.visit_parameters(&mut |name: &str, p: &mut Parameter| {
            expected.push((name.to_string(), p.data.dim()));
        });

        if expected.len() != self.params.len() {
            return Err(format!(
                "checkpoint has {} parameters, model has {}",
                self.params.len(),
                expected.len()
            )
            .into());
        }
        for (name, shape) in &expected {
            match self.params.get(name) {
                None => return Err(format!("checkpoint missing parameter {}", name).into()),
                Some(saved) if saved.shape != *shape => {
                    return Err(format!(
                        "shape mismatch for {}: checkpoint {:?}, model {:?}",
                        name, saved.shape, shape
                    )
                    .into())
                }
                Some(_) => {}
            }
        }

        let mut error: Option<Box<dyn std::error::Error>> = None;
        model.visit_parameters(&mut |name: &str, p: &mut Parameter| {
            if error.is_none() {
                match self.params[name].to_array() {
                    Ok(a) => p.data = a,
                    Err(e) => error = Some(e),
                }
            }
        });
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 保存为 JSON
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    /// 从 JSON 加载
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// 保存为 bincode
    pub fn save_binary<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let file = File::create(path)?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        Ok(())
    }

    /// 从 bincode 加载
    pub fn load_binary<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let file = File::open(path)?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }
}

/// 第 epoch 轮的检查点文件名
pub fn epoch_path(prefix: &str, epoch: usize) -> String {
    format!("{}{:02}.json", prefix, epoch)
}

/// 训练结束的检查点文件名
pub fn final_path(prefix: &str) -> String {
    format!("{}final.json", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Seq2SeqConfig;
    use tempfile::tempdir;

    fn tiny_config() -> Seq2SeqConfig {
        Seq2SeqConfig {
            src_vocab: 12,
            tgt_vocab: 12,
            n_layers: 1,
            d_model: 8,
            n_heads: 2,
            d_ff: 16,
            max_seq_len: 16,
            dropout: 0.0,
            seed: 3,
        }
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut model = EncoderDecoder::new(tiny_config());
        let snapshot = ModelSnapshot::snapshot(&mut model);

        let mut other = EncoderDecoder::new(Seq2SeqConfig {
            seed: 99,
            ..tiny_config()
        });
        snapshot.restore(&mut other).unwrap();

        let mut data_a = Vec::new();
        model.visit_parameters(&mut |_n: &str, p: &mut Parameter| data_a.push(p.data.clone()));
        let mut i = 0;
        other.visit_parameters(&mut |_n: &str, p: &mut Parameter| {
            assert_eq!(p.data, data_a[i]);
            i += 1;
        });
    }

    #[test]
    fn test_restore_rejects_architecture_mismatch() {
        let mut model = EncoderDecoder::new(tiny_config());
        let snapshot = ModelSnapshot::snapshot(&mut model);

        let mut wider = EncoderDecoder::new(Seq2SeqConfig {
            d_model: 16,
            d_ff: 32,
            ..tiny_config()
        });
        assert!(snapshot.restore(&mut wider).is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");

        let mut model = EncoderDecoder::new(tiny_config());
        let snapshot = ModelSnapshot::snapshot(&mut model);
        snapshot.save_json(&path).unwrap();

        let loaded = ModelSnapshot::load_json(&path).unwrap();
        assert_eq!(loaded.meta, snapshot.meta);
        assert_eq!(loaded.params.len(), snapshot.params.len());

        let mut restored = EncoderDecoder::new(Seq2SeqConfig {
            seed: 7,
            ..tiny_config()
        });
        loaded.restore(&mut restored).unwrap();
    }

    #[test]
    fn test_binary_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");

        let mut model = EncoderDecoder::new(tiny_config());
        let snapshot = ModelSnapshot::snapshot(&mut model);
        snapshot.save_binary(&path).unwrap();

        let loaded = ModelSnapshot::load_binary(&path).unwrap();
        assert_eq!(loaded.meta, snapshot.meta);
    }

    #[test]
    fn test_path_naming() {
        assert_eq!(epoch_path("copy_", 3), "copy_03.json");
        assert_eq!(final_path("copy_"), "copy_final.json");
    }
}
