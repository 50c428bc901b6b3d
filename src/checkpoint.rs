/* ------------------------------------------------------------------ */
/* Checkpoint save / load                                            */
/* ------------------------------------------------------------------ */
//
// File format (little-endian):
//   [0..8]    magic       b"TGPT0001"
//   [8..12]   header_len  u32
//   [12..12+header_len]   JSON header {config, meta, tensors: [{name, shape, offset, len}]}
//   [..]      flat f32 payload; `offset`/`len` count f32 elements
//
// Tensors are keyed by structural name. The tied embedding / LM head weight is
// stored once, as `transformer.wte.weight`.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::GptConfig;
use crate::error::{Error, Result};
use crate::model::Gpt;
use crate::rng::Rng;

const MAGIC: &[u8; 8] = b"TGPT0001";
const PREFIX_LEN: usize = 12;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub label: String,
    pub param_count: usize,
    /// Tokens actually used for training + validation.
    pub dataset_size: usize,
    /// RFC 3339, UTC.
    pub created_at: String,
    pub iter: usize,
    pub val_loss: Option<f32>,
}

impl CheckpointMeta {
    pub fn new(label: &str, model: &Gpt, dataset_size: usize, iter: usize, val_loss: f32) -> Self {
        Self {
            label: label.to_string(),
            param_count: model.param_count(),
            dataset_size,
            created_at: chrono::Utc::now().to_rfc3339(),
            iter,
            val_loss: val_loss.is_finite().then_some(val_loss),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TensorEntry {
    name: String,
    shape: Vec<usize>,
    offset: usize,
    len: usize,
}

#[derive(Serialize, Deserialize)]
struct Header {
    config: GptConfig,
    meta: CheckpointMeta,
    tensors: Vec<TensorEntry>,
}

// ── In-memory helpers ──────────────────────────────────────────────

fn write_f32s(buf: &mut Vec<u8>, s: &[f32]) {
    buf.reserve(s.len() * 4);
    for &v in s { buf.extend_from_slice(&v.to_le_bytes()); }
}

fn read_f32s(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

// ── Public API ─────────────────────────────────────────────────────

/// Serialize model weights + config + metadata to an in-memory buffer.
/// No disk I/O; call `flush_checkpoint` to write it.
pub fn serialize_checkpoint(model: &Gpt, meta: &CheckpointMeta) -> Result<Vec<u8>> {
    let mut entries = Vec::with_capacity(model.named_params().len());
    let mut payload: Vec<u8> = Vec::with_capacity(model.param_count() * 4);
    let mut offset = 0;
    for (name, var) in model.named_params() {
        let data = var.as_tensor().to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        entries.push(TensorEntry {
            name: name.clone(),
            shape: var.dims().to_vec(),
            offset,
            len: data.len(),
        });
        offset += data.len();
        write_f32s(&mut payload, &data);
    }

    let header = Header { config: model.config().clone(), meta: meta.clone(), tensors: entries };
    let header = serde_json::to_vec(&header)?;

    let mut buf = Vec::with_capacity(PREFIX_LEN + header.len() + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&(header.len() as u32).to_le_bytes());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Write `buf` to `<path>.tmp`, then rename over `path`. The previous file at
/// `path` survives any failure before the rename.
pub fn flush_checkpoint(path: &Path, buf: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = tmp_path(path);
    let written = (|| -> std::io::Result<()> {
        let mut f = File::create(&tmp)?;
        f.write_all(buf)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

pub fn save_checkpoint(model: &Gpt, meta: &CheckpointMeta, path: &Path) -> Result<()> {
    let buf = serialize_checkpoint(model, meta)?;
    flush_checkpoint(path, &buf)?;
    log::debug!("checkpoint written: {} ({} bytes)", path.display(), buf.len());
    Ok(())
}

/// A parsed checkpoint file.
pub struct Checkpoint {
    pub config: GptConfig,
    pub meta: CheckpointMeta,
    entries: Vec<TensorEntry>,
    payload: Vec<f32>,
}

impl Checkpoint {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, path)
    }

    /// `origin` only labels errors.
    pub fn from_bytes(bytes: &[u8], origin: &Path) -> Result<Self> {
        let bad = |reason: String| Error::checkpoint(origin, reason);

        if bytes.len() < PREFIX_LEN || &bytes[..8] != MAGIC {
            return Err(bad("bad magic bytes".into()));
        }
        let header_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let body = &bytes[PREFIX_LEN..];
        if header_len > body.len() {
            return Err(bad(format!("header length {header_len} exceeds file size")));
        }
        let header: Header = serde_json::from_slice(&body[..header_len])
            .map_err(|e| bad(format!("unreadable header: {e}")))?;

        let raw = &body[header_len..];
        if raw.len() % 4 != 0 {
            return Err(bad(format!("payload of {} bytes is not a whole number of f32", raw.len())));
        }
        let payload = read_f32s(raw);
        for e in &header.tensors {
            match e.offset.checked_add(e.len) {
                Some(end) if end <= payload.len() => {}
                _ => return Err(bad(format!("tensor {} runs past the end of the payload", e.name))),
            }
            let numel = e.shape.iter().try_fold(1usize, |n, &d| n.checked_mul(d));
            if numel != Some(e.len) {
                return Err(bad(format!("tensor {} shape {:?} does not match length {}", e.name, e.shape, e.len)));
            }
        }

        Ok(Self { config: header.config, meta: header.meta, entries: header.tensors, payload })
    }

    /// Tensor names in file order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn tensors(&self, device: &Device) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::with_capacity(self.entries.len());
        for e in &self.entries {
            let data = &self.payload[e.offset..e.offset + e.len];
            let t = Tensor::from_slice(data, e.shape.as_slice(), device)?;
            out.insert(e.name.clone(), t);
        }
        Ok(out)
    }
}

impl Gpt {
    /// Rebuild a model from the embedded config and load its weights by name.
    pub fn from_checkpoint(ckpt: &Checkpoint, device: &Device) -> Result<Self> {
        // Init values are overwritten immediately.
        let model = Gpt::new(&ckpt.config, &mut Rng::new(ckpt.config.seed), device)?;
        model.load_state(&ckpt.tensors(device)?)?;
        Ok(model)
    }
}

pub fn load_model(path: &Path, device: &Device) -> Result<(Gpt, CheckpointMeta)> {
    let ckpt = Checkpoint::load(path)?;
    let model = Gpt::from_checkpoint(&ckpt, device)
        .map_err(|e| Error::checkpoint(path, e.to_string()))?;
    log::info!(
        "loaded {} ({} parameters, iter {}, created {})",
        path.display(),
        ckpt.meta.param_count,
        ckpt.meta.iter,
        ckpt.meta.created_at
    );
    Ok((model, ckpt.meta))
}
