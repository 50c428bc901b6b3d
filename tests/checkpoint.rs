use std::path::PathBuf;

use candle_core::{Device, Tensor};
use tinygpt::checkpoint::{serialize_checkpoint, Checkpoint, CheckpointMeta};
use tinygpt::{load_model, save_checkpoint, Error, Gpt, GptConfig, Rng};

fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("tinygpt-{}-{}.ckpt", tag, std::process::id()))
}

fn config() -> GptConfig {
    GptConfig { n_layer: 2, n_head: 2, n_embd: 16, block_size: 8, vocab_size: 24, ..GptConfig::default() }
}

#[test]
fn saved_model_reproduces_logits_bit_for_bit() -> tinygpt::Result<()> {
    let model = Gpt::new(&config(), &mut Rng::new(99), &Device::Cpu)?;
    let path = temp_path("roundtrip");
    let meta = CheckpointMeta::new("roundtrip", &model, 123, 40, 2.5);
    save_checkpoint(&model, &meta, &path)?;

    let (loaded, loaded_meta) = load_model(&path, &Device::Cpu)?;
    std::fs::remove_file(&path)?;

    assert_eq!(loaded_meta.label, "roundtrip");
    assert_eq!(loaded_meta.dataset_size, 123);
    assert_eq!(loaded_meta.iter, 40);
    assert_eq!(loaded_meta.val_loss, Some(2.5));
    assert_eq!(loaded_meta.param_count, model.param_count());
    assert!(chrono::DateTime::parse_from_rfc3339(&loaded_meta.created_at).is_ok());
    assert_eq!(loaded.config(), model.config());

    let idx = Tensor::from_slice(&[3u32, 1, 4, 1, 5, 9, 2, 6], (1, 8), &Device::Cpu)?;
    let a = model.logits(&idx, None)?.flatten_all()?.to_vec1::<f32>()?;
    let b = loaded.logits(&idx, None)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(a.iter().zip(&b).all(|(x, y)| x.to_bits() == y.to_bits()));

    assert_eq!(loaded.token_embedding().id(), loaded.lm_head_weight().id());
    Ok(())
}

#[test]
fn serialization_is_deterministic() -> tinygpt::Result<()> {
    let model = Gpt::new(&config(), &mut Rng::new(5), &Device::Cpu)?;
    let meta = CheckpointMeta::new("same", &model, 1, 0, 1.0);
    let a = serialize_checkpoint(&model, &meta)?;
    let b = serialize_checkpoint(&model, &meta)?;
    assert_eq!(a, b);

    let ckpt = Checkpoint::from_bytes(&a, &temp_path("mem"))?;
    let rebuilt = Gpt::from_checkpoint(&ckpt, &Device::Cpu)?;
    assert_eq!(serialize_checkpoint(&rebuilt, &meta)?, a);
    Ok(())
}

#[test]
fn corrupted_file_is_rejected() -> tinygpt::Result<()> {
    let model = Gpt::new(&config(), &mut Rng::new(5), &Device::Cpu)?;
    let path = temp_path("corrupt");
    save_checkpoint(&model, &CheckpointMeta::new("c", &model, 1, 0, 1.0), &path)?;

    let bytes = std::fs::read(&path)?;
    std::fs::write(&path, &bytes[..bytes.len() / 2])?;
    let err = load_model(&path, &Device::Cpu).err();
    std::fs::remove_file(&path)?;
    assert!(matches!(err, Some(Error::Checkpoint { .. })));
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() {
    let err = load_model(&temp_path("does-not-exist"), &Device::Cpu).err();
    assert!(matches!(err, Some(Error::Io(_))));
}

#[test]
fn mismatched_shapes_are_rejected() -> tinygpt::Result<()> {
    let small = Gpt::new(&config(), &mut Rng::new(1), &Device::Cpu)?;
    let bigger = Gpt::new(&GptConfig { n_embd: 32, ..config() }, &mut Rng::new(1), &Device::Cpu)?;
    let bytes = serialize_checkpoint(&small, &CheckpointMeta::new("s", &small, 1, 0, 1.0))?;
    let ckpt = Checkpoint::from_bytes(&bytes, &temp_path("mem"))?;
    assert!(bigger.load_state(&ckpt.tensors(&Device::Cpu)?).is_err());
    Ok(())
}
