use candle_core::{Device, Tensor};
use tinygpt::{AttentionKind, Dataset, Gpt, GptConfig, Rng, Trainer};

fn gpt2_small() -> GptConfig {
    GptConfig {
        n_layer: 2,
        n_head: 2,
        n_embd: 64,
        block_size: 16,
        vocab_size: 50257,
        ..GptConfig::default()
    }
}

#[test]
fn gpt2_vocab_prompt_logits_and_generation() -> tinygpt::Result<()> {
    let model = Gpt::new(&gpt2_small(), &mut Rng::new(1337), &Device::Cpu)?;
    let prompt = [1069u32, 2402, 257, 640];

    let idx = Tensor::from_slice(&prompt, (1, 4), &Device::Cpu)?;
    let (logits, loss) = model.forward(&idx, None, None)?;
    assert_eq!(logits.dims(), &[1, 50257]);
    assert!(loss.is_none());

    let out = model.generate(&prompt, 5, 1.0, None, &mut Rng::new(7))?;
    assert_eq!(out.len(), 9);
    assert_eq!(&out[..4], &prompt);
    assert!(out.iter().all(|&t| (t as usize) < 50257));
    Ok(())
}

#[test]
fn logits_at_earlier_positions_ignore_later_tokens() -> tinygpt::Result<()> {
    let cfg = GptConfig { n_layer: 2, n_head: 4, n_embd: 32, block_size: 10, vocab_size: 50, dropout: 0.0, ..GptConfig::default() };
    let model = Gpt::new(&cfg, &mut Rng::new(3), &Device::Cpu)?;

    let a: Vec<u32> = vec![5, 6, 7, 8, 9, 10, 11, 12, 13, 14];
    let mut b = a.clone();
    for t in b[6..].iter_mut() {
        *t = 49 - *t;
    }
    let la = model.logits(&Tensor::from_vec(a, (1, 10), &Device::Cpu)?, None)?;
    let lb = model.logits(&Tensor::from_vec(b, (1, 10), &Device::Cpu)?, None)?;

    let head_a = la.narrow(1, 0, 6)?.flatten_all()?.to_vec1::<f32>()?;
    let head_b = lb.narrow(1, 0, 6)?.flatten_all()?.to_vec1::<f32>()?;
    for (x, y) in head_a.iter().zip(&head_b) {
        assert!((x - y).abs() < 1e-5);
    }
    let tail = (la.narrow(1, 6, 4)? - lb.narrow(1, 6, 4)?)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(tail > 0.0);
    Ok(())
}

#[test]
fn attention_kinds_produce_the_same_model_output() -> tinygpt::Result<()> {
    let base = GptConfig { n_layer: 2, n_head: 2, n_embd: 16, block_size: 8, vocab_size: 20, dropout: 0.0, ..GptConfig::default() };
    let masked = Gpt::new(&base, &mut Rng::new(9), &Device::Cpu)?;
    let fused = Gpt::new(&GptConfig { attention: AttentionKind::Fused, ..base }, &mut Rng::new(9), &Device::Cpu)?;

    let idx = Tensor::from_slice(&[1u32, 4, 9, 16, 3, 2], (1, 6), &Device::Cpu)?;
    let a = masked.logits(&idx, None)?;
    let b = fused.logits(&idx, None)?;
    let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(diff < 1e-5, "max diff {diff}");
    Ok(())
}

#[test]
fn tied_weight_stays_one_tensor_through_training() -> tinygpt::Result<()> {
    let cfg = GptConfig {
        n_layer: 1, n_head: 2, n_embd: 16, block_size: 8, vocab_size: 12,
        batch_size: 2, gradient_accumulation_steps: 1, warmup_steps: 0,
        ..GptConfig::default()
    };
    let mut rng = Rng::new(cfg.seed);
    let model = Gpt::new(&cfg, &mut rng, &Device::Cpu)?;
    let before = model.token_embedding().as_tensor().flatten_all()?.to_vec1::<f32>()?;
    let stream: Vec<u32> = (0..200).map(|i| (i * 7 % 12) as u32).collect();
    let data = Dataset { train: stream[..180].to_vec(), val: stream[180..].to_vec() };

    let mut trainer = Trainer::new(model, data, rng)?;
    for _ in 0..3 {
        trainer.train_step()?;
    }
    assert_eq!(trainer.optimizer_steps(), 3);

    let model = trainer.into_model();
    assert_eq!(model.token_embedding().id(), model.lm_head_weight().id());
    let emb = model.token_embedding().as_tensor().flatten_all()?.to_vec1::<f32>()?;
    let head = model.lm_head_weight().as_tensor().flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(emb, head);
    assert_ne!(emb, before);

    let tied_entries = model
        .named_params()
        .iter()
        .filter(|(_, v)| v.id() == model.token_embedding().id())
        .count();
    assert_eq!(tied_entries, 1);
    Ok(())
}
