/* ------------------------------------------------------------------ */
/* Dataset-size experiments: sample corpus, ladder, model index       */
/* ------------------------------------------------------------------ */
//
// Each ladder level pairs a preset with a repetition count of the sample
// corpus, so model capacity and data grow together:
//   ultra_tiny ×1  → extreme overfitting
//   tiny       ×2  → heavy overfitting
//   small      ×5  → moderate learning
//   medium     ×15 → good generalisation on this corpus
//   large      ×50 → most stable

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checkpoint::load_model;
use crate::config::{GptConfig, VOCAB_PATH};
use crate::error::{Error, Result};
use crate::generate::{generate_text, GenerationParams};
use crate::model::Gpt;
use crate::tokenizer::{Codec, Tokenizer};
use crate::train::{train_labelled, TrainReport};

pub const SAMPLE_TEXT: &str = "
Once upon a time there was a little cat. The cat liked to play.
The cat played with a ball. The ball was red and round.
One day the cat found a toy. The toy was fun to chase.
The cat chased the toy all day long. Then the cat got tired.
The tired cat went to sleep. The cat had happy dreams.

There was also a dog. The dog was big and friendly.
The dog liked to run. The dog ran in the park every day.
The dog met the cat one sunny morning. They became friends.
The cat and dog played together. They had lots of fun.

A little girl came to the park. She saw the cat and dog.
The girl was happy. She wanted to play with them too.
The three friends played all afternoon. They were very happy.
When the sun went down, they all went home.

The next day they met again. They played new games.
The cat climbed trees. The dog fetched sticks.
The girl laughed and clapped. It was a wonderful day.
Every day they had new adventures together.
";

pub const TEST_PROMPTS: [&str; 5] = [
    "Once upon a time",
    "The cat",
    "The dog",
    "The little girl",
    "They played",
];

/// Prompts on themes absent from the sample corpus, for comparing saved models.
pub const NEW_TEST_PROMPTS: [&str; 10] = [
    "A magical wizard",
    "The brave knight",
    "In a dark forest",
    "A clever fox",
    "The wise old owl",
    "On a rainy day",
    "A tiny mouse",
    "The happy children",
    "Under the starry sky",
    "A friendly dragon",
];

/// The sample corpus repeated `multiplier` times.
pub fn sample_text(multiplier: usize) -> String {
    SAMPLE_TEXT.repeat(multiplier)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Level {
    pub preset: &'static str,
    pub multiplier: usize,
    pub name: &'static str,
    pub id: &'static str,
}

impl Level {
    pub fn config(&self) -> Result<GptConfig> {
        GptConfig::preset(self.preset)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown preset {}", self.preset)))
    }

    pub fn checkpoint_file(&self) -> String {
        format!("model_{}_{}.ckpt", self.id, self.name)
    }

    pub fn vocab_file(&self) -> String {
        format!("vocab_{}_{}.json", self.id, self.name)
    }
}

const LADDER: [Level; 5] = [
    Level { preset: "ultra_tiny", multiplier: 1,  name: "100_tokens",   id: "ultra_tiny" },
    Level { preset: "tiny",       multiplier: 2,  name: "200_tokens",   id: "tiny" },
    Level { preset: "small",      multiplier: 5,  name: "1000_tokens",  id: "small" },
    Level { preset: "medium",     multiplier: 15, name: "3000_tokens",  id: "medium" },
    Level { preset: "large",      multiplier: 50, name: "10000_tokens", id: "large" },
];

pub fn ladder() -> &'static [Level] {
    &LADDER
}

/// One row of `model_index.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelIndexEntry {
    pub model_id: String,
    pub name: String,
    pub filename: String,
    pub dataset_size: usize,
    pub parameters: usize,
    /// Tokenizer saved next to the checkpoint. Empty in indexes that predate
    /// it; readers then fall back to `vocab.json` beside the index.
    #[serde(default)]
    pub vocab_file: String,
}

pub fn write_model_index(path: &Path, entries: &[ModelIndexEntry]) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(entries)?)?;
    Ok(())
}

pub fn read_model_index(path: &Path) -> Result<Vec<ModelIndexEntry>> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

pub struct Experiment<C> {
    pub model: Gpt,
    pub codec: C,
    pub report: TrainReport,
    /// (prompt, generated text) for each test prompt.
    pub samples: Vec<(String, String)>,
}

/// Train on `text`, then sample every test prompt.
pub fn run_experiment<C: Codec>(
    text: &str,
    config: &GptConfig,
    name: &str,
    codec: C,
    checkpoint_path: Option<&Path>,
) -> Result<Experiment<C>> {
    log::info!("=== experiment: {} ===", name);
    let (model, codec, report) = train_labelled(text, config, codec, checkpoint_path, name)?;

    let params = GenerationParams { seed: config.seed, ..GenerationParams::preview_for(config.vocab_size) };
    let mut samples = Vec::with_capacity(TEST_PROMPTS.len());
    for prompt in TEST_PROMPTS {
        match generate_text(&model, &codec, prompt, &params) {
            Ok(out) => {
                log::info!("prompt {:?} → {:?}", prompt, out);
                samples.push((prompt.to_string(), out));
            }
            // A prompt made only of unseen characters encodes to nothing.
            Err(Error::EmptyInput(_)) => log::warn!("prompt {:?} has no known tokens, skipped", prompt),
            Err(e) => return Err(e),
        }
    }
    Ok(Experiment { model, codec, report, samples })
}

/// Run every ladder level with a char-level tokenizer fitted to its corpus,
/// saving `model_<id>_<name>.ckpt` files and `model_index.json` under `out_dir`.
/// `max_iters` overrides each preset's iteration count.
pub fn run_ladder(out_dir: &Path, max_iters: Option<usize>) -> Result<Vec<(ModelIndexEntry, TrainReport)>> {
    std::fs::create_dir_all(out_dir)?;
    let mut results = Vec::with_capacity(LADDER.len());

    for (i, level) in LADDER.iter().enumerate() {
        log::info!("level {}/{}: {}", i + 1, LADDER.len(), level.name);
        let text = sample_text(level.multiplier);
        let tokenizer = Tokenizer::from_text(&text);

        let mut config = level.config()?;
        config.vocab_size = tokenizer.vocab_size();
        if let Some(n) = max_iters {
            config.max_iters = n;
        }

        let path: PathBuf = out_dir.join(level.checkpoint_file());
        let vocab_path: PathBuf = out_dir.join(level.vocab_file());
        tokenizer.save(&vocab_path)?;
        let exp = run_experiment(&text, &config, level.name, tokenizer, Some(&path))?;
        // The shared vocab.json follows the last level so `generate` works out of the box.
        exp.codec.save(&out_dir.join(VOCAB_PATH))?;
        let entry = ModelIndexEntry {
            model_id: level.id.to_string(),
            name: level.name.to_string(),
            filename: path.display().to_string(),
            dataset_size: exp.report.dataset_size,
            parameters: exp.report.param_count,
            vocab_file: vocab_path.display().to_string(),
        };
        results.push((entry, exp.report));
    }

    let entries: Vec<ModelIndexEntry> = results.iter().map(|(e, _)| e.clone()).collect();
    let index = out_dir.join("model_index.json");
    write_model_index(&index, &entries)?;
    log::info!("model index written to {}", index.display());
    Ok(results)
}

/* ------------------------------------------------------------------ */
/* Comparing saved models                                             */
/* ------------------------------------------------------------------ */

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptOutput {
    pub prompt: String,
    pub output: String,
}

/// Everything one indexed model produced for the comparison prompts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelComparison {
    pub model_id: String,
    pub name: String,
    pub dataset_size: usize,
    pub parameters: usize,
    pub outputs: Vec<PromptOutput>,
}

fn entry_vocab_path(index_path: &Path, entry: &ModelIndexEntry) -> PathBuf {
    if entry.vocab_file.is_empty() {
        index_path.parent().unwrap_or(Path::new("")).join(VOCAB_PATH)
    } else {
        PathBuf::from(&entry.vocab_file)
    }
}

/// Load every model listed in `index_path` and run `prompts` through each
/// with the same sampling `params`. Prompts that encode to nothing under a
/// model's tokenizer are skipped for that model.
pub fn compare_models(
    index_path: &Path,
    prompts: &[&str],
    params: &GenerationParams,
) -> Result<Vec<ModelComparison>> {
    let index = read_model_index(index_path)?;
    if index.is_empty() {
        return Err(Error::EmptyInput("model index"));
    }
    let device = crate::device::select_device(false);

    let mut out = Vec::with_capacity(index.len());
    for entry in &index {
        log::info!("loading {} ({} tokens) from {}", entry.name, entry.dataset_size, entry.filename);
        let (model, _) = load_model(Path::new(&entry.filename), &device)?;
        let tokenizer = Tokenizer::load(&entry_vocab_path(index_path, entry))?;
        if tokenizer.vocab_size() > model.config().vocab_size {
            return Err(Error::InvalidConfig(format!(
                "{}: tokenizer has {} tokens, model only {}",
                entry.name,
                tokenizer.vocab_size(),
                model.config().vocab_size
            )));
        }

        let mut outputs = Vec::with_capacity(prompts.len());
        for &prompt in prompts {
            match generate_text(&model, &tokenizer, prompt, params) {
                Ok(output) => {
                    log::info!("{} | {:?} → {:?}", entry.name, prompt, output);
                    outputs.push(PromptOutput { prompt: prompt.to_string(), output });
                }
                Err(Error::EmptyInput(_)) => {
                    log::warn!("{}: prompt {:?} has no known tokens, skipped", entry.name, prompt)
                }
                Err(e) => return Err(e),
            }
        }
        out.push(ModelComparison {
            model_id: entry.model_id.clone(),
            name: entry.name.clone(),
            dataset_size: entry.dataset_size,
            parameters: entry.parameters,
            outputs,
        });
    }
    Ok(out)
}

pub fn write_comparison(path: &Path, results: &[ModelComparison]) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(results)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_levels_resolve_to_presets() {
        let levels = ladder();
        assert_eq!(levels.len(), 5);
        let mults: Vec<usize> = levels.iter().map(|l| l.multiplier).collect();
        assert_eq!(mults, vec![1, 2, 5, 15, 50]);
        for l in levels {
            assert!(l.config().is_ok(), "{}", l.preset);
        }
        assert_eq!(levels[0].checkpoint_file(), "model_ultra_tiny_100_tokens.ckpt");
    }

    #[test]
    fn sample_text_repeats() {
        assert_eq!(sample_text(3).len(), SAMPLE_TEXT.len() * 3);
        assert!(sample_text(0).is_empty());
    }

    #[test]
    fn model_index_round_trip() -> Result<()> {
        let path = std::env::temp_dir().join(format!("tinygpt-index-{}.json", std::process::id()));
        let entries = vec![ModelIndexEntry {
            model_id: "tiny".into(),
            name: "200_tokens".into(),
            filename: "models/model_tiny_200_tokens.ckpt".into(),
            dataset_size: 200,
            parameters: 12345,
            vocab_file: "models/vocab_tiny_200_tokens.json".into(),
        }];
        write_model_index(&path, &entries)?;
        let back = read_model_index(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(back, entries);
        Ok(())
    }

    #[test]
    fn index_without_vocab_file_falls_back_to_shared_vocab() -> Result<()> {
        let json = r#"[{"model_id":"tiny","name":"200_tokens","filename":"m.ckpt","dataset_size":200,"parameters":1}]"#;
        let entries: Vec<ModelIndexEntry> = serde_json::from_str(json)?;
        assert_eq!(entries[0].vocab_file, "");
        let vocab = entry_vocab_path(Path::new("runs/model_index.json"), &entries[0]);
        assert_eq!(vocab, Path::new("runs").join(VOCAB_PATH));
        Ok(())
    }

    #[test]
    fn compare_models_runs_each_indexed_model() -> Result<()> {
        use crate::checkpoint::{save_checkpoint, CheckpointMeta};
        use crate::rng::Rng;
        use candle_core::Device;

        let dir = std::env::temp_dir().join(format!("tinygpt-compare-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let tokenizer = Tokenizer::from_text(&sample_text(1));
        let cfg = GptConfig { vocab_size: tokenizer.vocab_size(), ..GptConfig::ultra_tiny() };
        let model = Gpt::new(&cfg, &mut Rng::new(cfg.seed), &Device::Cpu)?;

        let ckpt = dir.join("model_ultra_tiny_100_tokens.ckpt");
        let vocab = dir.join("vocab_ultra_tiny_100_tokens.json");
        save_checkpoint(&model, &CheckpointMeta::new("100_tokens", &model, 100, 0, 3.0), &ckpt)?;
        tokenizer.save(&vocab)?;
        let index = dir.join("model_index.json");
        write_model_index(&index, &[ModelIndexEntry {
            model_id: "ultra_tiny".into(),
            name: "100_tokens".into(),
            filename: ckpt.display().to_string(),
            dataset_size: 100,
            parameters: model.param_count(),
            vocab_file: vocab.display().to_string(),
        }])?;

        // "zzz" has no characters in the sample corpus's vocabulary
        let params = GenerationParams { max_new_tokens: 6, ..GenerationParams::default_for(cfg.vocab_size) };
        let results = compare_models(&index, &["The cat", "zzz", "A dog"], &params)?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "100_tokens");
        let prompts: Vec<&str> = results[0].outputs.iter().map(|o| o.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["The cat", "A dog"]);
        assert!(results[0].outputs[0].output.starts_with("The cat"));

        let again = compare_models(&index, &["The cat"], &params)?;
        assert_eq!(again[0].outputs[0], results[0].outputs[0]);

        let report = dir.join("results.json");
        write_comparison(&report, &results)?;
        let back: Vec<ModelComparison> = serde_json::from_str(&std::fs::read_to_string(&report)?)?;
        assert_eq!(back, results);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
