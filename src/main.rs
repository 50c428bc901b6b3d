/* ------------------------------------------------------------------ */
/* tinygpt command line                                              */
/* ------------------------------------------------------------------ */
//
//   tinygpt train    [--preset=tiny] [--config=cfg.json] [--data=corpus.txt]
//                    [--multiplier=2] [--bpe=N] [--iters=N] [--seed=N] [--out=models]
//   tinygpt generate [--model=models/best_model.ckpt] [--vocab=models/vocab.json]
//                    [--prompt=TEXT] [--max-tokens=50] [--temperature=0.8]
//                    [--top-k=40] [--seed=N]
//   tinygpt ladder   [--out=models] [--iters=N]
//   tinygpt compare  [--index=models/model_index.json] [--prompt=TEXT]
//                    [--max-tokens=N] [--temperature=0.8] [--top-k=N] [--seed=N]
//                    [--results=test_results_new_data.json]
//
// Every command accepts --log-level=error|warn|info|debug|trace.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};

use tinygpt::config::{BEST_CHECKPOINT_PATH, VOCAB_PATH};
use tinygpt::{
    compare_models, generate_timed, load_model, run_experiment, run_ladder, sample_text,
    select_device, write_comparison, Codec, GenerationParams, GptConfig, Tokenizer,
    NEW_TEST_PROMPTS,
};

fn arg_has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn arg_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    let prefix = format!("{}=", key);
    args.iter().find_map(|a| a.strip_prefix(&prefix))
}

fn parse_arg<T: FromStr>(args: &[String], key: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match arg_value(args, key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("invalid value {:?} for {}: {}", raw, key, e)),
    }
}

fn init_logging(args: &[String]) -> anyhow::Result<()> {
    let level = match arg_value(args, "--log-level") {
        Some(l) => log::LevelFilter::from_str(l).map_err(|_| anyhow!("unknown log level {:?}", l))?,
        None => log::LevelFilter::Info,
    };
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .init()
        .context("failed to initialise logging")
}

/* ------------------------------------------------------------------ */
/* train                                                              */
/* ------------------------------------------------------------------ */

fn cmd_train(args: &[String]) -> anyhow::Result<()> {
    let mut config = match arg_value(args, "--config") {
        Some(path) => GptConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path))?,
        None => {
            let name = arg_value(args, "--preset").unwrap_or("tiny");
            GptConfig::preset(name).ok_or_else(|| {
                anyhow!("unknown preset {:?}; expected one of {:?}", name, GptConfig::PRESET_NAMES)
            })?
        }
    };
    if let Some(n) = parse_arg::<usize>(args, "--iters")? {
        config.max_iters = n;
    }
    if let Some(seed) = parse_arg::<u64>(args, "--seed")? {
        config.seed = seed;
    }

    let text = match arg_value(args, "--data") {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?,
        None => sample_text(parse_arg::<usize>(args, "--multiplier")?.unwrap_or(2)),
    };
    if text.is_empty() {
        bail!("training text is empty");
    }

    let tokenizer = match parse_arg::<usize>(args, "--bpe")? {
        Some(target) => Tokenizer::from_text_bpe(&text, target),
        None => Tokenizer::from_text(&text),
    };
    config.vocab_size = tokenizer.vocab_size();
    config.validate()?;

    let out = PathBuf::from(arg_value(args, "--out").unwrap_or("models"));
    std::fs::create_dir_all(&out).with_context(|| format!("creating {}", out.display()))?;
    tokenizer.save(&out.join(VOCAB_PATH))?;

    println!("=== tinygpt ===");
    println!(
        "Model: {} layers, {} heads, {} embedding dim, block {}",
        config.n_layer, config.n_head, config.n_embd, config.block_size
    );
    println!(
        "Tokenizer: {} ({} tokens), sample {:?}",
        if tokenizer.is_bpe() { "BPE" } else { "char" },
        tokenizer.vocab_size(),
        tokenizer.sample_tokens(10)
    );
    println!();

    let ckpt = out.join(BEST_CHECKPOINT_PATH);
    let exp = run_experiment(&text, &config, "train", tokenizer, Some(&ckpt))?;
    let report_path = out.join("report.json");
    std::fs::write(&report_path, serde_json::to_string_pretty(&exp.report)?)?;

    println!();
    println!("=== Generation ===");
    for (prompt, output) in &exp.samples {
        println!("\nPrompt: {:?}", prompt);
        println!("Generated: {}", output);
    }

    let r = &exp.report;
    println!();
    println!("=== Summary ===");
    println!("✓ Data: {} tokens, {} parameters", r.dataset_size, r.param_count);
    println!("✓ Trained: {} optimizer steps in {:.1}s", r.optimizer_steps, r.elapsed_secs);
    println!("✓ Final loss: train {:.4}, val {:.4}", r.final_train_loss, r.final_val_loss);
    match r.best_iter {
        Some(it) => println!("✓ Best val loss: {:.4} @ iter {}", r.best_val_loss, it),
        None => println!("✓ Best val loss: n/a (no validation split)"),
    }
    println!("✓ Checkpoint: {}", ckpt.display());
    println!("✓ Report: {}", report_path.display());
    Ok(())
}

/* ------------------------------------------------------------------ */
/* generate                                                           */
/* ------------------------------------------------------------------ */

fn cmd_generate(args: &[String]) -> anyhow::Result<()> {
    let model_path = arg_value(args, "--model")
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new("models").join(BEST_CHECKPOINT_PATH));
    let vocab_path = arg_value(args, "--vocab")
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new("models").join(VOCAB_PATH));

    let tokenizer = Tokenizer::load(&vocab_path)
        .with_context(|| format!("loading vocabulary {}", vocab_path.display()))?;
    let device = select_device(arg_has_flag(args, "--accelerator"));
    let (model, meta) = load_model(&model_path, &device)
        .with_context(|| format!("loading model {}", model_path.display()))?;
    if tokenizer.vocab_size() > model.config().vocab_size {
        bail!(
            "vocabulary {} has {} tokens but the model only knows {}",
            vocab_path.display(),
            tokenizer.vocab_size(),
            model.config().vocab_size
        );
    }

    let defaults = GenerationParams::default_for(model.config().vocab_size);
    let top_k = match parse_arg::<usize>(args, "--top-k")? {
        Some(0) => None,
        Some(k) => Some(k),
        None => defaults.top_k,
    };
    let params = GenerationParams {
        max_new_tokens: parse_arg(args, "--max-tokens")?.unwrap_or(defaults.max_new_tokens),
        temperature: parse_arg(args, "--temperature")?.unwrap_or(defaults.temperature),
        top_k,
        seed: parse_arg(args, "--seed")?.unwrap_or(defaults.seed),
    };
    let prompt = arg_value(args, "--prompt").unwrap_or("Once upon a time");

    println!("Model: {} ({} parameters, trained on {} tokens)", meta.label, meta.param_count, meta.dataset_size);
    let out = generate_timed(&model, &tokenizer, prompt, &params)?;
    println!("\nPrompt: {:?}", prompt);
    println!("Generated: {}", out.text);
    println!(
        "\n{} tokens in {:.1}ms ({:.1} tok/s)",
        out.new_tokens,
        out.elapsed.as_secs_f64() * 1000.0,
        out.tokens_per_sec()
    );
    Ok(())
}

/* ------------------------------------------------------------------ */
/* ladder                                                             */
/* ------------------------------------------------------------------ */

fn cmd_ladder(args: &[String]) -> anyhow::Result<()> {
    let out = PathBuf::from(arg_value(args, "--out").unwrap_or("models"));
    let iters = parse_arg::<usize>(args, "--iters")?;
    let results = run_ladder(&out, iters)?;

    println!();
    println!("=== Dataset-size comparison ===");
    println!("{:<14} {:>8} {:>10} {:>10} {:>10}", "level", "tokens", "params", "best val", "final val");
    for (entry, report) in &results {
        println!(
            "{:<14} {:>8} {:>10} {:>10.4} {:>10.4}",
            entry.name, entry.dataset_size, entry.parameters, report.best_val_loss, report.final_val_loss
        );
    }
    println!("\nModel index: {}", out.join("model_index.json").display());
    Ok(())
}

/* ------------------------------------------------------------------ */
/* compare                                                            */
/* ------------------------------------------------------------------ */

// Without --prompt every model runs the unseen-theme prompts and the results
// are written to --results; with --prompt the models are shown side by side.
fn cmd_compare(args: &[String]) -> anyhow::Result<()> {
    let index = PathBuf::from(arg_value(args, "--index").unwrap_or("models/model_index.json"));
    let single = arg_value(args, "--prompt");
    let prompts: Vec<&str> = match single {
        Some(p) => vec![p],
        None => NEW_TEST_PROMPTS.to_vec(),
    };

    // Ladder models use small character vocabularies, so no top-k unless asked.
    let params = GenerationParams {
        max_new_tokens: parse_arg(args, "--max-tokens")?.unwrap_or(if single.is_some() { 50 } else { 40 }),
        temperature: parse_arg(args, "--temperature")?.unwrap_or(0.8),
        top_k: parse_arg(args, "--top-k")?,
        seed: parse_arg(args, "--seed")?.unwrap_or(GenerationParams::default().seed),
    };

    let results = compare_models(&index, &prompts, &params)
        .with_context(|| format!("comparing models from {}", index.display()))?;

    println!("=== Comparing {} models ===", results.len());
    for model in &results {
        println!();
        println!("{} ({} tokens, {} parameters)", model.name, model.dataset_size, model.parameters);
        println!("{}", "─".repeat(70));
        for o in &model.outputs {
            if single.is_none() {
                println!("Prompt: {:?}", o.prompt);
            }
            println!("{}", o.output);
        }
    }

    if single.is_none() {
        let out = PathBuf::from(arg_value(args, "--results").unwrap_or("test_results_new_data.json"));
        write_comparison(&out, &results)?;
        println!("\nResults: {}", out.display());
    }
    Ok(())
}

/* ------------------------------------------------------------------ */
/* Main                                                               */
/* ------------------------------------------------------------------ */

fn usage() -> &'static str {
    "usage: tinygpt <train|generate|ladder|compare> [--key=value ...]"
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    init_logging(&args)?;

    let Some(command) = args.first() else { bail!(usage()) };
    let rest = &args[1..];
    match command.as_str() {
        "train" => cmd_train(rest),
        "generate" => cmd_generate(rest),
        "ladder" => cmd_ladder(rest),
        "compare" => cmd_compare(rest),
        "-h" | "--help" | "help" => {
            println!("{}", usage());
            Ok(())
        }
        other => bail!("unknown command {:?}\n{}", other, usage()),
    }
}
