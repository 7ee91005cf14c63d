//! Train a Byte-Level Language Model on a Text File
//!
//! Each non-empty line of the input file is one document. Documents are
//! tokenized byte by byte, padded to the context length, and used to train a
//! model with AdamW. The run writes a CSV training log, a checkpoint, and
//! prints a few nucleus-sampled continuations at the end.
//!
//! ## Usage
//!
//! ```bash
//! # List available presets
//! cargo run --release --bin train -- --list-presets
//!
//! # Train with a preset
//! cargo run --release --bin train -- --data corpus.txt --preset tiny
//!
//! # Override preset parameters
//! cargo run --release --bin train -- --data corpus.txt --preset small --epochs 5 --lr 0.0005
//!
//! # Resume from a checkpoint
//! cargo run --release --bin train -- --data corpus.txt --checkpoint runs/tiny_1700000000/checkpoint.bin
//! ```

use clap::{Parser, ValueEnum};
use quill::{
    ensure_vocab_matches, BatchLoader, ByteTokenizer, Checkpoint, GenerationConfig, Generator,
    LanguageModel, ModelConfig, PositionalEncoding, TokenizedDataset, Tokenizer, Trainer,
    TrainingConfig, TrainingLogger,
};
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

const PAD_TOKEN: &str = "<|pad|>";

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Positional {
    Learned,
    Sinusoidal,
    None,
}

impl From<Positional> for PositionalEncoding {
    fn from(p: Positional) -> Self {
        match p {
            Positional::Learned => PositionalEncoding::Learned,
            Positional::Sinusoidal => PositionalEncoding::Sinusoidal,
            Positional::None => PositionalEncoding::None,
        }
    }
}

#[derive(Parser)]
#[command(name = "train", about = "Train a byte-level decoder-only language model")]
struct Args {
    /// Path to training text file (one document per line)
    #[arg(long)]
    data: String,

    /// Named preset (see --list-presets)
    #[arg(long, default_value = "tiny")]
    preset: String,

    /// List available presets and exit
    #[arg(long)]
    list_presets: bool,

    // Model architecture (override preset)
    /// Embedding dimension
    #[arg(long)]
    embd: Option<usize>,

    /// Number of transformer layers
    #[arg(long)]
    layers: Option<usize>,

    /// Number of attention heads
    #[arg(long)]
    heads: Option<usize>,

    /// Context window length
    #[arg(long)]
    context: Option<usize>,

    /// Positional encoding
    #[arg(long, value_enum, default_value = "learned")]
    positional: Positional,

    // Training parameters
    /// Number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Peak learning rate
    #[arg(long)]
    lr: Option<f32>,

    /// Sequences per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Warmup fraction of total steps
    #[arg(long, default_value = "0.1")]
    warmup: f32,

    /// Weight decay for regularization
    #[arg(long, default_value = "0.01")]
    weight_decay: f32,

    /// Gradient clipping max norm (0 disables)
    #[arg(long, default_value = "1.0")]
    grad_clip: f32,

    /// Fraction of documents held out for validation
    #[arg(long, default_value = "0.1")]
    val_fraction: f32,

    /// Log every N steps
    #[arg(long, default_value = "10")]
    log_every: usize,

    /// Seed for initialization, shuffling and sampling
    #[arg(long, default_value = "42")]
    seed: u64,

    // Sampling
    /// Nucleus threshold for the final samples
    #[arg(long, default_value = "0.9")]
    top_p: f32,

    /// Tokens to generate per sample
    #[arg(long, default_value = "80")]
    sample_tokens: usize,

    // Checkpoints
    /// Resume model, optimizer and tokenizer from a checkpoint
    #[arg(long)]
    checkpoint: Option<String>,

    /// Directory for logs and checkpoints
    #[arg(long, default_value = "runs")]
    out_dir: String,
}

struct Preset {
    name: &'static str,
    embd: usize,
    layers: usize,
    heads: usize,
    context: usize,
    ff_mult: usize,
    lr: f32,
    epochs: usize,
    batch_size: usize,
    description: &'static str,
}

const PRESETS: &[Preset] = &[
    Preset {
        name: "tiny",
        embd: 32,
        layers: 2,
        heads: 4,
        context: 64,
        ff_mult: 4,
        lr: 3e-3,
        epochs: 3,
        batch_size: 8,
        description: "Seconds per epoch on small files",
    },
    Preset {
        name: "small",
        embd: 128,
        layers: 3,
        heads: 4,
        context: 128,
        ff_mult: 4,
        lr: 1e-3,
        epochs: 5,
        batch_size: 16,
        description: "A few minutes per epoch",
    },
    Preset {
        name: "medium",
        embd: 256,
        layers: 6,
        heads: 8,
        context: 256,
        ff_mult: 4,
        lr: 3e-4,
        epochs: 10,
        batch_size: 16,
        description: "Overnight runs",
    },
];

fn print_presets() {
    println!("\nAvailable presets:\n");
    println!(
        "  {:<8} {:>5} {:>6} {:>5} {:>7} {:>8} {:>6} {:>5}   {}",
        "NAME", "EMBD", "LAYERS", "HEADS", "CONTEXT", "LR", "EPOCHS", "BATCH", "DESCRIPTION"
    );
    println!("  {}", "-".repeat(90));
    for p in PRESETS {
        println!(
            "  {:<8} {:>5} {:>6} {:>5} {:>7} {:>8.4} {:>6} {:>5}   {}",
            p.name, p.embd, p.layers, p.heads, p.context, p.lr, p.epochs, p.batch_size, p.description
        );
    }
    println!("\nUsage: cargo run --release --bin train -- --data <FILE> --preset <NAME>");
}

fn section(title: &str) {
    println!("\n{}", "=".repeat(70));
    println!("{}", title);
    println!("{}", "=".repeat(70));
    println!();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.list_presets {
        print_presets();
        return Ok(());
    }

    let preset = PRESETS
        .iter()
        .find(|p| p.name == args.preset.as_str())
        .ok_or_else(|| {
            format!(
                "Unknown preset '{}'. Use --list-presets to see available options.",
                args.preset
            )
        })?;

    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let run_dir = format!("{}/{}_{}", args.out_dir, preset.name, timestamp);
    fs::create_dir_all(&run_dir)?;
    println!("Output directory: {}/", run_dir);

    // ========================================================================
    // 1. Load Training Data
    // ========================================================================
    section("1. Loading Training Data");

    let text = fs::read_to_string(&args.data)
        .map_err(|e| format!("Failed to read {}: {}", args.data, e))?;
    let documents: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    println!(
        "Loaded: {} ({:.2} MB, {} documents)",
        args.data,
        text.len() as f64 / 1_000_000.0,
        documents.len()
    );

    // ========================================================================
    // 2. Tokenizer and Model
    // ========================================================================
    section("2. Tokenizer and Model");

    let (mut model, tokenizer, optimizer) = if let Some(ref path) = args.checkpoint {
        let checkpoint = Checkpoint::load(path)?;
        let tokenizer = checkpoint
            .tokenizer
            .clone()
            .ok_or("Checkpoint does not contain a tokenizer")?;
        let model = checkpoint.to_model()?;
        (model, tokenizer, checkpoint.optimizer)
    } else {
        let mut tokenizer = ByteTokenizer::new();
        let config = ModelConfig {
            vocab_size: tokenizer.vocab_size(),
            embed_dim: args.embd.unwrap_or(preset.embd),
            num_layers: args.layers.unwrap_or(preset.layers),
            num_heads: args.heads.unwrap_or(preset.heads),
            ff_dim: args.embd.unwrap_or(preset.embd) * preset.ff_mult,
            max_seq_len: args.context.unwrap_or(preset.context),
            positional: args.positional.into(),
            seed: args.seed,
            ..ModelConfig::default()
        };
        let mut model = LanguageModel::new(&config)?;

        // The padding token extends the vocabulary, so the model must follow
        tokenizer.add_pad_token(PAD_TOKEN);
        model.resize_vocab(tokenizer.vocab_size())?;
        (model, tokenizer, None)
    };
    ensure_vocab_matches(&tokenizer, &model)?;

    let config = model.config().clone();
    let num_params = model.num_parameters();
    println!("  Vocabulary: {} (256 bytes + {} special)", config.vocab_size, config.vocab_size - 256);
    println!("  Embedding: {}", config.embed_dim);
    println!("  Layers: {}", config.num_layers);
    println!("  Heads: {} ({}d each)", config.num_heads, config.head_dim());
    println!("  Context: {}", config.max_seq_len);
    println!("  Positional: {:?}", config.positional);
    println!(
        "  Parameters: {} ({:.2}M)",
        num_params,
        num_params as f64 / 1_000_000.0
    );
    tokenizer.save(format!("{}/tokenizer.json", run_dir))?;

    // ========================================================================
    // 3. Train
    // ========================================================================
    section("3. Training");

    let dataset = TokenizedDataset::from_texts(&documents, &tokenizer, config.max_seq_len)?;
    let (train_set, val_set) = dataset.split(args.val_fraction);
    println!("  Train sequences: {} ({} tokens)", train_set.len(), train_set.num_tokens());
    println!("  Validation sequences: {} ({} tokens)", val_set.len(), val_set.num_tokens());
    if train_set.is_empty() {
        return Err(format!("No non-empty documents in {}", args.data).into());
    }

    let training = TrainingConfig {
        learning_rate: args.lr.unwrap_or(preset.lr),
        num_epochs: args.epochs.unwrap_or(preset.epochs),
        batch_size: args.batch_size.unwrap_or(preset.batch_size),
        weight_decay: args.weight_decay,
        grad_clip: args.grad_clip,
        warmup_fraction: args.warmup,
        log_every: args.log_every,
        shuffle: true,
        seed: args.seed,
    };
    println!("  Epochs: {}", training.num_epochs);
    println!("  Batch size: {}", training.batch_size);
    println!("  Learning rate: {}", training.learning_rate);
    println!("  Warmup: {:.0}%", training.warmup_fraction * 100.0);
    println!("  Gradient clipping: {}", training.grad_clip);
    println!("  Weight decay: {}", training.weight_decay);
    println!();

    let mut loader = BatchLoader::new(&train_set, training.batch_size, training.shuffle, training.seed)?;
    let logger = TrainingLogger::new(format!("{}/training_log.csv", run_dir))?;
    let mut trainer = match optimizer {
        Some(opt) => Trainer::with_optimizer(&mut model, training, opt)?,
        None => Trainer::new(&mut model, training)?,
    }
    .with_logger(logger);

    let report = trainer.fit(&mut loader)?;
    println!(
        "\nTrained {} steps ({} empty batches skipped)",
        report.steps, report.skipped_batches
    );
    if !val_set.is_empty() {
        let val = trainer.evaluate_dataset(&val_set)?;
        println!(
            "Validation loss: {:.4} | perplexity: {:.2}",
            val.loss,
            val.loss.exp()
        );
    }

    Checkpoint::from_model(trainer.model())
        .with_optimizer(trainer.optimizer().clone())
        .with_tokenizer(tokenizer.clone())
        .save(format!("{}/checkpoint.bin", run_dir))?;

    // ========================================================================
    // 4. Generate Samples
    // ========================================================================
    section("4. Sample Generation");

    let prompts = documents
        .iter()
        .take(3)
        .map(|doc| doc.chars().take(16).collect::<String>());

    for (i, prompt) in prompts.enumerate() {
        for temperature in [0.7, 1.0] {
            let generator = Generator::new(
                &model,
                GenerationConfig {
                    max_new_tokens: args.sample_tokens,
                    temperature,
                    top_p: args.top_p,
                    eos_token_id: Some(tokenizer.eos_token_id()),
                    seed: args.seed + i as u64,
                },
            )?;
            let output = generator.generate(&tokenizer.encode(&prompt))?;
            println!("\"{}\" (t={}, top_p={}):", prompt, temperature, args.top_p);
            println!("  {}  [{:?}]", tokenizer.decode(output.generated()), output.stop_reason);
            println!();
        }
    }

    println!("Training complete. Output: {}/", run_dir);
    Ok(())
}
