//! End-to-end behavior of the model, trainer, generator and checkpoints

use quill::{
    Batch, ByteTokenizer, Checkpoint, GenerationConfig, Generator, LanguageModel, ModelConfig,
    PositionalEncoding, StopReason, TokenizedDataset, Tokenizer, Trainer, TrainingConfig,
};

fn row(logits: &quill::Tensor, i: usize) -> &[f32] {
    let vocab = logits.shape[1];
    &logits.data[i * vocab..(i + 1) * vocab]
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

#[test]
fn test_order_blind_without_positions() {
    let model = LanguageModel::new(&ModelConfig {
        causal: false,
        positional: PositionalEncoding::None,
        ..ModelConfig::tiny(20)
    })
    .unwrap();

    let ids = [3, 7, 1, 12, 5];
    let perm = [4, 2, 0, 3, 1];
    let permuted: Vec<usize> = perm.iter().map(|&p| ids[p]).collect();

    let out = model.forward_sequence(&ids).unwrap();
    let out_perm = model.forward_sequence(&permuted).unwrap();

    for (i, &p) in perm.iter().enumerate() {
        assert!(max_abs_diff(row(&out_perm, i), row(&out, p)) < 1e-4);
    }
}

#[test]
fn test_positions_break_permutation_symmetry() {
    for positional in [PositionalEncoding::Learned, PositionalEncoding::Sinusoidal] {
        let model = LanguageModel::new(&ModelConfig {
            causal: false,
            positional,
            init_std: 0.2,
            ..ModelConfig::tiny(20)
        })
        .unwrap();

        let ids = [3, 7, 1, 12, 5];
        let reversed: Vec<usize> = ids.iter().rev().copied().collect();

        let out = model.forward_sequence(&ids).unwrap();
        let out_rev = model.forward_sequence(&reversed).unwrap();

        let largest = (0..ids.len())
            .map(|i| max_abs_diff(row(&out_rev, i), row(&out, ids.len() - 1 - i)))
            .fold(0.0, f32::max);
        assert!(largest > 1e-4, "{:?} output was order-blind", positional);
    }
}

#[test]
fn test_generation_terminates_within_budget() {
    let model = LanguageModel::new(&ModelConfig {
        vocab_size: 50,
        embed_dim: 32,
        num_layers: 3,
        num_heads: 4,
        ff_dim: 128,
        max_seq_len: 64,
        seed: 7,
        ..ModelConfig::default()
    })
    .unwrap();
    let generator = Generator::new(
        &model,
        GenerationConfig {
            max_new_tokens: 10,
            top_p: 0.9,
            eos_token_id: None,
            ..GenerationConfig::default()
        },
    )
    .unwrap();

    let prompt = [1, 2, 3, 4, 5];
    let output = generator.generate(&prompt).unwrap();

    assert!(output.tokens.len() <= 15);
    assert_eq!(&output.tokens[..5], &prompt);
    assert_eq!(output.stop_reason, StopReason::MaxLength);
    assert!(output.tokens.iter().all(|&t| t < 50));
}

#[test]
fn test_single_step_reduces_loss() {
    let mut model = LanguageModel::new(&ModelConfig::tiny(30)).unwrap();
    let batch = Batch::unpadded(vec![vec![1, 4, 9, 16, 25, 6], vec![2, 3, 5, 7, 11, 13]]);
    let config = TrainingConfig {
        learning_rate: 5e-4,
        weight_decay: 0.0,
        grad_clip: 0.0,
        warmup_fraction: 0.0,
        ..TrainingConfig::default()
    };
    let mut trainer = Trainer::new(&mut model, config).unwrap();

    let before = trainer.evaluate(&batch).unwrap().loss;
    let step = trainer.train_step(&batch).unwrap();
    let after = trainer.evaluate(&batch).unwrap().loss;

    assert!(!step.skipped);
    assert!((step.loss - before).abs() < 1e-5);
    assert!(after < before, "loss went from {} to {}", before, after);
}

#[test]
fn test_checkpoint_resume() {
    let mut tokenizer = ByteTokenizer::new();
    let mut model = LanguageModel::new(&ModelConfig::tiny(tokenizer.vocab_size())).unwrap();
    tokenizer.add_pad_token("<|pad|>");
    model.resize_vocab(tokenizer.vocab_size()).unwrap();

    let docs = ["the cat sat", "on the mat", "a dog ran off"];
    let dataset = TokenizedDataset::from_texts(&docs, &tokenizer, 16).unwrap();
    let batch = Batch {
        input_ids: (0..dataset.len())
            .filter_map(|i| dataset.get(i))
            .map(|(ids, _)| ids.to_vec())
            .collect(),
        attention_mask: (0..dataset.len())
            .filter_map(|i| dataset.get(i))
            .map(|(_, mask)| mask.to_vec())
            .collect(),
    };

    let config = TrainingConfig {
        learning_rate: 1e-3,
        ..TrainingConfig::default()
    };
    let mut trainer = Trainer::new(&mut model, config.clone()).unwrap();
    trainer.train_step(&batch).unwrap();
    trainer.train_step(&batch).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.bin");
    Checkpoint::from_model(trainer.model())
        .with_optimizer(trainer.optimizer().clone())
        .with_tokenizer(tokenizer.clone())
        .save(&path)
        .unwrap();

    // Continue the original run one more step
    let expected = trainer.train_step(&batch).unwrap();
    let expected_logits = trainer.model().forward_sequence(&batch.input_ids[0]).unwrap();

    let loaded = Checkpoint::load(&path).unwrap();
    assert_eq!(loaded.step, 2);
    let restored_tokenizer = loaded.tokenizer.clone().unwrap();
    assert_eq!(restored_tokenizer.vocab_size(), tokenizer.vocab_size());
    assert_eq!(restored_tokenizer.pad_token_id(), tokenizer.pad_token_id());

    let mut resumed = loaded.to_model().unwrap();
    let optimizer = loaded.optimizer.unwrap();
    let mut trainer = Trainer::with_optimizer(&mut resumed, config, optimizer).unwrap();
    assert_eq!(trainer.step(), 2);

    let actual = trainer.train_step(&batch).unwrap();
    let actual_logits = trainer.model().forward_sequence(&batch.input_ids[0]).unwrap();

    assert!((actual.loss - expected.loss).abs() < 1e-6);
    assert!(max_abs_diff(&actual_logits.data, &expected_logits.data) < 1e-5);
}
