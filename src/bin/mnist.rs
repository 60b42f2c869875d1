// Trains and evaluates the reference MNIST classifier.
//
// Usage:
//   mnist train <epochs> <out-weights>
//   mnist train-increment <start-epoch> <end-epoch> <in-weights> <out-weights>
//   mnist test <weights>
//   mnist simple <iterations>
//
// The IDX files are read from $LAYERNET_MNIST_DIR (default `./mnist`) and the
// device is picked by $LAYERNET_DEVICE (`cpu`, `gpu` or `auto`).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;

use layernet::config::{self, TrainConfig};
use layernet::dataset::{Mnist, Split};
use layernet::metrics::{self, LogLoss, TopK};
use layernet::{Device, Network, Tensor};

const CLASSES: usize = 10;

enum Mode {
    Train {
        epochs: usize,
        out: PathBuf,
    },
    TrainIncrement {
        start: usize,
        end: usize,
        input: PathBuf,
        out: PathBuf,
    },
    Test {
        weights: PathBuf,
    },
    Simple {
        iterations: usize,
    },
}

fn usage() -> &'static str {
    "usage: mnist train <epochs> <out> | train-increment <start> <end> <in> <out> | test <weights> | simple <iterations>"
}

fn parse_count(arg: &str, what: &str) -> Result<usize> {
    arg.parse()
        .with_context(|| format!("invalid {what}: {arg:?}"))
}

fn parse_args() -> Result<Mode> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let mode = match args.as_slice() {
        ["train", epochs, out] => Mode::Train {
            epochs: parse_count(epochs, "epoch count")?,
            out: PathBuf::from(out),
        },
        ["train-increment", start, end, input, out] => {
            let start = parse_count(start, "start epoch")?;
            let end = parse_count(end, "end epoch")?;
            if start == 0 || end < start {
                bail!("epoch range {start}..={end} is empty or starts at 0");
            }
            Mode::TrainIncrement {
                start,
                end,
                input: PathBuf::from(input),
                out: PathBuf::from(out),
            }
        }
        ["test", weights] => Mode::Test {
            weights: PathBuf::from(weights),
        },
        ["simple", iterations] => Mode::Simple {
            iterations: parse_count(iterations, "iteration count")?,
        },
        _ => bail!("{}", usage()),
    };
    Ok(mode)
}

/// 28x28 grayscale → three padded 3x3 convolutions with two 2x2 pools →
/// 784 features → 1000 hidden units → 10 class probabilities.
fn mnist_network(device: Device, seed: u64) -> Result<Network> {
    let mut nn = Network::new(device, &[28, 28, 1])?.with_seed(seed);
    nn.add_conv2d(3, 1, 4, 1, 1)?
        .add_relu()?
        .add_max_pool()?
        .add_conv2d(3, 4, 8, 1, 1)?
        .add_relu()?
        .add_max_pool()?
        .add_conv2d(3, 8, 16, 1, 1)?
        .add_relu()?
        .add_fc(784, 1000)?
        .add_relu()?
        .add_fc(1000, CLASSES)?
        .add_softmax()?;
    Ok(nn)
}

fn load_split(split: Split) -> Result<Mnist> {
    let dir = config::mnist_dir();
    let set = Mnist::load(&dir, split)
        .with_context(|| format!("loading MNIST {split:?} set from {}", dir.display()))?;
    if set.image_dims() != (28, 28) {
        bail!("expected 28x28 images, found {:?}", set.image_dims());
    }
    Ok(set)
}

fn train(nn: &mut Network, cfg: &TrainConfig, start: usize, end: usize) -> Result<()> {
    let batches = load_split(Split::Train)?.batches(nn.device(), cfg.batch_size)?;
    let mut learning_rate = cfg.learning_rate;
    println!("* Initial learning rate({learning_rate:.6})");

    let mut last_loss: Option<f64> = None;
    for epoch in start..=end {
        println!("Epoch {epoch}");
        let mut loss = LogLoss::default();
        for batch in &batches {
            let probs = nn.forward(&batch.images, true)?.to_vec()?;
            loss += metrics::log_loss(&probs, &batch.labels.to_vec()?, CLASSES)?;
            nn.backward(&batch.labels)?;
            nn.update_weights(learning_rate)?;
        }

        let mean = loss.mean();
        if loss.skipped > 0 {
            eprintln!("warning: {} samples had no usable probability", loss.skipped);
        }
        println!("  loss: {mean:.6}, learning rate: {learning_rate:.6}");
        if last_loss.is_some_and(|last| mean > last) {
            learning_rate *= cfg.decay;
        }
        last_loss = Some(mean);
    }
    Ok(())
}

fn test(nn: &mut Network, cfg: &TrainConfig) -> Result<()> {
    let batches = load_split(Split::Test)?.batches(nn.device(), cfg.batch_size)?;
    let mut loss = LogLoss::default();
    let mut hits = TopK::default();
    for batch in &batches {
        let probs = nn.forward(&batch.images, false)?.to_vec()?;
        let labels = batch.labels.to_vec()?;
        loss += metrics::log_loss(&probs, &labels, CLASSES)?;
        hits += metrics::accuracy(&probs, &labels, CLASSES)?;
    }

    let n = hits.samples.max(1) as f64;
    let pct = |count: usize| count as f64 * 100.0 / n;
    println!(
        "[Test[{}](Loss: {:.6}, Top1: {} ({:.4}%), Top3: {} ({:.4}%), Top5: {} ({:.4}%))",
        hits.samples,
        loss.mean(),
        hits.top1,
        pct(hits.top1),
        hits.top3,
        pct(hits.top3),
        hits.top5,
        pct(hits.top5),
    );
    Ok(())
}

/// Fits a dropout MLP to fixed random inputs and targets, printing the mean
/// squared error every ten steps.
fn simple(device: Device, cfg: &TrainConfig, iterations: usize) -> Result<()> {
    const BATCH: usize = 256;
    let mut nn = Network::new(device.clone(), &[100])?.with_seed(cfg.seed);
    nn.add_fc(100, 256)?
        .add_dropout(0.5)?
        .add_relu()?
        .add_fc(256, 128)?
        .add_relu()?
        .add_fc(128, CLASSES)?
        .add_sum_of_squares()?;

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut x = Tensor::new(&device, &[100, BATCH])?;
    x.set_random(&mut rng, 1.0);
    x.push()?;
    let mut y = Tensor::new(&device, &[CLASSES, BATCH])?;
    y.set_random(&mut rng, 1.0);
    y.push()?;
    let targets = y.host().to_vec();

    for i in 0..iterations {
        for _ in 0..10 {
            nn.forward(&x, true)?;
            nn.backward(&y)?;
            nn.update_weights(cfg.learning_rate)?;
        }
        let pred = nn.forward(&x, false)?.to_vec()?;
        let squared: f32 = pred
            .iter()
            .zip(&targets)
            .map(|(p, t)| (p - t) * (p - t))
            .sum();
        println!("[{i:05}]loss: {:.6}", squared / BATCH as f32);
    }
    Ok(())
}

fn main() -> Result<()> {
    let mode = parse_args()?;
    let cfg = TrainConfig::default();
    let device = Device::from_env()?;
    println!("device: {}", if device.is_gpu() { "gpu" } else { "cpu" });

    match mode {
        Mode::Train { epochs, out } => {
            let mut nn = mnist_network(device, cfg.seed)?;
            train(&mut nn, &cfg, 1, epochs)?;
            test(&mut nn, &cfg)?;
            nn.save_weights(&out)
                .with_context(|| format!("saving weights to {}", out.display()))?;
        }
        Mode::TrainIncrement {
            start,
            end,
            input,
            out,
        } => {
            let mut nn = mnist_network(device, cfg.seed)?;
            nn.load_weights(&input)
                .with_context(|| format!("loading weights from {}", input.display()))?;
            train(&mut nn, &cfg, start, end)?;
            nn.save_weights(&out)
                .with_context(|| format!("saving weights to {}", out.display()))?;
        }
        Mode::Test { weights } => {
            let mut nn = mnist_network(device, cfg.seed)?;
            nn.load_weights(&weights)
                .with_context(|| format!("loading weights from {}", weights.display()))?;
            test(&mut nn, &cfg)?;
        }
        Mode::Simple { iterations } => simple(device, &cfg, iterations)?,
    }
    Ok(())
}
