//! Scripted controller session on a synthetic camera
//!
//! Usage: `ctrl-demo [config.json]`. Holds each control for a fixed number of
//! frames while the synthetic camera shows that class's pose, trains the
//! head, then checks live predictions. Set `RUST_LOG` for more detail.

use std::sync::atomic::Ordering;

use anyhow::Context;
use ctrl_session::{
    CancellationFlag, DenseTensor, LoggingObserver, PoolingExtractor, Session, SessionConfig,
    SessionObserver, SyntheticFrameSource, TrainStatus, TrainingConfig,
};
use tracing_subscriber::EnvFilter;

/// Frames each control is held for
const EXAMPLES_PER_CLASS: usize = 30;

/// Frames the live prediction loop runs for
const PREDICTION_FRAMES: usize = 20;

/// Logs events and lowers the flag after a fixed number of frames
struct ScriptedHold {
    inner: LoggingObserver,
    flag: CancellationFlag,
    seen: usize,
}

impl ScriptedHold {
    fn frame(&mut self, limit: usize) {
        if !self.flag.is_raised() {
            return;
        }
        self.seen += 1;
        if self.seen >= limit {
            self.seen = 0;
            self.flag.lower();
        }
    }
}

impl SessionObserver for ScriptedHold {
    fn example_added(&mut self, label: usize, total: usize, image: &DenseTensor<f32>) {
        self.inner.example_added(label, total, image);
        self.frame(EXAMPLES_PER_CLASS);
    }

    fn train_status(&mut self, status: &TrainStatus) {
        self.inner.train_status(status);
    }

    fn prediction(&mut self, label: usize, control: &str) {
        self.inner.prediction(label, control);
        self.frame(PREDICTION_FRAMES);
    }

    fn collection_started(&mut self, label: usize) {
        self.inner.collection_started(label);
    }

    fn collection_finished(&mut self, label: usize, added: usize) {
        self.inner.collection_finished(label, added);
    }
}

fn load_config() -> anyhow::Result<SessionConfig> {
    match std::env::args().nth(1) {
        Some(path) => SessionConfig::from_json_file(&path)
            .with_context(|| format!("failed to load config from {path}")),
        None => Ok(SessionConfig {
            training: TrainingConfig::new().learning_rate(0.001),
            ..SessionConfig::default()
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let num_classes = config.num_classes;
    let controls = config.controls.clone();

    let source = SyntheticFrameSource::new(
        config.capture.height,
        config.capture.width,
        config.training.seed,
    );
    let pose = source.pose_handle();
    let flag = CancellationFlag::new();
    let observer = ScriptedHold {
        inner: LoggingObserver,
        flag: flag.clone(),
        seen: 0,
    };

    let mut session = Session::new(
        config,
        Box::new(source),
        Box::new(PoolingExtractor::new(7, 3)),
        Box::new(observer),
    )?;
    session.warm_up()?;

    for label in 0..num_classes {
        pose.store(label, Ordering::Relaxed);
        flag.raise();
        session.collect_while_held(label, &flag).await?;
    }
    tracing::info!(totals = ?session.totals(), "examples collected");

    let history = session
        .train()
        .await
        .context("training the classifier head")?;
    tracing::info!(
        batch_size = history.batch_size,
        loss = ?history.final_loss(),
        "head trained"
    );

    let mut correct = 0;
    for label in 0..num_classes {
        pose.store(label, Ordering::Relaxed);
        let predicted = session.predict_once()?;
        let (expected, actual) = (&controls[label], &controls[predicted]);
        tracing::info!(expected, predicted = actual, "held pose");
        if predicted == label {
            correct += 1;
        }
    }
    tracing::info!(correct, total = num_classes, "pose check finished");

    pose.store(0, Ordering::Relaxed);
    flag.raise();
    let frames = session.predict_while_running(&flag).await?;
    tracing::info!(frames, "live prediction stopped");

    tracing::info!(stats = ?session.memory_stats(), "buffer accounting");
    session.reset();
    Ok(())
}
