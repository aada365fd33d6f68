use std::{
    path::PathBuf,
    process,
    sync::{atomic::Ordering, Arc},
};

use anyhow::Context;
use structopt::StructOpt;
use tokio::{signal, task};
use tracing_subscriber::*;
use xaynet_fcil::{
    client::LocalClient,
    coordinator::{events::ModelUpdate, Coordinator},
    data::{SyntheticSource, TaskDataSource},
    model::{NetworkShape, Perceptron},
    reconstruction::Reconstructor,
    settings::Settings,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        federated: federated_settings,
        client: client_settings,
        model: model_settings,
        reconstruction: reconstruction_settings,
        monitor: monitor_settings,
        data: data_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let image = model_settings.image;
    // clients and coordinator must share the very same frozen encoder
    let encoder = Arc::new(Perceptron::weights_init(
        NetworkShape {
            input: image.len(),
            hidden: reconstruction_settings.encoder_hidden,
            classes: federated_settings.num_classes,
        },
        reconstruction_settings.encoder_seed,
    ));
    let shape = NetworkShape {
        input: image.len(),
        hidden: model_settings.hidden,
        classes: federated_settings.num_classes,
    };

    let source = SyntheticSource::new(data_settings, image);
    let clients = (0..federated_settings.num_clients)
        .map(|id| -> anyhow::Result<LocalClient> {
            let partition = source
                .read_client_data(id, 0)
                .context("failed to read the partitions of the first task")?;
            LocalClient::new(
                partition,
                client_settings,
                shape,
                image,
                Arc::clone(&encoder),
            )
            .with_context(|| format!("client {} cannot train on its partition", id))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let reconstructor = Reconstructor::new(reconstruction_settings, encoder, image)
        .context("failed to initialize the reconstruction")?;
    let global = Perceptron::weights_init(shape, model_settings.seed);
    let (mut coordinator, event_subscriber) = Coordinator::new(
        federated_settings,
        monitor_settings,
        reconstructor,
        global,
        clients,
        source,
    )
    .context("failed to initialize the coordinator")?;
    let shutdown = coordinator.shutdown_handle();

    let mut models = event_subscriber.model_listener();
    let model_watcher = tokio::spawn(async move {
        while let Some(event) = models.changed().await {
            if let ModelUpdate::New { version, weights } = event.event {
                debug!(
                    "best model {} published in round {} ({} layers)",
                    version,
                    event.round_id,
                    weights.len()
                );
            }
        }
    });

    let mut training = task::spawn_blocking(move || coordinator.train());
    let result = tokio::select! {
        result = &mut training => result,
        _ = signal::ctrl_c() => {
            warn!("shutting down: stopping after the current round");
            shutdown.store(true, Ordering::SeqCst);
            training.await
        }
    };
    let summary = result.context("the training task panicked")??;
    let _ = model_watcher.await;

    info!(
        "finished {} tasks in {} rounds: {} reconstructions, {} promotions, best monitor score {:.2}%",
        summary.tasks,
        summary.rounds,
        summary.reconstructions,
        summary.promotions,
        summary.best_score
    );
    if let Some(accuracy) = summary.best_test_accuracy {
        info!("best test accuracy: {:.4}", accuracy);
    }
    if let Some(cost) = summary.mean_round_cost {
        info!("average time cost per round: {:?}", cost);
    }
    Ok(())
}
