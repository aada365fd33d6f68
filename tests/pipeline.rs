use std::sync::Arc;

use xaynet_fcil::{
    client::{Client, LocalClient},
    coordinator::Coordinator,
    data::{SyntheticSource, TaskDataSource},
    model::{NetworkShape, Perceptron},
    reconstruction::Reconstructor,
    settings::{
        ClientSettings,
        DataSettings,
        FederatedSettings,
        ImageShape,
        MonitorSettings,
        ReconstructionSettings,
    },
};

const IMAGE: ImageShape = ImageShape {
    channels: 1,
    height: 2,
    width: 2,
};

fn federated_settings() -> FederatedSettings {
    FederatedSettings {
        dataset: "synthetic".into(),
        num_clients: 2,
        num_classes: 4,
        join_ratio: 1.,
        random_join_ratio: false,
        global_rounds: 2,
        eval_gap: 1,
        auto_break: false,
        top_cnt: None,
        div_value: None,
        seed: 3,
    }
}

fn client_settings() -> ClientSettings {
    ClientSettings {
        local_epochs: 2,
        batch_size: 4,
        learning_rate: 0.5,
        learning_rate_decay: false,
        learning_rate_decay_gamma: 0.99,
        memory_num: 4,
        kd_weight: 0.5,
        temperature: 2.,
    }
}

fn data_settings() -> DataSettings {
    DataSettings {
        num_clients: 2,
        num_tasks: 2,
        classes_per_task: 2,
        labels_per_client: 2,
        train_per_class: 4,
        test_per_class: 2,
        noise: 0.05,
        seed: 1,
    }
}

fn reconstruction_settings() -> ReconstructionSettings {
    ReconstructionSettings {
        iterations: 4,
        num_image: 2,
        learning_rate: 0.1,
        max_iter: 3,
        history_size: 5,
        tolerance_grad: 1e-7,
        tolerance_change: 1e-9,
        encoder_hidden: 4,
        encoder_seed: 11,
        seed: 0,
        parallel: true,
    }
}

#[test]
fn test_training_run() {
    let federated = federated_settings();
    let reconstruction = reconstruction_settings();
    let encoder = Arc::new(Perceptron::weights_init(
        NetworkShape {
            input: IMAGE.len(),
            hidden: reconstruction.encoder_hidden,
            classes: federated.num_classes,
        },
        reconstruction.encoder_seed,
    ));
    let shape = NetworkShape {
        input: IMAGE.len(),
        hidden: 6,
        classes: federated.num_classes,
    };

    let source = SyntheticSource::new(data_settings(), IMAGE);
    let clients: Vec<LocalClient> = (0..federated.num_clients)
        .map(|id| {
            LocalClient::new(
                source.read_client_data(id, 0).unwrap(),
                client_settings(),
                shape,
                IMAGE,
                Arc::clone(&encoder),
            )
            .unwrap()
        })
        .collect();
    let reconstructor = Reconstructor::new(reconstruction, encoder, IMAGE).unwrap();
    let (mut coordinator, events) = Coordinator::new(
        federated,
        MonitorSettings { batch_size: 3 },
        reconstructor,
        Perceptron::weights_init(shape, 5),
        clients,
        source,
    )
    .unwrap();

    let summary = coordinator.train().unwrap();
    assert_eq!(summary.tasks, 2);
    assert_eq!(summary.rounds, 4);
    // every client shares one gradient per label in the first round of a task
    assert_eq!(summary.reconstructions, 2);
    assert!(summary.promotions >= 1);
    assert!(summary.best_score >= 0.);
    assert_eq!(coordinator.rs_test_acc().len(), 4);

    // 2 clients, 2 labels each, 2 snapshots per gradient
    assert_eq!(coordinator.buffer().image_count(), 8);
    assert!(coordinator.gate().best().is_some());
    assert!(coordinator.model_back().current.is_some());

    for client in coordinator.clients() {
        let state = client.state();
        assert_eq!(state.current_task, 1);
        assert_eq!(state.classes_so_far.len(), 4);
        assert_eq!(state.classes_past_task.len(), 2);
        assert_eq!(state.available_labels.len(), 4);
        assert!(state.task_id.is_known());
    }
    assert!(events.model_listener().get_latest().round_id <= 3);
}
