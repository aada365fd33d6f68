use std::collections::BTreeSet;

use crate::{
    client::Client,
    coordinator::{
        global_round_index,
        tests::utils::{
            enable_logging,
            federated_settings,
            monitor_settings,
            network_shape,
            new_coordinator,
            partition,
            reconstructor,
            ScriptedClient,
            ScriptedSource,
        },
        Coordinator,
        CoordinatorError,
    },
    data::{DataError, MockTaskDataSource},
    model::Perceptron,
    registry::TaskId,
    settings::{IMAGENET1K, IMAGENET1K_TASKS},
};

#[test]
fn test_global_round_index() {
    assert_eq!(global_round_index(4, 10, 2), 24);
    assert_eq!(global_round_index(0, 10, 0), 0);
    assert_eq!(global_round_index(9, 10, 0), 9);
    assert_eq!(global_round_index(0, 10, 1), 10);
}

#[test]
fn test_task_count() {
    let (coordinator, _) = new_coordinator(federated_settings(3), ScriptedSource { tasks: 4 }, 0, 0);
    assert_eq!(coordinator.task_count(), 4);

    let mut settings = federated_settings(3);
    settings.dataset = IMAGENET1K.into();
    let (coordinator, _) = new_coordinator(settings, ScriptedSource { tasks: 4 }, 0, 0);
    assert_eq!(coordinator.task_count(), IMAGENET1K_TASKS);
}

#[test]
fn test_new_without_clients() {
    let result = Coordinator::<ScriptedClient, _>::new(
        federated_settings(3),
        monitor_settings(),
        reconstructor(),
        Perceptron::weights_init(network_shape(), 0),
        Vec::new(),
        ScriptedSource { tasks: 1 },
    );
    assert!(matches!(result, Err(CoordinatorError::NoClients)));
}

#[test]
fn test_begin_task_updates_label_bookkeeping() {
    enable_logging();
    let mut source = MockTaskDataSource::new();
    source
        .expect_read_client_data()
        .withf(|_, task| *task == 1)
        .times(3)
        .returning(|client, _| Ok(partition(client, &[10 + client])));
    let (mut coordinator, _) = new_coordinator(federated_settings(3), source, 0, 0);

    coordinator.begin_task(0).unwrap();
    let first_labels: BTreeSet<usize> = [0, 1, 2].into_iter().collect();
    for client in coordinator.clients() {
        assert_eq!(client.state().available_labels, first_labels);
        assert!(client.state().available_labels_past.is_empty());
        assert_eq!(client.state().task_id, TaskId(client.id() as i64));
    }

    coordinator.begin_task(1).unwrap();
    let all: BTreeSet<usize> = [0, 1, 2, 10, 11, 12].into_iter().collect();
    let current: BTreeSet<usize> = [10, 11, 12].into_iter().collect();
    for client in coordinator.clients() {
        let state = client.state();
        assert_eq!(state.current_labels, vec![10 + client.id()]);
        assert_eq!(state.classes_past_task, vec![client.id()]);
        assert_eq!(state.available_labels, all);
        assert_eq!(state.available_labels_current, current);
        assert_eq!(state.available_labels_past, first_labels);
        // the first task took the ids 0 to 2
        assert_eq!(state.task_id, TaskId(3 + client.id() as i64));
    }
    assert_eq!(coordinator.registry().unique_tasks().len(), 6);
    assert_eq!(coordinator.registry().old_unique_tasks().len(), 3);
}

#[test]
fn test_begin_task_propagates_data_errors() {
    let mut source = MockTaskDataSource::new();
    source
        .expect_read_client_data()
        .returning(|client, task| Err(DataError::UnknownTask { client, task }));
    let (mut coordinator, _) = new_coordinator(federated_settings(3), source, 0, 0);
    coordinator.begin_task(0).unwrap();
    assert!(matches!(
        coordinator.begin_task(1),
        Err(CoordinatorError::Data(DataError::UnknownTask {
            client: 0,
            task: 1
        }))
    ));
}

#[test]
fn test_begin_task_rejects_foreign_data() {
    let mut source = MockTaskDataSource::new();
    source
        .expect_read_client_data()
        .returning(|_, task| Ok(partition(7, &[task])));
    let (mut coordinator, _) = new_coordinator(federated_settings(3), source, 0, 0);
    assert!(matches!(
        coordinator.begin_task(1),
        Err(CoordinatorError::Client(_))
    ));
}
