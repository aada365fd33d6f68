//! The label and task registry.
//!
//! Every task introduces a set of labels. A client's current label set, sorted, is its task
//! signature; the registry hands out a stable [`TaskId`] per signature, in the order the
//! signatures were first seen.

use std::collections::{BTreeMap, BTreeSet};

use derive_more::{Display, From};

use crate::data::Label;

/// The sorted, duplicate-free label set of a task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
pub struct TaskSignature(Vec<Label>);

impl TaskSignature {
    /// Creates the signature of the given labels, in any order.
    pub fn new(labels: &[Label]) -> Self {
        let mut labels = labels.to_vec();
        labels.sort_unstable();
        labels.dedup();
        Self(labels)
    }

    /// Gets the labels of the signature in ascending order.
    pub fn labels(&self) -> &[Label] {
        &self.0
    }
}

/// The identifier of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub struct TaskId(pub i64);

impl TaskId {
    /// The identifier of a label set that is absent from the registry.
    pub const UNKNOWN: TaskId = TaskId(-1);

    /// Checks whether this identifier refers to a registered task.
    pub fn is_known(&self) -> bool {
        self.0 >= 0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// The assignment of task identifiers to signatures.
#[derive(Debug, Clone, Default, PartialEq, Eq, From)]
pub struct TaskDict(BTreeMap<TaskSignature, TaskId>);

impl TaskDict {
    /// Resolves the task identifier of a label set, in any order.
    ///
    /// Yields [`TaskId::UNKNOWN`] for an unregistered label set.
    pub fn resolve(&self, labels: &[Label]) -> TaskId {
        self.0
            .get(&TaskSignature::new(labels))
            .copied()
            .unwrap_or(TaskId::UNKNOWN)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Collects the distinct signatures of the given label sets in first-seen order.
pub fn get_unique_tasks<'a>(label_sets: impl IntoIterator<Item = &'a [Label]>) -> Vec<TaskSignature> {
    let mut seen = BTreeSet::new();
    let mut unique = Vec::new();
    for labels in label_sets {
        let signature = TaskSignature::new(labels);
        if seen.insert(signature.clone()) {
            unique.push(signature);
        }
    }
    unique
}

/// Numbers the signatures by position.
pub fn assign_unique_tasks(unique: &[TaskSignature]) -> TaskDict {
    unique
        .iter()
        .enumerate()
        .map(|(id, signature)| (signature.clone(), TaskId(id as i64)))
        .collect::<BTreeMap<_, _>>()
        .into()
}

/// The labels introduced at a task transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    task: usize,
    introduced: BTreeSet<Label>,
    seen: BTreeSet<Label>,
}

impl TaskRecord {
    /// Gets the task index.
    pub fn task(&self) -> usize {
        self.task
    }

    /// Gets the labels first introduced by this task.
    pub fn introduced(&self) -> &BTreeSet<Label> {
        &self.introduced
    }

    /// Gets every label seen by any client up to and including this task.
    pub fn seen(&self) -> &BTreeSet<Label> {
        &self.seen
    }
}

/// The label sets the coordinator broadcasts to the clients at every task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailableLabels {
    /// Every label any client has seen so far.
    pub all: BTreeSet<Label>,
    /// The labels any client holds in the current task.
    pub current: BTreeSet<Label>,
    /// The labels seen before the current task.
    pub past: BTreeSet<Label>,
}

#[derive(Debug, Default)]
/// The coordinator side registry of tasks and labels.
pub struct LabelRegistry {
    records: Vec<TaskRecord>,
    task_list: Vec<Vec<Label>>,
    old_unique_tasks: Vec<TaskSignature>,
    unique_tasks: Vec<TaskSignature>,
    task_dict: TaskDict,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a task transition.
    ///
    /// `client_labels` holds the pairs of cumulative (`classes_so_far`) and current labels of every
    /// client after the transition. `previous` is the cumulative label set before the transition,
    /// as seen by the first client. The task list accumulates across calls, so the identifiers of
    /// signatures seen in earlier tasks never change.
    pub fn record_task<'a, I>(
        &mut self,
        task: usize,
        client_labels: I,
        previous: &BTreeSet<Label>,
    ) -> AvailableLabels
    where
        I: IntoIterator<Item = (&'a [Label], &'a [Label])>,
    {
        let mut available = AvailableLabels {
            past: previous.clone(),
            ..AvailableLabels::default()
        };
        for (so_far, current) in client_labels {
            available.all.extend(so_far.iter().copied());
            available.current.extend(current.iter().copied());
            self.task_list.push(current.to_vec());
        }

        let already_seen = self
            .records
            .last()
            .map(|record| record.seen.clone())
            .unwrap_or_default();
        self.records.push(TaskRecord {
            task,
            introduced: available.all.difference(&already_seen).copied().collect(),
            seen: available.all.clone(),
        });

        self.old_unique_tasks = std::mem::take(&mut self.unique_tasks);
        self.unique_tasks = get_unique_tasks(self.task_list.iter().map(Vec::as_slice));
        self.task_dict = assign_unique_tasks(&self.unique_tasks);
        debug!(
            "task {}: {} labels seen, {} unique task signatures",
            task,
            available.all.len(),
            self.unique_tasks.len()
        );
        available
    }

    /// Gets the record of a task.
    pub fn record(&self, task: usize) -> Option<&TaskRecord> {
        self.records.iter().find(|record| record.task == task)
    }

    /// Gets the current task dictionary.
    pub fn task_dict(&self) -> &TaskDict {
        &self.task_dict
    }

    /// Gets the unique task signatures seen so far.
    pub fn unique_tasks(&self) -> &[TaskSignature] {
        &self.unique_tasks
    }

    /// Gets the unique task signatures as they were before the latest transition.
    pub fn old_unique_tasks(&self) -> &[TaskSignature] {
        &self.old_unique_tasks
    }
}
