//! Save/resume round trips through a checkpoint directory.

use backdoor_core::BackdoorError;
use backdoor_core::training::checkpoint::{
    BEST_CHECKPOINT, BestAccuracy, CheckpointManager, CheckpointRecord, LATEST_CHECKPOINT, Resume,
    ResumedState,
};
use backdoor_core::training::optimizer::{Optimizer, OptimizerConfig, SgdOptions};
use backdoor_core::training::scheduler::{MultiStepOptions, Scheduler, SchedulerConfig};
use backdoor_core::training::state::{ParameterStore, StateDict, Stateful, Tensor};
use backdoor_core::training::{DataParallel, Network, get_optimizer, get_scheduler, saved_epochs};
use ndarray::{ArrayD, IxDyn};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

/// Two trainable tensors and one buffer; small enough to serialize quickly.
struct Tiny {
    store: ParameterStore,
}

impl Tiny {
    fn new(fill: f32) -> Self {
        let mut store = ParameterStore::new();
        store.register_parameter("fc.weight", ArrayD::from_elem(IxDyn(&[2, 3]), fill));
        store.register_parameter("fc.bias", ArrayD::from_elem(IxDyn(&[2]), fill));
        store.register_buffer("bn.running_mean", ArrayD::zeros(IxDyn(&[3])));
        Self { store }
    }
}

impl Network for Tiny {
    fn name(&self) -> &str {
        "tiny"
    }

    fn state_dict(&self) -> StateDict {
        self.store.state_dict()
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<(), BackdoorError> {
        self.store.load_strict(state)
    }

    fn trainable_parameters(&self) -> Vec<String> {
        self.store.trainable().to_vec()
    }

    fn parameter(&self, name: &str) -> Option<&Tensor> {
        self.store.get(name)
    }

    fn parameter_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.store.get_mut(name)
    }
}

fn sgd_config() -> OptimizerConfig {
    OptimizerConfig::Sgd(SgdOptions {
        lr: 0.1,
        momentum: 0.9,
        ..SgdOptions::default()
    })
}

fn multi_step() -> SchedulerConfig {
    SchedulerConfig::MultiStep(MultiStepOptions {
        milestones: vec![1],
        gamma: 0.1,
    })
}

fn ones_like(model: &dyn Network) -> StateDict {
    model
        .trainable_parameters()
        .into_iter()
        .filter_map(|name| {
            let shape = model.parameter(&name)?.shape().to_vec();
            Some((name, ArrayD::ones(IxDyn(&shape))))
        })
        .collect()
}

#[test]
fn scratch_with_best_tracking_is_all_zeros() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path().join("never-created"));
    let mut model = Tiny::new(0.5);

    let resumed = manager
        .load_state(&mut model, &Resume::from("False"), None, None, true)
        .unwrap();
    assert_eq!(
        resumed,
        ResumedState {
            epoch: 0,
            best: Some(BestAccuracy { acc: 0.0, epoch: 0 }),
            resumed_from: None,
        }
    );
    assert!(resumed.is_fresh());
    // The model is left as constructed.
    assert_eq!(model.state_dict(), Tiny::new(0.5).state_dict());
}

#[test]
fn scratch_without_tracking_has_no_best() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path());
    let mut model = Tiny::new(0.0);
    let resumed = manager
        .load_state(&mut model, &Resume::Scratch, None, None, false)
        .unwrap();
    assert_eq!(resumed.best, None);
}

#[test]
fn latest_round_trip_restores_everything() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path());

    let mut model = Tiny::new(1.0);
    let mut optimizer = get_optimizer(&model, &sgd_config()).unwrap();
    let mut scheduler = get_scheduler(optimizer.as_ref(), Some(&multi_step()))
        .unwrap()
        .unwrap();

    let grads = ones_like(&model);
    optimizer.step(&mut model, &grads).unwrap();
    scheduler.step(optimizer.as_mut());

    let record = CheckpointRecord::new(1, model.state_dict(), json!({"clean_acc": 0.42}))
        .with_optimizer(optimizer.as_ref())
        .unwrap()
        .with_scheduler(scheduler.as_ref())
        .unwrap()
        .with_best(BestAccuracy { acc: 0.42, epoch: 1 });
    manager.persist_epoch(&record, true, &Default::default()).unwrap();

    let mut fresh = Tiny::new(1.0);
    let mut fresh_optimizer = get_optimizer(&fresh, &sgd_config()).unwrap();
    let mut fresh_scheduler = get_scheduler(fresh_optimizer.as_ref(), Some(&multi_step()))
        .unwrap()
        .unwrap();

    let resumed = manager
        .load_state(
            &mut fresh,
            &Resume::Latest,
            Some(fresh_optimizer.as_mut() as &mut dyn Optimizer),
            Some(fresh_scheduler.as_mut() as &mut dyn Scheduler),
            true,
        )
        .unwrap();

    assert_eq!(resumed.epoch, 1);
    assert_eq!(resumed.best, Some(BestAccuracy { acc: 0.42, epoch: 1 }));
    assert_eq!(fresh.state_dict(), model.state_dict());
    assert!((fresh_optimizer.lr() - optimizer.lr()).abs() < 1e-12);
    assert_eq!(fresh_scheduler.last_epoch(), 1);
    assert_eq!(
        fresh_optimizer.state_dict().unwrap(),
        optimizer.state_dict().unwrap()
    );
}

#[test]
fn parallel_checkpoint_into_plain_model_strips_prefix() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path());

    let parallel = DataParallel::new(Tiny::new(3.0));
    let saved = parallel.state_dict();
    assert!(saved.keys().all(|k| k.starts_with("module.")));
    let record = CheckpointRecord::new(7, saved, json!(null));
    manager.save(LATEST_CHECKPOINT, &record).unwrap();

    let mut plain = Tiny::new(0.0);
    let resumed = manager
        .load_state(&mut plain, &Resume::Latest, None, None, false)
        .unwrap();
    assert_eq!(resumed.epoch, 7);
    let keys: Vec<_> = plain.state_dict().into_keys().collect();
    assert_eq!(keys, vec!["bn.running_mean", "fc.bias", "fc.weight"]);
    assert_eq!(plain.state_dict(), Tiny::new(3.0).state_dict());
}

#[test]
fn parallel_model_loads_prefixed_keys_verbatim() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path());

    let source = DataParallel::new(Tiny::new(2.0));
    let record = CheckpointRecord::new(4, source.state_dict(), json!({}));
    manager.save("parallel.pt", &record).unwrap();

    let mut target = DataParallel::new(Tiny::new(0.0));
    manager
        .load_state(&mut target, &Resume::from("parallel.pt"), None, None, false)
        .unwrap();
    assert_eq!(target.state_dict(), source.state_dict());
}

#[test]
fn plain_checkpoint_into_parallel_model_fails() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path());
    let record = CheckpointRecord::new(4, Tiny::new(2.0).state_dict(), json!({}));
    manager.save(LATEST_CHECKPOINT, &record).unwrap();

    let mut target = DataParallel::new(Tiny::new(0.0));
    let err = manager
        .load_state(&mut target, &Resume::Latest, None, None, false)
        .unwrap_err();
    assert!(matches!(err, BackdoorError::Checkpoint(_)));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path());
    let mut model = Tiny::new(0.0);

    let err = manager
        .load_state(&mut model, &Resume::Latest, None, None, false)
        .unwrap_err();
    assert!(matches!(err, BackdoorError::Io(_)));

    let err = manager
        .load_state(&mut model, &Resume::from("epoch40.pt"), None, None, false)
        .unwrap_err();
    assert!(matches!(err, BackdoorError::Io(_)));
}

#[test]
fn missing_optimizer_state_is_a_missing_key() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path());
    let model = Tiny::new(1.0);
    let record = CheckpointRecord::new(2, model.state_dict(), json!({}));
    manager.save(LATEST_CHECKPOINT, &record).unwrap();

    let mut target = Tiny::new(0.0);
    let mut optimizer = get_optimizer(&target, &sgd_config()).unwrap();
    let err = manager
        .load_state(
            &mut target,
            &Resume::Latest,
            Some(optimizer.as_mut() as &mut dyn Optimizer),
            None,
            false,
        )
        .unwrap_err();
    assert!(matches!(err, BackdoorError::MissingKey(ref k) if k == "optimizer_state_dict"));
}

#[test]
fn tracking_best_requires_best_keys() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path());
    let record = CheckpointRecord::new(2, Tiny::new(1.0).state_dict(), json!({}));
    manager.save(LATEST_CHECKPOINT, &record).unwrap();

    let mut target = Tiny::new(0.0);
    let err = manager
        .load_state(&mut target, &Resume::Latest, None, None, true)
        .unwrap_err();
    assert!(matches!(err, BackdoorError::MissingKey(ref k) if k == "best_acc"));
}

#[test]
fn malformed_record_fails_on_first_missing_key() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path());
    let record = CheckpointRecord::from_value(json!({"epoch": 5})).unwrap();
    manager.save(LATEST_CHECKPOINT, &record).unwrap();

    let mut model = Tiny::new(0.0);
    let err = manager
        .load_state(&mut model, &Resume::Latest, None, None, false)
        .unwrap_err();
    assert!(matches!(err, BackdoorError::MissingKey(ref k) if k == "result"));
}

#[test]
fn persist_epoch_writes_selected_files() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path());
    let selected = saved_epochs(100, 100, 20, 100).unwrap();
    let model = Tiny::new(1.0);

    for epoch in 19..=20 {
        let record = CheckpointRecord::new(epoch, model.state_dict(), json!({}));
        manager.persist_epoch(&record, epoch == 19, &selected).unwrap();
    }

    assert!(dir.path().join(LATEST_CHECKPOINT).exists());
    assert!(dir.path().join(BEST_CHECKPOINT).exists());
    assert!(dir.path().join("epoch20.pt").exists());
    assert!(!dir.path().join("epoch19.pt").exists());

    let entries = manager.list().unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec![BEST_CHECKPOINT, LATEST_CHECKPOINT, "epoch20.pt"]);
    let latest = entries.iter().find(|e| e.name == LATEST_CHECKPOINT).unwrap();
    assert_eq!(latest.epoch, 20);
    assert_eq!(latest.sha256.len(), 64);

    let best = manager.read(&dir.path().join(BEST_CHECKPOINT)).unwrap();
    assert_eq!(best.epoch().unwrap(), 19);
}

#[test]
fn model_state_is_checked_after_result() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path());
    let record = CheckpointRecord::from_value(json!({"epoch": 5, "result": {}})).unwrap();
    manager.save(LATEST_CHECKPOINT, &record).unwrap();

    let mut model = Tiny::new(0.0);
    let err = manager
        .load_state(&mut model, &Resume::Latest, None, None, false)
        .unwrap_err();
    assert!(matches!(err, BackdoorError::MissingKey(ref k) if k == "model_state_dict"));
}

#[test]
fn non_checkpoint_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(LATEST_CHECKPOINT), r#"{"epoch": 5}"#).unwrap();
    let manager = CheckpointManager::new(dir.path());

    let mut model = Tiny::new(0.0);
    let err = manager
        .load_state(&mut model, &Resume::Latest, None, None, false)
        .unwrap_err();
    assert!(matches!(err, BackdoorError::Checkpoint(_)));
}

#[test]
fn epoch_zero_checkpoint_resumes_rather_than_starting_fresh() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path());
    let record = CheckpointRecord::new(0, Tiny::new(4.0).state_dict(), json!({}))
        .with_best(BestAccuracy { acc: 0.0, epoch: 0 });
    manager.save(LATEST_CHECKPOINT, &record).unwrap();

    let mut model = Tiny::new(0.0);
    let resumed = manager
        .load_state(&mut model, &Resume::Latest, None, None, true)
        .unwrap();
    assert_eq!(resumed.epoch, 0);
    assert!(!resumed.is_fresh());
    assert_eq!(resumed.resumed_from, Some(dir.path().join(LATEST_CHECKPOINT)));
    assert_eq!(model.state_dict(), Tiny::new(4.0).state_dict());
}

#[test]
fn tensors_are_stored_as_raw_f32() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path());

    let mut store = ParameterStore::new();
    store.register_parameter("conv.weight", ArrayD::from_elem(IxDyn(&[64, 64, 3, 3]), 0.123_456_7));
    let values = 64 * 64 * 3 * 3;
    let mut model = Tiny { store };

    let mut optimizer = get_optimizer(&model, &sgd_config()).unwrap();
    let grads = ones_like(&model);
    optimizer.step(&mut model, &grads).unwrap();

    let record = CheckpointRecord::new(3, model.state_dict(), json!({}))
        .with_optimizer(optimizer.as_ref())
        .unwrap();
    let entry = manager.save(LATEST_CHECKPOINT, &record).unwrap();

    // Weights plus one momentum buffer, four bytes each, and a small header.
    let raw = (2 * values * 4) as u64;
    assert!(entry.size_bytes >= raw);
    assert!(entry.size_bytes < raw + 4096, "{} bytes", entry.size_bytes);

    let restored = manager.read(&dir.path().join(LATEST_CHECKPOINT)).unwrap();
    assert_eq!(restored, record);
}
