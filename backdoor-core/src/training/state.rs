//! Named tensors and the state save/restore contract shared by networks,
//! optimizers and schedulers.

use crate::error::BackdoorError;
use ndarray::ArrayD;
use std::collections::BTreeMap;

/// Dense `f32` tensor of any rank.
pub type Tensor = ArrayD<f32>;

/// Parameter name → tensor, ordered by name.
pub type StateDict = BTreeMap<String, Tensor>;

/// Key prefix added by the multi-device wrapper.
pub const PARALLEL_PREFIX: &str = "module.";

/// Opaque state persistence for optimizers and schedulers.
pub trait Stateful {
    fn state_dict(&self) -> Result<serde_json::Value, BackdoorError>;
    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<(), BackdoorError>;
}

/// Remove a leading `module.` from every key. Keys without it pass through.
pub fn strip_parallel_prefix(state: StateDict) -> StateDict {
    state
        .into_iter()
        .map(|(key, tensor)| match key.strip_prefix(PARALLEL_PREFIX) {
            Some(stripped) => (stripped.to_string(), tensor),
            None => (key, tensor),
        })
        .collect()
}

/// Storage for a network's parameters and buffers.
///
/// Parameters are trainable; buffers (batch-norm running statistics) are
/// persisted in the state dict but never handed to an optimizer.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    tensors: StateDict,
    trainable: Vec<String>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_parameter(&mut self, name: impl Into<String>, tensor: Tensor) {
        let name = name.into();
        if !self.tensors.contains_key(&name) {
            self.trainable.push(name.clone());
        }
        self.tensors.insert(name, tensor);
    }

    pub fn register_buffer(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.tensors.get_mut(name)
    }

    /// Trainable parameter names in registration order.
    pub fn trainable(&self) -> &[String] {
        &self.trainable
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn state_dict(&self) -> StateDict {
        self.tensors.clone()
    }

    /// Replace every tensor from `state`.
    ///
    /// Strict: the key sets must match exactly and every shape must agree.
    /// Nothing is modified when the check fails.
    pub fn load_strict(&mut self, mut state: StateDict) -> Result<(), BackdoorError> {
        let missing: Vec<&str> = self
            .tensors
            .keys()
            .filter(|k| !state.contains_key(*k))
            .map(String::as_str)
            .collect();
        let unexpected: Vec<&str> = state
            .keys()
            .filter(|k| !self.tensors.contains_key(*k))
            .map(String::as_str)
            .collect();

        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("missing key(s): {}", missing.join(", ")));
        }
        if !unexpected.is_empty() {
            problems.push(format!("unexpected key(s): {}", unexpected.join(", ")));
        }
        for (name, current) in &self.tensors {
            if let Some(incoming) = state.get(name) {
                if incoming.shape() != current.shape() {
                    problems.push(format!(
                        "size mismatch for {name}: checkpoint {:?}, model {:?}",
                        incoming.shape(),
                        current.shape()
                    ));
                }
            }
        }
        if !problems.is_empty() {
            return Err(BackdoorError::checkpoint(format!(
                "error loading state dict: {}",
                problems.join("; ")
            )));
        }

        for (name, tensor) in self.tensors.iter_mut() {
            if let Some(incoming) = state.remove(name) {
                *tensor = incoming;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn tensor(shape: &[usize], value: f32) -> Tensor {
        ArrayD::from_elem(IxDyn(shape), value)
    }

    #[test]
    fn test_strip_parallel_prefix() {
        let mut state = StateDict::new();
        state.insert("module.conv1.weight".into(), tensor(&[2], 1.0));
        state.insert("linear.bias".into(), tensor(&[1], 2.0));
        state.insert("layer.module.x".into(), tensor(&[1], 3.0));

        let stripped = strip_parallel_prefix(state);
        let keys: Vec<&str> = stripped.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["conv1.weight", "layer.module.x", "linear.bias"]);
    }

    #[test]
    fn test_buffers_are_not_trainable() {
        let mut store = ParameterStore::new();
        store.register_parameter("bn.weight", tensor(&[4], 1.0));
        store.register_buffer("bn.running_mean", tensor(&[4], 0.0));
        assert_eq!(store.trainable(), ["bn.weight".to_string()]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_load_strict_replaces_tensors() {
        let mut store = ParameterStore::new();
        store.register_parameter("w", tensor(&[2, 2], 0.0));

        let mut state = StateDict::new();
        state.insert("w".into(), tensor(&[2, 2], 7.0));
        store.load_strict(state).unwrap();
        assert!(store.get("w").unwrap().iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_load_strict_reports_every_problem() {
        let mut store = ParameterStore::new();
        store.register_parameter("w", tensor(&[2, 2], 0.0));
        store.register_parameter("b", tensor(&[2], 0.0));

        let mut state = StateDict::new();
        state.insert("w".into(), tensor(&[3, 2], 1.0));
        state.insert("extra".into(), tensor(&[1], 1.0));

        let err = store.load_strict(state).unwrap_err().to_string();
        assert!(err.contains("missing key(s): b"), "{err}");
        assert!(err.contains("unexpected key(s): extra"), "{err}");
        assert!(err.contains("size mismatch for w"), "{err}");
        // Untouched on failure.
        assert!(store.get("w").unwrap().iter().all(|&v| v == 0.0));
    }
}
