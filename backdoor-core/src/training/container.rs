//! On-disk checkpoint layout.
//!
//! A checkpoint is a safetensors container. Model weights are stored as
//! `model_state_dict/<key>` tensors. Any ndarray nested in the remaining
//! record fields (optimizer moment and momentum buffers) is moved into a
//! tensor named by its JSON path and left behind as `{"$tensor": name}`.
//! What is left of the record is JSON in the header metadata.

use crate::error::BackdoorError;
use crate::training::state::{StateDict, Tensor};
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use serde_json::{Map, Value};
use std::collections::HashMap;

const FORMAT_KEY: &str = "format";
const FORMAT: &str = "backdoor-checkpoint";
const RECORD_KEY: &str = "record";
const MODEL_TENSORS_KEY: &str = "model_tensors";
const MODEL_PREFIX: &str = "model_state_dict/";
const TENSOR_REF: &str = "$tensor";

/// Version tag ndarray writes into its serde representation.
const NDARRAY_FORMAT_VERSION: u64 = 1;

/// A checkpoint split back into its JSON fields and model weights.
#[derive(Debug)]
pub(crate) struct Decoded {
    pub fields: Map<String, Value>,
    pub model_state: Option<StateDict>,
}

struct Array {
    name: String,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

fn container_error(e: safetensors::SafeTensorError) -> BackdoorError {
    BackdoorError::checkpoint(format!("invalid checkpoint container: {e}"))
}

fn f32_bytes(values: impl Iterator<Item = f32>) -> Vec<u8> {
    values.flat_map(f32::to_le_bytes).collect()
}

fn tensor_values(view: &TensorView<'_>, name: &str) -> Result<Vec<f32>, BackdoorError> {
    if view.dtype() != Dtype::F32 {
        return Err(BackdoorError::checkpoint(format!(
            "tensor `{name}` has dtype {:?}, expected F32",
            view.dtype()
        )));
    }
    Ok(view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn to_tensor(view: &TensorView<'_>, name: &str) -> Result<Tensor, BackdoorError> {
    let values = tensor_values(view, name)?;
    ArrayD::from_shape_vec(IxDyn(view.shape()), values)
        .map_err(|e| BackdoorError::checkpoint(format!("tensor `{name}`: {e}")))
}

/// Shape and f32 bytes of a value in ndarray's serde form
/// (`{"v": 1, "dim": [...], "data": [...]}`), if it is one.
///
/// Non-finite elements serialize as JSON `null`; such arrays stay inline.
fn ndarray_parts(value: &Value) -> Option<(Vec<usize>, Vec<u8>)> {
    let map = value.as_object()?;
    if map.len() != 3 || map.get("v")?.as_u64()? != NDARRAY_FORMAT_VERSION {
        return None;
    }
    let shape = map
        .get("dim")?
        .as_array()?
        .iter()
        .map(|d| d.as_u64().map(|d| d as usize))
        .collect::<Option<Vec<_>>>()?;
    let data = map.get("data")?.as_array()?;
    if data.len() != shape.iter().product::<usize>() {
        return None;
    }
    let values = data
        .iter()
        .map(|x| x.as_f64().map(|x| x as f32))
        .collect::<Option<Vec<_>>>()?;
    Some((shape, f32_bytes(values.into_iter())))
}

fn tensor_ref(name: &str) -> Value {
    let mut map = Map::new();
    map.insert(TENSOR_REF.to_string(), Value::from(name));
    Value::Object(map)
}

fn extract_arrays(value: &Value, path: &str, arrays: &mut Vec<Array>) -> Value {
    if let Some((shape, bytes)) = ndarray_parts(value) {
        arrays.push(Array {
            name: path.to_string(),
            shape,
            bytes,
        });
        return tensor_ref(path);
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), extract_arrays(v, &format!("{path}/{k}"), arrays)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| extract_arrays(v, &format!("{path}/{i}"), arrays))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn restore_arrays(value: Value, tensors: &SafeTensors<'_>) -> Result<Value, BackdoorError> {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(name)) = map.get(TENSOR_REF) {
                    let view = tensors.tensor(name).map_err(container_error)?;
                    let data = tensor_values(&view, name)?
                        .into_iter()
                        .map(|x| Value::from(f64::from(x)))
                        .collect();
                    let mut array = Map::new();
                    array.insert("v".into(), Value::from(NDARRAY_FORMAT_VERSION));
                    array.insert("dim".into(), Value::from(view.shape().to_vec()));
                    array.insert("data".into(), Value::Array(data));
                    return Ok(Value::Object(array));
                }
            }
            map.into_iter()
                .map(|(k, v)| Ok((k, restore_arrays(v, tensors)?)))
                .collect::<Result<Map<_, _>, BackdoorError>>()
                .map(Value::Object)
        }
        Value::Array(items) => items
            .into_iter()
            .map(|v| restore_arrays(v, tensors))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

/// Serialize a record into container bytes.
pub(crate) fn encode(
    fields: &Map<String, Value>,
    model_state: Option<&StateDict>,
) -> Result<Vec<u8>, BackdoorError> {
    let mut arrays = Vec::new();
    if let Some(state) = model_state {
        for (key, tensor) in state {
            arrays.push(Array {
                name: format!("{MODEL_PREFIX}{key}"),
                shape: tensor.shape().to_vec(),
                bytes: f32_bytes(tensor.iter().copied()),
            });
        }
    }
    let record: Map<String, Value> = fields
        .iter()
        .map(|(k, v)| (k.clone(), extract_arrays(v, k, &mut arrays)))
        .collect();

    let mut metadata = HashMap::new();
    metadata.insert(FORMAT_KEY.to_string(), FORMAT.to_string());
    metadata.insert(RECORD_KEY.to_string(), serde_json::to_string(&record)?);
    if let Some(state) = model_state {
        metadata.insert(MODEL_TENSORS_KEY.to_string(), state.len().to_string());
    }

    let views = arrays
        .iter()
        .map(|a| TensorView::new(Dtype::F32, a.shape.clone(), &a.bytes).map(|v| (a.name.as_str(), v)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(container_error)?;
    safetensors::serialize(views, &Some(metadata)).map_err(container_error)
}

/// Parse container bytes written by [`encode`].
pub(crate) fn decode(bytes: &[u8]) -> Result<Decoded, BackdoorError> {
    let (_, header) = SafeTensors::read_metadata(bytes).map_err(container_error)?;
    let metadata = header
        .metadata()
        .as_ref()
        .ok_or_else(|| BackdoorError::checkpoint("checkpoint header has no metadata"))?;
    if metadata.get(FORMAT_KEY).map(String::as_str) != Some(FORMAT) {
        return Err(BackdoorError::checkpoint(format!(
            "not a {FORMAT} file (format {:?})",
            metadata.get(FORMAT_KEY)
        )));
    }
    let record = metadata
        .get(RECORD_KEY)
        .ok_or_else(|| BackdoorError::checkpoint("checkpoint header has no record"))?;
    let Value::Object(record) = serde_json::from_str(record)? else {
        return Err(BackdoorError::checkpoint("checkpoint record is not a JSON object"));
    };
    let expected_model_tensors = metadata
        .get(MODEL_TENSORS_KEY)
        .map(|n| {
            n.parse::<usize>()
                .map_err(|e| BackdoorError::checkpoint(format!("bad model tensor count `{n}`: {e}")))
        })
        .transpose()?;

    let tensors = SafeTensors::deserialize(bytes).map_err(container_error)?;

    let model_state = match expected_model_tensors {
        Some(expected) => {
            let mut state = StateDict::new();
            for (name, view) in tensors.tensors() {
                if let Some(key) = name.strip_prefix(MODEL_PREFIX) {
                    state.insert(key.to_string(), to_tensor(&view, &name)?);
                }
            }
            if state.len() != expected {
                return Err(BackdoorError::checkpoint(format!(
                    "checkpoint lists {expected} model tensor(s) but holds {}",
                    state.len()
                )));
            }
            Some(state)
        }
        None => None,
    };

    let fields = record
        .into_iter()
        .map(|(k, v)| Ok((k, restore_arrays(v, &tensors)?)))
        .collect::<Result<Map<_, _>, BackdoorError>>()?;

    Ok(Decoded {
        fields,
        model_state,
    })
}
