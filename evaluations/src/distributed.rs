//! Collective operations across evaluation ranks.
//!
//! Every rank must call the same collectives in the same order; a rank that skips one
//! deadlocks the others. The evaluator guarantees this by padding request batches and by
//! agreeing on metric keys before transferring values.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Barrier, Mutex};

use crate::error::{Error, ErrorDetails};

/// A dense row-major matrix of `f64`, the unit of numeric collective transfer.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    width: usize,
    data: Vec<f64>,
}

impl Tensor {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
            data: Vec::new(),
        }
    }

    pub fn from_scalars(values: &[f64]) -> Self {
        Self {
            width: 1,
            data: values.to_vec(),
        }
    }

    pub fn from_rows(width: usize, rows: &[Vec<f64>]) -> Result<Self, Error> {
        let mut tensor = Self::new(width);
        for row in rows {
            tensor.push_row(row)?;
        }
        Ok(tensor)
    }

    pub fn push_row(&mut self, row: &[f64]) -> Result<(), Error> {
        if row.len() != self.width {
            return Err(Error::new(ErrorDetails::TensorShape {
                expected: self.width,
                actual: row.len(),
            }));
        }
        self.data.extend_from_slice(row);
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn rows(&self) -> usize {
        self.data.len() / self.width
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        let start = index.checked_mul(self.width)?;
        self.data.get(start..start + self.width)
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        self.data.chunks_exact(self.width)
    }

    /// Appends rows filled with `pad_value` until the tensor has `rows` rows.
    #[must_use]
    pub fn padded_to(mut self, rows: usize, pad_value: f64) -> Self {
        let missing = rows.saturating_sub(self.rows());
        self.data
            .extend(std::iter::repeat_n(pad_value, missing * self.width));
        self
    }
}

/// The collective communication surface the evaluator needs from a distributed runtime.
#[async_trait]
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Every rank receives every rank's object, in rank order.
    async fn all_gather_object(&self, value: Value) -> Result<Vec<Value>, Error>;

    /// Rank `dst` receives every rank's object in rank order; other ranks receive `None`.
    async fn gather_object(&self, value: Value, dst: usize) -> Result<Option<Vec<Value>>, Error>;

    /// Concatenates every rank's rows in rank order, on every rank.
    /// All ranks must contribute tensors of the same shape.
    async fn gather(&self, tensor: Tensor) -> Result<Tensor, Error>;

    async fn barrier(&self) -> Result<(), Error>;

    /// Pads `tensor` with `pad_value` rows up to the largest row count of any rank.
    async fn pad_across_processes(&self, tensor: Tensor, pad_value: f64) -> Result<Tensor, Error> {
        let counts = self
            .all_gather_object(Value::from(tensor.rows() as u64))
            .await?;
        let max_rows = counts
            .iter()
            .filter_map(Value::as_u64)
            .max()
            .unwrap_or_default() as usize;
        Ok(tensor.padded_to(max_rows, pad_value))
    }
}

/// All-gathers any serializable value.
pub async fn all_gather<T: Serialize + DeserializeOwned>(
    group: &dyn ProcessGroup,
    value: &T,
) -> Result<Vec<T>, Error> {
    let gathered = group.all_gather_object(serde_json::to_value(value)?).await?;
    gathered
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(Error::from))
        .collect()
}

/// Gathers any serializable value to rank `dst`.
pub async fn gather_to<T: Serialize + DeserializeOwned>(
    group: &dyn ProcessGroup,
    value: &T,
    dst: usize,
) -> Result<Option<Vec<T>>, Error> {
    let Some(gathered) = group
        .gather_object(serde_json::to_value(value)?, dst)
        .await?
    else {
        return Ok(None);
    };
    gathered
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(Error::from))
        .collect::<Result<Vec<T>, Error>>()
        .map(Some)
}

fn collective_error(operation: &str, rank: usize, message: impl Into<String>) -> Error {
    Error::new(ErrorDetails::Collective {
        operation: operation.to_string(),
        rank,
        message: message.into(),
    })
}

fn concat_tensors(tensors: Vec<Tensor>, rank: usize) -> Result<Tensor, Error> {
    let Some(first) = tensors.first() else {
        return Err(collective_error("gather", rank, "no tensors gathered"));
    };
    let (width, rows) = (first.width(), first.rows());
    let mut out = Tensor::new(width);
    for tensor in tensors {
        if tensor.width() != width || tensor.rows() != rows {
            return Err(collective_error(
                "gather",
                rank,
                format!(
                    "tensor shapes differ across ranks ({}x{} vs {rows}x{width}); pad across processes first",
                    tensor.rows(),
                    tensor.width()
                ),
            ));
        }
        out.data.extend(tensor.data);
    }
    Ok(out)
}

/// The trivial group used when a single process evaluates everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

#[async_trait]
impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn all_gather_object(&self, value: Value) -> Result<Vec<Value>, Error> {
        Ok(vec![value])
    }

    async fn gather_object(&self, value: Value, dst: usize) -> Result<Option<Vec<Value>>, Error> {
        if dst != 0 {
            return Err(collective_error(
                "gather_object",
                0,
                format!("destination rank {dst} is outside a world of size 1"),
            ));
        }
        Ok(Some(vec![value]))
    }

    async fn gather(&self, tensor: Tensor) -> Result<Tensor, Error> {
        Ok(tensor)
    }

    async fn barrier(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
enum Payload {
    Object(Value),
    Tensor(Tensor),
}

#[derive(Debug)]
struct SharedState {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Payload>>>,
}

/// Several ranks running as tasks of one tokio runtime.
///
/// Each collective writes this rank's slot, waits for every rank, reads all slots and waits
/// again so that no rank overwrites its slot before the others have read it.
#[derive(Clone, Debug)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedState>,
}

impl LocalProcessGroup {
    /// Creates one handle per rank; hand each to its own task.
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let world_size = world_size.max(1);
        let shared = Arc::new(SharedState {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });
        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }

    async fn exchange(&self, operation: &str, payload: Payload) -> Result<Vec<Payload>, Error> {
        self.shared.slots.lock().await[self.rank] = Some(payload);
        self.shared.barrier.wait().await;
        let gathered = self
            .shared
            .slots
            .lock()
            .await
            .iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.clone().ok_or_else(|| {
                    collective_error(operation, self.rank, format!("rank {rank} sent nothing"))
                })
            })
            .collect::<Result<Vec<_>, Error>>();
        self.shared.barrier.wait().await;
        gathered
    }

    async fn exchange_objects(&self, operation: &str, value: Value) -> Result<Vec<Value>, Error> {
        self.exchange(operation, Payload::Object(value))
            .await?
            .into_iter()
            .map(|payload| match payload {
                Payload::Object(value) => Ok(value),
                Payload::Tensor(_) => Err(collective_error(
                    operation,
                    self.rank,
                    "received a tensor where an object was expected; ranks are out of step",
                )),
            })
            .collect()
    }
}

#[async_trait]
impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_gather_object(&self, value: Value) -> Result<Vec<Value>, Error> {
        self.exchange_objects("all_gather_object", value).await
    }

    async fn gather_object(&self, value: Value, dst: usize) -> Result<Option<Vec<Value>>, Error> {
        if dst >= self.world_size {
            return Err(collective_error(
                "gather_object",
                self.rank,
                format!(
                    "destination rank {dst} is outside a world of size {}",
                    self.world_size
                ),
            ));
        }
        let gathered = self.exchange_objects("gather_object", value).await?;
        Ok((self.rank == dst).then_some(gathered))
    }

    async fn gather(&self, tensor: Tensor) -> Result<Tensor, Error> {
        let tensors = self
            .exchange("gather", Payload::Tensor(tensor))
            .await?
            .into_iter()
            .map(|payload| match payload {
                Payload::Tensor(tensor) => Ok(tensor),
                Payload::Object(_) => Err(collective_error(
                    "gather",
                    self.rank,
                    "received an object where a tensor was expected; ranks are out of step",
                )),
            })
            .collect::<Result<Vec<_>, Error>>()?;
        concat_tensors(tensors, self.rank)
    }

    async fn barrier(&self) -> Result<(), Error> {
        self.shared.barrier.wait().await;
        Ok(())
    }
}
