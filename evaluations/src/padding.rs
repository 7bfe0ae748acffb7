//! The padding ledger: how many extra requests of each type this rank must issue so that
//! every rank runs the same number of model calls.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::distributed::{ProcessGroup, all_gather};
use crate::error::Error;
use crate::instance::{Argument, Instance, Request, RequestType};

/// A serializable stand-in for a request, used to pad ranks that have no local instance of
/// a request type. Opaque arguments do not survive the transfer.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PaddingTemplate {
    pub task_name: String,
    pub doc_id: usize,
    pub idx: usize,
    pub arguments: Vec<Value>,
    pub repeats: usize,
}

impl PaddingTemplate {
    pub fn from_instance(instance: &Instance) -> Self {
        Self {
            task_name: instance.request.task_name.clone(),
            doc_id: instance.doc_id(),
            idx: instance.idx(),
            arguments: instance.request.json_arguments(),
            repeats: instance.repeats,
        }
    }

    pub fn to_request(&self) -> Request {
        Request {
            task_name: self.task_name.clone(),
            doc_id: self.doc_id,
            idx: self.idx,
            arguments: self.arguments.iter().cloned().map(Argument::Json).collect(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct RankReport {
    count: usize,
    template: Option<PaddingTemplate>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PaddingEntry {
    pub count: usize,
    pub template: Option<PaddingTemplate>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PaddingLedger {
    entries: BTreeMap<RequestType, PaddingEntry>,
}

impl PaddingLedger {
    pub fn padding(&self, request_type: RequestType) -> usize {
        self.entries
            .get(&request_type)
            .map_or(0, |entry| entry.count)
    }

    pub fn template(&self, request_type: RequestType) -> Option<&PaddingTemplate> {
        self.entries
            .get(&request_type)
            .and_then(|entry| entry.template.as_ref())
    }

    /// Request types this rank must pad.
    pub fn padded_request_types(&self) -> impl Iterator<Item = RequestType> + '_ {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.count > 0)
            .map(|(request_type, _)| *request_type)
    }

    pub fn add(
        &mut self,
        request_type: RequestType,
        count: usize,
        template: Option<PaddingTemplate>,
    ) {
        let entry = self.entries.entry(request_type).or_default();
        entry.count += count;
        if entry.template.is_none() {
            entry.template = template;
        }
    }

    /// Collectively compares this task's instance count with every other rank's and records
    /// the difference to the busiest rank. Every rank must call this for every task, in the
    /// same order.
    pub async fn record_task(
        &mut self,
        group: &dyn ProcessGroup,
        task_name: &str,
        request_type: RequestType,
        instances: &[Instance],
    ) -> Result<(), Error> {
        let report = RankReport {
            count: instances.len(),
            template: instances.last().map(PaddingTemplate::from_instance),
        };
        let reports = all_gather(group, &report).await?;
        let Some(busiest) = reports.iter().max_by_key(|report| report.count) else {
            return Ok(());
        };
        let numpad = busiest.count - report.count;
        debug!(
            task_name,
            request_type = %request_type,
            local_count = report.count,
            max_count = busiest.count,
            numpad,
            "Computed padding for task"
        );
        if numpad > 0 {
            self.add(request_type, numpad, busiest.template.clone());
        }
        Ok(())
    }
}
