//! Sends every task's instances to the model, one batch per request type.

use std::collections::BTreeSet;

use tracing::{info, instrument};

use crate::error::{Error, ErrorDetails};
use crate::instance::{Request, RequestType};
use crate::model::{Model, invoke};
use crate::padding::PaddingLedger;
use crate::task_output::TaskOutput;

/// Position of an instance inside `task_outputs`: `(task index, instance index)`.
type InstanceHandle = (usize, usize);

/// Expands instances by their repeat count, pads the batch as the ledger demands, calls the
/// model and appends each response to the instance it belongs to.
///
/// Request types are handled in `RequestType` order on every rank. A rank that has nothing
/// local for a padded type still issues its padding requests.
#[instrument(skip_all, fields(rank = model.rank(), world_size = model.world_size()))]
pub async fn dispatch_requests(
    model: &dyn Model,
    task_outputs: &mut [TaskOutput],
    ledger: &PaddingLedger,
) -> Result<(), Error> {
    let world_size = model.world_size();
    let mut request_types: BTreeSet<RequestType> = task_outputs
        .iter()
        .flat_map(|output| output.instances.iter().map(|instance| instance.request_type))
        .collect();
    if world_size > 1 {
        request_types.extend(ledger.padded_request_types());
    }

    for request_type in request_types {
        let mut handles: Vec<Option<InstanceHandle>> = Vec::new();
        let mut requests: Vec<Request> = Vec::new();
        let mut last: Option<InstanceHandle> = None;
        for (task_index, output) in task_outputs.iter().enumerate() {
            for (instance_index, instance) in output.instances.iter().enumerate() {
                if instance.request_type != request_type {
                    continue;
                }
                for _ in 0..instance.repeats {
                    handles.push(Some((task_index, instance_index)));
                    requests.push(instance.request.clone());
                }
                last = Some((task_index, instance_index));
            }
        }
        let local_requests = requests.len();

        let padding = if world_size > 1 {
            ledger.padding(request_type)
        } else {
            0
        };
        if padding > 0 {
            let (template, repeats) = match last {
                Some((task_index, instance_index)) => {
                    let instance = &task_outputs[task_index].instances[instance_index];
                    (instance.request.clone(), instance.repeats)
                }
                None => match ledger.template(request_type) {
                    Some(template) => (template.to_request(), template.repeats),
                    None => {
                        return Err(Error::new(ErrorDetails::Collective {
                            operation: "dispatch".to_string(),
                            rank: model.rank(),
                            message: format!(
                                "no padding template for `{request_type}` requests"
                            ),
                        }));
                    }
                },
            };
            for _ in 0..padding * repeats {
                handles.push(None);
                requests.push(template.clone());
            }
        }

        info!(
            request_type = %request_type,
            requests = local_requests,
            padding_requests = requests.len() - local_requests,
            "Running requests"
        );
        let responses = invoke(model, request_type, &requests)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Backend {
                    request_type,
                    message: e.to_string(),
                })
            })?;
        if responses.len() != requests.len() {
            return Err(Error::new(ErrorDetails::ResponseCountMismatch {
                request_type,
                expected: requests.len(),
                actual: responses.len(),
            }));
        }
        for (handle, response) in handles.into_iter().zip(responses) {
            // Padding responses only exist to keep ranks in step
            if let Some((task_index, instance_index)) = handle {
                task_outputs[task_index].instances[instance_index]
                    .responses
                    .push(response);
            }
        }

        if world_size > 1 {
            model.process_group().barrier().await?;
        }
    }
    Ok(())
}
