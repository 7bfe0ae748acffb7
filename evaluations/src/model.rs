use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;

use crate::distributed::ProcessGroup;
use crate::instance::{Request, RequestType};

/// A model backend. Each capability answers a batch of requests with exactly one response
/// per request, in order.
#[async_trait]
pub trait Model: Send + Sync {
    /// Name recorded in the run configuration.
    fn name(&self) -> &str {
        "model"
    }

    fn process_group(&self) -> &dyn ProcessGroup;

    fn rank(&self) -> usize {
        self.process_group().rank()
    }

    fn world_size(&self) -> usize {
        self.process_group().world_size()
    }

    fn device(&self) -> &str {
        "cpu"
    }

    /// Whether this backend implements the capability for `request_type`.
    fn supports(&self, request_type: RequestType) -> bool;

    async fn loglikelihood(&self, requests: &[Request]) -> Result<Vec<Value>> {
        let _ = requests;
        bail!("loglikelihood is not implemented by this model")
    }

    async fn generate_until(&self, requests: &[Request]) -> Result<Vec<Value>> {
        let _ = requests;
        bail!("generate_until is not implemented by this model")
    }

    async fn generate_until_multi_round(&self, requests: &[Request]) -> Result<Vec<Value>> {
        let _ = requests;
        bail!("generate_until_multi_round is not implemented by this model")
    }
}

/// Routes a batch to the capability matching `request_type`.
pub async fn invoke(
    model: &dyn Model,
    request_type: RequestType,
    requests: &[Request],
) -> Result<Vec<Value>> {
    match request_type {
        RequestType::Loglikelihood => model.loglikelihood(requests).await,
        RequestType::GenerateUntil => model.generate_until(requests).await,
        RequestType::GenerateUntilMultiRound => model.generate_until_multi_round(requests).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::SingleProcess;
    use serde_json::json;

    struct Echo {
        group: SingleProcess,
    }

    #[async_trait]
    impl Model for Echo {
        fn process_group(&self) -> &dyn ProcessGroup {
            &self.group
        }

        fn supports(&self, request_type: RequestType) -> bool {
            request_type == RequestType::GenerateUntil
        }

        async fn generate_until(&self, requests: &[Request]) -> Result<Vec<Value>> {
            Ok(requests
                .iter()
                .map(|request| json!(format!("echo {}", request.doc_id)))
                .collect())
        }
    }

    #[tokio::test]
    async fn test_invoke_routes_by_request_type() {
        let model = Echo {
            group: SingleProcess,
        };
        let requests = vec![Request {
            task_name: "t".to_string(),
            doc_id: 4,
            idx: 0,
            arguments: vec![],
        }];
        let responses = invoke(&model, RequestType::GenerateUntil, &requests)
            .await
            .unwrap();
        assert_eq!(responses, vec![json!("echo 4")]);
        assert!(
            invoke(&model, RequestType::Loglikelihood, &requests)
                .await
                .is_err()
        );
        assert_eq!(model.rank(), 0);
        assert_eq!(model.world_size(), 1);
        assert_eq!(model.device(), "cpu");
    }
}
