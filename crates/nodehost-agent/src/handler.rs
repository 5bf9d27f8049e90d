//! Request handler for the container activator agent.
//!
//! Routes each container action to the [`ContainerActivatorService`].

use crate::service::ContainerActivatorService;
use async_trait::async_trait;
use nodehost_core::ipc::handle_action;
use nodehost_core::ipc::messages::{
    actions, ActivateContainerReply, ActivateContainerRequest, ContainerUpdateRoutesRequest,
    DeactivateContainerRequest, DeleteContainerImagesRequest, DownloadContainerImagesRequest,
    InvokeContainerApiRequest, RequestEnvelope,
};
use nodehost_core::ipc::protocol::{error_codes, Request, Response};
use nodehost_core::{HostingError, RequestHandler, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Serves container actions sent by the node host.
pub struct AgentHandler {
    service: Arc<dyn ContainerActivatorService>,
}

impl AgentHandler {
    pub fn new(service: Arc<dyn ContainerActivatorService>) -> Self {
        Self { service }
    }
}

/// Run `operation` within the timeout the request carried.
async fn within<T>(timeout: Duration, operation: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| HostingError::Timeout(timeout))?
}

#[async_trait]
impl RequestHandler for AgentHandler {
    async fn handle(&self, request: Request) -> Response {
        let Request { id, method, params, .. } = request;
        debug!(id, method = %method, "handling container action");
        let service = &self.service;

        match method.as_str() {
            actions::ACTIVATE_CONTAINER => {
                handle_action(id, &method, params, |envelope: RequestEnvelope<ActivateContainerRequest>| async move {
                    let timeout = envelope.timeout();
                    let container_id = within(timeout, service.activate_container(envelope.body, timeout)).await?;
                    Ok(ActivateContainerReply { container_id })
                })
                .await
            }
            actions::DEACTIVATE_CONTAINER => {
                handle_action(id, &method, params, |envelope: RequestEnvelope<DeactivateContainerRequest>| async move {
                    let timeout = envelope.timeout();
                    within(timeout, service.deactivate_container(envelope.body, timeout)).await
                })
                .await
            }
            actions::DOWNLOAD_CONTAINER_IMAGES => {
                handle_action(id, &method, params, |envelope: RequestEnvelope<DownloadContainerImagesRequest>| async move {
                    let timeout = envelope.timeout();
                    within(timeout, service.download_images(envelope.body.images, timeout)).await
                })
                .await
            }
            actions::DELETE_CONTAINER_IMAGES => {
                handle_action(id, &method, params, |envelope: RequestEnvelope<DeleteContainerImagesRequest>| async move {
                    let timeout = envelope.timeout();
                    within(timeout, service.delete_images(envelope.body.images, timeout)).await
                })
                .await
            }
            actions::CONTAINER_UPDATE_ROUTES => {
                handle_action(id, &method, params, |envelope: RequestEnvelope<ContainerUpdateRoutesRequest>| async move {
                    let timeout = envelope.timeout();
                    within(timeout, service.update_routes(envelope.body, timeout)).await
                })
                .await
            }
            actions::INVOKE_CONTAINER_API => {
                handle_action(id, &method, params, |envelope: RequestEnvelope<InvokeContainerApiRequest>| async move {
                    let timeout = envelope.timeout();
                    within(timeout, service.invoke_container_api(envelope.body, timeout)).await
                })
                .await
            }
            _ => {
                warn!(id, method = %method, "unknown container action");
                Response::error(id, error_codes::METHOD_NOT_FOUND, format!("method not found: {method}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodehost_core::ipc::messages::{
        to_ticks, Actor, ContainerDescription, ContainerEventDescription, ContainerImageDescription,
        InvokeContainerApiReply, Reply,
    };
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeRuntime {
        pulled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContainerActivatorService for FakeRuntime {
        async fn activate_container(&self, request: ActivateContainerRequest, _: Duration) -> Result<String> {
            Ok(format!("id-{}", request.container.container_name))
        }

        async fn deactivate_container(&self, request: DeactivateContainerRequest, _: Duration) -> Result<()> {
            Err(HostingError::NotFound(request.container_name))
        }

        async fn download_images(&self, images: Vec<ContainerImageDescription>, _: Duration) -> Result<()> {
            self.pulled
                .lock()
                .unwrap()
                .extend(images.into_iter().map(|i| i.image_name));
            Ok(())
        }

        async fn delete_images(&self, _: Vec<String>, _: Duration) -> Result<()> {
            Ok(())
        }

        async fn update_routes(&self, _: ContainerUpdateRoutesRequest, timeout: Duration) -> Result<()> {
            tokio::time::sleep(timeout * 2).await;
            Ok(())
        }

        async fn invoke_container_api(
            &self,
            request: InvokeContainerApiRequest,
            _: Duration,
        ) -> Result<InvokeContainerApiReply> {
            Ok(InvokeContainerApiReply {
                status_code: 200,
                content_type: "application/json".into(),
                response_body: request.uri_path,
            })
        }

        async fn start_event_monitoring(&self, _: i64, _: mpsc::UnboundedSender<ContainerEventDescription>) -> Result<()> {
            Ok(())
        }
    }

    fn request(method: &str, body: serde_json::Value) -> Request {
        Request::new(
            7,
            method,
            json!({
                "actor": Actor::ContainerActivatorService,
                "timeout_ticks": to_ticks(Duration::from_secs(1)),
                "body": body,
            }),
        )
    }

    fn reply<T: serde::de::DeserializeOwned + Default>(response: Response) -> Reply<T> {
        serde_json::from_value(response.result.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_activate_returns_container_id() {
        let handler = AgentHandler::new(Arc::new(FakeRuntime::default()));
        let body = ActivateContainerRequest {
            app_host_id: "host".into(),
            node_id: "N1".into(),
            container: ContainerDescription {
                container_name: "sf-calc".into(),
                image_name: "calc/front:1.0".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let response = handler
            .handle(request(actions::ACTIVATE_CONTAINER, serde_json::to_value(body).unwrap()))
            .await;
        let reply: Reply<ActivateContainerReply> = reply(response);
        assert_eq!(reply.into_result().unwrap().container_id, "id-sf-calc");
    }

    #[tokio::test]
    async fn test_service_error_travels_in_reply() {
        let handler = AgentHandler::new(Arc::new(FakeRuntime::default()));
        let response = handler
            .handle(request(
                actions::DEACTIVATE_CONTAINER,
                json!({"container_name": "sf-gone"}),
            ))
            .await;
        assert!(response.error.is_none());
        let err = reply::<()>(response).into_result().unwrap_err();
        assert!(matches!(err, HostingError::NotFound(ref name) if name == "sf-gone"));
    }

    #[tokio::test]
    async fn test_download_passes_every_image() {
        let runtime = Arc::new(FakeRuntime::default());
        let handler = AgentHandler::new(runtime.clone());
        let response = handler
            .handle(request(
                actions::DOWNLOAD_CONTAINER_IMAGES,
                json!({"images": [{"image_name": "a:1"}, {"image_name": "b:2", "repository_account": "svc"}]}),
            ))
            .await;
        reply::<()>(response).into_result().unwrap();
        assert_eq!(*runtime.pulled.lock().unwrap(), vec!["a:1", "b:2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_is_enforced() {
        let handler = AgentHandler::new(Arc::new(FakeRuntime::default()));
        let response = handler
            .handle(request(
                actions::CONTAINER_UPDATE_ROUTES,
                json!({"container_id": "c1", "container_name": "sf-calc", "gateway_ip_addresses": ["10.0.0.1"]}),
            ))
            .await;
        let err = reply::<()>(response).into_result().unwrap_err();
        assert_eq!(err.code(), nodehost_core::ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_requests() {
        let handler = AgentHandler::new(Arc::new(FakeRuntime::default()));

        let response = handler
            .handle(Request::new(1, actions::INVOKE_CONTAINER_API, json!({"body": 3})))
            .await;
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_PARAMS);

        let response = handler
            .handle(request("ExecuteArbitraryCommand", json!({})))
            .await;
        assert_eq!(response.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }
}
