//! JSON-RPC Server
//!
//! HTTP and WebSocket on one TCP port (jsonrpsee). Subscriptions need the
//! WebSocket transport.

use crate::error::ServerError;
use crate::handler::{EventSubscription, RpcHandler};
use crate::types::{ExecutionRequest, ListRequest, SubmitRequest};
use jsonrpsee::server::{PendingSubscriptionSink, Server, ServerHandle, SubscriptionMessage};
use jsonrpsee::RpcModule;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub const DEFAULT_RPC_HOST: &str = "127.0.0.1";
pub const DEFAULT_RPC_PORT: u16 = 9530;

pub const METHOD_SUBMIT: &str = "commands.submit.v1";
pub const METHOD_GET: &str = "commands.get.v1";
pub const METHOD_CANCEL: &str = "commands.cancel.v1";
pub const METHOD_LIST: &str = "commands.list.v1";
pub const METHOD_SUBSCRIBE: &str = "commands.subscribe.v1";
pub const METHOD_UNSUBSCRIBE: &str = "commands.unsubscribe.v1";
pub const NOTIFICATION_EVENT: &str = "commands.event";
pub const METHOD_HEALTH: &str = "system.health.v1";

/// RPC Server Configuration
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RPC_HOST.to_string(),
            port: DEFAULT_RPC_PORT,
        }
    }
}

/// RPC Server
pub struct RpcServer {
    config: RpcServerConfig,
    handler: Arc<RpcHandler>,
}

impl RpcServer {
    pub fn new(config: RpcServerConfig, handler: RpcHandler) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
        }
    }

    /// Bind and start serving; returns the bound address (port 0 resolves here)
    pub async fn start(self) -> Result<(SocketAddr, ServerHandle), ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        let server = Server::builder()
            .build(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = server.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let module = self.build_module()?;
        let handle = server.start(module);

        info!(addr = %local_addr, "JSON-RPC server started");
        Ok((local_addr, handle))
    }

    fn build_module(&self) -> Result<RpcModule<()>, ServerError> {
        let mut module = RpcModule::new(());

        let handler = self.handler.clone();
        module
            .register_async_method(METHOD_SUBMIT, move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: SubmitRequest = params.parse()?;
                    handler.submit(req).await
                }
            })
            .map_err(register_error)?;

        let handler = self.handler.clone();
        module
            .register_async_method(METHOD_GET, move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: ExecutionRequest = params.parse()?;
                    handler.get(req).await
                }
            })
            .map_err(register_error)?;

        let handler = self.handler.clone();
        module
            .register_async_method(METHOD_CANCEL, move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: ExecutionRequest = params.parse()?;
                    handler.cancel(req).await
                }
            })
            .map_err(register_error)?;

        let handler = self.handler.clone();
        module
            .register_async_method(METHOD_LIST, move |params, _, _| {
                let handler = handler.clone();
                async move {
                    let req: ListRequest = params.parse()?;
                    handler.list(req).await
                }
            })
            .map_err(register_error)?;

        let handler = self.handler.clone();
        module
            .register_method(METHOD_HEALTH, move |_, _, _| Ok::<_, jsonrpsee::types::ErrorObjectOwned>(handler.health()))
            .map_err(register_error)?;

        let handler = self.handler.clone();
        module
            .register_subscription(
                METHOD_SUBSCRIBE,
                NOTIFICATION_EVENT,
                METHOD_UNSUBSCRIBE,
                move |params, pending, _, _| {
                    let handler = handler.clone();
                    async move {
                        let req: ExecutionRequest = match params.parse() {
                            Ok(req) => req,
                            Err(e) => {
                                pending.reject(e).await;
                                return Ok(());
                            }
                        };
                        match handler.subscribe(req).await {
                            Ok(subscription) => forward_events(&handler, pending, subscription).await,
                            Err(e) => {
                                pending.reject(e).await;
                                Ok(())
                            }
                        }
                    }
                },
            )
            .map_err(register_error)?;

        Ok(module)
    }
}

fn register_error(e: impl std::fmt::Display) -> ServerError {
    ServerError::Register(e.to_string())
}

/// Pump one execution's events to the subscriber until its terminal status
async fn forward_events(
    handler: &RpcHandler,
    pending: PendingSubscriptionSink,
    subscription: EventSubscription,
) -> jsonrpsee::core::SubscriptionResult {
    let EventSubscription {
        execution_id,
        finished,
        mut receiver,
    } = subscription;
    let sink = pending.accept().await?;

    if let Some(event) = finished {
        sink.send(SubscriptionMessage::from_json(&event)?).await?;
        return Ok(());
    }

    debug!(execution_id = %execution_id, "Subscriber attached");
    loop {
        tokio::select! {
            _ = sink.closed() => {
                debug!(execution_id = %execution_id, "Subscriber detached");
                return Ok(());
            }
            received = receiver.recv() => match received {
                Ok(event) if event.execution_id() == execution_id => {
                    let terminal = event.is_terminal();
                    sink.send(SubscriptionMessage::from_json(&event)?).await?;
                    if terminal {
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(execution_id = %execution_id, skipped, "Subscriber lagged behind event stream");
                    let notice = handler.lagged_notice(&execution_id, skipped);
                    sink.send(SubscriptionMessage::from_json(&notice)?).await?;
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;
    use cmdexec_core::application::{
        BroadcastEventSink, ExecutionManager, InMemoryExecutionStore, ManagerSettings,
        OutputStreamer, PolicyValidator,
    };
    use cmdexec_core::domain::{PolicyConfig, StreamKind};
    use cmdexec_core::port::id_provider::mocks::SequentialIdProvider;
    use cmdexec_core::port::process_runner::mocks::ScriptedRunner;
    use cmdexec_core::port::time_provider::SystemTimeProvider;
    use jsonrpsee::core::client::{ClientT, SubscriptionClientT};
    use jsonrpsee::core::params::ObjectParams;
    use jsonrpsee::core::ClientError;
    use jsonrpsee::ws_client::WsClientBuilder;
    use serde_json::Value;
    use std::time::Duration;

    async fn start_server(runner: ScriptedRunner) -> (SocketAddr, ServerHandle) {
        let events = Arc::new(BroadcastEventSink::default());
        let time = Arc::new(SystemTimeProvider);
        let manager = ExecutionManager::new(
            PolicyValidator::new(&PolicyConfig::default()).with_base_dir("/tmp"),
            Arc::new(runner),
            Arc::new(InMemoryExecutionStore::new()),
            Arc::new(OutputStreamer::new(events.clone(), time.clone(), 64)),
            Arc::new(SequentialIdProvider::new("exec")),
            time,
            ManagerSettings {
                max_execution_time: Duration::from_secs(5),
                max_output_bytes: 1024,
                max_concurrent: 2,
                work_dir: None,
            },
        );
        let config = RpcServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        };
        RpcServer::new(config, RpcHandler::new(manager, events, Arc::new(SystemTimeProvider)))
            .start()
            .await
            .unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> ObjectParams {
        let mut p = ObjectParams::new();
        for (k, v) in pairs {
            p.insert(k, v).unwrap();
        }
        p
    }

    #[tokio::test]
    async fn test_submit_and_subscribe_over_websocket() {
        let (addr, handle) = start_server(ScriptedRunner::hanging()).await;
        let client = WsClientBuilder::default()
            .build(format!("ws://{}", addr))
            .await
            .unwrap();

        let submitted: Value = client
            .request(METHOD_SUBMIT, params(&[("callerId", "alice"), ("command", "echo hi")]))
            .await
            .unwrap();
        assert_eq!(submitted["status"], "scheduled");
        let id = submitted["executionId"].as_str().unwrap().to_string();

        let mut sub = client
            .subscribe::<Value, _>(
                METHOD_SUBSCRIBE,
                params(&[("callerId", "alice"), ("executionId", id.as_str())]),
                METHOD_UNSUBSCRIBE,
            )
            .await
            .unwrap();

        let cancelled: Value = client
            .request(METHOD_CANCEL, params(&[("callerId", "alice"), ("executionId", id.as_str())]))
            .await
            .unwrap();
        assert_eq!(cancelled["status"], "cancelled");

        let mut last = Value::Null;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), sub.next()).await {
            last = event.unwrap();
            if last["status"] == "cancelled" {
                break;
            }
        }
        assert_eq!(last["executionId"], id.as_str());
        assert_eq!(last["type"], "status");
        assert_eq!(last["status"], "cancelled");

        handle.stop().unwrap();
    }

    #[tokio::test]
    async fn test_errors_carry_engine_codes() {
        let (addr, handle) =
            start_server(ScriptedRunner::exiting(&[(StreamKind::Stdout, "x")], 0)).await;
        let client = WsClientBuilder::default()
            .build(format!("ws://{}", addr))
            .await
            .unwrap();

        let err = client
            .request::<Value, _>(METHOD_SUBMIT, params(&[("callerId", "alice"), ("command", "rm -rf /")]))
            .await
            .unwrap_err();
        match err {
            ClientError::Call(obj) => assert_eq!(obj.code(), code::POLICY_REJECTED),
            other => panic!("unexpected error: {:?}", other),
        }

        let err = client
            .request::<Value, _>(METHOD_GET, params(&[("callerId", "alice"), ("executionId", "missing")]))
            .await
            .unwrap_err();
        match err {
            ClientError::Call(obj) => assert_eq!(obj.code(), code::NOT_FOUND),
            other => panic!("unexpected error: {:?}", other),
        }

        let health: Value = client.request(METHOD_HEALTH, ObjectParams::new()).await.unwrap();
        assert_eq!(health["status"], "ok");

        handle.stop().unwrap();
    }
}
