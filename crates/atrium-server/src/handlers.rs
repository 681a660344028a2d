//! Method routing shared by the socket, `POST /rpc` and the REST endpoints.

use std::sync::Arc;

use atrium_core::launcher::TaskCallback;
use atrium_core::{TenantKey, ThreadId};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::orchestrator::{Orchestrator, ScheduledTask};
use crate::rpc::RpcResponse;

/// Addresses one thread of one tenant session.
#[derive(Clone, Debug, Deserialize)]
pub struct ThreadParams {
    #[serde(alias = "userId")]
    pub user_id: String,
    #[serde(alias = "tenantId")]
    pub tenant_id: String,
    #[serde(alias = "threadId")]
    pub thread_id: String,
}

impl ThreadParams {
    pub fn tenant(&self) -> TenantKey {
        TenantKey::new(self.user_id.as_str(), self.tenant_id.as_str())
    }

    pub fn thread(&self) -> ThreadId {
        ThreadId::from_raw(self.thread_id.as_str())
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("user_id", &self.user_id),
            ("tenant_id", &self.tenant_id),
            ("thread_id", &self.thread_id),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{name} must not be empty"));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SendMessageParams {
    #[serde(flatten)]
    pub thread: ThreadParams,
    pub text: String,
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|e| e.to_string())
}

fn thread_params(params: Value) -> Result<ThreadParams, String> {
    let p: ThreadParams = parse(params)?;
    p.validate()?;
    Ok(p)
}

/// Route one method call to the orchestrator.
pub async fn dispatch(orchestrator: &Arc<Orchestrator>, method: &str, params: Value, id: Option<Value>) -> RpcResponse {
    match method {
        "message.send" => {
            let p: SendMessageParams = match parse(params) {
                Ok(p) => p,
                Err(e) => return RpcResponse::invalid_params(id, e),
            };
            if let Err(e) = p.thread.validate() {
                return RpcResponse::invalid_params(id, e);
            }
            let resp = orchestrator
                .send_message(p.thread.tenant(), p.thread.thread(), p.text)
                .await;
            RpcResponse::new(id, resp)
        }
        "thread.enter" | "thread.leave" | "thread.reset" | "stream.stop" => {
            let p = match thread_params(params) {
                Ok(p) => p,
                Err(e) => return RpcResponse::invalid_params(id, e),
            };
            let (tenant, thread) = (p.tenant(), p.thread());
            match method {
                "thread.enter" => RpcResponse::new(id, orchestrator.enter_thread(tenant, thread).await),
                "thread.leave" => RpcResponse::new(id, orchestrator.leave_thread(tenant, thread).await),
                "thread.reset" => RpcResponse::new(id, orchestrator.reset_thread(tenant, thread).await),
                _ => RpcResponse::new(id, orchestrator.stop_streaming(tenant, thread).await),
            }
        }
        "task.callback" => match parse::<TaskCallback>(params) {
            Ok(cb) => RpcResponse::new(id, orchestrator.resolve_external_task_callback(cb).await),
            Err(e) => RpcResponse::invalid_params(id, e),
        },
        "schedule.tick" => match parse::<ScheduledTask>(params) {
            Ok(task) => RpcResponse::new(id, orchestrator.run_scheduled_task_tick(task).await),
            Err(e) => RpcResponse::invalid_params(id, e),
        },
        "health" => RpcResponse::new(id, orchestrator.health()),
        _ => RpcResponse::method_not_found(id, method),
    }
}
