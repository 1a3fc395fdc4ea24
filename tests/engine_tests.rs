//! End-to-end engine tests over the in-memory store: a running engine,
//! handlers imitating cloud vendor adaptors, and flows submitted through
//! the producer surface.

use async_trait::async_trait;
use cloudflow::{
    ActionContext, ActionHandler, AddCustomFlowOption, AddTemplateFlowOption, CustomFlowTask,
    Engine, EngineConfig, EngineError, FlowInfo, FlowStatus, FlowTemplate, Params, RetryPolicy,
    TaskStatus, TemplateFlowTask, TemplateTask, UpdateFlowStateOption,
};
use cloudflow_core::{poll_until_done, MemoryFlowStore, ShareData};
use pretty_assertions::assert_eq;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        tick_interval_ms: 10,
        ..EngineConfig::default()
    }
}

async fn wait(engine: &Engine, id: &cloudflow::FlowId) -> cloudflow::Flow {
    engine
        .wait_for_flow(id, Duration::from_millis(10), Duration::from_secs(5))
        .await
        .expect("flow did not settle")
}

#[derive(Deserialize)]
struct CreateEipParams {
    region: String,
}

/// Allocates a fake elastic IP and publishes its id for downstream
/// binding steps.
struct CreateEip;

#[async_trait]
impl ActionHandler for CreateEip {
    fn name(&self) -> &str {
        "create_eip"
    }

    async fn execute(&self, ctx: &mut ActionContext) -> Result<Option<Params>, EngineError> {
        let params: CreateEipParams = ctx.decode_params()?;
        let eip_id = format!("eip-{}", params.region);
        ctx.set_share("eip_id", json!(eip_id));
        Ok(Some(Params::new(json!({ "eip_id": eip_id }))))
    }
}

/// Binds the previously allocated address; fails when the create step
/// never published one.
struct BindEip;

#[async_trait]
impl ActionHandler for BindEip {
    fn name(&self) -> &str {
        "bind_eip"
    }

    async fn execute(&self, ctx: &mut ActionContext) -> Result<Option<Params>, EngineError> {
        let eip_id = ctx
            .share("eip_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| EngineError::Handler("no eip_id in share data".to_string()))?;
        Ok(Some(Params::new(json!({ "bound": eip_id }))))
    }
}

/// Fails until the configured attempt, then succeeds.
struct Flaky {
    succeed_on: u32,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl ActionHandler for Flaky {
    fn name(&self) -> &str {
        "flaky_attach"
    }

    async fn execute(&self, _ctx: &mut ActionContext) -> Result<Option<Params>, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < self.succeed_on {
            return Err(EngineError::Handler(format!("attach refused (call {})", call)));
        }
        Ok(Some(Params::new(json!({ "attached": true }))))
    }
}

struct AlwaysFail;

#[async_trait]
impl ActionHandler for AlwaysFail {
    fn name(&self) -> &str {
        "always_fail"
    }

    async fn execute(&self, _ctx: &mut ActionContext) -> Result<Option<Params>, EngineError> {
        Err(EngineError::Handler("quota exceeded".to_string()))
    }
}

/// Signals when it starts executing, then takes a while.
struct Slow {
    started: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl ActionHandler for Slow {
    fn name(&self) -> &str {
        "slow_detach"
    }

    async fn execute(&self, _ctx: &mut ActionContext) -> Result<Option<Params>, EngineError> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(None)
    }
}

/// Polls a fake vendor that reports READY on the third probe.
struct PollingProvision {
    probes: Arc<AtomicU32>,
}

#[async_trait]
impl ActionHandler for PollingProvision {
    fn name(&self) -> &str {
        "provision_disk"
    }

    async fn execute(&self, ctx: &mut ActionContext) -> Result<Option<Params>, EngineError> {
        let probes = self.probes.clone();
        let states = poll_until_done(
            &["disk-1".to_string()],
            move |_keys| {
                let probes = probes.clone();
                async move {
                    let n = probes.fetch_add(1, Ordering::SeqCst);
                    let state = if n < 2 { "PENDING" } else { "READY" };
                    Ok(vec![state.to_string()])
                }
            },
            |states| states.iter().all(|s| s == "READY"),
            Duration::from_millis(5),
            Duration::from_secs(1),
        )
        .await?;

        ctx.set_share("disk_state", json!(states[0]));
        Ok(Some(Params::new(json!({ "state": states[0] }))))
    }
}

fn custom_task(action_id: &str, action_name: &str, depend_on: Vec<&str>) -> CustomFlowTask {
    CustomFlowTask {
        action_id: action_id.into(),
        action_name: action_name.to_string(),
        depend_on: depend_on.into_iter().map(Into::into).collect(),
        params: Params::null(),
        retry: None,
    }
}

#[tokio::test]
async fn test_template_flow_end_to_end() {
    init_tracing();
    let engine = Engine::builder()
        .with_store(Arc::new(MemoryFlowStore::new()))
        .with_config(fast_config())
        .register_action(Arc::new(CreateEip), None)
        .register_action(Arc::new(BindEip), None)
        .register_template(FlowTemplate {
            name: "eip_bind".to_string(),
            tasks: vec![
                TemplateTask::new("create", "create_eip", vec![]),
                TemplateTask::new("bind", "bind_eip", vec!["create".into()]),
            ],
        })
        .unwrap()
        .build()
        .unwrap();
    engine.start();

    let id = engine
        .producer()
        .add_template_flow(AddTemplateFlowOption {
            name: "eip_bind".to_string(),
            tasks: vec![TemplateFlowTask {
                action_id: "create".into(),
                params: Params::new(json!({"region": "ap-1"})),
            }],
            share_data: ShareData::new(),
            memo: None,
            is_init_state: false,
        })
        .await
        .unwrap();

    let flow = wait(&engine, &id).await;
    assert_eq!(flow.status, FlowStatus::Success);
    assert_eq!(flow.share_data.get("eip_id").unwrap(), &json!("eip-ap-1"));

    let tasks = engine.producer().get_tasks(&id).await.unwrap();
    let bind = tasks.iter().find(|t| t.action_id.0 == "bind").unwrap();
    assert_eq!(bind.status, TaskStatus::Success);
    assert_eq!(bind.attempt, 1);
    assert_eq!(
        bind.result.as_ref().unwrap().as_value(),
        &json!({"bound": "eip-ap-1"})
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_share_data_flows_downstream() {
    init_tracing();
    let engine = Engine::builder()
        .with_store(Arc::new(MemoryFlowStore::new()))
        .with_config(fast_config())
        .register_action(Arc::new(CreateEip), None)
        .register_action(Arc::new(BindEip), None)
        .build()
        .unwrap();
    engine.start();

    let id = engine
        .producer()
        .add_custom_flow(AddCustomFlowOption {
            name: "manual_bind".to_string(),
            tasks: vec![
                CustomFlowTask {
                    params: Params::new(json!({"region": "eu-2"})),
                    ..custom_task("a", "create_eip", vec![])
                },
                custom_task("b", "bind_eip", vec!["a"]),
            ],
            share_data: ShareData::new(),
            memo: None,
            is_init_state: false,
        })
        .await
        .unwrap();

    let flow = wait(&engine, &id).await;
    assert_eq!(flow.status, FlowStatus::Success);

    let tasks = engine.producer().get_tasks(&id).await.unwrap();
    let b = tasks.iter().find(|t| t.action_id.0 == "b").unwrap();
    assert_eq!(
        b.result.as_ref().unwrap().as_value(),
        &json!({"bound": "eip-eu-2"})
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_retry_recovers_after_transient_failure() {
    init_tracing();
    let calls = Arc::new(AtomicU32::new(0));
    let engine = Engine::builder()
        .with_store(Arc::new(MemoryFlowStore::new()))
        .with_config(fast_config())
        .register_action(
            Arc::new(Flaky {
                succeed_on: 2,
                calls: calls.clone(),
            }),
            None,
        )
        .build()
        .unwrap();
    engine.start();

    let id = engine
        .producer()
        .add_custom_flow(AddCustomFlowOption {
            name: "attach".to_string(),
            tasks: vec![CustomFlowTask {
                retry: Some(RetryPolicy::fixed(3, Duration::from_millis(10))),
                ..custom_task("a", "flaky_attach", vec![])
            }],
            share_data: ShareData::new(),
            memo: None,
            is_init_state: false,
        })
        .await
        .unwrap();

    let flow = wait(&engine, &id).await;
    assert_eq!(flow.status, FlowStatus::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let tasks = engine.producer().get_tasks(&id).await.unwrap();
    assert_eq!(tasks[0].attempt, 2);
    assert_eq!(tasks[0].status, TaskStatus::Success);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_failure_rolls_up_to_flow() {
    init_tracing();
    let engine = Engine::builder()
        .with_store(Arc::new(MemoryFlowStore::new()))
        .with_config(fast_config())
        .register_action(Arc::new(AlwaysFail), None)
        .register_action(Arc::new(BindEip), None)
        .build()
        .unwrap();
    engine.start();

    let id = engine
        .producer()
        .add_custom_flow(AddCustomFlowOption {
            name: "doomed".to_string(),
            tasks: vec![
                custom_task("a", "always_fail", vec![]),
                custom_task("b", "bind_eip", vec!["a"]),
            ],
            share_data: ShareData::new(),
            memo: None,
            is_init_state: false,
        })
        .await
        .unwrap();

    let flow = wait(&engine, &id).await;
    assert_eq!(flow.status, FlowStatus::Failed);
    assert!(flow.error.is_some());

    let tasks = engine.producer().get_tasks(&id).await.unwrap();
    let a = tasks.iter().find(|t| t.action_id.0 == "a").unwrap();
    let b = tasks.iter().find(|t| t.action_id.0 == "b").unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert!(a.error.as_deref().unwrap().contains("quota exceeded"));
    // Never claimed, swept once its predecessor failed
    assert_eq!(b.status, TaskStatus::Failed);
    assert_eq!(b.attempt, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_drains_in_flight_work() {
    init_tracing();
    let started = Arc::new(tokio::sync::Notify::new());
    let engine = Engine::builder()
        .with_store(Arc::new(MemoryFlowStore::new()))
        .with_config(fast_config())
        .register_action(
            Arc::new(Slow {
                started: started.clone(),
            }),
            None,
        )
        .register_action(Arc::new(BindEip), None)
        .build()
        .unwrap();
    engine.start();

    let id = engine
        .producer()
        .add_custom_flow(AddCustomFlowOption {
            name: "teardown".to_string(),
            tasks: vec![
                custom_task("detach", "slow_detach", vec![]),
                custom_task("rebind", "bind_eip", vec!["detach"]),
            ],
            share_data: ShareData::new(),
            memo: None,
            is_init_state: false,
        })
        .await
        .unwrap();

    // Cancel while the first task is executing
    started.notified().await;
    engine.producer().cancel_flow(&id).await.unwrap();

    let flow = wait(&engine, &id).await;
    assert_eq!(flow.status, FlowStatus::Cancelled);

    let tasks = engine.producer().get_tasks(&id).await.unwrap();
    let detach = tasks.iter().find(|t| t.action_id.0 == "detach").unwrap();
    let rebind = tasks.iter().find(|t| t.action_id.0 == "rebind").unwrap();
    // The in-flight attempt ran to completion; nothing new was claimed
    assert_eq!(detach.status, TaskStatus::Success);
    assert_eq!(rebind.attempt, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_handler_polling_an_eventually_consistent_vendor() {
    init_tracing();
    let probes = Arc::new(AtomicU32::new(0));
    let engine = Engine::builder()
        .with_store(Arc::new(MemoryFlowStore::new()))
        .with_config(fast_config())
        .register_action(
            Arc::new(PollingProvision {
                probes: probes.clone(),
            }),
            None,
        )
        .build()
        .unwrap();
    engine.start();

    let id = engine
        .producer()
        .add_custom_flow(AddCustomFlowOption {
            name: "provision".to_string(),
            tasks: vec![custom_task("disk", "provision_disk", vec![])],
            share_data: ShareData::new(),
            memo: None,
            is_init_state: false,
        })
        .await
        .unwrap();

    let flow = wait(&engine, &id).await;
    assert_eq!(flow.status, FlowStatus::Success);
    assert_eq!(flow.share_data.get("disk_state").unwrap(), &json!("READY"));
    assert_eq!(probes.load(Ordering::SeqCst), 3);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_init_state_flow_waits_for_release() {
    init_tracing();
    let engine = Engine::builder()
        .with_store(Arc::new(MemoryFlowStore::new()))
        .with_config(fast_config())
        .register_action(Arc::new(CreateEip), None)
        .build()
        .unwrap();
    engine.start();

    let id = engine
        .producer()
        .add_custom_flow(AddCustomFlowOption {
            name: "gated".to_string(),
            tasks: vec![CustomFlowTask {
                params: Params::new(json!({"region": "us-1"})),
                ..custom_task("a", "create_eip", vec![])
            }],
            share_data: ShareData::new(),
            memo: None,
            is_init_state: true,
        })
        .await
        .unwrap();

    // Several scheduling passes go by without touching the gated flow
    tokio::time::sleep(Duration::from_millis(100)).await;
    let flow = engine.producer().get_flow(&id).await.unwrap().unwrap();
    assert_eq!(flow.status, FlowStatus::Pending);

    engine
        .producer()
        .update_flow_state(UpdateFlowStateOption {
            flow_infos: vec![FlowInfo {
                id: id.clone(),
                status: FlowStatus::Scheduled,
            }],
        })
        .await
        .unwrap();

    let flow = wait(&engine, &id).await;
    assert_eq!(flow.status, FlowStatus::Success);

    engine.shutdown().await;
}
