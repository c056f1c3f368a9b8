use aya::maps::{MapData, RingBuf};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::attach::{AttachmentManager, list_links};
use crate::bpf::loader::Engine;
use crate::bpf::{BlockedPodsMap, EnforcementTable};
use crate::config::AgentArgs;
use crate::flow::{FlowPipeline, RingBufSource};
use crate::identity::IdentityTable;
use crate::kubernetes::{KubePodSource, resolve_node_name};
use crate::metrics::{AttachMetrics, FlowMetrics, SyncMetrics};
use crate::sync::{SyncSettings, Synchronizer};
use crate::{Error, Result};

/// Loads the engine, attaches it and runs the synchronizer and flow pipeline
/// until `cancel` fires. Every attachment made here is released before
/// returning, whatever the outcome.
pub async fn start(
    args: AgentArgs,
    ready: CancellationToken,
    identities: IdentityTable,
    cancel: CancellationToken,
) -> Result<()> {
    info!("starting pod network monitor");
    let node = resolve_node_name(args.node_name.as_deref())?;

    let mut engine = Engine::load(&args.ebpf_object)?;
    let blocked_pods = engine.take_blocked_pods()?;
    let events = engine.take_events()?;

    let links = list_links(&args.sysfs_net)?;
    let mut attachments = AttachmentManager::new(engine, AttachMetrics::new());
    attachments.attach_all(&links)?;

    let result = run(args, node, blocked_pods, events, identities, ready, cancel).await;
    if let Err(e) = &result {
        error!(%e, "agent stopped with error");
    }
    attachments.release_all();
    result
}

async fn run(
    args: AgentArgs,
    node: String,
    blocked_pods: BlockedPodsMap,
    events: RingBuf<MapData>,
    identities: IdentityTable,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let pods = KubePodSource::try_default().await?;

    info!("monitoring pods with labels: {}", args.pod_selector);
    info!("blocking mode: {}", args.block_external);
    let synchronizer = Synchronizer::new(
        pods,
        EnforcementTable::new(blocked_pods),
        identities.clone(),
        SyncSettings {
            node,
            selector: args.pod_selector.clone(),
            block: args.block_external,
            prune_stale: args.prune_stale,
        },
        SyncMetrics::new(),
    );
    let source = RingBufSource::new(events, cancel.child_token())?;
    let pipeline = FlowPipeline::new(source, identities, FlowMetrics::new());

    let sync_handle = tokio::spawn(synchronizer.run(args.sync_interval(), cancel.child_token()));
    let flow_handle = tokio::spawn(pipeline.run());
    ready.cancel();

    cancel.cancelled().await;
    info!("shutting down");
    let (sync, flow) = tokio::join!(sync_handle, flow_handle);
    joined("synchronizer", sync)?;
    joined("flow pipeline", flow)?;
    Ok(())
}

fn joined(task: &str, out: Result<Result<()>, JoinError>) -> Result<()> {
    out.map_err(|e| Error::Task(format!("{task}: {e}")))?
}
