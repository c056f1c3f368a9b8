use std::collections::BTreeMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::Result;
use crate::config::PodSelector;
use crate::identity::PodIdentity;

const POD_PHASE_RUNNING: &str = "Running";

/// Lists the pods scheduled on a node.
pub trait PodSource {
    fn list_pods(
        &self,
        node: &str,
        selector: &PodSelector,
    ) -> impl Future<Output = Result<Vec<Pod>>> + Send;
}

#[derive(Clone)]
pub struct KubePodSource {
    client: kube::Client,
}

impl KubePodSource {
    pub async fn try_default() -> Result<Self> {
        let client = kube::Client::try_default().await?;
        Ok(Self { client })
    }
}

impl PodSource for KubePodSource {
    async fn list_pods(&self, node: &str, selector: &PodSelector) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let mut params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }
        Ok(pods.list(&params).await?.items)
    }
}

/// Running pods carrying an IPv4 address and matching `selector`.
pub fn running_identities(pods: &[Pod], selector: &PodSelector) -> Vec<PodIdentity> {
    pods.iter()
        .filter(|pod| pod_phase(pod) == Some(POD_PHASE_RUNNING))
        .filter(|pod| selector_matches(selector.labels(), pod.labels()))
        .filter_map(|pod| {
            let address = pod_ipv4(pod)?;
            Some(PodIdentity {
                address,
                name: pod.name_any(),
            })
        })
        .collect()
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

fn pod_ips(pod: &Pod) -> Vec<IpAddr> {
    let Some(status) = pod.status.as_ref() else {
        return Vec::new();
    };

    let primary = status.pod_ip.iter().map(String::as_str);
    let secondary = status
        .pod_ips
        .iter()
        .flatten()
        .map(|ip| ip.ip.as_str());
    primary
        .chain(secondary)
        .filter(|ip| !ip.is_empty())
        .filter_map(|ip| IpAddr::from_str(ip).ok())
        .collect()
}

fn pod_ipv4(pod: &Pod) -> Option<Ipv4Addr> {
    let ips = pod_ips(pod);
    let v4 = ips.iter().find_map(|ip| match ip {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    });
    if v4.is_none() && !ips.is_empty() {
        debug!("skipping pod {} without an ipv4 address", pod.name_any());
    }
    v4
}

pub fn selector_matches(
    selectors: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    for selector in selectors {
        let value = labels.get(selector.0);
        if value != Some(selector.1) {
            return false;
        }
    }
    true
}

pub fn resolve_node_name(configured: Option<&str>) -> Result<String> {
    match configured {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Ok(nix::unistd::gethostname()?.to_string_lossy().into_owned()),
    }
}
