use std::path::Path;

use aya::Ebpf;
use aya::maps::{Map, MapData, RingBuf};
use aya::programs::tc::{self, SchedClassifierLinkId};
use aya::programs::{ProgramError, SchedClassifier, TcAttachType};
use nix::sys::resource::{RLIM_INFINITY, Resource, setrlimit};
use pod_guard_common::{MAP_BLOCKED_PODS, MAP_EVENTS, PROGRAM_MONITOR_EGRESS};
use tracing::{debug, info, warn};

use crate::attach::Attacher;
use crate::bpf::BlockedPodsMap;
use crate::{Error, Result};

/// Loaded enforcement engine object.
pub struct Engine {
    ebpf: Ebpf,
}

impl Engine {
    pub fn load(path: &Path) -> Result<Self> {
        raise_memlock_limit();

        info!("loading enforcement engine from {}", path.display());
        let mut ebpf = Ebpf::load_file(path)?;
        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            warn!(%e, "failed to init ebpf logger");
        }

        let program = classifier(&mut ebpf)?;
        if let Err(e) = program.load()
            && !matches!(e, ProgramError::AlreadyLoaded)
        {
            return Err(e.into());
        }
        Ok(Self { ebpf })
    }

    fn take_map(&mut self, name: &str) -> Result<Map> {
        self.ebpf.take_map(name).ok_or_else(|| Error::MapNotFound {
            name: name.into(),
        })
    }

    pub fn take_blocked_pods(&mut self) -> Result<BlockedPodsMap> {
        Ok(self.take_map(MAP_BLOCKED_PODS)?.try_into()?)
    }

    pub fn take_events(&mut self) -> Result<RingBuf<MapData>> {
        Ok(self.take_map(MAP_EVENTS)?.try_into()?)
    }
}

impl Attacher for Engine {
    type Link = SchedClassifierLinkId;

    fn attach(&mut self, iface: &str) -> Result<Self::Link> {
        // adding clsact fails harmlessly if the qdisc is already present
        if let Err(e) = tc::qdisc_add_clsact(iface) {
            debug!(%e, "clsact qdisc not added to {iface}");
        }
        let program = classifier(&mut self.ebpf)?;
        Ok(program.attach(iface, TcAttachType::Ingress)?)
    }

    fn detach(&mut self, link: Self::Link) -> Result<()> {
        let program = classifier(&mut self.ebpf)?;
        Ok(program.detach(link)?)
    }
}

fn classifier(ebpf: &mut Ebpf) -> Result<&mut SchedClassifier> {
    let program: &mut SchedClassifier = ebpf
        .program_mut(PROGRAM_MONITOR_EGRESS)
        .ok_or_else(|| Error::ProgramNotFound {
            name: PROGRAM_MONITOR_EGRESS.into(),
        })?
        .try_into()?;
    Ok(program)
}

// Kernels before 5.11 account BPF maps against RLIMIT_MEMLOCK.
fn raise_memlock_limit() {
    if let Err(e) = setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY) {
        warn!(%e, "failed to remove memlock limit");
    }
}
