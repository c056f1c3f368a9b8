use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use nix::net::if_::if_nameindex;
use tracing::{info, warn};

use crate::metrics::AttachMetrics;
use crate::{Error, Result};

/// Something that can attach the engine to a named interface.
pub trait Attacher {
    type Link;
    fn attach(&mut self, iface: &str) -> Result<Self::Link>;
    fn detach(&mut self, link: Self::Link) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkKind {
    Loopback,
    Physical,
    Bridge,
    Stacked,
    Veth,
    Other,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Link {
    pub name: String,
    pub index: u32,
    pub kind: LinkKind,
}

/// Attributes read from `/sys/class/net/<iface>`.
#[derive(Clone, Copy, Debug, Default)]
struct LinkAttrs {
    loopback: bool,
    has_device: bool,
    is_bridge: bool,
    // vlan, macvlan and ipvlan links expose their parent as `lower_<name>`
    has_lower: bool,
    ifindex: u32,
    iflink: u32,
}

impl LinkAttrs {
    fn kind(&self) -> LinkKind {
        if self.loopback {
            LinkKind::Loopback
        } else if self.has_device {
            LinkKind::Physical
        } else if self.is_bridge {
            LinkKind::Bridge
        } else if self.has_lower {
            LinkKind::Stacked
        } else if self.iflink != 0 && self.iflink != self.ifindex {
            // virtual link pointing at a peer
            LinkKind::Veth
        } else {
            LinkKind::Other
        }
    }
}

const IFF_LOOPBACK: u32 = 0x8;

/// Lists host interfaces and classifies them using sysfs rooted at `sysfs_net`.
pub fn list_links(sysfs_net: &Path) -> Result<Vec<Link>> {
    let mut links = Vec::new();
    for iface in if_nameindex()?.iter() {
        let name = iface.name().to_string_lossy().into_owned();
        let index = iface.index();
        let attrs = match read_link_attrs(sysfs_net, &name, index) {
            Ok(attrs) => attrs,
            Err(e) => {
                warn!(%e, "failed to read sysfs attributes of {name}");
                continue;
            }
        };
        links.push(Link {
            name,
            index,
            kind: attrs.kind(),
        });
    }
    Ok(links)
}

fn read_link_attrs(sysfs_net: &Path, name: &str, ifindex: u32) -> Result<LinkAttrs> {
    let dir = sysfs_net.join(name);
    let flags = read_number(&dir.join("flags"))?.unwrap_or_default();
    let iflink = read_number(&dir.join("iflink"))?.unwrap_or(ifindex);
    Ok(LinkAttrs {
        loopback: flags & IFF_LOOPBACK != 0,
        has_device: dir.join("device").exists(),
        is_bridge: dir.join("bridge").is_dir(),
        has_lower: has_lower_link(&dir)?,
        ifindex,
        iflink,
    })
}

fn has_lower_link(dir: &Path) -> Result<bool> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        if entry?.file_name().to_string_lossy().starts_with("lower_") {
            return Ok(true);
        }
    }
    Ok(false)
}

// sysfs prints flags in hex and indices in decimal
fn read_number(path: &Path) -> Result<Option<u32>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed
        .map(Some)
        .map_err(|e| Error::Other(format!("invalid value {raw:?} in {}: {e}", path.display())))
}

pub struct AttachmentHandle<L> {
    pub iface: String,
    link: L,
}

/// Owns every attachment made at startup and releases them on shutdown.
pub struct AttachmentManager<A: Attacher> {
    attacher: A,
    handles: Vec<AttachmentHandle<A::Link>>,
    metrics: AttachMetrics,
}

impl<A: Attacher> AttachmentManager<A> {
    pub fn new(attacher: A, metrics: AttachMetrics) -> Self {
        Self {
            attacher,
            handles: Vec::new(),
            metrics,
        }
    }

    /// Attaches to every veth in `links`. Individual failures are skipped;
    /// ending up with no attachment at all is an error.
    pub fn attach_all(&mut self, links: &[Link]) -> Result<usize> {
        for link in links.iter().filter(|l| l.kind == LinkKind::Veth) {
            match self.attacher.attach(&link.name) {
                Ok(id) => {
                    info!("attached to veth {} (ifindex {})", link.name, link.index);
                    self.handles.push(AttachmentHandle {
                        iface: link.name.clone(),
                        link: id,
                    });
                }
                Err(e) => {
                    warn!(%e, "could not attach to {}", link.name);
                }
            }
        }
        self.metrics.attached.set(self.handles.len() as i64);

        if self.handles.is_empty() {
            return Err(Error::NoAttachments);
        }
        info!("successfully attached to {} veth interface(s)", self.handles.len());
        Ok(self.handles.len())
    }

    pub fn handles(&self) -> &[AttachmentHandle<A::Link>] {
        &self.handles
    }

    /// Detaches every handle. Failures are logged and not retried.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for handle in self.handles.drain(..) {
            match self.attacher.detach(handle.link) {
                Ok(()) => released += 1,
                Err(e) => warn!(%e, "failed to detach from {}", handle.iface),
            }
        }
        self.metrics.attached.set(0);
        info!("released {released} attachment(s)");
        released
    }
}
