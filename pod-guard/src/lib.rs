pub mod agent;
pub mod attach;
pub mod bpf;
pub mod config;
pub mod flow;
pub mod http;
pub mod identity;
pub mod kubernetes;
pub mod metrics;
pub mod sync;

use aya::EbpfError;
use aya::programs::ProgramError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Ebpf(String),

    #[error("{0}")]
    EbpfProgram(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("map error: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("map {name} not found")]
    MapNotFound { name: String },

    #[error("program {name} not found")]
    ProgramNotFound { name: String },

    #[error("no veth interfaces found or all attachments failed")]
    NoAttachments,

    #[error("malformed flow record: {len} bytes, expected at least {expected}")]
    MalformedRecord { len: usize, expected: usize },

    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),

    #[error("task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<EbpfError> for Error {
    fn from(err: EbpfError) -> Self {
        Self::Ebpf(err.to_string())
    }
}

impl From<ProgramError> for Error {
    fn from(err: ProgramError) -> Self {
        Self::EbpfProgram(err.to_string())
    }
}
