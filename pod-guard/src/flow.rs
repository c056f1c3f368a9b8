use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use aya::maps::{MapData, RingBuf};
use pod_guard_common::FlowEvent;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bpf::convert::wire_addr;
use crate::identity::IdentityTable;
use crate::metrics::{ActionLabel, FlowMetrics, ObservationLabels};
use crate::{Error, Result};

const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
    Other(u8),
}

impl From<u8> for Protocol {
    fn from(value: u8) -> Self {
        match value {
            1 => Protocol::Icmp,
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            n => Protocol::Other(n),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Other(n) => write!(f, "proto-{n}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    Allowed,
    Blocked,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allowed => write!(f, "ALLOWED"),
            Action::Blocked => write!(f, "BLOCKED"),
        }
    }
}

impl From<Action> for ActionLabel {
    fn from(value: Action) -> Self {
        match value {
            Action::Allowed => ActionLabel::Allowed,
            Action::Blocked => ActionLabel::Blocked,
        }
    }
}

/// What the engine reported about its own table lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LookupDiagnostic {
    pub found_in_table: bool,
    pub flag_value: u8,
    pub lookup_addr: u32,
}

impl fmt::Display for LookupDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[map_lookup={}, flag={}, lookup_ip=0x{:08x}]",
            self.found_in_table, self.flag_value, self.lookup_addr
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlowRecord {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub protocol: Protocol,
    pub blocked: bool,
    pub diagnostic: LookupDiagnostic,
}

impl FlowRecord {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let event = FlowEvent::from_le_bytes(buf).ok_or(Error::MalformedRecord {
            len: buf.len(),
            expected: FlowEvent::LEN,
        })?;
        Ok(event.into())
    }

    pub fn action(&self) -> Action {
        if self.blocked {
            Action::Blocked
        } else {
            Action::Allowed
        }
    }
}

impl From<FlowEvent> for FlowRecord {
    fn from(event: FlowEvent) -> Self {
        Self {
            src: wire_addr(event.saddr),
            dst: wire_addr(event.daddr),
            sport: event.sport,
            dport: event.dport,
            protocol: event.protocol.into(),
            blocked: event.blocked != 0,
            diagnostic: LookupDiagnostic {
                found_in_table: event.found_in_map != 0,
                flag_value: event.block_flag_value,
                lookup_addr: event.saddr_lookup,
            },
        }
    }
}

/// A flow attributed to a monitored pod.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Observation {
    pub pod: String,
    pub record: FlowRecord,
}

impl Observation {
    pub fn action(&self) -> Action {
        self.record.action()
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.record;
        write!(
            f,
            "[{}] {}: {} -> {}  [{}]",
            self.pod,
            r.action(),
            r.src,
            r.dst,
            r.protocol
        )?;
        if r.sport != 0 && r.dport != 0 {
            write!(f, " {} -> {}", r.sport, r.dport)?;
        }
        write!(f, " {}", r.diagnostic)
    }
}

/// Stream of raw records. `Ok(None)` means the stream is closed.
pub trait FlowSource {
    fn next_record(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;
}

/// Reads the engine's ring buffer whenever its fd becomes readable.
pub struct RingBufSource {
    fd: AsyncFd<RingBuf<MapData>>,
    cancel: CancellationToken,
    pending: VecDeque<Vec<u8>>,
}

impl RingBufSource {
    pub fn new(ring: RingBuf<MapData>, cancel: CancellationToken) -> Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(ring)?,
            cancel,
            pending: VecDeque::new(),
        })
    }
}

impl FlowSource for RingBufSource {
    async fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }

            let mut guard = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                guard = self.fd.readable_mut() => guard?,
            };
            let ring = guard.get_inner_mut();
            while let Some(item) = ring.next() {
                self.pending.push_back(item.to_vec());
            }
            guard.clear_ready();
        }
    }
}

pub struct FlowPipeline<S: FlowSource> {
    source: S,
    identities: IdentityTable,
    metrics: FlowMetrics,
}

impl<S: FlowSource> FlowPipeline<S> {
    pub fn new(source: S, identities: IdentityTable, metrics: FlowMetrics) -> Self {
        Self {
            source,
            identities,
            metrics,
        }
    }

    /// Decodes one record and attributes it to a pod. Records from unknown
    /// sources yield nothing.
    pub fn process(&self, buf: &[u8]) -> Option<Observation> {
        let record = match FlowRecord::decode(buf) {
            Ok(record) => record,
            Err(e) => {
                warn!(%e, "failed to parse flow record");
                self.metrics.decode_errors.inc();
                return None;
            }
        };

        let Some(pod) = self.identities.lookup(&record.src) else {
            self.metrics.unmonitored.inc();
            return None;
        };
        self.metrics
            .observations
            .get_or_create(&ObservationLabels {
                action: record.action().into(),
            })
            .inc();
        Some(Observation {
            pod: pod.name,
            record,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        info!("monitoring network traffic from pods");
        loop {
            match self.source.next_record().await {
                Ok(Some(buf)) => {
                    if let Some(obs) = self.process(&buf) {
                        info!(pod = %obs.pod, action = %obs.action(), "{obs}");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(%e, "failed to read from event stream");
                    self.metrics.read_errors.inc();
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                }
            }
        }
        info!("flow pipeline stopped");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identity::{IdentitySnapshot, PodIdentity};

    fn raw(addr: [u8; 4]) -> u32 {
        u32::from_le_bytes(addr)
    }

    fn event(src: [u8; 4], dst: [u8; 4], protocol: u8, ports: (u16, u16), blocked: bool) -> Vec<u8> {
        FlowEvent {
            saddr: raw(src),
            daddr: raw(dst),
            sport: ports.0,
            dport: ports.1,
            protocol,
            blocked: blocked as u8,
            found_in_map: 1,
            block_flag_value: blocked as u8,
            saddr_lookup: raw(src),
        }
        .to_le_bytes()
        .to_vec()
    }

    fn identities() -> IdentityTable {
        let table = IdentityTable::new();
        table.publish(IdentitySnapshot::from_identities([PodIdentity {
            address: Ipv4Addr::new(10, 0, 0, 5),
            name: "web-1".into(),
        }]));
        table
    }

    struct MemorySource {
        records: VecDeque<Result<Vec<u8>>>,
    }

    impl FlowSource for MemorySource {
        async fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
            self.records.pop_front().transpose()
        }
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(Protocol::from(1).to_string(), "ICMP");
        assert_eq!(Protocol::from(6).to_string(), "TCP");
        assert_eq!(Protocol::from(17).to_string(), "UDP");
        assert_eq!(Protocol::from(132).to_string(), "proto-132");
    }

    #[test]
    fn test_blocked_flow_is_attributed() {
        let pipeline = FlowPipeline::new(
            MemorySource {
                records: VecDeque::new(),
            },
            identities(),
            FlowMetrics::default(),
        );

        let obs = pipeline
            .process(&event([10, 0, 0, 5], [8, 8, 8, 8], 6, (43512, 443), true))
            .unwrap();
        assert_eq!(obs.pod, "web-1");
        assert_eq!(obs.action(), Action::Blocked);
        assert_eq!(
            obs.to_string(),
            "[web-1] BLOCKED: 10.0.0.5 -> 8.8.8.8  [TCP] 43512 -> 443 \
             [map_lookup=true, flag=1, lookup_ip=0x0500000a]"
        );
    }

    #[test]
    fn test_ports_omitted_when_zero() {
        let pipeline = FlowPipeline::new(
            MemorySource {
                records: VecDeque::new(),
            },
            identities(),
            FlowMetrics::default(),
        );

        let obs = pipeline
            .process(&event([10, 0, 0, 5], [10, 0, 1, 1], 1, (0, 0), false))
            .unwrap();
        assert_eq!(obs.action(), Action::Allowed);
        assert_eq!(
            obs.to_string(),
            "[web-1] ALLOWED: 10.0.0.5 -> 10.0.1.1  [ICMP] \
             [map_lookup=true, flag=0, lookup_ip=0x0500000a]"
        );

        let obs = pipeline
            .process(&event([10, 0, 0, 5], [10, 0, 1, 1], 17, (5353, 0), false))
            .unwrap();
        assert!(obs.to_string().contains("[UDP] [map_lookup"));
    }

    #[test]
    fn test_unmonitored_and_malformed_records_are_dropped() {
        let metrics = FlowMetrics::default();
        let pipeline = FlowPipeline::new(
            MemorySource {
                records: VecDeque::new(),
            },
            identities(),
            metrics.clone(),
        );

        // 5.0.0.10 has the same octets reversed
        assert!(pipeline
            .process(&event([5, 0, 0, 10], [8, 8, 8, 8], 6, (1, 2), true))
            .is_none());
        assert!(pipeline.process(&[0u8; FlowEvent::LEN - 1]).is_none());
        assert_eq!(metrics.unmonitored.get(), 1);
        assert_eq!(metrics.decode_errors.get(), 1);

        let mut long = event([10, 0, 0, 5], [8, 8, 8, 8], 6, (1, 2), false);
        long.extend_from_slice(&[0xff; 4]);
        assert!(pipeline.process(&long).is_some());
    }

    #[test]
    fn test_decode_reports_length() {
        assert!(matches!(
            FlowRecord::decode(&[0u8; 7]),
            Err(Error::MalformedRecord { len: 7, expected: 20 })
        ));
    }

    #[tokio::test]
    async fn test_run_continues_until_closed() -> Result<()> {
        let metrics = FlowMetrics::default();
        let source = MemorySource {
            records: VecDeque::from([
                Ok(event([10, 0, 0, 5], [8, 8, 8, 8], 6, (40000, 443), true)),
                Ok(vec![1, 2, 3]),
                Err(Error::Other("transient".into())),
                Ok(event([10, 0, 0, 9], [8, 8, 8, 8], 17, (40000, 53), false)),
                Ok(event([10, 0, 0, 5], [1, 1, 1, 1], 1, (0, 0), false)),
            ]),
        };

        FlowPipeline::new(source, identities(), metrics.clone())
            .run()
            .await?;

        let observed = |action| {
            metrics
                .observations
                .get_or_create(&ObservationLabels { action })
                .get()
        };
        assert_eq!(observed(ActionLabel::Blocked), 1);
        assert_eq!(observed(ActionLabel::Allowed), 1);
        assert_eq!(metrics.decode_errors.get(), 1);
        assert_eq!(metrics.read_errors.get(), 1);
        assert_eq!(metrics.unmonitored.get(), 1);
        Ok(())
    }
}
