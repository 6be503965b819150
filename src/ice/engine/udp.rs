// src/ice/engine/udp.rs
//! Host-candidate-only engine over plain UDP sockets
//!
//! Binds one socket per component and advertises it as a host candidate.
//! There are no STUN binding checks: the first UDP remote candidate of a
//! component is selected and the component is reported `Ready` as soon as
//! its local socket exists. Good enough for loopback and flat LANs.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{IceError, IceResult, IoErrorContext};
use crate::ice::{CandidateInfo, CandidateType, ComponentId, IceState, TransportProtocol};
use super::{EngineEventSink, IceEngine};

/// The single stream this engine gathers for
pub const HOST_STREAM_ID: u32 = 1;

/// Largest datagram accepted from the network
const MAX_DATAGRAM_SIZE: usize = 65_535;

struct ComponentSocket {
    /// Non-blocking clone of the receive socket, used for synchronous sends
    send: StdUdpSocket,
    local: SocketAddr,
}

struct Inner {
    bind_ip: IpAddr,
    sockets: RwLock<HashMap<ComponentId, ComponentSocket>>,
    remotes: RwLock<HashMap<ComponentId, SocketAddr>>,
    connected: Mutex<HashSet<ComponentId>>,
    events: Mutex<Option<EngineEventSink>>,
}

/// ICE engine gathering host candidates only
#[derive(Clone)]
pub struct UdpHostEngine {
    inner: Arc<Inner>,
}

impl UdpHostEngine {
    /// Create engine binding sockets on `bind_ip`
    pub fn new(bind_ip: IpAddr) -> Self {
        Self {
            inner: Arc::new(Inner {
                bind_ip,
                sockets: RwLock::new(HashMap::new()),
                remotes: RwLock::new(HashMap::new()),
                connected: Mutex::new(HashSet::new()),
                events: Mutex::new(None),
            }),
        }
    }

    /// Engine bound to 127.0.0.1
    pub fn loopback() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Local socket address of a component, once gathered
    pub fn local_addr(&self, component_id: ComponentId) -> Option<SocketAddr> {
        self.inner.sockets.read().get(&component_id).map(|s| s.local)
    }

    /// Remote address selected for a component
    pub fn selected_remote(&self, component_id: ComponentId) -> Option<SocketAddr> {
        self.inner.remotes.read().get(&component_id).copied()
    }
}

impl Inner {
    /// Report a component connected once socket, remote and sink all exist
    fn try_connect(&self, component_id: ComponentId) {
        let Some(events) = self.events.lock().clone() else {
            return;
        };

        if !self.sockets.read().contains_key(&component_id) {
            return;
        }

        let Some(remote) = self.remotes.read().get(&component_id).copied() else {
            return;
        };

        if !self.connected.lock().insert(component_id) {
            return;
        }

        info!("Component {} connected to {}", component_id, remote);
        events.component_state(component_id, IceState::CandidatesReceived);
        events.component_state(component_id, IceState::Ready);
    }

    fn remote(&self, component_id: ComponentId) -> Option<SocketAddr> {
        self.remotes.read().get(&component_id).copied()
    }
}

impl IceEngine for UdpHostEngine {
    fn start_gathering(
        &self,
        config: &ConnectionConfig,
        events: EngineEventSink,
    ) -> BoxFuture<'static, IceResult<()>> {
        let inner = self.inner.clone();
        let config = config.clone();

        Box::pin(async move {
            *inner.events.lock() = Some(events.clone());

            if let Some(stun) = config.stun_address() {
                debug!("Host-only engine does not query STUN server {}", stun);
            }

            let advertised_ip = advertised_ip(inner.bind_ip);
            let foundation = host_foundation(&advertised_ip);

            for component_id in 1..=config.ice_components {
                let socket = bind_in_range(inner.bind_ip, &config)?;
                let bound = socket.local_addr()?;
                let send = socket.try_clone().ice_context("clone component socket")?;
                let recv = UdpSocket::from_std(socket)?;

                let local = SocketAddr::new(advertised_ip, bound.port());
                inner.sockets.write().insert(component_id, ComponentSocket { send, local });

                tokio::spawn(receive_loop(inner.clone(), component_id, recv, events.clone()));

                debug!("Component {} bound on {}", component_id, bound);
                events.local_candidate(CandidateInfo::host(foundation.clone(), component_id, local));
            }

            events.gathering_done(HOST_STREAM_ID);

            for component_id in 1..=config.ice_components {
                inner.try_connect(component_id);
            }

            Ok(())
        })
    }

    fn submit_remote_candidates(&self, candidates: &[CandidateInfo]) -> IceResult<()> {
        let mut best: HashMap<ComponentId, &CandidateInfo> = HashMap::new();

        for candidate in candidates {
            if candidate.protocol != TransportProtocol::Udp {
                debug!("Ignoring non-UDP remote candidate {}", candidate);
                continue;
            }

            best.entry(candidate.component_id)
                .and_modify(|current| {
                    if candidate.priority > current.priority {
                        *current = candidate;
                    }
                })
                .or_insert(candidate);
        }

        let mut selected = Vec::new();
        {
            let mut remotes = self.inner.remotes.write();
            for (component_id, candidate) in best {
                if !remotes.contains_key(&component_id) {
                    remotes.insert(component_id, candidate.address);
                    selected.push(component_id);
                }
            }
        }

        for component_id in selected {
            self.inner.try_connect(component_id);
        }

        Ok(())
    }

    fn write(&self, component_id: ComponentId, data: &[u8]) -> IceResult<usize> {
        let remote = self.inner.remote(component_id).ok_or_else(|| {
            IceError::Engine(format!("No remote selected for component {}", component_id))
        })?;

        let sockets = self.inner.sockets.read();
        let socket = sockets.get(&component_id).ok_or_else(|| {
            IceError::Engine(format!("Component {} has no socket", component_id))
        })?;

        socket.send.send_to(data, remote).ice_context("send_to")
    }

    fn shutdown(&self) {
        self.inner.events.lock().take();
        self.inner.sockets.write().clear();
        debug!("UDP host engine released its sockets");
    }
}

async fn receive_loop(
    inner: Arc<Inner>,
    component_id: ComponentId,
    socket: UdpSocket,
    events: EngineEventSink,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if inner.remote(component_id) == Some(from) {
                    events.data(component_id, Bytes::copy_from_slice(&buf[..len]));
                } else {
                    trace!("Dropping {} bytes from unselected peer {}", len, from);
                }

                if events.is_closed() {
                    break;
                }
            }
            Err(e) => {
                warn!("Receive failed on component {}: {}", component_id, e);
                events.component_state(component_id, IceState::Failed);
                break;
            }
        }
    }
}

/// Bind a non-blocking socket honouring the configured port range
fn bind_in_range(ip: IpAddr, config: &ConnectionConfig) -> IceResult<StdUdpSocket> {
    let socket = if config.port_range_is_unrestricted() {
        StdUdpSocket::bind(SocketAddr::new(ip, 0)).ice_context("bind host socket")?
    } else {
        (config.min_port..=config.max_port)
            .filter(|port| *port != 0)
            .find_map(|port| StdUdpSocket::bind(SocketAddr::new(ip, port)).ok())
            .ok_or_else(|| IceError::Engine(format!(
                "No free port in range {}-{} on {}",
                config.min_port, config.max_port, ip
            )))?
    };

    socket.set_nonblocking(true).ice_context("set socket non-blocking")?;
    Ok(socket)
}

/// Address advertised in candidates; probes the default route for wildcard binds
fn advertised_ip(bind_ip: IpAddr) -> IpAddr {
    if !bind_ip.is_unspecified() {
        return bind_ip;
    }

    let probe = if bind_ip.is_ipv4() { "8.8.8.8:53" } else { "[2001:4860:4860::8888]:53" };
    let discovered = StdUdpSocket::bind(SocketAddr::new(bind_ip, 0))
        .and_then(|socket| {
            socket.connect(probe)?;
            socket.local_addr()
        })
        .map(|addr| addr.ip());

    match discovered {
        Ok(ip) => ip,
        Err(e) => {
            warn!("Could not determine local address, falling back to loopback: {}", e);
            if bind_ip.is_ipv4() {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else {
                IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)
            }
        }
    }
}

fn host_foundation(ip: &IpAddr) -> String {
    let mut hasher = DefaultHasher::new();
    CandidateType::Host.hash(&mut hasher);
    ip.hash(&mut hasher);
    TransportProtocol::Udp.hash(&mut hasher);
    format!("{}", hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaType;
    use crate::ice::engine::EngineEvent;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn gather(
        engine: &UdpHostEngine,
        config: &ConnectionConfig,
    ) -> (mpsc::UnboundedReceiver<EngineEvent>, Vec<CandidateInfo>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.start_gathering(config, EngineEventSink::new(tx)).await.unwrap();

        let mut candidates = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                EngineEvent::LocalCandidate(c) => candidates.push(c),
                EngineEvent::GatheringDone { stream_id } => {
                    assert_eq!(stream_id, HOST_STREAM_ID);
                    break;
                }
                other => panic!("Unexpected event {:?}", other),
            }
        }
        (rx, candidates)
    }

    #[tokio::test]
    async fn test_gathers_one_candidate_per_component() {
        let engine = UdpHostEngine::loopback();
        let config = ConnectionConfig::new(MediaType::Audio, "rtp").with_components(2);

        let (_rx, candidates) = gather(&engine, &config).await;
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].component_id, 1);
        assert_eq!(candidates[1].component_id, 2);
        for c in &candidates {
            assert!(c.address.ip().is_loopback());
            assert_eq!(c.candidate_type, CandidateType::Host);
            assert!(c.validate(2).is_ok());
        }
        assert_eq!(engine.local_addr(1), Some(candidates[0].address));
    }

    #[tokio::test]
    async fn test_exhausted_port_range() {
        let taken = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let engine = UdpHostEngine::loopback();
        let config = ConnectionConfig::new(MediaType::Audio, "rtp").with_port_range(port, port);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = engine.start_gathering(&config, EngineEventSink::new(tx)).await.unwrap_err();
        assert!(matches!(err, IceError::Engine(_)));
    }

    #[tokio::test]
    async fn test_peers_connect_and_exchange() {
        let config = ConnectionConfig::new(MediaType::Data, "data");
        let a = UdpHostEngine::loopback();
        let b = UdpHostEngine::loopback();

        let (mut a_rx, a_candidates) = gather(&a, &config).await;
        let (mut b_rx, b_candidates) = gather(&b, &config).await;

        // Writing before a remote is selected fails
        assert!(a.write(1, b"early").is_err());

        a.submit_remote_candidates(&b_candidates).unwrap();
        b.submit_remote_candidates(&a_candidates).unwrap();

        for rx in [&mut a_rx, &mut b_rx] {
            assert!(matches!(
                rx.recv().await,
                Some(EngineEvent::ComponentState { component_id: 1, state: IceState::CandidatesReceived })
            ));
            assert!(matches!(
                rx.recv().await,
                Some(EngineEvent::ComponentState { component_id: 1, state: IceState::Ready })
            ));
        }

        assert_eq!(a.write(1, b"hello").unwrap(), 5);

        let event = tokio::time::timeout(Duration::from_secs(2), b_rx.recv()).await.unwrap();
        match event {
            Some(EngineEvent::Data { component_id, data }) => {
                assert_eq!(component_id, 1);
                assert_eq!(&data[..], b"hello");
            }
            other => panic!("Expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_highest_priority_remote_selected() {
        let engine = UdpHostEngine::loopback();

        let mut low = CandidateInfo::host("1", 1, "127.0.0.1:40000".parse().unwrap());
        low.priority = 10;
        let mut high = CandidateInfo::host("2", 1, "127.0.0.1:40001".parse().unwrap());
        high.priority = 20;
        let mut tcp = CandidateInfo::host("3", 1, "127.0.0.1:40002".parse().unwrap());
        tcp.protocol = TransportProtocol::Tcp;
        tcp.priority = 30;

        engine.submit_remote_candidates(&[low, high.clone(), tcp]).unwrap();
        assert_eq!(engine.selected_remote(1), Some(high.address));
    }

    #[test]
    fn test_advertised_ip_keeps_specific_bind() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(advertised_ip(ip), ip);
        assert_eq!(host_foundation(&ip), host_foundation(&ip));
    }
}
