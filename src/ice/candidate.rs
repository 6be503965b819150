// src/ice/candidate.rs
//! ICE candidate representation

use std::fmt;
use std::net::SocketAddr;
use serde::{Serialize, Deserialize};

use crate::error::{IceError, IceResult};
use super::ComponentId;

/// ICE candidate type (RFC 8445 Section 5.1.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    /// Host candidate (local address)
    Host,
    /// Server reflexive (from STUN)
    ServerReflexive,
    /// Peer reflexive (discovered during connectivity checks)
    PeerReflexive,
    /// Relayed candidate (from TURN)
    Relay,
}

impl CandidateType {
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }

    pub fn preference(&self) -> u32 {
        // RFC 8445 Section 5.1.2.2: Recommended type preferences
        match self {
            Self::Host => 126,
            Self::ServerReflexive => 100,
            Self::PeerReflexive => 110,
            Self::Relay => 0,
        }
    }
}

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

/// Identity used to detect an already known candidate
pub type CandidateKey = (ComponentId, TransportProtocol, SocketAddr, CandidateType, String);

/// One ICE candidate as exchanged with the signaling layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateInfo {
    /// Foundation (RFC 8445 Section 5.1.1.3)
    pub foundation: String,

    /// Component ID (1 for RTP, 2 for RTCP)
    pub component_id: ComponentId,

    /// Transport protocol
    pub protocol: TransportProtocol,

    /// Priority (RFC 8445 Section 5.1.2)
    pub priority: u32,

    /// Transport address
    pub address: SocketAddr,

    /// Candidate type
    pub candidate_type: CandidateType,

    /// Related address (for reflexive/relay candidates)
    pub related_address: Option<SocketAddr>,
}

impl CandidateInfo {
    /// Create a host candidate with a computed priority
    pub fn host(foundation: impl Into<String>, component_id: ComponentId, address: SocketAddr) -> Self {
        Self {
            foundation: foundation.into(),
            component_id,
            protocol: TransportProtocol::Udp,
            priority: calculate_priority(CandidateType::Host, u16::MAX as u32, component_id),
            address,
            candidate_type: CandidateType::Host,
            related_address: None,
        }
    }

    /// Check structural validity against a connection with `components` components
    pub fn validate(&self, components: u32) -> IceResult<()> {
        if self.component_id == 0 || self.component_id > components {
            return Err(IceError::InvalidComponent {
                component_id: self.component_id,
                components,
            });
        }

        if self.foundation.is_empty() {
            return Err(IceError::InvalidCandidate("empty foundation".to_string()));
        }

        if self.address.port() == 0 {
            return Err(IceError::InvalidCandidate(format!("port 0 in {}", self.address)));
        }

        if self.address.ip().is_unspecified() {
            return Err(IceError::InvalidCandidate(format!("unspecified address {}", self.address)));
        }

        Ok(())
    }

    /// Dedupe key; priority and related address are not part of identity
    pub fn key(&self) -> CandidateKey {
        (
            self.component_id,
            self.protocol,
            self.address,
            self.candidate_type,
            self.foundation.clone(),
        )
    }
}

impl fmt::Display for CandidateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} prio {}",
            self.foundation,
            self.component_id,
            self.protocol.to_str(),
            self.address,
            self.priority,
        )?;
        write!(f, " typ {}", self.candidate_type.to_str())?;
        if let Some(related) = &self.related_address {
            write!(f, " raddr {}", related)?;
        }
        Ok(())
    }
}

/// Candidate priority (RFC 8445 Section 5.1.2.1)
pub fn calculate_priority(candidate_type: CandidateType, local_preference: u32, component_id: ComponentId) -> u32 {
    let type_pref = candidate_type.preference().min(126) as u64;
    let local_pref = local_preference.min(u16::MAX as u32) as u64;
    let component = component_id.clamp(1, 256) as u64;

    let priority = (type_pref << 24) + (local_pref << 8) + (256 - component);
    priority.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(component_id: ComponentId, addr: &str) -> CandidateInfo {
        CandidateInfo::host("1", component_id, addr.parse().unwrap())
    }

    #[test]
    fn test_priority_ordering() {
        let host = calculate_priority(CandidateType::Host, 65535, 1);
        let srflx = calculate_priority(CandidateType::ServerReflexive, 65535, 1);
        let relay = calculate_priority(CandidateType::Relay, 65535, 1);
        assert!(host > srflx);
        assert!(srflx > relay);

        // RTP outranks RTCP
        assert!(calculate_priority(CandidateType::Host, 65535, 1) > calculate_priority(CandidateType::Host, 65535, 2));
        assert_eq!(calculate_priority(CandidateType::Host, 65535, 1), 2_130_706_431);
    }

    #[test]
    fn test_validate() {
        assert!(candidate(1, "192.168.1.100:5000").validate(1).is_ok());
        assert!(matches!(
            candidate(2, "192.168.1.100:5000").validate(1),
            Err(IceError::InvalidComponent { component_id: 2, .. })
        ));
        assert!(candidate(0, "192.168.1.100:5000").validate(1).is_err());
        assert!(matches!(
            candidate(1, "192.168.1.100:0").validate(1),
            Err(IceError::InvalidCandidate(_))
        ));
        assert!(candidate(1, "0.0.0.0:5000").validate(1).is_err());

        let mut c = candidate(1, "192.168.1.100:5000");
        c.foundation.clear();
        assert!(c.validate(1).is_err());
    }

    #[test]
    fn test_key_ignores_priority() {
        let a = candidate(1, "10.0.0.1:4000");
        let mut b = a.clone();
        b.priority = 1;
        assert_eq!(a.key(), b.key());

        let c = candidate(2, "10.0.0.1:4000");
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_display() {
        let c = candidate(1, "10.0.0.1:4000");
        let s = c.to_string();
        assert!(s.contains("10.0.0.1:4000"));
        assert!(s.contains("typ host"));
    }
}
