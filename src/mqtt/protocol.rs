use anyhow::{anyhow, Result};

/// Protocol-level identifier correlating a PUBLISH with its PUBACK/PUBCOMP.
pub type PacketId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(anyhow!("unsupported QoS {other}")),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }

    /// QoS 1 and 2 deliveries expect an acknowledgement from the client.
    pub fn expects_ack(self) -> bool {
        !matches!(self, Qos::AtMostOnce)
    }
}

impl TryFrom<u8> for Qos {
    type Error = anyhow::Error;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        Qos::from_bits(bits)
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        qos.bits()
    }
}

impl std::fmt::Display for Qos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.bits())
    }
}
