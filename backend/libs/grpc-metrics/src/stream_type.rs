//! Call shape classification

use serde::{Deserialize, Serialize};

/// Whether each side of a call sends a single message or a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
    /// Shape not reported by the runtime
    #[default]
    #[serde(other)]
    Unspecified,
}

const CLIENT_STREAM_BIT: u8 = 0b01;
const SERVER_STREAM_BIT: u8 = 0b10;

impl StreamType {
    /// Map the runtime's raw shape value (bit 0: client streams, bit 1:
    /// server streams). Values outside the four shapes are `Unspecified`.
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Unary,
            CLIENT_STREAM_BIT => Self::ClientStream,
            SERVER_STREAM_BIT => Self::ServerStream,
            b if b == CLIENT_STREAM_BIT | SERVER_STREAM_BIT => Self::BidiStream,
            _ => Self::Unspecified,
        }
    }

    /// Label value used for the `type` dimension
    pub fn label(self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::ClientStream => "client_stream",
            Self::ServerStream => "server_stream",
            Self::BidiStream => "bidi_stream",
            Self::Unspecified => "",
        }
    }

    pub fn is_streaming(self) -> bool {
        matches!(self, Self::ClientStream | Self::ServerStream | Self::BidiStream)
    }
}
