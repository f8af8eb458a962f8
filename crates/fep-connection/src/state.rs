//! Connection lifecycle states
//!
//! Only SIGNED_ON is fully operational. The partial states accept limited
//! traffic depending on the configured failure strategy; a single-channel
//! link collapses SendOnly/ReceiveOnly/Both into one connected state.

use serde::{Deserialize, Serialize};

use fep_types::{ChannelMode, FailureStrategy};

/// State of one logical FISC link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No sockets established
    Disconnected,
    /// Socket establishment in progress
    Connecting,
    /// Send socket up, receive socket down
    SendOnlyConnected,
    /// Receive socket up, send socket down
    ReceiveOnlyConnected,
    /// Both sockets up, sign-on not yet exchanged
    BothConnected,
    /// Sign-on acknowledged; fully operational
    SignedOn,
    /// Lost connectivity, retrying under the retry policy
    Reconnecting,
    /// Graceful shutdown in progress
    Closing,
    /// Closed by request
    Closed,
    /// Retry policy exhausted
    Failed,
}

impl ConnectionState {
    /// Fully operational
    pub fn is_signed_on(&self) -> bool {
        matches!(self, Self::SignedOn)
    }

    /// Whether new outbound requests may be written in this state under
    /// the given strategy
    pub fn accepts_sends(&self, mode: ChannelMode, strategy: FailureStrategy) -> bool {
        match self {
            Self::SignedOn | Self::BothConnected => true,
            Self::SendOnlyConnected => {
                mode == ChannelMode::Dual
                    && matches!(
                        strategy,
                        FailureStrategy::FailWhenBothDown | FailureStrategy::FallbackToSingle
                    )
            }
            Self::ReceiveOnlyConnected => {
                mode == ChannelMode::Dual && strategy == FailureStrategy::FallbackToSingle
            }
            _ => false,
        }
    }

    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::SendOnlyConnected => "SEND_ONLY_CONNECTED",
            Self::ReceiveOnlyConnected => "RECEIVE_ONLY_CONNECTED",
            Self::BothConnected => "BOTH_CONNECTED",
            Self::SignedOn => "SIGNED_ON",
            Self::Reconnecting => "RECONNECTING",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}
