/// Wire protocol for solver and client channels.
///
/// The two listener ports speak the same framing ([`codec`]) but disjoint
/// message tables: [`SolverMessageId`] for the solver port and
/// [`ClientMessageId`] for the client port. The numeric values are a stable
/// wire contract; they must never be reordered.
pub mod client;
pub mod codec;
pub mod solver;

use crate::error::{WmError, WmResult};

/// Message ids on the solver channel, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SolverMessageId {
    KeepAlive = 0,
    TypeAnnounce = 1,
    SolverData = 2,
    CreateUri = 3,
    ExpireUri = 4,
    DeleteUri = 5,
    ExpireAttribute = 6,
    DeleteAttribute = 7,
    StartOnDemand = 8,
    StopOnDemand = 9,
}

impl TryFrom<u8> for SolverMessageId {
    type Error = WmError;

    fn try_from(value: u8) -> WmResult<Self> {
        Ok(match value {
            0 => Self::KeepAlive,
            1 => Self::TypeAnnounce,
            2 => Self::SolverData,
            3 => Self::CreateUri,
            4 => Self::ExpireUri,
            5 => Self::DeleteUri,
            6 => Self::ExpireAttribute,
            7 => Self::DeleteAttribute,
            8 => Self::StartOnDemand,
            9 => Self::StopOnDemand,
            other => {
                return Err(WmError::Protocol(format!("unknown solver message id {other}")))
            }
        })
    }
}

/// Message ids on the client channel, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientMessageId {
    KeepAlive = 0,
    SnapshotRequest = 1,
    RangeRequest = 2,
    StreamRequest = 3,
    AttributeAlias = 4,
    OriginAlias = 5,
    RequestComplete = 6,
    CancelRequest = 7,
    DataResponse = 8,
    UriSearch = 9,
    UriSearchResponse = 10,
    OriginPreference = 11,
}

impl TryFrom<u8> for ClientMessageId {
    type Error = WmError;

    fn try_from(value: u8) -> WmResult<Self> {
        Ok(match value {
            0 => Self::KeepAlive,
            1 => Self::SnapshotRequest,
            2 => Self::RangeRequest,
            3 => Self::StreamRequest,
            4 => Self::AttributeAlias,
            5 => Self::OriginAlias,
            6 => Self::RequestComplete,
            7 => Self::CancelRequest,
            8 => Self::DataResponse,
            9 => Self::UriSearch,
            10 => Self::UriSearchResponse,
            11 => Self::OriginPreference,
            other => {
                return Err(WmError::Protocol(format!("unknown client message id {other}")))
            }
        })
    }
}

/// Empty-payload keep-alive frame for the solver channel.
pub fn solver_keep_alive() -> Vec<u8> {
    codec::frame_bytes(SolverMessageId::KeepAlive as u8, &[])
}

/// Empty-payload keep-alive frame for the client channel.
pub fn client_keep_alive() -> Vec<u8> {
    codec::frame_bytes(ClientMessageId::KeepAlive as u8, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solver_ids_round_trip() {
        for value in 0u8..=9 {
            let id = SolverMessageId::try_from(value).unwrap();
            assert_eq!(id as u8, value);
        }
        assert!(SolverMessageId::try_from(10).is_err());
    }

    #[test]
    fn test_client_ids_round_trip() {
        for value in 0u8..=11 {
            let id = ClientMessageId::try_from(value).unwrap();
            assert_eq!(id as u8, value);
        }
        assert!(ClientMessageId::try_from(12).is_err());
    }

    #[test]
    fn test_keep_alive_frames_are_minimal() {
        assert_eq!(solver_keep_alive(), vec![0, 0, 0, 1, 0]);
        assert_eq!(client_keep_alive(), vec![0, 0, 0, 1, 0]);
    }
}
