use crate::component::CodecError;
use crate::id::ComponentKey;
use crate::message::WireError;
use crate::pool::PoolError;
use crate::staging::StagingError;
use crate::sync::SyncError;

/// Errors surfaced by a scene bridge.
///
/// `UnknownComponent` and `Serialization` are soft: the pipeline recovers
/// from them per message and only host-side writers see them as `Err`.
/// The rest abort the current call.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("component {0} is not registered")]
    UnknownComponent(ComponentKey),
    #[error("staging buffer misuse: {0}")]
    ProtocolState(StagingError),
    #[error(transparent)]
    PoolExhaustion(PoolError),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error(transparent)]
    SyncTimeout(#[from] SyncError),
}

impl BridgeError {
    /// Whether the error concerns a single message rather than the call.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            BridgeError::UnknownComponent(_) | BridgeError::Serialization(_)
        )
    }
}

impl From<PoolError> for BridgeError {
    fn from(err: PoolError) -> Self {
        BridgeError::PoolExhaustion(err)
    }
}

impl From<StagingError> for BridgeError {
    fn from(err: StagingError) -> Self {
        match err {
            StagingError::Pool(err) => BridgeError::PoolExhaustion(err),
            other => BridgeError::ProtocolState(other),
        }
    }
}

impl From<WireError> for BridgeError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Pool(err) => BridgeError::PoolExhaustion(err),
            other => BridgeError::Serialization(other.to_string()),
        }
    }
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentKind;
    use crate::id::SceneId;
    use crate::staging::BufferState;
    use std::time::Duration;

    #[test]
    fn pool_errors_map_to_exhaustion_through_every_path() {
        let pool_err = PoolError::Exhausted {
            pool: "payloads",
            outstanding: 4,
            ceiling: 4,
        };
        let direct: BridgeError = pool_err.clone().into();
        let staged: BridgeError = StagingError::Pool(pool_err.clone()).into();
        let wired: BridgeError = WireError::Pool(pool_err).into();
        for err in [direct, staged, wired] {
            assert!(matches!(err, BridgeError::PoolExhaustion(_)));
            assert!(!err.is_soft());
        }
    }

    #[test]
    fn state_errors_are_hard() {
        let err: BridgeError = StagingError::InvalidState {
            operation: "apply",
            state: BufferState::Open,
        }
        .into();
        assert!(matches!(err, BridgeError::ProtocolState(_)));
        assert!(err.to_string().contains("apply"));
    }

    #[test]
    fn codec_errors_are_soft() {
        let err: BridgeError = CodecError::KindMismatch {
            expected: ComponentKind::Text,
            found: ComponentKind::Blob,
        }
        .into();
        assert!(err.is_soft());
        assert!(BridgeError::UnknownComponent(ComponentKey(3)).is_soft());
    }

    #[test]
    fn timeout_is_hard() {
        let err: BridgeError = SyncError::Timeout {
            owner: SceneId(1),
            waited: Duration::from_millis(5),
        }
        .into();
        assert!(!err.is_soft());
    }
}
