//! Narrow seams to the audio codec collaborator. The session core never sees
//! codec internals: it hands bytes in, takes bytes out, and reports parameter
//! changes the server pushes mid-session.

use crate::protocol::AudioParams;

#[derive(Debug, thiserror::Error)]
#[error("audio codec: {0}")]
pub struct AudioCodecError(pub String);

/// PCM in, one Opus frame out, sized for the negotiated parameters.
pub trait AudioEncoder: Send + Sync {
    fn encode(&self, pcm: &[u8]) -> Result<Vec<u8>, AudioCodecError>;
}

/// One Opus frame in, PCM out.
pub trait AudioDecoder: Send + Sync {
    fn decode(&self, opus: &[u8]) -> Result<Vec<u8>, AudioCodecError>;
}

/// Notified when a server hello carries updated `audio_params`, so the
/// decoder can be rebuilt with the new rate/channel/frame sizing.
pub trait AudioParamsListener: Send + Sync {
    fn audio_params_changed(&self, params: &AudioParams);
}
