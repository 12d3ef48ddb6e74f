//! Side channels multiplexed over the simulator connection
//!
//! A side-channel block is a sequence of `[16-byte channel id][i32 LE length][payload]`
//! records. Messages queued on a channel are flushed into the block attached to the next
//! outgoing request.

use uuid::Uuid;

use crate::env::EnvError;

/// Engine configuration channel id
pub const ENGINE_CONFIGURATION_CHANNEL_ID: Uuid = Uuid::from_u128(0xe951342c_4f7e_11ea_b238_784f4387d1f7);

/// Settings understood by the engine configuration channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ConfigurationType {
    ScreenResolution = 0,
    QualityLevel = 1,
    TimeScale = 2,
    TargetFrameRate = 3,
    CaptureFrameRate = 4,
}

/// One record of a side-channel block
#[derive(Debug, Clone, PartialEq)]
pub struct SideChannelMessage {
    pub channel_id: Uuid,
    pub payload: Vec<u8>,
}

/// Sets simulation parameters such as the time scale
#[derive(Debug, Default)]
pub struct EngineConfigurationChannel {
    queued: Vec<Vec<u8>>,
}

impl EngineConfigurationChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a new simulation speed, applied with the next outgoing request
    pub fn set_time_scale(&mut self, time_scale: f32) -> Result<(), EnvError> {
        if time_scale.is_nan() || time_scale <= 0.0 {
            return Err(EnvError::InvalidTimeScale(time_scale));
        }
        self.queue_float(ConfigurationType::TimeScale, time_scale);
        Ok(())
    }

    fn queue_float(&mut self, kind: ConfigurationType, value: f32) {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&(kind as i32).to_le_bytes());
        payload.extend_from_slice(&value.to_le_bytes());
        self.queued.push(payload);
    }

    /// Take every queued message
    pub fn drain(&mut self) -> Vec<SideChannelMessage> {
        self.queued
            .drain(..)
            .map(|payload| SideChannelMessage {
                channel_id: ENGINE_CONFIGURATION_CHANNEL_ID,
                payload,
            })
            .collect()
    }
}

/// Serialize messages into one side-channel block
pub fn encode(messages: &[SideChannelMessage]) -> Vec<u8> {
    let mut block = Vec::new();
    for message in messages {
        block.extend_from_slice(&message.channel_id.to_bytes_le());
        block.extend_from_slice(&(message.payload.len() as i32).to_le_bytes());
        block.extend_from_slice(&message.payload);
    }
    block
}

/// Split a side-channel block into its messages
pub fn decode(mut block: &[u8]) -> Result<Vec<SideChannelMessage>, EnvError> {
    let mut messages = Vec::new();
    while !block.is_empty() {
        if block.len() < 20 {
            return Err(EnvError::Protocol(format!(
                "side-channel record header needs 20 bytes, {} left",
                block.len()
            )));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&block[..16]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&block[16..20]);
        let len = i32::from_le_bytes(len);

        let len = usize::try_from(len)
            .map_err(|_| EnvError::Protocol(format!("negative side-channel payload length {len}")))?;
        let rest = &block[20..];
        if rest.len() < len {
            return Err(EnvError::Protocol(format!(
                "side-channel payload of {len} bytes truncated to {}",
                rest.len()
            )));
        }

        messages.push(SideChannelMessage {
            channel_id: Uuid::from_bytes_le(id),
            payload: rest[..len].to_vec(),
        });
        block = &rest[len..];
    }
    Ok(messages)
}

/// Read a `[i32 type][f32 value]` engine configuration payload
pub fn decode_float_setting(payload: &[u8]) -> Option<(i32, f32)> {
    if payload.len() != 8 {
        return None;
    }
    let kind = i32::from_le_bytes(payload[..4].try_into().ok()?);
    let value = f32::from_le_bytes(payload[4..].try_into().ok()?);
    Some((kind, value))
}
