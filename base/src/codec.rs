use crate::error::AgentRunError;
use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};

// json codec for payloads stored in rdb columns and redis values
pub trait UseJsonCodec {
    fn serialize_message<T: Serialize>(args: &T) -> Result<String> {
        serde_json::to_string(args).map_err(|e| AgentRunError::SerdeJsonError(e).into())
    }

    fn deserialize_message<T: DeserializeOwned>(buf: &str) -> Result<T> {
        serde_json::from_str(buf)
            .map_err(|e| AgentRunError::CodecError(format!("{e}: {buf}")).into())
    }
}

pub struct JsonCodec {}
impl UseJsonCodec for JsonCodec {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AgentInstanceId, JobEnvelope, RunId, RunMode};

    #[test]
    fn test_envelope_codec() {
        let env = JobEnvelope {
            run_id: RunId::new(10),
            agent_instance_id: AgentInstanceId::new(20),
            user_id: "user-1".to_string(),
            input: serde_json::json!({"q": "hello"}),
            mode: RunMode::DryRun,
        };
        let s = JsonCodec::serialize_message(&env).unwrap();
        let back: JobEnvelope = JsonCodec::deserialize_message(&s).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_broken_payload_is_codec_error() {
        let err = JsonCodec::deserialize_message::<JobEnvelope>("{not json").unwrap_err();
        assert!(matches!(
            AgentRunError::find_in(&err),
            Some(AgentRunError::CodecError(_))
        ));
    }
}
