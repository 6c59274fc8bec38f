//! On-the-wire encoding for persisted records.
//!
//! Every record travels inside a versioned JSON envelope
//! `{"type": ..., "version": "1", "data": {...}}`. Decoding rejects a
//! mismatched record type or an unsupported envelope version; unknown fields
//! inside `data` are ignored so newer writers stay readable.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub const ENVELOPE_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    RunnableTask,
    ExecutableTask,
    StartedTask,
    TaskExecutionResult,
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "type")]
    kind: RecordKind,
    version: String,
    data: T,
}

pub fn to_bytes<T: Serialize>(kind: RecordKind, record: &T) -> Result<Vec<u8>> {
    let envelope = Envelope {
        kind,
        version: ENVELOPE_VERSION.to_string(),
        data: record,
    };
    serde_json::to_vec(&envelope).with_context(|| format!("encoding {kind:?} record"))
}

pub fn from_bytes<T: DeserializeOwned>(kind: RecordKind, bytes: &[u8]) -> Result<T> {
    let envelope: Envelope<T> =
        serde_json::from_slice(bytes).with_context(|| format!("decoding {kind:?} record"))?;
    if envelope.kind != kind {
        bail!(
            "record type mismatch: expected {kind:?}, found {:?}",
            envelope.kind
        );
    }
    if envelope.version != ENVELOPE_VERSION {
        bail!(
            "unsupported {kind:?} record version {:?}",
            envelope.version
        );
    }
    Ok(envelope.data)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;

    use super::*;
    use crate::ids::{RunId, TaskId};
    use crate::models::{
        DagEntry, ExecutableTask, RunnableTask, StartedTask, TaskExecutionResult, TaskType,
    };

    fn sample_executable(run_id: &RunId, task_id: &str) -> ExecutableTask {
        ExecutableTask {
            run_id: run_id.clone(),
            task_id: TaskId::from(task_id),
            task_type: TaskType::new("t1", "1"),
            metadata: [("retries".to_string(), "3".to_string())].into(),
            is_executable: true,
        }
    }

    #[test]
    fn runnable_task_round_trip() {
        let run_id = RunId::new();
        let task = sample_executable(&run_id, "a");
        let record = RunnableTask {
            tasks: HashMap::from([(task.task_id.clone(), task.clone())]),
            entries: vec![DagEntry {
                task_id: task.task_id.clone(),
                dependencies: Vec::new(),
            }],
            start_time_utc: Utc::now(),
            completion_time_utc: None,
            parent_run_id: Some(RunId::new()),
        };
        let bytes = to_bytes(RecordKind::RunnableTask, &record).unwrap();
        let decoded: RunnableTask = from_bytes(RecordKind::RunnableTask, &bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn executable_task_round_trip() {
        let record = sample_executable(&RunId::new(), "a");
        let bytes = to_bytes(RecordKind::ExecutableTask, &record).unwrap();
        let decoded: ExecutableTask = from_bytes(RecordKind::ExecutableTask, &bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn started_task_round_trip() {
        let record = StartedTask {
            instance_name: "worker-1".into(),
            start_date_utc: Utc::now(),
        };
        let bytes = to_bytes(RecordKind::StartedTask, &record).unwrap();
        let decoded: StartedTask = from_bytes(RecordKind::StartedTask, &bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn execution_result_round_trip() {
        let record = TaskExecutionResult::success("ok")
            .with_data("rows", "42")
            .with_sub_task_run(RunId::new());
        let bytes = to_bytes(RecordKind::TaskExecutionResult, &record).unwrap();
        let decoded: TaskExecutionResult =
            from_bytes(RecordKind::TaskExecutionResult, &bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn record_type_mismatch_is_rejected() {
        let record = StartedTask {
            instance_name: "worker-1".into(),
            start_date_utc: Utc::now(),
        };
        let bytes = to_bytes(RecordKind::StartedTask, &record).unwrap();
        let err = from_bytes::<StartedTask>(RecordKind::TaskExecutionResult, &bytes).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn unknown_envelope_version_is_rejected() {
        let bytes = br#"{"type":"StartedTask","version":"99","data":{"instance_name":"w","start_date_utc":"2026-01-01T00:00:00Z"}}"#;
        assert!(from_bytes::<StartedTask>(RecordKind::StartedTask, bytes).is_err());
    }

    #[test]
    fn unknown_data_fields_are_ignored() {
        let bytes = br#"{"type":"StartedTask","version":"1","data":{"instance_name":"w","start_date_utc":"2026-01-01T00:00:00Z","future_field":true}}"#;
        let decoded: StartedTask = from_bytes(RecordKind::StartedTask, bytes).unwrap();
        assert_eq!(decoded.instance_name, "w");
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let bytes = br#"{"type":"StartedTask","version":"1","data":{"instance_name":"w"}}"#;
        assert!(from_bytes::<StartedTask>(RecordKind::StartedTask, bytes).is_err());
    }
}
