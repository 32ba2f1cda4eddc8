//! Replication protocol message schemas and CBOR encoding.
//!
//! Every frame carries one envelope map `{v, type, body}`. Decoding is
//! strict: indefinite lengths, trailing bytes and missing fields are errors,
//! while unknown keys are skipped so newer peers can add fields.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{
    ActivitySnapshot, ClusterName, DataBlob, ErrorCode, ErrorPayload, HistoryTaskAttributes,
    Limits, NamespaceId, NamespaceRecord, NamespaceState, NamespaceTaskAttributes,
    ReplicationMessages, ReplicationTask, ReplicationTaskAttributes, RunId, SchedulingMetadata,
    SyncActivityTaskAttributes, TaskDescriptor, TaskId, TaskType, WorkflowId,
};

pub const PROTOCOL_VERSION_V1: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplEnvelope {
    pub version: u32,
    pub message: ReplMessage,
}

impl ReplEnvelope {
    pub fn v1(message: ReplMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION_V1,
            message,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplMessage {
    GetMessages(GetMessages),
    Messages(ReplicationMessages),
    GetTask(GetTask),
    Task(ReplicationTask),
    Error(ErrorPayload),
}

/// Poll for tasks above `last_retrieved_message_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetMessages {
    pub polling_cluster: ClusterName,
    pub last_retrieved_message_id: TaskId,
    /// Caller's own bound on the long poll; the server clamps it.
    pub wait_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetTask {
    pub descriptor: TaskDescriptor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageType {
    GetMessages,
    Messages,
    GetTask,
    Task,
    Error,
}

shardrepl_core::enum_str! {
    impl MessageType {
        fn as_str(&self) -> &'static str;
        fn parse_str(raw: &str) -> Option<Self>;
        variants {
            GetMessages => ["GET_MESSAGES"],
            Messages => ["MESSAGES"],
            GetTask => ["GET_TASK"],
            Task => ["TASK"],
            Error => ["ERROR"],
        }
    }
}

impl ReplMessage {
    fn message_type(&self) -> MessageType {
        match self {
            ReplMessage::GetMessages(_) => MessageType::GetMessages,
            ReplMessage::Messages(_) => MessageType::Messages,
            ReplMessage::GetTask(_) => MessageType::GetTask,
            ReplMessage::Task(_) => MessageType::Task,
            ReplMessage::Error(_) => MessageType::Error,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

impl ProtoDecodeError {
    pub fn as_error_payload(&self) -> ErrorPayload {
        let message = match self {
            ProtoDecodeError::MissingField(field) => format!("missing field {field}"),
            ProtoDecodeError::InvalidField { field, reason } => {
                format!("invalid field {field}: {reason}")
            }
            ProtoDecodeError::UnknownMessageType(raw) => format!("unknown message type {raw}"),
            ProtoDecodeError::UnsupportedVersion(version) => {
                format!("unsupported protocol version {version}")
            }
            ProtoDecodeError::DecodeLimit(_)
            | ProtoDecodeError::IndefiniteLength
            | ProtoDecodeError::TrailingBytes
            | ProtoDecodeError::Cbor(_) => {
                format!("failed to decode CBOR payload: {}", reason_string(self))
            }
        };
        ErrorPayload::new(ErrorCode::InvalidRequest, message, false)
    }
}

pub fn encode_envelope(envelope: &ReplEnvelope) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("v")?;
    enc.u32(envelope.version)?;
    enc.str("type")?;
    enc.str(envelope.message.message_type().as_str())?;
    enc.str("body")?;
    match &envelope.message {
        ReplMessage::GetMessages(msg) => encode_get_messages(&mut enc, msg)?,
        ReplMessage::Messages(msg) => encode_messages(&mut enc, msg)?,
        ReplMessage::GetTask(msg) => encode_descriptor_wrapper(&mut enc, &msg.descriptor)?,
        ReplMessage::Task(task) => encode_task(&mut enc, task)?,
        ReplMessage::Error(payload) => encode_error_payload(&mut enc, payload)?,
    }
    Ok(buf)
}

pub fn decode_envelope(bytes: &[u8], limits: &Limits) -> Result<ReplEnvelope, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits, 0)?;

    let mut version = None;
    let mut message_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "v" => version = Some(decode_u32(&mut dec, "v")?),
            "type" => {
                let raw = decode_text(&mut dec, limits)?;
                message_type = Some(
                    MessageType::parse_str(raw)
                        .ok_or_else(|| ProtoDecodeError::UnknownMessageType(raw.to_string()))?,
                );
            }
            "body" => {
                let start = dec.position();
                dec.skip()?;
                let end = dec.position();
                body_span = Some((start, end));
            }
            _ => skip_value(&mut dec)?,
        }
    }

    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
    if version != PROTOCOL_VERSION_V1 {
        return Err(ProtoDecodeError::UnsupportedVersion(version));
    }
    let message_type = message_type.ok_or(ProtoDecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoDecodeError::MissingField("body"))?;

    let mut body = Decoder::new(&bytes[start..end]);
    let message = match message_type {
        MessageType::GetMessages => {
            ReplMessage::GetMessages(decode_get_messages(&mut body, limits, 1)?)
        }
        MessageType::Messages => ReplMessage::Messages(decode_messages(&mut body, limits, 1)?),
        MessageType::GetTask => ReplMessage::GetTask(GetTask {
            descriptor: decode_descriptor_wrapper(&mut body, limits, 1)?,
        }),
        MessageType::Task => ReplMessage::Task(decode_task(&mut body, limits, 1)?),
        MessageType::Error => ReplMessage::Error(decode_error_payload(&mut body, limits, 1)?),
    };
    if body.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    Ok(ReplEnvelope { version, message })
}

type Enc<'a> = Encoder<&'a mut Vec<u8>>;

fn encode_get_messages(enc: &mut Enc<'_>, msg: &GetMessages) -> Result<(), ProtoEncodeError> {
    let len = if msg.wait_timeout_ms.is_some() { 3 } else { 2 };
    enc.map(len)?;
    enc.str("polling_cluster")?;
    enc.str(msg.polling_cluster.as_str())?;
    enc.str("last_retrieved_message_id")?;
    enc.u64(msg.last_retrieved_message_id.get())?;
    if let Some(wait) = msg.wait_timeout_ms {
        enc.str("wait_timeout_ms")?;
        enc.u64(wait)?;
    }
    Ok(())
}

fn decode_get_messages(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<GetMessages, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut polling_cluster = None;
    let mut last_retrieved = None;
    let mut wait_timeout_ms = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "polling_cluster" => {
                let raw = decode_text(dec, limits)?;
                polling_cluster = Some(ClusterName::new(raw).map_err(|err| {
                    ProtoDecodeError::InvalidField {
                        field: "polling_cluster",
                        reason: err.to_string(),
                    }
                })?);
            }
            "last_retrieved_message_id" => last_retrieved = Some(TaskId::new(dec.u64()?)),
            "wait_timeout_ms" => wait_timeout_ms = Some(dec.u64()?),
            _ => skip_value(dec)?,
        }
    }

    Ok(GetMessages {
        polling_cluster: polling_cluster
            .ok_or(ProtoDecodeError::MissingField("polling_cluster"))?,
        last_retrieved_message_id: last_retrieved
            .ok_or(ProtoDecodeError::MissingField("last_retrieved_message_id"))?,
        wait_timeout_ms,
    })
}

fn encode_messages(enc: &mut Enc<'_>, msg: &ReplicationMessages) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("tasks")?;
    enc.array(msg.tasks.len() as u64)?;
    for task in &msg.tasks {
        encode_task(enc, task)?;
    }
    enc.str("last_retrieved_message_id")?;
    enc.u64(msg.last_retrieved_message_id.get())?;
    enc.str("has_more")?;
    enc.bool(msg.has_more)?;
    Ok(())
}

fn decode_messages(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<ReplicationMessages, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut tasks = None;
    let mut last_retrieved = None;
    let mut has_more = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "tasks" => {
                let len = decode_array_len(dec, limits, depth + 1)?;
                let mut items = Vec::with_capacity(len.min(limits.max_batch_tasks));
                for _ in 0..len {
                    items.push(decode_task(dec, limits, depth + 2)?);
                }
                tasks = Some(items);
            }
            "last_retrieved_message_id" => last_retrieved = Some(TaskId::new(dec.u64()?)),
            "has_more" => has_more = Some(dec.bool()?),
            _ => skip_value(dec)?,
        }
    }

    Ok(ReplicationMessages {
        tasks: tasks.ok_or(ProtoDecodeError::MissingField("tasks"))?,
        last_retrieved_message_id: last_retrieved
            .ok_or(ProtoDecodeError::MissingField("last_retrieved_message_id"))?,
        has_more: has_more.ok_or(ProtoDecodeError::MissingField("has_more"))?,
    })
}

fn encode_descriptor_wrapper(
    enc: &mut Enc<'_>,
    descriptor: &TaskDescriptor,
) -> Result<(), ProtoEncodeError> {
    enc.map(1)?;
    enc.str("descriptor")?;
    encode_descriptor(enc, descriptor)
}

fn decode_descriptor_wrapper(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<TaskDescriptor, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut descriptor = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "descriptor" => descriptor = Some(decode_descriptor(dec, limits, depth + 1)?),
            _ => skip_value(dec)?,
        }
    }
    descriptor.ok_or(ProtoDecodeError::MissingField("descriptor"))
}

fn encode_descriptor(
    enc: &mut Enc<'_>,
    descriptor: &TaskDescriptor,
) -> Result<(), ProtoEncodeError> {
    enc.map(6)?;
    enc.str("task_id")?;
    enc.u64(descriptor.task_id.get())?;
    enc.str("task_type")?;
    enc.u32(descriptor.task_type.code())?;
    enc.str("namespace_id")?;
    enc.bytes(descriptor.namespace_id.as_uuid().as_bytes())?;
    enc.str("workflow_id")?;
    enc.str(descriptor.workflow_id.as_str())?;
    enc.str("run_id")?;
    enc.bytes(descriptor.run_id.as_uuid().as_bytes())?;
    enc.str("scheduling")?;
    encode_scheduling(enc, &descriptor.scheduling)
}

fn decode_descriptor(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<TaskDescriptor, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut task_id = None;
    let mut task_type = None;
    let mut namespace_id = None;
    let mut workflow_id = None;
    let mut run_id = None;
    let mut scheduling = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "task_id" => task_id = Some(TaskId::new(dec.u64()?)),
            "task_type" => task_type = Some(TaskType::from_code(decode_u32(dec, "task_type")?)),
            "namespace_id" => {
                namespace_id = Some(NamespaceId::new(decode_uuid(dec, limits, "namespace_id")?))
            }
            "workflow_id" => workflow_id = Some(decode_workflow_id(dec, limits)?),
            "run_id" => run_id = Some(RunId::new(decode_uuid(dec, limits, "run_id")?)),
            "scheduling" => scheduling = Some(decode_scheduling(dec, limits, depth + 1)?),
            _ => skip_value(dec)?,
        }
    }

    Ok(TaskDescriptor {
        task_id: task_id.ok_or(ProtoDecodeError::MissingField("task_id"))?,
        task_type: task_type.ok_or(ProtoDecodeError::MissingField("task_type"))?,
        namespace_id: namespace_id.ok_or(ProtoDecodeError::MissingField("namespace_id"))?,
        workflow_id: workflow_id.ok_or(ProtoDecodeError::MissingField("workflow_id"))?,
        run_id: run_id.ok_or(ProtoDecodeError::MissingField("run_id"))?,
        scheduling: scheduling.unwrap_or_default(),
    })
}

fn encode_scheduling(
    enc: &mut Enc<'_>,
    scheduling: &SchedulingMetadata,
) -> Result<(), ProtoEncodeError> {
    let len = if scheduling.new_run_branch_token.is_some() { 7 } else { 6 };
    enc.map(len)?;
    enc.str("version")?;
    enc.i64(scheduling.version)?;
    enc.str("first_event_id")?;
    enc.i64(scheduling.first_event_id)?;
    enc.str("next_event_id")?;
    enc.i64(scheduling.next_event_id)?;
    enc.str("scheduled_event_id")?;
    enc.i64(scheduling.scheduled_event_id)?;
    enc.str("branch_token")?;
    enc.bytes(&scheduling.branch_token)?;
    if let Some(token) = &scheduling.new_run_branch_token {
        enc.str("new_run_branch_token")?;
        enc.bytes(token)?;
    }
    enc.str("visibility_time_ms")?;
    enc.u64(scheduling.visibility_time_ms)?;
    Ok(())
}

fn decode_scheduling(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<SchedulingMetadata, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut scheduling = SchedulingMetadata::default();
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "version" => scheduling.version = dec.i64()?,
            "first_event_id" => scheduling.first_event_id = dec.i64()?,
            "next_event_id" => scheduling.next_event_id = dec.i64()?,
            "scheduled_event_id" => scheduling.scheduled_event_id = dec.i64()?,
            "branch_token" => {
                scheduling.branch_token =
                    Bytes::copy_from_slice(decode_bytes(dec, limits, "branch_token")?)
            }
            "new_run_branch_token" => {
                scheduling.new_run_branch_token = Some(Bytes::copy_from_slice(decode_bytes(
                    dec,
                    limits,
                    "new_run_branch_token",
                )?))
            }
            "visibility_time_ms" => scheduling.visibility_time_ms = dec.u64()?,
            _ => skip_value(dec)?,
        }
    }
    Ok(scheduling)
}

fn encode_task(enc: &mut Enc<'_>, task: &ReplicationTask) -> Result<(), ProtoEncodeError> {
    enc.map(4)?;
    enc.str("task_id")?;
    enc.u64(task.task_id.get())?;
    enc.str("visibility_time_ms")?;
    enc.u64(task.visibility_time_ms)?;
    enc.str("kind")?;
    enc.str(task.kind())?;
    enc.str("attributes")?;
    match &task.attributes {
        ReplicationTaskAttributes::History(attrs) => encode_history(enc, attrs),
        ReplicationTaskAttributes::SyncActivity(attrs) => encode_sync_activity(enc, attrs),
        ReplicationTaskAttributes::Namespace(attrs) => encode_namespace(enc, &attrs.namespace),
    }
}

fn decode_task(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<ReplicationTask, ProtoDecodeError> {
    let input = dec.input();
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut task_id = None;
    let mut visibility_time_ms = None;
    let mut kind = None;
    let mut attributes_span = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "task_id" => task_id = Some(TaskId::new(dec.u64()?)),
            "visibility_time_ms" => visibility_time_ms = Some(dec.u64()?),
            "kind" => kind = Some(decode_text(dec, limits)?),
            "attributes" => {
                let start = dec.position();
                skip_value(dec)?;
                attributes_span = Some((start, dec.position()));
            }
            _ => skip_value(dec)?,
        }
    }

    let kind = kind.ok_or(ProtoDecodeError::MissingField("kind"))?;
    let (start, end) = attributes_span.ok_or(ProtoDecodeError::MissingField("attributes"))?;
    let mut attrs = Decoder::new(&input[start..end]);
    let attributes = match kind {
        "history" => {
            ReplicationTaskAttributes::History(decode_history(&mut attrs, limits, depth + 1)?)
        }
        "sync_activity" => ReplicationTaskAttributes::SyncActivity(decode_sync_activity(
            &mut attrs,
            limits,
            depth + 1,
        )?),
        "namespace" => ReplicationTaskAttributes::Namespace(NamespaceTaskAttributes {
            namespace: decode_namespace(&mut attrs, limits, depth + 1)?,
        }),
        other => {
            return Err(ProtoDecodeError::InvalidField {
                field: "kind",
                reason: format!("unknown task kind {other}"),
            });
        }
    };

    Ok(ReplicationTask {
        task_id: task_id.ok_or(ProtoDecodeError::MissingField("task_id"))?,
        visibility_time_ms: visibility_time_ms
            .ok_or(ProtoDecodeError::MissingField("visibility_time_ms"))?,
        attributes,
    })
}

fn encode_history(
    enc: &mut Enc<'_>,
    attrs: &HistoryTaskAttributes,
) -> Result<(), ProtoEncodeError> {
    let len = if attrs.new_run_events.is_some() { 8 } else { 7 };
    enc.map(len)?;
    enc.str("namespace_id")?;
    enc.bytes(attrs.namespace_id.as_uuid().as_bytes())?;
    enc.str("workflow_id")?;
    enc.str(attrs.workflow_id.as_str())?;
    enc.str("run_id")?;
    enc.bytes(attrs.run_id.as_uuid().as_bytes())?;
    enc.str("version")?;
    enc.i64(attrs.version)?;
    enc.str("first_event_id")?;
    enc.i64(attrs.first_event_id)?;
    enc.str("next_event_id")?;
    enc.i64(attrs.next_event_id)?;
    enc.str("events")?;
    encode_blob(enc, &attrs.events)?;
    if let Some(blob) = &attrs.new_run_events {
        enc.str("new_run_events")?;
        encode_blob(enc, blob)?;
    }
    Ok(())
}

fn decode_history(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<HistoryTaskAttributes, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut namespace_id = None;
    let mut workflow_id = None;
    let mut run_id = None;
    let mut version = None;
    let mut first_event_id = None;
    let mut next_event_id = None;
    let mut events = None;
    let mut new_run_events = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "namespace_id" => {
                namespace_id = Some(NamespaceId::new(decode_uuid(dec, limits, "namespace_id")?))
            }
            "workflow_id" => workflow_id = Some(decode_workflow_id(dec, limits)?),
            "run_id" => run_id = Some(RunId::new(decode_uuid(dec, limits, "run_id")?)),
            "version" => version = Some(dec.i64()?),
            "first_event_id" => first_event_id = Some(dec.i64()?),
            "next_event_id" => next_event_id = Some(dec.i64()?),
            "events" => events = Some(decode_blob(dec, limits, depth + 1)?),
            "new_run_events" => new_run_events = Some(decode_blob(dec, limits, depth + 1)?),
            _ => skip_value(dec)?,
        }
    }

    Ok(HistoryTaskAttributes {
        namespace_id: namespace_id.ok_or(ProtoDecodeError::MissingField("namespace_id"))?,
        workflow_id: workflow_id.ok_or(ProtoDecodeError::MissingField("workflow_id"))?,
        run_id: run_id.ok_or(ProtoDecodeError::MissingField("run_id"))?,
        version: version.ok_or(ProtoDecodeError::MissingField("version"))?,
        first_event_id: first_event_id.ok_or(ProtoDecodeError::MissingField("first_event_id"))?,
        next_event_id: next_event_id.ok_or(ProtoDecodeError::MissingField("next_event_id"))?,
        events: events.ok_or(ProtoDecodeError::MissingField("events"))?,
        new_run_events,
    })
}

fn encode_sync_activity(
    enc: &mut Enc<'_>,
    attrs: &SyncActivityTaskAttributes,
) -> Result<(), ProtoEncodeError> {
    enc.map(4)?;
    enc.str("namespace_id")?;
    enc.bytes(attrs.namespace_id.as_uuid().as_bytes())?;
    enc.str("workflow_id")?;
    enc.str(attrs.workflow_id.as_str())?;
    enc.str("run_id")?;
    enc.bytes(attrs.run_id.as_uuid().as_bytes())?;
    enc.str("activity")?;
    encode_activity(enc, &attrs.activity)
}

fn decode_sync_activity(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<SyncActivityTaskAttributes, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut namespace_id = None;
    let mut workflow_id = None;
    let mut run_id = None;
    let mut activity = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "namespace_id" => {
                namespace_id = Some(NamespaceId::new(decode_uuid(dec, limits, "namespace_id")?))
            }
            "workflow_id" => workflow_id = Some(decode_workflow_id(dec, limits)?),
            "run_id" => run_id = Some(RunId::new(decode_uuid(dec, limits, "run_id")?)),
            "activity" => activity = Some(decode_activity(dec, limits, depth + 1)?),
            _ => skip_value(dec)?,
        }
    }

    Ok(SyncActivityTaskAttributes {
        namespace_id: namespace_id.ok_or(ProtoDecodeError::MissingField("namespace_id"))?,
        workflow_id: workflow_id.ok_or(ProtoDecodeError::MissingField("workflow_id"))?,
        run_id: run_id.ok_or(ProtoDecodeError::MissingField("run_id"))?,
        activity: activity.ok_or(ProtoDecodeError::MissingField("activity"))?,
    })
}

fn encode_activity(
    enc: &mut Enc<'_>,
    activity: &ActivitySnapshot,
) -> Result<(), ProtoEncodeError> {
    let mut len = 5;
    for present in [
        activity.started_time_ms.is_some(),
        activity.last_heartbeat_time_ms.is_some(),
        activity.details.is_some(),
        activity.last_failure.is_some(),
        activity.last_worker_identity.is_some(),
    ] {
        if present {
            len += 1;
        }
    }
    enc.map(len)?;
    enc.str("version")?;
    enc.i64(activity.version)?;
    enc.str("scheduled_event_id")?;
    enc.i64(activity.scheduled_event_id)?;
    enc.str("scheduled_time_ms")?;
    enc.u64(activity.scheduled_time_ms)?;
    enc.str("started_event_id")?;
    enc.i64(activity.started_event_id)?;
    enc.str("attempt")?;
    enc.u32(activity.attempt)?;
    if let Some(value) = activity.started_time_ms {
        enc.str("started_time_ms")?;
        enc.u64(value)?;
    }
    if let Some(value) = activity.last_heartbeat_time_ms {
        enc.str("last_heartbeat_time_ms")?;
        enc.u64(value)?;
    }
    if let Some(blob) = &activity.details {
        enc.str("details")?;
        encode_blob(enc, blob)?;
    }
    if let Some(failure) = &activity.last_failure {
        enc.str("last_failure")?;
        enc.str(failure)?;
    }
    if let Some(identity) = &activity.last_worker_identity {
        enc.str("last_worker_identity")?;
        enc.str(identity)?;
    }
    Ok(())
}

fn decode_activity(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<ActivitySnapshot, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut activity = ActivitySnapshot::default();
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "version" => activity.version = dec.i64()?,
            "scheduled_event_id" => activity.scheduled_event_id = dec.i64()?,
            "scheduled_time_ms" => activity.scheduled_time_ms = dec.u64()?,
            "started_event_id" => activity.started_event_id = dec.i64()?,
            "attempt" => activity.attempt = decode_u32(dec, "attempt")?,
            "started_time_ms" => activity.started_time_ms = Some(dec.u64()?),
            "last_heartbeat_time_ms" => activity.last_heartbeat_time_ms = Some(dec.u64()?),
            "details" => activity.details = Some(decode_blob(dec, limits, depth + 1)?),
            "last_failure" => activity.last_failure = Some(decode_text(dec, limits)?.to_string()),
            "last_worker_identity" => {
                activity.last_worker_identity = Some(decode_text(dec, limits)?.to_string())
            }
            _ => skip_value(dec)?,
        }
    }
    Ok(activity)
}

fn encode_namespace(
    enc: &mut Enc<'_>,
    record: &NamespaceRecord,
) -> Result<(), ProtoEncodeError> {
    enc.map(9)?;
    enc.str("id")?;
    enc.bytes(record.id.as_uuid().as_bytes())?;
    enc.str("name")?;
    enc.str(&record.name)?;
    enc.str("state")?;
    enc.str(record.state.as_str())?;
    enc.str("description")?;
    enc.str(&record.description)?;
    enc.str("owner_email")?;
    enc.str(&record.owner_email)?;
    enc.str("retention_days")?;
    enc.u32(record.retention_days)?;
    enc.str("config_version")?;
    enc.i64(record.config_version)?;
    enc.str("failover_version")?;
    enc.i64(record.failover_version)?;
    enc.str("is_global")?;
    enc.bool(record.is_global)?;
    Ok(())
}

fn decode_namespace(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<NamespaceRecord, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut id = None;
    let mut name = None;
    let mut state = None;
    let mut description = String::new();
    let mut owner_email = String::new();
    let mut retention_days = 0;
    let mut config_version = 0;
    let mut failover_version = 0;
    let mut is_global = false;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "id" => id = Some(NamespaceId::new(decode_uuid(dec, limits, "id")?)),
            "name" => name = Some(decode_text(dec, limits)?.to_string()),
            "state" => {
                let raw = decode_text(dec, limits)?;
                state = Some(NamespaceState::parse_str(raw).ok_or_else(|| {
                    ProtoDecodeError::InvalidField {
                        field: "state",
                        reason: format!("unknown namespace state {raw}"),
                    }
                })?);
            }
            "description" => description = decode_text(dec, limits)?.to_string(),
            "owner_email" => owner_email = decode_text(dec, limits)?.to_string(),
            "retention_days" => retention_days = decode_u32(dec, "retention_days")?,
            "config_version" => config_version = dec.i64()?,
            "failover_version" => failover_version = dec.i64()?,
            "is_global" => is_global = dec.bool()?,
            _ => skip_value(dec)?,
        }
    }

    Ok(NamespaceRecord {
        id: id.ok_or(ProtoDecodeError::MissingField("id"))?,
        name: name.ok_or(ProtoDecodeError::MissingField("name"))?,
        state: state.ok_or(ProtoDecodeError::MissingField("state"))?,
        description,
        owner_email,
        retention_days,
        config_version,
        failover_version,
        is_global,
    })
}

fn encode_blob(enc: &mut Enc<'_>, blob: &DataBlob) -> Result<(), ProtoEncodeError> {
    enc.map(2)?;
    enc.str("encoding")?;
    enc.str(&blob.encoding)?;
    enc.str("data")?;
    enc.bytes(&blob.data)?;
    Ok(())
}

fn decode_blob(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<DataBlob, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut encoding = None;
    let mut data = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "encoding" => encoding = Some(decode_text(dec, limits)?.to_string()),
            "data" => data = Some(Bytes::copy_from_slice(decode_bytes(dec, limits, "data")?)),
            _ => skip_value(dec)?,
        }
    }
    Ok(DataBlob {
        encoding: encoding.ok_or(ProtoDecodeError::MissingField("encoding"))?,
        data: data.ok_or(ProtoDecodeError::MissingField("data"))?,
    })
}

fn encode_error_payload(
    enc: &mut Enc<'_>,
    payload: &ErrorPayload,
) -> Result<(), ProtoEncodeError> {
    let len = if payload.task_id.is_some() { 4 } else { 3 };
    enc.map(len)?;
    enc.str("code")?;
    enc.str(payload.code.as_str())?;
    enc.str("message")?;
    enc.str(&payload.message)?;
    enc.str("retryable")?;
    enc.bool(payload.retryable)?;
    if let Some(task_id) = payload.task_id {
        enc.str("task_id")?;
        enc.u64(task_id.get())?;
    }
    Ok(())
}

fn decode_error_payload(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<ErrorPayload, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut code = None;
    let mut message = None;
    let mut retryable = None;
    let mut task_id = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "code" => {
                // Codes added by newer peers degrade to `internal`.
                let raw = decode_text(dec, limits)?;
                code = Some(ErrorCode::parse_str(raw).unwrap_or(ErrorCode::Internal));
            }
            "message" => message = Some(decode_text(dec, limits)?.to_string()),
            "retryable" => retryable = Some(dec.bool()?),
            "task_id" => task_id = Some(TaskId::new(dec.u64()?)),
            _ => skip_value(dec)?,
        }
    }

    Ok(ErrorPayload {
        code: code.ok_or(ProtoDecodeError::MissingField("code"))?,
        message: message.ok_or(ProtoDecodeError::MissingField("message"))?,
        retryable: retryable.ok_or(ProtoDecodeError::MissingField("retryable"))?,
        task_id,
    })
}

fn decode_workflow_id(dec: &mut Decoder, limits: &Limits) -> Result<WorkflowId, ProtoDecodeError> {
    let raw = decode_text(dec, limits)?;
    WorkflowId::new(raw).map_err(|err| ProtoDecodeError::InvalidField {
        field: "workflow_id",
        reason: err.to_string(),
    })
}

fn decode_uuid(
    dec: &mut Decoder,
    limits: &Limits,
    field: &'static str,
) -> Result<Uuid, ProtoDecodeError> {
    let raw = decode_bytes(dec, limits, field)?;
    Uuid::from_slice(raw).map_err(|_| ProtoDecodeError::InvalidField {
        field,
        reason: "expected 16-byte uuid".into(),
    })
}

fn skip_value(dec: &mut Decoder) -> Result<(), ProtoDecodeError> {
    if is_indefinite(dec)? {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}

fn decode_map_len(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<usize, ProtoDecodeError> {
    ensure_depth(limits, depth)?;
    let len = dec.map()?;
    let Some(len) = len else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_cbor_map_entries as u64 {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_map_entries"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("max_cbor_map_entries"))
}

fn decode_array_len(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<usize, ProtoDecodeError> {
    ensure_depth(limits, depth)?;
    let len = dec.array()?;
    let Some(len) = len else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_cbor_array_entries as u64 {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_array_entries"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("max_cbor_array_entries"))
}

fn decode_text<'a>(dec: &mut Decoder<'a>, limits: &Limits) -> Result<&'a str, ProtoDecodeError> {
    let ty = dec.datatype()?;
    if matches!(ty, Type::StringIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let s = dec.str()?;
    if s.len() > limits.max_cbor_text_string_len {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_text_string_len"));
    }
    Ok(s)
}

fn decode_bytes<'a>(
    dec: &mut Decoder<'a>,
    limits: &Limits,
    field: &'static str,
) -> Result<&'a [u8], ProtoDecodeError> {
    let ty = dec.datatype()?;
    if matches!(ty, Type::BytesIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let bytes = dec.bytes()?;
    if bytes.len() > limits.max_cbor_bytes_string_len {
        return Err(ProtoDecodeError::InvalidField {
            field,
            reason: "bytes length exceeds limit".into(),
        });
    }
    Ok(bytes)
}

fn decode_u32(dec: &mut Decoder, field: &'static str) -> Result<u32, ProtoDecodeError> {
    let value = dec.u64()?;
    u32::try_from(value).map_err(|_| ProtoDecodeError::InvalidField {
        field,
        reason: format!("value {value} out of range for u32"),
    })
}

fn ensure_depth(limits: &Limits, depth: usize) -> Result<(), ProtoDecodeError> {
    if depth > limits.max_cbor_depth {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_depth"));
    }
    Ok(())
}

fn is_indefinite(dec: &Decoder) -> Result<bool, ProtoDecodeError> {
    let ty = dec.datatype()?;
    Ok(matches!(
        ty,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ))
}

fn reason_string(err: &ProtoDecodeError) -> String {
    match err {
        ProtoDecodeError::DecodeLimit(reason) => reason.to_string(),
        ProtoDecodeError::IndefiniteLength => "indefinite-length CBOR".to_string(),
        ProtoDecodeError::TrailingBytes => "trailing bytes".to_string(),
        ProtoDecodeError::Cbor(e) => e.to_string(),
        other => other.to_string(),
    }
}
