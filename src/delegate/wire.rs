//! Wire format for result events crossing a process boundary.
//!
//! Delegated workers stream their listener callbacks back as a flat
//! protobuf message per event, length-delimited on the wire. The reader
//! is tolerant of a truncated trailing frame so a worker killed mid-write
//! loses at most its last event, never the whole stream.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::context::{ContextWireRecord, InvocationContext, TestInformation};
use crate::error::{FailureDescription, FailureStatus};
use crate::results::{InvocationListener, LogKind, LogSource, TestCaseId};

/// Discriminant for [`ResultEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum EventKind {
    Unknown = 0,
    InvocationStarted = 1,
    InvocationFailed = 2,
    InvocationEnded = 3,
    ModuleStarted = 4,
    ModuleEnded = 5,
    RunStarted = 6,
    TestStarted = 7,
    TestFailed = 8,
    TestAssumptionFailure = 9,
    TestIgnored = 10,
    TestEnded = 11,
    RunFailed = 12,
    RunEnded = 13,
    Log = 14,
}

/// One listener callback, flattened. Only the fields relevant to the
/// event kind are populated.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResultEvent {
    #[prost(enumeration = "EventKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub run_name: String,
    #[prost(uint64, tag = "3")]
    pub expected_count: u64,
    #[prost(uint64, tag = "4")]
    pub attempt: u64,
    #[prost(string, tag = "5")]
    pub class_name: String,
    #[prost(string, tag = "6")]
    pub case_name: String,
    #[prost(string, tag = "7")]
    pub trace: String,
    #[prost(map = "string, string", tag = "8")]
    pub metrics: HashMap<String, String>,
    #[prost(uint64, tag = "9")]
    pub elapsed_ms: u64,
    #[prost(string, tag = "10")]
    pub log_name: String,
    #[prost(string, tag = "11")]
    pub log_kind: String,
    #[prost(bytes = "vec", tag = "12")]
    pub log_payload: Vec<u8>,
    /// JSON-encoded [`ContextWireRecord`], set for InvocationStarted.
    #[prost(string, tag = "13")]
    pub context_json: String,
    #[prost(string, tag = "14")]
    pub failure_message: String,
    #[prost(string, tag = "15")]
    pub failure_status: String,
    #[prost(string, optional, tag = "16")]
    pub origin_serial: Option<String>,
}

impl ResultEvent {
    fn of_kind(kind: EventKind) -> Self {
        Self {
            kind: kind as i32,
            ..Default::default()
        }
    }

    fn case_id(&self) -> TestCaseId {
        TestCaseId::new(&self.class_name, &self.case_name)
    }

    fn failure(&self) -> FailureDescription {
        FailureDescription {
            message: self.failure_message.clone(),
            status: failure_status_from_str(&self.failure_status),
            origin_serial: self.origin_serial.clone(),
        }
    }
}

fn failure_status_to_str(status: FailureStatus) -> &'static str {
    match status {
        FailureStatus::TestFailure => "test_failure",
        FailureStatus::InfraFailure => "infra_failure",
        FailureStatus::Lost => "lost",
        FailureStatus::Cancelled => "cancelled",
        FailureStatus::TimedOut => "timed_out",
        FailureStatus::Unset => "unset",
    }
}

fn failure_status_from_str(s: &str) -> FailureStatus {
    match s {
        "test_failure" => FailureStatus::TestFailure,
        "infra_failure" => FailureStatus::InfraFailure,
        "lost" => FailureStatus::Lost,
        "cancelled" => FailureStatus::Cancelled,
        "timed_out" => FailureStatus::TimedOut,
        _ => FailureStatus::Unset,
    }
}

fn log_kind_to_str(kind: LogKind) -> &'static str {
    match kind {
        LogKind::Text => "text",
        LogKind::HostLog => "host_log",
        LogKind::DeviceLog => "device_log",
        LogKind::Bugreport => "bugreport",
        LogKind::ProtoResults => "proto_results",
    }
}

fn log_kind_from_str(s: &str) -> LogKind {
    match s {
        "host_log" => LogKind::HostLog,
        "device_log" => LogKind::DeviceLog,
        "bugreport" => LogKind::Bugreport,
        "proto_results" => LogKind::ProtoResults,
        _ => LogKind::Text,
    }
}

/// Replay one decoded event into a listener.
///
/// `InvocationStarted` carries only the serialized context; callers that
/// need it rebuild the context themselves, so it is skipped here along
/// with `InvocationEnded`, which the receiving side brackets itself.
pub async fn dispatch_event(event: &ResultEvent, listener: &mut dyn InvocationListener) {
    match EventKind::try_from(event.kind).unwrap_or(EventKind::Unknown) {
        EventKind::Unknown | EventKind::InvocationStarted | EventKind::InvocationEnded => {}
        EventKind::InvocationFailed => listener.invocation_failed(&event.failure()).await,
        EventKind::ModuleStarted => listener.test_module_started(&event.run_name).await,
        EventKind::ModuleEnded => listener.test_module_ended().await,
        EventKind::RunStarted => {
            listener
                .test_run_started(
                    &event.run_name,
                    event.expected_count as usize,
                    event.attempt as usize,
                )
                .await
        }
        EventKind::TestStarted => listener.test_started(&event.case_id()).await,
        EventKind::TestFailed => listener.test_failed(&event.case_id(), &event.trace).await,
        EventKind::TestAssumptionFailure => {
            listener
                .test_assumption_failure(&event.case_id(), &event.trace)
                .await
        }
        EventKind::TestIgnored => listener.test_ignored(&event.case_id()).await,
        EventKind::TestEnded => listener.test_ended(&event.case_id(), &event.metrics).await,
        EventKind::RunFailed => listener.test_run_failed(&event.failure()).await,
        EventKind::RunEnded => {
            listener
                .test_run_ended(Duration::from_millis(event.elapsed_ms), &event.metrics)
                .await
        }
        EventKind::Log => {
            listener
                .test_log(
                    &event.log_name,
                    log_kind_from_str(&event.log_kind),
                    &LogSource::Bytes(event.log_payload.clone()),
                )
                .await
        }
    }
}

/// Writes length-delimited events to an async byte sink.
pub struct EventStreamWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> EventStreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, event: &ResultEvent) -> std::io::Result<()> {
        let frame = event.encode_length_delimited_to_vec();
        self.inner.write_all(&frame).await?;
        self.inner.flush().await
    }
}

/// Reads length-delimited events from an async byte source.
pub struct EventStreamReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> EventStreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Next complete event, or `None` at end of stream. A truncated
    /// trailing frame counts as end of stream.
    pub async fn next(&mut self) -> std::io::Result<Option<ResultEvent>> {
        loop {
            if let Some(event) = try_decode(&mut self.buf)? {
                return Ok(Some(event));
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if !self.buf.is_empty() {
                    tracing::warn!(
                        bytes = self.buf.len(),
                        "dropping truncated trailing event frame"
                    );
                }
                return Ok(None);
            }
        }
    }
}

/// Decode every complete event out of a byte slice, ignoring a truncated
/// tail. Used for result files pulled from remote workers.
pub fn decode_all(data: &[u8]) -> std::io::Result<Vec<ResultEvent>> {
    let mut buf = BytesMut::from(data);
    let mut events = Vec::new();
    while let Some(event) = try_decode(&mut buf)? {
        events.push(event);
    }
    Ok(events)
}

fn try_decode(buf: &mut BytesMut) -> std::io::Result<Option<ResultEvent>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut peek = &buf[..];
    let len = match prost::decode_length_delimiter(&mut peek) {
        Ok(len) => len,
        // A varint needs at most 10 bytes; fewer means the prefix itself
        // is still incomplete.
        Err(_) if buf.len() < 10 => return Ok(None),
        Err(e) => {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
        }
    };
    let header = buf.len() - peek.len();
    if buf.len() < header + len {
        return Ok(None);
    }
    buf.advance(header);
    let frame = buf.split_to(len).freeze();
    let event = ResultEvent::decode(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(event))
}

/// Listener that serializes every callback onto a byte sink.
///
/// This is the worker-side half of delegation: install it as the only
/// listener of the delegated invocation and the parent process receives
/// the full event stream.
pub struct StreamingListener<W> {
    writer: EventStreamWriter<W>,
}

impl<W: AsyncWrite + Unpin + Send> StreamingListener<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: EventStreamWriter::new(inner),
        }
    }

    async fn emit(&mut self, event: ResultEvent) {
        if let Err(e) = self.writer.send(&event).await {
            tracing::error!("failed to stream result event: {e}");
        }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send> InvocationListener for StreamingListener<W> {
    fn supports_granular_results(&self) -> bool {
        true
    }

    async fn invocation_started(&mut self, context: &InvocationContext) {
        let mut event = ResultEvent::of_kind(EventKind::InvocationStarted);
        match serde_json::to_string(&context.to_wire_record()) {
            Ok(json) => event.context_json = json,
            Err(e) => tracing::error!("failed to serialize context: {e}"),
        }
        self.emit(event).await;
    }

    async fn invocation_failed(&mut self, failure: &FailureDescription) {
        let mut event = ResultEvent::of_kind(EventKind::InvocationFailed);
        event.failure_message = failure.message.clone();
        event.failure_status = failure_status_to_str(failure.status).to_string();
        event.origin_serial = failure.origin_serial.clone();
        self.emit(event).await;
    }

    async fn invocation_ended(&mut self, elapsed: Duration) {
        let mut event = ResultEvent::of_kind(EventKind::InvocationEnded);
        event.elapsed_ms = elapsed.as_millis() as u64;
        self.emit(event).await;
    }

    async fn test_module_started(&mut self, name: &str) {
        let mut event = ResultEvent::of_kind(EventKind::ModuleStarted);
        event.run_name = name.to_string();
        self.emit(event).await;
    }

    async fn test_module_ended(&mut self) {
        self.emit(ResultEvent::of_kind(EventKind::ModuleEnded)).await;
    }

    async fn test_run_started(&mut self, name: &str, expected_count: usize, attempt: usize) {
        let mut event = ResultEvent::of_kind(EventKind::RunStarted);
        event.run_name = name.to_string();
        event.expected_count = expected_count as u64;
        event.attempt = attempt as u64;
        self.emit(event).await;
    }

    async fn test_started(&mut self, id: &TestCaseId) {
        let mut event = ResultEvent::of_kind(EventKind::TestStarted);
        event.class_name = id.class_name.clone();
        event.case_name = id.case_name.clone();
        self.emit(event).await;
    }

    async fn test_failed(&mut self, id: &TestCaseId, trace: &str) {
        let mut event = ResultEvent::of_kind(EventKind::TestFailed);
        event.class_name = id.class_name.clone();
        event.case_name = id.case_name.clone();
        event.trace = trace.to_string();
        self.emit(event).await;
    }

    async fn test_assumption_failure(&mut self, id: &TestCaseId, trace: &str) {
        let mut event = ResultEvent::of_kind(EventKind::TestAssumptionFailure);
        event.class_name = id.class_name.clone();
        event.case_name = id.case_name.clone();
        event.trace = trace.to_string();
        self.emit(event).await;
    }

    async fn test_ignored(&mut self, id: &TestCaseId) {
        let mut event = ResultEvent::of_kind(EventKind::TestIgnored);
        event.class_name = id.class_name.clone();
        event.case_name = id.case_name.clone();
        self.emit(event).await;
    }

    async fn test_ended(&mut self, id: &TestCaseId, metrics: &HashMap<String, String>) {
        let mut event = ResultEvent::of_kind(EventKind::TestEnded);
        event.class_name = id.class_name.clone();
        event.case_name = id.case_name.clone();
        event.metrics = metrics.clone();
        self.emit(event).await;
    }

    async fn test_run_failed(&mut self, failure: &FailureDescription) {
        let mut event = ResultEvent::of_kind(EventKind::RunFailed);
        event.failure_message = failure.message.clone();
        event.failure_status = failure_status_to_str(failure.status).to_string();
        event.origin_serial = failure.origin_serial.clone();
        self.emit(event).await;
    }

    async fn test_run_ended(&mut self, elapsed: Duration, metrics: &HashMap<String, String>) {
        let mut event = ResultEvent::of_kind(EventKind::RunEnded);
        event.elapsed_ms = elapsed.as_millis() as u64;
        event.metrics = metrics.clone();
        self.emit(event).await;
    }

    async fn test_log(&mut self, name: &str, kind: LogKind, source: &LogSource) {
        let mut event = ResultEvent::of_kind(EventKind::Log);
        event.log_name = name.to_string();
        event.log_kind = log_kind_to_str(kind).to_string();
        match source.read() {
            Ok(payload) => event.log_payload = payload,
            Err(e) => {
                tracing::warn!("failed to read log {name}: {e}");
                return;
            }
        }
        self.emit(event).await;
    }
}

/// Replays one worker event locally. A streamed context record is folded
/// back into the parent invocation's context before the event goes to the
/// listener, so the parent's reports carry what the worker recorded.
pub(crate) async fn deliver(
    event: &ResultEvent,
    info: &TestInformation,
    listener: &mut dyn InvocationListener,
) {
    if let Some(record) = context_from_event(event) {
        info.context().restore_from_delegate(&record);
    }
    dispatch_event(event, listener).await;
}

/// Parse the context record out of an `InvocationStarted` event.
pub fn context_from_event(event: &ResultEvent) -> Option<ContextWireRecord> {
    if event.kind != EventKind::InvocationStarted as i32 {
        return None;
    }
    serde_json::from_str(&event.context_json).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::RunRecorder;

    #[tokio::test]
    async fn events_round_trip_through_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let writer_task = tokio::spawn(async move {
            let mut listener = StreamingListener::new(client);
            listener.test_run_started("wire", 1, 0).await;
            let id = TestCaseId::new("wire", "case");
            listener.test_started(&id).await;
            listener.test_failed(&id, "trace text").await;
            listener.test_ended(&id, &HashMap::new()).await;
            listener
                .test_run_ended(Duration::from_millis(42), &HashMap::new())
                .await;
        });

        let mut reader = EventStreamReader::new(server);
        let mut recorder = RunRecorder::new();
        while let Some(event) = reader.next().await.unwrap() {
            dispatch_event(&event, &mut recorder).await;
        }
        writer_task.await.unwrap();

        let runs = recorder.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].name, "wire");
        assert!(runs[0].has_failures());
        assert!(runs[0].complete);
    }

    #[test]
    fn truncated_tail_is_dropped_not_fatal() {
        let mut event = ResultEvent::of_kind(EventKind::RunStarted);
        event.run_name = "partial".to_string();
        let mut data = event.encode_length_delimited_to_vec();
        let full_len = data.len();
        data.extend_from_slice(&event.encode_length_delimited_to_vec()[..full_len / 2]);

        let events = decode_all(&data).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].run_name, "partial");
    }

    #[test]
    fn decode_all_reads_back_to_back_frames() {
        let mut data = Vec::new();
        for i in 0..5 {
            let mut event = ResultEvent::of_kind(EventKind::TestStarted);
            event.case_name = format!("case{i}");
            data.extend_from_slice(&event.encode_length_delimited_to_vec());
        }
        let events = decode_all(&data).unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[4].case_name, "case4");
    }

    #[tokio::test]
    async fn context_record_crosses_the_wire() {
        let (client, server) = tokio::io::duplex(8 * 1024);
        let context = InvocationContext::new("wire-tag");
        context.add_attribute("branch", "main").unwrap();

        let mut listener = StreamingListener::new(client);
        listener.invocation_started(&context).await;
        drop(listener);

        let mut reader = EventStreamReader::new(server);
        let event = reader.next().await.unwrap().unwrap();
        let record = context_from_event(&event).unwrap();
        assert_eq!(record.test_tag, "wire-tag");
        assert_eq!(
            record.attributes,
            vec![("branch".to_string(), "main".to_string())]
        );
    }
}
