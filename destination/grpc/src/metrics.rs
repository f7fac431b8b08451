use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

/// Server-side gRPC metrics, labeled by service and method.
#[derive(Clone, Debug)]
pub struct GrpcServerMetricsFamily {
    started: Family<RpcLabels, Counter>,
    handling: Family<RpcLabels, Histogram>,
    handled: Family<CodeLabels, Counter>,
    msg_received: Family<RpcLabels, Counter>,
    msg_sent: Family<RpcLabels, Counter>,
}

/// The metrics for a single server-streaming method.
#[derive(Clone, Debug)]
pub(crate) struct StreamRpcMetrics {
    started: Counter,
    msg_received: Counter,
    msg_sent: Counter,
    handling: Histogram,
    handled: Family<CodeLabels, Counter>,
    labels: RpcLabels,
}

/// Observes a single response stream.
///
/// The stream is recorded as handled with `OK` if it is dropped before an
/// error is observed.
#[derive(Debug)]
pub(crate) struct ResponseObserver {
    msg_sent: Counter,
    handle: Option<Handle>,
}

#[derive(Debug)]
struct Handle {
    start: time::Instant,
    handling: Histogram,
    handled: Family<CodeLabels, Counter>,
    labels: RpcLabels,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RpcLabels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_type: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CodeLabels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_type: &'static str,
    grpc_code: &'static str,
}

// === impl GrpcServerMetricsFamily ===

impl GrpcServerMetricsFamily {
    pub fn register(reg: &mut Registry) -> Self {
        let started = Family::default();
        reg.register(
            "started",
            "Total number of RPCs started on the server",
            started.clone(),
        );

        let msg_received = Family::default();
        reg.register(
            "msg_received",
            "Total number of RPC stream messages received on the server",
            msg_received.clone(),
        );

        let msg_sent = Family::default();
        reg.register(
            "msg_sent",
            "Total number of gRPC stream messages sent by the server",
            msg_sent.clone(),
        );

        let handled = Family::default();
        reg.register(
            "handled",
            "Total number of RPCs completed on the server, regardless of success or failure",
            handled.clone(),
        );

        // Destination streams live as long as the proxy's interest in a
        // destination, which is frequently hours.
        let handling = Family::<RpcLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.1, 1.0, 60.0, 300.0, 3600.0, 86400.0])
        });
        reg.register_with_unit(
            "handling",
            "Histogram of the duration (seconds) of RPCs handled by the server",
            Unit::Seconds,
            handling.clone(),
        );

        Self {
            started,
            handling,
            handled,
            msg_received,
            msg_sent,
        }
    }

    pub(crate) fn server_stream_rpc(
        &self,
        grpc_service: &'static str,
        grpc_method: &'static str,
    ) -> StreamRpcMetrics {
        let labels = RpcLabels {
            grpc_service,
            grpc_method,
            grpc_type: "server_stream",
        };
        StreamRpcMetrics {
            started: self.started.get_or_create(&labels).clone(),
            msg_received: self.msg_received.get_or_create(&labels).clone(),
            msg_sent: self.msg_sent.get_or_create(&labels).clone(),
            handling: self.handling.get_or_create(&labels).clone(),
            handled: self.handled.clone(),
            labels,
        }
    }
}

// === impl StreamRpcMetrics ===

impl StreamRpcMetrics {
    pub(crate) fn start(&self) -> ResponseObserver {
        self.started.inc();
        // Server-streaming requests are a single message.
        self.msg_received.inc();

        // Ensure that OK is exported before any stream completes.
        let _ = self.handled.get_or_create(&self.labels.with_code(tonic::Code::Ok));

        ResponseObserver {
            msg_sent: self.msg_sent.clone(),
            handle: Some(Handle {
                start: time::Instant::now(),
                handling: self.handling.clone(),
                handled: self.handled.clone(),
                labels: self.labels.clone(),
            }),
        }
    }
}

// === impl ResponseObserver ===

impl ResponseObserver {
    pub(crate) fn msg_sent(&self) {
        self.msg_sent.inc();
    }

    pub(crate) fn end(mut self, code: tonic::Code) {
        if let Some(handle) = self.handle.take() {
            handle.end(code);
        }
    }
}

impl Drop for ResponseObserver {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.end(tonic::Code::Ok);
        }
    }
}

// === impl Handle ===

impl Handle {
    fn end(self, code: tonic::Code) {
        self.handling.observe(self.start.elapsed().as_secs_f64());
        self.handled
            .get_or_create(&self.labels.with_code(code))
            .inc();
    }
}

// === impl RpcLabels ===

impl RpcLabels {
    fn with_code(&self, code: tonic::Code) -> CodeLabels {
        CodeLabels {
            grpc_service: self.grpc_service,
            grpc_method: self.grpc_method,
            grpc_type: self.grpc_type,
            grpc_code: code_str(code),
        }
    }
}

fn code_str(code: tonic::Code) -> &'static str {
    use tonic::Code::*;
    match code {
        Ok => "OK",
        Cancelled => "CANCELLED",
        Unknown => "UNKNOWN",
        InvalidArgument => "INVALID_ARGUMENT",
        DeadlineExceeded => "DEADLINE_EXCEEDED",
        NotFound => "NOT_FOUND",
        AlreadyExists => "ALREADY_EXISTS",
        PermissionDenied => "PERMISSION_DENIED",
        ResourceExhausted => "RESOURCE_EXHAUSTED",
        FailedPrecondition => "FAILED_PRECONDITION",
        Aborted => "ABORTED",
        OutOfRange => "OUT_OF_RANGE",
        Unimplemented => "UNIMPLEMENTED",
        Internal => "INTERNAL",
        Unavailable => "UNAVAILABLE",
        DataLoss => "DATA_LOSS",
        Unauthenticated => "UNAUTHENTICATED",
    }
}
