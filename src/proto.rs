//! Wire messages and gRPC clients generated from `proto/runtime.proto`.

tonic::include_proto!("eventfold.runtime");

/// Convert to the protobuf `Duration`, saturating at its maximum.
pub(crate) fn duration(value: std::time::Duration) -> prost_types::Duration {
    prost_types::Duration::try_from(value).unwrap_or(prost_types::Duration {
        seconds: i64::MAX,
        nanos: 999_999_999,
    })
}
