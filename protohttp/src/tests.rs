use super::*;
use proptest::prelude::*;
use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

/// An arbitrary byte payload.
#[derive(Clone, PartialEq, Message)]
struct Blob {
    #[prost(bytes = "vec", tag = "1")]
    data: Vec<u8>,
}

/// Yields a single chunk and then never completes.
struct Stalled(Option<Bytes>);

impl http_body::Body for Stalled {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Bytes>, Infallible>>> {
        match self.0.take() {
            Some(chunk) => Poll::Ready(Some(Ok(http_body::Frame::data(chunk)))),
            None => Poll::Pending,
        }
    }
}

fn api_error(msg: &str) -> ApiError {
    ApiError {
        error: msg.to_string(),
    }
}

#[test]
fn frames_are_length_prefixed() {
    let msg = api_error("boom");
    let frame = encode_frame(&msg).unwrap();

    let len = msg.encoded_len();
    assert_eq!(frame.len(), 4 + len);
    assert_eq!(&frame[..4], &(len as u32).to_le_bytes());

    let mut buf = frame.clone();
    let decoded: ApiError = decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap();
    assert_eq!(decoded, msg);
    assert!(buf.is_empty());
}

#[test]
fn decode_leaves_trailing_frames() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&encode_frame(&api_error("a")).unwrap());
    buf.extend_from_slice(&encode_frame(&api_error("b")).unwrap());
    let mut buf = buf.freeze();

    let a: ApiError = decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap();
    let b: ApiError = decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap();
    assert_eq!(a.error, "a");
    assert_eq!(b.error, "b");
}

#[test]
fn truncated_frames_fail() {
    let frame = encode_frame(&api_error("truncated")).unwrap();

    let mut prefix = frame.slice(..3);
    assert!(matches!(
        decode_frame::<ApiError, _>(&mut prefix, DEFAULT_MAX_FRAME_LEN),
        Err(Error::Framing(FrameError::Truncated {
            expected: 4,
            available: 3
        }))
    ));

    let mut payload = frame.slice(..frame.len() - 1);
    assert!(matches!(
        decode_frame::<ApiError, _>(&mut payload, DEFAULT_MAX_FRAME_LEN),
        Err(Error::Framing(FrameError::Truncated { .. }))
    ));
}

#[test]
fn oversized_frames_fail_before_reading() {
    let mut buf = Bytes::from_static(&[0xff, 0xff, 0xff, 0x7f]);
    assert!(matches!(
        decode_frame::<ApiError, _>(&mut buf, DEFAULT_MAX_FRAME_LEN),
        Err(Error::Framing(FrameError::TooLarge { .. }))
    ));
}

#[test]
fn invalid_payloads_fail_to_decode() {
    // A length-delimited field whose length runs past the payload.
    let mut buf = Bytes::from_static(&[2, 0, 0, 0, 0x0a, 0x05]);
    assert!(matches!(
        decode_frame::<ApiError, _>(&mut buf, DEFAULT_MAX_FRAME_LEN),
        Err(Error::Decode(_))
    ));
}

#[tokio::test]
async fn reads_frames_from_io() {
    let frame = encode_frame(&api_error("io")).unwrap();
    let mut io = tokio_test::io::Builder::new()
        .read(&frame[..2])
        .read(&frame[2..])
        .build();
    let msg: ApiError = read_frame(&mut io, DEFAULT_MAX_FRAME_LEN).await.unwrap();
    assert_eq!(msg.error, "io");
}

#[tokio::test]
async fn reading_truncated_io_fails() {
    let frame = encode_frame(&api_error("io")).unwrap();
    let mut io = tokio_test::io::Builder::new()
        .read(&frame[..frame.len() - 1])
        .build();
    let res = read_frame::<ApiError, _>(&mut io, DEFAULT_MAX_FRAME_LEN).await;
    assert!(matches!(
        res,
        Err(Error::Framing(FrameError::Truncated { .. }))
    ));
}

#[tokio::test]
async fn writes_frames_to_io() {
    let msg = api_error("out");
    let frame = encode_frame(&msg).unwrap();
    let mut io = tokio_test::io::Builder::new().write(&frame).build();
    write_frame(&mut io, &msg).await.unwrap();
}

#[tokio::test]
async fn ok_responses_carry_messages() {
    let rsp = ok_response(&api_error("fine")).unwrap();
    assert_eq!(rsp.status(), http::StatusCode::OK);
    assert!(!rsp.headers().contains_key(ERROR_HEADER));

    let msg: ApiError = read_response(rsp, DEFAULT_MAX_FRAME_LEN).await.unwrap();
    assert_eq!(msg.error, "fine");
}

#[tokio::test]
async fn error_responses_are_api_errors() {
    let rsp = error_response(http::StatusCode::NOT_FOUND, "no such service").unwrap();
    assert_eq!(rsp.status(), http::StatusCode::NOT_FOUND);
    assert_eq!(rsp.headers()[ERROR_HEADER], "Not Found");

    match read_response::<ApiError, _>(rsp, DEFAULT_MAX_FRAME_LEN).await {
        Err(Error::Api(error)) => assert_eq!(error, "no such service"),
        res => panic!("unexpected result: {res:?}"),
    }
}

#[tokio::test]
async fn error_header_wins_over_ok_status() {
    let mut rsp = error_response(http::StatusCode::INTERNAL_SERVER_ERROR, "oops").unwrap();
    *rsp.status_mut() = http::StatusCode::OK;
    assert!(matches!(
        read_response::<ApiError, _>(rsp, DEFAULT_MAX_FRAME_LEN).await,
        Err(Error::Api(_))
    ));
}

#[tokio::test]
async fn unexpected_statuses_are_transport_errors() {
    let mut rsp = http::Response::new(Full::new(Bytes::from_static(b"<html>bad gateway</html>")));
    *rsp.status_mut() = http::StatusCode::BAD_GATEWAY;
    assert!(matches!(
        read_response::<ApiError, _>(rsp, DEFAULT_MAX_FRAME_LEN).await,
        Err(Error::Status(http::StatusCode::BAD_GATEWAY))
    ));
}

#[tokio::test]
async fn oversized_responses_fail_before_buffering() {
    let prefix = Bytes::copy_from_slice(&(1u32 << 30).to_le_bytes());
    let rsp = http::Response::new(Stalled(Some(prefix)));
    let res = tokio::time::timeout(
        Duration::from_secs(10),
        read_response::<ApiError, _>(rsp, 1024),
    )
    .await
    .expect("the length prefix must be rejected without reading the payload");
    assert!(matches!(
        res,
        Err(Error::Framing(FrameError::TooLarge {
            len: 1_073_741_824,
            max: 1024,
        }))
    ));
}

#[tokio::test]
async fn truncated_responses_fail() {
    let frame = encode_frame(&api_error("cut short")).unwrap();
    let rsp = http::Response::new(Full::new(frame.slice(..frame.len() - 2)));
    assert!(matches!(
        read_response::<ApiError, _>(rsp, DEFAULT_MAX_FRAME_LEN).await,
        Err(Error::Framing(FrameError::Truncated { .. }))
    ));
}

proptest! {
    #[test]
    fn api_errors_round_trip(error in ".*") {
        let msg = ApiError { error };
        let mut frame = encode_frame(&msg).unwrap();
        let decoded: ApiError = decode_frame(&mut frame, DEFAULT_MAX_FRAME_LEN).unwrap();
        prop_assert_eq!(decoded, msg);
        prop_assert!(frame.is_empty());
    }

    #[test]
    fn payloads_round_trip(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let msg = Blob { data };
        let mut frame = encode_frame(&msg).unwrap();
        let decoded: Blob = decode_frame(&mut frame, DEFAULT_MAX_FRAME_LEN).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_payloads_never_decode(
        data in proptest::collection::vec(any::<u8>(), 0..1024),
        cut in any::<prop::sample::Index>(),
    ) {
        let frame = encode_frame(&Blob { data }).unwrap();
        let mut truncated = frame.slice(..cut.index(frame.len()));
        let res = decode_frame::<Blob, _>(&mut truncated, DEFAULT_MAX_FRAME_LEN);
        prop_assert!(
            matches!(res, Err(Error::Framing(FrameError::Truncated { .. }))),
            "unexpected result: {:?}",
            res
        );
    }
}
