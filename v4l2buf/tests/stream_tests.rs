// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! Stream-on / stream-off policy tests.

mod common;

use common::{SimulatedDriver, open_capture};
use v4l2buf::{
    BufferMetadata, BufferPool, BufferRing, BufferState, BufferType, Error, ExposureKind,
    StreamController, StreamState,
};

const CAPTURE: BufferType = BufferType::VideoCapture;

fn mapped_ring(device: &v4l2buf::DeviceHandle, count: u32) -> BufferRing {
    BufferRing::new(BufferPool::new(device, CAPTURE, count, ExposureKind::Mapped).unwrap())
}

fn queue_all(ring: &mut BufferRing) {
    for index in 0..ring.len() {
        ring.queue(index, &BufferMetadata::empty(index)).unwrap();
    }
}

#[test]
fn partial_pool_does_not_start() {
    let driver = SimulatedDriver::capture();
    let device = open_capture(&driver);
    let mut ring = mapped_ring(&device, 4);
    ring.queue(0, &BufferMetadata::empty(0)).unwrap();
    ring.queue(1, &BufferMetadata::empty(1)).unwrap();

    let mut stream = StreamController::new(&device, CAPTURE);
    let err = stream.start(&ring).unwrap_err();

    assert!(matches!(err, Error::StreamStartFailed { source: None, .. }));
    assert_eq!(stream.state(), StreamState::Stopped);
    assert_eq!(driver.state().queue(CAPTURE).stream_on_calls, 0);
}

#[test]
fn full_pool_starts() {
    let driver = SimulatedDriver::capture();
    let device = open_capture(&driver);
    let mut ring = mapped_ring(&device, 4);
    queue_all(&mut ring);

    let mut stream = StreamController::new(&device, CAPTURE);
    stream.start(&ring).unwrap();

    assert_eq!(stream.state(), StreamState::Running);
    assert!(driver.state().queue(CAPTURE).streaming);

    // Starting twice is a usage error.
    assert!(matches!(stream.start(&ring), Err(Error::InvalidState { .. })));
    assert_eq!(driver.state().queue(CAPTURE).stream_on_calls, 1);
}

#[test]
fn driver_refusal_leaves_the_stream_stopped() {
    let driver = SimulatedDriver::capture();
    let device = open_capture(&driver);
    let mut ring = mapped_ring(&device, 2);
    queue_all(&mut ring);
    driver.state().fail_stream_on = true;

    let mut stream = StreamController::new(&device, CAPTURE);
    let err = stream.start(&ring).unwrap_err();

    assert!(matches!(
        err,
        Error::StreamStartFailed {
            source: Some(_),
            ..
        }
    ));
    assert_eq!(stream.state(), StreamState::Stopped);
}

#[test]
fn stop_returns_queued_buffers_as_free() {
    let driver = SimulatedDriver::capture();
    let device = open_capture(&driver);
    let mut ring = mapped_ring(&device, 4);
    queue_all(&mut ring);
    let mut stream = StreamController::new(&device, CAPTURE);
    stream.start(&ring).unwrap();

    let dequeued = ring.dequeue().unwrap();
    stream.stop(&mut ring).unwrap();

    assert_eq!(stream.state(), StreamState::Stopped);
    assert_eq!(ring.queued(), 0);
    assert_eq!(ring.count_in(BufferState::Free), 3);
    assert_eq!(ring.state(dequeued.index), Some(BufferState::DequeuedByApp));
    assert!(driver.state().queue(CAPTURE).queued.is_empty());

    // The ring can be restarted from scratch.
    queue_all(&mut ring);
    stream.start(&ring).unwrap();
    assert_eq!(stream.state(), StreamState::Running);
}

#[test]
fn stop_when_stopped_is_harmless() {
    let driver = SimulatedDriver::capture();
    let device = open_capture(&driver);
    let mut ring = mapped_ring(&device, 2);
    let mut stream = StreamController::new(&device, CAPTURE);

    stream.stop(&mut ring).unwrap();
    stream.stop(&mut ring).unwrap();

    assert_eq!(stream.state(), StreamState::Stopped);
    assert_eq!(driver.state().queue(CAPTURE).stream_off_calls, 0);
}

#[test]
fn stop_with_buffers_queued_before_start_resets_them() {
    let driver = SimulatedDriver::capture();
    let device = open_capture(&driver);
    let mut ring = mapped_ring(&device, 2);
    ring.queue(0, &BufferMetadata::empty(0)).unwrap();
    let mut stream = StreamController::new(&device, CAPTURE);

    stream.stop(&mut ring).unwrap();

    assert_eq!(ring.state(0), Some(BufferState::Free));
    ring.release().unwrap();
}

#[test]
fn stop_failure_leaves_states_untouched() {
    let driver = SimulatedDriver::capture();
    let device = open_capture(&driver);
    let mut ring = mapped_ring(&device, 2);
    queue_all(&mut ring);
    let mut stream = StreamController::new(&device, CAPTURE);
    stream.start(&ring).unwrap();
    driver.state().fail_stream_off = true;

    let err = stream.stop(&mut ring).unwrap_err();

    assert!(matches!(err, Error::StreamStopFailed { .. }));
    assert_eq!(stream.state(), StreamState::Running);
    assert_eq!(ring.queued(), 2);

    driver.state().fail_stream_off = false;
    stream.stop(&mut ring).unwrap();
}

#[test]
fn ring_of_another_queue_is_refused() {
    let driver = SimulatedDriver::capture();
    let device = open_capture(&driver);
    let mut ring = mapped_ring(&device, 2);
    queue_all(&mut ring);

    let mut stream = StreamController::new(&device, BufferType::VideoCaptureMplane);

    assert!(matches!(stream.start(&ring), Err(Error::InvalidState { .. })));
    assert!(matches!(
        stream.stop(&mut ring),
        Err(Error::InvalidState { .. })
    ));
}

#[test]
fn dropping_a_running_stream_stops_it() {
    let driver = SimulatedDriver::capture();
    let device = open_capture(&driver);
    let mut ring = mapped_ring(&device, 2);
    queue_all(&mut ring);
    let mut stream = StreamController::new(&device, CAPTURE);
    stream.start(&ring).unwrap();

    drop(stream);

    assert!(!driver.state().queue(CAPTURE).streaming);
    assert_eq!(driver.state().queue(CAPTURE).stream_off_calls, 1);
}
