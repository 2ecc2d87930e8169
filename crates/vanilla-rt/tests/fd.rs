// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Descriptor tests over real non-blocking pipes.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use vanilla_rt::{Error, Hub, HubConfig};

#[test]
fn bytes_reassemble_across_separate_writes() {
    common::init_tracing();
    let hub = Hub::new().unwrap();
    let (writer, reader) = hub.pipe().unwrap();

    let h = hub.clone();
    let w = writer.clone();
    hub.spawn(async move {
        w.send(b"12").await?;
        h.sleep(Duration::from_millis(2)).await?;
        w.send(b"3").await
    })
    .unwrap();

    let out = hub
        .block_on(async move {
            let head = reader.recv_bytes(2).await?;
            let tail = reader.recv_bytes(1).await?;
            reader.close();
            writer.close();
            Ok::<_, Error>((head, tail))
        })
        .unwrap()
        .unwrap();
    assert_eq!(out, (b"12".to_vec(), b"3".to_vec()));
}

#[test]
fn partition_splits_lines() {
    common::init_tracing();
    let hub = Hub::new().unwrap();
    let (writer, reader) = hub.pipe().unwrap();

    let w = writer.clone();
    hub.spawn(async move { w.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody").await })
        .unwrap();

    let out = hub
        .block_on(async move {
            let mut lines = Vec::new();
            loop {
                let line = reader.recv_partition(b"\r\n").await?;
                if line.is_empty() {
                    break;
                }
                lines.push(String::from_utf8(line).unwrap());
            }
            let body = reader.recv_bytes(4).await?;
            reader.close();
            writer.close();
            Ok::<_, Error>((lines, body))
        })
        .unwrap()
        .unwrap();
    assert_eq!(out.0, vec!["GET / HTTP/1.1", "Host: x"]);
    assert_eq!(out.1, b"body".to_vec());
}

#[test]
fn large_write_survives_a_full_pipe() {
    common::init_tracing();
    let hub = Hub::new().unwrap();
    let (writer, reader) = hub.pipe().unwrap();
    let payload: Vec<u8> = (0..1 << 20).map(|i| (i % 251) as u8).collect();

    let data = payload.clone();
    hub.spawn(async move {
        writer.send(&data).await?;
        writer.close();
        Ok::<_, Error>(())
    })
    .unwrap();

    let got = hub
        .block_on(async move {
            let mut got = Vec::new();
            loop {
                match reader.recv_chunk().await {
                    Ok(chunk) => got.extend_from_slice(&chunk),
                    Err(e) if e.is_closed() => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(got)
        })
        .unwrap()
        .unwrap();
    assert_eq!(got.len(), payload.len());
    assert!(got == payload);
}

#[test]
fn peer_close_ends_stream_with_stop_then_closed() {
    common::init_tracing();
    let hub = Hub::new().unwrap();
    let (writer, reader) = hub.pipe().unwrap();

    let r = reader.clone();
    let out = hub
        .block_on(async move {
            writer.send(b"last").await?;
            writer.close();
            let data = r.recv_bytes(4).await?;
            let end = r.recv_chunk().await.unwrap_err();
            let after = r.recv_chunk().await.unwrap_err();
            Ok::<_, Error>((data, end.is_stop(), matches!(after, Error::Closed)))
        })
        .unwrap()
        .unwrap();
    assert_eq!(out, (b"last".to_vec(), true, true));
    assert!(reader.is_closed());
}

#[test]
fn send_to_closed_reader_fails_closed() {
    common::init_tracing();
    let hub = Hub::new().unwrap();
    let (writer, reader) = hub.pipe().unwrap();
    let err = hub
        .block_on(async move {
            reader.close();
            writer.send(b"x").await
        })
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Closed));
}

#[test]
fn read_chunk_is_configurable() {
    common::init_tracing();
    let config = HubConfig {
        read_chunk: 2,
        ..HubConfig::default()
    };
    let hub = Hub::with_config(config).unwrap();
    let (writer, reader) = hub.pipe().unwrap();

    let out = hub
        .block_on(async move {
            writer.send(b"abcde").await?;
            let first = reader.recv_chunk().await?;
            let second = reader.recv_chunk().await?;
            reader.close();
            writer.close();
            Ok::<_, Error>((first, second))
        })
        .unwrap()
        .unwrap();
    assert_eq!(out, (b"ab".to_vec(), b"cd".to_vec()));
}

#[test]
fn stop_releases_blocked_readers() {
    common::init_tracing();
    let hub = Hub::new().unwrap();
    let (writer, reader) = hub.pipe().unwrap();
    let outcome = Rc::new(RefCell::new(None));

    let (r, o) = (reader.clone(), outcome.clone());
    hub.spawn(async move {
        *o.borrow_mut() = Some(r.recv_bytes(16).await);
    })
    .unwrap();

    let stopped = Rc::new(RefCell::new(None));
    let (h, s) = (hub.clone(), stopped.clone());
    hub.spawn(async move {
        *s.borrow_mut() = Some(h.stop().await);
    })
    .unwrap();

    hub.run().unwrap();

    assert!(hub.is_stopped());
    assert!(matches!(*stopped.borrow(), Some(Ok(()))));
    match &*outcome.borrow() {
        Some(Err(e)) => assert!(e.is_stop()),
        other => panic!("reader should see Stop, got {other:?}"),
    }
    assert!(reader.is_closed());
    assert!(writer.is_closed());
}
