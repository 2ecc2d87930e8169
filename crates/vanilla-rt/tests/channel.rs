// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels and events carried across tasks.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use vanilla_rt::{Error, Hub};

#[derive(Debug, thiserror::Error)]
#[error("parse failed at byte {offset}")]
struct ParseError {
    offset: usize,
}

#[test]
fn worker_forwards_its_failure_intact() {
    common::init_tracing();
    let hub = Hub::new().unwrap();
    let results = hub.channel::<u32>();

    let tx = results.clone();
    hub.spawn(async move {
        tx.send(1)?;
        tx.throw(ParseError { offset: 17 })?;
        tx.send(2)
    })
    .unwrap();

    let out = hub
        .block_on(async move {
            let first = results.recv().await?;
            let err = results.recv().await.unwrap_err();
            let second = results.recv().await?;
            let offset = err.downcast_ref::<ParseError>().map(|e| e.offset);
            Ok::<_, Error>((first, offset, second, err.to_string()))
        })
        .unwrap()
        .unwrap();
    assert_eq!(out.0, 1);
    assert_eq!(out.1, Some(17));
    assert_eq!(out.2, 2);
    assert!(out.3.starts_with("parse failed at byte 17 (thrown at "));
}

#[test]
fn pipeline_runs_once_per_send_on_both_paths() {
    common::init_tracing();
    let hub = Hub::new().unwrap();
    let ch = hub.channel::<u32>();
    let calls = Rc::new(RefCell::new(Vec::new()));
    let c = calls.clone();
    ch.pipe(move |v| {
        c.borrow_mut().push(v);
        if v == 0 {
            Err(Error::Filter)
        } else {
            Ok(v + 100)
        }
    });

    // Buffered path.
    ch.send(1).unwrap();
    ch.send(0).unwrap();

    // Handoff path: the receiver parks before these are sent.
    let (tx, h) = (ch.clone(), hub.clone());
    hub.spawn(async move {
        h.sleep(Duration::from_millis(1)).await?;
        tx.send(0)?;
        tx.send(2)
    })
    .unwrap();

    let rx = ch.clone();
    let out = hub
        .block_on(async move {
            let a = rx.recv().await?;
            let b = rx.recv().await?;
            Ok::<_, Error>(vec![a, b])
        })
        .unwrap()
        .unwrap();
    assert_eq!(out, vec![101, 102]);
    assert_eq!(*calls.borrow(), vec![1, 0, 0, 2]);
    assert!(ch.is_empty());
}

#[test]
fn bounded_receive_retries_until_data() {
    common::init_tracing();
    let hub = Hub::new().unwrap();
    let ch = hub.channel::<&'static str>();

    let tx = ch.clone();
    hub.spawn_later(Duration::from_millis(50), async move { tx.send("late") })
        .unwrap();

    let out = hub
        .block_on(async move {
            let mut timeouts = 0;
            loop {
                match ch.recv_timeout(Duration::from_millis(20)).await {
                    Ok(v) => return Ok((timeouts, v)),
                    Err(e) if e.is_timeout() => timeouts += 1,
                    Err(e) => return Err(e),
                }
            }
        })
        .unwrap()
        .unwrap();
    assert_eq!(out, (2, "late"));
}

#[test]
fn event_gates_workers() {
    common::init_tracing();
    let hub = Hub::new().unwrap();
    let go = hub.event(false);
    let done = hub.channel::<u32>();

    for id in 0..3 {
        let (go, done) = (go.clone(), done.clone());
        hub.spawn(async move {
            go.wait().await?;
            done.send(id)
        })
        .unwrap();
    }

    let (g, h) = (go.clone(), hub.clone());
    hub.spawn(async move {
        h.sleep(Duration::from_millis(2)).await?;
        g.set();
        Ok::<_, Error>(())
    })
    .unwrap();

    let out = hub
        .block_on(async move {
            let mut seen = Vec::new();
            for _ in 0..3 {
                seen.push(done.recv().await?);
            }
            Ok::<_, Error>(seen)
        })
        .unwrap()
        .unwrap();
    assert_eq!(out, vec![0, 1, 2]);
    assert!(go.is_set());
}
