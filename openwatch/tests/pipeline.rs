//! End-to-end behaviour of the pipeline against an in-memory backend: no
//! kernel, no privileges. The fake journal records every acquire/release so
//! that ordering can be asserted.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use openwatch::codec::Event;
use openwatch::consumer::ConsumerReport;
use openwatch::pipeline::{Pipeline, PipelineError, ProbeBackend};
use openwatch::probes::{AttachError, Attachment, Detach, ProbeAttacher, ProbePoint};
use openwatch::ringbuf::{CloseSignal, RawRecord, ReadError, RecordSource, close_channel};
use tokio::sync::mpsc;
use tokio::time::timeout;

type Journal = Arc<Mutex<Vec<&'static str>>>;

struct FakeLink {
    name: &'static str,
    journal: Journal,
}

impl Detach for FakeLink {
    fn detach(self: Box<Self>) -> anyhow::Result<()> {
        self.journal.lock().unwrap().push(self.name);
        Ok(())
    }
}

/// Records pushed through a channel; a pending read races the close signal.
struct ChannelSource {
    records: mpsc::UnboundedReceiver<io::Result<RawRecord>>,
    signal: CloseSignal,
    journal: Journal,
}

impl RecordSource for ChannelSource {
    async fn read(&mut self) -> Result<RawRecord, ReadError> {
        if self.signal.is_closed() {
            return Err(ReadError::Closed);
        }
        tokio::select! {
            biased;
            () = self.signal.closed() => Err(ReadError::Closed),
            record = self.records.recv() => match record {
                Some(Ok(raw)) => Ok(raw),
                Some(Err(e)) => Err(ReadError::Io(e)),
                // Producer gone: wait for the close like the real buffer does.
                None => {
                    self.signal.closed().await;
                    Err(ReadError::Closed)
                }
            },
        }
    }
}

impl Drop for ChannelSource {
    fn drop(&mut self) {
        self.journal.lock().unwrap().push("close reader");
    }
}

#[derive(Default, Clone, Copy)]
struct Failures {
    entry: bool,
    exit: bool,
    buffer: bool,
}

struct FakeBackend {
    journal: Journal,
    failures: Failures,
    records: Option<mpsc::UnboundedReceiver<io::Result<RawRecord>>>,
}

impl FakeBackend {
    fn new(
        journal: &Journal,
        failures: Failures,
    ) -> (Self, mpsc::UnboundedSender<io::Result<RawRecord>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Self {
            journal: journal.clone(),
            failures,
            records: Some(rx),
        };
        (backend, tx)
    }

    fn attach(&mut self, point: ProbePoint, fail: bool) -> Result<Attachment, AttachError> {
        let (attach, detach) = match point {
            ProbePoint::Entry => ("attach entry", "detach entry"),
            ProbePoint::Exit => ("attach exit", "detach exit"),
        };
        self.journal.lock().unwrap().push(attach);
        if fail {
            return Err(AttachError::AttachFailed {
                point,
                target: "do_sys_openat2".to_string(),
                error: "Operation not permitted".to_string(),
            });
        }
        Ok(Attachment::new(
            point,
            "do_sys_openat2",
            FakeLink {
                name: detach,
                journal: self.journal.clone(),
            },
        ))
    }
}

impl ProbeAttacher for FakeBackend {
    fn target(&self) -> &str {
        "do_sys_openat2"
    }

    fn attach_entry(&mut self) -> Result<Attachment, AttachError> {
        self.attach(ProbePoint::Entry, self.failures.entry)
    }

    fn attach_exit(&mut self) -> Result<Attachment, AttachError> {
        self.attach(ProbePoint::Exit, self.failures.exit)
    }
}

impl ProbeBackend for FakeBackend {
    type Source = ChannelSource;

    fn open_buffer(&mut self, signal: CloseSignal) -> anyhow::Result<ChannelSource> {
        self.journal.lock().unwrap().push("open reader");
        if self.failures.buffer {
            anyhow::bail!("EVENTS map missing");
        }
        let records = self
            .records
            .take()
            .ok_or_else(|| anyhow::anyhow!("reader already opened"))?;
        Ok(ChannelSource {
            records,
            signal,
            journal: self.journal.clone(),
        })
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.journal.lock().unwrap().push("unload programs");
    }
}

fn hosts_record(ret: i64) -> io::Result<RawRecord> {
    let mut name = b"/etc/hosts\0".to_vec();
    name.extend_from_slice(b"leftover bytes from a previous path");
    Ok(Event::new(42, ret, &name).encode().to_vec())
}

fn journal(journal: &Journal) -> Vec<&'static str> {
    journal.lock().unwrap().clone()
}

#[tokio::test]
async fn test_two_events_then_close() {
    let log = Journal::default();
    let (backend, tx) = FakeBackend::new(&log, Failures::default());
    let (closer, signal) = close_channel();

    tx.send(hosts_record(0)).unwrap();
    tx.send(hosts_record(-2)).unwrap();

    let pipeline = Pipeline::new(backend, signal);
    let task = async move {
        let mut events: Vec<Event> = Vec::new();
        let report = pipeline.run(&mut events).await;
        (report, events)
    };
    let closer_task = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.close();
    };

    let ((report, events), ()) = timeout(Duration::from_secs(5), async {
        tokio::join!(task, closer_task)
    })
    .await
    .expect("pipeline did not stop after close");

    let report = report.unwrap();
    assert_eq!(report.events, 2);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].file_name_lossy(), "/etc/hosts");
    assert_eq!(events[0].pid(), 42);
    assert_eq!(events[0].ret(), 0);
    assert_eq!(events[1].file_name_lossy(), "/etc/hosts");
    assert_eq!(events[1].ret(), -2);

    assert_eq!(
        journal(&log),
        vec![
            "attach entry",
            "attach exit",
            "open reader",
            "close reader",
            "detach exit",
            "detach entry",
            "unload programs",
        ]
    );
}

#[tokio::test]
async fn test_close_with_no_records() {
    let log = Journal::default();
    let (backend, _tx) = FakeBackend::new(&log, Failures::default());
    let (closer, signal) = close_channel();
    closer.close();

    let mut events: Vec<Event> = Vec::new();
    let report = timeout(
        Duration::from_secs(5),
        Pipeline::new(backend, signal).run(&mut events),
    )
    .await
    .expect("pipeline did not stop")
    .unwrap();

    assert_eq!(report, ConsumerReport::default());
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_close_while_read_is_pending() {
    let log = Journal::default();
    let (backend, _tx) = FakeBackend::new(&log, Failures::default());
    let (closer, signal) = close_channel();

    let closer_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.close();
    });

    let mut events: Vec<Event> = Vec::new();
    let result = timeout(
        Duration::from_secs(5),
        Pipeline::new(backend, signal).run(&mut events),
    )
    .await
    .expect("pending read was not woken by close");

    closer_task.await.unwrap();
    assert!(result.is_ok());
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_transient_read_error_then_valid_record() {
    let log = Journal::default();
    let (backend, tx) = FakeBackend::new(&log, Failures::default());
    let (closer, signal) = close_channel();

    tx.send(Err(io::Error::other("EINTR"))).unwrap();
    tx.send(Ok(vec![0u8; 12])).unwrap();
    tx.send(hosts_record(3)).unwrap();
    drop(tx);

    let run = async {
        let mut events: Vec<Event> = Vec::new();
        let report = Pipeline::new(backend, signal).run(&mut events).await;
        (report, events)
    };
    let stop = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.close();
    };
    let ((report, events), ()) = timeout(Duration::from_secs(5), async { tokio::join!(run, stop) })
        .await
        .expect("pipeline did not stop");

    let report = report.unwrap();
    assert_eq!(report.read_errors, 1);
    assert_eq!(report.decode_errors, 1);
    assert_eq!(report.events, 1);
    assert_eq!(events[0].ret(), 3);
}

#[tokio::test]
async fn test_entry_attach_failure_skips_exit_and_buffer() {
    let log = Journal::default();
    let failures = Failures {
        entry: true,
        ..Failures::default()
    };
    let (backend, _tx) = FakeBackend::new(&log, failures);
    let (_closer, signal) = close_channel();

    let mut events: Vec<Event> = Vec::new();
    let err = Pipeline::new(backend, signal)
        .run(&mut events)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::AttachEntry(_)));
    assert_eq!(journal(&log), vec!["attach entry", "unload programs"]);
}

#[tokio::test]
async fn test_exit_attach_failure_releases_entry() {
    let log = Journal::default();
    let failures = Failures {
        exit: true,
        ..Failures::default()
    };
    let (backend, _tx) = FakeBackend::new(&log, failures);
    let (_closer, signal) = close_channel();

    let mut events: Vec<Event> = Vec::new();
    let err = Pipeline::new(backend, signal)
        .run(&mut events)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::AttachExit(_)));
    assert!(err.to_string().contains("exit probe"));
    assert_eq!(
        journal(&log),
        vec![
            "attach entry",
            "attach exit",
            "detach entry",
            "unload programs"
        ]
    );
}

#[tokio::test]
async fn test_buffer_open_failure_releases_both_attachments() {
    let log = Journal::default();
    let failures = Failures {
        buffer: true,
        ..Failures::default()
    };
    let (backend, _tx) = FakeBackend::new(&log, failures);
    let (_closer, signal) = close_channel();

    let mut events: Vec<Event> = Vec::new();
    let err = Pipeline::new(backend, signal)
        .run(&mut events)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::OpenBuffer(_)));
    assert!(err.to_string().contains("EVENTS map missing"));
    assert_eq!(
        journal(&log),
        vec![
            "attach entry",
            "attach exit",
            "open reader",
            "detach exit",
            "detach entry",
            "unload programs",
        ]
    );
}
